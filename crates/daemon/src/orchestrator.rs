//! Relay server orchestrator for wiring together all components.
//!
//! This module provides the `RelayServer` that owns the session registry,
//! accepts websocket connections, and runs one relay handler per connection.
//! A single cancellation token is shared by the accept loop, the handlers and
//! the session reaper, so stopping the server winds all of them down.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::network::{accept_connection, WebSocketOptions};
use crate::relay::{RelayHandler, RelayOptions, RelayOutcome};
use crate::session::{ConnectionId, PtySpawner, SessionFactory, SessionRegistry};

/// How long `stop` waits for connections to wind down before killing sessions.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Pause after a failed accept, so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Initial state, not started.
    Stopped,
    /// Binding the listener and starting background tasks.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the server.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Server state changed.
    StateChanged(ServerState),
    /// A client completed the websocket handshake.
    ClientConnected {
        connection_id: ConnectionId,
        peer: SocketAddr,
    },
    /// A client connection ended.
    ClientDisconnected {
        connection_id: ConnectionId,
        outcome: RelayOutcome,
    },
    /// Error occurred.
    Error { message: String },
}

/// Everything a connection task needs, cloned once per accept.
struct ConnectionContext<F: SessionFactory> {
    registry: Arc<SessionRegistry<F>>,
    ws_options: WebSocketOptions,
    relay_options: RelayOptions,
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<ServerEvent>,
    active: Arc<AtomicUsize>,
}

impl<F: SessionFactory> Clone for ConnectionContext<F> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            ws_options: self.ws_options,
            relay_options: self.relay_options,
            shutdown_token: self.shutdown_token.clone(),
            event_tx: self.event_tx.clone(),
            active: Arc::clone(&self.active),
        }
    }
}

/// Websocket relay server.
pub struct RelayServer<F: SessionFactory = PtySpawner> {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<ServerState>>,
    /// Sessions, one per connection.
    registry: Arc<SessionRegistry<F>>,
    /// Token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Accept loop and connection tasks.
    tracker: TaskTracker,
    /// Periodic session reaper.
    cleanup_task: Option<JoinHandle<()>>,
    /// Address the listener is bound to, once started.
    local_addr: Option<SocketAddr>,
    /// Number of connections currently being served.
    active: Arc<AtomicUsize>,
    /// Event broadcaster.
    event_tx: broadcast::Sender<ServerEvent>,
}

impl RelayServer<PtySpawner> {
    /// Creates a server that spawns the configured shell for each client.
    pub fn new(config: Config) -> Result<Self> {
        let factory = PtySpawner::from_config(&config.session);
        Self::with_factory(config, factory)
    }
}

impl<F: SessionFactory> RelayServer<F> {
    /// Creates a server with a custom session factory.
    pub fn with_factory(config: Config, factory: F) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let registry = Arc::new(SessionRegistry::new(factory, config.session.max_sessions));
        let (event_tx, _) = broadcast::channel(256);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(ServerState::Stopped)),
            registry,
            shutdown_token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            cleanup_task: None,
            local_addr: None,
            active: Arc::new(AtomicUsize::new(0)),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// Returns a receiver for server events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.event_tx.subscribe()
    }

    /// Binds the listener and starts accepting connections.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// the configured port is 0.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        {
            let mut state = self.state.write().await;
            if *state != ServerState::Stopped {
                anyhow::bail!("Server is already running");
            }
            *state = ServerState::Starting;
        }
        self.emit_event(ServerEvent::StateChanged(ServerState::Starting));

        let bound = self.bind().await;
        let listener = match bound {
            Ok(listener) => listener,
            Err(e) => {
                *self.state.write().await = ServerState::Stopped;
                self.emit_event(ServerEvent::StateChanged(ServerState::Stopped));
                return Err(e);
            }
        };
        let local_addr = listener
            .local_addr()
            .context("Failed to read listener address")?;
        self.local_addr = Some(local_addr);

        self.cleanup_task = Some(self.registry.start_cleanup_task(
            self.config.session.cleanup_interval(),
            self.config.session.idle_timeout(),
            self.shutdown_token.clone(),
        ));
        debug!("Started session cleanup task");

        let context = ConnectionContext {
            registry: Arc::clone(&self.registry),
            ws_options: WebSocketOptions::from_config(&self.config.server),
            relay_options: RelayOptions::from_config(&self.config.session),
            shutdown_token: self.shutdown_token.clone(),
            event_tx: self.event_tx.clone(),
            active: Arc::clone(&self.active),
        };
        self.tracker
            .spawn(Self::accept_loop(listener, context, self.tracker.clone()));

        *self.state.write().await = ServerState::Running;
        self.emit_event(ServerEvent::StateChanged(ServerState::Running));

        info!(
            addr = %local_addr,
            shell = %self.config.session.default_shell,
            max_sessions = self.registry.capacity(),
            "Relay server listening"
        );
        Ok(local_addr)
    }

    async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.server.socket_addr()?;
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))
    }

    /// Accepts connections until shutdown.
    async fn accept_loop(
        listener: TcpListener,
        context: ConnectionContext<F>,
        tracker: TaskTracker,
    ) {
        loop {
            tokio::select! {
                _ = context.shutdown_token.cancelled() => {
                    debug!("Accept loop shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let connection_id = Uuid::new_v4().to_string();
                        debug!(connection_id = %connection_id, peer = %peer, "Accepted TCP connection");
                        tracker.spawn(Self::serve_connection(stream, peer, connection_id, context.clone()));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        let _ = context.event_tx.send(ServerEvent::Error {
                            message: format!("accept failed: {}", e),
                        });
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
    }

    /// Runs the handshake and the relay for one client.
    async fn serve_connection(
        stream: TcpStream,
        peer: SocketAddr,
        connection_id: ConnectionId,
        context: ConnectionContext<F>,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(connection_id = %connection_id, error = %e, "Failed to set TCP_NODELAY");
        }

        let handshake = tokio::select! {
            _ = context.shutdown_token.cancelled() => return,
            result = accept_connection(stream, connection_id.clone(), context.ws_options) => result,
        };
        let endpoint = match handshake {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(connection_id = %connection_id, peer = %peer, error = %e, "Websocket handshake failed");
                return;
            }
        };

        context.active.fetch_add(1, Ordering::SeqCst);
        info!(connection_id = %connection_id, peer = %peer, "Client connected");
        let _ = context.event_tx.send(ServerEvent::ClientConnected {
            connection_id: connection_id.clone(),
            peer,
        });

        let mut handler = RelayHandler::new(
            connection_id.clone(),
            context.registry,
            context.relay_options,
            context.shutdown_token,
        );
        let outcome = handler.run(endpoint).await;

        context.active.fetch_sub(1, Ordering::SeqCst);
        let _ = context.event_tx.send(ServerEvent::ClientDisconnected {
            connection_id,
            outcome,
        });
    }

    /// Stops the server gracefully.
    ///
    /// Stops accepting, lets every handler close its session, then terminates
    /// anything still left in the registry.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == ServerState::Stopped {
                return Ok(());
            }
            if *state == ServerState::ShuttingDown {
                anyhow::bail!("Server is already shutting down");
            }
            *state = ServerState::ShuttingDown;
        }
        self.emit_event(ServerEvent::StateChanged(ServerState::ShuttingDown));

        info!("Stopping relay server...");

        self.shutdown_token.cancel();
        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.tracker.len(),
                "Connections did not close in time"
            );
        }

        if let Some(task) = self.cleanup_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Session cleanup task failed");
            }
        }

        let killed = self.registry.shutdown().await;
        if killed > 0 {
            debug!(killed, "Terminated leftover sessions");
        }

        *self.state.write().await = ServerState::Stopped;
        self.emit_event(ServerEvent::StateChanged(ServerState::Stopped));

        info!("Relay server stopped");
        Ok(())
    }

    /// Emits a server event.
    fn emit_event(&self, event: ServerEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry<F>> {
        &self.registry
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of connected clients.
    pub fn connection_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Configuration the server was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }
}
