//! Connection handler: the relay state machine for one client.
//!
//! ```text
//! Idle --start-session--> Starting --spawned--> Active --exit/disconnect--> Closed
//!                            \--spawn failed-----------------------------> Closed
//! ```
//!
//! Inbound events, session creation, the resize deadline and the output pump
//! are all multiplexed in a single `select!` loop, so the handler never blocks
//! on any one of them.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::OptionFuture;
use protocol::{Dimensions, Direction, Message};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::debounce::ResizeDebouncer;
use super::pump::{spawn_output_pump, PumpExit};
use super::RelayError;
use crate::config::SessionConfig;
use crate::network::{RelayEndpoint, TransportEvent};
use crate::session::{ConnectionId, ProcessSession, SessionError, SessionFactory, SessionRegistry};

/// Per-connection relay settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    /// Size used when `start-session` carries an unusable size.
    pub default_dims: Dimensions,
    /// Resize coalescing window.
    pub resize_debounce: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            default_dims: Dimensions::default(),
            resize_debounce: Duration::from_millis(500),
        }
    }
}

impl RelayOptions {
    /// Builds the options from the session configuration.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            default_dims: config.default_dimensions(),
            resize_debounce: config.resize_debounce(),
        }
    }
}

/// Handler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Waiting for `start-session`.
    Idle,
    /// The shell is being spawned.
    Starting,
    /// Relaying input and output.
    Active,
    /// Finished. Nothing else is processed.
    Closed,
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The client disconnected or went away.
    Disconnected,
    /// The shell exited on its own.
    ProcessExited {
        /// Exit code, when the platform reported one.
        code: Option<i32>,
    },
    /// The shell could not be started.
    SpawnFailed,
    /// The transport failed.
    TransportError,
    /// The server is shutting down.
    Shutdown,
}

type Creation<S> = JoinHandle<Result<Arc<S>, SessionError>>;

/// Drives one connection from `start-session` to close.
pub struct RelayHandler<F: SessionFactory> {
    connection_id: ConnectionId,
    registry: Arc<SessionRegistry<F>>,
    options: RelayOptions,
    shutdown: CancellationToken,
    pump_cancel: CancellationToken,
    state: RelayState,
    session: Option<Arc<F::Session>>,
    queued_input: Vec<String>,
    debouncer: ResizeDebouncer,
}

impl<F: SessionFactory> RelayHandler<F> {
    /// Creates a handler in the `Idle` state.
    pub fn new(
        connection_id: ConnectionId,
        registry: Arc<SessionRegistry<F>>,
        options: RelayOptions,
        shutdown: CancellationToken,
    ) -> Self {
        let pump_cancel = shutdown.child_token();
        Self {
            connection_id,
            registry,
            debouncer: ResizeDebouncer::new(options.resize_debounce),
            options,
            shutdown,
            pump_cancel,
            state: RelayState::Idle,
            session: None,
            queued_input: Vec::new(),
        }
    }

    /// Connection this handler serves.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Current state.
    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Runs the connection until it closes, then releases its session.
    pub async fn run(&mut self, endpoint: RelayEndpoint) -> RelayOutcome {
        if self.state == RelayState::Closed {
            return RelayOutcome::Disconnected;
        }

        let RelayEndpoint {
            mut events,
            outbound,
        } = endpoint;
        let mut creation: Option<Creation<F::Session>> = None;
        let mut pump: Option<JoinHandle<PumpExit>> = None;

        let outcome = loop {
            // Resizes wait for a session to exist.
            let resize_at = self.session.as_ref().and(self.debouncer.deadline());

            tokio::select! {
                _ = self.shutdown.cancelled() => break RelayOutcome::Shutdown,

                event = events.recv() => {
                    let event = event.unwrap_or(TransportEvent::Disconnected);
                    if let Some(outcome) = self.on_event(event, &mut creation) {
                        break outcome;
                    }
                }

                Some(joined) = OptionFuture::from(creation.as_mut()) => {
                    creation = None;
                    let created = joined
                        .map_err(|e| SessionError::SpawnFailed(e.to_string()))
                        .and_then(|result| result);

                    match created {
                        Ok(session) => match self.activate(session, &outbound).await {
                            Ok(handle) => pump = handle,
                            Err(outcome) => break outcome,
                        },
                        Err(e) => {
                            let err = RelayError::from(e);
                            tracing::warn!(connection_id = %self.connection_id, error = %err, "Session start failed");
                            let _ = outbound.send(err.to_message()).await;
                            break RelayOutcome::SpawnFailed;
                        }
                    }
                }

                _ = tokio::time::sleep_until(resize_at.unwrap_or_else(Instant::now)), if resize_at.is_some() => {
                    self.apply_resize();
                }

                Some(joined) = OptionFuture::from(pump.as_mut()) => {
                    pump = None;
                    match joined {
                        Ok(PumpExit::ProcessExited) => {
                            let code = self.finish_exited().await;
                            if outbound.send(Message::Exit { code }).await.is_err() {
                                tracing::debug!(connection_id = %self.connection_id, "Client gone before exit notice");
                            }
                            break RelayOutcome::ProcessExited { code };
                        }
                        Ok(PumpExit::TransportClosed) => break RelayOutcome::TransportError,
                        Ok(PumpExit::Cancelled) => break RelayOutcome::Shutdown,
                        Err(e) => {
                            tracing::error!(connection_id = %self.connection_id, error = %e, "Output pump failed");
                            break RelayOutcome::TransportError;
                        }
                    }
                }
            }
        };

        self.teardown(creation, pump).await;

        tracing::info!(connection_id = %self.connection_id, ?outcome, "Connection closed");
        outcome
    }

    /// Handles one inbound event. Returns an outcome when the connection ends.
    fn on_event(
        &mut self,
        event: TransportEvent,
        creation: &mut Option<Creation<F::Session>>,
    ) -> Option<RelayOutcome> {
        let msg = match event {
            TransportEvent::Message(msg) => msg,
            TransportEvent::Disconnected => return Some(RelayOutcome::Disconnected),
            TransportEvent::Error(e) => {
                tracing::warn!(connection_id = %self.connection_id, error = %e, "Transport error");
                return Some(RelayOutcome::TransportError);
            }
        };

        if let Err(e) = msg.expect_from(Direction::ClientToServer) {
            tracing::warn!(connection_id = %self.connection_id, error = %e, "Ignoring message");
            return None;
        }

        match msg {
            Message::StartSession { cols, rows } => self.on_start(cols, rows, creation),
            Message::Resize { cols, rows } => self.on_resize(cols, rows),
            Message::Stdin { data } => self.on_stdin(data),
            Message::Disconnect => return Some(RelayOutcome::Disconnected),
            _ => {}
        }
        None
    }

    fn on_start(&mut self, cols: i64, rows: i64, creation: &mut Option<Creation<F::Session>>) {
        if self.state != RelayState::Idle {
            tracing::debug!(connection_id = %self.connection_id, state = ?self.state, "Ignoring repeated start-session");
            return;
        }

        let dims = Dimensions::new(cols, rows).unwrap_or_else(|e| {
            tracing::warn!(
                connection_id = %self.connection_id,
                error = %e,
                fallback = %self.options.default_dims,
                "Unusable initial size"
            );
            self.options.default_dims
        });

        let registry = Arc::clone(&self.registry);
        let id = self.connection_id.clone();
        *creation = Some(tokio::spawn(async move {
            registry.get_or_create(&id, dims).await
        }));

        self.state = RelayState::Starting;
        tracing::debug!(connection_id = %self.connection_id, cols = dims.cols(), rows = dims.rows(), "Starting session");
    }

    fn on_resize(&mut self, cols: i64, rows: i64) {
        match Dimensions::new(cols, rows) {
            Ok(dims) => self.debouncer.push(dims, Instant::now()),
            Err(e) => {
                tracing::debug!(connection_id = %self.connection_id, error = %e, "Ignoring resize");
            }
        }
    }

    fn on_stdin(&mut self, data: String) {
        match self.state {
            RelayState::Starting => self.queued_input.push(data),
            RelayState::Active => self.write(data.as_bytes()),
            RelayState::Idle | RelayState::Closed => {
                tracing::debug!(connection_id = %self.connection_id, state = ?self.state, "Dropping stdin without a session");
            }
        }
    }

    /// Announces the session, flushes queued input and starts the pump.
    async fn activate(
        &mut self,
        session: Arc<F::Session>,
        outbound: &mpsc::Sender<Message>,
    ) -> Result<Option<JoinHandle<PumpExit>>, RelayOutcome> {
        let output = session.take_output();
        self.session = Some(session);

        if outbound.send(Message::Ready).await.is_err() {
            return Err(RelayOutcome::TransportError);
        }
        self.state = RelayState::Active;
        tracing::info!(connection_id = %self.connection_id, "Session ready");

        for data in std::mem::take(&mut self.queued_input) {
            self.write(data.as_bytes());
        }

        match output {
            Some(output) => Ok(Some(spawn_output_pump(
                self.connection_id.clone(),
                output,
                outbound.clone(),
                self.pump_cancel.clone(),
            ))),
            None => {
                tracing::warn!(connection_id = %self.connection_id, "Session output already taken");
                Ok(None)
            }
        }
    }

    fn write(&self, data: &[u8]) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if let Err(e) = session.write_input(data) {
            tracing::warn!(connection_id = %self.connection_id, error = %e, "Failed to write input");
        }
    }

    fn apply_resize(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let Some(dims) = self.debouncer.take_due(Instant::now()) else {
            return;
        };
        if let Err(e) = session.resize(dims) {
            tracing::warn!(connection_id = %self.connection_id, error = %e, "Failed to resize");
        }
    }

    /// Releases a session whose process has exited and returns its exit code.
    async fn finish_exited(&mut self) -> Option<i32> {
        self.registry.remove(&self.connection_id).await;
        let code = self.session.as_ref().and_then(|s| s.exit_code());
        tracing::info!(connection_id = %self.connection_id, exit_code = ?code, "Shell exited");
        code
    }

    async fn teardown(
        &mut self,
        creation: Option<Creation<F::Session>>,
        pump: Option<JoinHandle<PumpExit>>,
    ) {
        self.state = RelayState::Closed;
        self.pump_cancel.cancel();

        // A spawn in flight must land before removal or its process leaks.
        if let Some(creation) = creation {
            let _ = creation.await;
        }
        if let Some(pump) = pump {
            let _ = pump.await;
        }

        self.registry.remove(&self.connection_id).await;
        self.session = None;
        self.queued_input.clear();
    }
}
