//! Websocket transport adapter.
//!
//! Each accepted connection gets a reader task and a writer task. Messages
//! travel as JSON text frames; binary frames are ignored. The writer also
//! sends heartbeat pings and reports the peer as failed when nothing has been
//! heard from it for too long.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{Direction, Message, ProtocolError, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{accept_async, WebSocketStream};

use super::{transport_pair, RelayEndpoint, TransportEvent};
use crate::config::ServerConfig;
use crate::session::ConnectionId;

/// Websocket adapter settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebSocketOptions {
    /// Interval between heartbeat pings. `None` disables the heartbeat.
    pub heartbeat_interval: Option<Duration>,
    /// Extra time to wait for traffic after a missed ping.
    pub heartbeat_timeout: Duration,
    /// Capacity of the inbound and outbound queues.
    pub channel_capacity: usize,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Some(Duration::from_secs(30)),
            heartbeat_timeout: Duration::from_secs(10),
            channel_capacity: 256,
        }
    }
}

impl WebSocketOptions {
    /// Builds the options from the server configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            channel_capacity: config.outbound_capacity,
        }
    }
}

/// Completes the websocket handshake and starts the reader and writer tasks.
///
/// The returned endpoint is the only handle to the connection: dropping its
/// outbound sender closes the websocket.
pub async fn accept_connection<S>(
    stream: S,
    connection_id: ConnectionId,
    options: WebSocketOptions,
) -> Result<RelayEndpoint>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws_stream = accept_async(stream).await.map_err(|e| match e {
        WsError::Io(io_err) => ProtocolError::from(io_err),
        other => ProtocolError::ConnectionClosed(format!("websocket handshake failed: {}", other)),
    })?;

    let (ws_sink, ws_stream) = ws_stream.split();
    let (adapter, relay) = transport_pair(options.channel_capacity);

    // Any frame from the peer counts as proof of life.
    let last_seen = Arc::new(RwLock::new(Instant::now()));

    tokio::spawn(write_loop(
        connection_id.clone(),
        ws_sink,
        adapter.outbound,
        adapter.events.clone(),
        Arc::clone(&last_seen),
        options,
    ));
    tokio::spawn(read_loop(connection_id, ws_stream, adapter.events, last_seen));

    Ok(relay)
}

async fn write_loop<S>(
    connection_id: ConnectionId,
    mut ws_sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut outbound: mpsc::Receiver<Message>,
    events: mpsc::Sender<TransportEvent>,
    last_seen: Arc<RwLock<Instant>>,
    options: WebSocketOptions,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut heartbeat = options.heartbeat_interval.map(tokio::time::interval);
    if let Some(ref mut heartbeat) = heartbeat {
        // Skip the first immediate tick
        heartbeat.tick().await;
    }

    loop {
        tokio::select! {
            msg = outbound.recv() => {
                let Some(msg) = msg else {
                    tracing::debug!(connection_id = %connection_id, "Relay finished, closing websocket");
                    let _ = ws_sink.send(WsMessage::Close(None)).await;
                    break;
                };
                let json = match msg.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!(connection_id = %connection_id, error = %e, "Failed to serialize message");
                        continue;
                    }
                };
                if let Err(e) = ws_sink.send(WsMessage::Text(json)).await {
                    tracing::warn!(connection_id = %connection_id, error = %e, "Failed to send websocket message");
                    let _ = events.send(TransportEvent::Error(e.to_string())).await;
                    break;
                }
            }

            _ = tick(&mut heartbeat) => {
                let interval = options.heartbeat_interval.unwrap_or_default();
                let silent_for = last_seen.read().await.elapsed();
                if silent_for > interval + options.heartbeat_timeout {
                    tracing::warn!(connection_id = %connection_id, ?silent_for, "Heartbeat timeout");
                    let _ = events.send(TransportEvent::Error("heartbeat timeout".to_string())).await;
                    break;
                }

                if let Err(e) = ws_sink.send(WsMessage::Ping(Vec::new())).await {
                    tracing::warn!(connection_id = %connection_id, error = %e, "Failed to send ping");
                    let _ = events.send(TransportEvent::Error(e.to_string())).await;
                    break;
                }
                tracing::trace!(connection_id = %connection_id, "Sent heartbeat ping");
            }
        }
    }
}

async fn read_loop<S>(
    connection_id: ConnectionId,
    mut ws_stream: SplitStream<WebSocketStream<S>>,
    events: mpsc::Sender<TransportEvent>,
    last_seen: Arc<RwLock<Instant>>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = events.closed() => break,
            frame = ws_stream.next() => frame,
        };

        let event = match frame {
            None => TransportEvent::Disconnected,
            Some(Err(e)) => {
                tracing::debug!(connection_id = %connection_id, error = %e, "Websocket read failed");
                TransportEvent::Error(e.to_string())
            }
            Some(Ok(frame)) => {
                *last_seen.write().await = Instant::now();
                match frame {
                    WsMessage::Text(text) => match decode(&text) {
                        Ok(msg) => TransportEvent::Message(msg),
                        Err(e) => {
                            tracing::warn!(connection_id = %connection_id, error = %e, "Skipping malformed message");
                            continue;
                        }
                    },
                    WsMessage::Close(_) => TransportEvent::Disconnected,
                    WsMessage::Binary(_) => {
                        tracing::debug!(connection_id = %connection_id, "Ignoring binary frame");
                        continue;
                    }
                    // Ping replies are queued by tungstenite itself.
                    _ => continue,
                }
            }
        };

        let terminal = !matches!(event, TransportEvent::Message(_));
        if events.send(event).await.is_err() || terminal {
            break;
        }
    }
}

fn decode(text: &str) -> Result<Message> {
    let msg = Message::from_json(text)?;
    msg.expect_from(Direction::ClientToServer)?;
    Ok(msg)
}

/// Waits for the next heartbeat tick, or forever when disabled.
async fn tick(heartbeat: &mut Option<tokio::time::Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
