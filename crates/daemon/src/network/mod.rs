//! Network module for client connections.
//!
//! A transport adapter turns a concrete connection into a pair of bounded
//! channels. The relay only ever sees [`RelayEndpoint`]; the adapter owns the
//! other end and is responsible for framing, heartbeats, and closing.
//!
//! - [`websocket`]: JSON text frames over a plain `ws://` listener

pub mod websocket;

use protocol::Message;
use tokio::sync::mpsc;

/// Something that happened on the client side of a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A decoded client message.
    Message(Message),
    /// The client closed the connection.
    Disconnected,
    /// The connection failed.
    Error(String),
}

/// Adapter side of a connection: pushes events in, drains outbound messages.
#[derive(Debug)]
pub struct AdapterEndpoint {
    /// Events for the relay.
    pub events: mpsc::Sender<TransportEvent>,
    /// Messages the relay wants delivered to the client.
    pub outbound: mpsc::Receiver<Message>,
}

/// Relay side of a connection.
#[derive(Debug)]
pub struct RelayEndpoint {
    /// Events from the client.
    pub events: mpsc::Receiver<TransportEvent>,
    /// Messages for the client, in send order.
    pub outbound: mpsc::Sender<Message>,
}

/// Creates the channel pair for one connection.
pub fn transport_pair(capacity: usize) -> (AdapterEndpoint, RelayEndpoint) {
    let capacity = capacity.max(1);
    let (event_tx, event_rx) = mpsc::channel(capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

    (
        AdapterEndpoint {
            events: event_tx,
            outbound: outbound_rx,
        },
        RelayEndpoint {
            events: event_rx,
            outbound: outbound_tx,
        },
    )
}

pub use websocket::{accept_connection, WebSocketOptions};

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transport_pair_wires_both_directions() {
        let (mut adapter, mut relay) = transport_pair(4);

        adapter
            .events
            .send(TransportEvent::Message(Message::Disconnect))
            .await
            .unwrap();
        assert_eq!(
            relay.events.recv().await,
            Some(TransportEvent::Message(Message::Disconnect))
        );

        relay.outbound.send(Message::Ready).await.unwrap();
        assert_eq!(adapter.outbound.recv().await, Some(Message::Ready));
    }

    #[tokio::test]
    async fn test_dropping_adapter_closes_relay_events() {
        let (adapter, mut relay) = transport_pair(4);
        drop(adapter);
        assert!(relay.events.recv().await.is_none());
        assert!(relay.outbound.send(Message::Ready).await.is_err());
    }
}
