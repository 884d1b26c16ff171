//! Inter-node message bus: the envelope, its codecs, and the pluggable
//! transport bindings nodes use to reach each other.

pub mod codec;
pub mod envelope;
#[cfg(feature = "kafka-bus")]
pub mod kafka;
pub mod local;
#[cfg(feature = "redis-bus")]
pub mod redis;

use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

pub use self::envelope::{NodeMessage, NodeMessageKind, NodePayload, TeamEventPayload};

/// Result alias for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Error raised by bus transports regardless of the underlying broker.
#[derive(Debug, Error)]
pub enum BusError {
    /// The transport could not be reached or set up.
    #[error("bus connection failed: {message}")]
    Connection {
        /// Human-readable context.
        message: String,
        /// Transport-specific cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Sending gave up after the single retry.
    #[error("bus send failed after retry: {message}")]
    Send {
        /// Human-readable context.
        message: String,
    },
    /// The bus is not registered; call `register` first.
    #[error("bus is not registered")]
    NotRegistered,
    /// A message could not be encoded for the transport.
    #[error(transparent)]
    Codec(#[from] codec::CodecError),
}

impl BusError {
    /// Construct a connection error from any transport failure.
    pub fn connection(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        BusError::Connection {
            message: message.into(),
            source: Box::new(source),
        }
    }
}

/// Abstraction over the transport nodes use to exchange [`NodeMessage`]s.
///
/// Delivery is best-effort: `send` retries exactly once, then the message is
/// logged and dropped. Higher layers repair losses through the periodic
/// snapshot reconciliation, never through redelivery.
pub trait MessageBus: Send + Sync {
    /// Subscribe this node to the shared channel. Idempotent.
    fn register(&self, node_id: &str) -> BoxFuture<'_, BusResult<()>>;
    /// Unsubscribe and release transport resources.
    fn unregister(&self) -> BoxFuture<'_, BusResult<()>>;
    /// Fire-and-forget publish with at most one retry.
    fn send(&self, message: NodeMessage) -> BoxFuture<'_, BusResult<()>>;
    /// Broadcast channel of inbound messages that passed the local filter.
    fn messages(&self) -> broadcast::Receiver<NodeMessage>;
}

/// Stream view over a bus's inbound channel.
///
/// Lagged gaps are skipped rather than surfaced, matching the bus's
/// best-effort delivery contract.
pub fn message_stream(bus: &dyn MessageBus) -> impl Stream<Item = NodeMessage> + Send + use<> {
    BroadcastStream::new(bus.messages()).filter_map(|result| async move { result.ok() })
}

/// Inbound filter shared by every binding: drop our own echo and traffic
/// addressed to a different node.
pub(crate) fn accepts(local_node: &str, message: &NodeMessage) -> bool {
    if message.sender == local_node {
        return false;
    }
    match &message.recipient {
        None => true,
        Some(recipient) => recipient == local_node,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn message_stream_yields_inbound_messages() {
        use crate::bus::local::{LoopbackBus, LoopbackHub};

        let hub = LoopbackHub::default();
        let bus_a = LoopbackBus::new(hub.clone());
        let bus_b = LoopbackBus::new(hub);
        bus_a.register("node-a").await.unwrap();
        bus_b.register("node-b").await.unwrap();

        let mut stream = Box::pin(message_stream(&bus_b));
        bus_a
            .send(NodeMessage::request_team_list("node-a"))
            .await
            .unwrap();

        let message = tokio::time::timeout(std::time::Duration::from_millis(200), stream.next())
            .await
            .expect("no message within the timeout")
            .expect("stream ended");
        assert_eq!(message.kind, NodeMessageKind::RequestTeamList);
    }

    #[test]
    fn filter_drops_echo_and_foreign_traffic() {
        let broadcast = NodeMessage::request_team_list("node-a");
        assert!(!accepts("node-a", &broadcast));
        assert!(accepts("node-b", &broadcast));

        let unicast = NodeMessage::team_list("node-a", "node-b", vec![]);
        assert!(accepts("node-b", &unicast));
        assert!(!accepts("node-c", &unicast));
        assert!(!accepts("node-a", &unicast));
    }
}
