use futures::future::BoxFuture;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::bus::{BusResult, MessageBus, NodeMessage, accepts};

/// Shared in-process "network" connecting [`LoopbackBus`] instances.
///
/// Every bus attached to the same hub sees every published message, which is
/// exactly what a broker topic provides; the per-bus filter then applies the
/// usual echo/recipient rules.
#[derive(Debug, Clone)]
pub struct LoopbackHub {
    sender: broadcast::Sender<NodeMessage>,
}

impl LoopbackHub {
    /// Create a hub with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    fn publish(&self, message: NodeMessage) {
        // No subscribers is fine; the message is simply lost, as on any
        // best-effort transport.
        let _ = self.sender.send(message);
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new(64)
    }
}

/// In-process [`MessageBus`] binding over a [`LoopbackHub`].
///
/// Used by tests and single-node deployments; it is also the reference
/// implementation of the inbound filtering rules.
pub struct LoopbackBus {
    hub: LoopbackHub,
    inbound: broadcast::Sender<NodeMessage>,
    registration: RwLock<Option<Registration>>,
}

struct Registration {
    node_id: String,
    forwarder: JoinHandle<()>,
}

impl LoopbackBus {
    /// Attach a new bus endpoint to the hub.
    pub fn new(hub: LoopbackHub) -> Self {
        let (inbound, _receiver) = broadcast::channel(64);
        Self {
            hub,
            inbound,
            registration: RwLock::new(None),
        }
    }

    fn registered_node(&self) -> Option<String> {
        self.registration
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|r| r.node_id.clone()))
    }
}

impl MessageBus for LoopbackBus {
    fn register(&self, node_id: &str) -> BoxFuture<'_, BusResult<()>> {
        let node_id = node_id.to_string();
        Box::pin(async move {
            {
                let guard = self.registration.read().expect("registration lock");
                if let Some(existing) = guard.as_ref() {
                    if existing.node_id == node_id {
                        return Ok(());
                    }
                }
            }

            let mut receiver = self.hub.sender.subscribe();
            let inbound = self.inbound.clone();
            let local = node_id.clone();
            let forwarder = tokio::spawn(async move {
                loop {
                    match receiver.recv().await {
                        Ok(message) => {
                            if accepts(&local, &message) {
                                let _ = inbound.send(message);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "loopback bus lagged; messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });

            let mut guard = self.registration.write().expect("registration lock");
            if let Some(previous) = guard.replace(Registration { node_id, forwarder }) {
                previous.forwarder.abort();
            }
            Ok(())
        })
    }

    fn unregister(&self) -> BoxFuture<'_, BusResult<()>> {
        Box::pin(async move {
            let mut guard = self.registration.write().expect("registration lock");
            if let Some(registration) = guard.take() {
                registration.forwarder.abort();
            }
            Ok(())
        })
    }

    fn send(&self, message: NodeMessage) -> BoxFuture<'_, BusResult<()>> {
        Box::pin(async move {
            if self.registered_node().is_none() {
                return Err(crate::bus::BusError::NotRegistered);
            }
            self.hub.publish(message);
            Ok(())
        })
    }

    fn messages(&self) -> broadcast::Receiver<NodeMessage> {
        self.inbound.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn recv(
        receiver: &mut broadcast::Receiver<NodeMessage>,
    ) -> Result<NodeMessage, &'static str> {
        timeout(Duration::from_millis(200), receiver.recv())
            .await
            .map_err(|_| "timed out")?
            .map_err(|_| "channel closed")
    }

    #[tokio::test]
    async fn broadcast_reaches_other_nodes_but_not_the_sender() {
        let hub = LoopbackHub::default();
        let bus_a = LoopbackBus::new(hub.clone());
        let bus_b = LoopbackBus::new(hub);
        bus_a.register("node-a").await.unwrap();
        bus_b.register("node-b").await.unwrap();

        let mut inbox_a = bus_a.messages();
        let mut inbox_b = bus_b.messages();

        bus_a
            .send(NodeMessage::request_team_list("node-a"))
            .await
            .unwrap();

        let received = recv(&mut inbox_b).await.unwrap();
        assert_eq!(received.sender, "node-a");
        assert!(recv(&mut inbox_a).await.is_err(), "sender saw its own echo");
    }

    #[tokio::test]
    async fn unicast_skips_third_parties() {
        let hub = LoopbackHub::default();
        let bus_a = LoopbackBus::new(hub.clone());
        let bus_b = LoopbackBus::new(hub.clone());
        let bus_c = LoopbackBus::new(hub);
        bus_a.register("node-a").await.unwrap();
        bus_b.register("node-b").await.unwrap();
        bus_c.register("node-c").await.unwrap();

        let mut inbox_b = bus_b.messages();
        let mut inbox_c = bus_c.messages();

        bus_a
            .send(NodeMessage::team_list("node-a", "node-b", vec!["T".into()]))
            .await
            .unwrap();

        assert!(recv(&mut inbox_b).await.is_ok());
        assert!(recv(&mut inbox_c).await.is_err(), "unicast leaked");
    }

    #[tokio::test]
    async fn send_requires_registration() {
        let bus = LoopbackBus::new(LoopbackHub::default());
        let err = bus
            .send(NodeMessage::request_team_list("node-a"))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::bus::BusError::NotRegistered));
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let bus = LoopbackBus::new(LoopbackHub::default());
        bus.register("node-a").await.unwrap();
        bus.register("node-a").await.unwrap();
        bus.unregister().await.unwrap();
        bus.unregister().await.unwrap();
    }
}
