use std::sync::RwLock;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::StreamExt;
use futures::future::BoxFuture;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::bus::codec;
use crate::bus::{BusError, BusResult, MessageBus, NodeMessage, accepts};

/// Configuration of the Redis pub/sub bus binding.
#[derive(Debug, Clone)]
pub struct RedisBusConfig {
    /// Redis connection URL.
    pub url: String,
    /// Pub/sub channel all nodes share.
    pub channel: String,
    /// Cadence of the "I am alive" heartbeat.
    pub heartbeat_interval: Duration,
    /// Peers not heard from within this window are dropped.
    pub peer_inactivity: Duration,
}

impl RedisBusConfig {
    /// Config with default presence timings.
    pub fn new(url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            channel: channel.into(),
            heartbeat_interval: Duration::from_secs(30),
            peer_inactivity: Duration::from_secs(120),
        }
    }

    fn presence_channel(&self) -> String {
        format!("{}:presence", self.channel)
    }
}

/// [`MessageBus`] binding over a Redis pub/sub channel.
///
/// Envelopes travel in the length-prefixed binary framing. Redis pub/sub has
/// no subscription liveness, so the binding runs a presence protocol on a
/// sibling channel: periodic heartbeats, and peers expired after the
/// configured inactivity window.
pub struct RedisMessageBus {
    client: redis::Client,
    config: RedisBusConfig,
    inbound: broadcast::Sender<NodeMessage>,
    peers: std::sync::Arc<DashMap<String, Instant>>,
    registration: RwLock<Option<Registration>>,
}

struct Registration {
    node_id: String,
    publish_conn: MultiplexedConnection,
    tasks: Vec<JoinHandle<()>>,
}

impl RedisMessageBus {
    /// Create the binding; connections are established on `register`.
    pub fn connect(config: RedisBusConfig) -> BusResult<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|err| BusError::connection("invalid redis url", err))?;
        let (inbound, _receiver) = broadcast::channel(64);
        Ok(Self {
            client,
            config,
            inbound,
            peers: std::sync::Arc::new(DashMap::new()),
            registration: RwLock::new(None),
        })
    }

    /// Node ids heard from within the inactivity window.
    pub fn active_peers(&self) -> Vec<String> {
        self.peers.iter().map(|e| e.key().clone()).collect()
    }

    fn publish_handle(&self) -> Option<MultiplexedConnection> {
        self.registration
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|r| r.publish_conn.clone()))
    }
}

async fn publish_once(mut conn: MultiplexedConnection, channel: &str, bytes: &[u8]) -> bool {
    match conn.publish::<_, _, ()>(channel, bytes).await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "bus publish attempt failed");
            false
        }
    }
}

impl MessageBus for RedisMessageBus {
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

            let publish_conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|err| BusError::connection("failed to connect to redis", err))?;
            let mut pubsub = self
                .client
                .get_async_pubsub()
                .await
                .map_err(|err| BusError::connection("failed to open pub/sub connection", err))?;
            pubsub
                .subscribe(&self.config.channel)
                .await
                .map_err(|err| BusError::connection("failed to subscribe to channel", err))?;
            pubsub
                .subscribe(self.config.presence_channel())
                .await
                .map_err(|err| BusError::connection("failed to subscribe to presence", err))?;

            let presence_channel = self.config.presence_channel();
            let inbound = self.inbound.clone();
            let peers = std::sync::Arc::clone(&self.peers);
            let local = node_id.clone();
            let receiver = tokio::spawn(async move {
                let mut stream = pubsub.into_on_message();
                while let Some(msg) = stream.next().await {
                    let payload = msg.get_payload_bytes();
                    if msg.get_channel_name() == presence_channel {
                        match std::str::from_utf8(payload) {
                            Ok(peer) if peer != local => {
                                if peers.insert(peer.to_string(), Instant::now()).is_none() {
                                    info!(peer, "bus peer appeared");
                                }
                            }
                            Ok(_) => {}
                            Err(err) => warn!(error = %err, "discarding malformed heartbeat"),
                        }
                        continue;
                    }
                    // Pub/sub has no nack; a malformed frame is logged and
                    // dropped without killing the receive loop.
                    match codec::decode_binary(payload) {
                        Ok(message) => {
                            if accepts(&local, &message) {
                                let _ = inbound.send(message);
                            }
                        }
                        Err(err) => warn!(error = %err, "discarding undecodable bus message"),
                    }
                }
                debug!("bus receive task exiting");
            });

            let heartbeat_conn = publish_conn.clone();
            let heartbeat_channel = self.config.presence_channel();
            let heartbeat_interval = self.config.heartbeat_interval;
            let peer_inactivity = self.config.peer_inactivity;
            let peers = std::sync::Arc::clone(&self.peers);
            let heartbeat_id = node_id.clone();
            let heartbeat = tokio::spawn(async move {
                let mut ticker = interval(heartbeat_interval);
                loop {
                    ticker.tick().await;
                    let mut conn = heartbeat_conn.clone();
                    if let Err(err) = conn
                        .publish::<_, _, ()>(&heartbeat_channel, heartbeat_id.as_bytes())
                        .await
                    {
                        warn!(error = %err, "failed to publish heartbeat");
                    }
                    peers.retain(|peer, last_seen| {
                        let alive = last_seen.elapsed() < peer_inactivity;
                        if !alive {
                            info!(peer, "bus peer expired");
                        }
                        alive
                    });
                }
            });

            let mut guard = self.registration.write().expect("registration lock");
            if let Some(previous) = guard.replace(Registration {
                node_id,
                publish_conn,
                tasks: vec![receiver, heartbeat],
            }) {
                for task in previous.tasks {
                    task.abort();
                }
            }
            Ok(())
        })
    }

    fn unregister(&self) -> BoxFuture<'_, BusResult<()>> {
        Box::pin(async move {
            let mut guard = self.registration.write().expect("registration lock");
            if let Some(registration) = guard.take() {
                for task in registration.tasks {
                    task.abort();
                }
            }
            self.peers.clear();
            Ok(())
        })
    }

    fn send(&self, message: NodeMessage) -> BoxFuture<'_, BusResult<()>> {
        Box::pin(async move {
            let Some(conn) = self.publish_handle() else {
                return Err(BusError::NotRegistered);
            };
            let bytes = codec::encode_binary(&message)?;

            if publish_once(conn.clone(), &self.config.channel, &bytes).await {
                return Ok(());
            }
            // Best-effort delivery: one retry, then drop.
            if publish_once(conn, &self.config.channel, &bytes).await {
                return Ok(());
            }
            warn!(kind = message.kind.name(), "bus message dropped after retry");
            Err(BusError::Send {
                message: format!("`{}` dropped after one retry", message.kind.name()),
            })
        })
    }

    fn messages(&self) -> broadcast::Receiver<NodeMessage> {
        self.inbound.subscribe()
    }
}
