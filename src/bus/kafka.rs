use std::sync::RwLock;
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message as KafkaMessage, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::codec::{self, CodecError};
use crate::bus::{BusError, BusResult, MessageBus, NodeMessage, NodeMessageKind, accepts};

/// Header carrying the sender node id.
const HEADER_SENDER: &str = "poker-sender";
/// Header carrying the recipient node id; absent on broadcasts.
const HEADER_RECIPIENT: &str = "poker-recipient";
/// Header carrying the message kind name.
const HEADER_KIND: &str = "poker-kind";
/// Header carrying the payload's declared subtype name.
const HEADER_SUBTYPE: &str = "poker-subtype";

/// Configuration of the Kafka/Redpanda bus binding.
#[derive(Debug, Clone)]
pub struct KafkaBusConfig {
    /// Comma-separated broker addresses.
    pub brokers: String,
    /// Topic all nodes share.
    pub topic: String,
    /// Producer send timeout.
    pub send_timeout: Duration,
}

impl KafkaBusConfig {
    /// Config with the default send timeout.
    pub fn new(brokers: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            topic: topic.into(),
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// [`MessageBus`] binding over a Kafka-compatible broker.
///
/// Every node consumes the shared topic under its own consumer group, which
/// turns the topic into a broadcast channel; the envelope header fields
/// travel as Kafka message headers and the payload as the record payload.
pub struct KafkaMessageBus {
    producer: FutureProducer,
    config: KafkaBusConfig,
    inbound: broadcast::Sender<NodeMessage>,
    registration: RwLock<Option<Registration>>,
}

struct Registration {
    node_id: String,
    forwarder: JoinHandle<()>,
}

impl KafkaMessageBus {
    /// Create the producer side of the binding.
    pub fn connect(config: KafkaBusConfig) -> BusResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", "1")
            .create()
            .map_err(|err| BusError::connection("failed to create producer", err))?;

        let (inbound, _receiver) = broadcast::channel(64);
        Ok(Self {
            producer,
            config,
            inbound,
            registration: RwLock::new(None),
        })
    }

    fn registered_node(&self) -> Option<String> {
        self.registration
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|r| r.node_id.clone()))
    }

    async fn publish_once(&self, headers: OwnedHeaders, key: &str, payload: &[u8]) -> bool {
        let record = FutureRecord::to(&self.config.topic)
            .key(key)
            .payload(payload)
            .headers(headers);
        match self
            .producer
            .send(record, Timeout::After(self.config.send_timeout))
            .await
        {
            Ok((partition, offset)) => {
                debug!(partition, offset, "bus message published");
                true
            }
            Err((err, _)) => {
                warn!(error = %err, "bus publish attempt failed");
                false
            }
        }
    }
}

impl MessageBus for KafkaMessageBus {
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

            // One consumer group per node: every node receives every message.
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.config.brokers)
                .set("group.id", format!("{}-{}", self.config.topic, node_id))
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", "latest")
                .set("session.timeout.ms", "6000")
                .create()
                .map_err(|err| BusError::connection("failed to create consumer", err))?;
            consumer
                .subscribe(&[self.config.topic.as_str()])
                .map_err(|err| BusError::connection("failed to subscribe to topic", err))?;

            let inbound = self.inbound.clone();
            let local = node_id.clone();
            let forwarder = tokio::spawn(async move {
                let mut stream = consumer.stream();
                while let Some(result) = stream.next().await {
                    match result {
                        Ok(record) => {
                            match decode_record(
                                record.headers(),
                                record.payload().unwrap_or_default(),
                            ) {
                                Ok(message) => {
                                    if accepts(&local, &message) {
                                        let _ = inbound.send(message);
                                    }
                                }
                                Err(err) => {
                                    // Kafka offers no per-message nack; log,
                                    // commit, and move on.
                                    warn!(error = %err, "discarding undecodable bus message");
                                }
                            }
                            if let Err(err) = consumer.commit_message(&record, CommitMode::Async) {
                                warn!(error = %err, "failed to commit bus offset");
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "bus receive error");
                        }
                    }
                }
                debug!("bus consumer task exiting");
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
                return Err(BusError::NotRegistered);
            }
            let payload = codec::encode_payload(&message)?;
            let headers = encode_headers(&message);
            let key = message.sender.clone();

            if self.publish_once(headers.clone(), &key, &payload).await {
                return Ok(());
            }
            // Best-effort delivery: one retry, then drop.
            if self.publish_once(headers, &key, &payload).await {
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

fn encode_headers(message: &NodeMessage) -> OwnedHeaders {
    let mut headers = OwnedHeaders::new()
        .insert(Header {
            key: HEADER_SENDER,
            value: Some(message.sender.as_bytes()),
        })
        .insert(Header {
            key: HEADER_KIND,
            value: Some(message.kind.name().as_bytes()),
        });
    if let Some(recipient) = &message.recipient {
        headers = headers.insert(Header {
            key: HEADER_RECIPIENT,
            value: Some(recipient.as_bytes()),
        });
    }
    if let Some(subtype) = message.payload.subtype_name() {
        headers = headers.insert(Header {
            key: HEADER_SUBTYPE,
            value: Some(subtype.as_bytes()),
        });
    }
    headers
}

fn decode_record(
    headers: Option<&impl Headers>,
    payload: &[u8],
) -> Result<NodeMessage, CodecError> {
    let mut sender = None;
    let mut recipient = None;
    let mut kind_name = None;
    if let Some(headers) = headers {
        for header in headers.iter() {
            let value = header
                .value
                .map(|bytes| String::from_utf8(bytes.to_vec()))
                .transpose()?;
            match header.key {
                HEADER_SENDER => sender = value,
                HEADER_RECIPIENT => recipient = value,
                HEADER_KIND => kind_name = value,
                _ => {}
            }
        }
    }

    let sender = sender.ok_or(CodecError::Truncated("sender header"))?;
    let kind_name = kind_name.ok_or(CodecError::Truncated("kind header"))?;
    let kind = NodeMessageKind::from_name(&kind_name)
        .ok_or_else(|| CodecError::UnknownKindName(kind_name.clone()))?;
    let payload = codec::decode_payload(kind, payload)?;

    Ok(NodeMessage {
        kind,
        sender,
        recipient,
        payload,
    })
}
