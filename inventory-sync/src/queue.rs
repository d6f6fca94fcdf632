use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::QueueError;

const CONSUMER_GROUP: &str = "inventory-sync-webhooks";

/// Receives raw task payloads from `TaskQueue::consume`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: &str) -> anyhow::Result<()>;
}

/// Optional asynchronous hand-off between ingress and workers. Selected once
/// at startup; callers never check whether a broker exists.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    fn is_enabled(&self) -> bool;

    async fn enqueue(&self, topic: &str, key: &str, payload: &str) -> Result<(), QueueError>;

    /// Runs `handler` over every message on `topic`, at most `concurrency` at
    /// a time, until `shutdown` fires.
    async fn consume(
        &self,
        topic: &str,
        handler: Arc<dyn TaskHandler>,
        concurrency: usize,
        shutdown: CancellationToken,
    ) -> Result<(), QueueError>;
}

pub fn select_queue(config: &Config) -> Result<Arc<dyn TaskQueue>, QueueError> {
    match config.queue_brokers() {
        Some(brokers) => {
            info!(brokers, "task queue enabled");
            Ok(Arc::new(KafkaQueue::new(brokers)?))
        }
        None => {
            info!("task queue disabled; webhook events are picked up from the database");
            Ok(Arc::new(NoopQueue))
        }
    }
}

/// Used when no broker is configured. Enqueue succeeds without doing anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopQueue;

#[async_trait]
impl TaskQueue for NoopQueue {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn enqueue(&self, _topic: &str, _key: &str, _payload: &str) -> Result<(), QueueError> {
        Ok(())
    }

    async fn consume(
        &self,
        _topic: &str,
        _handler: Arc<dyn TaskHandler>,
        _concurrency: usize,
        _shutdown: CancellationToken,
    ) -> Result<(), QueueError> {
        Ok(())
    }
}

pub struct KafkaQueue {
    brokers: String,
    producer: FutureProducer,
}

impl KafkaQueue {
    pub fn new(brokers: &str) -> Result<Self, QueueError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self {
            brokers: brokers.to_string(),
            producer,
        })
    }

    fn consumer(&self, topic: &str) -> Result<StreamConsumer, QueueError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", CONSUMER_GROUP)
            .set("bootstrap.servers", &self.brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "true")
            .create()?;
        consumer.subscribe(&[topic])?;
        Ok(consumer)
    }
}

#[async_trait]
impl TaskQueue for KafkaQueue {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn enqueue(&self, topic: &str, key: &str, payload: &str) -> Result<(), QueueError> {
        let record = FutureRecord::to(topic).payload(payload).key(key);
        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| QueueError::Kafka(e))?;
        Ok(())
    }

    async fn consume(
        &self,
        topic: &str,
        handler: Arc<dyn TaskHandler>,
        concurrency: usize,
        shutdown: CancellationToken,
    ) -> Result<(), QueueError> {
        let consumer = self.consumer(topic)?;
        info!(topic, concurrency, "consuming task queue");

        consumer
            .stream()
            .take_until(shutdown.cancelled())
            .for_each_concurrent(concurrency.max(1), |message| {
                let handler = handler.clone();
                let consumer = &consumer;
                async move {
                    let m = match message {
                        Ok(m) => m,
                        Err(e) => {
                            error!("Error receiving message: {}", e);
                            return;
                        }
                    };

                    match m.payload_view::<str>() {
                        Some(Ok(payload)) => {
                            if let Err(e) = handler.handle(payload).await {
                                warn!(topic, offset = m.offset(), "task handler failed: {:#}", e);
                            }
                        }
                        Some(Err(e)) => warn!(topic, "message payload is not UTF-8: {}", e),
                        None => warn!(topic, "message without payload"),
                    }

                    if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                        error!("Error committing message: {}", e);
                    }
                }
            })
            .await;

        Ok(())
    }
}
