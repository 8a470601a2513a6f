//! Kafka event broker built on rdkafka
//!
//! One `FutureProducer` is shared by every publisher. Each subscription gets
//! its own `StreamConsumer` with auto-commit on and automatic offset storage
//! off, so only acknowledged records are committed. Ephemeral groups are
//! deleted through the admin API once their consumer has left.

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer as RdStreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::Message;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    EventPublisher, EventSubscriber, PublishReceipt, StartPosition, StreamConsumer, StreamRecord,
    SubscriptionSpec,
};
use crate::error::{CallEngineError, Result};

#[derive(Clone)]
pub struct KafkaBroker {
    brokers: String,
    producer: FutureProducer,
    admin: Arc<AdminClient<DefaultClientContext>>,
}

impl KafkaBroker {
    /// Create the shared producer and admin client for a bootstrap server list
    pub fn connect(brokers: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .create()?;

        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .create()?;

        info!("✅ Kafka producer ready for {}", brokers);
        Ok(Self {
            brokers: brokers.to_string(),
            producer,
            admin: Arc::new(admin),
        })
    }

    fn consumer_config(&self, spec: &SubscriptionSpec) -> ClientConfig {
        let reset = match spec.start {
            StartPosition::Earliest => "earliest",
            StartPosition::Latest => "latest",
        };

        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &spec.group_id)
            .set("auto.offset.reset", reset)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("partition.assignment.strategy", "roundrobin");
        config
    }
}

#[async_trait]
impl EventPublisher for KafkaBroker {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<PublishReceipt> {
        let record = FutureRecord::to(topic).key(key).payload(&payload);
        let (partition, offset) = self
            .producer
            .send(record, Timeout::Never)
            .await
            .map_err(|(err, _)| CallEngineError::broker(format!("publish to {} failed: {}", topic, err)))?;

        debug!("Published {} to {} [{}@{}]", key, topic, partition, offset);
        Ok(PublishReceipt { partition, offset })
    }
}

#[async_trait]
impl EventSubscriber for KafkaBroker {
    async fn subscribe(&self, spec: SubscriptionSpec) -> Result<Box<dyn StreamConsumer>> {
        let consumer: RdStreamConsumer = self.consumer_config(&spec).create()?;
        consumer.subscribe(&[spec.topic.as_str()])?;

        debug!("Consumer group {} subscribed to {}", spec.group_id, spec.topic);
        Ok(Box::new(KafkaConsumer {
            consumer: Some(consumer),
            admin: self.admin.clone(),
            spec,
        }))
    }
}

struct KafkaConsumer {
    consumer: Option<RdStreamConsumer>,
    admin: Arc<AdminClient<DefaultClientContext>>,
    spec: SubscriptionSpec,
}

#[async_trait]
impl StreamConsumer for KafkaConsumer {
    fn group_id(&self) -> &str {
        &self.spec.group_id
    }

    async fn next(&mut self) -> Option<Result<StreamRecord>> {
        let consumer = self.consumer.as_ref()?;
        match consumer.recv().await {
            Ok(message) => Some(Ok(StreamRecord {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(|k| String::from_utf8_lossy(k).into_owned()),
                payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            })),
            Err(err) => Some(Err(err.into())),
        }
    }

    async fn ack(&mut self, record: &StreamRecord) -> Result<()> {
        if let Some(consumer) = &self.consumer {
            // Stored offset is the next one to read
            consumer.store_offset(&record.topic, record.partition, record.offset + 1)?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        match self.consumer.take() {
            Some(consumer) => leave_group(consumer, &self.admin, &self.spec).await,
            None => Ok(()),
        }
    }
}

impl Drop for KafkaConsumer {
    fn drop(&mut self) {
        let Some(consumer) = self.consumer.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to release consumer group {}", self.spec.group_id);
            return;
        };
        let admin = self.admin.clone();
        let spec = self.spec.clone();
        handle.spawn(async move {
            if let Err(e) = leave_group(consumer, &admin, &spec).await {
                warn!("Failed to release consumer group {}: {}", spec.group_id, e);
            }
        });
    }
}

async fn leave_group(
    consumer: RdStreamConsumer,
    admin: &AdminClient<DefaultClientContext>,
    spec: &SubscriptionSpec,
) -> Result<()> {
    consumer.unsubscribe();
    // Dropping the consumer blocks until it has left the group
    tokio::task::spawn_blocking(move || drop(consumer))
        .await
        .map_err(|e| CallEngineError::internal(format!("consumer close task failed: {}", e)))?;

    if !spec.ephemeral {
        return Ok(());
    }

    let results = admin
        .delete_groups(&[spec.group_id.as_str()], &AdminOptions::new())
        .await?;
    for result in results {
        match result {
            Ok(group) => debug!("Deleted consumer group {}", group),
            Err((group, code)) => warn!("Failed to delete consumer group {}: {:?}", group, code),
        }
    }
    Ok(())
}
