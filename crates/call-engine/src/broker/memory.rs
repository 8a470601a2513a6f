//! In-process event broker
//!
//! Each topic is a single partition: an append-only vector plus a `watch`
//! channel carrying its length so waiting consumers wake on publish. Consumer
//! groups keep a committed offset; a new subscription resumes from it, which
//! reproduces at-least-once redelivery of records that were read but never
//! acknowledged.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use super::{
    EventPublisher, EventSubscriber, PublishReceipt, StartPosition, StreamConsumer, StreamRecord,
    SubscriptionSpec,
};
use crate::error::{CallEngineError, Result};

struct TopicLog {
    records: RwLock<Vec<StreamRecord>>,
    len_tx: watch::Sender<usize>,
}

impl TopicLog {
    fn new() -> Self {
        let (len_tx, _) = watch::channel(0);
        Self {
            records: RwLock::new(Vec::new()),
            len_tx,
        }
    }

    fn len(&self) -> usize {
        self.records.read().len()
    }
}

struct BrokerState {
    topics: DashMap<String, Arc<TopicLog>>,
    /// Committed offsets keyed by (topic, group)
    groups: DashMap<(String, String), i64>,
    closed: AtomicBool,
    fail_publish: AtomicBool,
}

impl BrokerState {
    fn topic(&self, name: &str) -> Arc<TopicLog> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TopicLog::new()))
            .clone()
    }
}

/// Single-process broker with Kafka-like consumer groups
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                topics: DashMap::new(),
                groups: DashMap::new(),
                closed: AtomicBool::new(false),
                fail_publish: AtomicBool::new(false),
            }),
        }
    }

    /// Everything published to a topic so far, in order
    pub fn records(&self, topic: &str) -> Vec<StreamRecord> {
        self.state.topic(topic).records.read().clone()
    }

    /// Number of consumer groups currently registered on a topic
    pub fn group_count(&self, topic: &str) -> usize {
        self.state.groups.iter().filter(|g| g.key().0 == topic).count()
    }

    pub fn has_group(&self, topic: &str, group_id: &str) -> bool {
        self.state
            .groups
            .contains_key(&(topic.to_string(), group_id.to_string()))
    }

    /// Make every subsequent publish fail until switched off again
    pub fn set_publish_failure(&self, fail: bool) {
        self.state.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Close every stream; pending and future `next()` calls return `None`
    pub fn shutdown(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        for topic in self.state.topics.iter() {
            let len = topic.len();
            topic.len_tx.send_replace(len);
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for InMemoryBroker {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<PublishReceipt> {
        if self.state.fail_publish.load(Ordering::SeqCst) {
            return Err(CallEngineError::broker(format!("publish to {} rejected", topic)));
        }
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(CallEngineError::broker("broker is shut down"));
        }

        let log = self.state.topic(topic);
        let offset = {
            let mut records = log.records.write();
            let offset = records.len() as i64;
            records.push(StreamRecord {
                topic: topic.to_string(),
                partition: 0,
                offset,
                key: Some(key.to_string()),
                payload,
            });
            log.len_tx.send_replace(records.len());
            offset
        };

        debug!("Published {} to {} at offset {}", key, topic, offset);
        Ok(PublishReceipt { partition: 0, offset })
    }
}

#[async_trait]
impl EventSubscriber for InMemoryBroker {
    async fn subscribe(&self, spec: SubscriptionSpec) -> Result<Box<dyn StreamConsumer>> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(CallEngineError::broker("broker is shut down"));
        }

        let log = self.state.topic(&spec.topic);
        let group_key = (spec.topic.clone(), spec.group_id.clone());
        let position = *self
            .state
            .groups
            .entry(group_key)
            .or_insert_with(|| match spec.start {
                StartPosition::Earliest => 0,
                StartPosition::Latest => log.len() as i64,
            });

        debug!(
            "Group {} joined {} at offset {}",
            spec.group_id, spec.topic, position
        );

        Ok(Box::new(InMemoryConsumer {
            state: self.state.clone(),
            len_rx: log.len_tx.subscribe(),
            log,
            spec,
            position,
            closed: false,
        }))
    }
}

struct InMemoryConsumer {
    state: Arc<BrokerState>,
    log: Arc<TopicLog>,
    len_rx: watch::Receiver<usize>,
    spec: SubscriptionSpec,
    position: i64,
    closed: bool,
}

#[async_trait]
impl StreamConsumer for InMemoryConsumer {
    fn group_id(&self) -> &str {
        &self.spec.group_id
    }

    async fn next(&mut self) -> Option<Result<StreamRecord>> {
        loop {
            if self.closed || self.state.closed.load(Ordering::SeqCst) {
                return None;
            }

            let record = self.log.records.read().get(self.position as usize).cloned();
            if let Some(record) = record {
                self.position += 1;
                return Some(Ok(record));
            }

            if self.len_rx.changed().await.is_err() {
                return None;
            }
        }
    }

    async fn ack(&mut self, record: &StreamRecord) -> Result<()> {
        let key = (self.spec.topic.clone(), self.spec.group_id.clone());
        if let Some(mut committed) = self.state.groups.get_mut(&key) {
            *committed = (*committed).max(record.offset + 1);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl InMemoryConsumer {
    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.spec.ephemeral {
            self.state
                .groups
                .remove(&(self.spec.topic.clone(), self.spec.group_id.clone()));
            debug!("Released consumer group {}", self.spec.group_id);
        }
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_durable_group_reads_from_earliest() {
        let broker = InMemoryBroker::new();
        broker.publish("t", "k1", b"one".to_vec()).await.unwrap();
        broker.publish("t", "k2", b"two".to_vec()).await.unwrap();

        let mut consumer = broker.subscribe(SubscriptionSpec::durable("t", "g")).await.unwrap();
        let first = consumer.next().await.unwrap().unwrap();
        let second = consumer.next().await.unwrap().unwrap();
        assert_eq!(first.payload, b"one");
        assert_eq!(second.key_str(), "k2");
        assert_eq!(second.offset, 1);
    }

    #[tokio::test]
    async fn test_ephemeral_group_starts_at_latest_and_is_released() {
        let broker = InMemoryBroker::new();
        broker.publish("t", "old", b"old".to_vec()).await.unwrap();

        let mut consumer = broker.subscribe(SubscriptionSpec::ephemeral("t", "ws-1")).await.unwrap();
        assert!(broker.has_group("t", "ws-1"));

        broker.publish("t", "new", b"new".to_vec()).await.unwrap();
        let record = consumer.next().await.unwrap().unwrap();
        assert_eq!(record.key_str(), "new");

        consumer.close().await.unwrap();
        consumer.close().await.unwrap();
        assert!(!broker.has_group("t", "ws-1"));
        assert!(consumer.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unacked_records_are_redelivered_to_the_group() {
        let broker = InMemoryBroker::new();
        broker.publish("t", "a", b"a".to_vec()).await.unwrap();
        broker.publish("t", "b", b"b".to_vec()).await.unwrap();

        let mut first = broker.subscribe(SubscriptionSpec::durable("t", "g")).await.unwrap();
        let a = first.next().await.unwrap().unwrap();
        first.ack(&a).await.unwrap();
        let _b = first.next().await.unwrap().unwrap();
        first.close().await.unwrap();

        let mut second = broker.subscribe(SubscriptionSpec::durable("t", "g")).await.unwrap();
        let again = second.next().await.unwrap().unwrap();
        assert_eq!(again.key_str(), "b");
    }

    #[tokio::test]
    async fn test_waiting_consumer_wakes_on_publish() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker.subscribe(SubscriptionSpec::durable("t", "g")).await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("t", "late", b"x".to_vec()).await.unwrap();
        });

        let record = tokio::time::timeout(Duration::from_secs(2), consumer.next())
            .await
            .expect("consumer should wake")
            .unwrap()
            .unwrap();
        assert_eq!(record.key_str(), "late");
    }

    #[tokio::test]
    async fn test_shutdown_ends_streams_and_rejects_publish() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker.subscribe(SubscriptionSpec::durable("t", "g")).await.unwrap();

        broker.shutdown();
        assert!(consumer.next().await.is_none());
        assert!(broker.publish("t", "k", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_failure_injection() {
        let broker = InMemoryBroker::new();
        broker.set_publish_failure(true);
        assert!(broker.publish("t", "k", vec![]).await.is_err());
        broker.set_publish_failure(false);
        assert_eq!(broker.publish("t", "k", vec![]).await.unwrap().offset, 0);
    }

    #[tokio::test]
    async fn test_dropping_consumer_releases_ephemeral_group() {
        let broker = InMemoryBroker::new();
        let ephemeral = broker.subscribe(SubscriptionSpec::ephemeral("t", "ws-1")).await.unwrap();
        let durable = broker.subscribe(SubscriptionSpec::durable("t", "g")).await.unwrap();
        assert_eq!(broker.group_count("t"), 2);

        drop(ephemeral);
        drop(durable);
        assert!(!broker.has_group("t", "ws-1"));
        assert!(broker.has_group("t", "g"));
    }
}
