//! # Event Stream Abstraction
//!
//! The distributor talks to three keyed, partitioned, at-least-once streams:
//!
//! ```text
//!   incoming_calls ──▶ CallAssignmentEngine ──▶ assigned_calls ──▶ DeliveryBridge (one per agent)
//!   agent_changes  ──▶ AgentStateSynchronizer ──▶ agent pool
//! ```
//!
//! Publishing and consuming are split into [`EventPublisher`] and
//! [`EventSubscriber`] so components only hold the half they use. A
//! subscription is a [`StreamConsumer`] bound to one topic and one consumer
//! group. Records are acknowledged after they are handled, so a consumer that
//! dies mid-record sees it again after the group rebalances.
//!
//! ## Backends
//!
//! - [`InMemoryBroker`]: single-partition topics in process memory
//! - `KafkaBroker` (feature `kafka`): rdkafka producer and consumers

pub mod memory;
#[cfg(feature = "kafka")]
pub mod kafka;

pub use self::memory::InMemoryBroker;
#[cfg(feature = "kafka")]
pub use self::kafka::KafkaBroker;

use async_trait::async_trait;

use crate::error::Result;

/// Topic names used by the pipeline
pub mod topics {
    pub const INCOMING_CALLS: &str = "incoming_calls";
    pub const ASSIGNED_CALLS: &str = "assigned_calls";
    pub const AGENT_CHANGES: &str = "agent_changes";
}

/// Where a consumer group with no committed offset starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Earliest,
    Latest,
}

/// A record read from a stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl StreamRecord {
    pub fn key_str(&self) -> &str {
        self.key.as_deref().unwrap_or("")
    }
}

/// Where a published record landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    pub partition: i32,
    pub offset: i64,
}

/// What to subscribe to and as whom
#[derive(Debug, Clone)]
pub struct SubscriptionSpec {
    pub topic: String,
    pub group_id: String,
    pub start: StartPosition,
    /// Delete the consumer group when the consumer is closed
    pub ephemeral: bool,
}

impl SubscriptionSpec {
    /// Long-lived group that resumes from its committed offset
    pub fn durable(topic: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group_id: group_id.into(),
            start: StartPosition::Earliest,
            ephemeral: false,
        }
    }

    /// Throwaway group that starts at the head of the stream and is deleted on close
    pub fn ephemeral(topic: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group_id: group_id.into(),
            start: StartPosition::Latest,
            ephemeral: true,
        }
    }
}

/// Producer side of the event streams
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a keyed record; records sharing a key share a partition
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<PublishReceipt>;
}

/// Factory for consumer-group subscriptions
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn subscribe(&self, spec: SubscriptionSpec) -> Result<Box<dyn StreamConsumer>>;
}

/// One consumer-group member reading one topic
#[async_trait]
pub trait StreamConsumer: Send {
    fn group_id(&self) -> &str;

    /// Wait for the next record
    ///
    /// Returns `None` once the stream is closed. Dropping the returned future
    /// before it resolves does not lose a record.
    async fn next(&mut self) -> Option<Result<StreamRecord>>;

    /// Mark a record as handled so the group does not see it again
    async fn ack(&mut self, record: &StreamRecord) -> Result<()>;

    /// Leave the group, deleting it when the subscription is ephemeral
    ///
    /// Safe to call more than once.
    async fn close(&mut self) -> Result<()>;
}
