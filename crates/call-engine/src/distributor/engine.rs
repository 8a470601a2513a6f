//! Round-robin call assignment
//!
//! One inbound call in, at most one assigned call out. The engine takes the
//! head of the agent pool, publishes the assignment keyed by call id, records
//! it in the system of record, and puts the agent back at the tail.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{topics, EventPublisher, StreamConsumer, StreamRecord};
use crate::config::AssignmentMode;
use crate::error::{CallEngineError, Result};
use crate::pool::AgentPool;
use crate::store::CallRecordStore;
use crate::types::{AgentId, AssignedCall, InboundCall};

/// Result of processing one inbound call
#[derive(Debug, Clone, PartialEq)]
pub enum AssignmentOutcome {
    Assigned(AssignedCall),
    /// No agent was available; the call was dropped
    Dropped,
}

#[derive(Debug, Default)]
struct EngineCounters {
    received: AtomicU64,
    assigned: AtomicU64,
    dropped: AtomicU64,
    publish_failures: AtomicU64,
    persistence_failures: AtomicU64,
    requeue_failures: AtomicU64,
    duplicates: AtomicU64,
    malformed: AtomicU64,
}

/// Point-in-time copy of the engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub received: u64,
    pub assigned: u64,
    pub dropped: u64,
    pub publish_failures: u64,
    pub persistence_failures: u64,
    /// Agents that could not be put back in the pool after a call
    pub requeue_failures: u64,
    pub duplicates: u64,
    pub malformed: u64,
}

pub struct CallAssignmentEngine {
    pool: Arc<dyn AgentPool>,
    publisher: Arc<dyn EventPublisher>,
    store: Arc<dyn CallRecordStore>,
    mode: AssignmentMode,
    counters: EngineCounters,
}

impl CallAssignmentEngine {
    pub fn new(
        pool: Arc<dyn AgentPool>,
        publisher: Arc<dyn EventPublisher>,
        store: Arc<dyn CallRecordStore>,
        mode: AssignmentMode,
    ) -> Self {
        Self {
            pool,
            publisher,
            store,
            mode,
            counters: EngineCounters::default(),
        }
    }

    pub fn mode(&self) -> AssignmentMode {
        self.mode
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            received: c.received.load(Ordering::Relaxed),
            assigned: c.assigned.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            publish_failures: c.publish_failures.load(Ordering::Relaxed),
            persistence_failures: c.persistence_failures.load(Ordering::Relaxed),
            requeue_failures: c.requeue_failures.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
        }
    }

    /// Assign one inbound call
    ///
    /// Publish failures are returned to the caller after the agent has been
    /// put back in the pool. Persistence and requeue failures are logged,
    /// counted and swallowed.
    pub async fn assign(&self, call: &InboundCall) -> Result<AssignmentOutcome> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let agent_id = match self.take_agent().await? {
            Some(agent_id) => agent_id,
            None => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(call_id = %call.call_id, "No available agents, dropping call");
                return Ok(AssignmentOutcome::Dropped);
            }
        };

        let assigned = AssignedCall::assign(call, agent_id.clone());

        if let Err(e) = self.publish(&assigned).await {
            self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
            self.return_agent(&agent_id).await;
            return Err(e);
        }

        self.persist(&assigned).await;
        self.return_agent(&agent_id).await;

        self.counters.assigned.fetch_add(1, Ordering::Relaxed);
        info!(
            call_id = %assigned.call_id,
            agent_id = %agent_id,
            "📞 Assigned call to agent"
        );
        Ok(AssignmentOutcome::Assigned(assigned))
    }

    async fn take_agent(&self) -> Result<Option<AgentId>> {
        match self.mode {
            AssignmentMode::PopRequeue => self.pool.try_assign().await,
            AssignmentMode::AtomicRotate => self.pool.rotate().await,
        }
    }

    /// Put a popped agent back at the tail; a no-op in rotate mode
    async fn return_agent(&self, agent_id: &AgentId) {
        if self.mode != AssignmentMode::PopRequeue {
            return;
        }
        if let Err(e) = self.pool.requeue(agent_id).await {
            self.counters.requeue_failures.fetch_add(1, Ordering::Relaxed);
            error!(
                agent_id = %agent_id,
                error = %e,
                "Failed to return agent to the pool, it is out of rotation until the next bootstrap"
            );
        }
    }

    async fn publish(&self, assigned: &AssignedCall) -> Result<()> {
        let payload = serde_json::to_vec(assigned)
            .map_err(|e| CallEngineError::internal(format!("encode assigned call: {}", e)))?;

        let receipt = self
            .publisher
            .publish(topics::ASSIGNED_CALLS, &assigned.call_id, payload)
            .await?;
        debug!(
            call_id = %assigned.call_id,
            partition = receipt.partition,
            offset = receipt.offset,
            "Published assigned call"
        );
        Ok(())
    }

    async fn persist(&self, assigned: &AssignedCall) {
        match self.store.insert_assigned_call(assigned).await {
            Ok(_) => {}
            Err(CallEngineError::DuplicateCall(_)) => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                warn!(call_id = %assigned.call_id, "Call already recorded, likely a redelivery");
            }
            Err(e) => {
                self.counters.persistence_failures.fetch_add(1, Ordering::Relaxed);
                error!(call_id = %assigned.call_id, error = %e, "Failed to save assigned call");
            }
        }
    }

    /// Decode and assign one stream record
    ///
    /// Malformed payloads are counted, logged and reported as `Ok(None)`.
    pub async fn handle_record(&self, record: &StreamRecord) -> Result<Option<AssignmentOutcome>> {
        let call = match InboundCall::decode(&record.payload) {
            Ok(call) => call,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    key = record.key_str(),
                    offset = record.offset,
                    error = %e,
                    "Skipping malformed inbound call"
                );
                return Ok(None);
            }
        };

        self.assign(&call).await.map(Some)
    }

    /// Consume inbound calls until cancelled or the stream ends
    pub async fn run(&self, mut consumer: Box<dyn StreamConsumer>, cancel: CancellationToken) {
        info!("🚀 Call assignment loop started (group {}, {:?})", consumer.group_id(), self.mode);

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = consumer.next() => next,
            };

            let record = match next {
                Some(Ok(record)) => record,
                Some(Err(e)) => {
                    error!("Inbound call stream error: {}", e);
                    continue;
                }
                None => {
                    info!("Inbound call stream closed");
                    break;
                }
            };

            if let Err(e) = self.handle_record(&record).await {
                error!(key = record.key_str(), error = %e, "Failed to assign call");
            }
            if let Err(e) = consumer.ack(&record).await {
                warn!("Failed to mark inbound call offset {}: {}", record.offset, e);
            }
        }

        if let Err(e) = consumer.close().await {
            warn!("Failed to close inbound call consumer: {}", e);
        }
        info!("🛑 Call assignment loop stopped");
    }
}
