//! Agent pool synchronization from agent lifecycle events
//!
//! | action | is_active | pool effect      |
//! |--------|-----------|------------------|
//! | create | true      | add if absent    |
//! | create | false     | none             |
//! | delete | any       | remove all       |
//!
//! Every effect is idempotent, so redelivered events converge to the same pool.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{StreamConsumer, StreamRecord};
use crate::error::Result;
use crate::pool::AgentPool;
use crate::types::{AgentChangeAction, AgentChangeEvent};

/// What applying one change event did to the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Added,
    AlreadyPresent,
    SkippedInactive,
    Removed { count: usize },
    NotPresent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub received: u64,
    pub added: u64,
    pub removed: u64,
    pub ignored: u64,
    pub malformed: u64,
    pub errors: u64,
}

#[derive(Debug, Default)]
struct SyncCounters {
    received: AtomicU64,
    added: AtomicU64,
    removed: AtomicU64,
    ignored: AtomicU64,
    malformed: AtomicU64,
    errors: AtomicU64,
}

pub struct AgentStateSynchronizer {
    pool: Arc<dyn AgentPool>,
    counters: SyncCounters,
}

impl AgentStateSynchronizer {
    pub fn new(pool: Arc<dyn AgentPool>) -> Self {
        Self {
            pool,
            counters: SyncCounters::default(),
        }
    }

    pub fn stats(&self) -> SyncStats {
        let c = &self.counters;
        SyncStats {
            received: c.received.load(Ordering::Relaxed),
            added: c.added.load(Ordering::Relaxed),
            removed: c.removed.load(Ordering::Relaxed),
            ignored: c.ignored.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
        }
    }

    /// Apply one decoded change event to the pool
    pub async fn apply(&self, event: &AgentChangeEvent) -> Result<SyncOutcome> {
        let agent_id = &event.agent.id;

        let outcome = match event.action {
            AgentChangeAction::Create if !event.agent.is_active => SyncOutcome::SkippedInactive,
            AgentChangeAction::Create => {
                if self.pool.add_if_absent(agent_id).await? {
                    SyncOutcome::Added
                } else {
                    SyncOutcome::AlreadyPresent
                }
            }
            AgentChangeAction::Delete => match self.pool.remove(agent_id).await? {
                0 => SyncOutcome::NotPresent,
                count => SyncOutcome::Removed { count },
            },
        };

        match outcome {
            SyncOutcome::Added => {
                self.counters.added.fetch_add(1, Ordering::Relaxed);
                info!(agent_id = %agent_id, "➕ Added agent to pool");
            }
            SyncOutcome::Removed { count } => {
                self.counters.removed.fetch_add(1, Ordering::Relaxed);
                info!(agent_id = %agent_id, count, "➖ Removed agent from pool");
            }
            SyncOutcome::SkippedInactive => {
                self.counters.ignored.fetch_add(1, Ordering::Relaxed);
                info!(agent_id = %agent_id, "Agent is not active, skipping");
            }
            SyncOutcome::AlreadyPresent | SyncOutcome::NotPresent => {
                self.counters.ignored.fetch_add(1, Ordering::Relaxed);
                debug!(agent_id = %agent_id, ?outcome, "Pool already up to date");
            }
        }

        if matches!(outcome, SyncOutcome::Added | SyncOutcome::Removed { .. }) {
            self.log_pool().await;
        }
        Ok(outcome)
    }

    async fn log_pool(&self) {
        match self.pool.snapshot().await {
            Ok(agents) => {
                let ids: Vec<&str> = agents.iter().map(|a| a.as_str()).collect();
                debug!("Available agents now: {:?}", ids);
            }
            Err(e) => debug!("Could not read pool after update: {}", e),
        }
    }

    /// Decode and apply one stream record
    ///
    /// Malformed records are counted, logged and reported as `Ok(None)`.
    pub async fn handle_record(&self, record: &StreamRecord) -> Result<Option<SyncOutcome>> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let event = match AgentChangeEvent::decode(record.key_str(), &record.payload) {
            Ok(event) => event,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    key = record.key_str(),
                    offset = record.offset,
                    error = %e,
                    "Skipping malformed agent change"
                );
                return Ok(None);
            }
        };

        debug!(key = record.key_str(), "Processing agent change");
        match self.apply(&event).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Consume agent changes until cancelled or the stream ends
    pub async fn run(&self, mut consumer: Box<dyn StreamConsumer>, cancel: CancellationToken) {
        info!("🚀 Agent sync loop started (group {})", consumer.group_id());

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = consumer.next() => next,
            };

            let record = match next {
                Some(Ok(record)) => record,
                Some(Err(e)) => {
                    error!("Agent change stream error: {}", e);
                    continue;
                }
                None => {
                    info!("Agent change stream closed");
                    break;
                }
            };

            if let Err(e) = self.handle_record(&record).await {
                error!(key = record.key_str(), error = %e, "Failed to apply agent change");
            }
            if let Err(e) = consumer.ack(&record).await {
                warn!("Failed to mark agent change offset {}: {}", record.offset, e);
            }
        }

        if let Err(e) = consumer.close().await {
            warn!("Failed to close agent change consumer: {}", e);
        }
        info!("🛑 Agent sync loop stopped");
    }
}
