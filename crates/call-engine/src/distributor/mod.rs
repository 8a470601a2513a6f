//! # Distributor
//!
//! Runs the two long-lived consumer loops of the pipeline and owns their
//! lifecycle:
//!
//! ```text
//!            ┌──────────────────────────────┐
//!  incoming_calls ──▶ CallAssignmentEngine ──┼──▶ assigned_calls
//!            │             │    ▲            │
//!            │             ▼    │            │
//!            │          AgentPool ◀── bootstrap (system of record)
//!            │               ▲               │
//!  agent_changes ──▶ AgentStateSynchronizer  │
//!            └──────────────────────────────┘
//! ```
//!
//! The loops share the pool but nothing else; each has its own consumer group
//! so they progress independently. Both stop when the distributor's
//! cancellation token fires.
//!
//! ```
//! use std::sync::Arc;
//! use call_engine::broker::InMemoryBroker;
//! use call_engine::config::BrokerConfig;
//! use call_engine::distributor::Distributor;
//! use call_engine::pool::InMemoryAgentPool;
//! use call_engine::store::InMemoryCallStore;
//!
//! # async fn example() -> call_engine::Result<()> {
//! let broker = Arc::new(InMemoryBroker::new());
//! let mut distributor = Distributor::builder()
//!     .with_pool(Arc::new(InMemoryAgentPool::new()))
//!     .with_publisher(broker.clone())
//!     .with_subscriber(broker)
//!     .with_store(Arc::new(InMemoryCallStore::new()))
//!     .with_broker_config(BrokerConfig::default())
//!     .build()?;
//!
//! distributor.bootstrap().await?;
//! distributor.start().await?;
//! distributor.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod engine;
pub mod sync;

pub use self::bootstrap::bootstrap_pool;
pub use self::engine::{AssignmentOutcome, CallAssignmentEngine, EngineStats};
pub use self::sync::{AgentStateSynchronizer, SyncOutcome, SyncStats};

use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::{topics, EventPublisher, EventSubscriber, SubscriptionSpec};
use crate::config::{AssignmentMode, BrokerConfig};
use crate::error::{CallEngineError, Result};
use crate::pool::AgentPool;
use crate::store::CallRecordStore;

/// Counters of both loops, as served by the health endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DistributorStats {
    pub assignment: EngineStats,
    pub agent_sync: SyncStats,
}

pub struct Distributor {
    engine: Arc<CallAssignmentEngine>,
    synchronizer: Arc<AgentStateSynchronizer>,
    pool: Arc<dyn AgentPool>,
    subscriber: Arc<dyn EventSubscriber>,
    store: Arc<dyn CallRecordStore>,
    config: BrokerConfig,
    cancel: CancellationToken,
    engine_handle: Option<JoinHandle<()>>,
    sync_handle: Option<JoinHandle<()>>,
}

impl Distributor {
    pub fn builder() -> DistributorBuilder {
        DistributorBuilder::new()
    }

    pub fn engine(&self) -> &Arc<CallAssignmentEngine> {
        &self.engine
    }

    pub fn synchronizer(&self) -> &Arc<AgentStateSynchronizer> {
        &self.synchronizer
    }

    pub fn pool(&self) -> &Arc<dyn AgentPool> {
        &self.pool
    }

    pub fn is_running(&self) -> bool {
        self.engine_handle.as_ref().is_some_and(|h| !h.is_finished())
            || self.sync_handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stats(&self) -> DistributorStats {
        DistributorStats {
            assignment: self.engine.stats(),
            agent_sync: self.synchronizer.stats(),
        }
    }

    /// Rebuild the pool from the system of record
    pub async fn bootstrap(&self) -> Result<usize> {
        bootstrap_pool(self.store.as_ref(), self.pool.as_ref()).await
    }

    /// Subscribe both consumer groups and spawn the loops
    ///
    /// Subscription failures are returned before anything is spawned.
    pub async fn start(&mut self) -> Result<()> {
        if self.engine_handle.is_some() || self.sync_handle.is_some() {
            return Err(CallEngineError::internal("distributor already started"));
        }

        let calls = self
            .subscriber
            .subscribe(SubscriptionSpec::durable(topics::INCOMING_CALLS, &self.config.group_id))
            .await?;
        let changes = self
            .subscriber
            .subscribe(SubscriptionSpec::durable(
                topics::AGENT_CHANGES,
                &self.config.agent_sync_group_id,
            ))
            .await?;

        let engine = self.engine.clone();
        let cancel = self.cancel.child_token();
        self.engine_handle = Some(tokio::spawn(async move {
            engine.run(calls, cancel).await;
        }));

        let synchronizer = self.synchronizer.clone();
        let cancel = self.cancel.child_token();
        self.sync_handle = Some(tokio::spawn(async move {
            synchronizer.run(changes, cancel).await;
        }));

        info!(
            "✅ Distributor started (calls group {}, agent sync group {})",
            self.config.group_id, self.config.agent_sync_group_id
        );
        Ok(())
    }

    /// Cancel both loops and wait for them to release their consumers
    pub async fn stop(&mut self) {
        info!("🛑 Stopping distributor...");
        self.cancel.cancel();

        for handle in [self.engine_handle.take(), self.sync_handle.take()].into_iter().flatten() {
            if let Err(e) = handle.await {
                warn!("Distributor task ended abnormally: {}", e);
            }
        }
        info!("✅ Distributor stopped");
    }
}

/// Builder for [`Distributor`]
pub struct DistributorBuilder {
    pool: Option<Arc<dyn AgentPool>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    subscriber: Option<Arc<dyn EventSubscriber>>,
    store: Option<Arc<dyn CallRecordStore>>,
    config: BrokerConfig,
    mode: AssignmentMode,
    cancel: Option<CancellationToken>,
}

impl DistributorBuilder {
    pub fn new() -> Self {
        Self {
            pool: None,
            publisher: None,
            subscriber: None,
            store: None,
            config: BrokerConfig::default(),
            mode: AssignmentMode::default(),
            cancel: None,
        }
    }

    pub fn with_pool(mut self, pool: Arc<dyn AgentPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_subscriber(mut self, subscriber: Arc<dyn EventSubscriber>) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CallRecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_broker_config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_assignment_mode(mut self, mode: AssignmentMode) -> Self {
        self.mode = mode;
        self
    }

    /// Stop the loops when this token (or a parent) is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn build(self) -> Result<Distributor> {
        let missing = |what: &str| CallEngineError::configuration(format!("{} not provided", what));
        let pool = self.pool.ok_or_else(|| missing("agent pool"))?;
        let publisher = self.publisher.ok_or_else(|| missing("event publisher"))?;
        let subscriber = self.subscriber.ok_or_else(|| missing("event subscriber"))?;
        let store = self.store.ok_or_else(|| missing("call record store"))?;

        let engine = Arc::new(CallAssignmentEngine::new(
            pool.clone(),
            publisher,
            store.clone(),
            self.mode,
        ));
        let synchronizer = Arc::new(AgentStateSynchronizer::new(pool.clone()));

        Ok(Distributor {
            engine,
            synchronizer,
            pool,
            subscriber,
            store,
            config: self.config,
            cancel: self.cancel.unwrap_or_default(),
            engine_handle: None,
            sync_handle: None,
        })
    }
}

impl Default for DistributorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
