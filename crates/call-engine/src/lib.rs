//! # Call Engine
//!
//! Round-robin call distribution for a human-agent call center, plus the
//! plumbing that keeps agents' clients informed of their assignments.
//!
//! ## Overview
//!
//! - **Agent Pool Registry**: ordered list of agents eligible for the next call
//! - **Call Assignment Engine**: inbound call in, assigned call out, agent to the tail
//! - **Agent State Synchronizer**: keeps the pool in step with agent creation and deactivation
//! - **Delivery Bridge**: one private subscription per connected agent, filtered to its calls
//! - **Bootstrap Sync**: rebuilds the pool from the system of record on startup
//!
//! ## Architecture
//!
//! ```text
//!  incoming_calls ─┐                                ┌─▶ DeliveryBridge(a1) ─▶ ws a1
//!                  ▼                                │
//!       ┌─────────────────────┐   assigned_calls    ├─▶ DeliveryBridge(a2) ─▶ ws a2
//!       │ CallAssignmentEngine│ ────────────────────┤
//!       └─────────────────────┘                     └─▶ ...
//!            │   ▲      │
//!    pop/push│   │      └──▶ assigned_calls table
//!            ▼   │
//!       ┌─────────────┐        ┌────────────────────────┐
//!       │  AgentPool  │ ◀───── │ AgentStateSynchronizer │ ◀── agent_changes
//!       └─────────────┘        └────────────────────────┘
//!              ▲
//!              └── bootstrap_pool ◀── agents table
//! ```
//!
//! Every external system sits behind a trait with an in-process
//! implementation, so the whole pipeline runs in a single test:
//!
//! | concern          | trait                                   | production           | in-process             |
//! |------------------|-----------------------------------------|----------------------|------------------------|
//! | agent pool       | [`AgentPool`](pool::AgentPool)          | [`RedisAgentPool`](pool::RedisAgentPool) | [`InMemoryAgentPool`](pool::InMemoryAgentPool) |
//! | event streams    | [`EventPublisher`](broker::EventPublisher) / [`EventSubscriber`](broker::EventSubscriber) | `KafkaBroker` (feature `kafka`) | [`InMemoryBroker`](broker::InMemoryBroker) |
//! | system of record | [`CallRecordStore`](store::CallRecordStore) | [`PostgresCallStore`](store::PostgresCallStore) | [`InMemoryCallStore`](store::InMemoryCallStore) |
//! | agent connection | [`AgentSink`](delivery::AgentSink) / [`AgentSource`](delivery::AgentSource) | axum WebSocket | channel connection |
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use call_engine::prelude::*;
//!
//! # async fn example() -> call_engine::Result<()> {
//! let pool = Arc::new(InMemoryAgentPool::with_agents(["100001", "100002"]));
//! let broker = Arc::new(InMemoryBroker::new());
//! let store = Arc::new(InMemoryCallStore::new());
//!
//! let engine = CallAssignmentEngine::new(pool.clone(), broker, store, AssignmentMode::PopRequeue);
//! match engine.assign(&InboundCall::new("call-1", "+15550100")).await? {
//!     AssignmentOutcome::Assigned(call) => println!("📞 {} -> {}", call.call_id, call.assigned_agent_id),
//!     AssignmentOutcome::Dropped => println!("no agent available"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Delivery semantics
//!
//! Streams are at-least-once. A redelivered inbound call is assigned and
//! published again; the second insert into the system of record fails on the
//! unique call id and is logged. Clients must tolerate duplicate `new_call`
//! frames for the same call id. Calls arriving while the pool is empty are
//! dropped.

pub mod error;
pub mod config;
pub mod logging;
pub mod types;

pub mod pool;
pub mod broker;
pub mod store;

pub mod distributor;
pub mod delivery;
pub mod server;

pub use error::{CallEngineError, Result};
pub use config::CallEngineConfig;
pub use distributor::{Distributor, DistributorBuilder, DistributorStats};

/// Commonly used types and traits
///
/// ```
/// use call_engine::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{CallEngineConfig, CallEngineError, Result};

    pub use crate::config::AssignmentMode;
    pub use crate::types::{
        Agent, AgentChangeAction, AgentChangeEvent, AgentId, AssignedCall, CallStatus, InboundCall,
    };

    pub use crate::pool::{AgentPool, InMemoryAgentPool, RedisAgentPool};
    pub use crate::broker::{
        topics, EventPublisher, EventSubscriber, InMemoryBroker, StartPosition, StreamConsumer,
        StreamRecord, SubscriptionSpec,
    };
    pub use crate::store::{CallRecordStore, InMemoryCallStore, PostgresCallStore};

    pub use crate::distributor::{
        bootstrap_pool, AgentStateSynchronizer, AssignmentOutcome, CallAssignmentEngine,
        Distributor, DistributorBuilder, SyncOutcome,
    };
    pub use crate::delivery::{
        BridgeRegistry, BridgeSummary, CloseReason, ConnectionState, CredentialVerifier,
        DeliveryBridge, DeliveryMessage,
    };
}
