//! # System of Record
//!
//! Point reads and writes against the durable `agents` and `assigned_calls`
//! tables. The pipeline needs very little from it: the active agent set for
//! bootstrap, one insert per assignment, and the status transition agents
//! perform when they finish a call.
//!
//! `call_id` is unique across assigned calls. A second insert for the same
//! call id fails with [`CallEngineError::DuplicateCall`], which is how a
//! redelivered inbound call shows up here.
//!
//! [`CallEngineError::DuplicateCall`]: crate::error::CallEngineError::DuplicateCall

pub mod memory;
pub mod postgres;

pub use self::memory::InMemoryCallStore;
pub use self::postgres::PostgresCallStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Agent, AgentId, AssignedCall, CallStatus};

#[async_trait]
pub trait CallRecordStore: Send + Sync {
    /// Active agents, oldest first
    async fn active_agents(&self) -> Result<Vec<Agent>>;

    /// Record an assignment; fails with `DuplicateCall` if the call id exists
    async fn insert_assigned_call(&self, call: &AssignedCall) -> Result<AssignedCall>;

    /// Calls assigned to an agent, oldest first
    async fn assigned_calls_for_agent(&self, agent_id: &AgentId) -> Result<Vec<AssignedCall>>;

    /// Move a call to a new status on behalf of the agent that owns it
    ///
    /// Fails with `NotFound` for an unknown call id and `Authorization` when
    /// the call is assigned to someone else. Empty `notes` keep the existing
    /// notes.
    async fn complete_call(
        &self,
        call_id: &str,
        agent_id: &AgentId,
        status: CallStatus,
        notes: &str,
    ) -> Result<AssignedCall>;
}
