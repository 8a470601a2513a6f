//! # Agent Pool Registry
//!
//! The ordered list of agent ids eligible for the next call. The head of the
//! list receives the next call; the assignment engine moves it to the tail
//! afterwards, which is what makes distribution round-robin.
//!
//! Every operation goes straight to the backing store. Nothing is cached in
//! process, so a restarted component always sees the shared view.
//!
//! ## Atomicity
//!
//! Each primitive is atomic on its own. `try_assign` followed by `requeue` is
//! not: two concurrent engines can interleave between the pop and the push
//! and break strict rotation order. The pipeline runs a single assignment
//! engine, so the two-step form is the default. [`AgentPool::rotate`] is the
//! single-step alternative for deployments that opt into it.
//!
//! ## Backends
//!
//! - [`RedisAgentPool`]: a Redis list under a well-known key
//! - [`InMemoryAgentPool`]: a `VecDeque` behind a mutex, same semantics

pub mod memory;
pub mod redis;

#[cfg(test)]
pub(crate) mod contract;

pub use self::memory::InMemoryAgentPool;
pub use self::redis::RedisAgentPool;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::AgentId;

/// Well-known key of the shared list holding the pool
pub const AVAILABLE_AGENTS_KEY: &str = "available_agents";

/// Ordered pool of agents eligible for round-robin assignment
#[async_trait]
pub trait AgentPool: Send + Sync {
    /// Remove and return the head of the pool, or `None` when it is empty
    async fn try_assign(&self) -> Result<Option<AgentId>>;

    /// Append an agent at the tail
    async fn requeue(&self, agent_id: &AgentId) -> Result<()>;

    /// Delete every occurrence of an agent, returning how many were removed
    async fn remove(&self, agent_id: &AgentId) -> Result<usize>;

    /// Append an agent only if it is not already pooled; `true` if appended
    async fn add_if_absent(&self, agent_id: &AgentId) -> Result<bool>;

    /// Clear the pool and repopulate it in the given order
    async fn rebuild(&self, agent_ids: &[AgentId]) -> Result<()>;

    /// Move the head to the tail in one step and return it
    async fn rotate(&self) -> Result<Option<AgentId>>;

    /// Current contents, head first
    async fn snapshot(&self) -> Result<Vec<AgentId>>;
}
