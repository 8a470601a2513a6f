//! In-process agent pool
//!
//! Mirrors the Redis list semantics exactly so tests and single-process runs
//! exercise the same ordering rules as production.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::debug;

use super::AgentPool;
use crate::error::Result;
use crate::types::AgentId;

#[derive(Debug, Default)]
pub struct InMemoryAgentPool {
    agents: Mutex<VecDeque<AgentId>>,
}

impl InMemoryAgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool pre-populated in the given order
    pub fn with_agents<I, A>(agents: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<AgentId>,
    {
        Self {
            agents: Mutex::new(agents.into_iter().map(Into::into).collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.agents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.lock().is_empty()
    }
}

#[async_trait]
impl AgentPool for InMemoryAgentPool {
    async fn try_assign(&self) -> Result<Option<AgentId>> {
        Ok(self.agents.lock().pop_front())
    }

    async fn requeue(&self, agent_id: &AgentId) -> Result<()> {
        self.agents.lock().push_back(agent_id.clone());
        Ok(())
    }

    async fn remove(&self, agent_id: &AgentId) -> Result<usize> {
        let mut agents = self.agents.lock();
        let before = agents.len();
        agents.retain(|a| a != agent_id);
        Ok(before - agents.len())
    }

    async fn add_if_absent(&self, agent_id: &AgentId) -> Result<bool> {
        let mut agents = self.agents.lock();
        if agents.contains(agent_id) {
            return Ok(false);
        }
        agents.push_back(agent_id.clone());
        Ok(true)
    }

    async fn rebuild(&self, agent_ids: &[AgentId]) -> Result<()> {
        let mut agents = self.agents.lock();
        agents.clear();
        agents.extend(agent_ids.iter().cloned());
        debug!("Rebuilt in-memory pool with {} agents", agents.len());
        Ok(())
    }

    async fn rotate(&self) -> Result<Option<AgentId>> {
        let mut agents = self.agents.lock();
        let head = agents.pop_front();
        if let Some(agent) = &head {
            agents.push_back(agent.clone());
        }
        Ok(head)
    }

    async fn snapshot(&self) -> Result<Vec<AgentId>> {
        Ok(self.agents.lock().iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::contract::check_agent_pool;

    #[tokio::test]
    async fn test_in_memory_pool_behaves_like_a_list() {
        check_agent_pool(&InMemoryAgentPool::with_agents(["leftover"])).await;
    }

    #[tokio::test]
    async fn test_with_agents_preserves_order() {
        let pool = InMemoryAgentPool::with_agents(["a2", "a1", "a3"]);
        assert_eq!(pool.len(), 3);
        let ids: Vec<AgentId> = pool.snapshot().await.unwrap();
        assert_eq!(ids, vec![AgentId::from("a2"), AgentId::from("a1"), AgentId::from("a3")]);
    }
}
