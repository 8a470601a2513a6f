//! Startup rebuild of the agent pool from the system of record

use tracing::{info, warn};

use crate::error::Result;
use crate::pool::AgentPool;
use crate::store::CallRecordStore;
use crate::types::AgentId;

/// Replace the pool with the active agents, oldest first
///
/// This is a full rebuild, not a merge: ids pooled by a previous run that are
/// no longer active disappear, and an empty active set leaves an empty pool.
/// Returns the number of pooled agents.
pub async fn bootstrap_pool(store: &dyn CallRecordStore, pool: &dyn AgentPool) -> Result<usize> {
    let agents = store.active_agents().await?;

    let mut ids: Vec<AgentId> = Vec::with_capacity(agents.len());
    for agent in agents {
        if !ids.contains(&agent.id) {
            ids.push(agent.id);
        }
    }

    pool.rebuild(&ids).await?;

    if ids.is_empty() {
        warn!("No active agents found, agent pool is empty");
    } else {
        info!("✅ Synced {} active agents to the pool", ids.len());
    }
    Ok(ids.len())
}
