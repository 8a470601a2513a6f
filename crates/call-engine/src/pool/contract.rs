//! Behaviour every [`AgentPool`] backend must share
//!
//! Each check starts by rebuilding the pool, so a backend can be handed in
//! with leftover contents.

use super::AgentPool;
use crate::types::AgentId;

fn ids(agents: &[&str]) -> Vec<AgentId> {
    agents.iter().map(|a| AgentId::from(*a)).collect()
}

async fn contents(pool: &dyn AgentPool) -> Vec<String> {
    pool.snapshot()
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.0)
        .collect()
}

pub(crate) async fn check_agent_pool(pool: &dyn AgentPool) {
    // empty pool
    pool.rebuild(&[]).await.unwrap();
    assert!(pool.try_assign().await.unwrap().is_none());
    assert!(pool.rotate().await.unwrap().is_none());
    assert!(contents(pool).await.is_empty());

    // rebuild keeps order and replaces stale entries
    pool.rebuild(&ids(&["stale", "a1"])).await.unwrap();
    pool.rebuild(&ids(&["a1", "a2", "a3"])).await.unwrap();
    assert_eq!(contents(pool).await, ["a1", "a2", "a3"]);

    // pop then requeue rotates head to tail
    let head = pool.try_assign().await.unwrap().unwrap();
    assert_eq!(head.as_str(), "a1");
    assert_eq!(contents(pool).await, ["a2", "a3"]);
    pool.requeue(&head).await.unwrap();
    assert_eq!(contents(pool).await, ["a2", "a3", "a1"]);

    // rotate is the same move in one step
    assert_eq!(pool.rotate().await.unwrap().unwrap().as_str(), "a2");
    assert_eq!(contents(pool).await, ["a3", "a1", "a2"]);

    // remove deletes every occurrence and reports the count
    pool.requeue(&AgentId::from("a1")).await.unwrap();
    pool.requeue(&AgentId::from("a1")).await.unwrap();
    assert_eq!(pool.remove(&AgentId::from("a1")).await.unwrap(), 3);
    assert_eq!(contents(pool).await, ["a3", "a2"]);
    assert_eq!(pool.remove(&AgentId::from("a9")).await.unwrap(), 0);

    // add_if_absent appends once
    assert!(pool.add_if_absent(&AgentId::from("a4")).await.unwrap());
    assert!(!pool.add_if_absent(&AgentId::from("a4")).await.unwrap());
    assert!(!pool.add_if_absent(&AgentId::from("a3")).await.unwrap());
    assert_eq!(contents(pool).await, ["a3", "a2", "a4"]);

    // a single agent rotates onto itself
    pool.rebuild(&ids(&["solo"])).await.unwrap();
    assert_eq!(pool.rotate().await.unwrap().unwrap().as_str(), "solo");
    assert_eq!(contents(pool).await, ["solo"]);

    // an empty rebuild clears the pool
    pool.rebuild(&[]).await.unwrap();
    assert!(contents(pool).await.is_empty());
}
