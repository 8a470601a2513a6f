//! In-process system of record for tests and local runs

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use super::CallRecordStore;
use crate::error::{CallEngineError, Result};
use crate::types::{Agent, AgentId, AssignedCall, CallStatus};

#[derive(Debug, Default)]
pub struct InMemoryCallStore {
    agents: Mutex<Vec<Agent>>,
    calls: DashMap<String, AssignedCall>,
    next_id: AtomicI64,
    fail_writes: AtomicBool,
}

impl InMemoryCallStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an agent row
    pub fn upsert_agent(&self, mut agent: Agent) {
        let now = Utc::now();
        agent.created_at.get_or_insert(now);
        agent.updated_at = Some(now);

        let mut agents = self.agents.lock();
        match agents.iter_mut().find(|a| a.id == agent.id) {
            Some(existing) => *existing = agent,
            None => agents.push(agent),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.len()
    }

    pub fn get_call(&self, call_id: &str) -> Option<AssignedCall> {
        self.calls.get(call_id).map(|c| c.clone())
    }

    /// Make every subsequent write fail until switched off again
    pub fn set_write_failure(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CallEngineError::database("store is not accepting writes"));
        }
        Ok(())
    }
}

#[async_trait]
impl CallRecordStore for InMemoryCallStore {
    async fn active_agents(&self) -> Result<Vec<Agent>> {
        Ok(self
            .agents
            .lock()
            .iter()
            .filter(|a| a.is_active)
            .cloned()
            .collect())
    }

    async fn insert_assigned_call(&self, call: &AssignedCall) -> Result<AssignedCall> {
        self.check_writable()?;

        match self.calls.entry(call.call_id.clone()) {
            Entry::Occupied(_) => Err(CallEngineError::DuplicateCall(call.call_id.clone())),
            Entry::Vacant(slot) => {
                let now = Utc::now();
                let mut stored = call.clone();
                stored.id = Some(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
                stored.created_at = Some(now);
                stored.updated_at = Some(now);
                slot.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn assigned_calls_for_agent(&self, agent_id: &AgentId) -> Result<Vec<AssignedCall>> {
        let mut calls: Vec<AssignedCall> = self
            .calls
            .iter()
            .filter(|c| c.is_for(agent_id))
            .map(|c| c.clone())
            .collect();
        calls.sort_by_key(|c| c.id);
        Ok(calls)
    }

    async fn complete_call(
        &self,
        call_id: &str,
        agent_id: &AgentId,
        status: CallStatus,
        notes: &str,
    ) -> Result<AssignedCall> {
        self.check_writable()?;

        let mut call = self
            .calls
            .get_mut(call_id)
            .ok_or_else(|| CallEngineError::NotFound(format!("call {}", call_id)))?;

        if !call.is_for(agent_id) {
            return Err(CallEngineError::Authorization(format!(
                "call {} is not assigned to agent {}",
                call_id, agent_id
            )));
        }

        call.status = status;
        if !notes.is_empty() {
            call.notes = notes.to_string();
        }
        call.updated_at = Some(Utc::now());
        Ok(call.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InboundCall;

    fn assigned(call_id: &str, agent: &str) -> AssignedCall {
        AssignedCall::assign(&InboundCall::new(call_id, "555"), AgentId::from(agent))
    }

    #[tokio::test]
    async fn test_duplicate_call_id_is_rejected() {
        let store = InMemoryCallStore::new();
        let first = store.insert_assigned_call(&assigned("c1", "a1")).await.unwrap();
        assert_eq!(first.id, Some(1));

        let err = store.insert_assigned_call(&assigned("c1", "a2")).await.unwrap_err();
        assert!(matches!(err, CallEngineError::DuplicateCall(_)));
        assert_eq!(store.call_count(), 1);
        assert_eq!(store.get_call("c1").unwrap().assigned_agent_id.as_str(), "a1");
    }

    #[tokio::test]
    async fn test_active_agents_excludes_deactivated() {
        let store = InMemoryCallStore::new();
        store.upsert_agent(Agent::new("100001", "Ana"));
        store.upsert_agent(Agent::new("100002", "Ben"));
        store.upsert_agent(Agent::new("100001", "Ana").deactivated());

        let active = store.active_agents().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id.as_str(), "100002");
    }

    #[tokio::test]
    async fn test_complete_call_checks_ownership() {
        let store = InMemoryCallStore::new();
        store.insert_assigned_call(&assigned("c1", "a1")).await.unwrap();

        let err = store
            .complete_call("c1", &AgentId::from("a2"), CallStatus::Completed, "")
            .await
            .unwrap_err();
        assert!(matches!(err, CallEngineError::Authorization(_)));

        let err = store
            .complete_call("missing", &AgentId::from("a1"), CallStatus::Completed, "")
            .await
            .unwrap_err();
        assert!(matches!(err, CallEngineError::NotFound(_)));

        let done = store
            .complete_call("c1", &AgentId::from("a1"), CallStatus::Completed, "resolved")
            .await
            .unwrap();
        assert_eq!(done.status, CallStatus::Completed);
        assert_eq!(done.notes, "resolved");
    }

    #[tokio::test]
    async fn test_calls_for_agent_in_insert_order() {
        let store = InMemoryCallStore::new();
        for (call, agent) in [("c1", "a1"), ("c2", "a2"), ("c3", "a1")] {
            store.insert_assigned_call(&assigned(call, agent)).await.unwrap();
        }

        let calls = store.assigned_calls_for_agent(&AgentId::from("a1")).await.unwrap();
        let ids: Vec<_> = calls.iter().map(|c| c.call_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c3"]);
    }
}
