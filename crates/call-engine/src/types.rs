//! Core types shared by the distributor and the delivery bridge
//!
//! Everything here travels over an event stream as JSON, so the serde shapes
//! are part of the wire contract: snake_case field names, lowercase call
//! status, and agent snapshots without credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CallEngineError, Result};

/// Agent identifier as stored in the pool and the system of record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for AgentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for AgentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A call received by the call center, before any agent is chosen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundCall {
    pub call_id: String,
    pub customer_number: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl InboundCall {
    pub fn new(call_id: impl Into<String>, customer_number: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            customer_number: customer_number.into(),
            timestamp: Utc::now(),
        }
    }

    /// Decode a stream payload, rejecting records without a call id
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let call: Self = serde_json::from_slice(payload)?;
        if call.call_id.is_empty() {
            return Err(CallEngineError::invalid_event("inbound call has an empty call_id"));
        }
        Ok(call)
    }
}

/// Lifecycle status of an assigned call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Assigned,
    Completed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Assigned => "assigned",
            CallStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "assigned" => Some(CallStatus::Assigned),
            "completed" => Some(CallStatus::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A call bound to the agent that will handle it
///
/// Created once per call id by the assignment engine. The store assigns `id`,
/// `created_at` and `updated_at`; they are absent on freshly published events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub call_id: String,
    pub customer_number: String,
    pub timestamp: DateTime<Utc>,
    pub assigned_agent_id: AgentId,
    pub status: CallStatus,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl AssignedCall {
    /// Bind an inbound call to an agent, stamped with the assignment time
    pub fn assign(call: &InboundCall, agent_id: AgentId) -> Self {
        Self {
            id: None,
            call_id: call.call_id.clone(),
            customer_number: call.customer_number.clone(),
            timestamp: Utc::now(),
            assigned_agent_id: agent_id,
            status: CallStatus::Assigned,
            notes: String::new(),
            created_at: None,
            updated_at: None,
        }
    }

    /// Decode a stream payload, rejecting records that name no agent
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let call: Self = serde_json::from_slice(payload)?;
        if call.call_id.is_empty() || call.assigned_agent_id.is_empty() {
            return Err(CallEngineError::invalid_event(
                "assigned call is missing call_id or assigned_agent_id",
            ));
        }
        Ok(call)
    }

    pub fn is_for(&self, agent_id: &AgentId) -> bool {
        &self.assigned_agent_id == agent_id
    }
}

/// Agent snapshot as published on the agent change stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn new(id: impl Into<AgentId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_admin: false,
            is_active: true,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn deactivated(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// What happened to an agent, as encoded in the change-stream key prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentChangeAction {
    Create,
    Delete,
}

impl AgentChangeAction {
    pub fn key_prefix(&self) -> &'static str {
        match self {
            AgentChangeAction::Create => "create_agent",
            AgentChangeAction::Delete => "delete_agent",
        }
    }

    pub fn from_key_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "create_agent" => Some(AgentChangeAction::Create),
            "delete_agent" => Some(AgentChangeAction::Delete),
            _ => None,
        }
    }
}

/// A creation or deactivation of an agent
#[derive(Debug, Clone, PartialEq)]
pub struct AgentChangeEvent {
    pub action: AgentChangeAction,
    pub agent: Agent,
}

impl AgentChangeEvent {
    pub fn created(agent: Agent) -> Self {
        Self { action: AgentChangeAction::Create, agent }
    }

    pub fn deleted(agent: Agent) -> Self {
        Self { action: AgentChangeAction::Delete, agent }
    }

    /// Stream key: `{create|delete}_agent:{agent_id}`
    pub fn key(&self) -> String {
        format!("{}:{}", self.action.key_prefix(), self.agent.id)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.agent)?)
    }

    /// Parse a change-stream record
    ///
    /// The key is split on its first `:`. A key without a separator, an
    /// unknown action prefix, an undecodable payload, or a key id that
    /// disagrees with the payload id are all reported as `InvalidEvent`.
    pub fn decode(key: &str, payload: &[u8]) -> Result<Self> {
        let (prefix, key_id) = key
            .split_once(':')
            .ok_or_else(|| CallEngineError::invalid_event(format!("invalid key format: {}", key)))?;

        let action = AgentChangeAction::from_key_prefix(prefix)
            .ok_or_else(|| CallEngineError::invalid_event(format!("unknown action: {}", prefix)))?;

        let agent: Agent = serde_json::from_slice(payload)?;
        if agent.id.is_empty() {
            return Err(CallEngineError::invalid_event("agent snapshot has an empty id"));
        }
        if !key_id.is_empty() && key_id != agent.id.as_str() {
            return Err(CallEngineError::invalid_event(format!(
                "key id {} does not match payload id {}",
                key_id, agent.id
            )));
        }

        Ok(Self { action, agent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assigned_call_wire_shape() {
        let inbound = InboundCall::new("c1", "+15550100");
        let assigned = AssignedCall::assign(&inbound, AgentId::from("123456"));

        let json = serde_json::to_value(&assigned).unwrap();
        assert_eq!(json["call_id"], "c1");
        assert_eq!(json["assigned_agent_id"], "123456");
        assert_eq!(json["status"], "assigned");
        assert_eq!(json["notes"], "");
        assert!(json.get("id").is_none());
    }

    #[test]
    fn test_inbound_call_without_timestamp_gets_one() {
        let call = InboundCall::decode(br#"{"call_id":"c9","customer_number":"555"}"#).unwrap();
        assert_eq!(call.call_id, "c9");
        assert!(call.timestamp <= Utc::now());
    }

    #[test]
    fn test_inbound_call_with_empty_id_is_invalid() {
        let err = InboundCall::decode(br#"{"call_id":"","customer_number":"555"}"#).unwrap_err();
        assert!(err.is_data_error());
    }

    #[test]
    fn test_assigned_call_decode_accepts_store_fields() {
        let payload = br#"{
            "id": 7,
            "call_id": "c1",
            "customer_number": "555",
            "timestamp": "2024-05-01T10:00:00Z",
            "assigned_agent_id": "a1b2c3",
            "status": "completed",
            "notes": "resolved",
            "created_at": "2024-05-01T10:00:00Z",
            "updated_at": "2024-05-01T10:05:00Z"
        }"#;
        let call = AssignedCall::decode(payload).unwrap();
        assert_eq!(call.id, Some(7));
        assert_eq!(call.status, CallStatus::Completed);
        assert!(call.is_for(&AgentId::from("a1b2c3")));
    }

    #[test]
    fn test_agent_change_key_round_trip() {
        let event = AgentChangeEvent::created(Agent::new("482913", "Dana"));
        assert_eq!(event.key(), "create_agent:482913");

        let decoded = AgentChangeEvent::decode(&event.key(), &event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_agent_change_rejects_bad_keys() {
        let payload = serde_json::to_vec(&Agent::new("1", "x")).unwrap();

        assert!(AgentChangeEvent::decode("create_agent", &payload).unwrap_err().is_data_error());
        assert!(AgentChangeEvent::decode("rename_agent:1", &payload).unwrap_err().is_data_error());
        assert!(AgentChangeEvent::decode("delete_agent:2", &payload).unwrap_err().is_data_error());
        assert!(AgentChangeEvent::decode("delete_agent:1", b"[]").unwrap_err().is_data_error());
    }

    #[test]
    fn test_agent_snapshot_defaults_inactive_when_flag_missing() {
        let event = AgentChangeEvent::decode("create_agent:42", br#"{"id":"42","name":"Lee"}"#).unwrap();
        assert_eq!(event.action, AgentChangeAction::Create);
        assert!(!event.agent.is_active);
    }
}
