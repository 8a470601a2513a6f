//! # Per-Agent Delivery
//!
//! Every connected agent gets a [`DeliveryBridge`]: a private consumer group
//! on the assigned-call stream, a relay that forwards the calls addressed to
//! that agent, and a reader that watches the connection for closure.
//!
//! ```text
//!   assigned_calls ──▶ group ws-{agent}-{uuid} ──▶ filter(agent) ──▶ AgentSink
//!                                                        ▲
//!                           AgentSource (peer close) ────┘ cancels
//! ```
//!
//! The transport is reached through [`AgentSink`] and [`AgentSource`], so the
//! bridge runs the same way over an axum WebSocket ([`ws`]) and over the
//! channel-backed connection used in tests.

pub mod auth;
pub mod bridge;
pub mod channel;
pub mod ws;

pub use self::auth::{AgentClaims, CredentialVerifier};
pub use self::bridge::{BridgeSummary, CloseReason, DeliveryBridge, DEFAULT_GROUP_PREFIX};
pub use self::channel::{channel_connection, ChannelPeer};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{AgentId, AssignedCall};

/// Lifecycle of one agent connection; `Closed` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Open => write!(f, "OPEN"),
            ConnectionState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Frames sent to an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryMessage {
    Connected { message: String },
    NewCall { data: AssignedCall },
    Error { message: String },
}

impl DeliveryMessage {
    pub fn connected(agent_id: &AgentId) -> Self {
        Self::Connected {
            message: format!("Connected as agent {}", agent_id),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Frames received from an agent
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Data(String),
    Close,
}

/// Outbound half of an agent connection
#[async_trait]
pub trait AgentSink: Send {
    async fn send(&mut self, message: &DeliveryMessage) -> Result<()>;

    /// Close the connection; errors are ignored
    async fn close(&mut self);
}

/// Inbound half of an agent connection
#[async_trait]
pub trait AgentSource: Send {
    /// Next frame from the peer, `None` once the connection is gone
    async fn next_frame(&mut self) -> Option<Result<ClientFrame>>;
}

/// Live bridges per agent
///
/// An agent may hold several connections at once; each gets its own bridge
/// and is counted separately.
#[derive(Debug, Clone, Default)]
pub struct BridgeRegistry {
    live: Arc<DashMap<AgentId, usize>>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a bridge until the returned guard is dropped
    pub fn register(&self, agent_id: &AgentId) -> BridgeRegistration {
        *self.live.entry(agent_id.clone()).or_insert(0) += 1;
        BridgeRegistration {
            registry: self.clone(),
            agent_id: agent_id.clone(),
        }
    }

    fn release(&self, agent_id: &AgentId) {
        self.live.remove_if_mut(agent_id, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }

    pub fn connections(&self, agent_id: &AgentId) -> usize {
        self.live.get(agent_id).map(|c| *c).unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.live.iter().map(|e| *e.value()).sum()
    }

    pub fn agents(&self) -> usize {
        self.live.len()
    }

    pub fn snapshot(&self) -> BTreeMap<String, usize> {
        self.live
            .iter()
            .map(|e| (e.key().to_string(), *e.value()))
            .collect()
    }
}

/// Keeps one bridge counted in a [`BridgeRegistry`]
#[derive(Debug)]
pub struct BridgeRegistration {
    registry: BridgeRegistry,
    agent_id: AgentId,
}

impl Drop for BridgeRegistration {
    fn drop(&mut self) {
        self.registry.release(&self.agent_id);
    }
}
