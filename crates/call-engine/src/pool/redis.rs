//! Redis-backed agent pool
//!
//! The pool is a plain Redis list of agent id strings. Each trait method maps
//! to one command, one script, or one `MULTI` pipeline, so every primitive is
//! atomic on the server.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{IntoConnectionInfo, Script};
use tracing::{debug, info};

use super::AgentPool;
use crate::error::Result;
use crate::types::AgentId;

/// Appends ARGV[1] to KEYS[1] unless an equal element is already present
const ADD_IF_ABSENT_SCRIPT: &str = r#"
local items = redis.call('LRANGE', KEYS[1], 0, -1)
for _, item in ipairs(items) do
    if item == ARGV[1] then
        return 0
    end
end
redis.call('RPUSH', KEYS[1], ARGV[1])
return 1
"#;

#[derive(Clone)]
pub struct RedisAgentPool {
    conn: ConnectionManager,
    key: String,
    add_if_absent: Script,
}

impl RedisAgentPool {
    /// Connect to Redis and verify the connection with a `PING`
    pub async fn connect(info: impl IntoConnectionInfo, key: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(info)?;
        let addr = client.get_connection_info().addr().to_string();
        let mut conn = ConnectionManager::new(client).await?;

        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!("Redis answered {} at {}", pong, addr);

        let key = key.into();
        info!("✅ Connected agent pool to Redis list '{}'", key);
        Ok(Self::from_connection(conn, key))
    }

    pub fn from_connection(conn: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            conn,
            key: key.into(),
            add_if_absent: Script::new(ADD_IF_ABSENT_SCRIPT),
        }
    }
}

#[async_trait]
impl AgentPool for RedisAgentPool {
    async fn try_assign(&self) -> Result<Option<AgentId>> {
        let mut conn = self.conn.clone();
        let head: Option<String> = redis::cmd("LPOP").arg(&self.key).query_async(&mut conn).await?;
        Ok(head.map(AgentId::from))
    }

    async fn requeue(&self, agent_id: &AgentId) -> Result<()> {
        let mut conn = self.conn.clone();
        let _len: i64 = redis::cmd("RPUSH")
            .arg(&self.key)
            .arg(agent_id.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove(&self, agent_id: &AgentId) -> Result<usize> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("LREM")
            .arg(&self.key)
            .arg(0)
            .arg(agent_id.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(removed.max(0) as usize)
    }

    async fn add_if_absent(&self, agent_id: &AgentId) -> Result<bool> {
        let mut conn = self.conn.clone();
        let added: i64 = self
            .add_if_absent
            .key(&self.key)
            .arg(agent_id.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(added == 1)
    }

    async fn rebuild(&self, agent_ids: &[AgentId]) -> Result<()> {
        let mut conn = self.conn.clone();
        let ids: Vec<&str> = agent_ids.iter().map(|a| a.as_str()).collect();

        let mut pipe = redis::pipe();
        pipe.atomic().cmd("DEL").arg(&self.key).ignore();
        if !ids.is_empty() {
            pipe.cmd("RPUSH").arg(&self.key).arg(&ids).ignore();
        }
        let () = pipe.query_async(&mut conn).await?;

        debug!("Rebuilt Redis list '{}' with {} agents", self.key, ids.len());
        Ok(())
    }

    async fn rotate(&self) -> Result<Option<AgentId>> {
        let mut conn = self.conn.clone();
        let moved: Option<String> = redis::cmd("LMOVE")
            .arg(&self.key)
            .arg(&self.key)
            .arg("LEFT")
            .arg("RIGHT")
            .query_async(&mut conn)
            .await?;
        Ok(moved.map(AgentId::from))
    }

    async fn snapshot(&self) -> Result<Vec<AgentId>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("LRANGE")
            .arg(&self.key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(ids.into_iter().map(AgentId::from).collect())
    }
}
