//! PostgreSQL system of record
//!
//! Runtime-checked `sqlx` queries against the schema in `migrations/`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

use super::CallRecordStore;
use crate::error::{CallEngineError, Result};
use crate::types::{Agent, AgentId, AssignedCall, CallStatus};

const ASSIGNED_CALL_COLUMNS: &str = "id, call_id, customer_number, timestamp, assigned_agent_id, \
                                     status, notes, created_at, updated_at";

#[derive(sqlx::FromRow, Debug)]
struct AgentRow {
    id: String,
    name: String,
    is_admin: bool,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AgentRow> for Agent {
    fn from(row: AgentRow) -> Self {
        Agent {
            id: AgentId(row.id),
            name: row.name,
            is_admin: row.is_admin,
            is_active: row.is_active,
            created_at: Some(row.created_at),
            updated_at: Some(row.updated_at),
        }
    }
}

#[derive(sqlx::FromRow, Debug)]
struct AssignedCallRow {
    id: i64,
    call_id: String,
    customer_number: String,
    timestamp: DateTime<Utc>,
    assigned_agent_id: String,
    status: String,
    notes: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AssignedCallRow> for AssignedCall {
    type Error = CallEngineError;

    fn try_from(row: AssignedCallRow) -> Result<Self> {
        let status = CallStatus::parse(&row.status).ok_or_else(|| {
            CallEngineError::database(format!(
                "call {} has unknown status '{}'",
                row.call_id, row.status
            ))
        })?;

        Ok(AssignedCall {
            id: Some(row.id),
            call_id: row.call_id,
            customer_number: row.customer_number,
            timestamp: row.timestamp,
            assigned_agent_id: AgentId(row.assigned_agent_id),
            status,
            notes: row.notes,
            created_at: Some(row.created_at),
            updated_at: Some(row.updated_at),
        })
    }
}

#[derive(Clone)]
pub struct PostgresCallStore {
    pool: PgPool,
}

impl PostgresCallStore {
    /// Connect, then apply the embedded migrations
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!("✅ Connected to PostgreSQL");

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("✅ Database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl CallRecordStore for PostgresCallStore {
    async fn active_agents(&self) -> Result<Vec<Agent>> {
        let rows: Vec<AgentRow> = sqlx::query_as(
            "SELECT id, name, is_admin, is_active, created_at, updated_at
             FROM agents
             WHERE is_active = TRUE
             ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        debug!("Loaded {} active agents", rows.len());
        Ok(rows.into_iter().map(Agent::from).collect())
    }

    async fn insert_assigned_call(&self, call: &AssignedCall) -> Result<AssignedCall> {
        let sql = format!(
            "INSERT INTO assigned_calls
                 (call_id, customer_number, timestamp, assigned_agent_id, status, notes)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {}",
            ASSIGNED_CALL_COLUMNS
        );

        let row: AssignedCallRow = sqlx::query_as(&sql)
            .bind(&call.call_id)
            .bind(&call.customer_number)
            .bind(call.timestamp)
            .bind(call.assigned_agent_id.as_str())
            .bind(call.status.as_str())
            .bind(&call.notes)
            .fetch_one(&self.pool)
            .await?;

        debug!("Stored call {} for agent {}", row.call_id, row.assigned_agent_id);
        row.try_into()
    }

    async fn assigned_calls_for_agent(&self, agent_id: &AgentId) -> Result<Vec<AssignedCall>> {
        let sql = format!(
            "SELECT {} FROM assigned_calls
             WHERE assigned_agent_id = $1
             ORDER BY created_at ASC, id ASC",
            ASSIGNED_CALL_COLUMNS
        );

        let rows: Vec<AssignedCallRow> = sqlx::query_as(&sql)
            .bind(agent_id.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(AssignedCall::try_from).collect()
    }

    async fn complete_call(
        &self,
        call_id: &str,
        agent_id: &AgentId,
        status: CallStatus,
        notes: &str,
    ) -> Result<AssignedCall> {
        let mut tx = self.pool.begin().await?;

        let owner: Option<String> = sqlx::query_scalar(
            "SELECT assigned_agent_id FROM assigned_calls WHERE call_id = $1 FOR UPDATE",
        )
        .bind(call_id)
        .fetch_optional(&mut *tx)
        .await?;

        match owner {
            None => return Err(CallEngineError::NotFound(format!("call {}", call_id))),
            Some(owner) if owner != agent_id.as_str() => {
                return Err(CallEngineError::Authorization(format!(
                    "call {} is not assigned to agent {}",
                    call_id, agent_id
                )));
            }
            Some(_) => {}
        }

        let sql = format!(
            "UPDATE assigned_calls
             SET status = $2,
                 notes = CASE WHEN $3 = '' THEN notes ELSE $3 END,
                 updated_at = NOW()
             WHERE call_id = $1
             RETURNING {}",
            ASSIGNED_CALL_COLUMNS
        );

        let row: AssignedCallRow = sqlx::query_as(&sql)
            .bind(call_id)
            .bind(status.as_str())
            .bind(notes)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!("Call {} moved to {} by agent {}", call_id, status, agent_id);
        row.try_into()
    }
}
