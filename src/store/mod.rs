//! Durable job store
//!
//! The single source of truth for jobs, instances, assignments, and the cost
//! ledger, backed by SQLite through sqlx. Every multi-row mutation is a
//! transaction, and every state transition is a compare-and-set on
//! `(id, expected state)`: a failed compare surfaces as `Conflict`, which the
//! caller must treat as "state moved under me", never as something to retry
//! blindly.
//!
//! The pool is capped at one connection. SQLite is single-writer anyway, and
//! a single connection makes `:memory:` databases behave like a file while
//! giving every transaction serializable isolation.

mod assignments;
mod instances;
mod jobs;
mod ledger;

pub use instances::InstanceUpdate;
pub use jobs::{JobFilter, JobPage, SubmitOutcome, TransitionDetails};

use crate::error::Result;
use crate::types::{
    Assignment, AssignmentState, ErrorClass, Instance, InstanceState, Job, JobSpec, JobState,
    JobTransition, LedgerEntry, Priority, ProviderTag, ResourceProfile,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    kind TEXT NOT NULL,
    priority TEXT NOT NULL,
    priority_bucket INTEGER NOT NULL,
    gpu_model TEXT NOT NULL,
    gpu_count INTEGER NOT NULL,
    memory_mb INTEGER NOT NULL,
    disk_gb INTEGER,
    image TEXT NOT NULL,
    env TEXT NOT NULL,
    inputs TEXT NOT NULL,
    deadline TEXT,
    max_retries INTEGER NOT NULL,
    cost_ceiling_cents INTEGER,
    idempotency_key TEXT,
    estimated_cost_cents INTEGER NOT NULL,
    state TEXT NOT NULL,
    retry_of TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    first_scheduled_at TEXT,
    started_at TEXT,
    finished_at TEXT,
    instance_id TEXT,
    final_cost_cents INTEGER,
    error_class TEXT,
    error_message TEXT,
    result_ref TEXT,
    claim_token TEXT,
    claim_expires_at TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_idempotency
    ON jobs(owner, idempotency_key) WHERE idempotency_key IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner, created_at);

CREATE TABLE IF NOT EXISTS jobs_archive (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    state TEXT NOT NULL,
    row_json TEXT NOT NULL,
    archived_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS job_transitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    from_state TEXT NOT NULL,
    to_state TEXT NOT NULL,
    at TEXT NOT NULL,
    details TEXT
);
CREATE INDEX IF NOT EXISTS idx_transitions_job ON job_transitions(job_id, id);

CREATE TABLE IF NOT EXISTS instances (
    id TEXT PRIMARY KEY,
    provider TEXT NOT NULL,
    provider_instance_id TEXT,
    gpu_model TEXT NOT NULL,
    gpu_count INTEGER NOT NULL,
    memory_mb INTEGER NOT NULL,
    vcpus INTEGER NOT NULL,
    disk_gb INTEGER NOT NULL,
    hourly_rate_cents INTEGER NOT NULL,
    region TEXT NOT NULL,
    address TEXT,
    state TEXT NOT NULL,
    owner TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    terminated_at TEXT,
    last_heartbeat_at TEXT,
    last_idle_at TEXT,
    accumulated_cost_cents INTEGER NOT NULL DEFAULT 0,
    bootstrap_token TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_instances_provider ON instances(provider, state);
CREATE INDEX IF NOT EXISTS idx_instances_state ON instances(state);

CREATE TABLE IF NOT EXISTS assignments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    instance_id TEXT NOT NULL,
    state TEXT NOT NULL,
    assigned_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_assignments_job ON assignments(job_id, state);
CREATE INDEX IF NOT EXISTS idx_assignments_instance ON assignments(instance_id, state);

CREATE TABLE IF NOT EXISTS cost_ledger (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    instance_id TEXT NOT NULL,
    owner TEXT NOT NULL,
    period_start TEXT NOT NULL,
    period_end TEXT NOT NULL,
    hourly_rate_cents INTEGER NOT NULL,
    accrued_cents INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ledger_instance ON cost_ledger(instance_id, id);
CREATE INDEX IF NOT EXISTS idx_ledger_owner ON cost_ledger(owner);
"#;

#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (creating if necessary) the database at `path` and apply the
    /// schema. `:memory:` is accepted for tests.
    pub async fn open(path: &str) -> Result<Self> {
        let url = if path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{path}")
        };
        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5));
        if path != ":memory:" {
            options = options.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Fresh in-memory store, for tests.
    pub async fn open_in_memory() -> Result<Self> {
        Self::open(":memory:").await
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Liveness of the backing store, for /health readiness.
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

// Row mappers. All ids and enums are stored as TEXT; a row that fails to
// parse is a storage-level fault, not a caller error.

pub(crate) fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let parse = |what: &str, err: String| {
        crate::error::OrchestratorError::StorageUnavailable(format!("corrupt {what}: {err}"))
    };
    let env: std::collections::HashMap<String, String> =
        serde_json::from_str(&row.get::<String, _>("env"))?;
    let inputs: Vec<String> = serde_json::from_str(&row.get::<String, _>("inputs"))?;
    let spec = JobSpec {
        kind: row
            .get::<String, _>("kind")
            .parse()
            .map_err(|e| parse("job kind", e))?,
        priority: row
            .get::<String, _>("priority")
            .parse::<Priority>()
            .map_err(|e| parse("priority", e))?,
        resources: ResourceProfile {
            gpu_model: row.get("gpu_model"),
            gpu_count: row.get::<i64, _>("gpu_count") as u32,
            memory_mb: row.get::<i64, _>("memory_mb") as u64,
            disk_gb: row.get::<Option<i64>, _>("disk_gb").map(|d| d as u32),
        },
        image: row.get("image"),
        env,
        inputs,
        deadline: row.get("deadline"),
        max_retries: row.get::<i64, _>("max_retries") as u32,
        cost_ceiling_cents: row.get("cost_ceiling_cents"),
        idempotency_key: row.get("idempotency_key"),
    };
    Ok(Job {
        id: row
            .get::<String, _>("id")
            .parse()
            .map_err(|e: uuid::Error| parse("job id", e.to_string()))?,
        owner: row.get("owner"),
        spec,
        state: row
            .get::<String, _>("state")
            .parse()
            .map_err(|e| parse("job state", e))?,
        retry_of: row
            .get::<Option<String>, _>("retry_of")
            .map(|s| s.parse())
            .transpose()
            .map_err(|e: uuid::Error| parse("retry_of", e.to_string()))?,
        retry_count: row.get::<i64, _>("retry_count") as u32,
        created_at: row.get("created_at"),
        first_scheduled_at: row.get("first_scheduled_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        instance_id: row
            .get::<Option<String>, _>("instance_id")
            .map(|s| s.parse())
            .transpose()
            .map_err(|e: uuid::Error| parse("instance_id", e.to_string()))?,
        final_cost_cents: row.get("final_cost_cents"),
        error_class: row
            .get::<Option<String>, _>("error_class")
            .map(|s| s.parse::<ErrorClass>())
            .transpose()
            .map_err(|e| parse("error_class", e))?,
        error_message: row.get("error_message"),
        result_ref: row.get("result_ref"),
    })
}

pub(crate) fn instance_from_row(row: &SqliteRow) -> Result<Instance> {
    let parse = |what: &str, err: String| {
        crate::error::OrchestratorError::StorageUnavailable(format!("corrupt {what}: {err}"))
    };
    Ok(Instance {
        id: row
            .get::<String, _>("id")
            .parse()
            .map_err(|e: uuid::Error| parse("instance id", e.to_string()))?,
        provider: row
            .get::<String, _>("provider")
            .parse::<ProviderTag>()
            .map_err(|e| parse("provider", e))?,
        provider_instance_id: row.get("provider_instance_id"),
        gpu_model: row.get("gpu_model"),
        gpu_count: row.get::<i64, _>("gpu_count") as u32,
        memory_mb: row.get::<i64, _>("memory_mb") as u64,
        vcpus: row.get::<i64, _>("vcpus") as u32,
        disk_gb: row.get::<i64, _>("disk_gb") as u32,
        hourly_rate_cents: row.get("hourly_rate_cents"),
        region: row.get("region"),
        address: row.get("address"),
        state: row
            .get::<String, _>("state")
            .parse::<InstanceState>()
            .map_err(|e| parse("instance state", e))?,
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        terminated_at: row.get("terminated_at"),
        last_heartbeat_at: row.get("last_heartbeat_at"),
        accumulated_cost_cents: row.get("accumulated_cost_cents"),
        bootstrap_token: row.get("bootstrap_token"),
    })
}

pub(crate) fn assignment_from_row(row: &SqliteRow) -> Result<Assignment> {
    let parse = |what: &str, err: String| {
        crate::error::OrchestratorError::StorageUnavailable(format!("corrupt {what}: {err}"))
    };
    Ok(Assignment {
        id: row.get("id"),
        job_id: row
            .get::<String, _>("job_id")
            .parse()
            .map_err(|e: uuid::Error| parse("job_id", e.to_string()))?,
        instance_id: row
            .get::<String, _>("instance_id")
            .parse()
            .map_err(|e: uuid::Error| parse("instance_id", e.to_string()))?,
        state: row
            .get::<String, _>("state")
            .parse::<AssignmentState>()
            .map_err(|e| parse("assignment state", e))?,
        assigned_at: row.get("assigned_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    })
}

pub(crate) fn transition_from_row(row: &SqliteRow) -> Result<JobTransition> {
    let parse = |what: &str, err: String| {
        crate::error::OrchestratorError::StorageUnavailable(format!("corrupt {what}: {err}"))
    };
    Ok(JobTransition {
        job_id: row
            .get::<String, _>("job_id")
            .parse()
            .map_err(|e: uuid::Error| parse("job_id", e.to_string()))?,
        from_state: row
            .get::<String, _>("from_state")
            .parse::<JobState>()
            .map_err(|e| parse("from_state", e))?,
        to_state: row
            .get::<String, _>("to_state")
            .parse::<JobState>()
            .map_err(|e| parse("to_state", e))?,
        at: row.get("at"),
        details: row.get("details"),
    })
}

pub(crate) fn ledger_from_row(row: &SqliteRow) -> Result<LedgerEntry> {
    let parse = |what: &str, err: String| {
        crate::error::OrchestratorError::StorageUnavailable(format!("corrupt {what}: {err}"))
    };
    Ok(LedgerEntry {
        id: row.get("id"),
        instance_id: row
            .get::<String, _>("instance_id")
            .parse()
            .map_err(|e: uuid::Error| parse("instance_id", e.to_string()))?,
        owner: row.get("owner"),
        period_start: row.get("period_start"),
        period_end: row.get("period_end"),
        hourly_rate_cents: row.get("hourly_rate_cents"),
        accrued_cents: row.get("accrued_cents"),
    })
}

/// Timestamps are compared as text in SQL, so they must all be bound through
/// chrono values (sqlx encodes RFC 3339 consistently).
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_applies_schema() {
        let store = JobStore::open_in_memory().await.unwrap();
        assert!(store.ping().await);
        // idempotent re-application
        sqlx::raw_sql(SCHEMA).execute(store.pool()).await.unwrap();
    }
}
