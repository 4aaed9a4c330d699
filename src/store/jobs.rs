//! Job persistence: submission, claiming, transitions, queries, archival

use super::{job_from_row, now, transition_from_row, JobStore};
use crate::error::{OrchestratorError, Result};
use crate::types::{
    ErrorClass, InstanceId, Job, JobId, JobSpec, JobState, JobTransition,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use uuid::Uuid;

/// Result of a submission: the job, and whether this call created it or an
/// idempotency key mapped it onto an earlier one.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub job: Job,
    pub created: bool,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub owner: Option<String>,
    pub state: Option<JobState>,
}

#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub next_cursor: Option<String>,
}

/// Optional row updates applied alongside a state transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionDetails {
    pub instance_id: Option<InstanceId>,
    pub final_cost_cents: Option<i64>,
    pub error_class: Option<ErrorClass>,
    pub error_message: Option<String>,
    pub result_ref: Option<String>,
    pub note: Option<String>,
}

impl TransitionDetails {
    pub fn note(text: impl Into<String>) -> Self {
        Self {
            note: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn failure(class: ErrorClass, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            error_class: Some(class),
            error_message: Some(message.clone()),
            note: Some(message),
            ..Self::default()
        }
    }
}

impl JobStore {
    /// Persist a submission in state `queued`.
    ///
    /// Idempotency, quota projection, and the insert happen in one
    /// transaction: a duplicate (owner, key) returns the earlier job
    /// unchanged, and the owner's projection (live ledger charges plus
    /// estimates for non-terminal jobs) is checked against the ceiling
    /// before the row lands.
    pub async fn submit_job(
        &self,
        owner: &str,
        spec: &JobSpec,
        estimated_cost_cents: i64,
        ceiling_cents: i64,
    ) -> Result<SubmitOutcome> {
        let mut tx = self.pool().begin().await?;

        if let Some(key) = &spec.idempotency_key {
            let existing = sqlx::query(
                "SELECT * FROM jobs WHERE owner = ? AND idempotency_key = ?",
            )
            .bind(owner)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(row) = existing {
                return Ok(SubmitOutcome {
                    job: job_from_row(&row)?,
                    created: false,
                });
            }
        }

        let projection = Self::owner_projection_tx(&mut tx, owner).await?;
        if projection + estimated_cost_cents > ceiling_cents {
            return Err(OrchestratorError::QuotaExceeded {
                owner: owner.to_string(),
                reason: format!(
                    "projected cost {} + estimate {} exceeds ceiling {}",
                    projection, estimated_cost_cents, ceiling_cents
                ),
            });
        }

        let id = JobId::generate();
        let created_at = now();
        sqlx::query(
            r#"INSERT INTO jobs (
                id, owner, kind, priority, priority_bucket,
                gpu_model, gpu_count, memory_mb, disk_gb,
                image, env, inputs, deadline, max_retries,
                cost_ceiling_cents, idempotency_key, estimated_cost_cents,
                state, retry_count, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'queued', 0, ?)"#,
        )
        .bind(id.to_string())
        .bind(owner)
        .bind(spec.kind.as_str())
        .bind(spec.priority.as_str())
        .bind(spec.priority.bucket())
        .bind(&spec.resources.gpu_model)
        .bind(spec.resources.gpu_count as i64)
        .bind(spec.resources.memory_mb as i64)
        .bind(spec.resources.disk_gb.map(|d| d as i64))
        .bind(&spec.image)
        .bind(serde_json::to_string(&spec.env)?)
        .bind(serde_json::to_string(&spec.inputs)?)
        .bind(spec.deadline)
        .bind(spec.max_retries as i64)
        .bind(spec.cost_ceiling_cents)
        .bind(&spec.idempotency_key)
        .bind(estimated_cost_cents)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let job = self.get_job(id).await?;
        Ok(SubmitOutcome { job, created: true })
    }

    /// Owner's in-flight cost projection: everything charged to still-live
    /// instances plus the estimates of jobs not yet finished.
    pub async fn owner_projection(&self, owner: &str) -> Result<i64> {
        let mut tx = self.pool().begin().await?;
        let projection = Self::owner_projection_tx(&mut tx, owner).await?;
        tx.commit().await?;
        Ok(projection)
    }

    async fn owner_projection_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        owner: &str,
    ) -> Result<i64> {
        let ledger: i64 = sqlx::query_scalar(
            r#"SELECT COALESCE(SUM(l.accrued_cents), 0) FROM cost_ledger l
               JOIN instances i ON i.id = l.instance_id
               WHERE l.owner = ? AND i.state NOT IN ('stopped', 'error')"#,
        )
        .bind(owner)
        .fetch_one(&mut **tx)
        .await?;
        let estimates: i64 = sqlx::query_scalar(
            r#"SELECT COALESCE(SUM(estimated_cost_cents), 0) FROM jobs
               WHERE owner = ? AND state IN ('queued', 'pending', 'running')"#,
        )
        .bind(owner)
        .fetch_one(&mut **tx)
        .await?;
        Ok(ledger + estimates)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?
            .ok_or(OrchestratorError::NotFound {
                entity: "job",
                id: id.to_string(),
            })?;
        job_from_row(&row)
    }

    pub async fn job_history(&self, id: JobId) -> Result<Vec<JobTransition>> {
        let rows = sqlx::query("SELECT * FROM job_transitions WHERE job_id = ? ORDER BY id ASC")
            .bind(id.to_string())
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(transition_from_row).collect()
    }

    /// Cursor-paginated listing, newest first. The cursor is the
    /// `created_at/id` pair of the last row of the previous page.
    pub async fn list_jobs(
        &self,
        filter: &JobFilter,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<JobPage> {
        let mut sql = String::from("SELECT * FROM jobs WHERE 1=1");
        if filter.owner.is_some() {
            sql.push_str(" AND owner = ?");
        }
        if filter.state.is_some() {
            sql.push_str(" AND state = ?");
        }
        if cursor.is_some() {
            sql.push_str(" AND (created_at, id) < (?, ?)");
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(owner) = &filter.owner {
            query = query.bind(owner);
        }
        if let Some(state) = filter.state {
            query = query.bind(state.as_str());
        }
        if let Some(cursor) = cursor {
            let (created_at, id) = cursor.split_once('/').ok_or_else(|| {
                OrchestratorError::Validation {
                    field: "cursor".to_string(),
                    reason: "malformed".to_string(),
                }
            })?;
            // bind through chrono so the text encoding matches stored rows
            let created_at = chrono::DateTime::parse_from_rfc3339(created_at)
                .map_err(|_| OrchestratorError::Validation {
                    field: "cursor".to_string(),
                    reason: "malformed timestamp".to_string(),
                })?
                .with_timezone(&Utc);
            query = query.bind(created_at).bind(id.to_string());
        }
        query = query.bind(limit as i64);

        let rows = query.fetch_all(self.pool()).await?;
        let full_page = rows.len() as u32 == limit;
        let next_cursor = if full_page {
            rows.last().map(|row| {
                let created_at: DateTime<Utc> = row.get("created_at");
                let id: String = row.get("id");
                format!("{}/{id}", created_at.to_rfc3339())
            })
        } else {
            None
        };
        let jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>>>()?;
        Ok(JobPage { jobs, next_cursor })
    }

    /// Atomically claim up to `limit` queued jobs for one scheduling pass.
    ///
    /// Claimed jobs move to `pending` under a lease token; a scheduler that
    /// dies mid-tick loses nothing because `release_expired_claims` returns
    /// them to `queued` once the lease runs out.
    pub async fn claim_queued(
        &self,
        limit: u32,
        blocked_owners: &[String],
        lease_secs: i64,
    ) -> Result<Vec<Job>> {
        let mut tx = self.pool().begin().await?;

        let mut sql = String::from("SELECT id FROM jobs WHERE state = 'queued'");
        for _ in blocked_owners {
            sql.push_str(" AND owner != ?");
        }
        sql.push_str(" ORDER BY priority_bucket DESC, created_at ASC LIMIT ?");
        let mut query = sqlx::query(&sql);
        for owner in blocked_owners {
            query = query.bind(owner);
        }
        query = query.bind(limit as i64);
        let ids: Vec<String> = query
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|row| row.get("id"))
            .collect();

        if ids.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let claim_token = Uuid::new_v4().to_string();
        let ts = now();
        let expires = ts + Duration::seconds(lease_secs);
        for id in &ids {
            sqlx::query(
                r#"UPDATE jobs SET state = 'pending', claim_token = ?, claim_expires_at = ?,
                   first_scheduled_at = COALESCE(first_scheduled_at, ?)
                   WHERE id = ? AND state = 'queued'"#,
            )
            .bind(&claim_token)
            .bind(expires)
            .bind(ts)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                r#"INSERT INTO job_transitions (job_id, from_state, to_state, at, details)
                   VALUES (?, 'queued', 'pending', ?, 'claimed for scheduling')"#,
            )
            .bind(id)
            .bind(ts)
            .execute(&mut *tx)
            .await?;
        }

        let mut claimed = Vec::with_capacity(ids.len());
        for id in &ids {
            let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
            claimed.push(job_from_row(&row)?);
        }
        tx.commit().await?;
        Ok(claimed)
    }

    /// Return a claimed-but-unmatched job to the queue.
    pub async fn release_claim(&self, id: JobId) -> Result<()> {
        let ts = now();
        let result = sqlx::query(
            r#"UPDATE jobs SET state = 'queued', claim_token = NULL, claim_expires_at = NULL
               WHERE id = ? AND state = 'pending'
               AND id NOT IN (SELECT job_id FROM assignments WHERE state IN ('assigned', 'running'))"#,
        )
        .bind(id.to_string())
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 1 {
            sqlx::query(
                r#"INSERT INTO job_transitions (job_id, from_state, to_state, at, details)
                   VALUES (?, 'pending', 'queued', ?, 'claim released')"#,
            )
            .bind(id.to_string())
            .bind(ts)
            .execute(self.pool())
            .await?;
        }
        Ok(())
    }

    /// Return every pending job whose lease expired and which never got an
    /// assignment. Run by the reaper.
    pub async fn release_expired_claims(&self, as_of: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"UPDATE jobs SET state = 'queued', claim_token = NULL, claim_expires_at = NULL
               WHERE state = 'pending' AND claim_expires_at IS NOT NULL AND claim_expires_at < ?
               AND id NOT IN (SELECT job_id FROM assignments WHERE state IN ('assigned', 'running'))"#,
        )
        .bind(as_of)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Compare-and-set state transition. Returns the updated job, or
    /// `Conflict` if the row is no longer in `from`.
    pub async fn transition_job(
        &self,
        id: JobId,
        from: JobState,
        to: JobState,
        details: TransitionDetails,
    ) -> Result<Job> {
        if !from.can_transition_to(to) {
            return Err(OrchestratorError::Validation {
                field: "state".to_string(),
                reason: format!("illegal transition {} -> {}", from.as_str(), to.as_str()),
            });
        }
        let ts = now();
        let mut tx = self.pool().begin().await?;

        let mut sql = String::from("UPDATE jobs SET state = ?");
        if to == JobState::Running {
            sql.push_str(", started_at = COALESCE(started_at, ?)");
        }
        if to.is_terminal() {
            sql.push_str(", finished_at = ?, claim_token = NULL, claim_expires_at = NULL");
        }
        if details.instance_id.is_some() {
            sql.push_str(", instance_id = ?");
        }
        if details.final_cost_cents.is_some() {
            sql.push_str(", final_cost_cents = ?");
        }
        if details.error_class.is_some() {
            sql.push_str(", error_class = ?");
        }
        if details.error_message.is_some() {
            sql.push_str(", error_message = ?");
        }
        if details.result_ref.is_some() {
            sql.push_str(", result_ref = ?");
        }
        sql.push_str(" WHERE id = ? AND state = ?");

        let mut query = sqlx::query(&sql).bind(to.as_str());
        if to == JobState::Running {
            query = query.bind(ts);
        }
        if to.is_terminal() {
            query = query.bind(ts);
        }
        if let Some(instance_id) = details.instance_id {
            query = query.bind(instance_id.to_string());
        }
        if let Some(final_cost) = details.final_cost_cents {
            query = query.bind(final_cost);
        }
        if let Some(class) = details.error_class {
            query = query.bind(class.as_str());
        }
        if let Some(message) = &details.error_message {
            query = query.bind(message);
        }
        if let Some(result_ref) = &details.result_ref {
            query = query.bind(result_ref);
        }
        query = query.bind(id.to_string()).bind(from.as_str());

        let result = query.execute(&mut *tx).await?;
        if result.rows_affected() == 0 {
            return Err(OrchestratorError::Conflict {
                entity: "job",
                id: id.to_string(),
                expected: from.as_str().to_string(),
            });
        }

        sqlx::query(
            r#"INSERT INTO job_transitions (job_id, from_state, to_state, at, details)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(id.to_string())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(ts)
        .bind(&details.note)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        self.get_job(id).await
    }

    /// Create the follow-up job for a failed one, consuming retry budget.
    /// The new job drops the idempotency key (the chain is linked by
    /// `retry_of`, and the key must stay unique per owner).
    pub async fn spawn_retry(&self, failed: &Job) -> Result<Job> {
        let id = JobId::generate();
        let ts = now();
        sqlx::query(
            r#"INSERT INTO jobs (
                id, owner, kind, priority, priority_bucket,
                gpu_model, gpu_count, memory_mb, disk_gb,
                image, env, inputs, deadline, max_retries,
                cost_ceiling_cents, idempotency_key, estimated_cost_cents,
                state, retry_of, retry_count, created_at
            ) SELECT ?, owner, kind, priority, priority_bucket,
                gpu_model, gpu_count, memory_mb, disk_gb,
                image, env, inputs, deadline, max_retries,
                cost_ceiling_cents, NULL, estimated_cost_cents,
                'queued', ?, retry_count + 1, ?
            FROM jobs WHERE id = ?"#,
        )
        .bind(id.to_string())
        .bind(failed.id.to_string())
        .bind(ts)
        .bind(failed.id.to_string())
        .execute(self.pool())
        .await?;
        self.get_job(id).await
    }

    /// The queued job that has waited longest, if any. The warm-up policy
    /// uses its profile as the shape worth pre-provisioning.
    pub async fn oldest_queued_job(&self) -> Result<Option<Job>> {
        let row = sqlx::query(
            "SELECT * FROM jobs WHERE state = 'queued' ORDER BY created_at ASC LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Number of jobs waiting in the hot queue, for admission control.
    pub async fn queued_depth(&self) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE state = 'queued'")
                .fetch_one(self.pool())
                .await?,
        )
    }

    pub async fn count_jobs_in_state(&self, state: JobState) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE state = ?")
            .bind(state.as_str())
            .fetch_one(self.pool())
            .await?)
    }

    /// Jobs stuck in `pending` whose assignment is older than the dispatch
    /// timeout. Surfaced for the reaper.
    pub async fn stuck_pending_jobs(&self, older_than: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"SELECT j.* FROM jobs j
               JOIN assignments a ON a.job_id = j.id AND a.state = 'assigned'
               WHERE j.state = 'pending' AND a.assigned_at < ?"#,
        )
        .bind(older_than)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Move terminal jobs older than the cutoff into cold storage.
    pub async fn archive_terminal_jobs(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool().begin().await?;
        let rows = sqlx::query(
            r#"SELECT * FROM jobs
               WHERE state IN ('completed', 'failed', 'cancelled', 'timed_out')
               AND finished_at IS NOT NULL AND finished_at < ?"#,
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;
        let ts = now();
        let mut archived = 0u64;
        for row in &rows {
            let job = job_from_row(row)?;
            sqlx::query(
                r#"INSERT OR REPLACE INTO jobs_archive (id, owner, state, row_json, archived_at)
                   VALUES (?, ?, ?, ?, ?)"#,
            )
            .bind(job.id.to_string())
            .bind(&job.owner)
            .bind(job.state.as_str())
            .bind(serde_json::to_string(&job)?)
            .bind(ts)
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM jobs WHERE id = ?")
                .bind(job.id.to_string())
                .execute(&mut *tx)
                .await?;
            archived += 1;
        }
        tx.commit().await?;
        Ok(archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobKind, Priority, ResourceProfile};
    use std::collections::HashMap;

    fn spec() -> JobSpec {
        JobSpec {
            kind: JobKind::Inference,
            priority: Priority::Normal,
            resources: ResourceProfile {
                gpu_model: "RTX 4090".to_string(),
                gpu_count: 1,
                memory_mb: 16_384,
                disk_gb: None,
            },
            image: "aima/inference-worker:latest".to_string(),
            env: HashMap::new(),
            inputs: vec!["s3://media/clip.mp4".to_string()],
            deadline: None,
            max_retries: 3,
            cost_ceiling_cents: None,
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn submit_and_fetch() {
        let store = JobStore::open_in_memory().await.unwrap();
        let outcome = store.submit_job("alice", &spec(), 100, 10_000).await.unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.job.state, JobState::Queued);

        let fetched = store.get_job(outcome.job.id).await.unwrap();
        assert_eq!(fetched.owner, "alice");
        assert_eq!(fetched.spec.inputs.len(), 1);
    }

    #[tokio::test]
    async fn idempotent_resubmit_returns_same_job() {
        let store = JobStore::open_in_memory().await.unwrap();
        let mut s = spec();
        s.idempotency_key = Some("media-123".to_string());

        let first = store.submit_job("alice", &s, 100, 10_000).await.unwrap();
        let second = store.submit_job("alice", &s, 100, 10_000).await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.job.id, second.job.id);
        assert_eq!(store.queued_depth().await.unwrap(), 1);

        // a different owner with the same key gets their own job
        let other = store.submit_job("bob", &s, 100, 10_000).await.unwrap();
        assert!(other.created);
        assert_ne!(other.job.id, first.job.id);
    }

    #[tokio::test]
    async fn quota_is_enforced_at_submit() {
        let store = JobStore::open_in_memory().await.unwrap();
        store.submit_job("alice", &spec(), 600, 1_000).await.unwrap();
        match store.submit_job("alice", &spec(), 600, 1_000).await {
            Err(OrchestratorError::QuotaExceeded { owner, .. }) => assert_eq!(owner, "alice"),
            other => panic!("expected QuotaExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_age() {
        let store = JobStore::open_in_memory().await.unwrap();
        let low = store
            .submit_job("a", &JobSpec { priority: Priority::Low, ..spec() }, 0, 1_000)
            .await
            .unwrap();
        let urgent = store
            .submit_job("a", &JobSpec { priority: Priority::Urgent, ..spec() }, 0, 1_000)
            .await
            .unwrap();
        let normal = store.submit_job("a", &spec(), 0, 1_000).await.unwrap();

        let claimed = store.claim_queued(10, &[], 30).await.unwrap();
        let ids: Vec<JobId> = claimed.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![urgent.job.id, normal.job.id, low.job.id]);
        assert!(claimed.iter().all(|j| j.state == JobState::Pending));
        // claimed jobs are gone from the queue
        assert!(store.claim_queued(10, &[], 30).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blocked_owners_are_skipped() {
        let store = JobStore::open_in_memory().await.unwrap();
        store.submit_job("alice", &spec(), 0, 1_000).await.unwrap();
        let bob = store.submit_job("bob", &spec(), 0, 1_000).await.unwrap();

        let claimed = store
            .claim_queued(10, &["alice".to_string()], 30)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, bob.job.id);
    }

    #[tokio::test]
    async fn release_claim_requeues() {
        let store = JobStore::open_in_memory().await.unwrap();
        let outcome = store.submit_job("a", &spec(), 0, 1_000).await.unwrap();
        store.claim_queued(1, &[], 30).await.unwrap();

        store.release_claim(outcome.job.id).await.unwrap();
        let job = store.get_job(outcome.job.id).await.unwrap();
        assert_eq!(job.state, JobState::Queued);
    }

    #[tokio::test]
    async fn expired_claims_are_released() {
        let store = JobStore::open_in_memory().await.unwrap();
        let outcome = store.submit_job("a", &spec(), 0, 1_000).await.unwrap();
        store.claim_queued(1, &[], -1).await.unwrap();

        let released = store.release_expired_claims(now()).await.unwrap();
        assert_eq!(released, 1);
        let job = store.get_job(outcome.job.id).await.unwrap();
        assert_eq!(job.state, JobState::Queued);
    }

    #[tokio::test]
    async fn transition_cas_conflicts_on_moved_state() {
        let store = JobStore::open_in_memory().await.unwrap();
        let outcome = store.submit_job("a", &spec(), 0, 1_000).await.unwrap();
        let id = outcome.job.id;

        // not in pending, so pending -> running must conflict
        match store
            .transition_job(id, JobState::Pending, JobState::Running, Default::default())
            .await
        {
            Err(OrchestratorError::Conflict { .. }) => {}
            other => panic!("expected Conflict, got {other:?}"),
        }

        // illegal edge is rejected before touching the row
        assert!(store
            .transition_job(id, JobState::Queued, JobState::Running, Default::default())
            .await
            .is_err());

        let job = store
            .transition_job(
                id,
                JobState::Queued,
                JobState::Cancelled,
                TransitionDetails::note("user cancel"),
            )
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.finished_at.is_some());

        let history = store.job_history(id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].to_state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn spawn_retry_links_chain_and_drops_key() {
        let store = JobStore::open_in_memory().await.unwrap();
        let mut s = spec();
        s.idempotency_key = Some("key-1".to_string());
        let outcome = store.submit_job("a", &s, 0, 1_000).await.unwrap();

        let retry = store.spawn_retry(&outcome.job).await.unwrap();
        assert_eq!(retry.retry_of, Some(outcome.job.id));
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.state, JobState::Queued);
        assert!(retry.spec.idempotency_key.is_none());
    }

    #[tokio::test]
    async fn list_jobs_paginates() {
        let store = JobStore::open_in_memory().await.unwrap();
        for _ in 0..5 {
            store.submit_job("a", &spec(), 0, 100_000).await.unwrap();
        }
        let page1 = store
            .list_jobs(&JobFilter::default(), None, 2)
            .await
            .unwrap();
        assert_eq!(page1.jobs.len(), 2);
        let cursor = page1.next_cursor.expect("cursor for full page");
        let page2 = store
            .list_jobs(&JobFilter::default(), Some(&cursor), 2)
            .await
            .unwrap();
        assert_eq!(page2.jobs.len(), 2);
        assert!(page1.jobs.iter().all(|a| page2.jobs.iter().all(|b| a.id != b.id)));
    }

    #[tokio::test]
    async fn archive_moves_old_terminal_jobs() {
        let store = JobStore::open_in_memory().await.unwrap();
        let outcome = store.submit_job("a", &spec(), 0, 1_000).await.unwrap();
        store
            .transition_job(
                outcome.job.id,
                JobState::Queued,
                JobState::Cancelled,
                Default::default(),
            )
            .await
            .unwrap();

        let archived = store
            .archive_terminal_jobs(now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(archived, 1);
        assert!(store.get_job(outcome.job.id).await.is_err());
    }
}
