//! Assignment persistence
//!
//! Assignments pair one job attempt with one instance and are never deleted.
//! `bind_assignment` is the linchpin of the single-live-assignment invariant:
//! all four preconditions are checked and the row inserted inside one
//! transaction, so two schedulers racing on the same job or instance cannot
//! both succeed.

use super::{assignment_from_row, now, JobStore};
use crate::error::{OrchestratorError, Result};
use crate::types::{Assignment, AssignmentState, InstanceId, JobId};

impl JobStore {
    /// Bind a pending job to a running, idle instance.
    ///
    /// Fails with `Conflict` if the job is not `pending`, the instance is not
    /// `running`, or either side already has a live assignment.
    pub async fn bind_assignment(
        &self,
        job_id: JobId,
        instance_id: InstanceId,
    ) -> Result<Assignment> {
        let mut tx = self.pool().begin().await?;

        let job_state: Option<String> = sqlx::query_scalar("SELECT state FROM jobs WHERE id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        match job_state.as_deref() {
            Some("pending") => {}
            Some(_) | None => {
                return Err(OrchestratorError::Conflict {
                    entity: "job",
                    id: job_id.to_string(),
                    expected: "pending".to_string(),
                });
            }
        }

        let instance_state: Option<String> =
            sqlx::query_scalar("SELECT state FROM instances WHERE id = ?")
                .bind(instance_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        match instance_state.as_deref() {
            Some("running") => {}
            Some(_) | None => {
                return Err(OrchestratorError::Conflict {
                    entity: "instance",
                    id: instance_id.to_string(),
                    expected: "running".to_string(),
                });
            }
        }

        let live_on_job: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM assignments WHERE job_id = ? AND state IN ('assigned', 'running')",
        )
        .bind(job_id.to_string())
        .fetch_one(&mut *tx)
        .await?;
        let live_on_instance: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM assignments WHERE instance_id = ? AND state IN ('assigned', 'running')",
        )
        .bind(instance_id.to_string())
        .fetch_one(&mut *tx)
        .await?;
        if live_on_job > 0 || live_on_instance > 0 {
            return Err(OrchestratorError::Conflict {
                entity: "assignment",
                id: format!("{job_id}/{instance_id}"),
                expected: "no live assignment".to_string(),
            });
        }

        let ts = now();
        let result = sqlx::query(
            r#"INSERT INTO assignments (job_id, instance_id, state, assigned_at)
               VALUES (?, ?, 'assigned', ?)"#,
        )
        .bind(job_id.to_string())
        .bind(instance_id.to_string())
        .bind(ts)
        .execute(&mut *tx)
        .await?;
        let assignment_id = result.last_insert_rowid();

        // the job now belongs to the dispatcher; the scheduler claim is done
        sqlx::query(
            r#"UPDATE jobs SET instance_id = ?, claim_token = NULL, claim_expires_at = NULL
               WHERE id = ?"#,
        )
        .bind(instance_id.to_string())
        .bind(job_id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get_assignment(assignment_id).await
    }

    pub async fn get_assignment(&self, id: i64) -> Result<Assignment> {
        let row = sqlx::query("SELECT * FROM assignments WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or(OrchestratorError::NotFound {
                entity: "assignment",
                id: id.to_string(),
            })?;
        assignment_from_row(&row)
    }

    /// Compare-and-set assignment transition.
    pub async fn transition_assignment(
        &self,
        id: i64,
        from: AssignmentState,
        to: AssignmentState,
    ) -> Result<Assignment> {
        let ts = now();
        let mut sql = String::from("UPDATE assignments SET state = ?");
        if to == AssignmentState::Running {
            sql.push_str(", started_at = COALESCE(started_at, ?)");
        }
        if !to.is_live() {
            sql.push_str(", finished_at = ?");
        }
        sql.push_str(" WHERE id = ? AND state = ?");

        let mut query = sqlx::query(&sql).bind(to.as_str());
        if to == AssignmentState::Running {
            query = query.bind(ts);
        }
        if !to.is_live() {
            query = query.bind(ts);
        }
        query = query.bind(id).bind(from.as_str());

        let result = query.execute(self.pool()).await?;
        if result.rows_affected() == 0 {
            return Err(OrchestratorError::Conflict {
                entity: "assignment",
                id: id.to_string(),
                expected: from.as_str().to_string(),
            });
        }
        self.get_assignment(id).await
    }

    pub async fn live_assignment_for_job(&self, job_id: JobId) -> Result<Option<Assignment>> {
        let row = sqlx::query(
            "SELECT * FROM assignments WHERE job_id = ? AND state IN ('assigned', 'running')",
        )
        .bind(job_id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(assignment_from_row).transpose()
    }

    pub async fn live_assignment_for_instance(
        &self,
        instance_id: InstanceId,
    ) -> Result<Option<Assignment>> {
        let row = sqlx::query(
            "SELECT * FROM assignments WHERE instance_id = ? AND state IN ('assigned', 'running')",
        )
        .bind(instance_id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(assignment_from_row).transpose()
    }

    /// All assignments currently in the given state, oldest first. Used by
    /// the dispatcher to adopt live assignments after a restart.
    pub async fn assignments_in_state(&self, state: AssignmentState) -> Result<Vec<Assignment>> {
        let rows =
            sqlx::query("SELECT * FROM assignments WHERE state = ? ORDER BY assigned_at ASC")
                .bind(state.as_str())
                .fetch_all(self.pool())
                .await?;
        rows.iter().map(assignment_from_row).collect()
    }

    pub async fn assignments_for_job(&self, job_id: JobId) -> Result<Vec<Assignment>> {
        let rows = sqlx::query("SELECT * FROM assignments WHERE job_id = ? ORDER BY id ASC")
            .bind(job_id.to_string())
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(assignment_from_row).collect()
    }

    /// Count of all assignments ever in a live state, used in tests to
    /// verify the audit trail is append-only.
    pub async fn count_assignments(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM assignments")
            .fetch_one(self.pool())
            .await?)
    }

    /// Number of distinct instances that ever carried an assignment; used by
    /// quota tests.
    pub async fn count_distinct_assigned_instances(&self) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(DISTINCT instance_id) FROM assignments")
                .fetch_one(self.pool())
                .await?,
        )
    }
}
