//! Append-only cost ledger
//!
//! Each entry charges one instance's time against an owner for one period.
//! Appending an entry and bumping the instance's accumulated cost happen in
//! the same transaction, so `accumulated_cost_cents == SUM(entries)` holds at
//! every commit point.

use super::{ledger_from_row, JobStore};
use crate::error::{OrchestratorError, Result};
use crate::types::{accrued_cents, InstanceId, LedgerEntry};
use chrono::{DateTime, Utc};
use sqlx::Row;

impl JobStore {
    /// Append a charge for `[period_start, period_end)` at the given rate and
    /// fold it into the instance's accumulated cost.
    pub async fn append_cost(
        &self,
        instance_id: InstanceId,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        hourly_rate_cents: i64,
    ) -> Result<LedgerEntry> {
        let accrued = accrued_cents(hourly_rate_cents, period_start, period_end);
        let mut tx = self.pool().begin().await?;

        let owner: Option<String> = sqlx::query_scalar("SELECT owner FROM instances WHERE id = ?")
            .bind(instance_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let owner = owner.ok_or(OrchestratorError::NotFound {
            entity: "instance",
            id: instance_id.to_string(),
        })?;

        let result = sqlx::query(
            r#"INSERT INTO cost_ledger (instance_id, owner, period_start, period_end,
               hourly_rate_cents, accrued_cents) VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(instance_id.to_string())
        .bind(&owner)
        .bind(period_start)
        .bind(period_end)
        .bind(hourly_rate_cents)
        .bind(accrued)
        .execute(&mut *tx)
        .await?;
        let entry_id = result.last_insert_rowid();

        sqlx::query(
            "UPDATE instances SET accumulated_cost_cents = accumulated_cost_cents + ? WHERE id = ?",
        )
        .bind(accrued)
        .bind(instance_id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let row = sqlx::query("SELECT * FROM cost_ledger WHERE id = ?")
            .bind(entry_id)
            .fetch_one(self.pool())
            .await?;
        ledger_from_row(&row)
    }

    /// Where the next accrual period starts: the end of the last entry, or
    /// the instance's start time for a fresh instance.
    pub async fn last_ledger_end(&self, instance_id: InstanceId) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT period_end FROM cost_ledger WHERE instance_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(instance_id.to_string())
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|r| r.get("period_end")))
    }

    pub async fn ledger_entries(&self, instance_id: InstanceId) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query("SELECT * FROM cost_ledger WHERE instance_id = ? ORDER BY id ASC")
            .bind(instance_id.to_string())
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(ledger_from_row).collect()
    }

    pub async fn ledger_sum(&self, instance_id: InstanceId) -> Result<i64> {
        Ok(sqlx::query_scalar(
            "SELECT COALESCE(SUM(accrued_cents), 0) FROM cost_ledger WHERE instance_id = ?",
        )
        .bind(instance_id.to_string())
        .fetch_one(self.pool())
        .await?)
    }

    /// Total charged to an owner across still-live instances. The budget
    /// brake watches this.
    pub async fn owner_live_cost(&self, owner: &str) -> Result<i64> {
        Ok(sqlx::query_scalar(
            r#"SELECT COALESCE(SUM(l.accrued_cents), 0) FROM cost_ledger l
               JOIN instances i ON i.id = l.instance_id
               WHERE l.owner = ? AND i.state NOT IN ('stopped', 'error')"#,
        )
        .bind(owner)
        .fetch_one(self.pool())
        .await?)
    }

    /// Owners with at least one job currently running, for budget-brake
    /// evaluation on each accrual pass.
    pub async fn owners_with_live_work(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT owner FROM jobs WHERE state IN ('queued', 'pending', 'running')",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(o,)| o).collect())
    }

    /// An over-budget owner's running jobs ordered for drain selection:
    /// lowest priority first, newest first within a priority.
    pub async fn drain_candidates(&self, owner: &str) -> Result<Vec<crate::types::Job>> {
        let rows = sqlx::query(
            r#"SELECT * FROM jobs WHERE owner = ? AND state = 'running'
               ORDER BY priority_bucket ASC, started_at DESC"#,
        )
        .bind(owner)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(super::job_from_row).collect()
    }
}
