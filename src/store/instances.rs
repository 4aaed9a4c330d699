//! Instance persistence: quota-bounded creation, transitions, inventory

use super::{instance_from_row, now, JobStore};
use crate::error::{OrchestratorError, Result};
use crate::types::{Instance, InstanceId, InstanceState, Offer, ProviderTag};
use chrono::{DateTime, Utc};

/// Optional row updates applied alongside an instance transition.
#[derive(Debug, Clone, Default)]
pub struct InstanceUpdate {
    pub provider_instance_id: Option<String>,
    pub address: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

impl JobStore {
    /// Create an instance row in `requested` for capacity being acquired.
    ///
    /// The per-provider soft quota is enforced inside the same transaction
    /// as the insert, so the bound on non-terminal instances holds under
    /// concurrent provisioner activity.
    pub async fn insert_instance(
        &self,
        offer: &Offer,
        owner: &str,
        bootstrap_token: &str,
        soft_quota: u32,
    ) -> Result<Instance> {
        let mut tx = self.pool().begin().await?;
        let held: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM instances WHERE provider = ? AND state NOT IN ('stopped', 'error')",
        )
        .bind(offer.provider.as_str())
        .fetch_one(&mut *tx)
        .await?;
        if held >= soft_quota as i64 {
            return Err(OrchestratorError::QuotaExceeded {
                owner: offer.provider.to_string(),
                reason: format!("soft quota {soft_quota} reached"),
            });
        }

        let id = InstanceId::generate();
        let ts = now();
        sqlx::query(
            r#"INSERT INTO instances (
                id, provider, gpu_model, gpu_count, memory_mb, vcpus, disk_gb,
                hourly_rate_cents, region, state, owner, created_at,
                accumulated_cost_cents, bootstrap_token
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'requested', ?, ?, 0, ?)"#,
        )
        .bind(id.to_string())
        .bind(offer.provider.as_str())
        .bind(&offer.gpu_model)
        .bind(offer.gpu_count as i64)
        .bind(offer.memory_mb as i64)
        .bind(offer.vcpus as i64)
        .bind(offer.disk_gb as i64)
        .bind(offer.hourly_rate_cents)
        .bind(&offer.region)
        .bind(owner)
        .bind(ts)
        .bind(bootstrap_token)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        self.get_instance(id).await
    }

    pub async fn get_instance(&self, id: InstanceId) -> Result<Instance> {
        let row = sqlx::query("SELECT * FROM instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?
            .ok_or(OrchestratorError::NotFound {
                entity: "instance",
                id: id.to_string(),
            })?;
        instance_from_row(&row)
    }

    /// Compare-and-set instance transition with optional detail columns.
    pub async fn transition_instance(
        &self,
        id: InstanceId,
        from: InstanceState,
        to: InstanceState,
        update: InstanceUpdate,
    ) -> Result<Instance> {
        if !from.can_transition_to(to) {
            return Err(OrchestratorError::Validation {
                field: "state".to_string(),
                reason: format!("illegal transition {} -> {}", from.as_str(), to.as_str()),
            });
        }
        let ts = now();
        let mut sql = String::from("UPDATE instances SET state = ?");
        if to == InstanceState::Running {
            sql.push_str(
                ", started_at = COALESCE(started_at, ?), last_idle_at = ?, last_heartbeat_at = ?",
            );
        }
        if to.is_terminal() {
            sql.push_str(", terminated_at = ?");
        }
        if update.provider_instance_id.is_some() {
            sql.push_str(", provider_instance_id = ?");
        }
        if update.address.is_some() {
            sql.push_str(", address = ?");
        }
        if update.started_at.is_some() {
            sql.push_str(", started_at = ?");
        }
        sql.push_str(" WHERE id = ? AND state = ?");

        let mut query = sqlx::query(&sql).bind(to.as_str());
        if to == InstanceState::Running {
            query = query.bind(ts).bind(ts).bind(ts);
        }
        if to.is_terminal() {
            query = query.bind(ts);
        }
        if let Some(pid) = &update.provider_instance_id {
            query = query.bind(pid);
        }
        if let Some(address) = &update.address {
            query = query.bind(address);
        }
        if let Some(started_at) = update.started_at {
            query = query.bind(started_at);
        }
        query = query.bind(id.to_string()).bind(from.as_str());

        let result = query.execute(self.pool()).await?;
        if result.rows_affected() == 0 {
            return Err(OrchestratorError::Conflict {
                entity: "instance",
                id: id.to_string(),
                expected: from.as_str().to_string(),
            });
        }
        self.get_instance(id).await
    }

    pub async fn record_heartbeat(&self, id: InstanceId) -> Result<()> {
        sqlx::query("UPDATE instances SET last_heartbeat_at = ? WHERE id = ?")
            .bind(now())
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Reset the idle clock, called whenever an assignment on the instance
    /// reaches a terminal state.
    pub async fn mark_idle(&self, id: InstanceId) -> Result<()> {
        sqlx::query("UPDATE instances SET last_idle_at = ? WHERE id = ?")
            .bind(now())
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn list_instances(&self, state: Option<InstanceState>) -> Result<Vec<Instance>> {
        let rows = match state {
            Some(state) => {
                sqlx::query("SELECT * FROM instances WHERE state = ? ORDER BY created_at DESC")
                    .bind(state.as_str())
                    .fetch_all(self.pool())
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM instances ORDER BY created_at DESC")
                    .fetch_all(self.pool())
                    .await?
            }
        };
        rows.iter().map(instance_from_row).collect()
    }

    pub async fn instances_in_states(&self, states: &[InstanceState]) -> Result<Vec<Instance>> {
        let mut sql = String::from("SELECT * FROM instances WHERE state IN (");
        sql.push_str(&vec!["?"; states.len()].join(", "));
        sql.push_str(") ORDER BY created_at ASC");
        let mut query = sqlx::query(&sql);
        for state in states {
            query = query.bind(state.as_str());
        }
        let rows = query.fetch_all(self.pool()).await?;
        rows.iter().map(instance_from_row).collect()
    }

    /// Running instances with no live assignment: the scheduler's supply side.
    pub async fn idle_running_instances(&self) -> Result<Vec<Instance>> {
        let rows = sqlx::query(
            r#"SELECT * FROM instances
               WHERE state = 'running'
               AND id NOT IN (SELECT instance_id FROM assignments WHERE state IN ('assigned', 'running'))
               ORDER BY hourly_rate_cents ASC, created_at ASC"#,
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(instance_from_row).collect()
    }

    pub async fn count_nonterminal(&self, provider: ProviderTag) -> Result<i64> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM instances WHERE provider = ? AND state NOT IN ('stopped', 'error')",
        )
        .bind(provider.as_str())
        .fetch_one(self.pool())
        .await?)
    }

    /// Provider-side ids of all non-terminal instances on a provider, for
    /// orphan reconciliation.
    pub async fn known_provider_ids(&self, provider: ProviderTag) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"SELECT provider_instance_id FROM instances
               WHERE provider = ? AND provider_instance_id IS NOT NULL
               AND state NOT IN ('stopped', 'error')"#,
        )
        .bind(provider.as_str())
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Running instances carrying a live assignment whose worker has been
    /// silent past the threshold. Idle instances are not judged by
    /// heartbeats (no control channel is open); the idle grace covers them.
    pub async fn heartbeat_silent_instances(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Instance>> {
        let rows = sqlx::query(
            r#"SELECT * FROM instances
               WHERE state = 'running'
               AND COALESCE(last_heartbeat_at, started_at, created_at) < ?
               AND id IN (SELECT instance_id FROM assignments WHERE state IN ('assigned', 'running'))"#,
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(instance_from_row).collect()
    }

    /// Running instances idle since before the cutoff (no live assignment),
    /// due for draining.
    pub async fn idle_expired_instances(&self, cutoff: DateTime<Utc>) -> Result<Vec<Instance>> {
        let rows = sqlx::query(
            r#"SELECT * FROM instances
               WHERE state = 'running'
               AND COALESCE(last_idle_at, started_at, created_at) <= ?
               AND id NOT IN (SELECT instance_id FROM assignments WHERE state IN ('assigned', 'running'))"#,
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(instance_from_row).collect()
    }

    /// Requested/starting instances created before the cutoff: past their
    /// start deadline.
    pub async fn start_deadline_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<Instance>> {
        let rows = sqlx::query(
            r#"SELECT * FROM instances
               WHERE state IN ('requested', 'starting') AND created_at < ?"#,
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(instance_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Offer;

    fn offer() -> Offer {
        Offer {
            provider: ProviderTag::Local,
            region: "local".to_string(),
            gpu_model: "RTX 4090".to_string(),
            gpu_count: 1,
            memory_mb: 32_768,
            vcpus: 16,
            disk_gb: 200,
            hourly_rate_cents: 0,
            availability: 2,
        }
    }

    #[tokio::test]
    async fn soft_quota_bounds_inserts() {
        let store = JobStore::open_in_memory().await.unwrap();
        store.insert_instance(&offer(), "alice", "t1", 2).await.unwrap();
        store.insert_instance(&offer(), "alice", "t2", 2).await.unwrap();
        match store.insert_instance(&offer(), "alice", "t3", 2).await {
            Err(OrchestratorError::QuotaExceeded { .. }) => {}
            other => panic!("expected QuotaExceeded, got {other:?}"),
        }
        assert_eq!(store.count_nonterminal(ProviderTag::Local).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let store = JobStore::open_in_memory().await.unwrap();
        let instance = store.insert_instance(&offer(), "alice", "tok", 4).await.unwrap();
        assert_eq!(instance.state, InstanceState::Requested);

        let instance = store
            .transition_instance(
                instance.id,
                InstanceState::Requested,
                InstanceState::Starting,
                InstanceUpdate {
                    provider_instance_id: Some("slot0-abc".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(instance.provider_instance_id.as_deref(), Some("slot0-abc"));

        let instance = store
            .transition_instance(
                instance.id,
                InstanceState::Starting,
                InstanceState::Running,
                InstanceUpdate {
                    address: Some("127.0.0.1:9400".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(instance.state, InstanceState::Running);
        assert!(instance.started_at.is_some());
        assert_eq!(instance.address.as_deref(), Some("127.0.0.1:9400"));

        // terminal state releases quota
        store
            .transition_instance(
                instance.id,
                InstanceState::Running,
                InstanceState::Error,
                Default::default(),
            )
            .await
            .unwrap();
        assert_eq!(store.count_nonterminal(ProviderTag::Local).await.unwrap(), 0);

        // stale CAS conflicts
        match store
            .transition_instance(
                instance.id,
                InstanceState::Running,
                InstanceState::Draining,
                Default::default(),
            )
            .await
        {
            Err(OrchestratorError::Conflict { .. }) => {}
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn idle_running_inventory() {
        let store = JobStore::open_in_memory().await.unwrap();
        let instance = store.insert_instance(&offer(), "a", "tok", 4).await.unwrap();
        assert!(store.idle_running_instances().await.unwrap().is_empty());

        store
            .transition_instance(
                instance.id,
                InstanceState::Requested,
                InstanceState::Starting,
                Default::default(),
            )
            .await
            .unwrap();
        store
            .transition_instance(
                instance.id,
                InstanceState::Starting,
                InstanceState::Running,
                Default::default(),
            )
            .await
            .unwrap();
        let idle = store.idle_running_instances().await.unwrap();
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].id, instance.id);
    }
}
