//! Cost and quota: offer ranking, estimation, budgets, accrual
//!
//! Ranking is deterministic: score by cost-effectiveness, then break ties by
//! availability, then by quota headroom (to spread load across providers),
//! then by provider tag. Estimation uses a static per-kind duration table;
//! the orchestrator does not learn durations.

use crate::config::ConfigHandle;
use crate::error::Result;
use crate::store::JobStore;
use crate::types::{InstanceState, JobKind, Offer, ProviderTag, ResourceProfile};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Expected cost of running for `mins` minutes at an hourly rate, rounded up.
pub fn expected_cost_cents(rate_cents_per_hour: i64, mins: u64) -> i64 {
    let numerator = rate_cents_per_hour
        .saturating_mul(mins as i64)
        .saturating_add(59);
    numerator / 60
}

/// Live per-provider facts the ranking needs: how many instances we hold and
/// each provider's soft quota.
#[derive(Debug, Clone, Default)]
pub struct RankContext {
    pub held: HashMap<ProviderTag, i64>,
    pub quotas: HashMap<ProviderTag, u32>,
}

impl RankContext {
    fn headroom(&self, tag: ProviderTag) -> i64 {
        let quota = self.quotas.get(&tag).copied().unwrap_or(0) as i64;
        let held = self.held.get(&tag).copied().unwrap_or(0);
        quota - held
    }
}

/// Order offers best-first for a job of the given kind and profile.
///
/// Unsuitable offers are dropped. Suitable ones score by
/// `1 / (hourly price x expected duration)`; a free offer (local pool)
/// always wins.
pub fn rank_offers(
    profile: &ResourceProfile,
    kind: JobKind,
    mut offers: Vec<Offer>,
    ctx: &RankContext,
    expected_mins: u64,
) -> Vec<Offer> {
    let _ = kind;
    offers.retain(|o| o.satisfies(profile));
    offers.sort_by(|a, b| {
        let cost_a = expected_cost_cents(a.hourly_rate_cents, expected_mins);
        let cost_b = expected_cost_cents(b.hourly_rate_cents, expected_mins);
        cost_a
            .cmp(&cost_b)
            .then_with(|| b.availability.cmp(&a.availability))
            .then_with(|| ctx.headroom(b.provider).cmp(&ctx.headroom(a.provider)))
            .then_with(|| a.provider.as_str().cmp(b.provider.as_str()))
    });
    offers
}

/// Per-owner budgets and the budget brake.
///
/// Owners whose live cost crosses their ceiling land in the blocked set: the
/// scheduler stops claiming their jobs and the reaper drains their running
/// work, lowest priority and newest first. The set is re-derived on every
/// accrual pass, so paying down (instances stopping) unblocks automatically.
pub struct CostTracker {
    store: JobStore,
    config: Arc<ConfigHandle>,
    blocked: Mutex<HashSet<String>>,
}

impl CostTracker {
    pub fn new(store: JobStore, config: Arc<ConfigHandle>) -> Self {
        Self {
            store,
            config,
            blocked: Mutex::new(HashSet::new()),
        }
    }

    pub fn ceiling_for(&self, owner: &str) -> i64 {
        let config = self.config.snapshot();
        config
            .cost
            .owner_ceilings
            .get(owner)
            .copied()
            .unwrap_or(config.cost.default_owner_ceiling_cents)
    }

    /// Cost estimate used at submission time, before any offer is known:
    /// the reference rate times the kind's expected duration.
    pub fn submission_estimate(&self, kind: JobKind) -> i64 {
        let config = self.config.snapshot();
        expected_cost_cents(
            config.cost.reference_rate_cents_per_hour,
            config.cost.expected_duration_mins_for(kind),
        )
    }

    pub fn expected_mins(&self, kind: JobKind) -> u64 {
        self.config.snapshot().cost.expected_duration_mins_for(kind)
    }

    /// Whether new work from this owner may be scheduled.
    pub fn is_blocked(&self, owner: &str) -> bool {
        self.blocked.lock().expect("blocked set poisoned").contains(owner)
    }

    pub fn blocked_owners(&self) -> Vec<String> {
        self.blocked
            .lock()
            .expect("blocked set poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// One accrual pass: charge elapsed time on every non-terminal instance,
    /// then re-derive the blocked-owner set.
    pub async fn accrue_all(&self) -> Result<()> {
        let instances = self
            .store
            .instances_in_states(&[
                InstanceState::Requested,
                InstanceState::Starting,
                InstanceState::Running,
                InstanceState::Draining,
            ])
            .await?;
        for instance in &instances {
            if let Err(e) = self.accrue_one(instance.id).await {
                warn!(instance = %instance.id, error = %e, "cost accrual failed");
            }
        }
        self.refresh_blocked().await?;
        Ok(())
    }

    /// Charge a single instance from the end of its last ledger entry (or
    /// its creation) up to now.
    pub async fn accrue_one(&self, instance_id: crate::types::InstanceId) -> Result<()> {
        let instance = self.store.get_instance(instance_id).await?;
        let start = match self.store.last_ledger_end(instance_id).await? {
            Some(end) => end,
            None => instance.created_at,
        };
        let end = Utc::now();
        if end <= start {
            return Ok(());
        }
        self.store
            .append_cost(instance_id, start, end, instance.hourly_rate_cents)
            .await?;
        Ok(())
    }

    /// The final partial-period entry, written as an instance terminates.
    pub async fn final_accrual(&self, instance_id: crate::types::InstanceId) -> Result<()> {
        self.accrue_one(instance_id).await
    }

    async fn refresh_blocked(&self) -> Result<()> {
        let owners = self.store.owners_with_live_work().await?;
        let mut next = HashSet::new();
        for owner in owners {
            let live = self.store.owner_live_cost(&owner).await?;
            let ceiling = self.ceiling_for(&owner);
            if live > ceiling {
                info!(owner = %owner, live, ceiling, "budget brake engaged");
                next.insert(owner);
            }
        }
        let mut blocked = self.blocked.lock().expect("blocked set poisoned");
        for released in blocked.difference(&next) {
            debug!(owner = %released, "budget brake released");
        }
        *blocked = next;
        Ok(())
    }

    /// Periodic accrual loop; flushes one final pass on shutdown so no
    /// charged time is lost.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.snapshot().cost.accrual_interval_secs;
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.accrue_all().await {
                        warn!(error = %e, "accrual pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if let Err(e) = self.accrue_all().await {
                        warn!(error = %e, "final accrual flush failed");
                    }
                    return;
                }
            }
        }
    }
}
