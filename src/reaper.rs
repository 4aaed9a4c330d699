//! Health and reaping: the periodic correctness net
//!
//! Everything here is idempotent and compare-and-set based, so the reaper can
//! race the scheduler and dispatcher freely: whoever moves a row first wins,
//! the loser gets a `Conflict` and shrugs.

use crate::config::ConfigHandle;
use crate::cost::CostTracker;
use crate::events::{Event, EventBus};
use crate::providers::ProviderRegistry;
use crate::store::{JobStore, TransitionDetails};
use crate::types::{AssignmentState, ErrorClass, InstanceState, JobState};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

pub struct Reaper {
    store: JobStore,
    bus: EventBus,
    config: Arc<ConfigHandle>,
    cost: Arc<CostTracker>,
    registry: Arc<ProviderRegistry>,
}

impl Reaper {
    pub fn new(
        store: JobStore,
        bus: EventBus,
        config: Arc<ConfigHandle>,
        cost: Arc<CostTracker>,
        registry: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            store,
            bus,
            config,
            cost,
            registry,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let lifecycle = self.config.snapshot().lifecycle.clone();
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(
            lifecycle.reaper_interval_secs.max(1),
        ));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut reconcile_tick = tokio::time::interval(std::time::Duration::from_secs(
            lifecycle.reconcile_interval_secs.max(1),
        ));
        reconcile_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => self.pass().await,
                _ = reconcile_tick.tick() => {
                    self.reconcile_providers().await;
                    self.archive_old_jobs().await;
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// One reaping pass.
    pub async fn pass(&self) {
        let config = self.config.snapshot();
        let now = Utc::now();

        if let Err(e) = self.store.release_expired_claims(now).await {
            warn!(error = %e, "lease expiry failed");
        }

        self.reap_stuck_pending(now - ChronoDuration::seconds(config.lifecycle.dispatch_timeout_secs))
            .await;
        self.reap_silent_workers(now - ChronoDuration::seconds(config.lifecycle.heartbeat_threshold_secs))
            .await;
        self.drain_idle(now - ChronoDuration::seconds(config.lifecycle.idle_grace_secs))
            .await;
        self.reap_start_deadline(now - ChronoDuration::seconds(config.lifecycle.start_deadline_secs))
            .await;
        self.apply_budget_brake().await;
    }

    /// Jobs assigned but never started within the dispatch timeout: fail the
    /// job, abort the assignment, drain the instance defensively.
    async fn reap_stuck_pending(&self, cutoff: chrono::DateTime<Utc>) {
        let stuck = match self.store.stuck_pending_jobs(cutoff).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "stuck-pending scan failed");
                return;
            }
        };
        for job in stuck {
            info!(job = %job.id, "pending past dispatch timeout");
            if let Ok(Some(assignment)) = self.store.live_assignment_for_job(job.id).await {
                let _ = self
                    .store
                    .transition_assignment(assignment.id, AssignmentState::Assigned, AssignmentState::Aborted)
                    .await;
                let _ = self
                    .store
                    .transition_instance(
                        assignment.instance_id,
                        InstanceState::Running,
                        InstanceState::Draining,
                        Default::default(),
                    )
                    .await;
            }
            match self
                .store
                .transition_job(
                    job.id,
                    JobState::Pending,
                    JobState::Failed,
                    TransitionDetails::failure(ErrorClass::DispatchTimeout, "stuck in pending"),
                )
                .await
            {
                Ok(_) => self.bus.publish(Event::JobTransitioned {
                    job_id: job.id,
                    from: JobState::Pending,
                    to: JobState::Failed,
                }),
                Err(e) => warn!(job = %job.id, error = %e, "stuck-pending transition lost race"),
            }
        }
    }

    /// Orphan instances: a live assignment whose worker went quiet. The
    /// dispatcher usually catches this first; this is the net under it.
    async fn reap_silent_workers(&self, cutoff: chrono::DateTime<Utc>) {
        let silent = match self.store.heartbeat_silent_instances(cutoff).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(error = %e, "heartbeat scan failed");
                return;
            }
        };
        for instance in silent {
            warn!(instance = %instance.id, provider = %instance.provider, "instance heartbeat silent");
            if let Err(e) = self.cost.final_accrual(instance.id).await {
                warn!(instance = %instance.id, error = %e, "final accrual failed");
            }
            if self
                .store
                .transition_instance(
                    instance.id,
                    InstanceState::Running,
                    InstanceState::Error,
                    Default::default(),
                )
                .await
                .is_err()
            {
                continue;
            }
            self.terminate_at_provider(&instance).await;
            self.bus.publish(Event::InstanceFailed {
                instance_id: instance.id,
                provider: instance.provider,
            });
        }
    }

    /// Instances idle past the grace period enter draining; the provisioner
    /// completes the drain.
    async fn drain_idle(&self, cutoff: chrono::DateTime<Utc>) {
        let idle = match self.store.idle_expired_instances(cutoff).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(error = %e, "idle scan failed");
                return;
            }
        };
        for instance in idle {
            match self
                .store
                .transition_instance(
                    instance.id,
                    InstanceState::Running,
                    InstanceState::Draining,
                    Default::default(),
                )
                .await
            {
                Ok(_) => info!(instance = %instance.id, "idle grace expired, draining"),
                Err(e) => warn!(instance = %instance.id, error = %e, "idle drain lost race"),
            }
        }
    }

    /// Half-created instances past the start deadline, including `requested`
    /// rows left by a crash mid-create.
    async fn reap_start_deadline(&self, cutoff: chrono::DateTime<Utc>) {
        let expired = match self.store.start_deadline_expired(cutoff).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(error = %e, "start-deadline scan failed");
                return;
            }
        };
        for instance in expired {
            warn!(instance = %instance.id, provider = %instance.provider,
                  "instance_failed(start_deadline)");
            if self
                .store
                .transition_instance(
                    instance.id,
                    instance.state,
                    InstanceState::Error,
                    Default::default(),
                )
                .await
                .is_err()
            {
                continue;
            }
            self.terminate_at_provider(&instance).await;
            self.bus.publish(Event::InstanceFailed {
                instance_id: instance.id,
                provider: instance.provider,
            });
        }
    }

    /// Over-budget owners: cancel their running work, lowest priority and
    /// newest first, one job per owner per pass so the brake is gradual.
    async fn apply_budget_brake(&self) {
        for owner in self.cost.blocked_owners() {
            match self.store.drain_candidates(&owner).await {
                Ok(candidates) => {
                    if let Some(job) = candidates.first() {
                        info!(owner = %owner, job = %job.id, "budget brake cancelling job");
                        self.bus.publish(Event::JobCancelRequested { job_id: job.id });
                    }
                }
                Err(e) => warn!(owner = %owner, error = %e, "drain candidate scan failed"),
            }
        }
    }

    /// Compare the provider's account inventory against ours and kill
    /// anything the store does not know: a leaked instance costs money
    /// silently.
    async fn reconcile_providers(&self) {
        for handle in self.registry.iter() {
            let tag = handle.tag();
            let held = match handle.list_held_instances().await {
                Ok(held) => held,
                Err(e) => {
                    warn!(provider = %tag, error = %e, "reconciliation listing failed");
                    continue;
                }
            };
            let known: HashSet<String> = match self.store.known_provider_ids(tag).await {
                Ok(known) => known.into_iter().collect(),
                Err(e) => {
                    warn!(provider = %tag, error = %e, "reconciliation store read failed");
                    continue;
                }
            };
            for orphan in held.into_iter().filter(|id| !known.contains(id)) {
                warn!(provider = %tag, provider_id = %orphan, "compliance: orphan instance on provider, terminating");
                metrics::counter!("aimad_orphan_instances_total").increment(1);
                if let Err(e) = handle.terminate_instance(&orphan).await {
                    warn!(provider = %tag, provider_id = %orphan, error = %e, "orphan terminate failed");
                }
            }
            handle.probe_health().await;
        }
    }

    /// Terminal jobs past retention move to cold storage.
    async fn archive_old_jobs(&self) {
        let retention_days = self.config.snapshot().store.retention_days;
        let cutoff = Utc::now() - ChronoDuration::days(retention_days as i64);
        match self.store.archive_terminal_jobs(cutoff).await {
            Ok(0) => {}
            Ok(count) => info!(count, "archived terminal jobs"),
            Err(e) => warn!(error = %e, "archival failed"),
        }
    }

    async fn terminate_at_provider(&self, instance: &crate::types::Instance) {
        if let (Some(handle), Some(provider_id)) = (
            self.registry.get(instance.provider),
            instance.provider_instance_id.as_ref(),
        ) {
            if let Err(e) = handle.terminate_instance(provider_id).await {
                warn!(instance = %instance.id, error = %e, "provider terminate failed");
            }
        }
    }
}
