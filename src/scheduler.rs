//! Scheduler: pairing queued jobs with idle running instances
//!
//! Event-driven with a periodic tick as a correctness net. Each pass claims a
//! batch of queued jobs under a lease, matches them best-fit against idle
//! capacity, and asks the provisioner for new capacity for the profiles that
//! found none. Binding is a compare-and-set in the store, so several
//! schedulers (or a scheduler racing the reaper) cannot double-place a job;
//! a conflict just requeues the job for the next pass.

use crate::config::ConfigHandle;
use crate::cost::CostTracker;
use crate::events::{Event, EventBus};
use crate::provisioner::CapacityRequest;
use crate::store::{JobStore, TransitionDetails};
use crate::types::{ErrorClass, Instance, InstanceState, Job, JobState};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub struct Scheduler {
    store: JobStore,
    bus: EventBus,
    config: Arc<ConfigHandle>,
    cost: Arc<CostTracker>,
    capacity: mpsc::Sender<CapacityRequest>,
}

impl Scheduler {
    pub fn new(
        store: JobStore,
        bus: EventBus,
        config: Arc<ConfigHandle>,
        cost: Arc<CostTracker>,
        capacity: mpsc::Sender<CapacityRequest>,
    ) -> Self {
        Self {
            store,
            bus,
            config,
            cost,
            capacity,
        }
    }

    fn wakes_scheduler(event: &Event) -> bool {
        matches!(
            event,
            Event::JobSubmitted { .. }
                | Event::InstanceReady { .. }
                | Event::InstanceIdle { .. }
        )
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.bus.subscribe();
        let tick_secs = self.config.snapshot().scheduler.tick_interval_secs;
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(tick_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.schedule_pass().await,
                received = events.recv() => {
                    match received {
                        Ok(event) if Self::wakes_scheduler(&event) => {
                            // coalesce whatever else is queued; one pass reads
                            // fresh state anyway
                            while let Ok(_more) = events.try_recv() {}
                            self.schedule_pass().await;
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                            self.schedule_pass().await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// One scheduling pass over the claimable queue.
    pub async fn schedule_pass(&self) {
        let config = self.config.snapshot();
        let blocked = self.cost.blocked_owners();
        let claimed = match self
            .store
            .claim_queued(
                config.scheduler.claim_batch,
                &blocked,
                config.scheduler.claim_lease_secs,
            )
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "claim_queued failed");
                return;
            }
        };
        if let Ok(depth) = self.store.queued_depth().await {
            metrics::gauge!("aimad_jobs_queued").set(depth as f64);
        }
        if claimed.is_empty() {
            return;
        }

        let mut idle = match self.store.idle_running_instances().await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(error = %e, "could not load idle instances");
                Vec::new()
            }
        };
        // best-fit: smallest adequate spec first
        idle.sort_by_key(|i| (i.gpu_count, i.memory_mb, i.hourly_rate_cents));

        let now = Utc::now();
        let mut unmatched: Vec<Job> = Vec::new();
        for job in claimed {
            if let Some(deadline) = job.spec.deadline {
                if deadline <= now {
                    self.fail_job(
                        &job,
                        ErrorClass::DeadlineExceeded,
                        "deadline passed before placement",
                    )
                    .await;
                    continue;
                }
            }
            match self.match_job(&job, &mut idle).await {
                MatchOutcome::Bound => {}
                MatchOutcome::NoCapacity => unmatched.push(job),
                MatchOutcome::Conflict => {
                    // someone else moved the job or took the instance;
                    // requeue and let the next pass sort it out
                    if let Err(e) = self.store.release_claim(job.id).await {
                        warn!(job = %job.id, error = %e, "requeue after conflict failed");
                    }
                }
            }
        }

        self.request_capacity_for(&unmatched).await;

        // unmatched jobs go back to queued, except those past the global
        // no-capacity wait ceiling
        let ceiling = ChronoDuration::seconds(config.scheduler.no_capacity_wait_secs);
        for job in unmatched {
            if now - job.created_at > ceiling {
                self.fail_job(&job, ErrorClass::NoCapacity, "no capacity within wait ceiling")
                    .await;
            } else if let Err(e) = self.store.release_claim(job.id).await {
                warn!(job = %job.id, error = %e, "release claim failed");
            }
        }
    }

    async fn match_job(&self, job: &Job, idle: &mut Vec<Instance>) -> MatchOutcome {
        let position = idle.iter().position(|i| {
            job.spec
                .resources
                .satisfied_by(&i.gpu_model, i.gpu_count, i.memory_mb)
        });
        let Some(position) = position else {
            return MatchOutcome::NoCapacity;
        };
        let instance = idle.remove(position);
        match self.store.bind_assignment(job.id, instance.id).await {
            Ok(assignment) => {
                info!(job = %job.id, instance = %instance.id, "assignment bound");
                metrics::counter!("aimad_assignments_bound_total").increment(1);
                self.bus.publish(Event::AssignmentBound {
                    assignment_id: assignment.id,
                    job_id: job.id,
                    instance_id: instance.id,
                });
                MatchOutcome::Bound
            }
            Err(crate::error::OrchestratorError::Conflict { .. }) => MatchOutcome::Conflict,
            Err(e) => {
                warn!(job = %job.id, error = %e, "bind failed");
                MatchOutcome::Conflict
            }
        }
    }

    /// Ask for new capacity, one instance per unmatched profile bucket, and
    /// only while the in-flight create budget is not exhausted. The bucket
    /// grows lazily: a burst of identical submissions produces one create,
    /// not one per job.
    async fn request_capacity_for(&self, unmatched: &[Job]) {
        if unmatched.is_empty() {
            return;
        }
        let config = self.config.snapshot();
        let in_flight = match self
            .store
            .instances_in_states(&[InstanceState::Requested, InstanceState::Starting])
            .await
        {
            Ok(instances) => instances,
            Err(e) => {
                warn!(error = %e, "could not count in-flight creates");
                return;
            }
        };

        let mut requested_buckets: HashSet<(String, u32)> = HashSet::new();
        for job in unmatched {
            let bucket = job.spec.resources.bucket_key();
            if !requested_buckets.insert(bucket) {
                continue;
            }
            let pending_for_profile = in_flight
                .iter()
                .filter(|i| {
                    job.spec
                        .resources
                        .satisfied_by(&i.gpu_model, i.gpu_count, i.memory_mb)
                })
                .count() as u32;
            if pending_for_profile >= config.scheduler.max_pending_creates_per_provider {
                debug!(job = %job.id, "create budget for profile exhausted");
                continue;
            }
            let request = CapacityRequest {
                profile: job.spec.resources.clone(),
                kind: job.spec.kind,
                owner: job.owner.clone(),
            };
            if self.capacity.try_send(request).is_err() {
                debug!("capacity channel full, provisioner is behind");
                return;
            }
        }
    }

    async fn fail_job(&self, job: &Job, class: ErrorClass, message: &str) {
        match self
            .store
            .transition_job(
                job.id,
                JobState::Pending,
                JobState::Failed,
                TransitionDetails::failure(class, message),
            )
            .await
        {
            Ok(_) => {
                info!(job = %job.id, class = class.as_str(), "job failed in scheduler");
                self.bus.publish(Event::JobTransitioned {
                    job_id: job.id,
                    from: JobState::Pending,
                    to: JobState::Failed,
                });
            }
            Err(e) => warn!(job = %job.id, error = %e, "fail transition conflicted"),
        }
    }
}

enum MatchOutcome {
    Bound,
    NoCapacity,
    Conflict,
}
