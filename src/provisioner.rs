//! Provisioner: per-provider instance lifecycle loops
//!
//! One loop runs per enabled provider. Each loop accepts provision orders,
//! drives `requested -> starting -> running` by polling the provider with a
//! jittered interval, and completes drains (`draining -> stopped`) once the
//! last assignment is gone. A front loop takes capacity requests from the
//! scheduler, gathers offers from every provider, ranks them, and routes an
//! order to the winning provider's loop.
//!
//! The start deadline is a hard wall-clock bound: an instance that has not
//! been observed `running` by then becomes `error`, not a longer wait.

use crate::config::ConfigHandle;
use crate::cost::{rank_offers, CostTracker, RankContext};
use crate::events::{Event, EventBus};
use crate::provider::BootParams;
use crate::providers::{ProviderHandle, ProviderRegistry};
use crate::store::{InstanceUpdate, JobStore};
use crate::types::{
    Instance, InstanceState, JobKind, Offer, ProviderTag, ResourceProfile,
};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Ask the provisioner to acquire one instance able to run the profile.
#[derive(Debug, Clone)]
pub struct CapacityRequest {
    pub profile: ResourceProfile,
    pub kind: JobKind,
    pub owner: String,
}

#[derive(Debug, Clone)]
struct ProvisionOrder {
    offer: Offer,
    owner: String,
    kind: JobKind,
}

struct ProviderWorker {
    handle: Arc<ProviderHandle>,
    store: JobStore,
    bus: EventBus,
    config: Arc<ConfigHandle>,
    cost: Arc<CostTracker>,
    creates_in_flight: AtomicU32,
}

impl ProviderWorker {
    fn boot_params(&self, kind: JobKind, token: &str) -> BootParams {
        let config = self.config.snapshot();
        let image = config
            .templates
            .image_for(kind)
            .unwrap_or("aima/custom-worker:latest")
            .to_string();
        BootParams {
            image,
            bootstrap_token: token.to_string(),
            env: HashMap::new(),
        }
    }

    /// Drive one order through `requested -> starting` (or `error`).
    async fn handle_order(self: &Arc<Self>, order: ProvisionOrder) {
        let tag = self.handle.tag();
        let token = format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        );
        let instance = match self
            .store
            .insert_instance(&order.offer, &order.owner, &token, self.handle.soft_quota())
            .await
        {
            Ok(instance) => instance,
            Err(e) => {
                debug!(provider = %tag, error = %e, "provision order dropped");
                return;
            }
        };

        self.creates_in_flight.fetch_add(1, Ordering::SeqCst);
        let boot = self.boot_params(order.kind, &token);
        let created = self.handle.create_instance(&order.offer, &boot).await;
        self.creates_in_flight.fetch_sub(1, Ordering::SeqCst);

        match created {
            Ok(provider_instance_id) => {
                info!(provider = %tag, instance = %instance.id, provider_id = %provider_instance_id,
                      "instance create accepted");
                if let Err(e) = self
                    .store
                    .transition_instance(
                        instance.id,
                        InstanceState::Requested,
                        InstanceState::Starting,
                        InstanceUpdate {
                            provider_instance_id: Some(provider_instance_id),
                            ..Default::default()
                        },
                    )
                    .await
                {
                    warn!(instance = %instance.id, error = %e, "requested->starting failed");
                }
            }
            Err(e) => {
                warn!(provider = %tag, instance = %instance.id, error = %e, "instance create failed");
                let _ = self
                    .store
                    .transition_instance(
                        instance.id,
                        InstanceState::Requested,
                        InstanceState::Error,
                        Default::default(),
                    )
                    .await;
                self.bus.publish(Event::InstanceFailed {
                    instance_id: instance.id,
                    provider: tag,
                });
            }
        }
    }

    /// Poll every `starting` instance on this provider once.
    async fn poll_starting(self: &Arc<Self>) {
        let tag = self.handle.tag();
        let starting = match self.store.instances_in_states(&[InstanceState::Starting]).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(error = %e, "could not load starting instances");
                return;
            }
        };
        let deadline = self.config.snapshot().lifecycle.start_deadline_secs;
        for instance in starting.into_iter().filter(|i| i.provider == tag) {
            self.poll_one(instance, deadline).await;
        }
    }

    async fn poll_one(self: &Arc<Self>, instance: Instance, start_deadline_secs: i64) {
        let tag = self.handle.tag();
        if Utc::now() - instance.created_at > ChronoDuration::seconds(start_deadline_secs) {
            warn!(instance = %instance.id, "start deadline exceeded");
            self.fail_starting(&instance).await;
            return;
        }
        let Some(provider_id) = instance.provider_instance_id.clone() else {
            return;
        };
        let observation = match self.handle.observe_instance(&provider_id).await {
            Ok(observation) => observation,
            Err(e) => {
                debug!(instance = %instance.id, error = %e, "observe failed");
                return;
            }
        };
        use crate::provider::ObservedState::*;
        match observation.state {
            Running => {
                let update = InstanceUpdate {
                    address: observation.external_address,
                    started_at: observation.started_at,
                    ..Default::default()
                };
                match self
                    .store
                    .transition_instance(instance.id, InstanceState::Starting, InstanceState::Running, update)
                    .await
                {
                    Ok(_) => {
                        info!(provider = %tag, instance = %instance.id, "instance ready");
                        self.bus.publish(Event::InstanceReady {
                            instance_id: instance.id,
                            provider: tag,
                        });
                    }
                    Err(e) => warn!(instance = %instance.id, error = %e, "starting->running failed"),
                }
            }
            Error | Stopped => {
                warn!(instance = %instance.id, state = ?observation.state, "instance died while starting");
                self.fail_starting(&instance).await;
            }
            Starting | Stopping => {}
        }
    }

    async fn fail_starting(self: &Arc<Self>, instance: &Instance) {
        let _ = self
            .store
            .transition_instance(
                instance.id,
                instance.state,
                InstanceState::Error,
                Default::default(),
            )
            .await;
        if let Some(provider_id) = &instance.provider_instance_id {
            if let Err(e) = self.handle.terminate_instance(provider_id).await {
                warn!(instance = %instance.id, error = %e, "terminate after start failure");
            }
        }
        self.bus.publish(Event::InstanceFailed {
            instance_id: instance.id,
            provider: self.handle.tag(),
        });
    }

    /// Finish drains: once a draining instance has no live assignment, write
    /// the final ledger entry, terminate at the provider, and stop it.
    async fn complete_drains(self: &Arc<Self>) {
        let tag = self.handle.tag();
        let draining = match self.store.instances_in_states(&[InstanceState::Draining]).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(error = %e, "could not load draining instances");
                return;
            }
        };
        for instance in draining.into_iter().filter(|i| i.provider == tag) {
            match self.store.live_assignment_for_instance(instance.id).await {
                Ok(None) => {}
                Ok(Some(_)) => continue,
                Err(e) => {
                    warn!(error = %e, "drain check failed");
                    continue;
                }
            }
            if let Err(e) = self.cost.final_accrual(instance.id).await {
                warn!(instance = %instance.id, error = %e, "final accrual failed");
            }
            if let Some(provider_id) = &instance.provider_instance_id {
                if let Err(e) = self.handle.terminate_instance(provider_id).await {
                    // leave it draining; the next tick retries
                    warn!(instance = %instance.id, error = %e, "terminate failed, will retry");
                    continue;
                }
            }
            match self
                .store
                .transition_instance(
                    instance.id,
                    InstanceState::Draining,
                    InstanceState::Stopped,
                    Default::default(),
                )
                .await
            {
                Ok(_) => info!(provider = %tag, instance = %instance.id, "instance stopped"),
                Err(e) => warn!(instance = %instance.id, error = %e, "draining->stopped failed"),
            }
        }
    }

    /// The provider loop: orders, plus a jittered poll tick driving starting
    /// and draining instances. Jitter keeps a fleet of orchestrators from
    /// synchronizing their polls into provider rate limits.
    async fn run(
        self: Arc<Self>,
        mut orders: mpsc::Receiver<ProvisionOrder>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let base_poll = self.handle.common().poll_interval_secs.max(1);
        loop {
            let jittered = Duration::from_millis(
                base_poll * 1000 + (fastrand::f64() * base_poll as f64 * 200.0) as u64,
            );
            tokio::select! {
                maybe_order = orders.recv() => {
                    let Some(order) = maybe_order else { return };
                    // a half-open breaker admits one probe; serialize creates
                    // through it instead of racing several
                    let serialize = self.handle.breaker_state()
                        == crate::breaker::BreakerState::HalfOpen
                        && self.creates_in_flight.load(Ordering::SeqCst) > 0;
                    if serialize {
                        self.handle_order(order).await;
                    } else {
                        let worker = Arc::clone(&self);
                        tokio::spawn(async move { worker.handle_order(order).await });
                    }
                }
                _ = tokio::time::sleep(jittered) => {
                    self.poll_starting().await;
                    self.complete_drains().await;
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}

pub struct Provisioner {
    store: JobStore,
    registry: Arc<ProviderRegistry>,
    bus: EventBus,
    config: Arc<ConfigHandle>,
    cost: Arc<CostTracker>,
    request_tx: mpsc::Sender<CapacityRequest>,
    request_rx: Option<mpsc::Receiver<CapacityRequest>>,
}

impl Provisioner {
    pub fn new(
        store: JobStore,
        registry: Arc<ProviderRegistry>,
        bus: EventBus,
        config: Arc<ConfigHandle>,
        cost: Arc<CostTracker>,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::channel(256);
        Self {
            store,
            registry,
            bus,
            config,
            cost,
            request_tx,
            request_rx: Some(request_rx),
        }
    }

    /// Channel the scheduler uses to ask for capacity.
    pub fn capacity_requester(&self) -> mpsc::Sender<CapacityRequest> {
        self.request_tx.clone()
    }

    /// Spawn the front loop, one loop per provider, and (if enabled) the
    /// warm-up loop.
    pub fn spawn(&mut self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let mut order_senders: HashMap<ProviderTag, mpsc::Sender<ProvisionOrder>> = HashMap::new();

        for provider in self.registry.iter() {
            let (tx, rx) = mpsc::channel(64);
            order_senders.insert(provider.tag(), tx);
            let worker = Arc::new(ProviderWorker {
                handle: Arc::clone(provider),
                store: self.store.clone(),
                bus: self.bus.clone(),
                config: Arc::clone(&self.config),
                cost: Arc::clone(&self.cost),
                creates_in_flight: AtomicU32::new(0),
            });
            handles.push(tokio::spawn(worker.run(rx, shutdown.clone())));
        }

        let request_rx = self
            .request_rx
            .take()
            .expect("provisioner spawned twice");
        let front = FrontLoop {
            store: self.store.clone(),
            registry: Arc::clone(&self.registry),
            cost: Arc::clone(&self.cost),
            order_senders,
        };
        handles.push(tokio::spawn(front.run(request_rx, shutdown.clone())));

        if self.config.snapshot().warmup.enabled {
            let warmup = WarmupLoop {
                store: self.store.clone(),
                config: Arc::clone(&self.config),
                request_tx: self.request_tx.clone(),
            };
            handles.push(tokio::spawn(warmup.run(shutdown)));
        }
        handles
    }
}

struct FrontLoop {
    store: JobStore,
    registry: Arc<ProviderRegistry>,
    cost: Arc<CostTracker>,
    order_senders: HashMap<ProviderTag, mpsc::Sender<ProvisionOrder>>,
}

impl FrontLoop {
    async fn run(self, mut requests: mpsc::Receiver<CapacityRequest>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                maybe_request = requests.recv() => {
                    let Some(request) = maybe_request else { return };
                    self.acquire(request).await;
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Gather offers from every provider, rank, and route an order to the
    /// first provider that can take it.
    async fn acquire(&self, request: CapacityRequest) {
        let mut context = RankContext::default();
        let mut all_offers = Vec::new();

        let offer_futures = self
            .registry
            .iter()
            .map(|p| {
                let profile = request.profile.clone();
                let provider = Arc::clone(p);
                async move {
                    let offers = provider.list_offers(&profile).await;
                    (provider.tag(), provider.soft_quota(), offers)
                }
            })
            .collect::<Vec<_>>();
        for (tag, quota, offers) in futures::future::join_all(offer_futures).await {
            let held = self.store.count_nonterminal(tag).await.unwrap_or(0);
            context.held.insert(tag, held);
            context.quotas.insert(tag, quota);
            if held < quota as i64 {
                all_offers.extend(offers);
            }
        }

        let expected_mins = self.cost.expected_mins(request.kind);
        let ranked = rank_offers(&request.profile, request.kind, all_offers, &context, expected_mins);
        if ranked.is_empty() {
            metrics::counter!("aimad_capacity_unavailable_total").increment(1);
            debug!(profile = ?request.profile, "no offers anywhere for profile");
            return;
        }
        for offer in ranked {
            let Some(sender) = self.order_senders.get(&offer.provider) else {
                continue;
            };
            let order = ProvisionOrder {
                offer: offer.clone(),
                owner: request.owner.clone(),
                kind: request.kind,
            };
            if sender.try_send(order).is_ok() {
                debug!(provider = %offer.provider, "capacity order placed");
                return;
            }
        }
        warn!("all provider order queues full, capacity request dropped");
    }
}

/// Predictive warm-up: watch queue depth over a sliding window and keep up to
/// `max_spares` spare instances ahead of demand. Off by default.
struct WarmupLoop {
    store: JobStore,
    config: Arc<ConfigHandle>,
    request_tx: mpsc::Sender<CapacityRequest>,
}

impl WarmupLoop {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut samples: std::collections::VecDeque<i64> = std::collections::VecDeque::new();
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let config = self.config.snapshot();
                    let depth = self.store.queued_depth().await.unwrap_or(0);
                    samples.push_back(depth);
                    while samples.len() > config.warmup.window_mins as usize {
                        samples.pop_front();
                    }
                    let avg = samples.iter().sum::<i64>() / samples.len().max(1) as i64;
                    if avg == 0 {
                        continue;
                    }
                    let idle = self.store.idle_running_instances().await.map(|v| v.len()).unwrap_or(0);
                    if idle as u32 >= config.warmup.max_spares {
                        continue;
                    }
                    if let Ok(Some(job)) = self.store.oldest_queued_job().await {
                        let _ = self.request_tx.try_send(CapacityRequest {
                            profile: job.spec.resources.clone(),
                            kind: job.spec.kind,
                            owner: job.owner.clone(),
                        });
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}
