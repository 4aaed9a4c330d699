//! Scheduler behavior against a live store

use aimad::config::{Config, ConfigHandle};
use aimad::cost::CostTracker;
use aimad::events::EventBus;
use aimad::scheduler::Scheduler;
use aimad::store::{InstanceUpdate, JobStore};
use aimad::types::{
    ErrorClass, InstanceState, JobKind, JobSpec, JobState, Offer, Priority, ProviderTag,
    ResourceProfile,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

fn spec(gpu_model: &str) -> JobSpec {
    JobSpec {
        kind: JobKind::Inference,
        priority: Priority::Normal,
        resources: ResourceProfile {
            gpu_model: gpu_model.to_string(),
            gpu_count: 1,
            memory_mb: 8_192,
            disk_gb: None,
        },
        image: "aima/inference-worker:latest".to_string(),
        env: HashMap::new(),
        inputs: vec![],
        deadline: None,
        max_retries: 3,
        cost_ceiling_cents: None,
        idempotency_key: None,
    }
}

fn offer(gpu_model: &str, memory_mb: u64, rate: i64) -> Offer {
    Offer {
        provider: ProviderTag::Local,
        region: "local".to_string(),
        gpu_model: gpu_model.to_string(),
        gpu_count: 1,
        memory_mb,
        vcpus: 8,
        disk_gb: 100,
        hourly_rate_cents: rate,
        availability: 1,
    }
}

struct Rig {
    store: JobStore,
    scheduler: Scheduler,
    capacity_rx: mpsc::Receiver<aimad::provisioner::CapacityRequest>,
    cost: Arc<CostTracker>,
}

async fn rig() -> Rig {
    let config = Arc::new(ConfigHandle::new(Config::default()));
    let store = JobStore::open_in_memory().await.unwrap();
    let bus = EventBus::new();
    let cost = Arc::new(CostTracker::new(store.clone(), Arc::clone(&config)));
    let (capacity_tx, capacity_rx) = mpsc::channel(16);
    let scheduler = Scheduler::new(
        store.clone(),
        bus,
        config,
        Arc::clone(&cost),
        capacity_tx,
    );
    Rig {
        store,
        scheduler,
        capacity_rx,
        cost,
    }
}

async fn running_instance(store: &JobStore, offer: &Offer) -> aimad::types::InstanceId {
    let instance = store.insert_instance(offer, "alice", "tok", 16).await.unwrap();
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
            InstanceUpdate {
                address: Some("127.0.0.1:9400".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    instance.id
}

#[tokio::test]
async fn matches_job_to_idle_instance() {
    let rig = rig().await;
    let instance_id = running_instance(&rig.store, &offer("RTX 4090", 32_768, 0)).await;
    let outcome = rig
        .store
        .submit_job("alice", &spec("RTX 4090"), 0, 100_000)
        .await
        .unwrap();

    rig.scheduler.schedule_pass().await;

    let job = rig.store.get_job(outcome.job.id).await.unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.instance_id, Some(instance_id));
    let assignment = rig
        .store
        .live_assignment_for_instance(instance_id)
        .await
        .unwrap()
        .expect("assignment bound");
    assert_eq!(assignment.job_id, outcome.job.id);
}

#[tokio::test]
async fn best_fit_prefers_smallest_adequate_instance() {
    let rig = rig().await;
    let big = running_instance(&rig.store, &offer("RTX 4090", 131_072, 50)).await;
    let small = running_instance(&rig.store, &offer("RTX 4090", 16_384, 50)).await;
    let outcome = rig
        .store
        .submit_job("alice", &spec("RTX 4090"), 0, 100_000)
        .await
        .unwrap();

    rig.scheduler.schedule_pass().await;

    let job = rig.store.get_job(outcome.job.id).await.unwrap();
    assert_eq!(job.instance_id, Some(small));
    assert!(rig
        .store
        .live_assignment_for_instance(big)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn unmatched_profile_requests_capacity_once_per_bucket() {
    let mut rig = rig().await;
    for _ in 0..20 {
        rig.store
            .submit_job("alice", &spec("A100"), 0, 1_000_000)
            .await
            .unwrap();
    }

    rig.scheduler.schedule_pass().await;

    // a submission burst produces one create request for the bucket, not 20
    let request = rig.capacity_rx.try_recv().expect("one capacity request");
    assert_eq!(request.profile.gpu_model, "A100");
    assert!(rig.capacity_rx.try_recv().is_err());

    // and every unmatched job went back to queued for the next pass
    assert_eq!(rig.store.queued_depth().await.unwrap(), 20);
}

#[tokio::test]
async fn deadline_at_submission_fails_on_first_pass() {
    let rig = rig().await;
    let mut s = spec("RTX 4090");
    s.deadline = Some(Utc::now());
    let outcome = rig.store.submit_job("alice", &s, 0, 100_000).await.unwrap();

    rig.scheduler.schedule_pass().await;

    let job = rig.store.get_job(outcome.job.id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error_class, Some(ErrorClass::DeadlineExceeded));
}

#[tokio::test]
async fn urgent_jobs_take_capacity_before_normal_ones() {
    let rig = rig().await;
    let instance_id = running_instance(&rig.store, &offer("RTX 4090", 32_768, 0)).await;

    let normal = rig
        .store
        .submit_job("alice", &spec("RTX 4090"), 0, 100_000)
        .await
        .unwrap();
    let urgent = rig
        .store
        .submit_job(
            "bob",
            &JobSpec {
                priority: Priority::Urgent,
                ..spec("RTX 4090")
            },
            0,
            100_000,
        )
        .await
        .unwrap();

    rig.scheduler.schedule_pass().await;

    let assignment = rig
        .store
        .live_assignment_for_instance(instance_id)
        .await
        .unwrap()
        .expect("assignment bound");
    assert_eq!(assignment.job_id, urgent.job.id);
    let normal = rig.store.get_job(normal.job.id).await.unwrap();
    assert_eq!(normal.state, JobState::Queued);
}

#[tokio::test]
async fn over_budget_owner_is_not_scheduled() {
    let rig = rig().await;
    running_instance(&rig.store, &offer("RTX 4090", 32_768, 0)).await;

    // drive alice over her ceiling with a real ledger charge
    let expensive = rig
        .store
        .insert_instance(&offer("RTX 4090", 32_768, 100_000), "alice", "tok", 16)
        .await
        .unwrap();
    let outcome = rig
        .store
        .submit_job("alice", &spec("RTX 4090"), 0, 100_000)
        .await
        .unwrap();
    let start = Utc::now() - chrono::Duration::seconds(3600);
    rig.store
        .append_cost(expensive.id, start, Utc::now(), 100_000)
        .await
        .unwrap();
    rig.cost.accrue_all().await.unwrap();
    assert!(rig.cost.is_blocked("alice"));

    rig.scheduler.schedule_pass().await;

    // the job never left the queue
    let job = rig.store.get_job(outcome.job.id).await.unwrap();
    assert_eq!(job.state, JobState::Queued);
}
