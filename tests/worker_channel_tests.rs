//! End-to-end dispatcher tests against a mock worker
//!
//! A real WebSocket server plays the worker: it checks the bootstrap token,
//! reads the start message, and then behaves per scenario (complete, fail,
//! go silent, ignore cancellation). The dispatcher under test runs its full
//! loop; assertions read the store.

use aimad::config::{Config, ConfigHandle};
use aimad::cost::CostTracker;
use aimad::dispatcher::{Dispatcher, ServerMessage, WorkerMessage, WorkerFailureClass};
use aimad::events::{Event, EventBus};
use aimad::providers::ProviderRegistry;
use aimad::store::{InstanceUpdate, JobStore};
use aimad::types::{
    AssignmentState, ErrorClass, InstanceId, InstanceState, JobId, JobKind, JobSpec, JobState,
    Offer, Priority, ProviderTag, ResourceProfile,
};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

#[derive(Clone, Copy)]
enum WorkerBehavior {
    Complete,
    FailRetryable,
    Silent,
    IgnoreCancel,
}

/// Spawn a mock worker server; returns its address and a channel yielding
/// the Authorization header of each connection.
async fn spawn_mock_worker(
    behavior: WorkerBehavior,
) -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (auth_tx, auth_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let auth_tx = auth_tx.clone();
            tokio::spawn(async move {
                let mut auth_header = String::new();
                let callback = |request: &Request, response: Response| {
                    auth_header = request
                        .headers()
                        .get("Authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    Ok(response)
                };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                else {
                    return;
                };
                let _ = auth_tx.send(auth_header);

                // first frame must be the start message
                let Some(Ok(Message::Text(first))) = ws.next().await else {
                    return;
                };
                let start: ServerMessage = serde_json::from_str(&first).unwrap();
                assert!(matches!(start, ServerMessage::Start { .. }));

                match behavior {
                    WorkerBehavior::Complete => {
                        let progress = WorkerMessage::Progress {
                            pct: 50.0,
                            message: Some("halfway".to_string()),
                        };
                        let _ = ws
                            .send(Message::Text(serde_json::to_string(&progress).unwrap()))
                            .await;
                        let done = WorkerMessage::Completed {
                            result_ref: "s3://aima-results/out.json".to_string(),
                        };
                        let _ = ws
                            .send(Message::Text(serde_json::to_string(&done).unwrap()))
                            .await;
                    }
                    WorkerBehavior::FailRetryable => {
                        let failed = WorkerMessage::Failed {
                            class: WorkerFailureClass::Retryable,
                            message: "cuda oom".to_string(),
                        };
                        let _ = ws
                            .send(Message::Text(serde_json::to_string(&failed).unwrap()))
                            .await;
                    }
                    WorkerBehavior::Silent => {
                        // hold the connection open, never speak again
                        while ws.next().await.is_some() {}
                    }
                    WorkerBehavior::IgnoreCancel => {
                        loop {
                            let heartbeat = WorkerMessage::Heartbeat;
                            let _ = ws
                                .send(Message::Text(serde_json::to_string(&heartbeat).unwrap()))
                                .await;
                            tokio::select! {
                                frame = ws.next() => {
                                    match frame {
                                        Some(Ok(Message::Text(text))) => {
                                            let msg: ServerMessage =
                                                serde_json::from_str(&text).unwrap();
                                            if matches!(msg, ServerMessage::Cancel) {
                                                // acknowledge nothing; hold the line
                                                while ws.next().await.is_some() {}
                                                return;
                                            }
                                        }
                                        _ => return,
                                    }
                                }
                                _ = tokio::time::sleep(Duration::from_millis(150)) => {}
                            }
                        }
                    }
                }
            });
        }
    });
    (addr, auth_rx)
}

struct Harness {
    store: JobStore,
    bus: EventBus,
    _shutdown: watch::Sender<bool>,
}

async fn harness(worker_addr: SocketAddr) -> Harness {
    let mut config = Config::default();
    config.lifecycle.heartbeat_threshold_secs = 1;
    config.lifecycle.cancel_grace_secs = 1;
    config.lifecycle.dispatch_timeout_secs = 5;
    if let Some(local) = config.providers.local.as_mut() {
        for slot in &mut local.slots {
            slot.address = worker_addr.to_string();
        }
    }
    let config_handle = Arc::new(ConfigHandle::new(config.clone()));
    let store = JobStore::open_in_memory().await.unwrap();
    let bus = EventBus::new();
    let registry = Arc::new(ProviderRegistry::from_config(&config).await.unwrap());
    let cost = Arc::new(CostTracker::new(store.clone(), Arc::clone(&config_handle)));
    let dispatcher = Dispatcher::new(
        store.clone(),
        bus.clone(),
        config_handle,
        cost,
        registry,
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(dispatcher.run(shutdown_rx));
    // let the dispatcher subscribe before events start flowing
    tokio::time::sleep(Duration::from_millis(50)).await;
    Harness {
        store,
        bus,
        _shutdown: shutdown_tx,
    }
}

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
        inputs: vec!["s3://media/video.mp4".to_string()],
        deadline: None,
        max_retries: 2,
        cost_ceiling_cents: None,
        idempotency_key: None,
    }
}

/// Persist a bound (job, instance, assignment) triple ready for dispatch.
async fn bound_assignment(harness: &Harness, worker_addr: SocketAddr) -> (JobId, InstanceId, i64) {
    let outcome = harness
        .store
        .submit_job("alice", &spec(), 0, 100_000)
        .await
        .unwrap();
    harness.store.claim_queued(1, &[], 30).await.unwrap();

    let offer = Offer {
        provider: ProviderTag::Local,
        region: "local".to_string(),
        gpu_model: "RTX 4090".to_string(),
        gpu_count: 1,
        memory_mb: 32_768,
        vcpus: 16,
        disk_gb: 200,
        hourly_rate_cents: 0,
        availability: 1,
    };
    let instance = harness
        .store
        .insert_instance(&offer, "alice", "tok-secret", 8)
        .await
        .unwrap();
    harness
        .store
        .transition_instance(
            instance.id,
            InstanceState::Requested,
            InstanceState::Starting,
            InstanceUpdate {
                provider_instance_id: Some("slot0-test".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    harness
        .store
        .transition_instance(
            instance.id,
            InstanceState::Starting,
            InstanceState::Running,
            InstanceUpdate {
                address: Some(worker_addr.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let assignment = harness
        .store
        .bind_assignment(outcome.job.id, instance.id)
        .await
        .unwrap();
    harness.bus.publish(Event::AssignmentBound {
        assignment_id: assignment.id,
        job_id: outcome.job.id,
        instance_id: instance.id,
    });
    (outcome.job.id, instance.id, assignment.id)
}

async fn wait_for_job_state(store: &JobStore, id: JobId, expected: JobState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let job = store.get_job(id).await.unwrap();
        if job.state == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} stuck in {:?}, wanted {expected:?}",
            job.state
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn happy_path_completes_job() {
    let (addr, mut auth_rx) = spawn_mock_worker(WorkerBehavior::Complete).await;
    let harness = harness(addr).await;
    let (job_id, instance_id, assignment_id) = bound_assignment(&harness, addr).await;

    wait_for_job_state(&harness.store, job_id, JobState::Completed).await;

    let job = harness.store.get_job(job_id).await.unwrap();
    assert_eq!(job.result_ref.as_deref(), Some("s3://aima-results/out.json"));
    assert!(job.started_at.is_some());
    assert!(job.finished_at.is_some());
    assert!(job.final_cost_cents.unwrap_or(-1) >= 0);

    let assignment = harness.store.get_assignment(assignment_id).await.unwrap();
    assert_eq!(assignment.state, AssignmentState::Completed);

    // the worker saw the bootstrap token
    let auth = auth_rx.recv().await.unwrap();
    assert_eq!(auth, "Bearer tok-secret");

    // instance survives and is idle again
    let instance = harness.store.get_instance(instance_id).await.unwrap();
    assert_eq!(instance.state, InstanceState::Running);
    assert!(harness
        .store
        .live_assignment_for_instance(instance_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn retryable_failure_spawns_retry_job() {
    let (addr, _auth) = spawn_mock_worker(WorkerBehavior::FailRetryable).await;
    let harness = harness(addr).await;
    let (job_id, _instance_id, assignment_id) = bound_assignment(&harness, addr).await;

    wait_for_job_state(&harness.store, job_id, JobState::Failed).await;

    let job = harness.store.get_job(job_id).await.unwrap();
    assert_eq!(job.error_class, Some(ErrorClass::Retryable));
    let assignment = harness.store.get_assignment(assignment_id).await.unwrap();
    assert_eq!(assignment.state, AssignmentState::Failed);

    // a retry job referencing the failed one is queued
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let page = harness
            .store
            .list_jobs(&Default::default(), None, 50)
            .await
            .unwrap();
        if let Some(retry) = page.jobs.iter().find(|j| j.retry_of == Some(job_id)) {
            assert_eq!(retry.state, JobState::Queued);
            assert_eq!(retry.retry_count, 1);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no retry job appeared");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn lost_heartbeat_aborts_and_retries() {
    let (addr, _auth) = spawn_mock_worker(WorkerBehavior::Silent).await;
    let harness = harness(addr).await;
    let (job_id, instance_id, assignment_id) = bound_assignment(&harness, addr).await;

    wait_for_job_state(&harness.store, job_id, JobState::Failed).await;

    let job = harness.store.get_job(job_id).await.unwrap();
    assert_eq!(job.error_class, Some(ErrorClass::LostWorker));
    let assignment = harness.store.get_assignment(assignment_id).await.unwrap();
    assert_eq!(assignment.state, AssignmentState::Aborted);

    // the suspect instance is condemned
    let instance = harness.store.get_instance(instance_id).await.unwrap();
    assert_eq!(instance.state, InstanceState::Error);

    // retry budget applies to lost workers too
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let page = harness
            .store
            .list_jobs(&Default::default(), None, 50)
            .await
            .unwrap();
        if page.jobs.iter().any(|j| j.retry_of == Some(job_id)) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no retry job appeared");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn cancellation_aborts_within_grace_and_keeps_instance() {
    let (addr, _auth) = spawn_mock_worker(WorkerBehavior::IgnoreCancel).await;
    let harness = harness(addr).await;
    let (job_id, instance_id, assignment_id) = bound_assignment(&harness, addr).await;

    wait_for_job_state(&harness.store, job_id, JobState::Running).await;
    harness.bus.publish(Event::JobCancelRequested { job_id });

    wait_for_job_state(&harness.store, job_id, JobState::Cancelled).await;

    let assignment = harness.store.get_assignment(assignment_id).await.unwrap();
    assert_eq!(assignment.state, AssignmentState::Aborted);

    // the instance returns to the pool rather than being terminated
    let instance = harness.store.get_instance(instance_id).await.unwrap();
    assert_eq!(instance.state, InstanceState::Running);

    // the time spent is on the ledger
    let entries = harness.store.ledger_entries(instance_id).await.unwrap();
    assert!(!entries.is_empty());
}
