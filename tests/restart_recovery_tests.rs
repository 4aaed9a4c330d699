//! Restart convergence: persisted rows survive, in-memory views rebuild

use aimad::store::{InstanceUpdate, JobStore};
use aimad::types::{
    InstanceState, JobKind, JobSpec, JobState, Offer, Priority, ProviderTag, ResourceProfile,
};
use chrono::Utc;
use std::collections::HashMap;
use tempfile::TempDir;

fn spec(key: Option<&str>) -> JobSpec {
    JobSpec {
        kind: JobKind::Batch,
        priority: Priority::Normal,
        resources: ResourceProfile {
            gpu_model: "A100".to_string(),
            gpu_count: 1,
            memory_mb: 32_768,
            disk_gb: None,
        },
        image: "aima/batch-worker:latest".to_string(),
        env: HashMap::new(),
        inputs: vec!["s3://media/batch".to_string()],
        deadline: None,
        max_retries: 3,
        cost_ceiling_cents: None,
        idempotency_key: key.map(String::from),
    }
}

fn offer() -> Offer {
    Offer {
        provider: ProviderTag::Vast,
        region: "eu".to_string(),
        gpu_model: "A100".to_string(),
        gpu_count: 1,
        memory_mb: 65_536,
        vcpus: 16,
        disk_gb: 200,
        hourly_rate_cents: 189,
        availability: 1,
    }
}

#[tokio::test]
async fn state_survives_reopen_and_claims_release() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("aimad.db");
    let path = path.to_str().unwrap();

    let queued_id;
    let claimed_id;
    let instance_id;
    {
        let store = JobStore::open(path).await.unwrap();
        queued_id = store.submit_job("alice", &spec(None), 0, 100_000).await.unwrap().job.id;
        claimed_id = store.submit_job("bob", &spec(None), 0, 100_000).await.unwrap().job.id;

        // claim bob's job with an already-expired lease, as a crashed
        // scheduler would leave it
        let claimed = store.claim_queued(2, &["alice".to_string()], -5).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, claimed_id);

        let instance = store.insert_instance(&offer(), "alice", "tok", 8).await.unwrap();
        instance_id = instance.id;
        store
            .transition_instance(
                instance_id,
                InstanceState::Requested,
                InstanceState::Starting,
                InstanceUpdate {
                    provider_instance_id: Some("7781".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .transition_instance(
                instance_id,
                InstanceState::Starting,
                InstanceState::Running,
                InstanceUpdate {
                    address: Some("5.6.7.8:9400".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .append_cost(instance_id, Utc::now() - chrono::Duration::seconds(60), Utc::now(), 189)
            .await
            .unwrap();
        // store dropped here: the "crash"
    }

    let store = JobStore::open(path).await.unwrap();

    // rows preserved with state intact
    assert_eq!(store.get_job(queued_id).await.unwrap().state, JobState::Queued);
    assert_eq!(store.get_job(claimed_id).await.unwrap().state, JobState::Pending);
    let instance = store.get_instance(instance_id).await.unwrap();
    assert_eq!(instance.state, InstanceState::Running);
    assert_eq!(instance.address.as_deref(), Some("5.6.7.8:9400"));
    assert_eq!(
        instance.accumulated_cost_cents,
        store.ledger_sum(instance_id).await.unwrap()
    );

    // boot recovery: the dead scheduler's claim is released
    let released = store.release_expired_claims(Utc::now()).await.unwrap();
    assert_eq!(released, 1);
    assert_eq!(store.get_job(claimed_id).await.unwrap().state, JobState::Queued);

    // queue and inventory rebuild from rows: both jobs claimable, the
    // instance visible as idle supply
    let claimable = store.claim_queued(10, &[], 30).await.unwrap();
    assert_eq!(claimable.len(), 2);
    let idle = store.idle_running_instances().await.unwrap();
    assert_eq!(idle.len(), 1);
    assert_eq!(idle[0].id, instance_id);
}

#[tokio::test]
async fn idempotency_holds_across_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("aimad.db");
    let path = path.to_str().unwrap();

    let first_id;
    {
        let store = JobStore::open(path).await.unwrap();
        first_id = store
            .submit_job("alice", &spec(Some("media-42")), 0, 100_000)
            .await
            .unwrap()
            .job
            .id;
    }

    let store = JobStore::open(path).await.unwrap();
    let second = store
        .submit_job("alice", &spec(Some("media-42")), 0, 100_000)
        .await
        .unwrap();
    assert!(!second.created);
    assert_eq!(second.job.id, first_id);
    assert_eq!(store.queued_depth().await.unwrap(), 1);
}
