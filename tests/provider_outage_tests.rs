//! Circuit breaker behavior at the provider registry boundary

use aimad::breaker::BreakerState;
use aimad::config::{BreakerConfig, ProviderCommon};
use aimad::provider::{
    AdapterError, AdapterResult, BootParams, GpuProvider, HealthProbe, Observation, ObservedState,
};
use aimad::providers::{ProviderHandle, ProviderRegistry};
use aimad::types::{Offer, ProviderTag, ResourceProfile};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A provider whose every call fails with a network-style error.
struct FlakyProvider {
    tag: ProviderTag,
    calls: AtomicU32,
}

#[async_trait]
impl GpuProvider for FlakyProvider {
    fn tag(&self) -> ProviderTag {
        self.tag
    }

    async fn list_offers(&self, _profile: &ResourceProfile) -> AdapterResult<Vec<Offer>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AdapterError::Retryable("connection reset".to_string()))
    }

    async fn create_instance(&self, _offer: &Offer, _boot: &BootParams) -> AdapterResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AdapterError::Retryable("connection reset".to_string()))
    }

    async fn observe_instance(&self, _id: &str) -> AdapterResult<Observation> {
        Err(AdapterError::Retryable("connection reset".to_string()))
    }

    async fn terminate_instance(&self, _id: &str) -> AdapterResult<()> {
        Err(AdapterError::Retryable("connection reset".to_string()))
    }

    async fn list_held_instances(&self) -> AdapterResult<Vec<String>> {
        Err(AdapterError::Retryable("connection reset".to_string()))
    }

    async fn health(&self) -> AdapterResult<HealthProbe> {
        Err(AdapterError::Retryable("connection reset".to_string()))
    }
}

/// A provider with one standing offer that always works.
struct SteadyProvider {
    tag: ProviderTag,
}

#[async_trait]
impl GpuProvider for SteadyProvider {
    fn tag(&self) -> ProviderTag {
        self.tag
    }

    async fn list_offers(&self, profile: &ResourceProfile) -> AdapterResult<Vec<Offer>> {
        Ok(vec![Offer {
            provider: self.tag,
            region: "eu".to_string(),
            gpu_model: profile.gpu_model.clone(),
            gpu_count: profile.gpu_count,
            memory_mb: profile.memory_mb.max(16_384),
            vcpus: 8,
            disk_gb: 100,
            hourly_rate_cents: 150,
            availability: 3,
        }])
    }

    async fn create_instance(&self, _offer: &Offer, _boot: &BootParams) -> AdapterResult<String> {
        Ok("steady-1".to_string())
    }

    async fn observe_instance(&self, _id: &str) -> AdapterResult<Observation> {
        Ok(Observation {
            state: ObservedState::Running,
            external_address: Some("10.0.0.1:9400".to_string()),
            started_at: None,
        })
    }

    async fn terminate_instance(&self, _id: &str) -> AdapterResult<()> {
        Ok(())
    }

    async fn list_held_instances(&self) -> AdapterResult<Vec<String>> {
        Ok(vec![])
    }

    async fn health(&self) -> AdapterResult<HealthProbe> {
        Ok(HealthProbe {
            up: true,
            observed_latency: Duration::from_millis(5),
        })
    }
}

fn fast_common() -> ProviderCommon {
    ProviderCommon {
        max_retries: 2,
        backoff_ceiling_ms: 5,
        breaker: BreakerConfig {
            window: 10,
            min_calls: 3,
            failure_ratio: 0.5,
            cooldown_secs: 3600,
            max_cooldown_secs: 7200,
        },
        ..ProviderCommon::default()
    }
}

fn profile() -> ResourceProfile {
    ResourceProfile {
        gpu_model: "A100".to_string(),
        gpu_count: 1,
        memory_mb: 8_192,
        disk_gb: None,
    }
}

#[tokio::test]
async fn repeated_failures_open_the_circuit() {
    let handle = ProviderHandle::new(
        Arc::new(FlakyProvider {
            tag: ProviderTag::Runpod,
            calls: AtomicU32::new(0),
        }),
        fast_common(),
    );

    for _ in 0..3 {
        assert!(handle.list_offers(&profile()).await.is_empty());
    }
    assert_eq!(handle.breaker_state(), BreakerState::Open);
}

#[tokio::test]
async fn open_circuit_empties_offers_without_calling_the_provider() {
    let adapter = Arc::new(FlakyProvider {
        tag: ProviderTag::Runpod,
        calls: AtomicU32::new(0),
    });
    let adapter_dyn: Arc<dyn GpuProvider> = Arc::clone(&adapter);
    let handle = ProviderHandle::new(adapter_dyn, fast_common());

    for _ in 0..3 {
        handle.list_offers(&profile()).await;
    }
    assert_eq!(handle.breaker_state(), BreakerState::Open);
    let calls_when_opened = adapter.calls.load(Ordering::SeqCst);

    // the same tick: offers are empty and the adapter is not touched again
    assert!(handle.list_offers(&profile()).await.is_empty());
    assert_eq!(adapter.calls.load(Ordering::SeqCst), calls_when_opened);

    // write calls fail fast as retryable while open
    let boot = BootParams {
        image: "img".to_string(),
        bootstrap_token: "tok".to_string(),
        env: Default::default(),
    };
    let offer = Offer {
        provider: ProviderTag::Runpod,
        region: "eu".to_string(),
        gpu_model: "A100".to_string(),
        gpu_count: 1,
        memory_mb: 16_384,
        vcpus: 8,
        disk_gb: 100,
        hourly_rate_cents: 100,
        availability: 1,
    };
    let err = handle.create_instance(&offer, &boot).await.unwrap_err();
    assert!(err.to_string().contains("circuit_open"));
    assert_eq!(adapter.calls.load(Ordering::SeqCst), calls_when_opened);
}

#[tokio::test]
async fn outage_on_one_provider_leaves_the_other_offering() {
    let flaky = Arc::new(ProviderHandle::new(
        Arc::new(FlakyProvider {
            tag: ProviderTag::Runpod,
            calls: AtomicU32::new(0),
        }),
        fast_common(),
    ));
    let steady = Arc::new(ProviderHandle::new(
        Arc::new(SteadyProvider {
            tag: ProviderTag::Vast,
        }),
        fast_common(),
    ));
    let registry = ProviderRegistry::from_handles(vec![Arc::clone(&flaky), Arc::clone(&steady)]);

    for _ in 0..3 {
        flaky.list_offers(&profile()).await;
    }
    assert_eq!(flaky.breaker_state(), BreakerState::Open);

    // the market shrinks to the healthy provider
    let mut offers = Vec::new();
    for handle in registry.iter() {
        offers.extend(handle.list_offers(&profile()).await);
    }
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].provider, ProviderTag::Vast);

    // and the cool-down keeps the flaky circuit open
    assert_eq!(flaky.breaker_state(), BreakerState::Open);
    assert!(registry.any_usable());
}
