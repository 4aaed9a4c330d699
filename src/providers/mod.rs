//! Provider registry and the guarded call path
//!
//! `ProviderHandle` is the only way the rest of the orchestrator talks to an
//! adapter: every call goes through the provider's circuit breaker and, when
//! admitted, its retry policy. When the breaker is open, `list_offers`
//! returns an empty offer set so the scheduler simply routes elsewhere, and
//! write calls fail fast as retryable.

pub mod aws;
pub mod azure;
pub mod gcp;
mod http;
pub mod local;
pub mod runpod;
pub mod vast;

pub use local::LocalProvider;

use crate::breaker::{Admission, BreakerState, CircuitBreaker};
use crate::config::{Config, ProviderCommon};
use crate::error::{OrchestratorError, Result};
use crate::provider::{
    AdapterError, AdapterResult, BootParams, GpuProvider, HealthProbe, Observation,
};
use crate::retry::ExponentialBackoffPolicy;
use crate::types::{Offer, ProviderTag, ResourceProfile};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

fn provider_error(tag: ProviderTag, err: AdapterError) -> OrchestratorError {
    OrchestratorError::Provider {
        provider: tag.to_string(),
        message: err.to_string(),
        retryable: err.is_retryable(),
        source: None,
    }
}

fn circuit_open(tag: ProviderTag) -> OrchestratorError {
    OrchestratorError::Provider {
        provider: tag.to_string(),
        message: "circuit_open".to_string(),
        retryable: true,
        source: None,
    }
}

/// One adapter plus the machinery guarding it.
pub struct ProviderHandle {
    provider: Arc<dyn GpuProvider>,
    breaker: CircuitBreaker,
    policy: ExponentialBackoffPolicy,
    common: ProviderCommon,
    last_offers: Mutex<Vec<Offer>>,
    last_health: Mutex<Option<HealthProbe>>,
}

impl ProviderHandle {
    pub fn new(provider: Arc<dyn GpuProvider>, common: ProviderCommon) -> Self {
        Self {
            breaker: CircuitBreaker::new(common.breaker),
            policy: ExponentialBackoffPolicy::for_provider(&common),
            provider,
            common,
            last_offers: Mutex::new(Vec::new()),
            last_health: Mutex::new(None),
        }
    }

    pub fn tag(&self) -> ProviderTag {
        self.provider.tag()
    }

    pub fn common(&self) -> &ProviderCommon {
        &self.common
    }

    pub fn soft_quota(&self) -> u32 {
        self.common.soft_quota
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Offers matching the profile. Breaker-open providers contribute an
    /// empty set on the same tick, so outages shrink the market instantly
    /// instead of stalling scheduling.
    pub async fn list_offers(&self, profile: &ResourceProfile) -> Vec<Offer> {
        match self.call(|| self.provider.list_offers(profile)).await {
            Ok(offers) => {
                *self.last_offers.lock().expect("offer cache poisoned") = offers.clone();
                offers
            }
            Err(e) => {
                debug!(provider = %self.tag(), error = %e, "list_offers unavailable");
                Vec::new()
            }
        }
    }

    /// Last successfully observed offers, for status reporting.
    pub fn cached_offers(&self) -> Vec<Offer> {
        self.last_offers.lock().expect("offer cache poisoned").clone()
    }

    pub async fn create_instance(&self, offer: &Offer, boot: &BootParams) -> Result<String> {
        self.call(|| self.provider.create_instance(offer, boot)).await
    }

    pub async fn observe_instance(&self, provider_instance_id: &str) -> Result<Observation> {
        self.call(|| self.provider.observe_instance(provider_instance_id))
            .await
    }

    pub async fn terminate_instance(&self, provider_instance_id: &str) -> Result<()> {
        self.call(|| self.provider.terminate_instance(provider_instance_id))
            .await
    }

    pub async fn list_held_instances(&self) -> Result<Vec<String>> {
        self.call(|| self.provider.list_held_instances()).await
    }

    /// Run the synthetic probe and cache the result for /providers status.
    pub async fn probe_health(&self) -> Option<HealthProbe> {
        match self.call(|| self.provider.health()).await {
            Ok(probe) => {
                *self.last_health.lock().expect("health cache poisoned") = Some(probe.clone());
                Some(probe)
            }
            Err(e) => {
                warn!(provider = %self.tag(), error = %e, "health probe failed");
                None
            }
        }
    }

    pub fn cached_health(&self) -> Option<HealthProbe> {
        self.last_health.lock().expect("health cache poisoned").clone()
    }

    /// The guarded call path: breaker admission, then retry-with-backoff for
    /// normal traffic, or a single un-retried attempt for a half-open probe.
    async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = AdapterResult<T>>,
    {
        let tag = self.tag();
        match self.breaker.admit() {
            Admission::Rejected => Err(circuit_open(tag)),
            Admission::Probe => match op().await {
                Ok(value) => {
                    self.breaker.record_success();
                    Ok(value)
                }
                Err(e) => {
                    self.breaker.record_failure();
                    Err(provider_error(tag, e))
                }
            },
            Admission::Allowed => {
                let result = self
                    .policy
                    .execute(|| async { op().await.map_err(|e| provider_error(tag, e)) })
                    .await;
                match &result {
                    Ok(_) => self.breaker.record_success(),
                    Err(_) => self.breaker.record_failure(),
                }
                result
            }
        }
    }
}

/// All enabled providers, keyed by tag.
pub struct ProviderRegistry {
    handles: HashMap<ProviderTag, Arc<ProviderHandle>>,
}

impl ProviderRegistry {
    /// Build adapters for every enabled provider in the configuration.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let mut handles = HashMap::new();

        if let Some(cfg) = config.providers.runpod.as_ref().filter(|c| c.common.enabled) {
            let adapter = runpod::RunpodProvider::new(cfg).map_err(|e| provider_error(ProviderTag::Runpod, e))?;
            handles.insert(
                ProviderTag::Runpod,
                Arc::new(ProviderHandle::new(Arc::new(adapter), cfg.common.clone())),
            );
        }
        if let Some(cfg) = config.providers.vast.as_ref().filter(|c| c.common.enabled) {
            let adapter = vast::VastProvider::new(cfg).map_err(|e| provider_error(ProviderTag::Vast, e))?;
            handles.insert(
                ProviderTag::Vast,
                Arc::new(ProviderHandle::new(Arc::new(adapter), cfg.common.clone())),
            );
        }
        if let Some(cfg) = config.providers.aws.as_ref().filter(|c| c.common.enabled) {
            let adapter = aws::AwsProvider::new(cfg).await;
            handles.insert(
                ProviderTag::Aws,
                Arc::new(ProviderHandle::new(Arc::new(adapter), cfg.common.clone())),
            );
        }
        if let Some(cfg) = config.providers.gcp.as_ref().filter(|c| c.common.enabled) {
            let adapter = gcp::GcpProvider::new(cfg).map_err(|e| provider_error(ProviderTag::Gcp, e))?;
            handles.insert(
                ProviderTag::Gcp,
                Arc::new(ProviderHandle::new(Arc::new(adapter), cfg.common.clone())),
            );
        }
        if let Some(cfg) = config.providers.azure.as_ref().filter(|c| c.common.enabled) {
            let adapter = azure::AzureProvider::new(cfg).map_err(|e| provider_error(ProviderTag::Azure, e))?;
            handles.insert(
                ProviderTag::Azure,
                Arc::new(ProviderHandle::new(Arc::new(adapter), cfg.common.clone())),
            );
        }
        if let Some(cfg) = config.providers.local.as_ref().filter(|c| c.common.enabled) {
            let adapter = local::LocalProvider::new(cfg);
            handles.insert(
                ProviderTag::Local,
                Arc::new(ProviderHandle::new(Arc::new(adapter), cfg.common.clone())),
            );
        }

        Ok(Self { handles })
    }

    /// Registry over explicit handles, for tests and embedding.
    pub fn from_handles(handles: Vec<Arc<ProviderHandle>>) -> Self {
        Self {
            handles: handles.into_iter().map(|h| (h.tag(), h)).collect(),
        }
    }

    pub fn get(&self, tag: ProviderTag) -> Option<Arc<ProviderHandle>> {
        self.handles.get(&tag).cloned()
    }

    pub fn tags(&self) -> Vec<ProviderTag> {
        let mut tags: Vec<_> = self.handles.keys().copied().collect();
        tags.sort();
        tags
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ProviderHandle>> {
        self.handles.values()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Whether any provider can currently take traffic. Feeds readiness.
    pub fn any_usable(&self) -> bool {
        self.handles
            .values()
            .any(|h| h.breaker_state() != BreakerState::Open || h.tag() == ProviderTag::Local)
    }
}
