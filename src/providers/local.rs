//! Local pool adapter
//!
//! Treats a fixed inventory of in-process GPU slots as a trivial provider so
//! the scheduler and provisioner code paths are identical in dev and prod.
//! Slots cost nothing and become `running` on the first observation after
//! creation.

use crate::config::{LocalConfig, LocalSlot};
use crate::provider::{
    AdapterError, AdapterResult, BootParams, GpuProvider, HealthProbe, Observation, ObservedState,
};
use crate::types::{Offer, ProviderTag, ResourceProfile};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

pub struct LocalProvider {
    slots: Vec<LocalSlot>,
    /// provider_instance_id -> leased slot index
    leases: Mutex<HashMap<String, usize>>,
}

impl LocalProvider {
    pub fn new(config: &LocalConfig) -> Self {
        Self {
            slots: config.slots.clone(),
            leases: Mutex::new(HashMap::new()),
        }
    }

    fn free_slot_indices(&self) -> Vec<usize> {
        let leases = self.leases.lock().expect("lease map poisoned");
        let leased: Vec<usize> = leases.values().copied().collect();
        (0..self.slots.len())
            .filter(|i| !leased.contains(i))
            .collect()
    }

    fn slot_offer(&self, slot: &LocalSlot, availability: u32) -> Offer {
        Offer {
            provider: ProviderTag::Local,
            region: "local".to_string(),
            gpu_model: slot.gpu_model.clone(),
            gpu_count: slot.gpu_count,
            memory_mb: slot.memory_mb,
            vcpus: slot.vcpus,
            disk_gb: slot.disk_gb,
            hourly_rate_cents: 0,
            availability,
        }
    }
}

#[async_trait]
impl GpuProvider for LocalProvider {
    fn tag(&self) -> ProviderTag {
        ProviderTag::Local
    }

    async fn list_offers(&self, profile: &ResourceProfile) -> AdapterResult<Vec<Offer>> {
        // one offer per distinct free-slot shape, availability = free count
        let mut by_shape: HashMap<(String, u32, u64), (usize, u32)> = HashMap::new();
        for idx in self.free_slot_indices() {
            let slot = &self.slots[idx];
            if !profile.satisfied_by(&slot.gpu_model, slot.gpu_count, slot.memory_mb) {
                continue;
            }
            let key = (
                slot.gpu_model.to_ascii_lowercase(),
                slot.gpu_count,
                slot.memory_mb,
            );
            by_shape
                .entry(key)
                .and_modify(|(_, n)| *n += 1)
                .or_insert((idx, 1));
        }
        let mut offers: Vec<Offer> = by_shape
            .values()
            .map(|(idx, count)| self.slot_offer(&self.slots[*idx], *count))
            .collect();
        offers.sort_by(|a, b| a.gpu_model.cmp(&b.gpu_model));
        Ok(offers)
    }

    async fn create_instance(&self, offer: &Offer, _boot: &BootParams) -> AdapterResult<String> {
        let free = self.free_slot_indices();
        let mut leases = self.leases.lock().expect("lease map poisoned");
        let idx = free
            .into_iter()
            .find(|i| {
                let slot = &self.slots[*i];
                slot.gpu_model.eq_ignore_ascii_case(&offer.gpu_model)
                    && slot.gpu_count >= offer.gpu_count
                    && slot.memory_mb >= offer.memory_mb
            })
            .ok_or_else(|| AdapterError::Retryable("no free local slot".to_string()))?;
        let id = format!("slot{}-{}", idx, &Uuid::new_v4().simple().to_string()[..8]);
        leases.insert(id.clone(), idx);
        Ok(id)
    }

    async fn observe_instance(&self, provider_instance_id: &str) -> AdapterResult<Observation> {
        let leases = self.leases.lock().expect("lease map poisoned");
        match leases.get(provider_instance_id) {
            Some(idx) => Ok(Observation {
                state: ObservedState::Running,
                external_address: Some(self.slots[*idx].address.clone()),
                started_at: Some(Utc::now()),
            }),
            None => Ok(Observation {
                state: ObservedState::Stopped,
                external_address: None,
                started_at: None,
            }),
        }
    }

    async fn terminate_instance(&self, provider_instance_id: &str) -> AdapterResult<()> {
        // releasing an unknown lease is fine; termination is idempotent
        self.leases
            .lock()
            .expect("lease map poisoned")
            .remove(provider_instance_id);
        Ok(())
    }

    async fn list_held_instances(&self) -> AdapterResult<Vec<String>> {
        Ok(self
            .leases
            .lock()
            .expect("lease map poisoned")
            .keys()
            .cloned()
            .collect())
    }

    async fn health(&self) -> AdapterResult<HealthProbe> {
        Ok(HealthProbe {
            up: true,
            observed_latency: Duration::from_micros(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(model: &str) -> ResourceProfile {
        ResourceProfile {
            gpu_model: model.to_string(),
            gpu_count: 1,
            memory_mb: 1024,
            disk_gb: None,
        }
    }

    fn provider() -> LocalProvider {
        LocalProvider::new(&LocalConfig::default())
    }

    #[tokio::test]
    async fn offers_aggregate_free_slots() {
        let provider = provider();
        let offers = provider.list_offers(&profile("RTX 4090")).await.unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].availability, 2);
        assert_eq!(offers[0].hourly_rate_cents, 0);
    }

    #[tokio::test]
    async fn leasing_shrinks_availability() {
        let provider = provider();
        let offers = provider.list_offers(&profile("RTX 4090")).await.unwrap();
        let boot = BootParams {
            image: "aima/inference-worker:latest".to_string(),
            bootstrap_token: "tok".to_string(),
            env: HashMap::new(),
        };
        let id = provider.create_instance(&offers[0], &boot).await.unwrap();

        let offers = provider.list_offers(&profile("RTX 4090")).await.unwrap();
        assert_eq!(offers[0].availability, 1);

        let obs = provider.observe_instance(&id).await.unwrap();
        assert_eq!(obs.state, ObservedState::Running);
        assert!(obs.external_address.is_some());

        provider.terminate_instance(&id).await.unwrap();
        let offers = provider.list_offers(&profile("RTX 4090")).await.unwrap();
        assert_eq!(offers[0].availability, 2);

        let obs = provider.observe_instance(&id).await.unwrap();
        assert_eq!(obs.state, ObservedState::Stopped);
    }

    #[tokio::test]
    async fn exhausted_pool_is_retryable() {
        let provider = provider();
        let offers = provider.list_offers(&profile("RTX 4090")).await.unwrap();
        let boot = BootParams {
            image: "img".to_string(),
            bootstrap_token: "tok".to_string(),
            env: HashMap::new(),
        };
        provider.create_instance(&offers[0], &boot).await.unwrap();
        provider.create_instance(&offers[0], &boot).await.unwrap();
        match provider.create_instance(&offers[0], &boot).await {
            Err(AdapterError::Retryable(_)) => {}
            other => panic!("expected retryable exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unmatched_profile_yields_no_offers() {
        let provider = provider();
        let offers = provider.list_offers(&profile("H100")).await.unwrap();
        assert!(offers.is_empty());
    }
}
