//! Vast.ai adapter
//!
//! Vast is a marketplace: offers are asks published by hosts, and creating an
//! instance means accepting an ask. Asks churn quickly, so `create_instance`
//! re-searches for the offered shape and accepts the cheapest matching ask
//! rather than trusting an id observed on an earlier tick.

use super::http::{build_client, classify_status, classify_transport, dollars_to_cents};
use crate::config::VastConfig;
use crate::provider::{
    normalize_state, AdapterError, AdapterResult, BootParams, GpuProvider, HealthProbe,
    Observation, ObservedState,
};
use crate::types::{Offer, ProviderTag, ResourceProfile};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

pub const WORKER_PORT: u16 = 9400;

#[derive(Debug, Clone, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    offers: Vec<AskDto>,
}

#[derive(Debug, Clone, Deserialize)]
struct AskDto {
    id: i64,
    gpu_name: String,
    num_gpus: u32,
    #[serde(default)]
    cpu_cores: Option<u32>,
    /// Host RAM in megabytes.
    #[serde(default)]
    cpu_ram: Option<u64>,
    #[serde(default)]
    disk_space: Option<f64>,
    dph_total: f64,
    #[serde(default)]
    geolocation: Option<String>,
    #[serde(default)]
    rentable: bool,
}

#[derive(Debug, Serialize)]
struct AcceptAskRequest<'a> {
    client_id: &'a str,
    image: &'a str,
    disk: f64,
    env: &'a HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct AcceptAskResponse {
    new_contract: i64,
}

#[derive(Debug, Deserialize)]
struct InstancesResponse {
    #[serde(default)]
    instances: Vec<InstanceDto>,
}

#[derive(Debug, Deserialize)]
struct InstanceResponse {
    instances: InstanceDto,
}

#[derive(Debug, Clone, Deserialize)]
struct InstanceDto {
    id: i64,
    #[serde(default)]
    actual_status: Option<String>,
    #[serde(default)]
    public_ipaddr: Option<String>,
    #[serde(default)]
    ports: Option<HashMap<String, Vec<PortMapDto>>>,
    #[serde(default)]
    start_date: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PortMapDto {
    host_ip: String,
    host_port: String,
}

pub struct VastProvider {
    client: reqwest::Client,
    credentials: ArcSwap<String>,
    base: String,
}

impl VastProvider {
    pub fn new(config: &VastConfig) -> AdapterResult<Self> {
        Ok(Self {
            client: build_client(&config.common)?,
            credentials: ArcSwap::from_pointee(config.api_key.clone()),
            base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    pub fn rotate_credentials(&self, api_key: String) {
        self.credentials.store(Arc::new(api_key));
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.credentials.load())
    }

    async fn search_asks(&self, profile: &ResourceProfile) -> AdapterResult<Vec<AskDto>> {
        let resp = self
            .client
            .get(format!("{}/bundles", self.base))
            .header("Authorization", self.auth())
            .query(&[
                ("gpu_name", profile.gpu_model.as_str()),
                ("num_gpus", &profile.gpu_count.to_string()),
                ("rentable", "true"),
            ])
            .send()
            .await
            .map_err(classify_transport)?;
        let status = resp.status();
        let body = resp.text().await.map_err(classify_transport)?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        let search: SearchResponse =
            serde_json::from_str(&body).map_err(|e| AdapterError::Fatal(format!("decode: {e}")))?;
        Ok(search
            .offers
            .into_iter()
            .filter(|a| a.rentable)
            .collect())
    }

    fn ask_to_offer(ask: &AskDto) -> Offer {
        Offer {
            provider: ProviderTag::Vast,
            region: ask.geolocation.clone().unwrap_or_else(|| "unknown".to_string()),
            gpu_model: ask.gpu_name.clone(),
            gpu_count: ask.num_gpus,
            memory_mb: ask.cpu_ram.unwrap_or(0),
            vcpus: ask.cpu_cores.unwrap_or(0),
            disk_gb: ask.disk_space.unwrap_or(0.0) as u32,
            hourly_rate_cents: dollars_to_cents(ask.dph_total),
            availability: 1,
        }
    }
}

#[async_trait]
impl GpuProvider for VastProvider {
    fn tag(&self) -> ProviderTag {
        ProviderTag::Vast
    }

    async fn list_offers(&self, profile: &ResourceProfile) -> AdapterResult<Vec<Offer>> {
        let asks = self.search_asks(profile).await?;
        Ok(asks
            .iter()
            .map(Self::ask_to_offer)
            .filter(|o| o.satisfies(profile))
            .collect())
    }

    async fn create_instance(&self, offer: &Offer, boot: &BootParams) -> AdapterResult<String> {
        let profile = ResourceProfile {
            gpu_model: offer.gpu_model.clone(),
            gpu_count: offer.gpu_count,
            memory_mb: offer.memory_mb,
            disk_gb: Some(offer.disk_gb),
        };
        let mut asks = self.search_asks(&profile).await?;
        asks.retain(|a| {
            a.gpu_name.eq_ignore_ascii_case(&offer.gpu_model) && a.num_gpus >= offer.gpu_count
        });
        asks.sort_by(|a, b| a.dph_total.total_cmp(&b.dph_total));
        let ask = asks
            .first()
            .ok_or_else(|| AdapterError::Retryable("offer no longer listed".to_string()))?;

        let mut env = boot.env.clone();
        env.insert("AIMA_BOOTSTRAP_TOKEN".to_string(), boot.bootstrap_token.clone());
        let request = AcceptAskRequest {
            client_id: "me",
            image: &boot.image,
            disk: offer.disk_gb.max(10) as f64,
            env: &env,
        };
        let resp = self
            .client
            .put(format!("{}/asks/{}/", self.base, ask.id))
            .header("Authorization", self.auth())
            .json(&request)
            .send()
            .await
            .map_err(classify_transport)?;
        let status = resp.status();
        let body = resp.text().await.map_err(classify_transport)?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        let accepted: AcceptAskResponse =
            serde_json::from_str(&body).map_err(|e| AdapterError::Fatal(format!("decode: {e}")))?;
        Ok(accepted.new_contract.to_string())
    }

    async fn observe_instance(&self, provider_instance_id: &str) -> AdapterResult<Observation> {
        let resp = self
            .client
            .get(format!("{}/instances/{provider_instance_id}", self.base))
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(classify_transport)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Observation {
                state: ObservedState::Stopped,
                external_address: None,
                started_at: None,
            });
        }
        let status = resp.status();
        let body = resp.text().await.map_err(classify_transport)?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        let instance: InstanceResponse =
            serde_json::from_str(&body).map_err(|e| AdapterError::Fatal(format!("decode: {e}")))?;
        let dto = instance.instances;

        let state = dto
            .actual_status
            .as_deref()
            .map(normalize_state)
            .unwrap_or(ObservedState::Starting);
        let external_address = dto.ports.as_ref().and_then(|ports| {
            ports
                .get(&format!("{WORKER_PORT}/tcp"))
                .and_then(|maps| maps.first())
                .map(|m| format!("{}:{}", m.host_ip, m.host_port))
        });
        // fall back to the raw ip when the host does not report a mapping
        let external_address = external_address.or_else(|| {
            dto.public_ipaddr
                .as_ref()
                .map(|ip| format!("{ip}:{WORKER_PORT}"))
        });
        let started_at = dto
            .start_date
            .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single());
        Ok(Observation {
            state,
            external_address,
            started_at,
        })
    }

    async fn terminate_instance(&self, provider_instance_id: &str) -> AdapterResult<()> {
        let resp = self
            .client
            .delete(format!("{}/instances/{provider_instance_id}/", self.base))
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(classify_transport)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND || resp.status().is_success() {
            return Ok(());
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    async fn list_held_instances(&self) -> AdapterResult<Vec<String>> {
        let resp = self
            .client
            .get(format!("{}/instances", self.base))
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(classify_transport)?;
        let status = resp.status();
        let body = resp.text().await.map_err(classify_transport)?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        let list: InstancesResponse =
            serde_json::from_str(&body).map_err(|e| AdapterError::Fatal(format!("decode: {e}")))?;
        Ok(list.instances.into_iter().map(|i| i.id.to_string()).collect())
    }

    async fn health(&self) -> AdapterResult<HealthProbe> {
        let start = Instant::now();
        let resp = self
            .client
            .get(format!("{}/instances", self.base))
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(classify_transport)?;
        Ok(HealthProbe {
            up: resp.status().is_success(),
            observed_latency: start.elapsed(),
        })
    }
}
