//! GCP Compute Engine adapter
//!
//! Talks to the Compute REST API with a pre-issued access token. Like AWS,
//! GPU capacity is a static menu of machine shapes; instances are named
//! `aima-*` and labelled so reconciliation can find them.

use super::http::{build_client, classify_status, classify_transport};
use crate::config::GcpConfig;
use crate::provider::{
    normalize_state, AdapterError, AdapterResult, BootParams, GpuProvider, HealthProbe,
    Observation, ObservedState,
};
use crate::types::{Offer, ProviderTag, ResourceProfile};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

pub const WORKER_PORT: u16 = 9400;

/// (machine type, accelerator, gpu model, gpu count, memory MB, vcpus, cents/hour)
const GPU_SHAPES: &[(&str, &str, &str, u32, u64, u32, i64)] = &[
    ("a2-highgpu-1g", "nvidia-tesla-a100", "A100", 1, 87_040, 12, 367),
    ("a2-highgpu-4g", "nvidia-tesla-a100", "A100", 4, 348_160, 48, 1_468),
    ("g2-standard-8", "nvidia-l4", "L4", 1, 32_768, 8, 85),
    ("n1-standard-8-t4", "nvidia-tesla-t4", "T4", 1, 30_720, 8, 73),
];

#[derive(Debug, Deserialize)]
struct GcpInstanceDto {
    #[serde(default)]
    status: Option<String>,
    #[serde(default, rename = "networkInterfaces")]
    network_interfaces: Vec<NetworkInterfaceDto>,
    #[serde(default, rename = "creationTimestamp")]
    creation_timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NetworkInterfaceDto {
    #[serde(default, rename = "accessConfigs")]
    access_configs: Vec<AccessConfigDto>,
}

#[derive(Debug, Deserialize)]
struct AccessConfigDto {
    #[serde(default, rename = "natIP")]
    nat_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcpListDto {
    #[serde(default)]
    items: Vec<GcpListItemDto>,
}

#[derive(Debug, Deserialize)]
struct GcpListItemDto {
    name: String,
}

pub struct GcpProvider {
    client: reqwest::Client,
    credentials: ArcSwap<String>,
    base: String,
    project: String,
    zone: String,
}

impl GcpProvider {
    pub fn new(config: &GcpConfig) -> AdapterResult<Self> {
        Ok(Self {
            client: build_client(&config.common)?,
            credentials: ArcSwap::from_pointee(config.access_token.clone()),
            base: config.api_base.trim_end_matches('/').to_string(),
            project: config.project.clone(),
            zone: config.zone.clone(),
        })
    }

    pub fn rotate_credentials(&self, access_token: String) {
        self.credentials.store(Arc::new(access_token));
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.credentials.load())
    }

    fn zone_url(&self) -> String {
        format!(
            "{}/projects/{}/zones/{}",
            self.base, self.project, self.zone
        )
    }
}

#[async_trait]
impl GpuProvider for GcpProvider {
    fn tag(&self) -> ProviderTag {
        ProviderTag::Gcp
    }

    async fn list_offers(&self, profile: &ResourceProfile) -> AdapterResult<Vec<Offer>> {
        let offers = GPU_SHAPES
            .iter()
            .filter(|(_, _, model, count, memory, _, _)| {
                profile.satisfied_by(model, *count, *memory)
            })
            .map(|(_, _, model, count, memory, vcpus, cents)| Offer {
                provider: ProviderTag::Gcp,
                region: self.zone.clone(),
                gpu_model: (*model).to_string(),
                gpu_count: *count,
                memory_mb: *memory,
                vcpus: *vcpus,
                disk_gb: profile.disk_gb.unwrap_or(100),
                hourly_rate_cents: *cents,
                availability: 4,
            })
            .collect();
        Ok(offers)
    }

    async fn create_instance(&self, offer: &Offer, boot: &BootParams) -> AdapterResult<String> {
        let (machine_type, accelerator, ..) = GPU_SHAPES
            .iter()
            .find(|(_, _, model, count, memory, _, _)| {
                model.eq_ignore_ascii_case(&offer.gpu_model)
                    && *count == offer.gpu_count
                    && *memory == offer.memory_mb
            })
            .map(|(ty, acc, ..)| (*ty, *acc))
            .ok_or_else(|| AdapterError::Fatal(format!("no GCP shape for offer {offer:?}")))?;

        let name = format!("aima-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let mut metadata_items = vec![
            json!({"key": "aima-bootstrap-token", "value": boot.bootstrap_token}),
            json!({"key": "aima-worker-image", "value": boot.image}),
        ];
        for (key, value) in &boot.env {
            metadata_items.push(json!({"key": format!("aima-env-{key}"), "value": value}));
        }

        let body = json!({
            "name": name,
            "machineType": format!("zones/{}/machineTypes/{machine_type}", self.zone),
            "labels": {"aima": "managed"},
            "disks": [{
                "boot": true,
                "autoDelete": true,
                "initializeParams": {
                    "sourceImage": "projects/cos-cloud/global/images/family/cos-stable",
                    "diskSizeGb": offer.disk_gb.max(10).to_string(),
                }
            }],
            "guestAccelerators": [{
                "acceleratorType": format!("zones/{}/acceleratorTypes/{accelerator}", self.zone),
                "acceleratorCount": offer.gpu_count,
            }],
            "scheduling": {"onHostMaintenance": "TERMINATE"},
            "networkInterfaces": [{"accessConfigs": [{"type": "ONE_TO_ONE_NAT"}]}],
            "metadata": {"items": metadata_items},
        });

        let resp = self
            .client
            .post(format!("{}/instances", self.zone_url()))
            .header("Authorization", self.auth())
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;
        let status = resp.status();
        let text = resp.text().await.map_err(classify_transport)?;
        if !status.is_success() {
            return Err(classify_status(status, &text));
        }
        Ok(name)
    }

    async fn observe_instance(&self, provider_instance_id: &str) -> AdapterResult<Observation> {
        let resp = self
            .client
            .get(format!("{}/instances/{provider_instance_id}", self.zone_url()))
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
        let dto: GcpInstanceDto =
            serde_json::from_str(&body).map_err(|e| AdapterError::Fatal(format!("decode: {e}")))?;

        let state = dto
            .status
            .as_deref()
            .map(normalize_state)
            .unwrap_or(ObservedState::Starting);
        let external_address = dto
            .network_interfaces
            .iter()
            .flat_map(|ni| ni.access_configs.iter())
            .find_map(|ac| ac.nat_ip.as_ref())
            .map(|ip| format!("{ip}:{WORKER_PORT}"));
        let started_at = dto
            .creation_timestamp
            .as_deref()
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&chrono::Utc));
        Ok(Observation {
            state,
            external_address,
            started_at,
        })
    }

    async fn terminate_instance(&self, provider_instance_id: &str) -> AdapterResult<()> {
        let resp = self
            .client
            .delete(format!("{}/instances/{provider_instance_id}", self.zone_url()))
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
            .get(format!("{}/instances", self.zone_url()))
            .header("Authorization", self.auth())
            .query(&[("filter", "labels.aima=managed")])
            .send()
            .await
            .map_err(classify_transport)?;
        let status = resp.status();
        let body = resp.text().await.map_err(classify_transport)?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        let list: GcpListDto =
            serde_json::from_str(&body).map_err(|e| AdapterError::Fatal(format!("decode: {e}")))?;
        Ok(list.items.into_iter().map(|i| i.name).collect())
    }

    async fn health(&self) -> AdapterResult<HealthProbe> {
        let start = Instant::now();
        let resp = self
            .client
            .get(self.zone_url())
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
