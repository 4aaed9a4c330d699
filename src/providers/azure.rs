//! Azure adapter
//!
//! Drives the Azure Resource Manager VM API with a pre-issued access token.
//! GPU capacity is a static menu of NC-series sizes. Azure reports power
//! state through the instance view, separately from the provisioning state;
//! both feed the canonical observation.

use super::http::{build_client, classify_status, classify_transport};
use crate::config::AzureConfig;
use crate::provider::{
    AdapterError, AdapterResult, BootParams, GpuProvider, HealthProbe, Observation, ObservedState,
};
use crate::types::{Offer, ProviderTag, ResourceProfile};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

pub const WORKER_PORT: u16 = 9400;

const API_VERSION: &str = "2023-09-01";

/// (vm size, gpu model, gpu count, memory MB, vcpus, cents/hour)
const GPU_SIZES: &[(&str, &str, u32, u64, u32, i64)] = &[
    ("Standard_NC4as_T4_v3", "T4", 1, 28_672, 4, 53),
    ("Standard_NC6s_v3", "V100", 1, 114_688, 6, 306),
    ("Standard_NC24ads_A100_v4", "A100", 1, 225_280, 24, 367),
];

#[derive(Debug, Deserialize)]
struct VmDto {
    #[serde(default)]
    properties: Option<VmPropertiesDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmPropertiesDto {
    #[serde(default)]
    provisioning_state: Option<String>,
    #[serde(default)]
    instance_view: Option<InstanceViewDto>,
    #[serde(default)]
    time_created: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstanceViewDto {
    #[serde(default)]
    statuses: Vec<VmStatusDto>,
}

#[derive(Debug, Deserialize)]
struct VmStatusDto {
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VmListDto {
    #[serde(default)]
    value: Vec<VmListItemDto>,
}

#[derive(Debug, Deserialize)]
struct VmListItemDto {
    name: String,
}

pub struct AzureProvider {
    client: reqwest::Client,
    credentials: ArcSwap<String>,
    base: String,
    subscription_id: String,
    resource_group: String,
    region: String,
}

impl AzureProvider {
    pub fn new(config: &AzureConfig) -> AdapterResult<Self> {
        Ok(Self {
            client: build_client(&config.common)?,
            credentials: ArcSwap::from_pointee(config.access_token.clone()),
            base: config.api_base.trim_end_matches('/').to_string(),
            subscription_id: config.subscription_id.clone(),
            resource_group: config.resource_group.clone(),
            region: config
                .common
                .regions
                .first()
                .cloned()
                .unwrap_or_else(|| "eastus".to_string()),
        })
    }

    pub fn rotate_credentials(&self, access_token: String) {
        self.credentials.store(Arc::new(access_token));
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.credentials.load())
    }

    fn vm_url(&self, name: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines/{name}",
            self.base, self.subscription_id, self.resource_group
        )
    }

    fn observed_state(properties: &VmPropertiesDto) -> ObservedState {
        let power = properties
            .instance_view
            .as_ref()
            .and_then(|view| {
                view.statuses
                    .iter()
                    .filter_map(|s| s.code.as_deref())
                    .find(|c| c.starts_with("PowerState/"))
            })
            .unwrap_or("");
        match power {
            "PowerState/running" => ObservedState::Running,
            "PowerState/stopping" | "PowerState/deallocating" => ObservedState::Stopping,
            "PowerState/stopped" | "PowerState/deallocated" => ObservedState::Stopped,
            _ => match properties.provisioning_state.as_deref() {
                Some("Failed") => ObservedState::Error,
                Some("Deleting") => ObservedState::Stopping,
                _ => ObservedState::Starting,
            },
        }
    }
}

#[async_trait]
impl GpuProvider for AzureProvider {
    fn tag(&self) -> ProviderTag {
        ProviderTag::Azure
    }

    async fn list_offers(&self, profile: &ResourceProfile) -> AdapterResult<Vec<Offer>> {
        let offers = GPU_SIZES
            .iter()
            .filter(|(_, model, count, memory, _, _)| profile.satisfied_by(model, *count, *memory))
            .map(|(_, model, count, memory, vcpus, cents)| Offer {
                provider: ProviderTag::Azure,
                region: self.region.clone(),
                gpu_model: (*model).to_string(),
                gpu_count: *count,
                memory_mb: *memory,
                vcpus: *vcpus,
                disk_gb: profile.disk_gb.unwrap_or(128),
                hourly_rate_cents: *cents,
                availability: 4,
            })
            .collect();
        Ok(offers)
    }

    async fn create_instance(&self, offer: &Offer, boot: &BootParams) -> AdapterResult<String> {
        let vm_size = GPU_SIZES
            .iter()
            .find(|(_, model, count, memory, _, _)| {
                model.eq_ignore_ascii_case(&offer.gpu_model)
                    && *count == offer.gpu_count
                    && *memory == offer.memory_mb
            })
            .map(|(size, ..)| *size)
            .ok_or_else(|| AdapterError::Fatal(format!("no Azure size for offer {offer:?}")))?;

        let name = format!("aima-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let mut cloud_init = format!(
            "#cloud-config\nruncmd:\n  - docker run -d --gpus all -p {WORKER_PORT}:{WORKER_PORT} \
             -e AIMA_BOOTSTRAP_TOKEN={} ",
            boot.bootstrap_token
        );
        for (key, value) in &boot.env {
            cloud_init.push_str(&format!("-e {key}={value} "));
        }
        cloud_init.push_str(&boot.image);
        cloud_init.push('\n');

        let body = json!({
            "location": self.region,
            "tags": {"aima": "managed"},
            "properties": {
                "hardwareProfile": {"vmSize": vm_size},
                "storageProfile": {
                    "imageReference": {
                        "publisher": "Canonical",
                        "offer": "0001-com-ubuntu-server-jammy",
                        "sku": "22_04-lts-gen2",
                        "version": "latest"
                    },
                    "osDisk": {
                        "createOption": "FromImage",
                        "diskSizeGB": offer.disk_gb.max(30),
                        "deleteOption": "Delete"
                    }
                },
                "osProfile": {
                    "computerName": name,
                    "adminUsername": "aima",
                    "customData": base64::engine::general_purpose::STANDARD.encode(&cloud_init),
                    "linuxConfiguration": {"disablePasswordAuthentication": true}
                }
            }
        });

        let resp = self
            .client
            .put(self.vm_url(&name))
            .query(&[("api-version", API_VERSION)])
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
            .get(self.vm_url(provider_instance_id))
            .query(&[("api-version", API_VERSION), ("$expand", "instanceView")])
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
        let dto: VmDto =
            serde_json::from_str(&body).map_err(|e| AdapterError::Fatal(format!("decode: {e}")))?;

        let properties = dto
            .properties
            .ok_or_else(|| AdapterError::Fatal("vm has no properties".into()))?;
        let state = Self::observed_state(&properties);
        // VMs are created with a DNS label equal to their name
        let external_address = if state == ObservedState::Running {
            Some(format!(
                "{provider_instance_id}.{}.cloudapp.azure.com:{WORKER_PORT}",
                self.region
            ))
        } else {
            None
        };
        let started_at = properties
            .time_created
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
            .delete(self.vm_url(provider_instance_id))
            .query(&[("api-version", API_VERSION)])
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
        let url = format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines",
            self.base, self.subscription_id, self.resource_group
        );
        let resp = self
            .client
            .get(url)
            .query(&[("api-version", API_VERSION)])
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(classify_transport)?;
        let status = resp.status();
        let body = resp.text().await.map_err(classify_transport)?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        let list: VmListDto =
            serde_json::from_str(&body).map_err(|e| AdapterError::Fatal(format!("decode: {e}")))?;
        Ok(list
            .value
            .into_iter()
            .map(|v| v.name)
            .filter(|n| n.starts_with("aima-"))
            .collect())
    }

    async fn health(&self) -> AdapterResult<HealthProbe> {
        let start = Instant::now();
        let url = format!(
            "{}/subscriptions/{}/resourceGroups/{}",
            self.base, self.subscription_id, self.resource_group
        );
        let resp = self
            .client
            .get(url)
            .query(&[("api-version", "2021-04-01")])
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
