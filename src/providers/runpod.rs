//! RunPod adapter
//!
//! Speaks the RunPod REST API. Offers come from the GPU type catalog; pods
//! are created with the registered worker image and the bootstrap token in
//! the environment, and the worker's control port is read back from the
//! pod's port mappings once it is up.

use super::http::{build_client, classify_status, classify_transport, dollars_to_cents};
use crate::config::RunpodConfig;
use crate::provider::{
    normalize_state, AdapterError, AdapterResult, BootParams, GpuProvider, HealthProbe,
    Observation, ObservedState,
};
use crate::types::{Offer, ProviderTag, ResourceProfile};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

pub const WORKER_PORT: u16 = 9400;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GpuTypeDto {
    id: String,
    display_name: String,
    memory_in_gb: u64,
    secure_price: Option<f64>,
    #[serde(default)]
    max_gpu_count: Option<u32>,
    #[serde(default)]
    stock_status: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatePodRequest<'a> {
    name: String,
    image_name: &'a str,
    gpu_type_id: &'a str,
    gpu_count: u32,
    container_disk_in_gb: u32,
    ports: String,
    env: &'a HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodDto {
    id: String,
    #[serde(default)]
    desired_status: Option<String>,
    #[serde(default)]
    runtime: Option<PodRuntimeDto>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodRuntimeDto {
    #[serde(default)]
    ports: Vec<PodPortDto>,
    #[serde(default)]
    start_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodPortDto {
    ip: String,
    public_port: u16,
    private_port: u16,
    #[serde(default)]
    is_ip_public: bool,
}

pub struct RunpodProvider {
    client: reqwest::Client,
    credentials: ArcSwap<String>,
    base: String,
}

impl RunpodProvider {
    pub fn new(config: &RunpodConfig) -> AdapterResult<Self> {
        Ok(Self {
            client: build_client(&config.common)?,
            credentials: ArcSwap::from_pointee(config.api_key.clone()),
            base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    /// Swap the API key without tearing down in-flight requests.
    pub fn rotate_credentials(&self, api_key: String) {
        self.credentials.store(Arc::new(api_key));
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.credentials.load())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> AdapterResult<T> {
        let resp = self
            .client
            .get(format!("{}{path}", self.base))
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(classify_transport)?;
        let status = resp.status();
        let body = resp.text().await.map_err(classify_transport)?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        serde_json::from_str(&body).map_err(|e| AdapterError::Fatal(format!("decode: {e}")))
    }

    fn availability_of(stock: Option<&str>) -> u32 {
        match stock {
            Some("High") => 10,
            Some("Medium") => 5,
            Some("Low") => 1,
            _ => 0,
        }
    }
}

#[async_trait]
impl GpuProvider for RunpodProvider {
    fn tag(&self) -> ProviderTag {
        ProviderTag::Runpod
    }

    async fn list_offers(&self, profile: &ResourceProfile) -> AdapterResult<Vec<Offer>> {
        let gpus: Vec<GpuTypeDto> = self.get_json("/gpus").await?;
        let mut offers = Vec::new();
        for gpu in gpus {
            let Some(price) = gpu.secure_price else {
                continue;
            };
            let availability = Self::availability_of(gpu.stock_status.as_deref());
            if availability == 0 {
                continue;
            }
            let matches_model = gpu.display_name.eq_ignore_ascii_case(&profile.gpu_model)
                || gpu.id.eq_ignore_ascii_case(&profile.gpu_model);
            if !matches_model {
                continue;
            }
            if gpu.max_gpu_count.unwrap_or(1) < profile.gpu_count {
                continue;
            }
            // RunPod pods come with GPU-proportional host memory
            offers.push(Offer {
                provider: ProviderTag::Runpod,
                region: "secure".to_string(),
                gpu_model: gpu.display_name,
                gpu_count: profile.gpu_count,
                memory_mb: gpu.memory_in_gb * 1024 * profile.gpu_count as u64,
                vcpus: 8 * profile.gpu_count,
                disk_gb: profile.disk_gb.unwrap_or(40),
                hourly_rate_cents: dollars_to_cents(price) * profile.gpu_count as i64,
                availability,
            });
        }
        Ok(offers)
    }

    async fn create_instance(&self, offer: &Offer, boot: &BootParams) -> AdapterResult<String> {
        let mut env = boot.env.clone();
        env.insert("AIMA_BOOTSTRAP_TOKEN".to_string(), boot.bootstrap_token.clone());
        let request = CreatePodRequest {
            name: format!("aima-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            image_name: &boot.image,
            gpu_type_id: &offer.gpu_model,
            gpu_count: offer.gpu_count,
            container_disk_in_gb: offer.disk_gb,
            ports: format!("{WORKER_PORT}/tcp"),
            env: &env,
        };
        let resp = self
            .client
            .post(format!("{}/pods", self.base))
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
        let pod: PodDto =
            serde_json::from_str(&body).map_err(|e| AdapterError::Fatal(format!("decode: {e}")))?;
        Ok(pod.id)
    }

    async fn observe_instance(&self, provider_instance_id: &str) -> AdapterResult<Observation> {
        let resp = self
            .client
            .get(format!("{}/pods/{provider_instance_id}", self.base))
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(classify_transport)?;
        // a vanished pod is a stopped pod, not an error
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
        let pod: PodDto =
            serde_json::from_str(&body).map_err(|e| AdapterError::Fatal(format!("decode: {e}")))?;

        let state = match (&pod.desired_status, &pod.runtime) {
            (Some(s), Some(_)) if s.eq_ignore_ascii_case("running") => ObservedState::Running,
            (Some(s), _) => normalize_state(s),
            (None, _) => ObservedState::Starting,
        };
        let external_address = pod.runtime.as_ref().and_then(|rt| {
            rt.ports
                .iter()
                .find(|p| p.private_port == WORKER_PORT && p.is_ip_public)
                .map(|p| format!("{}:{}", p.ip, p.public_port))
        });
        let started_at = pod.runtime.as_ref().and_then(|rt| rt.start_timestamp);
        Ok(Observation {
            state,
            external_address,
            started_at,
        })
    }

    async fn terminate_instance(&self, provider_instance_id: &str) -> AdapterResult<()> {
        let resp = self
            .client
            .delete(format!("{}/pods/{provider_instance_id}", self.base))
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
        let pods: Vec<PodDto> = self.get_json("/pods").await?;
        Ok(pods.into_iter().map(|p| p.id).collect())
    }

    async fn health(&self) -> AdapterResult<HealthProbe> {
        let start = Instant::now();
        let resp = self
            .client
            .get(format!("{}/gpus", self.base))
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
