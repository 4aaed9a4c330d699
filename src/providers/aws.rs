//! AWS EC2 adapter
//!
//! GPU capacity on AWS is a fixed menu of instance types, so offers come from
//! a static table of GPU SKUs with approximate on-demand prices (the pricing
//! API is not consulted). Workers are booted through instance user data and
//! tagged `aima:managed` so reconciliation can tell our instances from
//! everything else in the account.

use crate::config::AwsConfig;
use crate::provider::{
    normalize_state, AdapterError, AdapterResult, BootParams, GpuProvider, HealthProbe,
    Observation, ObservedState,
};
use crate::types::{Offer, ProviderTag, ResourceProfile};
use async_trait::async_trait;
use aws_sdk_ec2::types::{Filter, InstanceType as Ec2InstanceType, Tag, TagSpecification};
use aws_sdk_ec2::Client as Ec2Client;
use base64::Engine;
use chrono::{TimeZone, Utc};
use std::time::Instant;
use uuid::Uuid;

pub const WORKER_PORT: u16 = 9400;

const MANAGED_TAG: &str = "aima:managed";

/// GPU SKU shape: (instance type, gpu model, gpu count, memory MB, vcpus,
/// local disk GB, on-demand cents/hour).
const GPU_SKUS: &[(&str, &str, u32, u64, u32, u32, i64)] = &[
    ("g4dn.xlarge", "T4", 1, 16_384, 4, 125, 53),
    ("g4dn.12xlarge", "T4", 4, 196_608, 48, 900, 391),
    ("g5.xlarge", "A10G", 1, 16_384, 4, 250, 101),
    ("g5.12xlarge", "A10G", 4, 196_608, 48, 3_800, 567),
    ("p3.2xlarge", "V100", 1, 62_464, 8, 0, 306),
    ("p4d.24xlarge", "A100", 8, 1_179_648, 96, 8_000, 3_277),
];

fn classify_aws_error(message: String) -> AdapterError {
    let lower = message.to_lowercase();
    let transient = [
        "throttling",
        "requestlimitexceeded",
        "serviceunavailable",
        "internalerror",
        "timeout",
        "dispatch failure",
        "connection",
    ];
    if transient.iter().any(|needle| lower.contains(needle)) {
        AdapterError::Retryable(message)
    } else {
        AdapterError::Fatal(message)
    }
}

pub struct AwsProvider {
    client: Ec2Client,
    ami: String,
    region: String,
    security_group: Option<String>,
    subnet_id: Option<String>,
    instance_profile: Option<String>,
}

impl AwsProvider {
    pub async fn new(config: &AwsConfig) -> Self {
        let sdk_config = aws_config::from_env()
            .region(aws_sdk_ec2::config::Region::new(config.region.clone()))
            .load()
            .await;
        Self {
            client: Ec2Client::new(&sdk_config),
            ami: config.ami.clone(),
            region: config.region.clone(),
            security_group: config.security_group.clone(),
            subnet_id: config.subnet_id.clone(),
            instance_profile: config.instance_profile.clone(),
        }
    }

    fn sku_for_offer(offer: &Offer) -> AdapterResult<&'static str> {
        GPU_SKUS
            .iter()
            .find(|(_, model, count, memory, _, _, _)| {
                model.eq_ignore_ascii_case(&offer.gpu_model)
                    && *count == offer.gpu_count
                    && *memory == offer.memory_mb
            })
            .map(|(ty, ..)| *ty)
            .ok_or_else(|| AdapterError::Fatal(format!("no EC2 SKU for offer {offer:?}")))
    }

    fn worker_user_data(boot: &BootParams) -> String {
        let mut env_flags = format!("-e AIMA_BOOTSTRAP_TOKEN={}", boot.bootstrap_token);
        for (key, value) in &boot.env {
            env_flags.push_str(&format!(" -e {key}={value}"));
        }
        let script = format!(
            "#!/bin/bash\ndocker run -d --gpus all --restart unless-stopped \
             -p {WORKER_PORT}:{WORKER_PORT} {env_flags} {}\n",
            boot.image
        );
        base64::engine::general_purpose::STANDARD.encode(script)
    }
}

#[async_trait]
impl GpuProvider for AwsProvider {
    fn tag(&self) -> ProviderTag {
        ProviderTag::Aws
    }

    async fn list_offers(&self, profile: &ResourceProfile) -> AdapterResult<Vec<Offer>> {
        // the menu is static; on-demand capacity is assumed available until a
        // create fails
        let offers = GPU_SKUS
            .iter()
            .filter(|(_, model, count, memory, _, _, _)| {
                profile.satisfied_by(model, *count, *memory)
            })
            .map(|(_, model, count, memory, vcpus, disk, cents)| Offer {
                provider: ProviderTag::Aws,
                region: self.region.clone(),
                gpu_model: (*model).to_string(),
                gpu_count: *count,
                memory_mb: *memory,
                vcpus: *vcpus,
                disk_gb: *disk,
                hourly_rate_cents: *cents,
                availability: 8,
            })
            .filter(|o| o.satisfies(profile))
            .collect();
        Ok(offers)
    }

    async fn create_instance(&self, offer: &Offer, boot: &BootParams) -> AdapterResult<String> {
        let instance_type = Self::sku_for_offer(offer)?;
        let name = format!("aima-{}", &Uuid::new_v4().simple().to_string()[..8]);

        let tag_spec = TagSpecification::builder()
            .resource_type(aws_sdk_ec2::types::ResourceType::Instance)
            .tags(Tag::builder().key("Name").value(&name).build())
            .tags(Tag::builder().key(MANAGED_TAG).value("true").build())
            .build();

        let mut request = self
            .client
            .run_instances()
            .image_id(&self.ami)
            .instance_type(Ec2InstanceType::from(instance_type))
            .min_count(1)
            .max_count(1)
            .user_data(Self::worker_user_data(boot))
            .tag_specifications(tag_spec)
            .ebs_optimized(true);

        if let Some(sg) = &self.security_group {
            request = request.security_group_ids(sg);
        }
        if let Some(subnet) = &self.subnet_id {
            request = request.subnet_id(subnet);
        }
        if let Some(profile_name) = &self.instance_profile {
            request = request.iam_instance_profile(
                aws_sdk_ec2::types::IamInstanceProfileSpecification::builder()
                    .name(profile_name)
                    .build(),
            );
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_aws_error(format!("run_instances: {e}")))?;

        response
            .instances()
            .first()
            .and_then(|i| i.instance_id())
            .map(String::from)
            .ok_or_else(|| AdapterError::Fatal("no instance id in run_instances response".into()))
    }

    async fn observe_instance(&self, provider_instance_id: &str) -> AdapterResult<Observation> {
        let response = self
            .client
            .describe_instances()
            .instance_ids(provider_instance_id)
            .send()
            .await;
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                let message = format!("{e}");
                if message.contains("InvalidInstanceID.NotFound") {
                    return Ok(Observation {
                        state: ObservedState::Stopped,
                        external_address: None,
                        started_at: None,
                    });
                }
                return Err(classify_aws_error(format!("describe_instances: {message}")));
            }
        };

        let instance = response
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .next()
            .ok_or_else(|| AdapterError::Fatal("instance missing from describe".into()))?;

        let state = instance
            .state()
            .and_then(|s| s.name())
            .map(|n| normalize_state(n.as_str()))
            .unwrap_or(ObservedState::Starting);
        let external_address = instance
            .public_ip_address()
            .map(|ip| format!("{ip}:{WORKER_PORT}"));
        let started_at = instance
            .launch_time()
            .and_then(|t| Utc.timestamp_opt(t.secs(), 0).single());
        Ok(Observation {
            state,
            external_address,
            started_at,
        })
    }

    async fn terminate_instance(&self, provider_instance_id: &str) -> AdapterResult<()> {
        match self
            .client
            .terminate_instances()
            .instance_ids(provider_instance_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                let message = format!("{e}");
                if message.contains("InvalidInstanceID.NotFound") {
                    return Ok(());
                }
                Err(classify_aws_error(format!("terminate_instances: {message}")))
            }
        }
    }

    async fn list_held_instances(&self) -> AdapterResult<Vec<String>> {
        let response = self
            .client
            .describe_instances()
            .filters(
                Filter::builder()
                    .name(format!("tag:{MANAGED_TAG}"))
                    .values("true")
                    .build(),
            )
            .filters(
                Filter::builder()
                    .name("instance-state-name")
                    .values("pending")
                    .values("running")
                    .values("stopping")
                    .values("shutting-down")
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify_aws_error(format!("describe_instances: {e}")))?;

        Ok(response
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .filter_map(|i| i.instance_id().map(String::from))
            .collect())
    }

    async fn health(&self) -> AdapterResult<HealthProbe> {
        let start = Instant::now();
        let result = self
            .client
            .describe_instances()
            .max_results(5)
            .send()
            .await;
        Ok(HealthProbe {
            up: result.is_ok(),
            observed_latency: start.elapsed(),
        })
    }
}
