//! Typed configuration snapshot
//!
//! Configuration is loaded once at startup from TOML and held behind an
//! atomic pointer (`ConfigHandle`). Components read a snapshot per tick and
//! never observe a half-applied reload; credential rotation is an atomic
//! swap of the whole snapshot.

use crate::error::{ConfigError, Result};
use crate::types::{JobKind, ProviderTag};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub auth: AuthConfig,
    pub scheduler: SchedulerConfig,
    pub lifecycle: LifecycleConfig,
    pub cost: CostConfig,
    pub warmup: WarmupConfig,
    pub templates: TemplateConfig,
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Queued-job count above which POST /jobs returns 429.
    pub admission_watermark: u64,
    pub rate_limit_burst: u32,
    pub rate_limit_per_sec: f64,
    /// Prefix under which workers upload results, extended with the job id.
    pub results_uri_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8085".to_string(),
            admission_watermark: 10_000,
            rate_limit_burst: 20,
            rate_limit_per_sec: 5.0,
            results_uri_prefix: "s3://aima-results".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database path. ":memory:" is accepted for tests.
    pub path: String,
    /// Days a terminal job stays in hot storage before archival.
    pub retention_days: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "aimad.db".to_string(),
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// PEM file holding the auth service's RSA public key (RS256).
    pub public_key_path: Option<String>,
    /// HS256 shared secret for development deployments without the auth
    /// service. Ignored when `public_key_path` is set.
    pub dev_secret: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            public_key_path: None,
            dev_secret: Some("aima-dev-secret".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
    pub claim_lease_secs: i64,
    pub claim_batch: u32,
    pub max_pending_creates_per_provider: u32,
    /// How long a job may sit queued with no capacity anywhere before it
    /// fails as no_capacity.
    pub no_capacity_wait_secs: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
            claim_lease_secs: 30,
            claim_batch: 64,
            max_pending_creates_per_provider: 2,
            no_capacity_wait_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub idle_grace_secs: i64,
    pub start_deadline_secs: i64,
    pub dispatch_timeout_secs: i64,
    pub heartbeat_threshold_secs: i64,
    pub cancel_grace_secs: u64,
    pub reaper_interval_secs: u64,
    pub reconcile_interval_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_grace_secs: 300,
            start_deadline_secs: 600,
            dispatch_timeout_secs: 120,
            heartbeat_threshold_secs: 90,
            cancel_grace_secs: 15,
            reaper_interval_secs: 15,
            reconcile_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub accrual_interval_secs: u64,
    /// Ceiling applied to owners with no explicit budget.
    pub default_owner_ceiling_cents: i64,
    /// Per-owner ceiling overrides.
    pub owner_ceilings: HashMap<String, i64>,
    /// Nominal hourly rate for submission-time estimates, before any offer
    /// is known.
    pub reference_rate_cents_per_hour: i64,
    /// Expected run duration per job kind, minutes. Used for cost estimates;
    /// the orchestrator does not learn durations.
    pub expected_duration_mins: HashMap<String, u64>,
}

impl Default for CostConfig {
    fn default() -> Self {
        let mut expected = HashMap::new();
        expected.insert(JobKind::Llava.as_str().to_string(), 20);
        expected.insert(JobKind::Llama.as_str().to_string(), 15);
        expected.insert(JobKind::Training.as_str().to_string(), 240);
        expected.insert(JobKind::Batch.as_str().to_string(), 60);
        expected.insert(JobKind::Inference.as_str().to_string(), 10);
        expected.insert(JobKind::Custom.as_str().to_string(), 60);
        Self {
            accrual_interval_secs: 60,
            default_owner_ceiling_cents: 50_000,
            owner_ceilings: HashMap::new(),
            reference_rate_cents_per_hour: 300,
            expected_duration_mins: expected,
        }
    }
}

impl CostConfig {
    pub fn expected_duration_mins_for(&self, kind: JobKind) -> u64 {
        self.expected_duration_mins
            .get(kind.as_str())
            .copied()
            .unwrap_or(60)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupConfig {
    pub enabled: bool,
    /// Queue-depth observation window, minutes.
    pub window_mins: u32,
    pub max_spares: u32,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_mins: 10,
            max_spares: 2,
        }
    }
}

/// Registered worker images, one per job kind. Submissions naming any other
/// image are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    pub images: HashMap<String, String>,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        let mut images = HashMap::new();
        images.insert(
            JobKind::Llava.as_str().to_string(),
            "aima/llava-worker:latest".to_string(),
        );
        images.insert(
            JobKind::Llama.as_str().to_string(),
            "aima/llama-worker:latest".to_string(),
        );
        images.insert(
            JobKind::Training.as_str().to_string(),
            "aima/training-worker:latest".to_string(),
        );
        images.insert(
            JobKind::Batch.as_str().to_string(),
            "aima/batch-worker:latest".to_string(),
        );
        images.insert(
            JobKind::Inference.as_str().to_string(),
            "aima/inference-worker:latest".to_string(),
        );
        images.insert(
            JobKind::Custom.as_str().to_string(),
            "aima/custom-worker:latest".to_string(),
        );
        Self { images }
    }
}

impl TemplateConfig {
    pub fn image_for(&self, kind: JobKind) -> Option<&str> {
        self.images.get(kind.as_str()).map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProvidersConfig {
    pub runpod: Option<RunpodConfig>,
    pub vast: Option<VastConfig>,
    pub aws: Option<AwsConfig>,
    pub gcp: Option<GcpConfig>,
    pub azure: Option<AzureConfig>,
    pub local: Option<LocalConfig>,
}

impl ProvidersConfig {
    pub fn enabled_tags(&self) -> Vec<ProviderTag> {
        let mut tags = Vec::new();
        if self.runpod.as_ref().is_some_and(|c| c.common.enabled) {
            tags.push(ProviderTag::Runpod);
        }
        if self.vast.as_ref().is_some_and(|c| c.common.enabled) {
            tags.push(ProviderTag::Vast);
        }
        if self.aws.as_ref().is_some_and(|c| c.common.enabled) {
            tags.push(ProviderTag::Aws);
        }
        if self.gcp.as_ref().is_some_and(|c| c.common.enabled) {
            tags.push(ProviderTag::Gcp);
        }
        if self.azure.as_ref().is_some_and(|c| c.common.enabled) {
            tags.push(ProviderTag::Azure);
        }
        if self.local.as_ref().is_some_and(|c| c.common.enabled) {
            tags.push(ProviderTag::Local);
        }
        tags
    }

    pub fn common_for(&self, tag: ProviderTag) -> Option<&ProviderCommon> {
        match tag {
            ProviderTag::Runpod => self.runpod.as_ref().map(|c| &c.common),
            ProviderTag::Vast => self.vast.as_ref().map(|c| &c.common),
            ProviderTag::Aws => self.aws.as_ref().map(|c| &c.common),
            ProviderTag::Gcp => self.gcp.as_ref().map(|c| &c.common),
            ProviderTag::Azure => self.azure.as_ref().map(|c| &c.common),
            ProviderTag::Local => self.local.as_ref().map(|c| &c.common),
        }
    }
}

/// Knobs shared by every provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderCommon {
    pub enabled: bool,
    /// Cap on non-terminal instances the orchestrator will hold on this
    /// provider, distinct from the provider's own account limits.
    pub soft_quota: u32,
    pub regions: Vec<String>,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_ceiling_ms: u64,
    pub poll_interval_secs: u64,
    pub breaker: BreakerConfig,
}

impl Default for ProviderCommon {
    fn default() -> Self {
        Self {
            enabled: true,
            soft_quota: 10,
            regions: Vec::new(),
            connect_timeout_ms: 5_000,
            read_timeout_ms: 30_000,
            max_retries: 5,
            backoff_ceiling_ms: 30_000,
            poll_interval_secs: 10,
            breaker: BreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Rolling window length in calls.
    pub window: u32,
    /// Minimum calls in the window before the ratio is considered.
    pub min_calls: u32,
    /// Failure ratio at or above which the breaker opens.
    pub failure_ratio: f64,
    pub cooldown_secs: u64,
    pub max_cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: 40,
            min_calls: 20,
            failure_ratio: 0.5,
            cooldown_secs: 30,
            max_cooldown_secs: 480,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunpodConfig {
    #[serde(flatten)]
    pub common: ProviderCommon,
    pub api_key: String,
    pub api_base: String,
}

impl Default for RunpodConfig {
    fn default() -> Self {
        Self {
            common: ProviderCommon::default(),
            api_key: String::new(),
            api_base: "https://rest.runpod.io/v1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VastConfig {
    #[serde(flatten)]
    pub common: ProviderCommon,
    pub api_key: String,
    pub api_base: String,
}

impl Default for VastConfig {
    fn default() -> Self {
        Self {
            common: ProviderCommon::default(),
            api_key: String::new(),
            api_base: "https://console.vast.ai/api/v0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    #[serde(flatten)]
    pub common: ProviderCommon,
    pub region: String,
    pub ami: String,
    pub instance_profile: Option<String>,
    pub security_group: Option<String>,
    pub subnet_id: Option<String>,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            common: ProviderCommon::default(),
            region: "us-east-1".to_string(),
            ami: "ami-08fa3ed5577079e64".to_string(),
            instance_profile: None,
            security_group: None,
            subnet_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcpConfig {
    #[serde(flatten)]
    pub common: ProviderCommon,
    pub project: String,
    pub zone: String,
    pub access_token: String,
    pub api_base: String,
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            common: ProviderCommon::default(),
            project: String::new(),
            zone: "us-central1-a".to_string(),
            access_token: String::new(),
            api_base: "https://compute.googleapis.com/compute/v1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    #[serde(flatten)]
    pub common: ProviderCommon,
    pub subscription_id: String,
    pub resource_group: String,
    pub access_token: String,
    pub api_base: String,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            common: ProviderCommon::default(),
            subscription_id: String::new(),
            resource_group: "aima-gpu".to_string(),
            access_token: String::new(),
            api_base: "https://management.azure.com".to_string(),
        }
    }
}

/// Fixed inventory of in-process GPU slots. Exists so the scheduler code path
/// is identical in dev and prod.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    #[serde(flatten)]
    pub common: ProviderCommon,
    pub slots: Vec<LocalSlot>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            common: ProviderCommon {
                soft_quota: 2,
                poll_interval_secs: 1,
                ..ProviderCommon::default()
            },
            slots: vec![LocalSlot::default(), LocalSlot::default()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSlot {
    pub gpu_model: String,
    pub gpu_count: u32,
    pub memory_mb: u64,
    pub vcpus: u32,
    pub disk_gb: u32,
    /// Where a worker on this slot will listen, if one is launched.
    pub address: String,
}

impl Default for LocalSlot {
    fn default() -> Self {
        Self {
            gpu_model: "RTX 4090".to_string(),
            gpu_count: 1,
            memory_mb: 32_768,
            vcpus: 16,
            disk_gb: 200,
            address: "127.0.0.1:9400".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            auth: AuthConfig::default(),
            scheduler: SchedulerConfig::default(),
            lifecycle: LifecycleConfig::default(),
            cost: CostConfig::default(),
            warmup: WarmupConfig::default(),
            templates: TemplateConfig::default(),
            providers: ProvidersConfig {
                local: Some(LocalConfig::default()),
                ..ProvidersConfig::default()
            },
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(config_path) = path else {
            return Ok(Config::default());
        };
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path.display().to_string()).into());
        }
        let content = std::fs::read_to_string(config_path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", config_path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Startup sanity checks that must hold before any component runs.
    pub fn validate(&self) -> Result<()> {
        if self.providers.enabled_tags().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "providers".to_string(),
                reason: "at least one provider must be enabled".to_string(),
            }
            .into());
        }
        if self.scheduler.tick_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.tick_interval_secs".to_string(),
                reason: "must be positive".to_string(),
            }
            .into());
        }
        if self.lifecycle.start_deadline_secs <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "lifecycle.start_deadline_secs".to_string(),
                reason: "must be positive".to_string(),
            }
            .into());
        }
        for common in ProviderTag::ALL
            .iter()
            .filter_map(|t| self.providers.common_for(*t))
        {
            if !(0.0..=1.0).contains(&common.breaker.failure_ratio) {
                return Err(ConfigError::InvalidValue {
                    field: "breaker.failure_ratio".to_string(),
                    reason: "must be within [0, 1]".to_string(),
                }
                .into());
            }
        }
        Ok(())
    }
}

/// Atomically swappable handle to the current configuration snapshot.
pub struct ConfigHandle {
    inner: ArcSwap<Config>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            inner: ArcSwap::from_pointee(config),
        }
    }

    /// The current snapshot. Callers hold it for at most one tick.
    pub fn snapshot(&self) -> Arc<Config> {
        self.inner.load_full()
    }

    /// Replace the snapshot. In-flight readers keep the old one.
    pub fn swap(&self, config: Config) {
        self.inner.store(Arc::new(config));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.providers.enabled_tags(), vec![ProviderTag::Local]);
        assert_eq!(config.scheduler.tick_interval_secs, 5);
    }

    #[test]
    fn save_and_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("aimad.toml");

        let config = Config::default();
        config.save(&path).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(
            loaded.scheduler.claim_lease_secs,
            config.scheduler.claim_lease_secs
        );
        assert_eq!(loaded.lifecycle.idle_grace_secs, config.lifecycle.idle_grace_secs);
        assert!(loaded.providers.local.is_some());
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nope.toml");
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn load_invalid_toml_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.toml");
        std::fs::write(&path, "not valid toml {").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn no_enabled_providers_fails_validation() {
        let mut config = Config::default();
        config.providers = ProvidersConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn handle_swaps_atomically() {
        let handle = ConfigHandle::new(Config::default());
        let before = handle.snapshot();
        let mut next = Config::default();
        next.scheduler.tick_interval_secs = 1;
        handle.swap(next);
        assert_eq!(before.scheduler.tick_interval_secs, 5);
        assert_eq!(handle.snapshot().scheduler.tick_interval_secs, 1);
    }

    #[test]
    fn expected_duration_lookup_falls_back() {
        let cost = CostConfig::default();
        assert_eq!(cost.expected_duration_mins_for(JobKind::Inference), 10);
        let empty = CostConfig {
            expected_duration_mins: HashMap::new(),
            ..CostConfig::default()
        };
        assert_eq!(empty.expected_duration_mins_for(JobKind::Llava), 60);
    }
}
