//! Provider-agnostic trait definitions for GPU capacity providers
//!
//! Every cloud the orchestrator can rent capacity from (RunPod, Vast.ai, AWS,
//! GCP, Azure) plus the local pool implements exactly the same capability
//! set. Nothing above the adapter boundary knows which provider it is talking
//! to; the "which cloud" distinction is a tagged registry entry, not a class
//! hierarchy.
//!
//! ## Error Discipline
//!
//! Adapters never leak provider-native error shapes. Every failure is
//! translated at this boundary into the canonical `AdapterError::Retryable`
//! or `AdapterError::Fatal` before it leaves the adapter; callers retry the
//! former with backoff and abort on the latter. Raw provider error text
//! survives only in logs.
//!
//! ## Statelessness
//!
//! Adapters hold credentials and HTTP clients, nothing else. All business
//! state (which instances exist, what they cost, who owns them) lives in the
//! job store.

use crate::types::{Offer, ProviderTag, ResourceProfile};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Canonical outcome classification for adapter calls.
#[derive(Error, Debug)]
pub enum AdapterError {
    /// Transient: timeouts, 5xx, rate limits. Retried with backoff.
    #[error("retryable: {0}")]
    Retryable(String),
    /// Permanent: bad credentials, unknown image, malformed request. Never
    /// retried.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Retryable(_))
    }
}

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Parameters an adapter needs to boot a worker on new capacity.
#[derive(Debug, Clone)]
pub struct BootParams {
    /// Registered worker container image for the job kind.
    pub image: String,
    /// One token per instance lifetime; the worker presents it on the
    /// control channel.
    pub bootstrap_token: String,
    pub env: HashMap<String, String>,
}

/// Canonical instance states as observed at the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

/// Result of a single `observe_instance` poll.
#[derive(Debug, Clone)]
pub struct Observation {
    pub state: ObservedState,
    pub external_address: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Result of a synthetic health probe.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    pub up: bool,
    pub observed_latency: Duration,
}

/// Uniform capability surface over heterogeneous provider APIs.
#[async_trait]
pub trait GpuProvider: Send + Sync {
    fn tag(&self) -> ProviderTag;

    /// Purchasable capacity matching the profile. An empty vec is a valid
    /// answer (no matching capacity), not an error.
    async fn list_offers(&self, profile: &ResourceProfile) -> AdapterResult<Vec<Offer>>;

    /// Start acquiring the offered capacity. Returns the provider-side id;
    /// the instance will be observed until it reaches `running`.
    async fn create_instance(&self, offer: &Offer, boot: &BootParams) -> AdapterResult<String>;

    /// A single poll of the provider-side state. Adapters map native states
    /// onto `ObservedState`.
    async fn observe_instance(&self, provider_instance_id: &str) -> AdapterResult<Observation>;

    async fn terminate_instance(&self, provider_instance_id: &str) -> AdapterResult<()>;

    /// Provider-side ids of every instance this account currently holds.
    /// Used by the reaper to reconcile against the store and kill orphans.
    async fn list_held_instances(&self) -> AdapterResult<Vec<String>>;

    /// Synthetic probe feeding the circuit breaker and /providers status.
    async fn health(&self) -> AdapterResult<HealthProbe>;
}

/// Map a provider-native state string onto the canonical set.
pub fn normalize_state(state_str: &str) -> ObservedState {
    let state_lower = state_str.to_lowercase();
    match state_lower.as_str() {
        "running" | "active" | "ready" => ObservedState::Running,
        "pending" | "starting" | "initializing" | "provisioning" | "created" | "staging" => {
            ObservedState::Starting
        }
        "stopping" | "terminating" | "shutting-down" | "deallocating" | "exited" => {
            ObservedState::Stopping
        }
        "stopped" | "terminated" | "deallocated" | "deleted" => ObservedState::Stopped,
        _ if state_lower.contains("error") || state_lower.contains("failed") => {
            ObservedState::Error
        }
        _ => ObservedState::Starting,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_covers_provider_vocabularies() {
        assert_eq!(normalize_state("RUNNING"), ObservedState::Running);
        assert_eq!(normalize_state("active"), ObservedState::Running);
        assert_eq!(normalize_state("pending"), ObservedState::Starting);
        assert_eq!(normalize_state("staging"), ObservedState::Starting);
        assert_eq!(normalize_state("shutting-down"), ObservedState::Stopping);
        assert_eq!(normalize_state("deallocated"), ObservedState::Stopped);
        assert_eq!(normalize_state("terminated"), ObservedState::Stopped);
        assert_eq!(normalize_state("ProvisioningFailed"), ObservedState::Error);
    }

    #[test]
    fn unknown_states_read_as_starting() {
        // an unrecognized state must not look terminal; the start-deadline
        // bounds how long we will keep polling it
        assert_eq!(normalize_state("weird-new-state"), ObservedState::Starting);
    }

    #[test]
    fn adapter_error_classification() {
        assert!(AdapterError::Retryable("503".into()).is_retryable());
        assert!(!AdapterError::Fatal("bad key".into()).is_retryable());
    }
}
