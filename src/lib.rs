//! aimad library
//!
//! Core of the AIMA GPU job orchestrator: accepts analysis job submissions,
//! schedules them onto GPU capacity rented from RunPod, Vast.ai, AWS, GCP,
//! and Azure (or taken from a local pool), manages instance lifecycles
//! including warm reuse and idle tear-down, dispatches jobs to workers over
//! a WebSocket control channel, and accounts for every rented minute in an
//! append-only cost ledger.
//!
//! ## Architecture
//!
//! The daemon is a set of cooperating long-lived tasks around a single
//! SQLite-backed job store:
//!
//! - **Store** (`store`): the single source of truth; all state transitions
//!   are transactional compare-and-sets
//! - **Provider adapters** (`provider`, `providers`): one uniform capability
//!   surface per cloud, each guarded by a circuit breaker and retry policy
//! - **Scheduler** (`scheduler`): matches queued jobs to idle instances,
//!   best-fit, priority buckets with FIFO inside each
//! - **Provisioner** (`provisioner`): drives the per-instance state machine
//!   against provider APIs
//! - **Dispatcher** (`dispatcher`): owns live assignments and the worker
//!   control channel
//! - **Reaper** (`reaper`): timeouts, idle drains, orphan reconciliation
//! - **Cost** (`cost`): offer ranking, budgets, per-minute accrual
//! - **API** (`api`): the HTTP/JSON surface
//!
//! Components communicate through the store plus a lossy in-process event
//! bus (`events`); events are wake-up hints, and every consumer re-reads
//! persisted state when it wakes.

pub mod api;
pub mod breaker;
pub mod config;
pub mod cost;
pub mod daemon;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod provider;
pub mod providers;
pub mod provisioner;
pub mod reaper;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use config::{Config, ConfigHandle};
pub use error::{ConfigError, IsRetryable, OrchestratorError, Result};
pub use events::{Event, EventBus};
pub use provider::{AdapterError, BootParams, GpuProvider, Observation, ObservedState};
pub use providers::{ProviderHandle, ProviderRegistry};
pub use retry::ExponentialBackoffPolicy;
pub use store::JobStore;
pub use types::{
    Assignment, AssignmentState, Instance, InstanceId, InstanceState, Job, JobId, JobKind,
    JobSpec, JobState, Offer, Priority, ProviderTag, ResourceProfile,
};
