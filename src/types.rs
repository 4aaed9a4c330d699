//! Core domain model: jobs, instances, assignments, offers
//!
//! State machines are enforced in two places. The enums here answer "is this
//! transition legal" and the store answers "did the row actually move" via
//! compare-and-set. Both must agree before anything observable changes.
//!
//! All monetary amounts are whole cents (`i64`). All timestamps are UTC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque 128-bit job identifier, generated at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Orchestrator-side instance identifier, distinct from any provider-side id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for InstanceId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Tag identifying which capacity pool an instance or offer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderTag {
    Aws,
    Azure,
    Gcp,
    Local,
    Runpod,
    Vast,
}

impl ProviderTag {
    pub const ALL: [ProviderTag; 6] = [
        ProviderTag::Aws,
        ProviderTag::Azure,
        ProviderTag::Gcp,
        ProviderTag::Local,
        ProviderTag::Runpod,
        ProviderTag::Vast,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderTag::Aws => "aws",
            ProviderTag::Azure => "azure",
            ProviderTag::Gcp => "gcp",
            ProviderTag::Local => "local",
            ProviderTag::Runpod => "runpod",
            ProviderTag::Vast => "vast",
        }
    }
}

impl fmt::Display for ProviderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderTag {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aws" => Ok(ProviderTag::Aws),
            "azure" => Ok(ProviderTag::Azure),
            "gcp" => Ok(ProviderTag::Gcp),
            "local" => Ok(ProviderTag::Local),
            "runpod" => Ok(ProviderTag::Runpod),
            "vast" => Ok(ProviderTag::Vast),
            other => Err(format!("unknown provider tag: {other}")),
        }
    }
}

/// Registered analysis workload families. Arbitrary user containers are not
/// accepted; the image for a submission must match the registered template
/// for its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Llava,
    Llama,
    Training,
    Batch,
    Inference,
    Custom,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Llava => "llava",
            JobKind::Llama => "llama",
            JobKind::Training => "training",
            JobKind::Batch => "batch",
            JobKind::Inference => "inference",
            JobKind::Custom => "custom",
        }
    }
}

impl FromStr for JobKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llava" => Ok(JobKind::Llava),
            "llama" => Ok(JobKind::Llama),
            "training" => Ok(JobKind::Training),
            "batch" => Ok(JobKind::Batch),
            "inference" => Ok(JobKind::Inference),
            "custom" => Ok(JobKind::Custom),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// Coarse scheduling priority. Four buckets, FIFO within a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Numeric bucket used for queue ordering. Higher schedules first.
    pub fn bucket(&self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl FromStr for Priority {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Requested GPU capacity for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub gpu_model: String,
    pub gpu_count: u32,
    pub memory_mb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_gb: Option<u32>,
}

impl ResourceProfile {
    /// Whether capacity with the given shape satisfies this request.
    ///
    /// GPU model matching is exact (case-insensitive); counts and memory are
    /// minimums.
    pub fn satisfied_by(&self, gpu_model: &str, gpu_count: u32, memory_mb: u64) -> bool {
        self.gpu_model.eq_ignore_ascii_case(gpu_model)
            && gpu_count >= self.gpu_count
            && memory_mb >= self.memory_mb
    }

    /// Grouping key for capacity buckets in the scheduler.
    pub fn bucket_key(&self) -> (String, u32) {
        (self.gpu_model.to_ascii_lowercase(), self.gpu_count)
    }
}

/// Job lifecycle states.
///
/// Transitions are one-way; a failed job is retried by creating a new job row
/// with `retry_of` pointing back at the failed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::TimedOut
        )
    }

    /// Legal forward edges of the job state machine.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Pending)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Queued, TimedOut)
                | (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Pending, Queued)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, TimedOut)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::TimedOut => "timed_out",
        }
    }
}

impl FromStr for JobState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            "timed_out" => Ok(JobState::TimedOut),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Stable classification recorded on a job row when it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Retryable,
    Permanent,
    LostWorker,
    DispatchTimeout,
    DeadlineExceeded,
    NoCapacity,
    Protocol,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Retryable => "retryable",
            ErrorClass::Permanent => "permanent",
            ErrorClass::LostWorker => "lost_worker",
            ErrorClass::DispatchTimeout => "dispatch_timeout",
            ErrorClass::DeadlineExceeded => "deadline_exceeded",
            ErrorClass::NoCapacity => "no_capacity",
            ErrorClass::Protocol => "protocol",
        }
    }

    /// Whether a failure with this class consumes retry budget rather than
    /// ending the retry chain.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::Retryable | ErrorClass::LostWorker | ErrorClass::Protocol
        )
    }
}

impl FromStr for ErrorClass {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retryable" => Ok(ErrorClass::Retryable),
            "permanent" => Ok(ErrorClass::Permanent),
            "lost_worker" => Ok(ErrorClass::LostWorker),
            "dispatch_timeout" => Ok(ErrorClass::DispatchTimeout),
            "deadline_exceeded" => Ok(ErrorClass::DeadlineExceeded),
            "no_capacity" => Ok(ErrorClass::NoCapacity),
            "protocol" => Ok(ErrorClass::Protocol),
            other => Err(format!("unknown error class: {other}")),
        }
    }
}

/// A job submission as accepted by the API, before persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub kind: JobKind,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    pub resources: ResourceProfile,
    pub image: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_ceiling_cents: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

fn default_priority() -> Priority {
    Priority::Normal
}

fn default_max_retries() -> u32 {
    3
}

/// A persisted unit of analysis work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner: String,
    pub spec: JobSpec,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<JobId>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_scheduled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_cost_cents: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
}

impl Job {
    /// Remaining retry budget, counted along the `retry_of` chain.
    pub fn retries_left(&self) -> u32 {
        self.spec.max_retries.saturating_sub(self.retry_count)
    }
}

/// Instance lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Requested,
    Starting,
    Running,
    Draining,
    Stopped,
    Error,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Stopped | InstanceState::Error)
    }

    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Requested, Starting)
                | (Requested, Error)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Draining)
                | (Running, Error)
                | (Draining, Stopped)
                | (Draining, Error)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Requested => "requested",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Draining => "draining",
            InstanceState::Stopped => "stopped",
            InstanceState::Error => "error",
        }
    }
}

impl FromStr for InstanceState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(InstanceState::Requested),
            "starting" => Ok(InstanceState::Starting),
            "running" => Ok(InstanceState::Running),
            "draining" => Ok(InstanceState::Draining),
            "stopped" => Ok(InstanceState::Stopped),
            "error" => Ok(InstanceState::Error),
            other => Err(format!("unknown instance state: {other}")),
        }
    }
}

/// One rented or local unit of GPU capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub provider: ProviderTag,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_instance_id: Option<String>,
    pub gpu_model: String,
    pub gpu_count: u32,
    pub memory_mb: u64,
    pub vcpus: u32,
    pub disk_gb: u32,
    pub hourly_rate_cents: i64,
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub accumulated_cost_cents: i64,
    #[serde(skip)]
    pub bootstrap_token: String,
}

/// Assignment lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentState {
    Assigned,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl AssignmentState {
    pub fn is_live(&self) -> bool {
        matches!(self, AssignmentState::Assigned | AssignmentState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentState::Assigned => "assigned",
            AssignmentState::Running => "running",
            AssignmentState::Completed => "completed",
            AssignmentState::Failed => "failed",
            AssignmentState::Aborted => "aborted",
        }
    }
}

impl FromStr for AssignmentState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assigned" => Ok(AssignmentState::Assigned),
            "running" => Ok(AssignmentState::Running),
            "completed" => Ok(AssignmentState::Completed),
            "failed" => Ok(AssignmentState::Failed),
            "aborted" => Ok(AssignmentState::Aborted),
            other => Err(format!("unknown assignment state: {other}")),
        }
    }
}

/// The pairing of one job attempt to one instance. Never deleted; this is
/// the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: i64,
    pub job_id: JobId,
    pub instance_id: InstanceId,
    pub state: AssignmentState,
    pub assigned_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// A provider-advertised purchasable capacity unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub provider: ProviderTag,
    pub region: String,
    pub gpu_model: String,
    pub gpu_count: u32,
    pub memory_mb: u64,
    pub vcpus: u32,
    pub disk_gb: u32,
    pub hourly_rate_cents: i64,
    /// How many units the provider claims to have available right now.
    pub availability: u32,
}

impl Offer {
    pub fn satisfies(&self, profile: &ResourceProfile) -> bool {
        profile.satisfied_by(&self.gpu_model, self.gpu_count, self.memory_mb)
            && profile.disk_gb.map_or(true, |d| self.disk_gb >= d)
    }
}

/// One recorded state change on a job, kept for `GET /jobs/{id}` history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTransition {
    pub job_id: JobId,
    pub from_state: JobState,
    pub to_state: JobState,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Append-only record of instance time charged against an owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub instance_id: InstanceId,
    pub owner: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub hourly_rate_cents: i64,
    pub accrued_cents: i64,
}

/// Compute the cents accrued for a period at a given hourly rate.
///
/// Rounds up so the sum over ledger entries never undercounts a partial
/// second; cost must be monotonically non-decreasing.
pub fn accrued_cents(rate_cents_per_hour: i64, start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    let secs = (end - start).num_seconds().max(0);
    let numerator = rate_cents_per_hour
        .saturating_mul(secs)
        .saturating_add(3599);
    numerator / 3600
}
