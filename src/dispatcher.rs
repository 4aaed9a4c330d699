//! Dispatcher: drives live assignments over the worker control channel
//!
//! Each assignment is owned by exactly one dispatcher task for its lifetime,
//! keyed by assignment id; the ownership set prevents the adoption scan and
//! the event path from double-driving a row. The control channel is a
//! WebSocket to the worker's address, authenticated with the instance's
//! bootstrap token; both directions carry JSON text frames.
//!
//! Every wait in here is bounded: connecting is bounded by the dispatch
//! timeout, silence on the channel by the heartbeat threshold, and
//! cancellation by the cancel grace period.

use crate::config::ConfigHandle;
use crate::cost::CostTracker;
use crate::error::{OrchestratorError, Result};
use crate::events::{Event, EventBus};
use crate::providers::ProviderRegistry;
use crate::store::{JobStore, TransitionDetails};
use crate::types::{
    accrued_cents, Assignment, AssignmentState, ErrorClass, Instance, InstanceState, Job, JobId,
    JobState,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Messages the orchestrator sends to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Start {
        job: WorkerJobSpec,
        result_upload_uri: String,
    },
    Cancel,
    Ping,
}

/// Messages a worker sends back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Progress { pct: f32, message: Option<String> },
    Heartbeat,
    Completed { result_ref: String },
    Failed { class: WorkerFailureClass, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerFailureClass {
    Retryable,
    Permanent,
}

/// The slice of a job a worker needs to run it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerJobSpec {
    pub id: JobId,
    pub kind: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub inputs: Vec<String>,
}

impl WorkerJobSpec {
    fn from_job(job: &Job) -> Self {
        Self {
            id: job.id,
            kind: job.spec.kind.as_str().to_string(),
            image: job.spec.image.clone(),
            env: job.spec.env.clone(),
            inputs: job.spec.inputs.clone(),
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Terminal outcome of driving one assignment.
enum Outcome {
    Completed { result_ref: String },
    Failed { class: ErrorClass, message: String },
    LostWorker,
    Cancelled,
}

pub struct Dispatcher {
    store: JobStore,
    bus: EventBus,
    config: Arc<ConfigHandle>,
    cost: Arc<CostTracker>,
    registry: Arc<ProviderRegistry>,
    owned: Mutex<HashSet<i64>>,
}

impl Dispatcher {
    pub fn new(
        store: JobStore,
        bus: EventBus,
        config: Arc<ConfigHandle>,
        cost: Arc<CostTracker>,
        registry: Arc<ProviderRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            config,
            cost,
            registry,
            owned: Mutex::new(HashSet::new()),
        })
    }

    /// Main loop: adopt surviving assignments from the store, then follow
    /// bind events.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.adopt_existing().await;
        let mut events = self.bus.subscribe();
        loop {
            tokio::select! {
                received = events.recv() => {
                    match received {
                        Ok(Event::AssignmentBound { assignment_id, .. }) => {
                            self.spawn_driver(assignment_id);
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                            self.adopt_existing().await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Pick up live assignments after a restart (or a lagged event stream).
    async fn adopt_existing(self: &Arc<Self>) {
        for state in [AssignmentState::Assigned, AssignmentState::Running] {
            match self.store.assignments_in_state(state).await {
                Ok(assignments) => {
                    for assignment in assignments {
                        self.spawn_driver(assignment.id);
                    }
                }
                Err(e) => warn!(error = %e, "could not adopt assignments"),
            }
        }
    }

    fn spawn_driver(self: &Arc<Self>, assignment_id: i64) {
        {
            let mut owned = self.owned.lock().expect("ownership set poisoned");
            if !owned.insert(assignment_id) {
                return;
            }
        }
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = dispatcher.drive(assignment_id).await {
                warn!(assignment = assignment_id, error = %e, "assignment driver failed");
            }
            dispatcher
                .owned
                .lock()
                .expect("ownership set poisoned")
                .remove(&assignment_id);
        });
    }

    /// Drive one assignment from `assigned` to a terminal state.
    async fn drive(self: &Arc<Self>, assignment_id: i64) -> Result<()> {
        let assignment = self.store.get_assignment(assignment_id).await?;
        if !assignment.state.is_live() {
            return Ok(());
        }
        let job = self.store.get_job(assignment.job_id).await?;
        let instance = self.store.get_instance(assignment.instance_id).await?;

        let lifecycle = self.config.snapshot().lifecycle.clone();
        let connect_deadline = Duration::from_secs(lifecycle.dispatch_timeout_secs.max(1) as u64);

        let ws = match tokio::time::timeout(connect_deadline, self.connect(&instance)).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                warn!(assignment = assignment_id, error = %e, "worker unreachable");
                return self.abort_dispatch(&assignment, &job, &instance).await;
            }
            Err(_) => {
                warn!(assignment = assignment_id, "worker connect timed out");
                return self.abort_dispatch(&assignment, &job, &instance).await;
            }
        };

        let outcome = self.converse(ws, &assignment, &job, &instance).await?;
        self.settle(&assignment, &job, &instance, outcome).await
    }

    /// Open the control channel, bootstrap token in the auth header.
    async fn connect(&self, instance: &Instance) -> Result<WsStream> {
        let address = instance
            .address
            .as_ref()
            .ok_or_else(|| OrchestratorError::Protocol("instance has no address".to_string()))?;
        let url = format!("ws://{address}/control");
        let header = format!("Bearer {}", instance.bootstrap_token);
        let policy = crate::retry::ExponentialBackoffPolicy::default_policy();
        let ws = policy
            .execute(|| async {
                let mut request = url
                    .clone()
                    .into_client_request()
                    .map_err(|e| OrchestratorError::Protocol(format!("bad worker url: {e}")))?;
                request.headers_mut().insert(
                    "Authorization",
                    HeaderValue::from_str(&header).map_err(|e| {
                        OrchestratorError::Protocol(format!("bad token header: {e}"))
                    })?,
                );
                let (ws, _) = connect_async(request).await.map_err(|e| {
                    OrchestratorError::Provider {
                        provider: "worker".to_string(),
                        message: e.to_string(),
                        retryable: true,
                        source: None,
                    }
                })?;
                Ok(ws)
            })
            .await?;
        Ok(ws)
    }

    /// The conversation: start the job, then pump worker frames until a
    /// terminal event, heartbeat silence, or cancellation.
    async fn converse(
        &self,
        mut ws: WsStream,
        assignment: &Assignment,
        job: &Job,
        instance: &Instance,
    ) -> Result<Outcome> {
        let config = self.config.snapshot();
        let start = ServerMessage::Start {
            job: WorkerJobSpec::from_job(job),
            result_upload_uri: format!("{}/{}", config.server.results_uri_prefix, job.id),
        };
        ws.send(Message::Text(serde_json::to_string(&start)?))
            .await
            .map_err(|e| OrchestratorError::Protocol(format!("start send: {e}")))?;

        // assignment first, then job: a job may only be `running` while its
        // assignment and instance already are. Conflicts here mean this is a
        // re-adopted assignment that already ran through these transitions.
        match self
            .store
            .transition_assignment(assignment.id, AssignmentState::Assigned, AssignmentState::Running)
            .await
        {
            Ok(_) | Err(OrchestratorError::Conflict { .. }) => {}
            Err(e) => return Err(e),
        }
        match self
            .store
            .transition_job(
                job.id,
                JobState::Pending,
                JobState::Running,
                TransitionDetails::note("worker accepted start"),
            )
            .await
        {
            Ok(_) => self.bus.publish(Event::JobTransitioned {
                job_id: job.id,
                from: JobState::Pending,
                to: JobState::Running,
            }),
            Err(OrchestratorError::Conflict { .. }) => {
                let current = self.store.get_job(job.id).await?;
                if current.state != JobState::Running {
                    // cancelled under us between bind and start
                    let _ = ws
                        .send(Message::Text(serde_json::to_string(&ServerMessage::Cancel)?))
                        .await;
                    debug!(job = %job.id, state = current.state.as_str(), "job moved before start");
                    return Ok(Outcome::Cancelled);
                }
            }
            Err(e) => return Err(e),
        }

        let heartbeat_limit = Duration::from_secs(config.lifecycle.heartbeat_threshold_secs.max(1) as u64);
        let cancel_grace = Duration::from_secs(config.lifecycle.cancel_grace_secs.max(1));
        let mut events = self.bus.subscribe();
        let mut cancelling = false;
        let mut cancel_deadline = tokio::time::Instant::now();
        // deadline advances only on worker frames, so a noisy event bus
        // cannot mask a silent worker
        let mut frame_deadline = tokio::time::Instant::now() + heartbeat_limit;

        loop {
            tokio::select! {
                frame = ws.next() => {
                    frame_deadline = tokio::time::Instant::now() + heartbeat_limit;
                    let Some(frame) = frame else {
                        return Ok(if cancelling { Outcome::Cancelled } else { Outcome::LostWorker });
                    };
                    let frame = match frame {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(assignment = assignment.id, error = %e, "control channel error");
                            return Ok(if cancelling { Outcome::Cancelled } else { Outcome::LostWorker });
                        }
                    };
                    match frame {
                        Message::Text(text) => {
                            match serde_json::from_str::<WorkerMessage>(&text) {
                                Ok(message) => {
                                    if let Some(outcome) = self
                                        .on_worker_message(message, job, instance, cancelling)
                                        .await
                                    {
                                        return Ok(outcome);
                                    }
                                }
                                Err(e) => {
                                    warn!(assignment = assignment.id, error = %e, "malformed worker frame");
                                    return Ok(Outcome::Failed {
                                        class: ErrorClass::Protocol,
                                        message: format!("malformed worker frame: {e}"),
                                    });
                                }
                            }
                        }
                        Message::Close(_) => {
                            return Ok(if cancelling { Outcome::Cancelled } else { Outcome::LostWorker });
                        }
                        Message::Ping(payload) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        _ => {}
                    }
                }
                _ = tokio::time::sleep_until(frame_deadline) => {
                    if cancelling {
                        return Ok(Outcome::Cancelled);
                    }
                    warn!(assignment = assignment.id, "heartbeat silence past threshold");
                    return Ok(Outcome::LostWorker);
                }
                _ = tokio::time::sleep_until(cancel_deadline), if cancelling => {
                    // worker never acknowledged the cancel
                    return Ok(Outcome::Cancelled);
                }
                received = events.recv() => {
                    if let Ok(Event::JobCancelRequested { job_id }) = received {
                        if job_id == job.id && !cancelling {
                            info!(job = %job.id, "forwarding cancel to worker");
                            let _ = ws
                                .send(Message::Text(serde_json::to_string(&ServerMessage::Cancel)?))
                                .await;
                            cancelling = true;
                            cancel_deadline = tokio::time::Instant::now() + cancel_grace;
                        }
                    }
                }
            }
        }
    }

    /// Handle one worker frame; `Some(outcome)` ends the conversation.
    async fn on_worker_message(
        &self,
        message: WorkerMessage,
        job: &Job,
        instance: &Instance,
        cancelling: bool,
    ) -> Option<Outcome> {
        match message {
            WorkerMessage::Progress { pct, message } => {
                self.bus.publish(Event::JobProgress {
                    job_id: job.id,
                    pct,
                    message,
                });
                let _ = self.store.record_heartbeat(instance.id).await;
                None
            }
            WorkerMessage::Heartbeat => {
                let _ = self.store.record_heartbeat(instance.id).await;
                None
            }
            WorkerMessage::Completed { result_ref } => {
                if cancelling {
                    // completed during the grace period still counts
                    debug!(job = %job.id, "worker finished while cancelling");
                }
                Some(Outcome::Completed { result_ref })
            }
            WorkerMessage::Failed { class, message } => Some(Outcome::Failed {
                class: match class {
                    WorkerFailureClass::Retryable => ErrorClass::Retryable,
                    WorkerFailureClass::Permanent => ErrorClass::Permanent,
                },
                message,
            }),
        }
    }

    /// Apply a terminal outcome to the assignment, job, and instance, and
    /// spawn a retry when the class and budget allow.
    async fn settle(
        &self,
        assignment: &Assignment,
        job: &Job,
        instance: &Instance,
        outcome: Outcome,
    ) -> Result<()> {
        let final_cost = self.assignment_cost(assignment, instance).await;
        match outcome {
            Outcome::Completed { result_ref } => {
                self.store
                    .transition_assignment(assignment.id, AssignmentState::Running, AssignmentState::Completed)
                    .await?;
                self.store
                    .transition_job(
                        job.id,
                        JobState::Running,
                        JobState::Completed,
                        TransitionDetails {
                            result_ref: Some(result_ref),
                            final_cost_cents: Some(final_cost),
                            note: Some("worker completed".to_string()),
                            ..Default::default()
                        },
                    )
                    .await?;
                metrics::counter!("aimad_jobs_completed_total").increment(1);
                self.release_instance(instance).await;
            }
            Outcome::Failed { class, message } => {
                // worker-reported failures fail the assignment; a protocol
                // violation aborts it
                let target = if class == ErrorClass::Protocol {
                    AssignmentState::Aborted
                } else {
                    AssignmentState::Failed
                };
                self.store
                    .transition_assignment(assignment.id, AssignmentState::Running, target)
                    .await?;
                let failed = self
                    .store
                    .transition_job(
                        job.id,
                        JobState::Running,
                        JobState::Failed,
                        TransitionDetails {
                            final_cost_cents: Some(final_cost),
                            ..TransitionDetails::failure(class, message)
                        },
                    )
                    .await?;
                metrics::counter!("aimad_jobs_failed_total").increment(1);
                self.maybe_retry(&failed).await;
                self.release_instance(instance).await;
            }
            Outcome::LostWorker => {
                self.store
                    .transition_assignment(assignment.id, AssignmentState::Running, AssignmentState::Aborted)
                    .await?;
                let failed = self
                    .store
                    .transition_job(
                        job.id,
                        JobState::Running,
                        JobState::Failed,
                        TransitionDetails {
                            final_cost_cents: Some(final_cost),
                            ..TransitionDetails::failure(
                                ErrorClass::LostWorker,
                                "control channel silent past heartbeat threshold",
                            )
                        },
                    )
                    .await?;
                metrics::counter!("aimad_workers_lost_total").increment(1);
                self.maybe_retry(&failed).await;
                self.condemn_instance(instance).await;
            }
            Outcome::Cancelled => {
                self.store
                    .transition_assignment(assignment.id, AssignmentState::Running, AssignmentState::Aborted)
                    .await?;
                match self
                    .store
                    .transition_job(
                        job.id,
                        JobState::Running,
                        JobState::Cancelled,
                        TransitionDetails {
                            final_cost_cents: Some(final_cost),
                            note: Some("cancelled by user".to_string()),
                            ..Default::default()
                        },
                    )
                    .await
                {
                    // the job may already be cancelled if it moved before start
                    Ok(_) | Err(OrchestratorError::Conflict { .. }) => {}
                    Err(e) => return Err(e),
                }
                // the instance did nothing wrong; give it back to the pool
                self.release_instance(instance).await;
            }
        }
        Ok(())
    }

    /// A dispatch that never reached the worker: abort the assignment, fail
    /// the job, drain the instance defensively.
    async fn abort_dispatch(
        &self,
        assignment: &Assignment,
        job: &Job,
        instance: &Instance,
    ) -> Result<()> {
        self.store
            .transition_assignment(assignment.id, AssignmentState::Assigned, AssignmentState::Aborted)
            .await?;
        let failed = self
            .store
            .transition_job(
                job.id,
                JobState::Pending,
                JobState::Failed,
                TransitionDetails::failure(
                    ErrorClass::DispatchTimeout,
                    "worker not reachable within dispatch timeout",
                ),
            )
            .await?;
        self.maybe_retry(&failed).await;
        let _ = self
            .store
            .transition_instance(
                instance.id,
                InstanceState::Running,
                InstanceState::Draining,
                Default::default(),
            )
            .await;
        Ok(())
    }

    async fn maybe_retry(&self, failed: &Job) {
        let retryable = failed
            .error_class
            .map(|class| class.is_retryable())
            .unwrap_or(false);
        if !retryable || failed.retries_left() == 0 {
            return;
        }
        match self.store.spawn_retry(failed).await {
            Ok(retry) => {
                info!(job = %failed.id, retry = %retry.id, attempt = retry.retry_count, "retry enqueued");
                self.bus.publish(Event::JobSubmitted { job_id: retry.id });
            }
            Err(e) => warn!(job = %failed.id, error = %e, "could not enqueue retry"),
        }
    }

    /// Keep the ledger current and report the instance idle.
    async fn release_instance(&self, instance: &Instance) {
        if let Err(e) = self.cost.accrue_one(instance.id).await {
            warn!(instance = %instance.id, error = %e, "post-job accrual failed");
        }
        let _ = self.store.mark_idle(instance.id).await;
        self.bus.publish(Event::InstanceIdle {
            instance_id: instance.id,
        });
    }

    /// A lost worker means the instance is suspect: error it and terminate
    /// at the provider.
    async fn condemn_instance(&self, instance: &Instance) {
        if let Err(e) = self.cost.final_accrual(instance.id).await {
            warn!(instance = %instance.id, error = %e, "final accrual failed");
        }
        let _ = self
            .store
            .transition_instance(
                instance.id,
                InstanceState::Running,
                InstanceState::Error,
                Default::default(),
            )
            .await;
        if let (Some(handle), Some(provider_id)) = (
            self.registry.get(instance.provider),
            instance.provider_instance_id.as_ref(),
        ) {
            if let Err(e) = handle.terminate_instance(provider_id).await {
                warn!(instance = %instance.id, error = %e, "terminate of condemned instance failed");
            }
        }
        self.bus.publish(Event::InstanceFailed {
            instance_id: instance.id,
            provider: instance.provider,
        });
    }

    /// Cost of this assignment's slice of instance time.
    async fn assignment_cost(&self, assignment: &Assignment, instance: &Instance) -> i64 {
        let assignment = self
            .store
            .get_assignment(assignment.id)
            .await
            .unwrap_or_else(|_| assignment.clone());
        let start = assignment.started_at.unwrap_or(assignment.assigned_at);
        accrued_cents(instance.hourly_rate_cents, start, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_messages_round_trip() {
        let completed: WorkerMessage =
            serde_json::from_str(r#"{"type": "completed", "result_ref": "s3://r/1"}"#).unwrap();
        assert!(matches!(completed, WorkerMessage::Completed { .. }));

        let failed: WorkerMessage = serde_json::from_str(
            r#"{"type": "failed", "class": "retryable", "message": "oom"}"#,
        )
        .unwrap();
        match failed {
            WorkerMessage::Failed { class, .. } => assert_eq!(class, WorkerFailureClass::Retryable),
            other => panic!("unexpected: {other:?}"),
        }

        let start = ServerMessage::Start {
            job: WorkerJobSpec {
                id: JobId::generate(),
                kind: "inference".to_string(),
                image: "img".to_string(),
                env: HashMap::new(),
                inputs: vec![],
            },
            result_upload_uri: "s3://aima-results/x".to_string(),
        };
        let encoded = serde_json::to_string(&start).unwrap();
        assert!(encoded.contains(r#""type":"start""#));
    }

    #[test]
    fn malformed_worker_frame_is_rejected() {
        assert!(serde_json::from_str::<WorkerMessage>(r#"{"type": "bogus"}"#).is_err());
        assert!(serde_json::from_str::<WorkerMessage>("not json").is_err());
    }
}
