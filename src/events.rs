//! Internal event bus
//!
//! A lossy in-process publish/subscribe channel between components, built on
//! `tokio::sync::broadcast`. Events are wake-up hints, not state: every
//! consumer re-reads authoritative rows from the store when it wakes, so a
//! lagged receiver that drops events only costs latency until the next
//! periodic tick.

use crate::types::{InstanceId, JobId, JobState, ProviderTag};
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum Event {
    JobSubmitted {
        job_id: JobId,
    },
    JobTransitioned {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },
    /// User asked for cancellation; the owning dispatcher reacts.
    JobCancelRequested {
        job_id: JobId,
    },
    JobProgress {
        job_id: JobId,
        pct: f32,
        message: Option<String>,
    },
    InstanceReady {
        instance_id: InstanceId,
        provider: ProviderTag,
    },
    InstanceFailed {
        instance_id: InstanceId,
        provider: ProviderTag,
    },
    /// An assignment reached a terminal state and the instance can take new
    /// work (or drain).
    InstanceIdle {
        instance_id: InstanceId,
    },
    AssignmentBound {
        assignment_id: i64,
        job_id: JobId,
        instance_id: InstanceId,
    },
}

/// Cloneable handle to the shared broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Publish an event. Send errors (no subscribers yet) are ignored; the
    /// bus is best-effort by design.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let job_id = JobId::generate();
        bus.publish(Event::JobSubmitted { job_id });

        match rx.recv().await.unwrap() {
            Event::JobSubmitted { job_id: got } => assert_eq!(got, job_id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::InstanceIdle {
            instance_id: InstanceId::generate(),
        });
    }
}
