//! In-process event bus: fans out orchestration events to subscribers (a
//! live `gator watch` TUI, the built-in persistence subscriber) without
//! coupling publishers to any particular consumer.
//!
//! One bounded `tokio::sync::broadcast` channel per topic, sized the same
//! way the orchestrator sizes its own `LifecycleDone` channel: a small
//! constant multiple of expected throughput, not unbounded. A subscriber
//! that falls behind has its oldest pending events dropped rather than
//! stalling the publisher or closing the channel; [`Subscription::recv`]
//! surfaces that as a one-time warning per lag episode, not a message loss
//! it hides.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::broadcast;
use uuid::Uuid;

use gator_db::queries::event_log;

/// Per-topic channel capacity. Each topic gets its own channel, so this
/// bounds how far a single slow subscriber can lag on one topic before
/// events start dropping for it.
const CHANNEL_CAPACITY: usize = 256;

/// The topics publishers emit on and subscribers listen to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    TaskUpdated,
    AgentStarted,
    AgentOutput,
    AgentCompleted,
    MergeStarted,
    MergeCompleted,
    HilRequest,
    ExecuteStatus,
}

impl Topic {
    /// Every topic, in a fixed order -- used to pre-register one channel
    /// per topic and to fan a persistence subscriber out across all of them.
    pub const ALL: [Topic; 8] = [
        Topic::TaskUpdated,
        Topic::AgentStarted,
        Topic::AgentOutput,
        Topic::AgentCompleted,
        Topic::MergeStarted,
        Topic::MergeCompleted,
        Topic::HilRequest,
        Topic::ExecuteStatus,
    ];

    /// The string stored in `event_log.event_type`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::TaskUpdated => "task.updated",
            Topic::AgentStarted => "agent.started",
            Topic::AgentOutput => "agent.output",
            Topic::AgentCompleted => "agent.completed",
            Topic::MergeStarted => "merge.started",
            Topic::MergeCompleted => "merge.completed",
            Topic::HilRequest => "hil.request",
            Topic::ExecuteStatus => "execute.status",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event published to the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub topic: Topic,
    pub plan_id: Uuid,
    pub task_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    pub fn new(topic: Topic, plan_id: Uuid, task_id: Option<Uuid>, payload: serde_json::Value) -> Self {
        Self {
            topic,
            plan_id,
            task_id,
            payload,
            occurred_at: Utc::now(),
        }
    }
}

/// A bounded, per-topic publish/subscribe fabric. Cheap to clone -- clones
/// share the same underlying channels.
#[derive(Clone)]
pub struct EventBus {
    channels: Arc<HashMap<Topic, broadcast::Sender<Event>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let channels = Topic::ALL
            .into_iter()
            .map(|topic| (topic, broadcast::channel(capacity).0))
            .collect();
        Self {
            channels: Arc::new(channels),
        }
    }

    /// Publish an event. A no-op (not an error) if nobody is currently
    /// subscribed to its topic.
    pub fn publish(&self, event: Event) {
        if let Some(tx) = self.channels.get(&event.topic) {
            let _ = tx.send(event);
        }
    }

    /// Subscribe to a single topic.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let rx = self
            .channels
            .get(&topic)
            .expect("every Topic variant has a registered channel")
            .subscribe();
        Subscription {
            topic,
            rx,
            dropped: 0,
            warned: false,
        }
    }

    /// Subscribe to every topic at once, e.g. for the persistence subscriber
    /// or a `gator watch` TUI that shows the whole timeline.
    pub fn subscribe_all(&self) -> Vec<Subscription> {
        Topic::ALL.into_iter().map(|t| self.subscribe(t)).collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A single subscriber's view of one topic's channel.
pub struct Subscription {
    topic: Topic,
    rx: broadcast::Receiver<Event>,
    dropped: u64,
    warned: bool,
}

impl Subscription {
    /// Wait for the next event, transparently skipping over lag. Returns
    /// `None` once the bus itself has been dropped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    if !self.warned {
                        tracing::warn!(
                            topic = %self.topic,
                            dropped = self.dropped,
                            "event subscriber fell behind, oldest pending events dropped"
                        );
                        self.warned = true;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Total events dropped for this subscriber since the last reset.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Reset the drop counter and re-arm the one-warning-per-episode log.
    pub fn reset_drop_counter(&mut self) {
        self.dropped = 0;
        self.warned = false;
    }
}

/// Spawn the built-in subscriber that persists every event to the
/// event-log table, per §3.7 -- this is how `report`/`log` reconstruct
/// history without re-deriving it from task state. Returns the join handles
/// so callers can await a clean shutdown; dropping the `EventBus` (all
/// senders) ends each task's loop.
pub fn spawn_persistence_subscriber(bus: &EventBus, pool: PgPool) -> Vec<tokio::task::JoinHandle<()>> {
    bus.subscribe_all()
        .into_iter()
        .map(|mut sub| {
            let pool = pool.clone();
            tokio::spawn(async move {
                while let Some(event) = sub.recv().await {
                    if let Err(e) = event_log::append_event(
                        &pool,
                        event.plan_id,
                        event.task_id,
                        event.topic.as_str(),
                        &event.payload,
                    )
                    .await
                    {
                        tracing::warn!(
                            topic = %event.topic,
                            error = %e,
                            "failed to persist event (non-fatal)"
                        );
                    }
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(Topic::TaskUpdated);

        let plan_id = Uuid::new_v4();
        bus.publish(Event::new(Topic::TaskUpdated, plan_id, None, json!({"status": "passed"})));

        let event = sub.recv().await.expect("event delivered");
        assert_eq!(event.topic, Topic::TaskUpdated);
        assert_eq!(event.plan_id, plan_id);
    }

    #[tokio::test]
    async fn subscriber_only_sees_its_own_topic() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(Topic::MergeStarted);

        bus.publish(Event::new(Topic::TaskUpdated, Uuid::new_v4(), None, json!({})));
        bus.publish(Event::new(Topic::MergeStarted, Uuid::new_v4(), None, json!({"branch": "x"})));

        let event = sub.recv().await.expect("event delivered");
        assert_eq!(event.topic, Topic::MergeStarted);
    }

    #[tokio::test]
    async fn lagging_subscriber_drops_oldest_and_warns_once() {
        let bus = EventBus::with_capacity(2);
        let mut sub = bus.subscribe(Topic::AgentOutput);

        for i in 0..5 {
            bus.publish(Event::new(
                Topic::AgentOutput,
                Uuid::new_v4(),
                None,
                json!({ "i": i }),
            ));
        }

        // Channel capacity 2 but 5 sent before the first recv: the oldest 3
        // are dropped, and recv() resumes from the oldest surviving event.
        let event = sub.recv().await.expect("event delivered despite lag");
        assert_eq!(event.payload["i"], json!(3));
        assert_eq!(sub.dropped_count(), 3);
    }

    #[test]
    fn topic_as_str_matches_event_log_convention() {
        assert_eq!(Topic::TaskUpdated.as_str(), "task.updated");
        assert_eq!(Topic::HilRequest.as_str(), "hil.request");
    }
}
