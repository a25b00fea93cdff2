//! Lifecycle events and the bus that hands them to an external sink.

use std::{
    fmt::{self, Display},
    panic::AssertUnwindSafe,
    sync::Arc,
};

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use mailq_common::internal;
use mailq_store::{ItemStatus, QueueItem, QueueItemId};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    QueueStarted,
    QueueStopped,
    MessageSent,
    MessageDeferred,
    MessageDeadLetter,
    WorkerError,
}

impl EventType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::QueueStarted => "queue_started",
            Self::QueueStopped => "queue_stopped",
            Self::MessageSent => "message_sent",
            Self::MessageDeferred => "message_deferred",
            Self::MessageDeadLetter => "message_dead_letter",
            Self::WorkerError => "worker_error",
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened to the queue or to one of its items.
///
/// Immutable once built; the bus hands sinks a shared reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub queue_item_id: Option<QueueItemId>,
    /// The item's payload reference
    pub message_id: Option<String>,
    /// The item's reported status after the transition
    pub status: Option<ItemStatus>,
    pub error: Option<String>,
    pub metadata: Option<AHashMap<String, String>>,
}

impl Event {
    #[must_use]
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            queue_item_id: None,
            message_id: None,
            status: None,
            error: None,
            metadata: None,
        }
    }

    /// An event about `item`, which must already reflect the transition.
    #[must_use]
    pub fn for_item(event_type: EventType, item: &QueueItem) -> Self {
        Self {
            queue_item_id: Some(item.id),
            message_id: Some(item.payload_ref.to_string()),
            status: Some(item.reported_status()),
            ..Self::new(event_type)
        }
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Display) -> Self {
        self.error = Some(error.to_string());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Display) -> Self {
        self.metadata
            .get_or_insert_with(AHashMap::new)
            .insert(key.into(), value.to_string());
        self
    }
}

/// Receiver of queue events.
///
/// Called synchronously on the emitting task, so implementations should be
/// quick. Errors and panics are logged by the bus and otherwise ignored.
pub trait EventSink: Send + Sync {
    /// # Errors
    /// Any failure; it is logged and does not affect delivery
    fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Sink that writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn handle(&self, event: &Event) -> anyhow::Result<()> {
        match (&event.queue_item_id, &event.error) {
            (Some(id), Some(error)) => {
                internal!(level = INFO, "[{}] {id}: {error}", event.event_type);
            }
            (Some(id), None) => internal!(level = INFO, "[{}] {id}", event.event_type),
            (None, Some(error)) => internal!(level = INFO, "[{}] {error}", event.event_type),
            (None, None) => internal!(level = INFO, "[{}]", event.event_type),
        }

        Ok(())
    }
}

/// Best-effort, synchronous fan-out to at most one [`EventSink`].
///
/// A disabled bus never builds the event at all.
#[derive(Clone, Default)]
pub struct EventBus {
    sink: Option<Arc<dyn EventSink>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl EventBus {
    /// A bus delivering to `sink` when `enabled` is set, otherwise a no-op.
    #[must_use]
    pub fn new(sink: Option<Arc<dyn EventSink>>, enabled: bool) -> Self {
        Self {
            sink: sink.filter(|_| enabled),
        }
    }

    #[must_use]
    pub const fn disabled() -> Self {
        Self { sink: None }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Build an event with `build` and deliver it, if anything is listening.
    pub fn emit_with(&self, build: impl FnOnce() -> Event) {
        let Some(sink) = &self.sink else {
            return;
        };

        let event = build();
        match std::panic::catch_unwind(AssertUnwindSafe(|| sink.handle(&event))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                internal!(
                    level = WARN,
                    "Event sink failed to handle {}: {err:#}",
                    event.event_type
                );
            }
            Err(_) => {
                internal!(
                    level = ERROR,
                    "Event sink panicked while handling {}",
                    event.event_type
                );
            }
        }
    }

    pub fn emit(&self, event: Event) {
        self.emit_with(|| event);
    }
}
