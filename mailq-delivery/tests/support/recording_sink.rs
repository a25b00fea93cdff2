//! Event sinks for asserting on emitted events

use std::sync::atomic::{AtomicUsize, Ordering};

use mailq_delivery::{Event, EventSink, EventType, QueueItemId};
use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn types(&self) -> Vec<EventType> {
        self.events.lock().iter().map(|e| e.event_type).collect()
    }

    /// Event types concerning one item, in emission order
    pub fn types_for(&self, id: &QueueItemId) -> Vec<EventType> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.queue_item_id.as_ref() == Some(id))
            .map(|e| e.event_type)
            .collect()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

impl EventSink for RecordingSink {
    fn handle(&self, event: &Event) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Sink that fails every call, alternating between an error and a panic
#[derive(Debug, Default)]
pub struct BrokenSink {
    calls: AtomicUsize,
}

impl BrokenSink {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EventSink for BrokenSink {
    fn handle(&self, event: &Event) -> anyhow::Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            anyhow::bail!("sink rejected {}", event.event_type);
        }
        panic!("sink crashed on {}", event.event_type);
    }
}
