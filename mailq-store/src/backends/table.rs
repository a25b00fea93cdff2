use std::time::Duration;

use ahash::AHashMap;
use chrono::{DateTime, TimeDelta, Utc};

use crate::{ItemStatus, QueueItem, QueueItemId, StoreError};

/// The item index shared by the backends
///
/// Transitions are staged on a copy and committed separately, so a backend
/// that has to persist the change first can leave the index untouched if the
/// write fails.
#[derive(Debug, Default)]
pub(crate) struct ItemTable {
    items: AHashMap<QueueItemId, QueueItem>,
}

pub(crate) fn lease_timeout(timeout: Duration) -> TimeDelta {
    TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX)
}

impl ItemTable {
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn get(&self, id: &QueueItemId) -> Option<&QueueItem> {
        self.items.get(id)
    }

    pub(crate) fn commit(&mut self, item: QueueItem) {
        self.items.insert(item.id, item);
    }

    /// Apply `transition` to a copy of the item.
    pub(crate) fn stage<F>(&self, id: &QueueItemId, transition: F) -> Result<QueueItem, StoreError>
    where
        F: FnOnce(&mut QueueItem) -> Result<(), StoreError>,
    {
        let mut item = self.items.get(id).cloned().ok_or(StoreError::NotFound(*id))?;
        transition(&mut item)?;
        Ok(item)
    }

    /// IDs of due items, oldest-ready first.
    pub(crate) fn due(&self, now: DateTime<Utc>, limit: usize) -> Vec<QueueItemId> {
        let mut due: Vec<_> = self
            .items
            .values()
            .filter(|item| item.is_due(now))
            .map(QueueItem::readiness_key)
            .collect();

        due.sort_unstable();
        due.into_iter().take(limit).map(|(_, _, id)| id).collect()
    }

    /// IDs of in-flight items whose lease has run past `timeout`.
    pub(crate) fn stale(&self, now: DateTime<Utc>, timeout: TimeDelta) -> Vec<QueueItemId> {
        self.items
            .values()
            .filter(|item| item.lease_expired(now, timeout))
            .map(|item| item.id)
            .collect()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.items
            .values()
            .filter(|item| item.status.is_in_flight())
            .count()
    }

    pub(crate) fn list(&self, status: Option<ItemStatus>) -> Vec<QueueItem> {
        let mut items: Vec<_> = self
            .items
            .values()
            .filter(|item| status.is_none_or(|status| item.reported_status() == status))
            .cloned()
            .collect();

        items.sort_unstable_by_key(|item| (item.created_at, item.id));
        items
    }
}
