//! Queue items and the state transitions every backend applies to them
//!
//! Backends decide *where* items live and how a claim is made atomic; the
//! rules for *what* a transition does live here so that every backend
//! enforces the same lease and terminal-state checks.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{ItemStatus, Lease, PayloadRef, QueueItemId, StoreError};

/// A message waiting for (or done with) delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub payload_ref: PayloadRef,
    pub status: ItemStatus,
    /// Completed delivery attempts
    pub attempt_count: u32,
    pub max_retries: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// What a producer hands the store when enqueueing
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub payload_ref: PayloadRef,
    pub max_retries: u32,
    /// Earliest delivery time; `None` means immediately
    pub not_before: Option<DateTime<Utc>>,
}

impl NewQueueItem {
    pub fn new(payload_ref: impl Into<PayloadRef>, max_retries: u32) -> Self {
        Self {
            payload_ref: payload_ref.into(),
            max_retries,
            not_before: None,
        }
    }

    #[must_use]
    pub const fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    pub(crate) fn into_item(self, now: DateTime<Utc>) -> QueueItem {
        QueueItem {
            id: QueueItemId::generate(),
            payload_ref: self.payload_ref,
            status: ItemStatus::Pending,
            attempt_count: 0,
            max_retries: self.max_retries,
            next_attempt_at: self.not_before.unwrap_or(now),
            last_error: None,
            claimed_by: None,
            claimed_at: None,
            created_at: now,
        }
    }
}

impl QueueItem {
    /// Eligible for `fetch_due` at `now`
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ItemStatus::Pending && self.next_attempt_at <= now
    }

    /// The lease currently held on this item, if any
    #[must_use]
    pub fn lease(&self) -> Option<Lease> {
        match (&self.claimed_by, self.claimed_at) {
            (Some(owner), Some(claimed_at)) => Some(Lease {
                owner: owner.clone(),
                claimed_at,
            }),
            _ => None,
        }
    }

    /// Status as shown to operators and events: a pending item that has
    /// already failed at least once is reported as `Deferred`.
    #[must_use]
    pub const fn reported_status(&self) -> ItemStatus {
        match self.status {
            ItemStatus::Pending if self.attempt_count > 0 => ItemStatus::Deferred,
            status => status,
        }
    }

    /// Ordering key for `fetch_due`: oldest-ready first, FIFO tie-break.
    pub(crate) fn readiness_key(&self) -> (DateTime<Utc>, DateTime<Utc>, QueueItemId) {
        (self.next_attempt_at, self.created_at, self.id)
    }

    fn ensure_leased_by(&self, lease: &Lease) -> Result<(), StoreError> {
        if self.status.is_terminal() {
            return Err(StoreError::Terminal {
                id: self.id,
                status: self.status,
            });
        }

        let held = self.status.is_in_flight()
            && self.claimed_by.as_deref() == Some(lease.owner.as_str())
            && self.claimed_at == Some(lease.claimed_at);

        if held {
            Ok(())
        } else {
            Err(StoreError::LeaseLost(self.id))
        }
    }

    fn clear_lease(&mut self) {
        self.claimed_by = None;
        self.claimed_at = None;
    }

    pub(crate) fn claim(&mut self, owner: &str, now: DateTime<Utc>) {
        self.status = ItemStatus::Claimed;
        self.claimed_by = Some(owner.to_owned());
        self.claimed_at = Some(now);
    }

    pub(crate) fn begin_sending(&mut self, lease: &Lease) -> Result<(), StoreError> {
        self.ensure_leased_by(lease)?;
        if self.status != ItemStatus::Claimed {
            return Err(StoreError::InvalidTransition {
                id: self.id,
                status: self.status,
                operation: "begin sending",
            });
        }

        self.status = ItemStatus::Sending;
        Ok(())
    }

    /// Returns `false` when the item was already sent and nothing changed.
    pub(crate) fn complete(&mut self, lease: &Lease) -> Result<bool, StoreError> {
        if self.status == ItemStatus::Sent {
            return Ok(false);
        }

        self.ensure_leased_by(lease)?;
        self.status = ItemStatus::Sent;
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.clear_lease();
        Ok(true)
    }

    pub(crate) fn defer(
        &mut self,
        lease: &Lease,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        self.ensure_leased_by(lease)?;
        self.status = ItemStatus::Pending;
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.next_attempt_at = self.next_attempt_at.max(next_attempt_at);
        self.last_error = Some(error.to_owned());
        self.clear_lease();
        Ok(())
    }

    pub(crate) fn dead_letter(&mut self, lease: &Lease, error: &str) -> Result<(), StoreError> {
        self.ensure_leased_by(lease)?;
        self.status = ItemStatus::DeadLetter;
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_error = Some(error.to_owned());
        self.clear_lease();
        Ok(())
    }

    pub(crate) fn lease_expired(&self, now: DateTime<Utc>, lease_timeout: TimeDelta) -> bool {
        self.status.is_in_flight()
            && self
                .claimed_at
                .is_none_or(|claimed_at| now.signed_duration_since(claimed_at) >= lease_timeout)
    }

    /// Return an expired lease to `pending`. The in-flight attempt has an
    /// unknown outcome, so it is not counted.
    pub(crate) fn release_if_stale(&mut self, now: DateTime<Utc>, lease_timeout: TimeDelta) -> bool {
        let stale = self.lease_expired(now, lease_timeout);

        if stale {
            self.status = ItemStatus::Pending;
            self.clear_lease();
        }

        stale
    }

    /// Operator requeue of a dead-lettered item. `last_error` is kept for audit.
    pub(crate) fn requeue(&mut self, now: DateTime<Utc>) -> Result<(), StoreError> {
        if self.status != ItemStatus::DeadLetter {
            return Err(StoreError::InvalidTransition {
                id: self.id,
                status: self.status,
                operation: "requeue",
            });
        }

        self.status = ItemStatus::Pending;
        self.attempt_count = 0;
        self.next_attempt_at = now;
        self.clear_lease();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn claimed(max_retries: u32) -> (QueueItem, Lease) {
        let now = Utc::now();
        let mut item = NewQueueItem::new("msg-1", max_retries).into_item(now);
        item.claim("worker-a", now);
        let lease = item.lease().unwrap();
        (item, lease)
    }

    #[test]
    fn test_new_item_defaults() {
        let now = Utc::now();
        let item = NewQueueItem::new("msg-1", 3).into_item(now);

        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.attempt_count, 0);
        assert_eq!(item.next_attempt_at, now);
        assert!(item.is_due(now));
        assert!(item.lease().is_none());
    }

    #[test]
    fn test_not_before_delays_eligibility() {
        let now = Utc::now();
        let later = now + TimeDelta::seconds(30);
        let item = NewQueueItem::new("msg-1", 3).not_before(later).into_item(now);

        assert!(!item.is_due(now));
        assert!(item.is_due(later));
    }

    #[test]
    fn test_complete_counts_attempt_and_is_idempotent() {
        let (mut item, lease) = claimed(3);
        item.begin_sending(&lease).unwrap();

        assert!(item.complete(&lease).unwrap());
        assert_eq!(item.status, ItemStatus::Sent);
        assert_eq!(item.attempt_count, 1);
        assert!(item.lease().is_none());

        assert!(!item.complete(&lease).unwrap());
        assert_eq!(item.attempt_count, 1);
    }

    #[test]
    fn test_defer_never_moves_next_attempt_backwards() {
        let (mut item, lease) = claimed(3);
        let far = Utc::now() + TimeDelta::hours(1);
        item.next_attempt_at = far;

        item.defer(&lease, Utc::now(), "421 busy").unwrap();

        assert_eq!(item.next_attempt_at, far);
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.reported_status(), ItemStatus::Deferred);
        assert_eq!(item.last_error.as_deref(), Some("421 busy"));
    }

    #[test]
    fn test_foreign_lease_is_rejected() {
        let (mut item, lease) = claimed(3);
        let other = Lease {
            owner: "worker-b".to_string(),
            claimed_at: lease.claimed_at,
        };

        assert!(matches!(
            item.defer(&other, Utc::now(), "x"),
            Err(StoreError::LeaseLost(_))
        ));
        assert_eq!(item.status, ItemStatus::Claimed);
    }

    #[test]
    fn test_terminal_items_reject_mutation() {
        let (mut item, lease) = claimed(0);
        item.dead_letter(&lease, "550 no such user").unwrap();

        assert!(matches!(
            item.defer(&lease, Utc::now(), "x"),
            Err(StoreError::Terminal { .. })
        ));
        assert!(matches!(
            item.dead_letter(&lease, "x"),
            Err(StoreError::Terminal { .. })
        ));
        assert_eq!(item.attempt_count, 1);
        assert_eq!(item.last_error.as_deref(), Some("550 no such user"));
    }

    #[test]
    fn test_release_if_stale_keeps_attempt_count() {
        let (mut item, _lease) = claimed(3);
        let claimed_at = item.claimed_at.unwrap();

        assert!(!item.release_if_stale(claimed_at, TimeDelta::seconds(60)));
        assert!(item.release_if_stale(claimed_at + TimeDelta::seconds(60), TimeDelta::seconds(60)));
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.attempt_count, 0);
        assert!(item.lease().is_none());
    }

    #[test]
    fn test_requeue_only_from_dead_letter() {
        let (mut item, lease) = claimed(0);
        assert!(item.requeue(Utc::now()).is_err());

        item.dead_letter(&lease, "550").unwrap();
        item.requeue(Utc::now()).unwrap();

        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.attempt_count, 0);
        assert_eq!(item.last_error.as_deref(), Some("550"));
    }
}
