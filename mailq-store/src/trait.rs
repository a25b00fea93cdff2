use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{ItemStatus, Lease, NewQueueItem, QueueItem, QueueItemId};

/// Durable storage for queue items
///
/// Implementations must make `fetch_due` an atomic claim: no two callers,
/// in this process or any other sharing the store, may walk away with the
/// same item. Every other mutation is gated on the caller presenting the
/// item's current [`Lease`].
#[async_trait]
pub trait QueueStore: Send + Sync + std::fmt::Debug {
    /// Add a new `pending` item.
    ///
    /// # Errors
    /// If the item cannot be persisted
    async fn enqueue(&self, item: NewQueueItem) -> crate::Result<QueueItem>;

    /// Claim up to `limit` due items for `owner`.
    ///
    /// Selects `pending` items with `next_attempt_at <= now` in ascending
    /// `next_attempt_at`, then `created_at`, order and moves them to
    /// `claimed` under a fresh lease.
    ///
    /// # Errors
    /// If the store cannot be read or the claims cannot be persisted
    async fn fetch_due(&self, limit: usize, owner: &str) -> crate::Result<Vec<QueueItem>>;

    /// `claimed -> sending`, immediately before the transport is invoked.
    ///
    /// # Errors
    /// `LeaseLost` if the lease no longer matches, or a store failure
    async fn mark_sending(&self, id: &QueueItemId, lease: &Lease) -> crate::Result<()>;

    /// `claimed|sending -> sent`. Succeeds without change if already `sent`.
    ///
    /// # Errors
    /// `LeaseLost`/`Terminal` for an item this lease no longer owns, or a store failure
    async fn mark_sent(&self, id: &QueueItemId, lease: &Lease) -> crate::Result<()>;

    /// Back to `pending` with a later `next_attempt_at` and one more attempt counted.
    ///
    /// # Errors
    /// `LeaseLost`/`Terminal` for an item this lease no longer owns, or a store failure
    async fn mark_deferred(
        &self,
        id: &QueueItemId,
        lease: &Lease,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> crate::Result<()>;

    /// Terminal failure.
    ///
    /// # Errors
    /// `LeaseLost`/`Terminal` for an item this lease no longer owns, or a store failure
    async fn mark_dead_letter(&self, id: &QueueItemId, lease: &Lease, error: &str)
    -> crate::Result<()>;

    /// Return every lease older than `lease_timeout` to `pending` without
    /// counting the interrupted attempt. Returns the reclaimed IDs.
    ///
    /// # Errors
    /// If the store cannot be read or updated
    async fn release_stale_claims(&self, lease_timeout: Duration) -> crate::Result<Vec<QueueItemId>>;

    /// Operator requeue of a `dead_letter` item.
    ///
    /// # Errors
    /// `InvalidTransition` if the item is not dead-lettered, or a store failure
    async fn requeue(&self, id: &QueueItemId) -> crate::Result<()>;

    /// # Errors
    /// If the store cannot be read
    async fn get(&self, id: &QueueItemId) -> crate::Result<Option<QueueItem>>;

    /// All items, optionally filtered by reported status, oldest first.
    ///
    /// # Errors
    /// If the store cannot be read
    async fn list(&self, status: Option<ItemStatus>) -> crate::Result<Vec<QueueItem>>;
}
