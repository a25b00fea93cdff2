use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::table::{ItemTable, lease_timeout};
use crate::{ItemStatus, Lease, NewQueueItem, QueueItem, QueueItemId, r#trait::QueueStore};

/// In-memory queue store
///
/// Items live in a table behind a single mutex. A claim is a conditional
/// update performed while that mutex is held, which makes `fetch_due` atomic
/// for every caller sharing this instance (clones share the table).
///
/// Nothing survives a restart; use [`FileQueueStore`](super::FileQueueStore)
/// when items must outlive the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueueStore {
    table: Arc<Mutex<ItemTable>>,
}

impl MemoryQueueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items currently `claimed` or `sending`
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.table.lock().in_flight()
    }

    /// Snapshot of every item, oldest first
    #[must_use]
    pub fn snapshot(&self) -> Vec<QueueItem> {
        self.table.lock().list(None)
    }

    fn transition<F>(&self, id: &QueueItemId, f: F) -> crate::Result<()>
    where
        F: FnOnce(&mut QueueItem) -> crate::Result<()>,
    {
        let mut table = self.table.lock();
        let item = table.stage(id, f)?;
        table.commit(item);
        Ok(())
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(&self, item: NewQueueItem) -> crate::Result<QueueItem> {
        let item = item.into_item(Utc::now());
        self.table.lock().commit(item.clone());
        Ok(item)
    }

    async fn fetch_due(&self, limit: usize, owner: &str) -> crate::Result<Vec<QueueItem>> {
        let now = Utc::now();
        let mut table = self.table.lock();
        let mut claimed = Vec::new();

        for id in table.due(now, limit) {
            let item = table.stage(&id, |item| {
                item.claim(owner, now);
                Ok(())
            })?;
            table.commit(item.clone());
            claimed.push(item);
        }

        Ok(claimed)
    }

    async fn mark_sending(&self, id: &QueueItemId, lease: &Lease) -> crate::Result<()> {
        self.transition(id, |item| item.begin_sending(lease))
    }

    async fn mark_sent(&self, id: &QueueItemId, lease: &Lease) -> crate::Result<()> {
        self.transition(id, |item| item.complete(lease).map(|_| ()))
    }

    async fn mark_deferred(
        &self,
        id: &QueueItemId,
        lease: &Lease,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> crate::Result<()> {
        self.transition(id, |item| item.defer(lease, next_attempt_at, error))
    }

    async fn mark_dead_letter(
        &self,
        id: &QueueItemId,
        lease: &Lease,
        error: &str,
    ) -> crate::Result<()> {
        self.transition(id, |item| item.dead_letter(lease, error))
    }

    async fn release_stale_claims(&self, timeout: Duration) -> crate::Result<Vec<QueueItemId>> {
        let now = Utc::now();
        let timeout = lease_timeout(timeout);
        let mut table = self.table.lock();
        let stale = table.stale(now, timeout);

        for id in &stale {
            let item = table.stage(id, |item| {
                item.release_if_stale(now, timeout);
                Ok(())
            })?;
            table.commit(item);
        }

        Ok(stale)
    }

    async fn requeue(&self, id: &QueueItemId) -> crate::Result<()> {
        self.transition(id, |item| item.requeue(Utc::now()))
    }

    async fn get(&self, id: &QueueItemId) -> crate::Result<Option<QueueItem>> {
        Ok(self.table.lock().get(id).cloned())
    }

    async fn list(&self, status: Option<ItemStatus>) -> crate::Result<Vec<QueueItem>> {
        Ok(self.table.lock().list(status))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashSet;

    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::StoreError;

    #[tokio::test]
    async fn test_fetch_due_orders_by_readiness_then_creation() {
        let store = MemoryQueueStore::new();
        let now = Utc::now();

        let late = store
            .enqueue(NewQueueItem::new("late", 3).not_before(now - TimeDelta::seconds(10)))
            .await
            .unwrap();
        let early = store
            .enqueue(NewQueueItem::new("early", 3).not_before(now - TimeDelta::seconds(60)))
            .await
            .unwrap();
        let first = store.enqueue(NewQueueItem::new("first", 3).not_before(now)).await.unwrap();
        let second = store.enqueue(NewQueueItem::new("second", 3).not_before(now)).await.unwrap();
        let future = store
            .enqueue(NewQueueItem::new("future", 3).not_before(now + TimeDelta::hours(1)))
            .await
            .unwrap();

        let claimed: Vec<_> = store
            .fetch_due(10, "worker")
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.id)
            .collect();

        assert_eq!(claimed, vec![early.id, late.id, first.id, second.id]);
        assert_eq!(
            store.get(&future.id).await.unwrap().unwrap().status,
            ItemStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_fetch_due_respects_limit_and_leases() {
        let store = MemoryQueueStore::new();
        for n in 0..5 {
            store.enqueue(NewQueueItem::new(format!("msg-{n}"), 3)).await.unwrap();
        }

        let batch = store.fetch_due(2, "worker-a").await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|item| item.status == ItemStatus::Claimed));
        assert!(batch.iter().all(|item| item.claimed_by.as_deref() == Some("worker-a")));
        assert_eq!(store.in_flight(), 2);

        let rest = store.fetch_due(10, "worker-b").await.unwrap();
        assert_eq!(rest.len(), 3);
        assert!(store.fetch_due(10, "worker-c").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_fetch_never_double_claims() {
        let store = MemoryQueueStore::new();
        for n in 0..200 {
            store.enqueue(NewQueueItem::new(format!("msg-{n}"), 3)).await.unwrap();
        }

        let mut tasks = Vec::new();
        for worker in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let owner = format!("worker-{worker}");
                let mut mine = Vec::new();
                loop {
                    let batch = store.fetch_due(3, &owner).await.unwrap();
                    if batch.is_empty() {
                        break mine;
                    }
                    mine.extend(batch.into_iter().map(|item| item.id));
                    tokio::task::yield_now().await;
                }
            }));
        }

        let mut seen = HashSet::new();
        for task in tasks {
            for id in task.await.unwrap() {
                assert!(seen.insert(id), "{id} was claimed twice");
            }
        }
        assert_eq!(seen.len(), 200);
    }

    #[tokio::test]
    async fn test_full_lifecycle_through_trait() {
        let store = MemoryQueueStore::new();
        let item = store.enqueue(NewQueueItem::new("msg", 2)).await.unwrap();

        let claimed = store.fetch_due(1, "w").await.unwrap().remove(0);
        let lease = claimed.lease().unwrap();
        store.mark_sending(&item.id, &lease).await.unwrap();

        let retry_at = Utc::now() + TimeDelta::minutes(1);
        store
            .mark_deferred(&item.id, &lease, retry_at, "451 try later")
            .await
            .unwrap();

        let deferred = store.get(&item.id).await.unwrap().unwrap();
        assert_eq!(deferred.status, ItemStatus::Pending);
        assert_eq!(deferred.reported_status(), ItemStatus::Deferred);
        assert_eq!(deferred.attempt_count, 1);
        assert_eq!(deferred.next_attempt_at, retry_at);
        assert!(store.fetch_due(1, "w").await.unwrap().is_empty());

        assert_eq!(store.list(Some(ItemStatus::Deferred)).await.unwrap().len(), 1);
        assert!(store.list(Some(ItemStatus::Pending)).await.unwrap().is_empty());

        // The old lease is gone once deferred
        assert!(matches!(
            store.mark_sent(&item.id, &lease).await,
            Err(StoreError::LeaseLost(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_sent_is_idempotent() {
        let store = MemoryQueueStore::new();
        store.enqueue(NewQueueItem::new("msg", 2)).await.unwrap();
        let claimed = store.fetch_due(1, "w").await.unwrap().remove(0);
        let lease = claimed.lease().unwrap();

        store.mark_sent(&claimed.id, &lease).await.unwrap();
        store.mark_sent(&claimed.id, &lease).await.unwrap();

        let sent = store.get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(sent.status, ItemStatus::Sent);
        assert_eq!(sent.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_release_stale_claims_returns_items_to_pending() {
        let store = MemoryQueueStore::new();
        store.enqueue(NewQueueItem::new("msg", 2)).await.unwrap();
        let claimed = store.fetch_due(1, "crashed").await.unwrap().remove(0);

        assert!(
            store
                .release_stale_claims(Duration::from_secs(300))
                .await
                .unwrap()
                .is_empty()
        );

        let released = store.release_stale_claims(Duration::ZERO).await.unwrap();
        assert_eq!(released, vec![claimed.id]);

        let item = store.get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.attempt_count, 0);

        // The crashed worker's late completion is refused
        assert!(matches!(
            store.mark_sent(&claimed.id, &claimed.lease().unwrap()).await,
            Err(StoreError::LeaseLost(_))
        ));

        let reclaimed = store.fetch_due(1, "rescuer").await.unwrap();
        assert_eq!(reclaimed.len(), 1);
    }

    #[tokio::test]
    async fn test_requeue_dead_letter() {
        let store = MemoryQueueStore::new();
        store.enqueue(NewQueueItem::new("msg", 0)).await.unwrap();
        let claimed = store.fetch_due(1, "w").await.unwrap().remove(0);
        store
            .mark_dead_letter(&claimed.id, &claimed.lease().unwrap(), "550 unknown user")
            .await
            .unwrap();

        store.requeue(&claimed.id).await.unwrap();

        let item = store.get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.last_error.as_deref(), Some("550 unknown user"));
        assert!(matches!(
            store.requeue(&claimed.id).await,
            Err(StoreError::InvalidTransition { .. })
        ));
    }
}
