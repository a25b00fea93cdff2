use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailq_common::internal;
use tokio::{fs, sync::Mutex};

use super::table::{ItemTable, lease_timeout};
use crate::{
    ItemStatus, Lease, NewQueueItem, QueueItem, QueueItemId, SerializationError, StoreError,
    r#trait::QueueStore,
};

const TEMP_SUFFIX: &str = ".tmp";

/// File-backed queue store
///
/// Every item is a bincode record named `{ulid}.bin` inside the queue
/// directory. The directory is loaded into an in-memory index on
/// [`open`](Self::open); afterwards the index is authoritative and every
/// transition is written through before it is committed to the index.
///
/// Each `fetch_due` rescans the directory first, so records another process
/// adds (a new item, or an operator requeue of a dead-lettered one) are
/// picked up without a restart.
///
/// # Atomicity
/// Writes go to `{ulid}.bin.tmp` and are then renamed over the record, so a
/// crash never leaves a half-written item behind. Claims are serialised by
/// the index lock, which makes `fetch_due` atomic for every caller in this
/// process. Several processes must not share one directory.
#[derive(Debug, Clone)]
pub struct FileQueueStore {
    path: PathBuf,
    table: Arc<Mutex<ItemTable>>,
}

impl FileQueueStore {
    /// Validate a queue directory path
    ///
    /// Rejects `..` components, relative paths and system directories.
    ///
    /// # Errors
    /// Returns `StoreError::Validation` describing the problem
    pub fn validate_path(path: &Path) -> crate::Result<()> {
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(StoreError::Validation(format!(
                "Queue path cannot contain '..' components: {}",
                path.display()
            )));
        }

        if !path.is_absolute() {
            return Err(StoreError::Validation(format!(
                "Queue path must be absolute: {}",
                path.display()
            )));
        }

        let sensitive_prefixes = [
            "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
        ];

        if let Some(prefix) = sensitive_prefixes.iter().find(|p| path.starts_with(p)) {
            return Err(StoreError::Validation(format!(
                "Queue path cannot be in system directory {prefix}: {}",
                path.display()
            )));
        }

        Ok(())
    }

    /// Open (creating if needed) the queue directory and load every item
    ///
    /// Leftover temporary files from an interrupted write are removed.
    ///
    /// # Errors
    /// - If the path is invalid or is not a directory
    /// - If a record cannot be read or decoded
    pub fn open(path: impl Into<PathBuf>) -> crate::Result<Self> {
        let path = path.into();
        Self::validate_path(&path)?;

        internal!("Opening queue directory {} ...", path.display());

        if !path.try_exists()? {
            internal!("{} does not exist, creating...", path.display());
            std::fs::create_dir_all(&path)?;
        } else if !path.is_dir() {
            return Err(StoreError::Validation(format!(
                "Expected {} to be a directory, but it is not",
                path.display()
            )));
        }

        let mut table = ItemTable::default();
        let mut cleaned = 0;

        for entry in std::fs::read_dir(&path)? {
            let entry = entry?;
            let filename = entry.file_name();
            let filename = filename.to_string_lossy();

            if filename.ends_with(TEMP_SUFFIX) {
                std::fs::remove_file(entry.path())?;
                cleaned += 1;
                continue;
            }

            let Some(id) = QueueItemId::from_filename(&filename) else {
                continue;
            };

            let item = decode(&std::fs::read(entry.path())?)?;
            if item.id != id {
                return Err(SerializationError::Corrupted(format!(
                    "{filename} contains item {}",
                    item.id
                ))
                .into());
            }
            table.commit(item);
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} interrupted writes in {}",
                path.display()
            );
        }

        internal!(
            level = INFO,
            "Loaded {} queue items from {}",
            table.len(),
            path.display()
        );

        Ok(Self {
            path,
            table: Arc::new(Mutex::new(table)),
        })
    }

    /// The queue directory
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, item: &QueueItem) -> crate::Result<()> {
        let bytes = bincode::serde::encode_to_vec(item, bincode::config::standard())
            .map_err(SerializationError::from)?;

        let target = self.path.join(item.id.filename());
        let temp = self.path.join(format!("{}{TEMP_SUFFIX}", item.id.filename()));

        fs::write(&temp, bytes).await?;
        fs::rename(&temp, &target).await?;

        Ok(())
    }

    /// Adopt records written by another process since the index was
    /// loaded: unknown items, and dead-lettered items whose record has
    /// changed status. Unreadable records are skipped.
    async fn refresh(&self, table: &mut ItemTable) -> crate::Result<()> {
        let mut entries = fs::read_dir(&self.path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name();
            let filename = filename.to_string_lossy();

            let Some(id) = QueueItemId::from_filename(&filename) else {
                continue;
            };

            let known = table.get(&id).map(|known| known.status);
            if known.is_some_and(|status| status != ItemStatus::DeadLetter) {
                continue;
            }

            let item = match fs::read(entry.path()).await {
                Ok(bytes) => match decode(&bytes) {
                    Ok(item) if item.id == id => item,
                    Ok(item) => {
                        internal!(level = WARN, "Skipping {filename}: it contains item {}", item.id);
                        continue;
                    }
                    Err(err) => {
                        internal!(level = WARN, "Skipping unreadable queue record {filename}: {err}");
                        continue;
                    }
                },
                Err(err) => {
                    internal!(level = WARN, "Skipping unreadable queue record {filename}: {err}");
                    continue;
                }
            };

            match known {
                None => {
                    internal!(level = INFO, "Picked up new queue item {id}");
                    table.commit(item);
                }
                Some(status) if status != item.status => {
                    internal!(level = INFO, "Picked up requeued queue item {id}");
                    table.commit(item);
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    async fn transition<F>(&self, id: &QueueItemId, f: F) -> crate::Result<()>
    where
        F: FnOnce(&mut QueueItem) -> crate::Result<()> + Send,
    {
        let mut table = self.table.lock().await;
        let item = table.stage(id, f)?;
        self.persist(&item).await?;
        table.commit(item);
        Ok(())
    }
}

fn decode(bytes: &[u8]) -> crate::Result<QueueItem> {
    let (item, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(SerializationError::from)?;
    Ok(item)
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn enqueue(&self, item: NewQueueItem) -> crate::Result<QueueItem> {
        let item = item.into_item(Utc::now());
        let mut table = self.table.lock().await;
        self.persist(&item).await?;
        table.commit(item.clone());
        Ok(item)
    }

    async fn fetch_due(&self, limit: usize, owner: &str) -> crate::Result<Vec<QueueItem>> {
        let mut table = self.table.lock().await;
        self.refresh(&mut table).await?;

        let now = Utc::now();
        let mut claimed = Vec::new();

        for id in table.due(now, limit) {
            let item = table.stage(&id, |item| {
                item.claim(owner, now);
                Ok(())
            })?;
            self.persist(&item).await?;
            table.commit(item.clone());
            claimed.push(item);
        }

        Ok(claimed)
    }

    async fn mark_sending(&self, id: &QueueItemId, lease: &Lease) -> crate::Result<()> {
        self.transition(id, |item| item.begin_sending(lease)).await
    }

    async fn mark_sent(&self, id: &QueueItemId, lease: &Lease) -> crate::Result<()> {
        self.transition(id, |item| item.complete(lease).map(|_| ()))
            .await
    }

    async fn mark_deferred(
        &self,
        id: &QueueItemId,
        lease: &Lease,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> crate::Result<()> {
        self.transition(id, |item| item.defer(lease, next_attempt_at, error))
            .await
    }

    async fn mark_dead_letter(
        &self,
        id: &QueueItemId,
        lease: &Lease,
        error: &str,
    ) -> crate::Result<()> {
        self.transition(id, |item| item.dead_letter(lease, error))
            .await
    }

    async fn release_stale_claims(&self, timeout: Duration) -> crate::Result<Vec<QueueItemId>> {
        let now = Utc::now();
        let timeout = lease_timeout(timeout);
        let mut table = self.table.lock().await;
        let stale = table.stale(now, timeout);

        for id in &stale {
            let item = table.stage(id, |item| {
                item.release_if_stale(now, timeout);
                Ok(())
            })?;
            self.persist(&item).await?;
            table.commit(item);
        }

        Ok(stale)
    }

    async fn requeue(&self, id: &QueueItemId) -> crate::Result<()> {
        let now = Utc::now();
        self.transition(id, |item| item.requeue(now)).await
    }

    async fn get(&self, id: &QueueItemId) -> crate::Result<Option<QueueItem>> {
        Ok(self.table.lock().await.get(id).cloned())
    }

    async fn list(&self, status: Option<ItemStatus>) -> crate::Result<Vec<QueueItem>> {
        Ok(self.table.lock().await.list(status))
    }
}
