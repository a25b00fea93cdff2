use std::{path::PathBuf, sync::Arc};

use serde::Deserialize;

use crate::{FileQueueStore, MemoryQueueStore, r#trait::QueueStore};

/// Configuration for the queue store
///
/// # Examples
///
/// File-backed queue in RON config:
/// ```ron
/// Mailq (
///     store: (
///         type: "File",
///         path: "/var/spool/mailq",
///     ),
/// )
/// ```
///
/// Memory-backed queue (development only, nothing survives a restart):
/// ```ron
/// Mailq (
///     store: (type: "Memory"),
/// )
/// ```
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum StoreConfig {
    File { path: PathBuf },
    #[default]
    Memory,
}

impl StoreConfig {
    /// Build the configured store
    ///
    /// # Errors
    /// If a file-backed store cannot be opened
    pub fn build(&self) -> crate::Result<Arc<dyn QueueStore>> {
        Ok(match self {
            Self::File { path } => Arc::new(FileQueueStore::open(path.clone())?),
            Self::Memory => Arc::new(MemoryQueueStore::new()),
        })
    }
}
