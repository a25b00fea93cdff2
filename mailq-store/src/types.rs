use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier for a queue item
///
/// A ULID: globally unique and lexicographically sortable by creation time,
/// so it doubles as a stable on-disk filename for the file backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueItemId {
    id: ulid::Ulid,
}

impl QueueItemId {
    /// Generate a new unique item ID
    #[must_use]
    pub fn generate() -> Self {
        Self {
            id: ulid::Ulid::new(),
        }
    }

    /// Create an item ID from an existing ULID
    #[must_use]
    pub const fn new(id: ulid::Ulid) -> Self {
        Self { id }
    }

    /// Parse an item ID from a filename like `01ARZ3NDEKTSV4RRFFQ69G5FAV.bin`
    ///
    /// Rejects path separators, traversal patterns, other extensions and
    /// anything that is not a valid ULID.
    pub fn from_filename(filename: &str) -> Option<Self> {
        if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
            return None;
        }

        let stem = filename.strip_suffix(".bin")?;
        let id = ulid::Ulid::from_string(stem).ok()?;

        Some(Self { id })
    }

    /// The filename this item is persisted under
    #[must_use]
    pub fn filename(&self) -> String {
        format!("{}.bin", self.id)
    }
}

impl Display for QueueItemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl FromStr for QueueItemId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ulid::Ulid::from_string(s).map(Self::new)
    }
}

impl Serialize for QueueItemId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.id.to_string())
    }
}

impl<'de> Deserialize<'de> for QueueItemId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let id = ulid::Ulid::from_string(&s).map_err(serde::de::Error::custom)?;
        Ok(Self { id })
    }
}

/// Opaque reference to the message a queue item delivers
///
/// The queue never interprets this; only the transport does.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadRef(String);

impl PayloadRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PayloadRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PayloadRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PayloadRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Delivery state of a queue item
///
/// `Sent` and `DeadLetter` are terminal. `Deferred` is never stored: a
/// deferred item goes back to `Pending` with a later `next_attempt_at`, and
/// `Deferred` is how such an item is reported (see
/// [`QueueItem::reported_status`](crate::QueueItem::reported_status)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Claimed,
    Sending,
    Sent,
    Deferred,
    DeadLetter,
}

impl ItemStatus {
    /// No further transition is possible from this status
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::DeadLetter)
    }

    /// The item is held under a lease by some worker
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Claimed | Self::Sending)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Deferred => "deferred",
            Self::DeadLetter => "dead_letter",
        }
    }
}

impl Display for ItemStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An exclusive, time-bounded claim on a queue item
///
/// Every mutation a worker makes must present the lease it was handed by
/// `fetch_due`. Once the lease has been reclaimed the old holder can no
/// longer touch the item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub claimed_at: DateTime<Utc>,
}
