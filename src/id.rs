use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque document identifier, globally unique per logical document.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(Arc<str>);

impl DocId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocId({})", self.0)
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DocId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for DocId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

/// Identifies an [`crate::Adapter`] instance within a process.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdapterId(Arc<str>);

impl AdapterId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }
}

impl fmt::Debug for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AdapterId({})", self.0)
    }
}

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AdapterId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

/// Process-local integer allocated monotonically by the [`crate::channel::ChannelDirectory`].
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(u64);

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl ChannelId {
    /// Never allocated by [`ChannelIdAllocator`]; used as a throwaway
    /// sentinel when a channel is rejected before the Synchronizer could
    /// register it (e.g. the Synchronizer was already dropped).
    pub(crate) const INVALID: ChannelId = ChannelId(0);
}

/// Allocates process-wide unique [`ChannelId`]s. Kept per-[`crate::Synchronizer`]
/// rather than truly global (spec §9: "can be per-Synchronizer without loss
/// of correctness").
#[derive(Default)]
pub struct ChannelIdAllocator(AtomicU64);

impl ChannelIdAllocator {
    pub fn next(&self) -> ChannelId {
        ChannelId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// The kind of participant an [`Identity`] represents.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityType {
    User,
    Service,
    Storage,
}

/// `{ peerId, name, type }` (spec §3). Storage adapters present an identity
/// too; their `Storage` type signals "persistent store" so ready-state
/// reporting can distinguish "persisted" from "replicated" (spec §6.1).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub peer_id: crate::PeerId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: IdentityType,
}

impl Identity {
    pub fn new(peer_id: crate::PeerId, name: impl Into<String>, kind: IdentityType) -> Self {
        Self {
            peer_id,
            name: name.into(),
            kind,
        }
    }
}
