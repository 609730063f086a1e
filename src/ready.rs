//! Ready-state tracking (spec §4.5/§6.1): for every (document, peer) pair,
//! exactly one status holds at any time.

use crate::id::{AdapterId, Identity};
use crate::channel::ChannelKind;
use serde::{Deserialize, Serialize};
use syncrepo_crdt::VersionVector;

/// The four ready states a peer can be in with respect to one document.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyStatus {
    /// We know the peer is aware of the document (directory exchange or an
    /// inbound sync-request) but have no version information from them.
    Aware,
    /// Our local document has ops, but we don't know whether the peer has
    /// caught up.
    Loaded,
    /// The peer's last known version dominates (or equals) ours.
    Synced,
    /// The peer confirmed, explicitly, that it does not have the document.
    Absent,
}

/// A channel over which a peer is reachable for a given document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelRef {
    pub kind: ChannelKind,
    pub adapter_id: AdapterId,
}

/// One peer's ready state for one document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerReadyState {
    pub identity: Identity,
    pub channels: Vec<ChannelRef>,
    pub status: ReadyStatus,
}

pub type ReadyStates = Vec<PeerReadyState>;

/// Tracks per-peer knowledge of one document, just enough to compute a
/// [`ReadyStatus`] deterministically. Kept out of the wire protocol; this is
/// bookkeeping state derived from the envelopes actually exchanged.
#[derive(Clone, Debug, Default)]
pub struct PeerDocKnowledge {
    pub known_version: Option<VersionVector>,
    pub confirmed_absent: bool,
}

impl PeerDocKnowledge {
    /// Computes this peer's status for a document currently at `local_version`.
    ///
    /// A peer whose known version is strictly behind ours is still bucketed
    /// as `Loaded` rather than a fifth "behind" status: spec §6.1 only names
    /// four statuses, and "local has ops, remote hasn't caught up" is the
    /// closest fit to `Loaded`'s definition.
    pub fn status(&self, local_version: &VersionVector, local_has_ops: bool) -> ReadyStatus {
        if self.confirmed_absent {
            return ReadyStatus::Absent;
        }
        match &self.known_version {
            Some(v) if *v >= *local_version => ReadyStatus::Synced,
            Some(_) => ReadyStatus::Loaded,
            None if local_has_ops => ReadyStatus::Loaded,
            None => ReadyStatus::Aware,
        }
    }

    pub fn observe_version(&mut self, version: VersionVector) {
        self.confirmed_absent = false;
        match &mut self.known_version {
            Some(existing) => existing.merge(&version),
            None => self.known_version = Some(version),
        }
    }

    pub fn observe_absent(&mut self) {
        self.confirmed_absent = true;
        self.known_version = None;
    }
}
