//! The channel directory and state machine (spec §4.2): every channel an
//! adapter has opened, and whether it has completed the establish handshake.

use crate::envelope::Envelope;
use crate::id::{AdapterId, ChannelId, ChannelIdAllocator, Identity};
use crate::DocId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Whether a channel talks to a remote peer over the network or to a local
/// durable store. Storage channels never get `canReveal` checks waived, but
/// they typically run with an all-allow rule set.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Network,
    Storage,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelLifecycle {
    Unestablished,
    Established,
}

/// The capabilities an adapter hands back for a channel it just opened.
/// `send` is fire-and-forget; `stop` tears the channel down from our side.
pub trait ChannelSink: Send + Sync {
    fn send(&self, message: Envelope);
    fn stop(&self);
}

pub struct ChannelRecord {
    pub id: ChannelId,
    pub adapter_id: AdapterId,
    pub kind: ChannelKind,
    pub state: ChannelLifecycle,
    pub remote_identity: Option<Identity>,
    pub subscriptions: HashSet<DocId>,
    pub remote_hint: Option<String>,
    sink: Arc<dyn ChannelSink>,
}

impl ChannelRecord {
    pub fn send(&self, message: Envelope) {
        self.sink.send(message);
    }

    pub fn stop(&self) {
        self.sink.stop();
    }

    /// A cloned handle to this channel's outbound sink, for callers that
    /// need to send after releasing whatever lock they found the channel
    /// under (see [`crate::sync_engine::SyncState::queue_send`]: a sink's
    /// `send` may re-enter synchronously, so it must never be called while
    /// holding the state mutex that re-entry would try to lock again).
    pub fn sink_handle(&self) -> Arc<dyn ChannelSink> {
        self.sink.clone()
    }
}

/// Tracks every open channel and, per adapter, the most recent channel seen
/// for a given logical remote — so a reconnecting peer's stale channel gets
/// removed before the new one is announced (spec §4.1's "at-most-once
/// channel" policy, testable property in spec §8 scenario 4).
#[derive(Default)]
pub struct ChannelDirectory {
    allocator: ChannelIdAllocator,
    channels: HashMap<ChannelId, ChannelRecord>,
    by_remote_hint: HashMap<(AdapterId, String), ChannelId>,
}

impl ChannelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly opened channel. If `remote_hint` matches a channel
    /// already on record for this adapter, that previous channel is removed
    /// first and returned so the caller can tear it down.
    pub fn allocate(
        &mut self,
        adapter_id: AdapterId,
        kind: ChannelKind,
        remote_hint: Option<String>,
        sink: Arc<dyn ChannelSink>,
    ) -> (ChannelId, Option<ChannelRecord>) {
        let stale = remote_hint
            .as_ref()
            .and_then(|hint| self.by_remote_hint.get(&(adapter_id.clone(), hint.clone())))
            .copied()
            .and_then(|old_id| self.remove(old_id));

        let id = self.allocator.next();
        if let Some(hint) = &remote_hint {
            self.by_remote_hint
                .insert((adapter_id.clone(), hint.clone()), id);
        }
        self.channels.insert(
            id,
            ChannelRecord {
                id,
                adapter_id,
                kind,
                state: ChannelLifecycle::Unestablished,
                remote_identity: None,
                subscriptions: HashSet::new(),
                remote_hint,
                sink,
            },
        );
        (id, stale)
    }

    pub fn get(&self, id: ChannelId) -> Option<&ChannelRecord> {
        self.channels.get(&id)
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut ChannelRecord> {
        self.channels.get_mut(&id)
    }

    /// Idempotent: removing an unknown channel id is a no-op returning `None`.
    pub fn remove(&mut self, id: ChannelId) -> Option<ChannelRecord> {
        let record = self.channels.remove(&id)?;
        if let Some(hint) = &record.remote_hint {
            if self.by_remote_hint.get(&(record.adapter_id.clone(), hint.clone())) == Some(&id) {
                self.by_remote_hint
                    .remove(&(record.adapter_id.clone(), hint.clone()));
            }
        }
        Some(record)
    }

    pub fn established(&self) -> impl Iterator<Item = &ChannelRecord> {
        self.channels
            .values()
            .filter(|c| c.state == ChannelLifecycle::Established)
    }

    pub fn established_subscribed_to(&self, doc_id: &DocId) -> impl Iterator<Item = &ChannelRecord> {
        self.established()
            .filter(move |c| c.subscriptions.contains(doc_id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelRecord> {
        self.channels.values()
    }
}
