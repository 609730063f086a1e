//! The Repo Facade (spec §4.6/§6.4): the small, stable surface applications
//! actually call. Everything else in this crate is plumbing `Repo` wires
//! together.

use crate::channel::ChannelKind;
use crate::error::SyncError;
use crate::ready::ReadyStates;
use crate::synchronizer::Synchronizer;
use crate::DocId;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use syncrepo_crdt::{CrdtDocument, EphemeralStore};

/// A handle to one document's live CRDT state. Cheap to clone; every clone
/// shares the same underlying document and the same fan-out wiring.
#[derive(Clone)]
pub struct Doc {
    id: DocId,
    inner: Arc<Mutex<Box<dyn CrdtDocument>>>,
}

impl Doc {
    pub fn id(&self) -> &DocId {
        &self.id
    }

    /// Runs `f` against the raw [`CrdtDocument`] trait object under the
    /// document's lock. Mutations made through `f` are picked up by the
    /// local-update hook and fanned out automatically.
    pub fn with<R>(&self, f: impl FnOnce(&mut dyn CrdtDocument) -> R) -> R {
        let mut guard = self.inner.lock().unwrap();
        f(guard.as_mut())
    }

    /// Convenience for the reference [`syncrepo_crdt::MapDoc`] backend: runs
    /// `f` against the concrete type if that's what this document is.
    /// Returns `None` for any other backend.
    pub fn with_map_doc<R>(&self, f: impl FnOnce(&mut syncrepo_crdt::MapDoc) -> R) -> Option<R> {
        let mut guard = self.inner.lock().unwrap();
        guard
            .as_any_mut()
            .downcast_mut::<syncrepo_crdt::MapDoc>()
            .map(f)
    }
}

/// A handle to one document's ephemeral (presence) store. Writes made
/// through it are fanned out to every subscribed channel automatically,
/// just like [`Doc`]'s CRDT mutations.
#[derive(Clone)]
pub struct Ephemeral {
    inner: Arc<Mutex<Box<dyn EphemeralStore>>>,
}

impl Ephemeral {
    pub fn with<R>(&self, f: impl FnOnce(&mut dyn EphemeralStore) -> R) -> R {
        let mut guard = self.inner.lock().unwrap();
        f(guard.as_mut())
    }

    /// Convenience for the reference [`syncrepo_crdt::MapEphemeralStore`]
    /// backend: runs `f` against the concrete type if that's what this
    /// store is. Returns `None` for any other backend.
    pub fn with_map_store<R>(&self, f: impl FnOnce(&mut syncrepo_crdt::MapEphemeralStore) -> R) -> Option<R> {
        let mut guard = self.inner.lock().unwrap();
        guard
            .as_any_mut()
            .downcast_mut::<syncrepo_crdt::MapEphemeralStore>()
            .map(f)
    }
}

/// Application-facing entry point (spec §6.4). Wraps a [`Synchronizer`] with
/// the `get`/`has`/`delete`/`subscribe` surface applications actually need.
#[derive(Clone)]
pub struct Repo {
    synchronizer: Synchronizer,
}

impl Repo {
    pub fn new(synchronizer: Synchronizer) -> Self {
        Self { synchronizer }
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.synchronizer.start().await
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.synchronizer.stop().await
    }

    /// Returns a handle to `doc_id`, creating it locally if this is the
    /// first local access, and probing every established channel for it
    /// (spec §4.4).
    pub fn get(&self, doc_id: impl Into<DocId>) -> Doc {
        let doc_id = doc_id.into();
        let inner = self.synchronizer.get_or_create_doc(&doc_id);
        Doc { id: doc_id, inner }
    }

    pub fn has(&self, doc_id: &DocId) -> bool {
        self.synchronizer.has(doc_id)
    }

    /// Returns a handle to `doc_id`'s default ephemeral (presence) store,
    /// creating it (and the document, if needed) on first access.
    pub fn ephemeral(&self, doc_id: &DocId) -> Ephemeral {
        Ephemeral {
            inner: self.synchronizer.get_or_create_ephemeral(doc_id),
        }
    }

    pub async fn delete(&self, doc_id: &DocId) -> Result<(), SyncError> {
        self.synchronizer.delete(doc_id).await
    }

    pub fn ready_states(&self, doc_id: &DocId) -> ReadyStates {
        self.synchronizer.ready_states(doc_id)
    }

    /// Blocks until `predicate` holds for `doc_id`'s ready states, or
    /// `timeout` elapses, or `cancel` fires, or the repo is stopped
    /// (spec §6.4's `waitForSync({kind?, timeout?, signal?})`). `kind`
    /// restricts both the ready states considered and the adapter-presence
    /// check to that channel kind; `None` considers every channel.
    pub async fn subscribe(
        &self,
        doc_id: &DocId,
        kind: Option<ChannelKind>,
        predicate: impl Fn(&ReadyStates) -> bool,
        timeout: Duration,
        cancel: Option<tokio::sync::watch::Receiver<bool>>,
    ) -> Result<(), SyncError> {
        self.synchronizer
            .wait_until_ready(doc_id, kind, predicate, timeout, cancel)
            .await
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.synchronizer
    }
}
