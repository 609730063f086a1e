//! The document registry (spec §4.3... referenced as the Document Registry
//! component): every document this process knows about, local or remote in
//! origin, plus its ephemeral stores and per-channel sync bookkeeping.

use crate::id::ChannelId;
use crate::DocId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use syncrepo_crdt::{CrdtDocument, EphemeralStore, VersionVector};

/// Everything the registry tracks for one document.
pub struct DocumentState {
    pub doc: Arc<Mutex<Box<dyn CrdtDocument>>>,
    pub ephemeral: HashMap<String, Arc<Mutex<Box<dyn EphemeralStore>>>>,
    /// True until the document's first local mutation or first imported
    /// update; used to decide whether a bare directory mention is enough to
    /// call it "ours" yet.
    pub is_new: bool,
    pub is_deleted: bool,
    /// The last version vector we know we've sent to each channel, so
    /// `export` can compute an incremental delta instead of full history.
    pub last_sent_version: HashMap<ChannelId, VersionVector>,
}

impl DocumentState {
    fn new(doc: Box<dyn CrdtDocument>) -> Self {
        Self {
            doc: Arc::new(Mutex::new(doc)),
            ephemeral: HashMap::new(),
            is_new: true,
            is_deleted: false,
            last_sent_version: HashMap::new(),
        }
    }

    /// Returns the named ephemeral store, creating it via `factory` if this
    /// is the first access. The second element is `true` iff this call
    /// created the entry.
    pub fn get_or_create_ephemeral(
        &mut self,
        name: &str,
        factory: impl FnOnce() -> Box<dyn EphemeralStore>,
    ) -> (Arc<Mutex<Box<dyn EphemeralStore>>>, bool) {
        let created = !self.ephemeral.contains_key(name);
        let store = self
            .ephemeral
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(factory())));
        (store.clone(), created)
    }
}

#[derive(Default)]
pub struct DocumentRegistry {
    docs: HashMap<DocId, DocumentState>,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, doc_id: &DocId) -> Option<&DocumentState> {
        self.docs.get(doc_id)
    }

    pub fn get_mut(&mut self, doc_id: &DocId) -> Option<&mut DocumentState> {
        self.docs.get_mut(doc_id)
    }

    /// True iff the document is known locally and not tombstoned.
    pub fn has(&self, doc_id: &DocId) -> bool {
        self.docs.get(doc_id).is_some_and(|d| !d.is_deleted)
    }

    /// Returns the document state for `doc_id`, creating it via `factory` if
    /// unseen. The second element of the tuple is `true` iff this call
    /// created the entry.
    pub fn get_or_create(
        &mut self,
        doc_id: &DocId,
        factory: impl FnOnce() -> Box<dyn CrdtDocument>,
    ) -> (&mut DocumentState, bool) {
        let created = !self.docs.contains_key(doc_id);
        let entry = self
            .docs
            .entry(doc_id.clone())
            .or_insert_with(|| DocumentState::new(factory()));
        (entry, created)
    }

    /// Marks a document deleted in place; idempotent. Returns `false` if the
    /// document was never known (nothing to tombstone).
    pub fn mark_deleted(&mut self, doc_id: &DocId) -> bool {
        match self.docs.get_mut(doc_id) {
            Some(state) => {
                state.is_deleted = true;
                true
            }
            None => false,
        }
    }

    pub fn doc_ids(&self) -> impl Iterator<Item = &DocId> {
        self.docs.keys()
    }

    /// All doc ids satisfying `predicate`, typically a `canReveal` gate.
    /// A document still marked `is_new` (never locally mutated or imported
    /// into) never appears here: we only know *of* it, we don't own it yet.
    pub fn visible_doc_ids(&self, mut predicate: impl FnMut(&DocId) -> bool) -> Vec<DocId> {
        self.docs
            .keys()
            .filter(|id| {
                let doc = &self.docs[*id];
                !doc.is_deleted && !doc.is_new && predicate(id)
            })
            .cloned()
            .collect()
    }
}
