//! The sync engine (spec §4.4): the per-(document, channel) protocol logic —
//! directory probes, the sync handshake, incremental update fan-out, the
//! ephemeral piggyback, delete propagation, and ready-state recomputation.
//!
//! Everything in this module is synchronous: [`crate::channel::ChannelSink::send`]
//! is fire-and-forget, so dispatching an envelope never needs to await (spec
//! §5's "handlers run synchronous to completion").

use crate::channel::{ChannelDirectory, ChannelLifecycle, ChannelSink};
use crate::envelope::{Envelope, SyncRequestEntry, Transmission};
use crate::id::{ChannelId, Identity};
use crate::ready::{ChannelRef, PeerDocKnowledge, PeerReadyState, ReadyStates};
use crate::registry::DocumentRegistry;
use crate::rules::{ChannelContext, Operation, RuleContext, Rules};
use crate::DocId;
use std::collections::HashMap;
use std::sync::Arc;
use syncrepo_crdt::{CrdtDocument, PeerId, VersionVector};

/// Everything the engine needs: the registry, the channel directory, the
/// rules engine, and per-(doc, peer) sync bookkeeping. Owned exclusively by
/// [`crate::Synchronizer`] behind a single mutex (spec §5).
pub struct SyncState {
    pub registry: DocumentRegistry,
    pub channels: ChannelDirectory,
    pub local_identity: Identity,
    pub rules: Box<dyn Rules>,
    pub peer_knowledge: HashMap<(DocId, PeerId), PeerDocKnowledge>,
    /// Envelopes queued by the handlers below, drained and sent by the
    /// caller only after it releases the state lock. A `ChannelSink::send`
    /// can re-enter synchronously (an in-memory test transport delivers
    /// straight into the peer's `channel_receive`, which may reply straight
    /// back into ours) — sending while still holding this mutex would
    /// deadlock on the reply, since `std::sync::Mutex` isn't reentrant.
    pending_sends: Vec<(Arc<dyn ChannelSink>, Envelope)>,
}

impl SyncState {
    pub fn new(local_identity: Identity, rules: Box<dyn Rules>) -> Self {
        Self {
            registry: DocumentRegistry::new(),
            channels: ChannelDirectory::new(),
            local_identity,
            rules,
            peer_knowledge: HashMap::new(),
            pending_sends: Vec::new(),
        }
    }

    /// Queues `envelope` for `channel_id` instead of sending it inline. See
    /// [`SyncState::pending_sends`] for why.
    fn queue_send(&mut self, channel_id: ChannelId, envelope: Envelope) {
        if let Some(channel) = self.channels.get(channel_id) {
            self.pending_sends.push((channel.sink_handle(), envelope));
        }
    }

    /// Drains every envelope queued since the last drain. The caller must
    /// have already released the state lock before sending these.
    pub fn take_pending_sends(&mut self) -> Vec<(Arc<dyn ChannelSink>, Envelope)> {
        std::mem::take(&mut self.pending_sends)
    }

    fn knowledge_mut(&mut self, doc_id: &DocId, peer_id: &PeerId) -> &mut PeerDocKnowledge {
        self.peer_knowledge
            .entry((doc_id.clone(), peer_id.clone()))
            .or_default()
    }

    /// Ready states for one document, derived from every established
    /// channel whose remote identity we know, grouped by peer.
    pub fn ready_states(&self, doc_id: &DocId) -> ReadyStates {
        let (local_version, local_has_ops) = match self.registry.get(doc_id) {
            Some(state) => {
                let doc = state.doc.lock().unwrap();
                (doc.version(), !doc.is_empty())
            }
            None => (VersionVector::new(), false),
        };

        let mut by_peer: HashMap<PeerId, (Identity, Vec<ChannelRef>)> = HashMap::new();
        for ch in self.channels.established() {
            if let Some(identity) = &ch.remote_identity {
                let entry = by_peer
                    .entry(identity.peer_id.clone())
                    .or_insert_with(|| (identity.clone(), Vec::new()));
                entry.1.push(ChannelRef {
                    kind: ch.kind,
                    adapter_id: ch.adapter_id.clone(),
                });
            }
        }

        by_peer
            .into_iter()
            .map(|(peer_id, (identity, channels))| {
                let status = self
                    .peer_knowledge
                    .get(&(doc_id.clone(), peer_id))
                    .map(|k| k.status(&local_version, local_has_ops))
                    .unwrap_or(crate::ready::ReadyStatus::Aware);
                PeerReadyState {
                    identity,
                    channels,
                    status,
                }
            })
            .collect()
    }

    fn rule_ctx<'a>(
        &'a self,
        doc_id: &'a DocId,
        channel_id: Option<ChannelId>,
        remote_identity: Option<&'a Identity>,
        operation: Operation,
    ) -> (RuleContext<'a>, Option<ChannelContext>) {
        let channel_ctx = channel_id.and_then(|id| self.channels.get(id)).map(|ch| ChannelContext {
            channel_id: ch.id,
            adapter_id: ch.adapter_id.clone(),
            kind: ch.kind,
        });
        let ctx = RuleContext {
            doc_id,
            channel: None,
            remote_identity,
            local_identity: &self.local_identity,
            operation,
        };
        (ctx, channel_ctx)
    }

    fn can(&self, doc_id: &DocId, channel_id: ChannelId, op: Operation) -> bool {
        let remote = self.channels.get(channel_id).and_then(|c| c.remote_identity.clone());
        let (mut ctx, channel_ctx) = self.rule_ctx(doc_id, Some(channel_id), remote.as_ref(), op);
        ctx.channel = channel_ctx.as_ref();
        match op {
            Operation::Reveal => self.rules.can_reveal(&ctx),
            Operation::Accept => self.rules.can_accept(&ctx),
            Operation::Create => self.rules.can_create(&ctx),
            Operation::Delete => self.rules.can_delete(&ctx),
        }
    }

    /// Dispatches one inbound envelope from `channel_id`. Returns the list
    /// of newly-established channel ids (so the caller can trigger their
    /// directory probes) plus doc ids whose ready state may have changed.
    pub fn dispatch(&mut self, channel_id: ChannelId, envelope: Envelope) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        self.dispatch_inner(channel_id, envelope, &mut outcome, 0);
        outcome
    }

    fn dispatch_inner(
        &mut self,
        channel_id: ChannelId,
        envelope: Envelope,
        outcome: &mut DispatchOutcome,
        depth: u8,
    ) {
        if depth > 1 {
            tracing::warn!(?channel_id, "dropping over-nested batch envelope");
            return;
        }
        let messages = match envelope.flatten_batch() {
            Ok(messages) => messages,
            Err(reason) => {
                tracing::warn!(?channel_id, reason, "protocol violation");
                return;
            }
        };
        for message in messages {
            if matches!(message, Envelope::Batch { .. }) {
                self.dispatch_inner(channel_id, message, outcome, depth + 1);
            } else {
                self.dispatch_one(channel_id, message, outcome);
            }
        }
    }

    fn dispatch_one(&mut self, channel_id: ChannelId, envelope: Envelope, outcome: &mut DispatchOutcome) {
        match envelope {
            Envelope::EstablishRequest { identity } => {
                self.handle_establish(channel_id, identity, true, outcome)
            }
            Envelope::EstablishResponse { identity } => {
                self.handle_establish(channel_id, identity, false, outcome)
            }
            Envelope::DirectoryRequest => self.handle_directory_request(channel_id),
            Envelope::DirectoryResponse { doc_ids } => {
                self.handle_directory_response(channel_id, doc_ids, outcome)
            }
            Envelope::SyncRequest { docs, bidirectional } => {
                self.handle_sync_request(channel_id, docs, bidirectional, outcome)
            }
            Envelope::SyncResponse {
                doc_id,
                transmission,
                ephemeral,
            } => self.handle_sync_response(channel_id, doc_id, transmission, ephemeral, outcome),
            Envelope::Update {
                doc_id,
                update,
                version,
                ephemeral,
            } => self.handle_update(channel_id, doc_id, update, version, ephemeral, outcome),
            Envelope::Ephemeral { doc_id, ephemeral } => {
                self.handle_ephemeral(channel_id, doc_id, ephemeral)
            }
            Envelope::Delete { doc_id } => self.handle_delete(channel_id, doc_id, outcome),
            Envelope::Batch { .. } => unreachable!("flattened before dispatch_one"),
        }
    }

    fn handle_establish(
        &mut self,
        channel_id: ChannelId,
        identity: Identity,
        is_request: bool,
        outcome: &mut DispatchOutcome,
    ) {
        let Some(channel) = self.channels.get_mut(channel_id) else {
            return;
        };
        if channel.state == ChannelLifecycle::Established {
            // Tie-break: concurrent establish-requests on both sides means
            // the first one processed wins; the second is a no-op.
            return;
        }
        channel.remote_identity = Some(identity.clone());
        channel.state = ChannelLifecycle::Established;
        tracing::debug!(?channel_id, peer = %identity.peer_id, "channel established");
        outcome.newly_established.push(channel_id);
        if is_request {
            let local_identity = self.local_identity.clone();
            self.queue_send(channel_id, Envelope::EstablishResponse {
                identity: local_identity,
            });
        }
    }

    fn handle_directory_request(&mut self, channel_id: ChannelId) {
        let doc_ids = self
            .registry
            .visible_doc_ids(|doc_id| self.can(doc_id, channel_id, Operation::Reveal));
        self.queue_send(channel_id, Envelope::DirectoryResponse { doc_ids });
    }

    fn handle_directory_response(
        &mut self,
        channel_id: ChannelId,
        doc_ids: Vec<DocId>,
        outcome: &mut DispatchOutcome,
    ) {
        for doc_id in doc_ids {
            if self.registry.has(&doc_id) {
                continue;
            }
            if !self.can(&doc_id, channel_id, Operation::Create) {
                continue;
            }
            outcome.docs_to_probe.push(doc_id);
        }
    }

    fn handle_sync_request(
        &mut self,
        channel_id: ChannelId,
        docs: Vec<SyncRequestEntry>,
        bidirectional: bool,
        outcome: &mut DispatchOutcome,
    ) {
        for entry in docs {
            let doc_id = entry.doc_id;
            if !self.can(&doc_id, channel_id, Operation::Reveal) {
                self.queue_send(channel_id, Envelope::SyncResponse {
                    doc_id,
                    transmission: Transmission::Absent,
                    ephemeral: None,
                });
                continue;
            }
            if !self.registry.has(&doc_id) {
                if !self.can(&doc_id, channel_id, Operation::Create) {
                    self.queue_send(channel_id, Envelope::SyncResponse {
                        doc_id,
                        transmission: Transmission::Absent,
                        ephemeral: None,
                    });
                    continue;
                }
                self.registry
                    .get_or_create(&doc_id, || Box::new(default_doc(&self.local_identity)) as Box<dyn CrdtDocument>);
            }

            if let Some(bytes) = entry.ephemeral {
                self.apply_ephemeral(&doc_id, &bytes);
            }

            if let Some(ch) = self.channels.get_mut(channel_id) {
                ch.subscriptions.insert(doc_id.clone());
            }

            let (local_version, delta) = {
                let state = self.registry.get(&doc_id).expect("just created or present");
                let doc = state.doc.lock().unwrap();
                let version = doc.version();
                let delta = if entry.requester_version >= version {
                    None
                } else {
                    Some(doc.export(&entry.requester_version))
                };
                (version, delta)
            };

            if let Some(state) = self.registry.get_mut(&doc_id) {
                state.last_sent_version.insert(channel_id, local_version.clone());
            }

            let transmission = match delta {
                Some(update) => Transmission::Update {
                    version: local_version,
                    update,
                },
                None => Transmission::UpToDate {
                    version: local_version,
                },
            };
            self.queue_send(channel_id, Envelope::SyncResponse {
                doc_id: doc_id.clone(),
                transmission,
                ephemeral: None,
            });
            outcome.docs_changed.push(doc_id);
        }

        if bidirectional {
            self.probe_channel_for_known_docs(channel_id);
        }
    }

    fn handle_sync_response(
        &mut self,
        channel_id: ChannelId,
        doc_id: DocId,
        transmission: Transmission,
        ephemeral: Option<Vec<u8>>,
        outcome: &mut DispatchOutcome,
    ) {
        let remote_peer = self.channels.get(channel_id).and_then(|c| c.remote_identity.as_ref().map(|i| i.peer_id.clone()));

        match transmission {
            Transmission::Absent => {
                if let Some(peer) = &remote_peer {
                    self.knowledge_mut(&doc_id, peer).observe_absent();
                }
            }
            Transmission::UpToDate { version } => {
                if let Some(peer) = &remote_peer {
                    self.knowledge_mut(&doc_id, peer).observe_version(version);
                }
            }
            Transmission::Update { version, update } => {
                if !self.can(&doc_id, channel_id, Operation::Accept) {
                    tracing::debug!(%doc_id, "dropping sync-response update denied by local rules");
                    if let Some(peer) = &remote_peer {
                        self.knowledge_mut(&doc_id, peer).observe_version(version);
                    }
                    return;
                }
                if !self.registry.has(&doc_id) {
                    self.registry
                        .get_or_create(&doc_id, || Box::new(default_doc(&self.local_identity)) as Box<dyn CrdtDocument>);
                }
                if let Some(state) = self.registry.get(&doc_id) {
                    let mut doc = state.doc.lock().unwrap();
                    if let Err(err) = doc.import(&update) {
                        tracing::warn!(%doc_id, error = %err, "failed to import sync-response update");
                    }
                }
                if let Some(state) = self.registry.get_mut(&doc_id) {
                    state.is_new = false;
                }
                if let Some(peer) = &remote_peer {
                    self.knowledge_mut(&doc_id, peer).observe_version(version);
                }
            }
        }

        if let Some(bytes) = ephemeral {
            self.apply_ephemeral(&doc_id, &bytes);
        }
        if let Some(ch) = self.channels.get_mut(channel_id) {
            ch.subscriptions.insert(doc_id.clone());
        }
        outcome.docs_changed.push(doc_id);
    }

    fn handle_update(
        &mut self,
        channel_id: ChannelId,
        doc_id: DocId,
        update: Vec<u8>,
        version: VersionVector,
        ephemeral: Option<Vec<u8>>,
        outcome: &mut DispatchOutcome,
    ) {
        if !self.can(&doc_id, channel_id, Operation::Accept) {
            return;
        }
        if !self.registry.has(&doc_id) {
            if !self.can(&doc_id, channel_id, Operation::Create) {
                return;
            }
            self.registry
                .get_or_create(&doc_id, || Box::new(default_doc(&self.local_identity)) as Box<dyn CrdtDocument>);
        }
        if let Some(state) = self.registry.get(&doc_id) {
            let mut doc = state.doc.lock().unwrap();
            if let Err(err) = doc.import(&update) {
                tracing::warn!(%doc_id, error = %err, "failed to import update");
                return;
            }
        }
        if let Some(state) = self.registry.get_mut(&doc_id) {
            state.is_new = false;
        }
        let remote_peer = self.channels.get(channel_id).and_then(|c| c.remote_identity.as_ref().map(|i| i.peer_id.clone()));
        if let Some(peer) = remote_peer {
            self.knowledge_mut(&doc_id, &peer).observe_version(version);
        }
        if let Some(bytes) = ephemeral {
            self.apply_ephemeral(&doc_id, &bytes);
        }
        outcome.docs_changed.push(doc_id);
    }

    fn handle_ephemeral(&mut self, _channel_id: ChannelId, doc_id: DocId, ephemeral: Vec<u8>) {
        self.apply_ephemeral(&doc_id, &ephemeral);
    }

    fn handle_delete(&mut self, channel_id: ChannelId, doc_id: DocId, outcome: &mut DispatchOutcome) {
        if !self.can(&doc_id, channel_id, Operation::Delete) {
            return;
        }
        if self.registry.mark_deleted(&doc_id) {
            outcome.docs_changed.push(doc_id);
        }
    }

    fn apply_ephemeral(&mut self, doc_id: &DocId, bytes: &[u8]) {
        let Some(state) = self.registry.get(doc_id) else {
            return;
        };
        // The fallback store name used when no typed store is registered;
        // real callers register named stores through the Repo facade.
        if let Some(store) = state.ephemeral.get("default") {
            if let Err(err) = store.lock().unwrap().apply(bytes) {
                tracing::warn!(%doc_id, error = %err, "failed to apply ephemeral payload");
            }
        }
    }

    /// Sends a `sync-request` for every locally known, non-deleted document
    /// to `channel_id` — used for the reverse half of a bidirectional
    /// sync-request, without recursing (spec §4.4).
    fn probe_channel_for_known_docs(&mut self, channel_id: ChannelId) {
        let doc_ids: Vec<DocId> = self.registry.doc_ids().cloned().collect();
        let mut docs = Vec::new();
        for doc_id in doc_ids {
            if !self.registry.has(&doc_id) {
                continue;
            }
            if !self.can(&doc_id, channel_id, Operation::Reveal) {
                continue;
            }
            let requester_version = {
                let state = self.registry.get(&doc_id).unwrap();
                state.doc.lock().unwrap().version()
            };
            docs.push(SyncRequestEntry {
                doc_id: doc_id.clone(),
                requester_version,
                ephemeral: None,
            });
        }
        if !docs.is_empty() {
            self.queue_send(channel_id, Envelope::SyncRequest {
                docs,
                bidirectional: false,
            });
        }
    }

    /// Sends a fresh directory-request and a sync-request for every locally
    /// known document to a newly-established channel (spec §4.4's "first
    /// access triggers a directory/sync probe", generalized to run once per
    /// establishment rather than only on first `Repo::get`).
    pub fn probe_established_channel(&mut self, channel_id: ChannelId) {
        self.queue_send(channel_id, Envelope::DirectoryRequest);
        self.probe_channel_for_known_docs(channel_id);
    }

    /// Pushes a `sync-request` for `doc_id` to every established channel,
    /// called on first local access per spec §4.4.
    pub fn probe_doc(&mut self, doc_id: &DocId) {
        let channel_ids: Vec<ChannelId> = self.channels.established().map(|c| c.id).collect();
        let requester_version = self
            .registry
            .get(doc_id)
            .map(|s| s.doc.lock().unwrap().version())
            .unwrap_or_default();
        for channel_id in channel_ids {
            if !self.can(doc_id, channel_id, Operation::Reveal) {
                continue;
            }
            self.queue_send(channel_id, Envelope::SyncRequest {
                docs: vec![SyncRequestEntry {
                    doc_id: doc_id.clone(),
                    requester_version: requester_version.clone(),
                    ephemeral: None,
                }],
                bidirectional: true,
            });
        }
    }
}

fn default_doc(local_identity: &Identity) -> syncrepo_crdt::MapDoc {
    syncrepo_crdt::MapDoc::new(local_identity.peer_id.clone())
}

/// Side effects a caller (the [`crate::Synchronizer`]) needs to react to
/// after a dispatch call: which channels just finished establishing (so
/// their probes can be sent) and which documents may have new ready states.
#[derive(Default)]
pub struct DispatchOutcome {
    pub newly_established: Vec<ChannelId>,
    pub docs_to_probe: Vec<DocId>,
    pub docs_changed: Vec<DocId>,
}
