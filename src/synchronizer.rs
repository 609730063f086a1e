//! The Synchronizer (spec §4.5): owns every adapter, the channel directory,
//! the document registry, and the rules engine; routes every inbound event
//! through [`crate::sync_engine::SyncState::dispatch`] behind one mutex, so
//! no two handlers ever observe interleaved intermediate state (spec §5).

use crate::adapter::{Adapter, AdapterEvents};
use crate::channel::{ChannelKind, ChannelSink};
use crate::envelope::Envelope;
use crate::error::SyncError;
use crate::id::{AdapterId, ChannelId, Identity};
use crate::ready::ReadyStates;
use crate::rules::Rules;
use crate::sync_engine::SyncState;
use crate::DocId;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use syncrepo_crdt::{CrdtDocument, EphemeralStore};
use tokio::sync::{broadcast, mpsc, watch};

/// The ephemeral store name the [`crate::Repo`]/[`Synchronizer`] facade
/// operates on. Multiple named stores are supported internally (see
/// [`crate::registry::DocumentState::ephemeral`]) but only this one is wired
/// to local-change fan-out and to inbound `sync-request`/`sync-response`
/// piggybacks (spec §4.5, §6.2).
const DEFAULT_EPHEMERAL_STORE: &str = "default";

/// A ready-state change, broadcast after every dispatch that might have
/// altered one (used internally by [`Synchronizer::wait_until_ready`] to
/// wake up and recheck its predicate without busy-polling).
#[derive(Clone, Debug)]
pub struct ReadyStateChanged {
    pub doc_id: DocId,
}

struct Inner {
    state: Mutex<SyncState>,
    adapters: Mutex<Vec<Arc<dyn Adapter>>>,
    ready_tx: broadcast::Sender<ReadyStateChanged>,
    local_update_tx: mpsc::UnboundedSender<DocId>,
    local_ephemeral_tx: mpsc::UnboundedSender<DocId>,
    /// Fires once when [`Synchronizer::stop`] runs, aborting any in-flight
    /// `wait_until_ready` call (spec §5: "Adapter stop cancels pending waits
    /// with an abort").
    stop_tx: watch::Sender<bool>,
}

/// The orchestrator described in spec §4.5. Cheaply cloneable; every clone
/// shares the same underlying state.
#[derive(Clone)]
pub struct Synchronizer(Arc<Inner>);

/// Builds a [`Synchronizer`] with a local identity, a rules engine, and zero
/// or more adapters (spec §6.4's `Repo.builder()` surface, generalized: the
/// Synchronizer is what `Repo` wraps).
pub struct SynchronizerBuilder {
    identity: Option<Identity>,
    rules: Box<dyn Rules>,
    adapters: Vec<Arc<dyn Adapter>>,
}

impl Default for SynchronizerBuilder {
    fn default() -> Self {
        Self {
            identity: None,
            rules: Box::new(crate::rules::AllowAll),
            adapters: Vec::new(),
        }
    }
}

impl SynchronizerBuilder {
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn rules(mut self, rules: impl Rules + 'static) -> Self {
        self.rules = Box::new(rules);
        self
    }

    pub fn adapter(mut self, adapter: impl Adapter + 'static) -> Self {
        self.adapters.push(Arc::new(adapter));
        self
    }

    pub fn build(self) -> Synchronizer {
        let identity = self.identity.unwrap_or_else(|| {
            Identity::new(
                crate::PeerId::new(uuid::Uuid::new_v4().to_string()),
                "anonymous",
                crate::id::IdentityType::User,
            )
        });
        let (ready_tx, _) = broadcast::channel(256);
        let (local_update_tx, local_update_rx) = mpsc::unbounded_channel();
        let (local_ephemeral_tx, local_ephemeral_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            state: Mutex::new(SyncState::new(identity, self.rules)),
            adapters: Mutex::new(self.adapters),
            ready_tx,
            local_update_tx,
            local_ephemeral_tx,
            stop_tx,
        });
        let synchronizer = Synchronizer(inner);
        synchronizer.spawn_local_update_loop(local_update_rx);
        synchronizer.spawn_local_ephemeral_loop(local_ephemeral_rx);
        synchronizer
    }
}

/// Delivers every queued envelope. Callers must have already released
/// `state`'s lock: a sink's `send` may re-enter synchronously (spec
/// §5/§9's in-memory test transport), and `SyncState`'s mutex isn't
/// reentrant.
fn flush_sends(pending: Vec<(Arc<dyn ChannelSink>, Envelope)>) {
    for (sink, envelope) in pending {
        sink.send(envelope);
    }
}

impl Synchronizer {
    pub fn builder() -> SynchronizerBuilder {
        SynchronizerBuilder::default()
    }

    /// Starts every registered adapter, handing each a weak event sink.
    pub async fn start(&self) -> anyhow::Result<()> {
        let adapters = self.0.adapters.lock().unwrap().clone();
        let sink: Arc<dyn AdapterEvents> = Arc::new(EventSink(Arc::downgrade(&self.0)));
        for adapter in adapters {
            adapter.start(sink.clone()).await?;
        }
        Ok(())
    }

    /// Stops every registered adapter and aborts any in-flight
    /// `wait_until_ready` call with [`SyncError::Aborted`] (spec §5).
    pub async fn stop(&self) -> anyhow::Result<()> {
        let adapters = self.0.adapters.lock().unwrap().clone();
        for adapter in adapters {
            adapter.stop().await?;
        }
        let _ = self.0.stop_tx.send(true);
        Ok(())
    }

    pub fn has(&self, doc_id: &DocId) -> bool {
        self.0.state.lock().unwrap().registry.has(doc_id)
    }

    /// Returns (creating locally if necessary) the document, and sends a
    /// sync-request probe to every established channel (spec §4.4: "first
    /// access triggers a directory/sync probe").
    pub fn get_or_create_doc(&self, doc_id: &DocId) -> Arc<Mutex<Box<dyn CrdtDocument>>> {
        let (handle, pending) = {
            let mut state = self.0.state.lock().unwrap();
            let local_identity = state.local_identity.clone();
            let (doc_state, created) = state.registry.get_or_create(doc_id, move || {
                Box::new(syncrepo_crdt::MapDoc::new(local_identity.peer_id)) as Box<dyn CrdtDocument>
            });
            let handle = doc_state.doc.clone();
            if created {
                self.register_local_update_hook(doc_id, &handle);
            }
            state.probe_doc(doc_id);
            (handle, state.take_pending_sends())
        };
        flush_sends(pending);
        handle
    }

    /// Wires the document's `subscribe_local_updates` callback to enqueue a
    /// fan-out job rather than fanning out inline: the callback fires while
    /// the caller's mutation is still on the stack (still holding `handle`'s
    /// lock), so it can't safely re-lock the same document to compute an
    /// export delta. Handing the doc id to the unbounded channel here and
    /// doing the real work in [`Synchronizer::fan_out_local_update`] avoids
    /// that reentrancy. The subscription is kept alive for the document's
    /// full lifetime, so the handle is deliberately leaked rather than
    /// dropped (which would cancel it).
    fn register_local_update_hook(&self, doc_id: &DocId, handle: &Arc<Mutex<Box<dyn CrdtDocument>>>) {
        let tx = self.0.local_update_tx.clone();
        let doc_id = doc_id.clone();
        let mut doc = handle.lock().unwrap();
        let unsubscribe = doc.subscribe_local_updates(Box::new(move || {
            let _ = tx.send(doc_id.clone());
        }));
        std::mem::forget(unsubscribe);
    }

    /// Returns the document's default ephemeral (presence) store, creating
    /// both the document and the store if this is the first local access
    /// (spec §4.5, §6.2). Local changes made through it are fanned out to
    /// every subscribed channel the same way CRDT updates are.
    pub fn get_or_create_ephemeral(&self, doc_id: &DocId) -> Arc<Mutex<Box<dyn EphemeralStore>>> {
        let (doc_handle, doc_created, store, store_created) = {
            let mut state = self.0.state.lock().unwrap();
            let local_identity = state.local_identity.clone();
            let (doc_state, doc_created) = state.registry.get_or_create(doc_id, move || {
                Box::new(syncrepo_crdt::MapDoc::new(local_identity.peer_id)) as Box<dyn CrdtDocument>
            });
            let doc_handle = doc_state.doc.clone();
            let (store, store_created) = doc_state.get_or_create_ephemeral(DEFAULT_EPHEMERAL_STORE, || {
                Box::new(syncrepo_crdt::MapEphemeralStore::new()) as Box<dyn EphemeralStore>
            });
            (doc_handle, doc_created, store, store_created)
        };
        if doc_created {
            self.register_local_update_hook(doc_id, &doc_handle);
        }
        if store_created {
            self.register_local_ephemeral_hook(doc_id, &store);
        }
        if doc_created {
            let pending = {
                let mut state = self.0.state.lock().unwrap();
                state.probe_doc(doc_id);
                state.take_pending_sends()
            };
            flush_sends(pending);
        }
        store
    }

    /// Wires an ephemeral store's `subscribe` callback the same way
    /// [`Synchronizer::register_local_update_hook`] wires a document's: the
    /// callback fires synchronously while the caller's mutation is still on
    /// the stack, so it only enqueues a fan-out job rather than doing the
    /// work inline.
    fn register_local_ephemeral_hook(&self, doc_id: &DocId, handle: &Arc<Mutex<Box<dyn EphemeralStore>>>) {
        let tx = self.0.local_ephemeral_tx.clone();
        let doc_id = doc_id.clone();
        let mut store = handle.lock().unwrap();
        let unsubscribe = store.subscribe(Box::new(move || {
            let _ = tx.send(doc_id.clone());
        }));
        std::mem::forget(unsubscribe);
    }

    pub async fn delete(&self, doc_id: &DocId) -> Result<(), SyncError> {
        let marked = {
            let mut state = self.0.state.lock().unwrap();
            state.registry.mark_deleted(doc_id)
        };
        if !marked {
            return Err(SyncError::NotFound(doc_id.clone()));
        }
        let sinks: Vec<Arc<dyn ChannelSink>> = {
            let state = self.0.state.lock().unwrap();
            state.channels.established().map(|c| c.sink_handle()).collect()
        };
        for sink in sinks {
            sink.send(Envelope::Delete {
                doc_id: doc_id.clone(),
            });
        }
        self.notify_ready_changed(doc_id.clone());
        Ok(())
    }

    pub fn ready_states(&self, doc_id: &DocId) -> ReadyStates {
        self.0.state.lock().unwrap().ready_states(doc_id)
    }

    /// Debug introspection (spec §9 supplement): a snapshot of every known
    /// document, its deletion/ephemeral bookkeeping, and every channel.
    pub fn snapshot(&self) -> SynchronizerSnapshot {
        let state = self.0.state.lock().unwrap();
        SynchronizerSnapshot {
            doc_ids: state.registry.doc_ids().cloned().collect(),
            channel_count: state.channels.iter().count(),
            established_channel_count: state.channels.established().count(),
        }
    }

    /// Blocks until `predicate` is satisfied for `doc_id`'s ready states
    /// (optionally restricted to channels of `kind`), or `timeout` elapses,
    /// or `cancel` fires, or [`Synchronizer::stop`] runs — whichever comes
    /// first (spec §6.4's `waitForSync({kind?, timeout?, signal?})`).
    pub async fn wait_until_ready(
        &self,
        doc_id: &DocId,
        kind: Option<ChannelKind>,
        predicate: impl Fn(&ReadyStates) -> bool,
        timeout: Duration,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<(), SyncError> {
        let adapters_cover_kind = self
            .0
            .adapters
            .lock()
            .unwrap()
            .iter()
            .any(|a| kind.map_or(true, |k| a.kind() == k));
        if !adapters_cover_kind {
            return Err(SyncError::NoAdapters);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut ready_rx = self.0.ready_tx.subscribe();
        let mut stop_rx = self.0.stop_tx.subscribe();
        let mut cancel_rx = cancel;

        loop {
            let states = self.ready_states_for_kind(doc_id, kind);
            if predicate(&states) {
                return Ok(());
            }
            if *stop_rx.borrow() {
                return Err(SyncError::Aborted(doc_id.clone()));
            }
            if cancel_rx.as_ref().is_some_and(|rx| *rx.borrow()) {
                return Err(SyncError::Aborted(doc_id.clone()));
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(SyncError::SyncTimeout {
                    doc_id: doc_id.clone(),
                    ready_states: states,
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(remaining) => {
                    let states = self.ready_states_for_kind(doc_id, kind);
                    if predicate(&states) {
                        return Ok(());
                    }
                    return Err(SyncError::SyncTimeout { doc_id: doc_id.clone(), ready_states: states });
                }
                _ = stop_rx.changed() => continue,
                changed = async {
                    match cancel_rx.as_mut() {
                        Some(rx) => rx.changed().await,
                        None => std::future::pending().await,
                    }
                } => {
                    if changed.is_err() {
                        continue;
                    }
                    continue;
                }
                recv = ready_rx.recv() => {
                    match recv {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => continue,
                    }
                }
            }
        }
    }

    /// [`Synchronizer::ready_states`] filtered to peers reachable over a
    /// channel of `kind`, when one is given (spec §6.4's `waitForSync`
    /// `kind` filter). A peer with no channel of that kind drops out
    /// entirely rather than reporting a status earned over a different
    /// kind of channel.
    fn ready_states_for_kind(&self, doc_id: &DocId, kind: Option<ChannelKind>) -> ReadyStates {
        let states = self.ready_states(doc_id);
        let Some(kind) = kind else {
            return states;
        };
        states
            .into_iter()
            .filter_map(|mut peer| {
                peer.channels.retain(|c| c.kind == kind);
                if peer.channels.is_empty() {
                    None
                } else {
                    Some(peer)
                }
            })
            .collect()
    }

    fn notify_ready_changed(&self, doc_id: DocId) {
        let _ = self.0.ready_tx.send(ReadyStateChanged { doc_id });
    }

    fn spawn_local_update_loop(&self, mut rx: mpsc::UnboundedReceiver<DocId>) {
        let weak = Arc::downgrade(&self.0);
        tokio::spawn(async move {
            while let Some(doc_id) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                Synchronizer(inner).fan_out_local_update(&doc_id);
            }
        });
    }

    /// Sends an incremental update (plus any pending ephemeral snapshot) to
    /// every channel subscribed to `doc_id`. Runs on a fresh lock of the
    /// document, decoupled from whatever call triggered the local commit, so
    /// there's no risk of re-entering a lock already held by the caller.
    fn fan_out_local_update(&self, doc_id: &DocId) {
        let mut state = self.0.state.lock().unwrap();
        // A local mutation is the document's own first-class "it's ours
        // now" signal (registry.rs's `is_new` doc comment), independent of
        // whether any channel happens to be subscribed yet.
        if let Some(doc_state) = state.registry.get_mut(doc_id) {
            doc_state.is_new = false;
        }
        let channel_ids: Vec<ChannelId> = state
            .channels
            .established_subscribed_to(doc_id)
            .map(|c| c.id)
            .collect();
        if channel_ids.is_empty() {
            return;
        }
        let Some(doc_state) = state.registry.get(doc_id) else {
            return;
        };
        let (version, ephemeral) = {
            let doc = doc_state.doc.lock().unwrap();
            let version = doc.version();
            let ephemeral = doc_state
                .ephemeral
                .get("default")
                .map(|store| store.lock().unwrap().encode());
            (version, ephemeral)
        };
        let mut sends = Vec::with_capacity(channel_ids.len());
        for channel_id in channel_ids {
            let since = state
                .registry
                .get(doc_id)
                .and_then(|d| d.last_sent_version.get(&channel_id).cloned())
                .unwrap_or_default();
            let update = {
                let doc_state = state.registry.get(doc_id).unwrap();
                let doc = doc_state.doc.lock().unwrap();
                doc.export(&since)
            };
            if let Some(doc_state) = state.registry.get_mut(doc_id) {
                doc_state
                    .last_sent_version
                    .insert(channel_id, version.clone());
            }
            if let Some(channel) = state.channels.get(channel_id) {
                sends.push((
                    channel.sink_handle(),
                    Envelope::Update {
                        doc_id: doc_id.clone(),
                        update,
                        version: version.clone(),
                        ephemeral: ephemeral.clone(),
                    },
                ));
            }
        }
        drop(state);
        for (sink, envelope) in sends {
            sink.send(envelope);
        }
        self.notify_ready_changed(doc_id.clone());
    }

    fn spawn_local_ephemeral_loop(&self, mut rx: mpsc::UnboundedReceiver<DocId>) {
        let weak = Arc::downgrade(&self.0);
        tokio::spawn(async move {
            while let Some(doc_id) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                Synchronizer(inner).fan_out_local_ephemeral(&doc_id);
            }
        });
    }

    /// Sends the default ephemeral store's current snapshot to every channel
    /// subscribed to `doc_id`, as a standalone `channel/ephemeral` envelope
    /// (spec §4.5). This is the fallback path for presence-only changes; a
    /// concurrent CRDT update instead piggybacks the snapshot on its own
    /// `Update` envelope via [`Synchronizer::fan_out_local_update`].
    fn fan_out_local_ephemeral(&self, doc_id: &DocId) {
        let state = self.0.state.lock().unwrap();
        let channel_ids: Vec<ChannelId> = state
            .channels
            .established_subscribed_to(doc_id)
            .map(|c| c.id)
            .collect();
        if channel_ids.is_empty() {
            return;
        }
        let Some(doc_state) = state.registry.get(doc_id) else {
            return;
        };
        let Some(store) = doc_state.ephemeral.get(DEFAULT_EPHEMERAL_STORE) else {
            return;
        };
        let bytes = store.lock().unwrap().encode();
        let sends: Vec<(Arc<dyn ChannelSink>, Envelope)> = channel_ids
            .into_iter()
            .filter_map(|channel_id| {
                state.channels.get(channel_id).map(|c| {
                    (
                        c.sink_handle(),
                        Envelope::Ephemeral {
                            doc_id: doc_id.clone(),
                            ephemeral: bytes.clone(),
                        },
                    )
                })
            })
            .collect();
        drop(state);
        for (sink, envelope) in sends {
            sink.send(envelope);
        }
    }
}

/// A debug-only snapshot of synchronizer state (spec §9 supplement).
#[derive(Clone, Debug)]
pub struct SynchronizerSnapshot {
    pub doc_ids: Vec<DocId>,
    pub channel_count: usize,
    pub established_channel_count: usize,
}

/// Implements [`AdapterEvents`] over a weak reference, so adapters can't
/// keep the Synchronizer alive past its own lifetime (spec §9).
struct EventSink(Weak<Inner>);

impl AdapterEvents for EventSink {
    fn channel_added(
        &self,
        adapter_id: AdapterId,
        kind: ChannelKind,
        remote_hint: Option<String>,
        sink: Arc<dyn ChannelSink>,
    ) -> ChannelId {
        let Some(inner) = self.0.upgrade() else {
            // Synchronizer is gone; tell the adapter to tear the channel
            // back down immediately.
            sink.stop();
            return ChannelId::INVALID;
        };
        let (id, stale, new_sink_handle) = {
            let mut state = inner.state.lock().unwrap();
            let (id, stale) = state.channels.allocate(adapter_id, kind, remote_hint, sink);
            let new_sink_handle = state.channels.get(id).map(|c| c.sink_handle());
            (id, stale, new_sink_handle)
        };
        if let Some(stale) = stale {
            tracing::debug!(channel_id = ?stale.id, "superseding stale channel on reconnect");
            stale.stop();
        }
        // First envelope on any freshly opened channel is the identity
        // handshake (spec §4.1); directory/sync probing waits for the
        // handshake to complete (see `handle_establish`'s `newly_established`).
        // Sent after releasing the state lock: a fast in-memory transport
        // may deliver this synchronously and round-trip a reply straight
        // back in, which would deadlock on a lock we were still holding.
        if let Some(sink_handle) = new_sink_handle {
            let local_identity = inner.state.lock().unwrap().local_identity.clone();
            sink_handle.send(Envelope::EstablishRequest {
                identity: local_identity,
            });
        }
        id
    }

    fn channel_removed(&self, channel_id: ChannelId) {
        let Some(inner) = self.0.upgrade() else { return };
        inner.state.lock().unwrap().channels.remove(channel_id);
    }

    fn channel_receive(&self, channel_id: ChannelId, envelope: Envelope) {
        let Some(inner) = self.0.upgrade() else { return };
        let synchronizer = Synchronizer(inner);
        let (outcome, pending) = {
            let mut state = synchronizer.0.state.lock().unwrap();
            let outcome = state.dispatch(channel_id, envelope);
            let pending = state.take_pending_sends();
            (outcome, pending)
        };
        flush_sends(pending);
        for established in &outcome.newly_established {
            synchronizer.probe_channel(*established);
        }
        for doc_id in &outcome.docs_to_probe {
            let pending = {
                let mut state = synchronizer.0.state.lock().unwrap();
                state.probe_doc(doc_id);
                state.take_pending_sends()
            };
            flush_sends(pending);
        }
        for doc_id in outcome
            .docs_changed
            .into_iter()
            .chain(outcome.docs_to_probe)
        {
            synchronizer.notify_ready_changed(doc_id);
        }
    }
}

impl Synchronizer {
    fn probe_channel(&self, channel_id: ChannelId) {
        let pending = {
            let mut state = self.0.state.lock().unwrap();
            state.probe_established_channel(channel_id);
            state.take_pending_sends()
        };
        flush_sends(pending);
    }
}
