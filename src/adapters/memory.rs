//! An in-process [`Adapter`] for tests and single-process fan-out, plus an
//! [`InMemoryBridge`] that wires two started adapters together with a pair
//! of channels that deliver synchronously.

use crate::adapter::{Adapter, AdapterEvents};
use crate::channel::{ChannelKind, ChannelSink};
use crate::envelope::Envelope;
use crate::id::{AdapterId, ChannelId};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, OnceLock};

pub struct InMemoryAdapter {
    id: AdapterId,
    events: OnceLock<Arc<dyn AdapterEvents>>,
}

impl InMemoryAdapter {
    pub fn new(id: impl Into<AdapterId>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            events: OnceLock::new(),
        })
    }
}

#[async_trait]
impl Adapter for InMemoryAdapter {
    fn id(&self) -> AdapterId {
        self.id.clone()
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Network
    }

    async fn start(&self, events: Arc<dyn AdapterEvents>) -> anyhow::Result<()> {
        self.events
            .set(events)
            .map_err(|_| anyhow::anyhow!("InMemoryAdapter {} started twice", self.id))
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// `InMemoryAdapter::new` returns a shared handle (callers need it both to
/// pass to `Synchronizer::builder().adapter(..)` and to `InMemoryBridge`),
/// so `Arc<InMemoryAdapter>` itself implements [`Adapter`] by delegating.
#[async_trait]
impl Adapter for Arc<InMemoryAdapter> {
    fn id(&self) -> AdapterId {
        (**self).id()
    }

    fn kind(&self) -> ChannelKind {
        (**self).kind()
    }

    async fn start(&self, events: Arc<dyn AdapterEvents>) -> anyhow::Result<()> {
        (**self).start(events).await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        (**self).stop().await
    }
}

/// Forwards everything sent on one side directly into the peer's
/// `channel_receive`, tagged with the peer's own channel id.
///
/// A sink exists (and can already be sent on, via `channel_added`'s
/// establish-request) before [`InMemoryBridge::connect`] has allocated the
/// peer's channel id to wire it to. Anything sent in that window is queued
/// rather than dropped, and flushed in order once [`ForwardSink::wire`]
/// runs — a real socket would have buffered those same bytes on the wire.
struct ForwardSink {
    target_events: Arc<dyn AdapterEvents>,
    state: Mutex<ForwardState>,
}

enum ForwardState {
    Pending(Vec<Envelope>),
    Wired(ChannelId),
    Stopped,
}

impl ForwardSink {
    fn new(target_events: Arc<dyn AdapterEvents>) -> Self {
        Self {
            target_events,
            state: Mutex::new(ForwardState::Pending(Vec::new())),
        }
    }

    /// Wires this sink to the peer's channel id and flushes anything queued
    /// before both sides of the bridge were connected.
    fn wire(&self, channel_id: ChannelId) {
        let queued = {
            let mut state = self.state.lock().unwrap();
            match std::mem::replace(&mut *state, ForwardState::Wired(channel_id)) {
                ForwardState::Pending(queued) => queued,
                other => {
                    *state = other;
                    Vec::new()
                }
            }
        };
        for message in queued {
            self.target_events.channel_receive(channel_id, message);
        }
    }
}

impl ChannelSink for ForwardSink {
    fn send(&self, message: Envelope) {
        let ready = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                ForwardState::Wired(id) => Some((*id, message)),
                ForwardState::Pending(queued) => {
                    queued.push(message);
                    None
                }
                ForwardState::Stopped => None,
            }
        };
        if let Some((id, message)) = ready {
            self.target_events.channel_receive(id, message);
        }
    }

    fn stop(&self) {
        let previous = {
            let mut state = self.state.lock().unwrap();
            std::mem::replace(&mut *state, ForwardState::Stopped)
        };
        if let ForwardState::Wired(id) = previous {
            self.target_events.channel_removed(id);
        }
    }
}

/// Connects two already-started [`InMemoryAdapter`]s. `remote_hint`
/// identifies the logical link: calling `connect` again with the same hint
/// for the same pair supersedes the previous channel on each side, the way
/// a real transport's reconnect would (spec §4.1, §8 scenario 4).
pub struct InMemoryBridge;

impl InMemoryBridge {
    pub fn connect(a: &Arc<InMemoryAdapter>, b: &Arc<InMemoryAdapter>, remote_hint: impl Into<String>) {
        let hint = remote_hint.into();
        let events_a = a
            .events
            .get()
            .expect("InMemoryAdapter must be started before connecting")
            .clone();
        let events_b = b
            .events
            .get()
            .expect("InMemoryAdapter must be started before connecting")
            .clone();

        let sink_a = Arc::new(ForwardSink::new(events_b.clone()));
        let sink_b = Arc::new(ForwardSink::new(events_a.clone()));

        // Each `channel_added` call immediately fires an establish-request
        // through the sink just passed in (spec §4.1), before the other
        // side's channel id even exists yet — those first frames land in
        // `ForwardSink::state`'s pending queue and get flushed below once
        // both sides are wired, instead of being silently dropped.
        let channel_id_a = events_a.channel_added(a.id(), ChannelKind::Network, Some(hint.clone()), sink_a.clone());
        let channel_id_b = events_b.channel_added(b.id(), ChannelKind::Network, Some(hint), sink_b.clone());

        sink_a.wire(channel_id_b);
        sink_b.wire(channel_id_a);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{Identity, IdentityType};
    use crate::{PeerId, Synchronizer};
    use std::time::Duration;

    fn identity(name: &str) -> Identity {
        Identity::new(PeerId::new(name), name, IdentityType::User)
    }

    #[tokio::test]
    async fn bridged_adapters_establish_and_sync() {
        let adapter_a = InMemoryAdapter::new("a");
        let adapter_b = InMemoryAdapter::new("b");

        let sync_a = Synchronizer::builder()
            .identity(identity("alice"))
            .adapter(adapter_a.clone())
            .build();
        let sync_b = Synchronizer::builder()
            .identity(identity("bob"))
            .adapter(adapter_b.clone())
            .build();

        sync_a.start().await.unwrap();
        sync_b.start().await.unwrap();
        InMemoryBridge::connect(&adapter_a, &adapter_b, "a-b");

        let doc = sync_a.get_or_create_doc(&crate::DocId::from("d1"));
        doc.lock()
            .unwrap()
            .as_any_mut()
            .downcast_mut::<syncrepo_crdt::MapDoc>()
            .unwrap()
            .set_text("title", "Hello");
        drop(doc);

        let doc_id = crate::DocId::from("d1");
        sync_b
            .wait_until_ready(&doc_id, None, |_| sync_b.has(&doc_id), Duration::from_secs(5), None)
            .await
            .unwrap();
    }
}
