//! The adapter contract (spec §4.1): a transport-agnostic boundary. Concrete
//! adapters (in-memory, WebSocket, storage) implement [`Adapter`]; the
//! [`AdapterEvents`] callbacks are how they report channel lifecycle and
//! inbound messages back up to the [`crate::Synchronizer`].
//!
//! Spec §4.1 names four upward callbacks: `onChannelAdded`, `onChannelRemoved`,
//! `onChannelReceive`, `onChannelEstablish`. The fourth is derived rather
//! than adapter-driven here: establishment is a handshake the Synchronizer's
//! own channel state machine completes by processing `establish-request`/
//! `establish-response` envelopes it receives through `channel_receive`, so
//! there's no separate callback registration for it — same observable
//! transition, one fewer moving part.

use crate::channel::{ChannelKind, ChannelSink};
use crate::envelope::Envelope;
use crate::id::{AdapterId, ChannelId};
use async_trait::async_trait;
use std::sync::Arc;

/// A transport. `start`/`stop` bracket the adapter's lifetime; everything
/// else happens through the [`AdapterEvents`] handle it's given at start.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn id(&self) -> AdapterId;

    /// The kind of channel this adapter produces (spec §4.1's `network` vs
    /// `storage`), so `waitUntilReady`'s `kind` filter can tell whether any
    /// adapter could ever satisfy it (spec §7's `NoAdaptersError`: "called
    /// with a `kind` for which no adapter is registered").
    fn kind(&self) -> ChannelKind;

    /// Begin discovering/accepting channels, reporting them through `events`.
    async fn start(&self, events: Arc<dyn AdapterEvents>) -> anyhow::Result<()>;

    /// Stop discovering new channels and release transport resources. Must
    /// not assume already-open channels are closed; the Synchronizer closes
    /// those explicitly via each channel's `stop`.
    async fn stop(&self) -> anyhow::Result<()>;
}

/// The upward half of the adapter contract. Adapters are handed an
/// `Arc<dyn AdapterEvents>` and hold only that — never a direct reference to
/// the Synchronizer — so a slow or leaked adapter can't keep the
/// Synchronizer itself alive (spec §9).
pub trait AdapterEvents: Send + Sync {
    /// A new channel has been opened by this adapter. `remote_hint`, when
    /// known, identifies the logical remote so a reconnect can supersede the
    /// previous channel (spec §4.1's at-most-once policy). Returns the
    /// allocated [`ChannelId`] the adapter should tag subsequent events with.
    fn channel_added(
        &self,
        adapter_id: AdapterId,
        kind: ChannelKind,
        remote_hint: Option<String>,
        sink: Arc<dyn ChannelSink>,
    ) -> ChannelId;

    /// The channel is gone; idempotent (a second removal of the same id is a
    /// no-op).
    fn channel_removed(&self, channel_id: ChannelId);

    /// An envelope arrived on an existing channel.
    fn channel_receive(&self, channel_id: ChannelId, envelope: Envelope);
}
