//! A transport-agnostic peer-to-peer CRDT document synchronization core.
//!
//! The crate is organized around five collaborating components: the
//! [`Adapter`] contract a transport implements, the [`channel`] directory
//! and state machine an adapter's channels live in, the [`registry`] of
//! known documents, the [`sync_engine`] that speaks the wire protocol
//! (`envelope`), and the [`Synchronizer`] that owns all of it and the
//! [`Repo`] facade applications actually call.
//!
//! The CRDT document format itself is an external contract
//! ([`syncrepo_crdt::CrdtDocument`]); this crate never inspects document
//! content beyond version vectors and opaque update bytes.

pub mod adapter;
pub mod adapters;
pub mod channel;
pub mod envelope;
pub mod error;
mod id;
pub mod ready;
pub mod registry;
pub mod repo;
pub mod rules;
mod sync_engine;
pub mod synchronizer;

pub use adapter::{Adapter, AdapterEvents};
pub use channel::{ChannelKind, ChannelSink};
pub use envelope::Envelope;
pub use error::SyncError;
pub use id::{AdapterId, ChannelId, DocId, Identity, IdentityType};
pub use ready::{PeerReadyState, ReadyStates, ReadyStatus};
pub use repo::{Doc, Ephemeral, Repo};
pub use rules::{AllowAll, ComposedRules, Operation, RuleContext, Rules};
pub use synchronizer::{Synchronizer, SynchronizerBuilder, SynchronizerSnapshot};
pub use syncrepo_crdt::PeerId;
