//! The CRDT backend contract consumed by `syncrepo`.
//!
//! This crate is deliberately thin. The synchronization core treats the
//! document format, its version vector, and its update encoding as opaque
//! (spec §6.2); everything here exists so the core has something concrete
//! to compile and test against, not as a general-purpose CRDT library.
//!
//! [`CrdtDocument`] is the trait boundary a real backend (an embedded
//! Automerge/Loro document, a Yjs document via `yrs`, ...) would implement.
//! [`MapDoc`] is a reference implementation: a flat map of named fields,
//! each either a last-writer-wins text register or a commutative counter,
//! good enough to drive the convergence scenarios in spec §8 but not meant
//! for production use.

mod ephemeral;
mod id;
mod mapdoc;
mod version;

pub use ephemeral::{EphemeralStore, MapEphemeralStore};
pub use id::PeerId;
pub use mapdoc::MapDoc;
pub use version::VersionVector;

/// A handle that cancels a subscription when dropped or explicitly invoked.
pub struct Unsubscribe(Option<Box<dyn FnOnce() + Send>>);

impl Unsubscribe {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    /// Explicitly cancel the subscription. Equivalent to dropping the handle.
    pub fn cancel(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// The CRDT backend contract from spec §6.2.
///
/// Implementations own their own mutation serialization; `syncrepo` never
/// mutates two documents concurrently from different tasks (spec §5), but
/// it does hold `&mut` across awaits, so this trait is synchronous.
pub trait CrdtDocument: Send + std::any::Any {
    /// The document's current version vector.
    fn version(&self) -> VersionVector;

    /// The delta needed to bring a peer at `since` up to the current version.
    fn export(&self, since: &VersionVector) -> Vec<u8>;

    /// Applies a remote delta produced by [`CrdtDocument::export`].
    fn import(&mut self, bytes: &[u8]) -> anyhow::Result<()>;

    /// True iff the document has never had a local or remote op applied.
    fn is_empty(&self) -> bool;

    /// Registers a callback fired synchronously after every local commit
    /// (i.e. after a mutation made through this document's own API, not
    /// after `import`). Returns a handle that cancels the subscription.
    fn subscribe_local_updates(&mut self, cb: Box<dyn FnMut() + Send>) -> Unsubscribe;

    /// Lets callers downcast back to a concrete backend (e.g. [`MapDoc`])
    /// when they need backend-specific mutation APIs beyond this trait.
    fn as_any(&self) -> &dyn std::any::Any;

    /// Mutable counterpart of [`CrdtDocument::as_any`].
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}
