//! The rules engine (spec §4.3): pure predicate hooks composed into gating
//! decisions. A denial is never distinguishable from absence on the wire —
//! callers see a document that simply never syncs, never a rejection.

use crate::id::{AdapterId, ChannelId, Identity};
use crate::channel::ChannelKind;
use crate::DocId;

/// The operation a rule hook is being asked to gate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    Reveal,
    Accept,
    Create,
    Delete,
}

/// Enough of a channel's identity for a rule to reason about, without
/// borrowing the live [`crate::channel::ChannelRecord`].
#[derive(Clone, Debug)]
pub struct ChannelContext {
    pub channel_id: ChannelId,
    pub adapter_id: AdapterId,
    pub kind: ChannelKind,
}

/// Everything a predicate hook needs to decide (spec §4.3).
#[derive(Clone, Debug)]
pub struct RuleContext<'a> {
    pub doc_id: &'a DocId,
    pub channel: Option<&'a ChannelContext>,
    pub remote_identity: Option<&'a Identity>,
    pub local_identity: &'a Identity,
    pub operation: Operation,
}

/// A single predicate hook. Implementors answer one question; composition
/// happens in [`Rules`]/[`ComposedRules`], never inside a single hook.
pub trait Rules: Send + Sync {
    /// May this document's existence/content be revealed to the remote
    /// identity in `ctx` (directory listing, sync-response)?
    fn can_reveal(&self, ctx: &RuleContext<'_>) -> bool {
        let _ = ctx;
        true
    }

    /// May an incoming update/delete from the remote identity in `ctx` be
    /// applied locally?
    fn can_accept(&self, ctx: &RuleContext<'_>) -> bool {
        let _ = ctx;
        true
    }

    /// May a document unknown locally be created as a side effect of this
    /// operation (e.g. an inbound sync-request for an unseen doc id)?
    fn can_create(&self, ctx: &RuleContext<'_>) -> bool {
        let _ = ctx;
        true
    }

    /// May a local tombstone be applied for this document?
    fn can_delete(&self, ctx: &RuleContext<'_>) -> bool {
        let _ = ctx;
        true
    }
}

/// The default rule set: every operation is allowed. Matches a single-user,
/// trust-everyone deployment.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Rules for AllowAll {}

/// Composes several [`Rules`] implementations with AND semantics: an
/// operation is allowed only if every hook allows it. An empty composition
/// behaves like [`AllowAll`].
#[derive(Default)]
pub struct ComposedRules(Vec<Box<dyn Rules>>);

impl ComposedRules {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(mut self, rules: impl Rules + 'static) -> Self {
        self.0.push(Box::new(rules));
        self
    }
}

impl Rules for ComposedRules {
    fn can_reveal(&self, ctx: &RuleContext<'_>) -> bool {
        self.0.iter().all(|r| r.can_reveal(ctx))
    }

    fn can_accept(&self, ctx: &RuleContext<'_>) -> bool {
        self.0.iter().all(|r| r.can_accept(ctx))
    }

    fn can_create(&self, ctx: &RuleContext<'_>) -> bool {
        self.0.iter().all(|r| r.can_create(ctx))
    }

    fn can_delete(&self, ctx: &RuleContext<'_>) -> bool {
        self.0.iter().all(|r| r.can_delete(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::IdentityType;
    use crate::PeerId;

    struct DenyEverything;
    impl Rules for DenyEverything {
        fn can_reveal(&self, _: &RuleContext<'_>) -> bool {
            false
        }
    }

    fn identity() -> Identity {
        Identity::new(PeerId::new("p"), "p", IdentityType::User)
    }

    #[test]
    fn composed_rules_is_conjunction() {
        let identity = identity();
        let doc_id = DocId::from("d1");
        let ctx = RuleContext {
            doc_id: &doc_id,
            channel: None,
            remote_identity: Some(&identity),
            local_identity: &identity,
            operation: Operation::Reveal,
        };
        let composed = ComposedRules::new().push(AllowAll).push(DenyEverything);
        assert!(!composed.can_reveal(&ctx));
        assert!(composed.can_accept(&ctx));
    }
}
