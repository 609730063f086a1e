//! [`MapDoc`]: a reference [`CrdtDocument`] good enough to exercise
//! `syncrepo`'s sync protocol end to end, not a production CRDT.
//!
//! Two field kinds, each with a commutative, idempotent, associative merge
//! (the join-semilattice property every real CRDT needs):
//!
//! - `Text` fields are last-writer-wins, broken by `(counter, actor)` so
//!   the winner is deterministic regardless of delivery order.
//! - `Counter` fields are PN-counters: each actor's own running total is
//!   tracked separately and the value is their sum, so concurrent
//!   increments from different peers always converge by addition rather
//!   than one clobbering the other.

use crate::{CrdtDocument, PeerId, Unsubscribe, VersionVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Serialize, Deserialize)]
enum FieldOp {
    SetText { field: String, value: String },
    IncCounter { field: String, delta: i64 },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StampedOp {
    actor: PeerId,
    counter: u64,
    op: FieldOp,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
struct Update {
    ops: Vec<StampedOp>,
}

#[derive(Clone, Debug)]
struct TextField {
    value: String,
    winner: (u64, PeerId),
}

#[derive(Clone, Debug, Default)]
struct CounterField {
    per_actor: BTreeMap<PeerId, i64>,
}

impl CounterField {
    fn total(&self) -> i64 {
        self.per_actor.values().sum()
    }
}

pub struct MapDoc {
    actor: PeerId,
    local_counter: u64,
    clock: VersionVector,
    /// Every op ever applied, kept for `export` delta computation.
    log: Vec<StampedOp>,
    text_fields: BTreeMap<String, TextField>,
    counter_fields: BTreeMap<String, CounterField>,
    subscribers: Vec<Box<dyn FnMut() + Send>>,
    dirty: bool,
}

impl MapDoc {
    pub fn new(actor: PeerId) -> Self {
        Self {
            actor,
            local_counter: 0,
            clock: VersionVector::new(),
            log: Vec::new(),
            text_fields: BTreeMap::new(),
            counter_fields: BTreeMap::new(),
            subscribers: Vec::new(),
            dirty: false,
        }
    }

    pub fn actor(&self) -> &PeerId {
        &self.actor
    }

    pub fn get_text(&self, field: &str) -> Option<&str> {
        self.text_fields.get(field).map(|f| f.value.as_str())
    }

    pub fn get_counter(&self, field: &str) -> i64 {
        self.counter_fields
            .get(field)
            .map(|f| f.total())
            .unwrap_or(0)
    }

    pub fn set_text(&mut self, field: impl Into<String>, value: impl Into<String>) {
        let op = FieldOp::SetText {
            field: field.into(),
            value: value.into(),
        };
        self.apply_local(op);
    }

    pub fn increment(&mut self, field: impl Into<String>, delta: i64) {
        let op = FieldOp::IncCounter {
            field: field.into(),
            delta,
        };
        self.apply_local(op);
    }

    fn apply_local(&mut self, op: FieldOp) {
        self.local_counter += 1;
        let counter = self.local_counter;
        self.clock.observe(&self.actor, counter);
        let stamped = StampedOp {
            actor: self.actor.clone(),
            counter,
            op,
        };
        self.apply_op(stamped.clone());
        self.log.push(stamped);
        self.notify();
    }

    fn apply_op(&mut self, stamped: StampedOp) {
        match stamped.op {
            FieldOp::SetText { field, value } => {
                let candidate = (stamped.counter, stamped.actor.clone());
                let replace = match self.text_fields.get(&field) {
                    Some(existing) => candidate > existing.winner,
                    None => true,
                };
                if replace {
                    self.text_fields.insert(
                        field,
                        TextField {
                            value,
                            winner: candidate,
                        },
                    );
                }
            }
            FieldOp::IncCounter { field, delta } => {
                let entry = self.counter_fields.entry(field).or_default();
                let actor_total = entry.per_actor.entry(stamped.actor.clone()).or_insert(0);
                // This actor's total only ever grows via their own ops, so
                // this remains a valid per-actor running sum under replay.
                *actor_total += delta;
            }
        }
    }

    fn notify(&mut self) {
        self.dirty = true;
        for cb in &mut self.subscribers {
            cb();
        }
        self.dirty = false;
    }
}

impl CrdtDocument for MapDoc {
    fn version(&self) -> VersionVector {
        self.clock.clone()
    }

    fn export(&self, since: &VersionVector) -> Vec<u8> {
        let ops: Vec<StampedOp> = self
            .log
            .iter()
            .filter(|op| op.counter > since.get(&op.actor))
            .cloned()
            .collect();
        serde_json::to_vec(&Update { ops }).unwrap_or_default()
    }

    fn import(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        let update: Update = serde_json::from_slice(bytes)?;
        let mut changed = false;
        for stamped in update.ops {
            if stamped.counter <= self.clock.get(&stamped.actor) {
                continue; // already applied, CRDT import must be idempotent
            }
            self.clock.observe(&stamped.actor, stamped.counter);
            self.apply_op(stamped.clone());
            self.log.push(stamped);
            changed = true;
        }
        if changed {
            tracing::trace!(actor = %self.actor, "applied remote update");
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    fn subscribe_local_updates(&mut self, cb: Box<dyn FnMut() + Send>) -> Unsubscribe {
        self.subscribers.push(cb);
        Unsubscribe::new(move || {})
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_merges_deterministically() {
        let mut a = MapDoc::new(PeerId::new("a"));
        a.set_text("title", "Hello");
        let delta = a.export(&VersionVector::new());

        let mut b = MapDoc::new(PeerId::new("b"));
        b.import(&delta).unwrap();
        assert_eq!(b.get_text("title"), Some("Hello"));
    }

    #[test]
    fn concurrent_counters_converge_by_addition() {
        let mut a = MapDoc::new(PeerId::new("a"));
        let mut b = MapDoc::new(PeerId::new("b"));
        a.increment("c", 10);
        b.increment("c", 20);

        let delta_a = a.export(&VersionVector::new());
        let delta_b = b.export(&VersionVector::new());
        a.import(&delta_b).unwrap();
        b.import(&delta_a).unwrap();

        assert_eq!(a.get_counter("c"), 30);
        assert_eq!(b.get_counter("c"), 30);
    }

    #[test]
    fn import_is_idempotent() {
        let mut a = MapDoc::new(PeerId::new("a"));
        a.increment("c", 5);
        let delta = a.export(&VersionVector::new());

        let mut b = MapDoc::new(PeerId::new("b"));
        b.import(&delta).unwrap();
        b.import(&delta).unwrap();
        assert_eq!(b.get_counter("c"), 5);
    }

    #[test]
    fn incremental_export_only_sends_new_ops() {
        let mut a = MapDoc::new(PeerId::new("a"));
        a.set_text("title", "v1");
        let mut b = MapDoc::new(PeerId::new("b"));
        b.import(&a.export(&VersionVector::new())).unwrap();

        a.set_text("title", "v2");
        let since = b.version();
        let delta = a.export(&since);
        let update: super::Update = serde_json::from_slice(&delta).unwrap();
        assert_eq!(update.ops.len(), 1);

        b.import(&delta).unwrap();
        assert_eq!(b.get_text("title"), Some("v2"));
    }
}
