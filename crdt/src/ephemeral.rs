//! Ephemeral (presence) stores: small, non-persistent per-document state
//! that piggybacks on sync envelopes (spec §4.5, §6.2).

use crate::Unsubscribe;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub trait EphemeralStore: Send + std::any::Any {
    fn encode(&self) -> Vec<u8>;
    fn apply(&mut self, bytes: &[u8]) -> anyhow::Result<()>;
    fn subscribe(&mut self, cb: Box<dyn FnMut() + Send>) -> Unsubscribe;
    fn as_any(&self) -> &dyn std::any::Any;
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

/// A reference ephemeral store: a flat map of string keys to JSON values,
/// the shape most presence payloads (cursor position, online status,
/// selection range) actually take in practice.
#[derive(Default)]
pub struct MapEphemeralStore {
    entries: BTreeMap<String, serde_json::Value>,
    subscribers: Vec<(u64, Box<dyn FnMut() + Send>)>,
    next_id: u64,
}

impl MapEphemeralStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.entries.insert(key.into(), value);
        self.notify();
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries.get(key)
    }

    fn notify(&mut self) {
        for (_, cb) in &mut self.subscribers {
            cb();
        }
    }
}

impl EphemeralStore for MapEphemeralStore {
    fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(&self.entries).unwrap_or_default()
    }

    fn apply(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        let incoming: BTreeMap<String, serde_json::Value> = serde_json::from_slice(bytes)?;
        self.entries.extend(incoming);
        self.notify();
        Ok(())
    }

    fn subscribe(&mut self, cb: Box<dyn FnMut() + Send>) -> Unsubscribe {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push((id, cb));
        // Subscriber list lives on the store; cancellation is advisory only
        // since the store may already be gone by the time it runs. Real
        // backends with a stable address (Arc<Mutex<_>>) can remove by id.
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
    fn round_trips_through_encode_apply() {
        let mut a = MapEphemeralStore::new();
        a.set("cursor", serde_json::json!(42));
        let bytes = a.encode();

        let mut b = MapEphemeralStore::new();
        b.apply(&bytes).unwrap();
        assert_eq!(b.get("cursor"), Some(&serde_json::json!(42)));
    }
}
