//! Per-kind mirror of the latest known snapshots.

use kollect_core::{ResourceKind, Snapshot};
use rustc_hash::FxHashMap;
use tracing::debug;
use uuid::Uuid;

/// Opaque slot key; unrelated to the resource name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(Uuid);

/// Hands out random slot keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdAllocator;

impl IdAllocator {
    pub fn create_id(&self) -> SlotId {
        SlotId(Uuid::new_v4())
    }
}

/// Latest snapshot per live resource of one kind.
///
/// Lookups scan every occupied slot and compare the slot's stored identity
/// against the incoming `name`, then against its `generateName`. This keeps a
/// resource first seen under its generated-name hint in the same slot once
/// the server assigns the final name.
#[derive(Debug)]
pub struct ResourceMirror {
    kind: ResourceKind,
    slots: FxHashMap<SlotId, Snapshot>,
    ids: IdAllocator,
}

impl ResourceMirror {
    pub fn new(kind: ResourceKind) -> Self {
        Self { kind, slots: FxHashMap::default(), ids: IdAllocator }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn find(&self, name: &str, generate_name: Option<&str>) -> Option<SlotId> {
        let by = |wanted: &str| {
            self.slots
                .iter()
                .find(|(_, s)| s.identity() == wanted)
                .map(|(id, _)| *id)
        };
        let by_name = if name.is_empty() { None } else { by(name) };
        by_name.or_else(|| generate_name.filter(|g| !g.is_empty()).and_then(by))
    }

    /// Store `snap`, overwriting the matching slot if there is one.
    /// Returns the slot and whether it was freshly allocated.
    pub fn upsert(&mut self, snap: Snapshot) -> (SlotId, bool) {
        if let Some(id) = self.find(&snap.name, snap.generate_name.as_deref()) {
            debug!(kind = %self.kind, name = %snap.identity(), "mirror: updated in place");
            self.slots.insert(id, snap);
            return (id, false);
        }
        let mut id = self.ids.create_id();
        while self.slots.contains_key(&id) {
            id = self.ids.create_id();
        }
        debug!(kind = %self.kind, name = %snap.identity(), "mirror: new slot");
        self.slots.insert(id, snap);
        (id, true)
    }

    /// Clear the slot matching `name`/`generate_name`; returns the removed
    /// resource's name. Not finding it is not an error.
    pub fn remove(&mut self, name: &str, generate_name: Option<&str>) -> Option<String> {
        let id = self.find(name, generate_name)?;
        let removed = self.slots.remove(&id)?;
        Some(removed.identity().to_string())
    }

    pub fn get(&self, name: &str) -> Option<&Snapshot> {
        self.find(name, None).and_then(|id| self.slots.get(&id))
    }

    /// Clones of every live snapshot, ordered by identity.
    pub fn snapshots(&self) -> Vec<Snapshot> {
        let mut out: Vec<Snapshot> = self.slots.values().cloned().collect();
        out.sort_by(|a, b| a.identity().cmp(b.identity()));
        out
    }

    /// Sorted identities of the live set.
    pub fn names(&self) -> Vec<String> {
        let mut out: Vec<String> = self.slots.values().map(|s| s.identity().to_string()).collect();
        out.sort_unstable();
        out
    }
}
