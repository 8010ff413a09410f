//! Registry of open views, keyed by target and inventory kind.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::host::ViewId;
use crate::identity::ParticipantId;
use crate::kind::InventoryKind;
use crate::proxy::ProxyKey;

/// Id of one registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub u64);

/// One observer's open view of one target inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverEntry {
    pub id: EntryId,
    pub observer: ParticipantId,
    pub target: ParticipantId,
    pub kind: InventoryKind,
    /// Set once the host has shown the container.
    pub view: Option<ViewId>,
}

impl ObserverEntry {
    pub fn key(&self) -> ProxyKey {
        ProxyKey::new(self.target.clone(), self.kind)
    }
}

/// Result of removing an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removed {
    pub entry: ObserverEntry,
    /// No entries remain for the entry's target and kind.
    pub last: bool,
}

#[derive(Debug, Default)]
pub struct ObserverRegistry {
    next_id: u64,
    entries: BTreeMap<EntryId, ObserverEntry>,
    by_key: BTreeMap<ProxyKey, BTreeSet<EntryId>>,
    stale: BTreeSet<EntryId>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a view. If `observer` already has an entry for this target
    /// and kind, that entry is returned with `false`.
    pub fn register(
        &mut self,
        observer: &ParticipantId,
        target: &ParticipantId,
        kind: InventoryKind,
    ) -> (ObserverEntry, bool) {
        let key = ProxyKey::new(target.clone(), kind);
        if let Some(existing) = self.by_key.get(&key).and_then(|ids| {
            ids.iter()
                .filter_map(|id| self.entries.get(id))
                .find(|e| &e.observer == observer && !self.stale.contains(&e.id))
        }) {
            return (existing.clone(), false);
        }

        self.next_id += 1;
        let entry = ObserverEntry {
            id: EntryId(self.next_id),
            observer: observer.clone(),
            target: target.clone(),
            kind,
            view: None,
        };
        self.by_key.entry(key).or_default().insert(entry.id);
        self.entries.insert(entry.id, entry.clone());
        debug!("Registered {} viewing {} of {}", observer, kind, target);
        (entry, true)
    }

    pub fn attach_view(&mut self, id: EntryId, view: ViewId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.view = Some(view);
        }
    }

    pub fn get(&self, id: EntryId) -> Option<&ObserverEntry> {
        self.entries.get(&id)
    }

    pub fn unregister(&mut self, id: EntryId) -> Option<Removed> {
        let entry = self.entries.remove(&id)?;
        self.stale.remove(&id);
        let key = entry.key();
        let last = match self.by_key.get_mut(&key) {
            Some(ids) => {
                ids.remove(&id);
                ids.is_empty()
            }
            None => true,
        };
        if last {
            self.by_key.remove(&key);
        }
        debug!("Unregistered {} viewing {} of {}", entry.observer, entry.kind, entry.target);
        Some(Removed { entry, last })
    }

    /// Live entries for a target and kind, optionally leaving out one
    /// observer.
    pub fn list_observers(
        &self,
        target: &ParticipantId,
        kind: InventoryKind,
        excluding: Option<&ParticipantId>,
    ) -> Vec<ObserverEntry> {
        let key = ProxyKey::new(target.clone(), kind);
        self.by_key
            .get(&key)
            .into_iter()
            .flatten()
            .filter(|id| !self.stale.contains(id))
            .filter_map(|id| self.entries.get(id))
            .filter(|e| Some(&e.observer) != excluding)
            .cloned()
            .collect()
    }

    /// Number of entries (stale included) for a target and kind.
    pub fn count(&self, key: &ProxyKey) -> usize {
        self.by_key.get(key).map_or(0, BTreeSet::len)
    }

    pub fn entries_of_observer(&self, observer: &ParticipantId) -> Vec<EntryId> {
        self.entries
            .values()
            .filter(|e| &e.observer == observer)
            .map(|e| e.id)
            .collect()
    }

    pub fn entries_of_target(&self, target: &ParticipantId) -> Vec<EntryId> {
        self.entries
            .values()
            .filter(|e| &e.target == target)
            .map(|e| e.id)
            .collect()
    }

    pub fn find_view(&self, observer: &ParticipantId, view: ViewId) -> Option<EntryId> {
        self.entries
            .values()
            .find(|e| &e.observer == observer && e.view == Some(view))
            .map(|e| e.id)
    }

    /// Mark an entry whose view could not be updated. It stops receiving
    /// fan-out and is removed by the next [`collect_garbage`](Self::collect_garbage).
    pub fn mark_stale(&mut self, id: EntryId) {
        if self.entries.contains_key(&id) {
            self.stale.insert(id);
        }
    }

    pub fn collect_garbage(&mut self) -> Vec<Removed> {
        let stale: Vec<EntryId> = std::mem::take(&mut self.stale).into_iter().collect();
        stale.into_iter().filter_map(|id| self.unregister(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
