//! The shared container every observer of one target inventory renders.
//!
//! A [`ProxyInventory`] keeps its own copy of the slots (what observers see),
//! a revision counter bumped on every accepted change, and an outbox of
//! changes not yet applied to the backing source or fanned out. All of it
//! sits behind one mutex per proxy, so writers to different targets never
//! contend.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::error::InvseeError;
use crate::host::HostWorld;
use crate::identity::{ParticipantId, ParticipantIdentity};
use crate::item::{normalize, InventorySnapshot, ItemStack, Slot};
use crate::kind::InventoryKind;
use crate::registry::EntryId;
use crate::source::{InventorySource, LiveSource, OfflineSource};

/// Key of per-target state: one proxy per target and kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyKey {
    pub target: ParticipantId,
    pub kind: InventoryKind,
}

impl ProxyKey {
    pub fn new(target: ParticipantId, kind: InventoryKind) -> Self {
        Self { target, kind }
    }
}

/// Where an accepted change came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// An operator's edit through their view.
    Observer(ParticipantId),
    /// The target's live inventory changed on the host side.
    Live,
}

/// One accepted slot change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotChange {
    pub slot: usize,
    pub item: Option<ItemStack>,
    pub revision: u64,
    pub origin: Origin,
}

struct ProxyState {
    slots: Vec<Option<ItemStack>>,
    revision: u64,
    source: InventorySource,
    outbox: Vec<SlotChange>,
    open_entries: HashSet<EntryId>,
}

impl ProxyState {
    fn accept(&mut self, slot: usize, item: Option<ItemStack>, origin: Origin) -> u64 {
        self.revision += 1;
        self.slots[slot] = item.clone();
        self.outbox.push(SlotChange {
            slot,
            item,
            revision: self.revision,
            origin,
        });
        self.revision
    }

    /// Re-apply outbox changes on top of freshly loaded slots.
    fn replay_outbox(&mut self) {
        for change in &self.outbox {
            if let Some(slot) = self.slots.get_mut(change.slot) {
                *slot = change.item.clone();
            }
        }
    }
}

pub struct ProxyInventory {
    target: ParticipantIdentity,
    kind: InventoryKind,
    state: Mutex<ProxyState>,
}

impl ProxyInventory {
    fn with_source(
        target: ParticipantIdentity,
        kind: InventoryKind,
        snapshot: InventorySnapshot,
        source: InventorySource,
    ) -> Self {
        let mut slots = snapshot.into_slots();
        slots.resize(kind.size(), None);
        Self {
            target,
            kind,
            state: Mutex::new(ProxyState {
                slots,
                revision: 0,
                source,
                outbox: Vec::new(),
                open_entries: HashSet::new(),
            }),
        }
    }

    /// Proxy bound to a connected player's live inventory.
    pub fn live(target: ParticipantIdentity, kind: InventoryKind, current: InventorySnapshot) -> Self {
        let source = InventorySource::Live(LiveSource::new(target.id.clone(), kind, 0));
        Self::with_source(target, kind, current, source)
    }

    /// Proxy over an offline copy that has already been loaded.
    pub fn offline(target: ParticipantIdentity, kind: InventoryKind, loaded: InventorySnapshot) -> Self {
        let source = InventorySource::Offline(OfflineSource::new(loaded.clone(), 0));
        Self::with_source(target, kind, loaded, source)
    }

    /// Proxy whose offline copy is still being loaded.
    pub fn loading(target: ParticipantIdentity, kind: InventoryKind) -> Self {
        Self::with_source(
            target,
            kind,
            InventorySnapshot::empty(kind),
            InventorySource::Loading,
        )
    }

    fn lock(&self) -> MutexGuard<'_, ProxyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn target(&self) -> &ParticipantIdentity {
        &self.target
    }

    pub fn kind(&self) -> InventoryKind {
        self.kind
    }

    pub fn key(&self) -> ProxyKey {
        ProxyKey::new(self.target.id.clone(), self.kind)
    }

    pub fn size(&self) -> usize {
        self.kind.size()
    }

    /// Revision of the last accepted change.
    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    /// Label of the current backing source (`live`, `offline`, ...).
    pub fn source_label(&self) -> &'static str {
        self.lock().source.label()
    }

    pub fn is_live(&self) -> bool {
        self.lock().source.is_live()
    }

    pub fn is_offline(&self) -> bool {
        self.lock().source.is_offline()
    }

    pub fn is_loading(&self) -> bool {
        self.lock().source.is_loading()
    }

    pub fn is_detached(&self) -> bool {
        self.lock().source.is_detached()
    }

    pub fn get_slot(&self, slot: usize) -> Result<Slot, InvseeError> {
        let state = self.lock();
        let item = state
            .slots
            .get(slot)
            .ok_or(InvseeError::OutOfRange {
                slot,
                size: self.size(),
            })?
            .clone();
        Ok(Slot { index: slot, item })
    }

    /// All slots, storage order.
    pub fn contents(&self) -> Vec<Option<ItemStack>> {
        self.lock().slots.clone()
    }

    /// Accept a change. It is visible through [`get_slot`](Self::get_slot)
    /// immediately and reaches the backing source and other observers on the
    /// next dispatch. Returns the revision assigned to it.
    pub fn set_slot(
        &self,
        slot: usize,
        item: Option<ItemStack>,
        origin: Origin,
    ) -> Result<u64, InvseeError> {
        let item = normalize(item);
        let mut state = self.lock();
        self.check_writable(&state, slot, &item)?;
        Ok(state.accept(slot, item, origin))
    }

    /// [`set_slot`](Self::set_slot) on behalf of an open view.
    pub(crate) fn set_slot_for(
        &self,
        entry: EntryId,
        slot: usize,
        item: Option<ItemStack>,
        origin: Origin,
    ) -> Result<u64, InvseeError> {
        let item = normalize(item);
        let mut state = self.lock();
        self.check_writable(&state, slot, &item)?;
        if !state.open_entries.contains(&entry) {
            return Err(InvseeError::ViewClosed);
        }
        Ok(state.accept(slot, item, origin))
    }

    fn check_writable(
        &self,
        state: &ProxyState,
        slot: usize,
        item: &Option<ItemStack>,
    ) -> Result<(), InvseeError> {
        if slot >= self.size() {
            return Err(InvseeError::OutOfRange {
                slot,
                size: self.size(),
            });
        }
        // Anything the store would refuse to load back never gets a revision.
        if let Some(reason) = item.as_ref().and_then(ItemStack::defect) {
            return Err(InvseeError::InvalidItem { slot, reason });
        }
        if state.source.is_detached() {
            return Err(InvseeError::SourceDetached {
                target: self.target.id.clone(),
                kind: self.kind,
            });
        }
        Ok(())
    }

    pub(crate) fn open_entry(&self, entry: EntryId) {
        self.lock().open_entries.insert(entry);
    }

    pub(crate) fn close_entry(&self, entry: EntryId) {
        self.lock().open_entries.remove(&entry);
    }

    /// Fold a change observed on the live object. Returns the new revision,
    /// or `None` when it is our own write coming back or already reflected.
    pub(crate) fn fold_live(&self, slot: usize, live: Option<ItemStack>) -> Option<u64> {
        let mut state = self.lock();
        if slot >= state.slots.len() {
            return None;
        }
        if let InventorySource::Live(source) = &mut state.source {
            if source.take_echo(slot, &live) {
                return None;
            }
        } else {
            return None;
        }
        if state.slots[slot] == live {
            return None;
        }
        Some(state.accept(slot, live, Origin::Live))
    }

    /// Apply pending changes to the backing source and hand back the ones to
    /// fan out: the latest change per slot, in acceptance order.
    ///
    /// Nothing leaves the outbox while a load is in flight. If the live object
    /// rejects a write, it and everything after it stay queued.
    pub(crate) fn flush(&self, host: &mut dyn HostWorld) -> Vec<SlotChange> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.source.is_loading() || state.outbox.is_empty() {
            return Vec::new();
        }

        let pending = std::mem::take(&mut state.outbox);
        let latest: HashMap<usize, usize> = pending
            .iter()
            .enumerate()
            .map(|(i, change)| (change.slot, i))
            .collect();

        let mut delivered = Vec::new();
        let mut remaining = pending
            .into_iter()
            .enumerate()
            .filter(|(i, change)| latest.get(&change.slot) == Some(i));
        while let Some((_, change)) = remaining.next() {
            if let Err(e) = state.source.apply(host, &change) {
                warn!(
                    "Write of {} slot {} for {} failed: {e}",
                    self.kind, change.slot, self.target.name
                );
                state.outbox.push(change);
                state.outbox.extend(remaining.by_ref().map(|(_, c)| c));
                break;
            }
            delivered.push(change);
        }
        delivered
    }

    /// Finish a store load. Changes accepted while loading are replayed on
    /// top of the loaded data in acceptance order. Returns false when the
    /// proxy is no longer waiting for a load.
    pub(crate) fn complete_load(&self, loaded: InventorySnapshot) -> bool {
        let mut state = self.lock();
        if !state.source.is_loading() {
            return false;
        }
        let mut slots = loaded.clone().into_slots();
        slots.resize(self.size(), None);
        state.slots = slots;
        state.replay_outbox();
        state.source = InventorySource::Offline(OfflineSource::new(loaded, 0));
        debug!(
            "Loaded {} of {} ({} buffered changes)",
            self.kind,
            self.target.name,
            state.outbox.len()
        );
        true
    }

    /// Hand off from an offline copy (or an unfinished load) to the target's
    /// newly live object.
    ///
    /// Pending changes are folded into the offline copy first, then every
    /// slot the live object disagrees on is written into it, all under this
    /// proxy's lock so no observer write can interleave.
    pub(crate) fn attach_live(&self, host: &mut dyn HostWorld) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        let id = self.target.id.clone();
        match std::mem::replace(&mut state.source, InventorySource::Detached) {
            InventorySource::Offline(mut offline) => {
                for change in &state.outbox {
                    offline.apply(change);
                }
                let mut live = LiveSource::new(id.clone(), self.kind, state.revision);
                let current = host.read_live(&id, self.kind);
                for (slot, item) in offline.slots().iter().enumerate() {
                    let held = current.as_ref().and_then(|c| c.get(slot));
                    if held == item.as_ref() {
                        continue;
                    }
                    if let Err(e) = live.write(host, slot, item.clone()) {
                        warn!("Handoff write of slot {slot} for {} failed: {e}", self.target.name);
                    }
                }
                state.slots = offline.slots().to_vec();
                state.source = InventorySource::Live(live);
                info!("{} of {} handed off to live session", self.kind, self.target.name);
                true
            }
            InventorySource::Loading => match host.read_live(&id, self.kind) {
                Some(current) => {
                    let mut slots = current.into_slots();
                    slots.resize(self.size(), None);
                    state.slots = slots;
                    state.replay_outbox();
                    state.source = InventorySource::Live(LiveSource::new(id, self.kind, 0));
                    info!("{} of {} bound live before load finished", self.kind, self.target.name);
                    true
                }
                None => {
                    state.source = InventorySource::Loading;
                    false
                }
            },
            other => {
                state.source = other;
                false
            }
        }
    }

    /// Hand off from the live object to an offline copy as the target leaves.
    ///
    /// The copy starts from the live object's last state (which the host
    /// persists on quit) at the revision the live object held; queued changes
    /// then replay into it by revision. Live differences nobody reported are
    /// folded in as live-origin changes.
    pub(crate) fn detach_live(&self, host: &dyn HostWorld) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        let InventorySource::Live(live) = &state.source else {
            return false;
        };
        let flushed = live.flushed_revision();

        let offline = match host.read_live(&self.target.id, self.kind) {
            Some(current) => {
                let mut current = current.into_slots();
                current.resize(self.size(), None);
                let pending: HashSet<usize> = state
                    .outbox
                    .iter()
                    .filter(|c| c.revision > flushed)
                    .map(|c| c.slot)
                    .collect();
                let missed: Vec<usize> = (0..current.len())
                    .filter(|slot| !pending.contains(slot) && current[*slot] != state.slots[*slot])
                    .collect();
                let offline = OfflineSource::new(InventorySnapshot::new(current.clone()), flushed);
                for slot in missed {
                    state.accept(slot, current[slot].clone(), Origin::Live);
                }
                offline
            }
            None => OfflineSource::handed_off(
                InventorySnapshot::new(state.slots.clone()),
                state.revision,
                flushed,
            ),
        };
        state.source = InventorySource::Offline(offline);
        info!("{} of {} handed off to offline copy", self.kind, self.target.name);
        true
    }

    /// Offline copy and the revision it reflects, for saving.
    pub(crate) fn offline_snapshot(&self) -> Option<(InventorySnapshot, u64)> {
        match &self.lock().source {
            InventorySource::Offline(offline) => {
                Some((offline.snapshot(), offline.applied_revision()))
            }
            _ => None,
        }
    }

    pub(crate) fn is_dirty(&self) -> bool {
        matches!(&self.lock().source, InventorySource::Offline(o) if o.is_dirty())
    }

    pub(crate) fn mark_saved(&self, revision: u64) {
        if let InventorySource::Offline(offline) = &mut self.lock().source {
            offline.mark_saved(revision);
        }
    }

    /// Release the proxy. Late writes through stale handles fail with
    /// `SourceDetached`.
    pub(crate) fn detach(&self) {
        let mut state = self.lock();
        state.source = InventorySource::Detached;
        state.open_entries.clear();
        state.outbox.clear();
    }
}

impl std::fmt::Debug for ProxyInventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ProxyInventory")
            .field("target", &self.target.name)
            .field("kind", &self.kind)
            .field("revision", &state.revision)
            .field("source", &state.source.label())
            .field("pending", &state.outbox.len())
            .finish()
    }
}
