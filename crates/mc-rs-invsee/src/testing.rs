//! In-memory host and store doubles for tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{HostError, StoreError};
use crate::host::{ContainerSpec, HostEvent, HostWorld, PlayerStore, ViewId};
use crate::identity::{ParticipantId, ParticipantIdentity};
use crate::item::{InventorySnapshot, ItemStack};
use crate::kind::InventoryKind;
use crate::silent::SilentAccessToken;

struct MockView {
    observer: ParticipantId,
    kind: InventoryKind,
    title: String,
    contents: Vec<Option<ItemStack>>,
    open: bool,
}

/// Host world double. Every live write, whoever makes it, is counted and
/// queued as a `LiveInventoryChanged` event like a real host would.
#[derive(Default)]
pub(crate) struct MockHost {
    online: Vec<ParticipantIdentity>,
    live: HashMap<(ParticipantId, InventoryKind), Vec<Option<ItemStack>>>,
    writes: HashMap<ParticipantId, usize>,
    events: Vec<HostEvent>,
    notifications: Vec<String>,
    views: HashMap<ViewId, MockView>,
    next_view: u64,
    fail_open: bool,
    failing_views: HashSet<ViewId>,
    translations: HashMap<String, String>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring a player online with empty inventories.
    pub fn connect(&mut self, who: ParticipantIdentity) {
        for kind in InventoryKind::ALL {
            self.live
                .entry((who.id.clone(), kind))
                .or_insert_with(|| vec![None; kind.size()]);
        }
        self.online.push(who);
    }

    /// Bring a player online with the given contents for one kind.
    pub fn connect_with(&mut self, who: ParticipantIdentity, kind: InventoryKind, slots: InventorySnapshot) {
        self.connect(who.clone());
        let mut slots = slots.into_slots();
        slots.resize(kind.size(), None);
        self.live.insert((who.id, kind), slots);
    }

    pub fn disconnect(&mut self, id: &ParticipantId) {
        self.online.retain(|p| &p.id != id);
        self.live.retain(|(owner, _), _| owner != id);
    }

    /// The player's own action changing a slot.
    pub fn player_sets_slot(
        &mut self,
        id: &ParticipantId,
        kind: InventoryKind,
        slot: usize,
        item: Option<ItemStack>,
    ) {
        let _ = self.write_live_slot(id, kind, slot, item);
    }

    pub fn live_writes(&self, id: &ParticipantId) -> usize {
        self.writes.get(id).copied().unwrap_or(0)
    }

    pub fn take_events(&mut self) -> Vec<HostEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn notifications(&self) -> &[String] {
        &self.notifications
    }

    pub fn fail_next_open(&mut self) {
        self.fail_open = true;
    }

    pub fn fail_pushes_to(&mut self, view: ViewId) {
        self.failing_views.insert(view);
    }

    pub fn translate(&mut self, key: &str, template: &str) {
        self.translations.insert(key.to_string(), template.to_string());
    }

    /// Open a view directly, as a test fixture.
    pub fn open_plain_view(&mut self, observer: &ParticipantId, kind: InventoryKind) -> ViewId {
        self.next_view += 1;
        let id = ViewId(self.next_view);
        self.views.insert(
            id,
            MockView {
                observer: observer.clone(),
                kind,
                title: String::new(),
                contents: vec![None; kind.size()],
                open: true,
            },
        );
        id
    }

    pub fn is_view_open(&self, view: ViewId) -> bool {
        self.views.get(&view).is_some_and(|v| v.open)
    }

    pub fn open_view_count(&self, observer: &ParticipantId) -> usize {
        self.views
            .values()
            .filter(|v| v.open && &v.observer == observer)
            .count()
    }

    pub fn view_title(&self, view: ViewId) -> Option<&str> {
        self.views.get(&view).map(|v| v.title.as_str())
    }

    /// What the observer sees in the container position holding `storage_slot`.
    pub fn view_storage_slot(&self, view: ViewId, storage_slot: usize) -> Option<ItemStack> {
        let v = self.views.get(&view)?;
        v.contents
            .get(v.kind.to_view_slot(storage_slot))
            .cloned()
            .flatten()
    }
}

impl HostWorld for MockHost {
    fn online_participants(&self) -> Vec<ParticipantIdentity> {
        self.online.clone()
    }

    fn is_connected(&self, id: &ParticipantId) -> bool {
        self.online.iter().any(|p| &p.id == id)
    }

    fn read_live(&self, id: &ParticipantId, kind: InventoryKind) -> Option<InventorySnapshot> {
        self.live
            .get(&(id.clone(), kind))
            .map(|slots| InventorySnapshot::new(slots.clone()))
    }

    fn write_live_slot(
        &mut self,
        id: &ParticipantId,
        kind: InventoryKind,
        slot: usize,
        item: Option<ItemStack>,
    ) -> Result<(), HostError> {
        let slots = self
            .live
            .get_mut(&(id.clone(), kind))
            .ok_or_else(|| HostError::NotConnected(id.clone()))?;
        let cell = slots
            .get_mut(slot)
            .ok_or_else(|| HostError::Rejected(format!("no slot {slot}")))?;
        *cell = item;
        *self.writes.entry(id.clone()).or_default() += 1;
        self.events.push(HostEvent::LiveInventoryChanged {
            id: id.clone(),
            kind,
            slot,
        });
        Ok(())
    }

    fn show_container(
        &mut self,
        observer: &ParticipantId,
        spec: ContainerSpec,
        access: Option<&SilentAccessToken>,
    ) -> Result<ViewId, HostError> {
        if std::mem::take(&mut self.fail_open) {
            return Err(HostError::Rejected("client not ready".into()));
        }
        if access.is_none() {
            self.notifications.push(format!("open:{observer}"));
        }
        self.next_view += 1;
        let id = ViewId(self.next_view);
        self.views.insert(
            id,
            MockView {
                observer: observer.clone(),
                kind: spec.kind,
                title: spec.title,
                contents: spec.contents,
                open: true,
            },
        );
        Ok(id)
    }

    fn hide_container(
        &mut self,
        observer: &ParticipantId,
        view: ViewId,
        access: Option<&SilentAccessToken>,
    ) {
        if access.is_none() {
            self.notifications.push(format!("close:{observer}"));
        }
        if let Some(v) = self.views.get_mut(&view) {
            v.open = false;
        }
    }

    fn push_slot_update(
        &mut self,
        view: ViewId,
        view_slot: usize,
        item: Option<&ItemStack>,
    ) -> Result<(), HostError> {
        if self.failing_views.contains(&view) {
            return Err(HostError::UnknownView(view.0));
        }
        let v = self
            .views
            .get_mut(&view)
            .filter(|v| v.open)
            .ok_or(HostError::UnknownView(view.0))?;
        if let Some(cell) = v.contents.get_mut(view_slot) {
            *cell = item.cloned();
        }
        Ok(())
    }

    fn localize(&self, _observer: &ParticipantId, key: &str, player_name: &str) -> Option<String> {
        self.translations
            .get(key)
            .map(|t| t.replace("%player%", player_name))
    }
}

#[derive(Default)]
struct StoreInner {
    players: Vec<ParticipantIdentity>,
    data: HashMap<(ParticipantId, InventoryKind), InventorySnapshot>,
    saves: Vec<(ParticipantId, InventoryKind, InventorySnapshot)>,
    loads: usize,
    failing_saves: usize,
    fail_loads: bool,
    fail_roster: bool,
    delay: Option<Duration>,
    save_delay: Option<Duration>,
}

/// Player store double. Shared with the engine through `Arc`.
#[derive(Default)]
pub(crate) struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_player(&self, who: ParticipantIdentity) {
        self.lock().players.push(who);
    }

    pub fn put(&self, id: &ParticipantId, kind: InventoryKind, snapshot: InventorySnapshot) {
        self.lock().data.insert((id.clone(), kind), snapshot);
    }

    pub fn stored(&self, id: &ParticipantId, kind: InventoryKind) -> Option<InventorySnapshot> {
        self.lock().data.get(&(id.clone(), kind)).cloned()
    }

    pub fn saves(&self) -> Vec<(ParticipantId, InventoryKind, InventorySnapshot)> {
        self.lock().saves.clone()
    }

    pub fn load_count(&self) -> usize {
        self.lock().loads
    }

    pub fn fail_next_saves(&self, n: usize) {
        self.lock().failing_saves = n;
    }

    pub fn fail_loads(&self, fail: bool) {
        self.lock().fail_loads = fail;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = Some(delay);
    }

    /// Make only the next save take `delay`.
    pub fn slow_next_save(&self, delay: Duration) {
        self.lock().save_delay = Some(delay);
    }

    /// Make `known_players` fail.
    pub fn fail_roster(&self, fail: bool) {
        self.lock().fail_roster = fail;
    }
}

impl PlayerStore for MemoryStore {
    fn known_players(&self) -> Result<Vec<ParticipantIdentity>, StoreError> {
        let inner = self.lock();
        if inner.fail_roster {
            return Err(StoreError::Unavailable("roster offline".into()));
        }
        Ok(inner.players.clone())
    }

    fn load(&self, id: &ParticipantId, kind: InventoryKind) -> Result<InventorySnapshot, StoreError> {
        let delay = self.lock().delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut inner = self.lock();
        inner.loads += 1;
        if inner.fail_loads {
            return Err(StoreError::Unavailable("disk offline".into()));
        }
        if let Some(snap) = inner.data.get(&(id.clone(), kind)) {
            return Ok(snap.clone());
        }
        if inner.players.iter().any(|p| &p.id == id) {
            return Ok(InventorySnapshot::empty(kind));
        }
        Err(StoreError::NoData)
    }

    fn save(
        &self,
        id: &ParticipantId,
        kind: InventoryKind,
        snapshot: &InventorySnapshot,
    ) -> Result<(), StoreError> {
        let delay = self.lock().save_delay.take();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut inner = self.lock();
        inner.saves.push((id.clone(), kind, snapshot.clone()));
        if inner.failing_saves > 0 {
            inner.failing_saves -= 1;
            return Err(StoreError::Unavailable("disk full".into()));
        }
        inner.data.insert((id.clone(), kind), snapshot.clone());
        Ok(())
    }
}
