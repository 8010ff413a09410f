//! In-memory world standing in for a game server: online players with
//! their live inventories, and the containers shown to them.

use std::collections::{BTreeMap, HashMap};

use mc_rs_invsee::{
    ContainerSpec, HostError, HostEvent, HostWorld, InventoryKind, InventorySnapshot, ItemStack,
    ParticipantId, ParticipantIdentity, SilentAccessToken, ViewId,
};
use tracing::{debug, info};

pub struct OnlinePlayer {
    pub identity: ParticipantIdentity,
    inventories: HashMap<InventoryKind, Vec<Option<ItemStack>>>,
}

impl OnlinePlayer {
    pub fn snapshot(&self, kind: InventoryKind) -> InventorySnapshot {
        self.inventories
            .get(&kind)
            .map(|slots| InventorySnapshot::new(slots.clone()))
            .unwrap_or_else(|| InventorySnapshot::empty(kind))
    }
}

struct OpenView {
    observer: ParticipantId,
    kind: InventoryKind,
    title: String,
    contents: Vec<Option<ItemStack>>,
}

#[derive(Default)]
pub struct ConsoleWorld {
    players: BTreeMap<ParticipantId, OnlinePlayer>,
    views: BTreeMap<ViewId, OpenView>,
    next_view: u64,
    events: Vec<HostEvent>,
    titles: HashMap<String, String>,
}

impl ConsoleWorld {
    pub fn new(titles: HashMap<String, String>) -> Self {
        Self {
            titles,
            ..Self::default()
        }
    }

    /// Bring a player online with the given inventories.
    pub fn join(&mut self, identity: ParticipantIdentity, inventories: Vec<(InventoryKind, InventorySnapshot)>) {
        let mut player = OnlinePlayer {
            identity: identity.clone(),
            inventories: HashMap::new(),
        };
        for kind in InventoryKind::ALL {
            player.inventories.insert(kind, vec![None; kind.size()]);
        }
        for (kind, snapshot) in inventories {
            let mut slots = snapshot.into_slots();
            slots.resize(kind.size(), None);
            player.inventories.insert(kind, slots);
        }
        info!("{} joined", identity.name);
        self.players.insert(identity.id.clone(), player);
        self.events.push(HostEvent::ParticipantConnected(identity));
    }

    /// Remove a player. The disconnect event must already have been handled.
    pub fn quit(&mut self, id: &ParticipantId) -> Option<OnlinePlayer> {
        let player = self.players.remove(id)?;
        let closed: Vec<ViewId> = self
            .views
            .iter()
            .filter(|(_, v)| &v.observer == id)
            .map(|(view, _)| *view)
            .collect();
        for view in closed {
            self.views.remove(&view);
        }
        info!("{} left", player.identity.name);
        Some(player)
    }

    pub fn player(&self, id: &ParticipantId) -> Option<&OnlinePlayer> {
        self.players.get(id)
    }

    pub fn find_online(&self, name: &str) -> Option<&ParticipantIdentity> {
        self.players
            .values()
            .map(|p| &p.identity)
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn players(&self) -> impl Iterator<Item = &OnlinePlayer> {
        self.players.values()
    }

    /// A player picking up an item: first empty main slot, or an error when full.
    pub fn give(&mut self, id: &ParticipantId, item: ItemStack) -> Result<usize, HostError> {
        let player = self
            .players
            .get(id)
            .ok_or_else(|| HostError::NotConnected(id.clone()))?;
        let slot = player
            .inventories
            .get(&InventoryKind::Main)
            .and_then(|slots| slots.iter().position(Option::is_none))
            .ok_or_else(|| HostError::Rejected("inventory full".into()))?;
        self.write_live_slot(id, InventoryKind::Main, slot, Some(item))?;
        Ok(slot)
    }

    pub fn take_events(&mut self) -> Vec<HostEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    /// Title and non-empty container positions of a view.
    pub fn describe_view(&self, view: ViewId) -> Option<(String, Vec<(usize, ItemStack)>)> {
        let v = self.views.get(&view)?;
        let items = v
            .contents
            .iter()
            .enumerate()
            .filter_map(|(i, item)| item.clone().map(|item| (i, item)))
            .collect();
        Some((v.title.clone(), items))
    }
}

impl HostWorld for ConsoleWorld {
    fn online_participants(&self) -> Vec<ParticipantIdentity> {
        self.players.values().map(|p| p.identity.clone()).collect()
    }

    fn is_connected(&self, id: &ParticipantId) -> bool {
        self.players.contains_key(id)
    }

    fn read_live(&self, id: &ParticipantId, kind: InventoryKind) -> Option<InventorySnapshot> {
        self.players.get(id).map(|p| p.snapshot(kind))
    }

    fn write_live_slot(
        &mut self,
        id: &ParticipantId,
        kind: InventoryKind,
        slot: usize,
        item: Option<ItemStack>,
    ) -> Result<(), HostError> {
        let slots = self
            .players
            .get_mut(id)
            .and_then(|p| p.inventories.get_mut(&kind))
            .ok_or_else(|| HostError::NotConnected(id.clone()))?;
        let cell = slots
            .get_mut(slot)
            .ok_or_else(|| HostError::Rejected(format!("{kind} has no slot {slot}")))?;
        *cell = item;
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
        match access {
            Some(_) => debug!("Showing '{}' to {observer} silently", spec.title),
            None => info!("[world] {observer} opened '{}'", spec.title),
        }
        self.next_view += 1;
        let view = ViewId(self.next_view);
        self.views.insert(
            view,
            OpenView {
                observer: observer.clone(),
                kind: spec.kind,
                title: spec.title,
                contents: spec.contents,
            },
        );
        Ok(view)
    }

    fn hide_container(
        &mut self,
        observer: &ParticipantId,
        view: ViewId,
        access: Option<&SilentAccessToken>,
    ) {
        if access.is_none() {
            info!("[world] {observer} closed a container");
        }
        self.views.remove(&view);
    }

    fn push_slot_update(
        &mut self,
        view: ViewId,
        view_slot: usize,
        item: Option<&ItemStack>,
    ) -> Result<(), HostError> {
        let v = self
            .views
            .get_mut(&view)
            .ok_or(HostError::UnknownView(view.0))?;
        let kind = v.kind;
        let cell = v
            .contents
            .get_mut(view_slot)
            .ok_or_else(|| HostError::Rejected(format!("{kind} view has no slot {view_slot}")))?;
        *cell = item.cloned();
        Ok(())
    }

    fn localize(&self, _observer: &ParticipantId, key: &str, player_name: &str) -> Option<String> {
        self.titles
            .get(key)
            .map(|template| template.replace("%player%", player_name))
    }
}
