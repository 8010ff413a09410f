//! Interfaces to the host server: live world, player store and event bus.
//!
//! The engine owns none of these. Live inventories belong to the host and are
//! only touched from [`Engine::tick`](crate::engine::Engine::tick), which is
//! handed `&mut dyn HostWorld` by the host's own tick loop.

use crate::error::{HostError, StoreError};
use crate::identity::{ParticipantId, ParticipantIdentity};
use crate::item::{InventorySnapshot, ItemStack};
use crate::kind::InventoryKind;
use crate::silent::SilentAccessToken;

/// Host-assigned id of a container screen shown to a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(pub u64);

/// Everything the host needs to show a container screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub title: String,
    pub kind: InventoryKind,
    pub rows: usize,
    /// Slot contents in container (view) order.
    pub contents: Vec<Option<ItemStack>>,
}

/// Events the host publishes to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A player finished joining; their live inventories are readable.
    ParticipantConnected(ParticipantIdentity),
    /// A player is leaving. Published before the host drops the live object.
    ParticipantDisconnected(ParticipantId),
    /// A slot of a live inventory changed, by any means.
    LiveInventoryChanged {
        id: ParticipantId,
        kind: InventoryKind,
        slot: usize,
    },
    /// The observer's client closed a container screen on its own.
    ContainerClosed { observer: ParticipantId, view: ViewId },
}

/// Persistent player-data store.
///
/// Implementations may block; in background mode the engine calls them from
/// a blocking thread pool.
pub trait PlayerStore: Send + Sync {
    /// Every player the store has a record for, with their last-known name.
    fn known_players(&self) -> Result<Vec<ParticipantIdentity>, StoreError>;

    /// Load one inventory. Unused trailing slots may be omitted.
    fn load(&self, id: &ParticipantId, kind: InventoryKind)
        -> Result<InventorySnapshot, StoreError>;

    /// Replace one inventory. Must leave the previous data intact on failure.
    fn save(
        &self,
        id: &ParticipantId,
        kind: InventoryKind,
        snapshot: &InventorySnapshot,
    ) -> Result<(), StoreError>;
}

/// The host's live world, as seen from inside its tick.
pub trait HostWorld {
    /// Currently connected players.
    fn online_participants(&self) -> Vec<ParticipantIdentity>;

    fn is_connected(&self, id: &ParticipantId) -> bool;

    /// Full contents of a connected player's inventory, storage order.
    fn read_live(&self, id: &ParticipantId, kind: InventoryKind) -> Option<InventorySnapshot>;

    /// One slot of a connected player's inventory. Outer `None` when the
    /// player is not connected.
    fn read_live_slot(
        &self,
        id: &ParticipantId,
        kind: InventoryKind,
        slot: usize,
    ) -> Option<Option<ItemStack>> {
        self.read_live(id, kind)
            .map(|snap| snap.slots().get(slot).cloned().flatten())
    }

    /// Overwrite one slot of a connected player's inventory.
    fn write_live_slot(
        &mut self,
        id: &ParticipantId,
        kind: InventoryKind,
        slot: usize,
        item: Option<ItemStack>,
    ) -> Result<(), HostError>;

    /// Show a container to `observer`. With a token, the host must not fire
    /// its open notifications for this screen.
    fn show_container(
        &mut self,
        observer: &ParticipantId,
        spec: ContainerSpec,
        access: Option<&SilentAccessToken>,
    ) -> Result<ViewId, HostError>;

    /// Close a container previously shown. With a token, no close
    /// notifications fire.
    fn hide_container(
        &mut self,
        observer: &ParticipantId,
        view: ViewId,
        access: Option<&SilentAccessToken>,
    );

    /// Update one container slot on the observer's client.
    fn push_slot_update(
        &mut self,
        view: ViewId,
        view_slot: usize,
        item: Option<&ItemStack>,
    ) -> Result<(), HostError>;

    /// Localized string for `key` in the observer's language with `%player%`
    /// substituted, if the host has a translation.
    fn localize(&self, observer: &ParticipantId, key: &str, player_name: &str) -> Option<String> {
        let _ = (observer, key, player_name);
        None
    }
}

/// Container title for `target`'s inventory of `kind`, as seen by `observer`.
pub fn render_title(
    host: &dyn HostWorld,
    observer: &ParticipantId,
    target: &ParticipantIdentity,
    kind: InventoryKind,
) -> String {
    host.localize(observer, kind.title_key(), &target.name)
        .unwrap_or_else(|| kind.default_title(&target.name))
}
