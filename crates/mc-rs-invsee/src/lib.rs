//! Silent inventory inspection and editing for online and offline players.
//!
//! An operator opens another player's main inventory, armor or ender chest as
//! an ordinary container. All operators looking at the same target share one
//! [`ProxyInventory`]; edits from any of them, or from the target's own live
//! session, are fanned out to every other open view on the next tick. Offline
//! targets are backed by a surrogate loaded from the player store and written
//! back when the last view closes.
//!
//! The crate never touches the host world directly: everything goes through
//! the [`HostWorld`] and [`PlayerStore`] traits, and all mutation of live
//! objects happens inside [`Engine::tick`].

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod host;
pub mod identity;
pub mod item;
pub mod kind;
pub mod proxy;
pub mod registry;
pub mod search;
pub mod silent;
pub mod source;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{EngineConfig, PersistenceMode};
pub use engine::{Engine, EngineHandle, OpenReceiver, ViewHandle};
pub use error::{HostError, InvseeError, StoreError};
pub use host::{ContainerSpec, HostEvent, HostWorld, PlayerStore, ViewId};
pub use identity::{IdentityResolver, ParticipantId, ParticipantIdentity};
pub use item::{Enchantment, InventorySnapshot, ItemStack, Slot};
pub use kind::InventoryKind;
pub use proxy::{Origin, ProxyInventory, SlotChange};
pub use registry::{EntryId, ObserverEntry, ObserverRegistry};
pub use search::{EnchantFilter, ItemMatcher, SearchHit};
pub use silent::{AccessState, SilentAccess, SilentAccessToken};
