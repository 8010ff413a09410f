//! Backing stores for a proxy inventory and the store I/O that feeds them.
//!
//! A proxy is backed by exactly one [`InventorySource`] at a time: the live
//! object of a connected player, a detached copy loaded from the store, a
//! load still in flight, or nothing once released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{EngineConfig, PersistenceMode};
use crate::error::{HostError, StoreError};
use crate::host::{HostWorld, PlayerStore};
use crate::identity::ParticipantId;
use crate::item::{InventorySnapshot, ItemStack};
use crate::kind::InventoryKind;
use crate::proxy::{Origin, ProxyKey, SlotChange};

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Binding to a connected player's live inventory.
///
/// Holds only the key; the host owns the object and every access goes
/// through [`HostWorld`].
#[derive(Debug)]
pub struct LiveSource {
    target: ParticipantId,
    kind: InventoryKind,
    /// Highest revision the live object is known to hold.
    flushed_revision: u64,
    /// Values we wrote whose change notification has not come back yet.
    echoes: HashMap<usize, Option<ItemStack>>,
}

impl LiveSource {
    pub fn new(target: ParticipantId, kind: InventoryKind, flushed_revision: u64) -> Self {
        Self {
            target,
            kind,
            flushed_revision,
            echoes: HashMap::new(),
        }
    }

    pub fn flushed_revision(&self) -> u64 {
        self.flushed_revision
    }

    fn apply(&mut self, host: &mut dyn HostWorld, change: &SlotChange) -> Result<(), HostError> {
        if change.revision <= self.flushed_revision {
            return Ok(());
        }
        // Changes folded in from the live object are already there.
        if change.origin != Origin::Live {
            self.write(host, change.slot, change.item.clone())?;
        }
        self.flushed_revision = change.revision;
        Ok(())
    }

    pub(crate) fn write(
        &mut self,
        host: &mut dyn HostWorld,
        slot: usize,
        item: Option<ItemStack>,
    ) -> Result<(), HostError> {
        host.write_live_slot(&self.target, self.kind, slot, item.clone())?;
        self.echoes.insert(slot, item);
        Ok(())
    }

    /// Consume the pending echo for `slot` if `live` is exactly what we wrote.
    pub(crate) fn take_echo(&mut self, slot: usize, live: &Option<ItemStack>) -> bool {
        matches!(self.echoes.remove(&slot), Some(written) if written == *live)
    }
}

/// Detached copy of an offline player's inventory. It is the copy of record
/// until saved back.
#[derive(Debug)]
pub struct OfflineSource {
    slots: Vec<Option<ItemStack>>,
    applied_revision: u64,
    saved_revision: u64,
}

impl OfflineSource {
    pub fn new(snapshot: InventorySnapshot, revision: u64) -> Self {
        Self {
            slots: snapshot.into_slots(),
            applied_revision: revision,
            saved_revision: revision,
        }
    }

    /// Copy taken at a handoff: holds everything up to `applied`, of which
    /// the store is known to have everything up to `saved`.
    pub(crate) fn handed_off(snapshot: InventorySnapshot, applied: u64, saved: u64) -> Self {
        Self {
            slots: snapshot.into_slots(),
            applied_revision: applied,
            saved_revision: saved,
        }
    }

    pub(crate) fn apply(&mut self, change: &SlotChange) {
        if change.revision <= self.applied_revision {
            return;
        }
        if let Some(slot) = self.slots.get_mut(change.slot) {
            *slot = change.item.clone();
        }
        self.applied_revision = change.revision;
    }

    pub fn applied_revision(&self) -> u64 {
        self.applied_revision
    }

    /// Whether changes were applied since the last successful save.
    pub fn is_dirty(&self) -> bool {
        self.applied_revision > self.saved_revision
    }

    pub fn snapshot(&self) -> InventorySnapshot {
        InventorySnapshot::new(self.slots.clone())
    }

    pub(crate) fn slots(&self) -> &[Option<ItemStack>] {
        &self.slots
    }

    pub(crate) fn mark_saved(&mut self, revision: u64) {
        self.saved_revision = self.saved_revision.max(revision);
    }
}

/// What currently backs a proxy inventory.
#[derive(Debug)]
pub enum InventorySource {
    /// Store load in flight; accepted changes are held until it completes.
    Loading,
    Live(LiveSource),
    Offline(OfflineSource),
    /// Released. Writes fail with `SourceDetached`.
    Detached,
}

impl InventorySource {
    pub fn label(&self) -> &'static str {
        match self {
            InventorySource::Loading => "loading",
            InventorySource::Live(_) => "live",
            InventorySource::Offline(_) => "offline",
            InventorySource::Detached => "detached",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, InventorySource::Live(_))
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, InventorySource::Offline(_))
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, InventorySource::Loading)
    }

    pub fn is_detached(&self) -> bool {
        matches!(self, InventorySource::Detached)
    }

    /// Apply one accepted change to the backing store. Replays of an already
    /// applied revision are no-ops.
    pub(crate) fn apply(
        &mut self,
        host: &mut dyn HostWorld,
        change: &SlotChange,
    ) -> Result<(), HostError> {
        match self {
            InventorySource::Live(live) => live.apply(host, change),
            InventorySource::Offline(offline) => {
                offline.apply(change);
                Ok(())
            }
            InventorySource::Loading | InventorySource::Detached => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Store I/O
// ---------------------------------------------------------------------------

/// Completion of a background store call.
#[derive(Debug)]
pub(crate) enum StoreReply {
    Loaded {
        key: ProxyKey,
        result: Result<InventorySnapshot, StoreError>,
    },
    Saved {
        key: ProxyKey,
        revision: u64,
        result: Result<(), StoreError>,
    },
}

/// Runs store calls inline or on the blocking pool, depending on
/// [`PersistenceMode`].
pub(crate) struct StoreRunner {
    store: Arc<dyn PlayerStore>,
    runtime: Option<Handle>,
    timeout: Duration,
    replies: mpsc::UnboundedSender<StoreReply>,
}

impl StoreRunner {
    pub fn new(
        store: Arc<dyn PlayerStore>,
        config: &EngineConfig,
        replies: mpsc::UnboundedSender<StoreReply>,
    ) -> Self {
        let runtime = match config.persistence {
            PersistenceMode::Blocking => None,
            PersistenceMode::Background => match Handle::try_current() {
                Ok(handle) => Some(handle),
                Err(_) => {
                    warn!("Background persistence needs a tokio runtime; falling back to blocking");
                    None
                }
            },
        };
        Self {
            store,
            runtime,
            timeout: config.store_timeout(),
            replies,
        }
    }

    pub fn store(&self) -> &dyn PlayerStore {
        self.store.as_ref()
    }

    /// Load and validate an inventory. Returns the result when it completed
    /// inline; otherwise it arrives later as [`StoreReply::Loaded`].
    pub fn load(&self, key: &ProxyKey) -> Option<Result<InventorySnapshot, StoreError>> {
        let kind = key.kind;
        let Some(runtime) = &self.runtime else {
            return Some(
                self.store
                    .load(&key.target, kind)
                    .and_then(|snap| snap.validate(kind)),
            );
        };

        debug!("Loading {} of {} in background", kind, key.target);
        let store = Arc::clone(&self.store);
        let replies = self.replies.clone();
        let timeout = self.timeout;
        let key = key.clone();
        runtime.spawn(async move {
            let target = key.target.clone();
            let result = run_bounded(timeout, move || {
                store.load(&target, kind).and_then(|snap| snap.validate(kind))
            })
            .await;
            let _ = replies.send(StoreReply::Loaded { key, result });
        });
        None
    }

    /// Save an inventory snapshot taken at `revision`. Same completion rules
    /// as [`load`](Self::load).
    pub fn save(
        &self,
        key: &ProxyKey,
        snapshot: InventorySnapshot,
        revision: u64,
    ) -> Option<Result<(), StoreError>> {
        let Some(runtime) = &self.runtime else {
            return Some(self.store.save(&key.target, key.kind, &snapshot));
        };

        debug!("Saving {} of {} in background", key.kind, key.target);
        let store = Arc::clone(&self.store);
        let replies = self.replies.clone();
        let timeout = self.timeout;
        let key = key.clone();
        runtime.spawn(async move {
            let (target, kind) = (key.target.clone(), key.kind);
            let result = run_bounded(timeout, move || store.save(&target, kind, &snapshot)).await;
            let _ = replies.send(StoreReply::Saved {
                key,
                revision,
                result,
            });
        });
        None
    }
}

async fn run_bounded<T, F>(timeout: Duration, call: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(call)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(StoreError::Unavailable(format!("store task failed: {join}"))),
        Err(_) => Err(StoreError::TimedOut(timeout.as_millis() as u64)),
    }
}
