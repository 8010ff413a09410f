//! Player data persistence: one JSON file per player under `players/`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use mc_rs_invsee::{
    InventoryKind, InventorySnapshot, ParticipantId, ParticipantIdentity, PlayerStore, StoreError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Serializable player data. Kinds never saved are absent.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PlayerFile {
    /// Last known display name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<InventorySnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub armor: Option<InventorySnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ender_chest: Option<InventorySnapshot>,
}

impl PlayerFile {
    pub fn inventory(&self, kind: InventoryKind) -> Option<&InventorySnapshot> {
        match kind {
            InventoryKind::Main => self.main.as_ref(),
            InventoryKind::Armor => self.armor.as_ref(),
            InventoryKind::EnderChest => self.ender_chest.as_ref(),
        }
    }

    pub fn set_inventory(&mut self, kind: InventoryKind, snapshot: InventorySnapshot) {
        let slot = match kind {
            InventoryKind::Main => &mut self.main,
            InventoryKind::Armor => &mut self.armor,
            InventoryKind::EnderChest => &mut self.ender_chest,
        };
        *slot = Some(snapshot);
    }
}

pub struct JsonPlayerStore {
    players_dir: PathBuf,
    /// Serializes read-modify-write of player files.
    write_lock: Mutex<()>,
}

impl JsonPlayerStore {
    /// Open (creating if needed) the store rooted at `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        let players_dir = dir.as_ref().join("players");
        fs::create_dir_all(&players_dir)?;
        Ok(Self {
            players_dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path(&self, id: &ParticipantId) -> PathBuf {
        self.players_dir.join(format!("{id}.json"))
    }

    /// Read a player's file. A missing file is `Ok(None)`.
    pub fn read(&self, id: &ParticipantId) -> Result<Option<PlayerFile>, StoreError> {
        let path = self.path(id);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Unavailable(format!("{}: {e}", path.display()))),
        };
        serde_json::from_str(&data)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                slot: None,
                reason: format!("{}: {e}", path.display()),
            })
    }

    /// Replace a player's file. The new contents go to a temporary file
    /// first; the previous file is kept as `<id>.json_old`.
    pub fn write(&self, id: &ParticipantId, file: &PlayerFile) -> Result<(), StoreError> {
        let path = self.path(id);
        let json = serde_json::to_string_pretty(file)
            .map_err(|e| StoreError::Unavailable(format!("serialize {id}: {e}")))?;
        let unavailable = |e: io::Error| StoreError::Unavailable(format!("{}: {e}", path.display()));

        let tmp = path.with_extension("json_tmp");
        fs::write(&tmp, json).map_err(unavailable)?;
        if path.exists() {
            let backup = path.with_extension("json_old");
            if let Err(e) = fs::copy(&path, &backup) {
                warn!("Failed to back up {}: {e}", path.display());
            }
        }
        fs::rename(&tmp, &path).map_err(unavailable)?;
        debug!("Wrote {}", path.display());
        Ok(())
    }

    /// Record a player (or their new name) so they can be found while offline.
    pub fn remember(&self, who: &ParticipantIdentity) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.read(&who.id)?.unwrap_or_default();
        if file.name == who.name {
            return Ok(());
        }
        file.name = who.name.clone();
        self.write(&who.id, &file)
    }
}

impl PlayerStore for JsonPlayerStore {
    fn known_players(&self) -> Result<Vec<ParticipantIdentity>, StoreError> {
        let entries = fs::read_dir(&self.players_dir).map_err(|e| {
            StoreError::Unavailable(format!("{}: {e}", self.players_dir.display()))
        })?;
        let mut known = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let id = ParticipantId::new(stem);
            match self.read(&id) {
                Ok(Some(file)) => known.push(ParticipantIdentity {
                    id,
                    name: file.name,
                }),
                Ok(None) => {}
                Err(e) => warn!("Skipping player file {}: {e}", path.display()),
            }
        }
        Ok(known)
    }

    fn load(&self, id: &ParticipantId, kind: InventoryKind) -> Result<InventorySnapshot, StoreError> {
        let file = self.read(id)?.ok_or(StoreError::NoData)?;
        Ok(file
            .inventory(kind)
            .cloned()
            .unwrap_or_else(|| InventorySnapshot::empty(kind)))
    }

    fn save(
        &self,
        id: &ParticipantId,
        kind: InventoryKind,
        snapshot: &InventorySnapshot,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.read(id)?.unwrap_or_else(|| PlayerFile {
            name: id.to_string(),
            ..PlayerFile::default()
        });
        file.set_inventory(kind, snapshot.clone());
        self.write(id, &file)
    }
}
