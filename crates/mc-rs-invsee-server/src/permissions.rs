//! Operator permission nodes, persisted as a JSON object of
//! operator name → granted nodes.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use mc_rs_invsee::{InventoryKind, InvseeError};
use tracing::{info, warn};

pub const NODE_INVENTORY: &str = "invsee.inventory";
pub const NODE_ENDERCHEST: &str = "invsee.enderchest";
pub const NODE_ARMOR: &str = "invsee.armor";
pub const NODE_SEARCH: &str = "invsee.search";
/// Grants every node.
pub const NODE_ALL: &str = "invsee.*";

pub const PERMISSIONS_FILE: &str = "permissions.json";

/// Node needed to open a kind of inventory.
pub fn node_for(kind: InventoryKind) -> &'static str {
    match kind {
        InventoryKind::Main => NODE_INVENTORY,
        InventoryKind::Armor => NODE_ARMOR,
        InventoryKind::EnderChest => NODE_ENDERCHEST,
    }
}

pub struct Permissions {
    path: PathBuf,
    /// Lowercased operator name → nodes.
    grants: BTreeMap<String, BTreeSet<String>>,
}

impl Permissions {
    /// Load grants from `path`. A missing or unreadable file yields no grants.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let grants = if path.exists() {
            match fs::read_to_string(&path) {
                Ok(contents) => match serde_json::from_str::<BTreeMap<String, BTreeSet<String>>>(&contents) {
                    Ok(map) => {
                        info!("Loaded permissions for {} operators from {}", map.len(), path.display());
                        map.into_iter()
                            .map(|(name, nodes)| (name.to_lowercase(), nodes))
                            .collect()
                    }
                    Err(e) => {
                        warn!("Failed to parse {}: {e}", path.display());
                        BTreeMap::new()
                    }
                },
                Err(e) => {
                    warn!("Failed to read {}: {e}", path.display());
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };
        Self { path, grants }
    }

    pub fn save(&self) {
        match serde_json::to_string_pretty(&self.grants) {
            Ok(json) => {
                if let Err(e) = fs::write(&self.path, json) {
                    warn!("Failed to write {}: {e}", self.path.display());
                }
            }
            Err(e) => warn!("Failed to serialize permissions: {e}"),
        }
    }

    pub fn grant(&mut self, operator: &str, node: &str) {
        self.grants
            .entry(operator.to_lowercase())
            .or_default()
            .insert(node.to_string());
    }

    pub fn has(&self, operator: &str, node: &str) -> bool {
        self.grants
            .get(&operator.to_lowercase())
            .is_some_and(|nodes| nodes.contains(node) || nodes.contains(NODE_ALL))
    }

    pub fn check(&self, operator: &str, node: &str) -> Result<(), InvseeError> {
        if self.has(operator, node) {
            Ok(())
        } else {
            Err(InvseeError::PermissionDenied {
                node: node.to_string(),
            })
        }
    }
}
