//! Inventory kinds and their container layout.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which of a player's inventories is being viewed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryKind {
    /// 36 slots: hotbar (0-8) followed by the 27 storage slots.
    Main,
    /// 4 slots: helmet, chestplate, leggings, boots.
    Armor,
    /// 27 slots.
    EnderChest,
}

impl InventoryKind {
    pub const ALL: [InventoryKind; 3] = [
        InventoryKind::Main,
        InventoryKind::Armor,
        InventoryKind::EnderChest,
    ];

    /// Number of slots.
    pub fn size(self) -> usize {
        match self {
            InventoryKind::Main => 36,
            InventoryKind::Armor => 4,
            InventoryKind::EnderChest => 27,
        }
    }

    /// Rows of the container menu used to display this kind.
    pub fn rows(self) -> usize {
        self.size().div_ceil(9)
    }

    /// Translation key for the container title.
    pub fn title_key(self) -> &'static str {
        match self {
            InventoryKind::Main => "container.player",
            InventoryKind::Armor => "container.armor",
            InventoryKind::EnderChest => "container.enderchest",
        }
    }

    /// Title used when the rendering layer has no translation.
    pub fn default_title(self, owner: &str) -> String {
        let suffix = match self {
            InventoryKind::Main => "'s Inventory",
            InventoryKind::Armor => "'s Armor",
            InventoryKind::EnderChest => "'s Ender Chest",
        };
        format!("{owner}{suffix}")
    }

    /// Map a storage slot to the position shown in the container.
    ///
    /// The main inventory is displayed the way a player sees it: storage rows
    /// on top, hotbar along the bottom.
    pub fn to_view_slot(self, storage: usize) -> usize {
        match self {
            InventoryKind::Main if storage < 9 => storage + 27,
            InventoryKind::Main => storage - 9,
            _ => storage,
        }
    }

    /// Inverse of [`to_view_slot`](Self::to_view_slot). Returns `None` for
    /// positions outside the inventory.
    pub fn to_storage_slot(self, view: usize) -> Option<usize> {
        if view >= self.size() {
            return None;
        }
        Some(match self {
            InventoryKind::Main if view < 27 => view + 9,
            InventoryKind::Main => view - 27,
            _ => view,
        })
    }

    /// Reorder storage-ordered contents into container order.
    pub fn to_view_order<T: Clone>(self, storage: &[T]) -> Vec<T> {
        let mut out = storage.to_vec();
        for (i, item) in storage.iter().enumerate() {
            let v = self.to_view_slot(i);
            if v < out.len() {
                out[v] = item.clone();
            }
        }
        out
    }
}

impl fmt::Display for InventoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InventoryKind::Main => "inventory",
            InventoryKind::Armor => "armor",
            InventoryKind::EnderChest => "ender chest",
        })
    }
}

impl FromStr for InventoryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "main" | "inv" | "inventory" => Ok(InventoryKind::Main),
            "armor" | "armour" => Ok(InventoryKind::Armor),
            "ender" | "enderchest" | "ender_chest" | "echest" => Ok(InventoryKind::EnderChest),
            other => Err(format!("unknown inventory kind: {other}")),
        }
    }
}
