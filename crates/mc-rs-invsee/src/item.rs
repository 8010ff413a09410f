//! Item stacks, slots and inventory snapshots.

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::kind::InventoryKind;

/// Largest amount a single slot may hold.
pub const MAX_STACK_SIZE: u8 = 64;

/// An enchantment applied to an item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Enchantment {
    pub id: String,
    pub level: u8,
}

/// A stack of items occupying one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStack {
    /// Namespaced item identifier, e.g. `minecraft:diamond`.
    pub id: String,
    pub count: u8,
    #[serde(default)]
    pub damage: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enchantments: Vec<Enchantment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
}

impl ItemStack {
    /// Create a plain stack with no damage or enchantments.
    pub fn new(id: impl Into<String>, count: u8) -> Self {
        Self {
            id: id.into(),
            count,
            damage: 0,
            enchantments: Vec::new(),
            custom_name: None,
        }
    }

    /// Builder-style helper adding an enchantment.
    pub fn with_enchantment(mut self, id: impl Into<String>, level: u8) -> Self {
        self.enchantments.push(Enchantment {
            id: id.into(),
            level,
        });
        self
    }

    /// Level of the given enchantment, or 0 when absent.
    pub fn enchant_level(&self, id: &str) -> u8 {
        self.enchantments
            .iter()
            .filter(|e| e.id == id)
            .map(|e| e.level)
            .max()
            .unwrap_or(0)
    }

    /// Why this stack could not have come from a well-formed inventory, if so.
    pub fn defect(&self) -> Option<String> {
        if self.id.is_empty() {
            return Some("empty item id".into());
        }
        if self.count > MAX_STACK_SIZE {
            return Some(format!("count {} exceeds {MAX_STACK_SIZE}", self.count));
        }
        None
    }
}

/// Collapse zero-count stacks to an empty slot.
pub fn normalize(item: Option<ItemStack>) -> Option<ItemStack> {
    item.filter(|i| i.count > 0)
}

/// One slot of an inventory: its index and contents (`None` = empty).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub index: usize,
    pub item: Option<ItemStack>,
}

/// Ordered slot contents of one inventory, as exchanged with the store and
/// the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InventorySnapshot {
    slots: Vec<Option<ItemStack>>,
}

impl InventorySnapshot {
    pub fn new(slots: Vec<Option<ItemStack>>) -> Self {
        Self { slots }
    }

    /// An all-empty snapshot sized for `kind`.
    pub fn empty(kind: InventoryKind) -> Self {
        Self {
            slots: vec![None; kind.size()],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether every slot is empty.
    pub fn is_cleared(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn get(&self, index: usize) -> Option<&ItemStack> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn set(&mut self, index: usize, item: Option<ItemStack>) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = item;
        }
    }

    pub fn slots(&self) -> &[Option<ItemStack>] {
        &self.slots
    }

    pub fn into_slots(self) -> Vec<Option<ItemStack>> {
        self.slots
    }

    /// Check the snapshot against `kind` and pad it to full size.
    ///
    /// Zero-count stacks are treated as empty slots.
    pub fn validate(self, kind: InventoryKind) -> Result<Self, StoreError> {
        let size = kind.size();
        if self.slots.len() > size {
            return Err(StoreError::Corrupt {
                slot: Some(size),
                reason: format!("{} slots stored for a {size}-slot inventory", self.slots.len()),
            });
        }
        let mut slots = Vec::with_capacity(size);
        for (index, item) in self.slots.into_iter().enumerate() {
            if let Some(reason) = item.as_ref().and_then(ItemStack::defect) {
                return Err(StoreError::Corrupt {
                    slot: Some(index),
                    reason,
                });
            }
            slots.push(normalize(item));
        }
        slots.resize(size, None);
        Ok(Self { slots })
    }
}
