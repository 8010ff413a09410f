//! Finding players who carry matching items.

use crate::identity::ParticipantIdentity;
use crate::item::ItemStack;
use crate::kind::InventoryKind;

/// Enchantment requirement of an [`ItemMatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnchantFilter {
    /// The named enchantment at `min_level` or above (any level when 0).
    Specific { id: String, min_level: u8 },
    /// Any enchantment at `min_level` or above.
    Any { min_level: u8 },
}

/// Conjunction of item filters. An empty matcher matches any non-empty slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemMatcher {
    pub item: Option<String>,
    pub min_amount: u8,
    pub enchant: Option<EnchantFilter>,
}

impl ItemMatcher {
    pub fn item(id: impl Into<String>) -> Self {
        Self {
            item: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn enchanted(enchant: EnchantFilter) -> Self {
        Self {
            enchant: Some(enchant),
            ..Self::default()
        }
    }

    pub fn with_min_amount(mut self, min_amount: u8) -> Self {
        self.min_amount = min_amount;
        self
    }

    pub fn matches(&self, stack: &ItemStack) -> bool {
        if stack.count == 0 {
            return false;
        }
        if self.item.as_ref().is_some_and(|id| !item_id_matches(id, &stack.id)) {
            return false;
        }
        if stack.count < self.min_amount {
            return false;
        }
        match &self.enchant {
            None => true,
            Some(EnchantFilter::Specific { id, min_level }) => {
                let level = stack
                    .enchantments
                    .iter()
                    .filter(|e| item_id_matches(id, &e.id))
                    .map(|e| e.level)
                    .max();
                level.is_some_and(|l| l >= (*min_level).max(1))
            }
            Some(EnchantFilter::Any { min_level }) => {
                stack.enchantments.iter().any(|e| e.level >= *min_level)
            }
        }
    }
}

/// `stone` matches `minecraft:stone`; a namespaced query must match exactly.
fn item_id_matches(query: &str, id: &str) -> bool {
    if query.contains(':') {
        query.eq_ignore_ascii_case(id)
    } else {
        id.rsplit(':')
            .next()
            .is_some_and(|path| path.eq_ignore_ascii_case(query))
    }
}

/// One inventory containing matching items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub target: ParticipantIdentity,
    pub kind: InventoryKind,
    /// Storage slots holding matches.
    pub slots: Vec<usize>,
    /// Sum of matching stack sizes.
    pub total: u32,
}

/// Match one inventory's slots.
pub fn scan(
    matcher: &ItemMatcher,
    target: &ParticipantIdentity,
    kind: InventoryKind,
    slots: &[Option<ItemStack>],
) -> Option<SearchHit> {
    let mut hit = SearchHit {
        target: target.clone(),
        kind,
        slots: Vec::new(),
        total: 0,
    };
    for (index, stack) in slots.iter().enumerate() {
        if let Some(stack) = stack.as_ref().filter(|s| matcher.matches(s)) {
            hit.slots.push(index);
            hit.total += u32::from(stack.count);
        }
    }
    (!hit.slots.is_empty()).then_some(hit)
}
