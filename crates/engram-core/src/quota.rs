use std::collections::BTreeMap;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::Category;

/// Per-category record caps, indexed in canonical order.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct CategoryCaps([usize; 5]);

impl CategoryCaps {
    #[must_use]
    pub fn get(&self, category: Category) -> usize {
        self.0[category.index()]
    }

    /// Sum of every cap. May exceed the budget when explicit overrides already do.
    #[must_use]
    pub fn total(&self) -> usize {
        self.0.iter().fold(0_usize, |sum, cap| sum.saturating_add(*cap))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Category, usize)> + '_ {
        Category::ALL.iter().map(|category| (*category, self.get(*category)))
    }
}

impl Serialize for CategoryCaps {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(Category::ALL.len()))?;
        for (category, cap) in self.iter() {
            map.serialize_entry(category.as_str(), &cap)?;
        }
        map.end()
    }
}

/// Slots reserved by an explicit override: `max(0, floor(value))`. NaN reserves nothing
/// and values beyond `usize` saturate.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn resolve_cap_override(value: f64) -> usize {
    value.floor().max(0.0) as usize
}

/// Split `max_memories` across categories.
///
/// Overrides are reserved first. The rest is divided evenly over the categories without
/// an override, with the remainder going one slot at a time in canonical order. Caps are
/// never clamped to the budget here; the global pass of capacity enforcement handles that.
#[must_use]
pub fn allocate_quotas(max_memories: usize, overrides: &BTreeMap<Category, f64>) -> CategoryCaps {
    let mut caps = [0_usize; 5];
    let mut remaining = i128::try_from(max_memories).unwrap_or(i128::MAX);
    let mut unset = Vec::with_capacity(Category::ALL.len());

    for category in Category::ALL {
        match overrides.get(&category) {
            Some(value) => {
                let cap = resolve_cap_override(*value);
                caps[category.index()] = cap;
                remaining = remaining.saturating_sub(i128::try_from(cap).unwrap_or(i128::MAX));
            }
            None => unset.push(category),
        }
    }

    if unset.is_empty() {
        return CategoryCaps(caps);
    }

    let spread = usize::try_from(remaining.max(0)).unwrap_or(usize::MAX);
    let base = spread / unset.len();
    let mut extra = spread % unset.len();
    for category in unset {
        caps[category.index()] = base + usize::from(extra > 0);
        extra = extra.saturating_sub(1);
    }

    CategoryCaps(caps)
}
