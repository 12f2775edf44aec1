//! Entity kinds and local identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Identifier assigned by the local store. Unique per entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalId(i64);

impl LocalId {
    /// Wrap a raw store id
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Raw value as stored in `SQLite`
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LocalId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

/// The closed set of synchronized entity types.
///
/// Declaration order is the foreign-key dependency order: products refer to
/// categories and shopping-list items refer to products, so bulk
/// reconciliation walks [`EntityKind::ALL`] front to back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Product category
    Category,
    /// Product that can be put on the list
    Product,
    /// Entry on the shopping list
    ShopItem,
}

impl EntityKind {
    /// All kinds in dependency order
    pub const ALL: [Self; 3] = [Self::Category, Self::Product, Self::ShopItem];

    /// Stable name used in the `sync_records` table
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::Product => "product",
            Self::ShopItem => "shop_item",
        }
    }

    /// Path segment under `lists/{listId}` holding this kind's documents
    #[must_use]
    pub const fn remote_segment(self) -> &'static str {
        match self {
            Self::Category => "categories",
            Self::Product => "products",
            Self::ShopItem => "shopItems",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "category" => Ok(Self::Category),
            "product" => Ok(Self::Product),
            "shop_item" => Ok(Self::ShopItem),
            other => Err(Error::InvalidInput(format!("unknown entity kind '{other}'"))),
        }
    }
}

/// A (kind, local id) pair, used in change notifications and failure reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub local_id: LocalId,
}

impl EntityRef {
    #[must_use]
    pub const fn new(kind: EntityKind, local_id: LocalId) -> Self {
        Self { kind, local_id }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.local_id)
    }
}
