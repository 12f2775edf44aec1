//! Product model

use serde::{Deserialize, Serialize};

use super::LocalId;

/// A product that can be put on the shopping list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Store-assigned identifier (`None` until inserted)
    pub id: Option<LocalId>,
    /// Display name
    pub name: String,
    /// Optional category
    pub category_id: Option<LocalId>,
}

impl Product {
    /// Create an unsaved product without a category
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            category_id: None,
        }
    }

    /// Put the product in a category
    #[must_use]
    pub const fn in_category(mut self, category_id: LocalId) -> Self {
        self.category_id = Some(category_id);
        self
    }
}
