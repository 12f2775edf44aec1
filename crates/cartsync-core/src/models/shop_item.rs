//! Shopping-list item model

use serde::{Deserialize, Serialize};

use super::LocalId;

/// An entry on the shopping list. Its identity follows its product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShopItem {
    /// Store-assigned identifier (`None` until inserted)
    pub id: Option<LocalId>,
    /// Product being bought
    pub product_id: LocalId,
    /// Free-form quantity ("2", "500 g")
    pub quantity: Option<String>,
    /// Free-form comment
    pub comment: Option<String>,
    /// Already in the cart
    pub checked: bool,
}

impl ShopItem {
    /// Create an unsaved, unchecked item for a product
    #[must_use]
    pub const fn new(product_id: LocalId) -> Self {
        Self {
            id: None,
            product_id,
            quantity: None,
            comment: None,
            checked: false,
        }
    }

    /// Set the quantity
    #[must_use]
    pub fn with_quantity(mut self, quantity: impl Into<String>) -> Self {
        self.quantity = Some(quantity.into());
        self
    }
}
