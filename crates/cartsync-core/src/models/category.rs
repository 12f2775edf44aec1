//! Category model

use serde::{Deserialize, Serialize};

use super::LocalId;

/// A product category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    /// Store-assigned identifier (`None` until inserted)
    pub id: Option<LocalId>,
    /// Display name
    pub name: String,
    /// ARGB color used when rendering the category
    pub color: Option<i64>,
}

impl Category {
    /// Create an unsaved category
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            color: None,
        }
    }

    /// Set the color
    #[must_use]
    pub const fn with_color(mut self, color: i64) -> Self {
        self.color = Some(color);
        self
    }
}
