use std::collections::HashMap;

use cartsync_core::{Category, LocalId, LocalStore, Product, ShopItem};
use serde::Serialize;

use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct ListView {
    pub categories: Vec<Category>,
    pub products: Vec<Product>,
    pub items: Vec<ShopItem>,
}

impl ListView {
    pub fn load(store: &dyn LocalStore) -> Result<Self, CliError> {
        Ok(Self {
            categories: store.list_categories()?,
            products: store.list_products()?,
            items: store.list_shop_items()?,
        })
    }

    /// One line per entry, grouped by kind
    pub fn lines(&self) -> Vec<String> {
        let category_names: HashMap<LocalId, &str> = self
            .categories
            .iter()
            .filter_map(|category| Some((category.id?, category.name.as_str())))
            .collect();
        let product_names: HashMap<LocalId, &str> = self
            .products
            .iter()
            .filter_map(|product| Some((product.id?, product.name.as_str())))
            .collect();

        let mut lines = Vec::new();
        for category in &self.categories {
            let color = category
                .color
                .map(|color| format!(" #{color:08x}"))
                .unwrap_or_default();
            lines.push(format!("category {}{color}", category.name));
        }
        for product in &self.products {
            let category = product
                .category_id
                .and_then(|id| category_names.get(&id))
                .map(|name| format!(" ({name})"))
                .unwrap_or_default();
            lines.push(format!("product  {}{category}", product.name));
        }
        for item in &self.items {
            let product = product_names.get(&item.product_id).copied().unwrap_or("?");
            let mark = if item.checked { 'x' } else { ' ' };
            let quantity = item
                .quantity
                .as_deref()
                .map(|quantity| format!(" x{quantity}"))
                .unwrap_or_default();
            let comment = item
                .comment
                .as_deref()
                .map(|comment| format!(" - {comment}"))
                .unwrap_or_default();
            lines.push(format!("item     [{mark}] {product}{quantity}{comment}"));
        }
        lines
    }
}

pub fn run_list(store: &dyn LocalStore, as_json: bool) -> Result<(), CliError> {
    let view = ListView::load(store)?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else if view.categories.is_empty() && view.products.is_empty() && view.items.is_empty() {
        println!("The list is empty.");
    } else {
        for line in view.lines() {
            println!("{line}");
        }
    }

    Ok(())
}
