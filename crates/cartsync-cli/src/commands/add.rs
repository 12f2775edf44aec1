use cartsync_core::util::normalize_natural_id;
use cartsync_core::util::normalize_text_option;
use cartsync_core::{Category, LocalId, LocalStore, Product, ShopItem};

use crate::cli::AddCommand;
use crate::commands::common::require_name;
use crate::error::CliError;

pub fn run_add(command: AddCommand, store: &dyn LocalStore) -> Result<(), CliError> {
    let id = match command {
        AddCommand::Category { name, color } => {
            let mut category = Category::new(require_name(&name)?);
            category.color = color;
            store.insert_category(&category)?.id
        }
        AddCommand::Product { name, category } => {
            let mut product = Product::new(require_name(&name)?);
            if let Some(category) = category {
                product.category_id = Some(find_category(store, &category)?);
            }
            store.insert_product(&product)?.id
        }
        AddCommand::Item {
            product,
            quantity,
            comment,
        } => {
            let product_id = find_or_create_product(store, &require_name(&product)?)?;
            let item = ShopItem {
                quantity: normalize_text_option(quantity),
                comment: normalize_text_option(comment),
                ..ShopItem::new(product_id)
            };
            store.insert_shop_item(&item)?.id
        }
    };

    if let Some(id) = id {
        println!("{id}");
    }
    Ok(())
}

fn find_category(store: &dyn LocalStore, name: &str) -> Result<LocalId, CliError> {
    let wanted = normalize_natural_id(name);
    store
        .list_categories()?
        .into_iter()
        .find(|category| normalize_natural_id(&category.name) == wanted)
        .and_then(|category| category.id)
        .ok_or_else(|| CliError::UnknownCategory(name.to_string()))
}

/// Product whose name has the same natural id as `name`
pub fn find_product(store: &dyn LocalStore, name: &str) -> Result<Option<LocalId>, CliError> {
    let wanted = normalize_natural_id(name);
    Ok(store
        .list_products()?
        .into_iter()
        .find(|product| normalize_natural_id(&product.name) == wanted)
        .and_then(|product| product.id))
}

/// Products are matched by natural id so "milk" reuses "Milk"
pub fn find_or_create_product(store: &dyn LocalStore, name: &str) -> Result<LocalId, CliError> {
    if let Some(id) = find_product(store, name)? {
        return Ok(id);
    }
    let created = store.insert_product(&Product::new(name))?;
    created.id.ok_or(CliError::EmptyName)
}

#[cfg(test)]
mod tests {
    use cartsync_core::SqliteLocalStore;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn item_reuses_product_by_natural_id() {
        let store = SqliteLocalStore::open_in_memory().unwrap();
        let milk = store.insert_product(&Product::new("Whole Milk")).unwrap();
        run_add(
            AddCommand::Item {
                product: "  whole   milk".to_string(),
                quantity: Some(" 2 ".to_string()),
                comment: Some(String::new()),
            },
            &store,
        )
        .unwrap();

        assert_eq!(store.list_products().unwrap().len(), 1);
        let items = store.list_shop_items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].product_id, milk.id.unwrap());
        assert_eq!(items[0].quantity.as_deref(), Some("2"));
        assert!(items[0].comment.is_none());
    }

    #[test]
    fn product_with_unknown_category_fails() {
        let store = SqliteLocalStore::open_in_memory().unwrap();
        let result = run_add(
            AddCommand::Product {
                name: "Apple".to_string(),
                category: Some("Fruit".to_string()),
            },
            &store,
        );
        assert!(matches!(result, Err(CliError::UnknownCategory(_))));
        assert!(store.list_products().unwrap().is_empty());
    }
}
