//! Per-kind conversion between local entities and remote documents.
//!
//! Foreign keys never cross replicas as-is: a product's `category_id` is
//! written as the category's remote id in the same list, and read back by
//! looking that remote id up in the sync records.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::codec;
use crate::db::LocalStore;
use crate::error::{Error, Result};
use crate::models::{Category, EntityKind, EntityRef, LocalId, Product, ShopItem};
use crate::remote::{FieldMap, RemotePath};
use crate::util::normalize_natural_id;

/// Conversion and local persistence for one entity kind
pub trait EntityTranslator: Send + Sync {
    type Entity: Clone + PartialEq + fmt::Debug + Send + Sync;

    const KIND: EntityKind;

    fn store(&self) -> &dyn LocalStore;

    fn id_of(entity: &Self::Entity) -> Option<LocalId>;

    /// Normalized matching key of a local entity
    fn natural_id(&self, entity: &Self::Entity) -> Result<Option<String>>;

    /// Matching key of a remote document, normalized the same way
    fn remote_natural_id(&self, fields: &FieldMap, list_id: &str) -> Result<Option<String>>;

    /// Full document body stamped with `last_change_date`. Fails when a
    /// referenced entity has no remote id in `list_id` yet.
    fn to_remote(
        &self,
        entity: &Self::Entity,
        list_id: &str,
        last_change_date: Option<i64>,
    ) -> Result<FieldMap>;

    /// Overwrite local fields from a document
    fn from_remote(&self, entity: &mut Self::Entity, fields: &FieldMap, list_id: &str)
        -> Result<()>;

    /// Unsaved entity built from a document
    fn new_local(&self, fields: &FieldMap, list_id: &str) -> Result<Self::Entity>;

    fn load_all(&self) -> Result<Vec<Self::Entity>>;
    fn find_local(&self, id: LocalId) -> Result<Option<Self::Entity>>;
    fn insert_local(&self, entity: &Self::Entity) -> Result<Self::Entity>;
    fn save_local(&self, entity: &Self::Entity) -> Result<()>;
    fn remove_local(&self, id: LocalId) -> Result<()>;

    /// Entities removed together with this one
    fn dependents(&self, _id: LocalId) -> Result<Vec<EntityRef>> {
        Ok(Vec::new())
    }

    /// Local entities with the given natural id, in id order
    fn find_local_by_natural_id(&self, natural_id: &str) -> Result<Vec<Self::Entity>> {
        let mut matches = Vec::new();
        for entity in self.load_all()? {
            if self.natural_id(&entity)?.as_deref() == Some(natural_id) {
                matches.push(entity);
            }
        }
        Ok(matches)
    }

    fn remote_path(&self, list_id: &str, remote_id: &str) -> Result<RemotePath> {
        Ok(RemotePath::document(list_id, Self::KIND, remote_id)?)
    }
}

fn require_id(id: Option<LocalId>, kind: EntityKind) -> Result<LocalId> {
    id.ok_or_else(|| Error::InvalidInput(format!("{kind} has not been saved")))
}

/// Remote id of a referenced entity in `list_id`
fn remote_reference(
    store: &dyn LocalStore,
    kind: EntityKind,
    local_id: LocalId,
    list_id: &str,
) -> Result<String> {
    store
        .find_sync_record(kind, local_id, list_id)?
        .map(|record| record.external_id)
        .ok_or_else(|| Error::MissingReference {
            kind,
            detail: format!("{kind}#{local_id} has no remote id in list {list_id}"),
        })
}

/// Local id behind a remote reference in `list_id`
fn local_reference(
    store: &dyn LocalStore,
    kind: EntityKind,
    remote_id: &str,
    list_id: &str,
) -> Result<Option<LocalId>> {
    Ok(store
        .find_sync_record_by_external_id(kind, remote_id, list_id)?
        .filter(|record| !record.deleted)
        .map(|record| record.local_id))
}

/// Display name of a document, falling back to its natural id
fn remote_name(fields: &FieldMap, kind: EntityKind) -> Result<String> {
    codec::str_field(fields, codec::NAME)
        .or_else(|| codec::str_field(fields, codec::NATURAL_ID))
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidInput(format!("{kind} document has no name")))
}

fn base_document(natural_id: Option<String>, last_change_date: Option<i64>) -> FieldMap {
    let mut fields = FieldMap::new();
    if let Some(natural_id) = natural_id {
        fields.insert(codec::NATURAL_ID.to_string(), Value::String(natural_id));
    }
    codec::put_i64(&mut fields, codec::LAST_CHANGE_DATE, last_change_date);
    fields
}

pub struct CategoryTranslator {
    store: Arc<dyn LocalStore>,
}

impl CategoryTranslator {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }
}

impl EntityTranslator for CategoryTranslator {
    type Entity = Category;

    const KIND: EntityKind = EntityKind::Category;

    fn store(&self) -> &dyn LocalStore {
        self.store.as_ref()
    }

    fn id_of(entity: &Category) -> Option<LocalId> {
        entity.id
    }

    fn natural_id(&self, entity: &Category) -> Result<Option<String>> {
        Ok(normalize_natural_id(&entity.name))
    }

    fn remote_natural_id(&self, fields: &FieldMap, _list_id: &str) -> Result<Option<String>> {
        Ok(codec::natural_id_field(fields)
            .or_else(|| codec::str_field(fields, codec::NAME).and_then(normalize_natural_id)))
    }

    fn to_remote(
        &self,
        entity: &Category,
        _list_id: &str,
        last_change_date: Option<i64>,
    ) -> Result<FieldMap> {
        let mut fields = base_document(self.natural_id(entity)?, last_change_date);
        codec::put_str(&mut fields, codec::NAME, Some(&entity.name));
        codec::put_i64(&mut fields, codec::COLOR, entity.color);
        Ok(fields)
    }

    fn from_remote(&self, entity: &mut Category, fields: &FieldMap, _list_id: &str) -> Result<()> {
        if let Some(name) = codec::str_field(fields, codec::NAME) {
            entity.name = name.to_string();
        }
        entity.color = codec::i64_field(fields, codec::COLOR);
        Ok(())
    }

    fn new_local(&self, fields: &FieldMap, list_id: &str) -> Result<Category> {
        let mut category = Category::new(remote_name(fields, Self::KIND)?);
        self.from_remote(&mut category, fields, list_id)?;
        Ok(category)
    }

    fn load_all(&self) -> Result<Vec<Category>> {
        self.store.list_categories()
    }

    fn find_local(&self, id: LocalId) -> Result<Option<Category>> {
        self.store.get_category(id)
    }

    fn insert_local(&self, entity: &Category) -> Result<Category> {
        self.store.insert_category(entity)
    }

    fn save_local(&self, entity: &Category) -> Result<()> {
        self.store.update_category(entity)
    }

    fn remove_local(&self, id: LocalId) -> Result<()> {
        self.store.remove_category(id)
    }
}

pub struct ProductTranslator {
    store: Arc<dyn LocalStore>,
}

impl ProductTranslator {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }
}

impl EntityTranslator for ProductTranslator {
    type Entity = Product;

    const KIND: EntityKind = EntityKind::Product;

    fn store(&self) -> &dyn LocalStore {
        self.store.as_ref()
    }

    fn id_of(entity: &Product) -> Option<LocalId> {
        entity.id
    }

    fn natural_id(&self, entity: &Product) -> Result<Option<String>> {
        Ok(normalize_natural_id(&entity.name))
    }

    fn remote_natural_id(&self, fields: &FieldMap, _list_id: &str) -> Result<Option<String>> {
        Ok(codec::natural_id_field(fields)
            .or_else(|| codec::str_field(fields, codec::NAME).and_then(normalize_natural_id)))
    }

    fn to_remote(
        &self,
        entity: &Product,
        list_id: &str,
        last_change_date: Option<i64>,
    ) -> Result<FieldMap> {
        let mut fields = base_document(self.natural_id(entity)?, last_change_date);
        codec::put_str(&mut fields, codec::NAME, Some(&entity.name));
        if let Some(category_id) = entity.category_id {
            let remote_id =
                remote_reference(self.store(), EntityKind::Category, category_id, list_id)?;
            codec::put_str(&mut fields, codec::CATEGORY_ID, Some(&remote_id));
        }
        Ok(fields)
    }

    fn from_remote(&self, entity: &mut Product, fields: &FieldMap, list_id: &str) -> Result<()> {
        if let Some(name) = codec::str_field(fields, codec::NAME) {
            entity.name = name.to_string();
        }
        entity.category_id = match codec::str_field(fields, codec::CATEGORY_ID) {
            Some(remote_id) => {
                let category =
                    local_reference(self.store(), EntityKind::Category, remote_id, list_id)?;
                if category.is_none() {
                    tracing::warn!(
                        "Category {remote_id} of product '{}' is unknown in list {list_id}, dropping it",
                        entity.name
                    );
                }
                category
            }
            None => None,
        };
        Ok(())
    }

    fn new_local(&self, fields: &FieldMap, list_id: &str) -> Result<Product> {
        let mut product = Product::new(remote_name(fields, Self::KIND)?);
        self.from_remote(&mut product, fields, list_id)?;
        Ok(product)
    }

    fn load_all(&self) -> Result<Vec<Product>> {
        self.store.list_products()
    }

    fn find_local(&self, id: LocalId) -> Result<Option<Product>> {
        self.store.get_product(id)
    }

    fn insert_local(&self, entity: &Product) -> Result<Product> {
        self.store.insert_product(entity)
    }

    fn save_local(&self, entity: &Product) -> Result<()> {
        self.store.update_product(entity)
    }

    fn remove_local(&self, id: LocalId) -> Result<()> {
        self.store.remove_product(id)
    }

    fn dependents(&self, id: LocalId) -> Result<Vec<EntityRef>> {
        let mut dependents = Vec::new();
        for item in self.store.find_linked_items(id)? {
            dependents.push(EntityRef::new(
                EntityKind::ShopItem,
                require_id(item.id, EntityKind::ShopItem)?,
            ));
        }
        Ok(dependents)
    }
}

/// Shopping-list items are identified by their product
pub struct ShopItemTranslator {
    store: Arc<dyn LocalStore>,
}

impl ShopItemTranslator {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    fn product_natural_id(&self, product_id: LocalId) -> Result<Option<String>> {
        Ok(self
            .store
            .get_product(product_id)?
            .and_then(|product| normalize_natural_id(&product.name)))
    }

    /// Required product reference of a document
    fn resolve_product(&self, fields: &FieldMap, list_id: &str) -> Result<LocalId> {
        let remote_id = codec::str_field(fields, codec::PRODUCT_ID).ok_or_else(|| {
            Error::MissingReference {
                kind: EntityKind::Product,
                detail: "shop item document has no productId".to_string(),
            }
        })?;
        local_reference(self.store(), EntityKind::Product, remote_id, list_id)?.ok_or_else(|| {
            Error::MissingReference {
                kind: EntityKind::Product,
                detail: format!("remote id {remote_id} is unknown in list {list_id}"),
            }
        })
    }
}

impl EntityTranslator for ShopItemTranslator {
    type Entity = ShopItem;

    const KIND: EntityKind = EntityKind::ShopItem;

    fn store(&self) -> &dyn LocalStore {
        self.store.as_ref()
    }

    fn id_of(entity: &ShopItem) -> Option<LocalId> {
        entity.id
    }

    fn natural_id(&self, entity: &ShopItem) -> Result<Option<String>> {
        self.product_natural_id(entity.product_id)
    }

    fn remote_natural_id(&self, fields: &FieldMap, list_id: &str) -> Result<Option<String>> {
        if let Some(natural_id) = codec::natural_id_field(fields) {
            return Ok(Some(natural_id));
        }
        match codec::str_field(fields, codec::PRODUCT_ID) {
            Some(remote_id) => {
                match local_reference(self.store(), EntityKind::Product, remote_id, list_id)? {
                    Some(product_id) => self.product_natural_id(product_id),
                    None => Ok(None),
                }
            }
            None => Ok(None),
        }
    }

    fn to_remote(
        &self,
        entity: &ShopItem,
        list_id: &str,
        last_change_date: Option<i64>,
    ) -> Result<FieldMap> {
        let product_id =
            remote_reference(self.store(), EntityKind::Product, entity.product_id, list_id)?;
        let mut fields = base_document(self.natural_id(entity)?, last_change_date);
        codec::put_str(&mut fields, codec::PRODUCT_ID, Some(&product_id));
        codec::put_str(&mut fields, codec::QUANTITY, entity.quantity.as_deref());
        codec::put_str(&mut fields, codec::COMMENT, entity.comment.as_deref());
        fields.insert(codec::CHECKED.to_string(), Value::Bool(entity.checked));
        Ok(fields)
    }

    fn from_remote(&self, entity: &mut ShopItem, fields: &FieldMap, list_id: &str) -> Result<()> {
        entity.product_id = self.resolve_product(fields, list_id)?;
        entity.quantity = codec::str_field(fields, codec::QUANTITY).map(str::to_string);
        entity.comment = codec::str_field(fields, codec::COMMENT).map(str::to_string);
        entity.checked = codec::bool_field(fields, codec::CHECKED);
        Ok(())
    }

    fn new_local(&self, fields: &FieldMap, list_id: &str) -> Result<ShopItem> {
        let mut item = ShopItem::new(self.resolve_product(fields, list_id)?);
        self.from_remote(&mut item, fields, list_id)?;
        Ok(item)
    }

    fn load_all(&self) -> Result<Vec<ShopItem>> {
        self.store.list_shop_items()
    }

    fn find_local(&self, id: LocalId) -> Result<Option<ShopItem>> {
        self.store.get_shop_item(id)
    }

    fn insert_local(&self, entity: &ShopItem) -> Result<ShopItem> {
        self.store.insert_shop_item(entity)
    }

    fn save_local(&self, entity: &ShopItem) -> Result<()> {
        self.store.update_shop_item(entity)
    }

    fn remove_local(&self, id: LocalId) -> Result<()> {
        self.store.remove_shop_item(id)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::db::SqliteLocalStore;
    use crate::models::NewSyncRecord;

    fn store() -> Arc<dyn LocalStore> {
        Arc::new(SqliteLocalStore::open_in_memory().unwrap())
    }

    fn fields(value: Value) -> FieldMap {
        value.as_object().cloned().unwrap()
    }

    fn link(store: &dyn LocalStore, kind: EntityKind, id: LocalId, remote_id: &str) {
        store
            .add_sync_record(&NewSyncRecord::new(kind, id, remote_id, "l1", Some(1)))
            .unwrap();
    }

    #[test]
    fn natural_ids_agree_across_sides() {
        let translator = CategoryTranslator::new(store());
        let local = Category::new("  Whole   Milk ");
        let remote = fields(json!({"name": "whole milk"}));
        assert_eq!(
            translator.natural_id(&local).unwrap(),
            translator.remote_natural_id(&remote, "l1").unwrap()
        );
    }

    #[test]
    fn category_document_layout() {
        let translator = CategoryTranslator::new(store());
        let category = Category::new("Fruit").with_color(100);
        let document = translator.to_remote(&category, "l1", Some(7)).unwrap();
        assert_eq!(
            Value::Object(document),
            json!({"name": "Fruit", "color": 100, "naturalId": "fruit", "lastChangeDate": 7})
        );
    }

    #[test]
    fn category_from_remote_keeps_name_when_absent() {
        let translator = CategoryTranslator::new(store());
        let mut category = Category::new("Fruit");
        translator
            .from_remote(&mut category, &fields(json!({"naturalId": "fruit", "color": 100})), "l1")
            .unwrap();
        assert_eq!(category.name, "Fruit");
        assert_eq!(category.color, Some(100));
    }

    #[test]
    fn product_reference_needs_category_record() {
        let store = store();
        let category = store.insert_category(&Category::new("Dairy")).unwrap();
        let category_id = category.id.unwrap();
        let translator = ProductTranslator::new(store.clone());
        let product = Product::new("Milk").in_category(category_id);

        let error = translator.to_remote(&product, "l1", Some(1)).unwrap_err();
        assert!(matches!(error, Error::MissingReference { kind: EntityKind::Category, .. }));

        link(store.as_ref(), EntityKind::Category, category_id, "cat-remote");
        let document = translator.to_remote(&product, "l1", Some(1)).unwrap();
        assert_eq!(document.get(codec::CATEGORY_ID), Some(&json!("cat-remote")));

        let mut pulled = Product::new("old");
        translator.from_remote(&mut pulled, &document, "l1").unwrap();
        assert_eq!(pulled.name, "Milk");
        assert_eq!(pulled.category_id, Some(category_id));
    }

    #[test]
    fn unknown_optional_category_is_dropped() {
        let translator = ProductTranslator::new(store());
        let product = translator
            .new_local(&fields(json!({"name": "Milk", "categoryId": "gone"})), "l1")
            .unwrap();
        assert_eq!(product.category_id, None);
    }

    #[test]
    fn unknown_required_product_is_an_error() {
        let translator = ShopItemTranslator::new(store());
        let error = translator
            .new_local(&fields(json!({"productId": "gone", "quantity": "2"})), "l1")
            .unwrap_err();
        assert!(matches!(error, Error::MissingReference { kind: EntityKind::Product, .. }));
    }

    #[test]
    fn shop_item_identity_follows_product() {
        let store = store();
        let product = store.insert_product(&Product::new("Oat Milk")).unwrap();
        let product_id = product.id.unwrap();
        link(store.as_ref(), EntityKind::Product, product_id, "p-remote");
        let translator = ShopItemTranslator::new(store);

        let item = ShopItem::new(product_id).with_quantity("2");
        assert_eq!(translator.natural_id(&item).unwrap().as_deref(), Some("oat milk"));

        let document = translator.to_remote(&item, "l1", None).unwrap();
        assert_eq!(
            Value::Object(document.clone()),
            json!({"productId": "p-remote", "quantity": "2", "checked": false, "naturalId": "oat milk"})
        );
        let without_natural_id = fields(json!({"productId": "p-remote"}));
        assert_eq!(
            translator.remote_natural_id(&without_natural_id, "l1").unwrap().as_deref(),
            Some("oat milk")
        );
        assert_eq!(translator.new_local(&document, "l1").unwrap(), item);
    }

    #[test]
    fn product_dependents_are_its_items() {
        let store = store();
        let product = store.insert_product(&Product::new("Milk")).unwrap();
        let product_id = product.id.unwrap();
        let item = store.insert_shop_item(&ShopItem::new(product_id)).unwrap();
        let translator = ProductTranslator::new(store);
        assert_eq!(
            translator.dependents(product_id).unwrap(),
            vec![EntityRef::new(EntityKind::ShopItem, item.id.unwrap())]
        );
    }
}
