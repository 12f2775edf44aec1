//! Local store trait and its `SQLite` implementation

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::listener::{ChangeOp, EntityListener, ListenerId, ListenerRegistry, LocalChange};
use super::Database;
use crate::error::{Error, Result};
use crate::util::unix_millis_now;
use crate::models::{
    Category, EntityKind, EntityRef, LocalId, NewSyncRecord, Product, ShopItem, SyncRecord,
};

/// Durable local replica: entity CRUD, synchronization records and change
/// notifications.
///
/// Every successful entity mutation is announced to the listeners registered
/// for that entity's kind. Synchronization record writes are not announced.
///
/// Updates stamp the entity's live records with the current time and removals
/// turn them into tombstones, in the same transaction as the entity write. A
/// change made while nothing is listening is still seen by the next
/// reconciliation.
pub trait LocalStore: Send + Sync {
    /// Insert a category. A preset `id` is honoured, otherwise one is assigned.
    fn insert_category(&self, category: &Category) -> Result<Category>;
    fn update_category(&self, category: &Category) -> Result<()>;
    /// Remove a category; its products lose their category
    fn remove_category(&self, id: LocalId) -> Result<()>;
    fn get_category(&self, id: LocalId) -> Result<Option<Category>>;
    fn list_categories(&self) -> Result<Vec<Category>>;

    fn insert_product(&self, product: &Product) -> Result<Product>;
    fn update_product(&self, product: &Product) -> Result<()>;
    /// Remove a product together with its shopping-list items
    fn remove_product(&self, id: LocalId) -> Result<()>;
    fn get_product(&self, id: LocalId) -> Result<Option<Product>>;
    fn list_products(&self) -> Result<Vec<Product>>;
    /// Shopping-list items referring to a product
    fn find_linked_items(&self, product_id: LocalId) -> Result<Vec<ShopItem>>;

    fn insert_shop_item(&self, item: &ShopItem) -> Result<ShopItem>;
    fn update_shop_item(&self, item: &ShopItem) -> Result<()>;
    fn remove_shop_item(&self, id: LocalId) -> Result<()>;
    fn get_shop_item(&self, id: LocalId) -> Result<Option<ShopItem>>;
    fn list_shop_items(&self) -> Result<Vec<ShopItem>>;

    fn add_sync_record(&self, record: &NewSyncRecord) -> Result<SyncRecord>;
    /// Update the live record of an entity in a list
    fn update_sync_record(
        &self,
        kind: EntityKind,
        local_id: LocalId,
        list_id: &str,
        last_change_date: Option<i64>,
        deleted: bool,
    ) -> Result<()>;
    /// Delete a record by row id. Deleting a missing row is not an error.
    fn remove_sync_record(&self, id: i64) -> Result<()>;
    fn get_sync_record(&self, id: i64) -> Result<Option<SyncRecord>>;
    /// Live record of an entity in a list
    fn find_sync_record(
        &self,
        kind: EntityKind,
        local_id: LocalId,
        list_id: &str,
    ) -> Result<Option<SyncRecord>>;
    /// Newest tombstone of an entity in a list
    fn find_tombstone(
        &self,
        kind: EntityKind,
        local_id: LocalId,
        list_id: &str,
    ) -> Result<Option<SyncRecord>>;
    /// Record pointing at a remote document, live records first
    fn find_sync_record_by_external_id(
        &self,
        kind: EntityKind,
        external_id: &str,
        list_id: &str,
    ) -> Result<Option<SyncRecord>>;
    /// All records (live and tombstones) of a kind in a list
    fn load_sync_records(&self, kind: EntityKind, list_id: &str) -> Result<Vec<SyncRecord>>;

    fn add_entity_listener(&self, kind: EntityKind, listener: Arc<dyn EntityListener>)
        -> ListenerId;
    fn remove_entity_listener(&self, id: ListenerId) -> bool;
}

/// `SQLite` implementation of `LocalStore`
pub struct SqliteLocalStore {
    conn: Mutex<Connection>,
    listeners: ListenerRegistry,
}

const SYNC_RECORD_COLUMNS: &str =
    "id, entity_kind, local_id, external_id, list_id, last_change_date, deleted";

impl SqliteLocalStore {
    /// Create a store over an opened database
    pub fn new(database: Database) -> Self {
        Self {
            conn: Mutex::new(database.into_connection()),
            listeners: ListenerRegistry::default(),
        }
    }

    /// Open (and migrate) a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Database::open(path)?))
    }

    /// Open an in-memory store (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, kind: EntityKind, id: LocalId, op: ChangeOp) {
        self.listeners
            .notify(LocalChange::new(EntityRef::new(kind, id), op));
    }

    fn require_id(id: Option<LocalId>, kind: EntityKind) -> Result<LocalId> {
        id.ok_or_else(|| Error::InvalidInput(format!("{kind} has not been saved yet")))
    }

    fn ensure_updated(rows: usize, kind: EntityKind, id: LocalId) -> Result<()> {
        if rows == 0 {
            Err(Error::NotFound(EntityRef::new(kind, id).to_string()))
        } else {
            Ok(())
        }
    }

    /// Stamp the live records of an entity, optionally turning them into
    /// tombstones. The stamp never goes backwards.
    fn touch_records(
        conn: &Connection,
        kind: EntityKind,
        id: LocalId,
        deleted: bool,
    ) -> rusqlite::Result<usize> {
        conn.execute(
            "UPDATE sync_records
             SET last_change_date = MAX(COALESCE(last_change_date, 0) + 1, ?), deleted = ?
             WHERE entity_kind = ? AND local_id = ? AND deleted = 0",
            params![
                unix_millis_now(),
                i32::from(deleted),
                kind.as_str(),
                id.get()
            ],
        )
    }

    fn parse_category(row: &Row<'_>) -> rusqlite::Result<Category> {
        Ok(Category {
            id: Some(LocalId::new(row.get(0)?)),
            name: row.get(1)?,
            color: row.get(2)?,
        })
    }

    fn parse_product(row: &Row<'_>) -> rusqlite::Result<Product> {
        Ok(Product {
            id: Some(LocalId::new(row.get(0)?)),
            name: row.get(1)?,
            category_id: row.get::<_, Option<i64>>(2)?.map(LocalId::new),
        })
    }

    fn parse_shop_item(row: &Row<'_>) -> rusqlite::Result<ShopItem> {
        Ok(ShopItem {
            id: Some(LocalId::new(row.get(0)?)),
            product_id: LocalId::new(row.get(1)?),
            quantity: row.get(2)?,
            comment: row.get(3)?,
            checked: row.get::<_, i32>(4)? != 0,
        })
    }

    fn parse_sync_record(row: &Row<'_>) -> rusqlite::Result<SyncRecord> {
        let kind: String = row.get(1)?;
        let kind = kind.parse::<EntityKind>().map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, error.into())
        })?;
        Ok(SyncRecord {
            id: row.get(0)?,
            kind,
            local_id: LocalId::new(row.get(2)?),
            external_id: row.get(3)?,
            list_id: row.get(4)?,
            last_change_date: row.get(5)?,
            deleted: row.get::<_, i32>(6)? != 0,
        })
    }
}

impl LocalStore for SqliteLocalStore {
    fn insert_category(&self, category: &Category) -> Result<Category> {
        let id = {
            let conn = self.conn();
            conn.execute(
                "INSERT INTO categories (id, name, color) VALUES (?, ?, ?)",
                params![category.id.map(LocalId::get), category.name, category.color],
            )?;
            LocalId::new(conn.last_insert_rowid())
        };

        self.notify(EntityKind::Category, id, ChangeOp::Added);
        Ok(Category {
            id: Some(id),
            ..category.clone()
        })
    }

    fn update_category(&self, category: &Category) -> Result<()> {
        let id = Self::require_id(category.id, EntityKind::Category)?;
        {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            let rows = tx.execute(
                "UPDATE categories SET name = ?, color = ? WHERE id = ?",
                params![category.name, category.color, id.get()],
            )?;
            Self::ensure_updated(rows, EntityKind::Category, id)?;
            Self::touch_records(&tx, EntityKind::Category, id, false)?;
            tx.commit()?;
        }

        self.notify(EntityKind::Category, id, ChangeOp::Changed);
        Ok(())
    }

    fn remove_category(&self, id: LocalId) -> Result<()> {
        let detached = {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            let detached = {
                let mut stmt = tx.prepare("SELECT id FROM products WHERE category_id = ?")?;
                let ids = stmt
                    .query_map(params![id.get()], |row| row.get::<_, i64>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                ids
            };
            tx.execute(
                "UPDATE products SET category_id = NULL WHERE category_id = ?",
                params![id.get()],
            )?;
            let rows = tx.execute("DELETE FROM categories WHERE id = ?", params![id.get()])?;
            Self::ensure_updated(rows, EntityKind::Category, id)?;
            for &product_id in &detached {
                Self::touch_records(&tx, EntityKind::Product, LocalId::new(product_id), false)?;
            }
            Self::touch_records(&tx, EntityKind::Category, id, true)?;
            tx.commit()?;
            detached
        };

        for product_id in detached {
            self.notify(EntityKind::Product, LocalId::new(product_id), ChangeOp::Changed);
        }
        self.notify(EntityKind::Category, id, ChangeOp::Removed);
        Ok(())
    }

    fn get_category(&self, id: LocalId) -> Result<Option<Category>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, name, color FROM categories WHERE id = ?",
                params![id.get()],
                Self::parse_category,
            )
            .optional()?)
    }

    fn list_categories(&self) -> Result<Vec<Category>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, name, color FROM categories ORDER BY id")?;
        let categories = stmt
            .query_map([], Self::parse_category)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(categories)
    }

    fn insert_product(&self, product: &Product) -> Result<Product> {
        let id = {
            let conn = self.conn();
            conn.execute(
                "INSERT INTO products (id, name, category_id) VALUES (?, ?, ?)",
                params![
                    product.id.map(LocalId::get),
                    product.name,
                    product.category_id.map(LocalId::get)
                ],
            )?;
            LocalId::new(conn.last_insert_rowid())
        };

        self.notify(EntityKind::Product, id, ChangeOp::Added);
        Ok(Product {
            id: Some(id),
            ..product.clone()
        })
    }

    fn update_product(&self, product: &Product) -> Result<()> {
        let id = Self::require_id(product.id, EntityKind::Product)?;
        {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            let rows = tx.execute(
                "UPDATE products SET name = ?, category_id = ? WHERE id = ?",
                params![product.name, product.category_id.map(LocalId::get), id.get()],
            )?;
            Self::ensure_updated(rows, EntityKind::Product, id)?;
            Self::touch_records(&tx, EntityKind::Product, id, false)?;
            tx.commit()?;
        }

        self.notify(EntityKind::Product, id, ChangeOp::Changed);
        Ok(())
    }

    fn remove_product(&self, id: LocalId) -> Result<()> {
        let removed_items = {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            let items = {
                let mut stmt = tx.prepare("SELECT id FROM shop_items WHERE product_id = ?")?;
                let ids = stmt
                    .query_map(params![id.get()], |row| row.get::<_, i64>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                ids
            };
            tx.execute("DELETE FROM shop_items WHERE product_id = ?", params![id.get()])?;
            let rows = tx.execute("DELETE FROM products WHERE id = ?", params![id.get()])?;
            Self::ensure_updated(rows, EntityKind::Product, id)?;
            for &item_id in &items {
                Self::touch_records(&tx, EntityKind::ShopItem, LocalId::new(item_id), true)?;
            }
            Self::touch_records(&tx, EntityKind::Product, id, true)?;
            tx.commit()?;
            items
        };

        for item_id in removed_items {
            self.notify(EntityKind::ShopItem, LocalId::new(item_id), ChangeOp::Removed);
        }
        self.notify(EntityKind::Product, id, ChangeOp::Removed);
        Ok(())
    }

    fn get_product(&self, id: LocalId) -> Result<Option<Product>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, name, category_id FROM products WHERE id = ?",
                params![id.get()],
                Self::parse_product,
            )
            .optional()?)
    }

    fn list_products(&self) -> Result<Vec<Product>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, name, category_id FROM products ORDER BY id")?;
        let products = stmt
            .query_map([], Self::parse_product)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(products)
    }

    fn find_linked_items(&self, product_id: LocalId) -> Result<Vec<ShopItem>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, product_id, quantity, comment, checked
             FROM shop_items
             WHERE product_id = ?
             ORDER BY id",
        )?;
        let items = stmt
            .query_map(params![product_id.get()], Self::parse_shop_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    fn insert_shop_item(&self, item: &ShopItem) -> Result<ShopItem> {
        let id = {
            let conn = self.conn();
            conn.execute(
                "INSERT INTO shop_items (id, product_id, quantity, comment, checked)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    item.id.map(LocalId::get),
                    item.product_id.get(),
                    item.quantity,
                    item.comment,
                    i32::from(item.checked)
                ],
            )?;
            LocalId::new(conn.last_insert_rowid())
        };

        self.notify(EntityKind::ShopItem, id, ChangeOp::Added);
        Ok(ShopItem {
            id: Some(id),
            ..item.clone()
        })
    }

    fn update_shop_item(&self, item: &ShopItem) -> Result<()> {
        let id = Self::require_id(item.id, EntityKind::ShopItem)?;
        {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            let rows = tx.execute(
                "UPDATE shop_items SET product_id = ?, quantity = ?, comment = ?, checked = ?
                 WHERE id = ?",
                params![
                    item.product_id.get(),
                    item.quantity,
                    item.comment,
                    i32::from(item.checked),
                    id.get()
                ],
            )?;
            Self::ensure_updated(rows, EntityKind::ShopItem, id)?;
            Self::touch_records(&tx, EntityKind::ShopItem, id, false)?;
            tx.commit()?;
        }

        self.notify(EntityKind::ShopItem, id, ChangeOp::Changed);
        Ok(())
    }

    fn remove_shop_item(&self, id: LocalId) -> Result<()> {
        {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            let rows = tx.execute("DELETE FROM shop_items WHERE id = ?", params![id.get()])?;
            Self::ensure_updated(rows, EntityKind::ShopItem, id)?;
            Self::touch_records(&tx, EntityKind::ShopItem, id, true)?;
            tx.commit()?;
        }

        self.notify(EntityKind::ShopItem, id, ChangeOp::Removed);
        Ok(())
    }

    fn get_shop_item(&self, id: LocalId) -> Result<Option<ShopItem>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, product_id, quantity, comment, checked FROM shop_items WHERE id = ?",
                params![id.get()],
                Self::parse_shop_item,
            )
            .optional()?)
    }

    fn list_shop_items(&self) -> Result<Vec<ShopItem>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, product_id, quantity, comment, checked FROM shop_items ORDER BY id",
        )?;
        let items = stmt
            .query_map([], Self::parse_shop_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    fn add_sync_record(&self, record: &NewSyncRecord) -> Result<SyncRecord> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sync_records
                (entity_kind, local_id, external_id, list_id, last_change_date, deleted)
             VALUES (?, ?, ?, ?, ?, 0)",
            params![
                record.kind.as_str(),
                record.local_id.get(),
                record.external_id,
                record.list_id,
                record.last_change_date
            ],
        )?;

        Ok(SyncRecord {
            id: conn.last_insert_rowid(),
            kind: record.kind,
            local_id: record.local_id,
            external_id: record.external_id.clone(),
            list_id: record.list_id.clone(),
            last_change_date: record.last_change_date,
            deleted: false,
        })
    }

    fn update_sync_record(
        &self,
        kind: EntityKind,
        local_id: LocalId,
        list_id: &str,
        last_change_date: Option<i64>,
        deleted: bool,
    ) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE sync_records SET last_change_date = ?, deleted = ?
             WHERE entity_kind = ? AND local_id = ? AND list_id = ? AND deleted = 0",
            params![
                last_change_date,
                i32::from(deleted),
                kind.as_str(),
                local_id.get(),
                list_id
            ],
        )?;

        if rows == 0 {
            return Err(Error::NotFound(format!(
                "sync record for {} in list {list_id}",
                EntityRef::new(kind, local_id)
            )));
        }
        Ok(())
    }

    fn remove_sync_record(&self, id: i64) -> Result<()> {
        self.conn()
            .execute("DELETE FROM sync_records WHERE id = ?", params![id])?;
        Ok(())
    }

    fn find_sync_record(
        &self,
        kind: EntityKind,
        local_id: LocalId,
        list_id: &str,
    ) -> Result<Option<SyncRecord>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {SYNC_RECORD_COLUMNS} FROM sync_records
                     WHERE entity_kind = ? AND local_id = ? AND list_id = ? AND deleted = 0"
                ),
                params![kind.as_str(), local_id.get(), list_id],
                Self::parse_sync_record,
            )
            .optional()?)
    }

    fn get_sync_record(&self, id: i64) -> Result<Option<SyncRecord>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {SYNC_RECORD_COLUMNS} FROM sync_records WHERE id = ?"),
                params![id],
                Self::parse_sync_record,
            )
            .optional()?)
    }

    fn find_tombstone(
        &self,
        kind: EntityKind,
        local_id: LocalId,
        list_id: &str,
    ) -> Result<Option<SyncRecord>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {SYNC_RECORD_COLUMNS} FROM sync_records
                     WHERE entity_kind = ? AND local_id = ? AND list_id = ? AND deleted = 1
                     ORDER BY id DESC
                     LIMIT 1"
                ),
                params![kind.as_str(), local_id.get(), list_id],
                Self::parse_sync_record,
            )
            .optional()?)
    }

    fn find_sync_record_by_external_id(
        &self,
        kind: EntityKind,
        external_id: &str,
        list_id: &str,
    ) -> Result<Option<SyncRecord>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {SYNC_RECORD_COLUMNS} FROM sync_records
                     WHERE entity_kind = ? AND external_id = ? AND list_id = ?
                     ORDER BY deleted ASC, id ASC
                     LIMIT 1"
                ),
                params![kind.as_str(), external_id, list_id],
                Self::parse_sync_record,
            )
            .optional()?)
    }

    fn load_sync_records(&self, kind: EntityKind, list_id: &str) -> Result<Vec<SyncRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SYNC_RECORD_COLUMNS} FROM sync_records
             WHERE entity_kind = ? AND list_id = ?
             ORDER BY id"
        ))?;
        let records = stmt
            .query_map(params![kind.as_str(), list_id], Self::parse_sync_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn add_entity_listener(
        &self,
        kind: EntityKind,
        listener: Arc<dyn EntityListener>,
    ) -> ListenerId {
        self.listeners.add(kind, listener)
    }

    fn remove_entity_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}
