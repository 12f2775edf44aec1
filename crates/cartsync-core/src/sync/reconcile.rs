//! Bulk reconciliation of one list, run on every (re)connect.
//!
//! Each kind is compared as a whole: local entities, the kind's sync records
//! for the list and a snapshot of the list's documents. Kinds run in
//! dependency order so that references can be resolved through records the
//! previous pass created.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use super::conflict::{decide, Resolution};
use super::translator::EntityTranslator;
use super::{apply, codec, SyncContext};
use crate::error::{Error, Result};
use crate::models::{EntityKind, LocalId, SyncRecord};
use crate::remote::{FieldMap, RemotePath};

/// What one bulk pass over a kind did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub kind: EntityKind,
    /// Local entities created from remote documents
    pub created_local: usize,
    /// Remote documents created for new local entities
    pub created_remote: usize,
    /// Unlinked pairs matched by natural id
    pub linked: usize,
    pub pushed: usize,
    pub pulled: usize,
    /// Local entities removed because their document disappeared
    pub removed_local: usize,
    /// Remote documents removed on behalf of tombstones
    pub removed_remote: usize,
    /// Tombstones and orphaned records deleted
    pub purged: usize,
    /// Items left alone: duplicates and unresolved references
    pub skipped: usize,
}

impl ReconcileReport {
    #[must_use]
    pub const fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            created_local: 0,
            created_remote: 0,
            linked: 0,
            pushed: 0,
            pulled: 0,
            removed_local: 0,
            removed_remote: 0,
            purged: 0,
            skipped: 0,
        }
    }

    /// Number of remote writes the pass performed
    #[must_use]
    pub const fn remote_writes(&self) -> usize {
        self.created_remote + self.pushed + self.removed_remote
    }

    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.created_local == 0
            && self.created_remote == 0
            && self.linked == 0
            && self.pushed == 0
            && self.pulled == 0
            && self.removed_local == 0
            && self.removed_remote == 0
            && self.purged == 0
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} created locally, {} created remotely, {} linked, {} pushed, {} pulled, \
             {} removed locally, {} removed remotely, {} purged, {} skipped",
            self.kind,
            self.created_local,
            self.created_remote,
            self.linked,
            self.pushed,
            self.pulled,
            self.removed_local,
            self.removed_remote,
            self.purged,
            self.skipped
        )
    }
}

/// Reconcile every kind of `list_id`, in dependency order
pub async fn reconcile_list(ctx: &SyncContext, list_id: &str) -> Result<Vec<ReconcileReport>> {
    let mut reports = Vec::with_capacity(EntityKind::ALL.len());
    for kind in EntityKind::ALL {
        let report = with_translator!(ctx, kind, translator => {
            reconcile_kind(ctx, translator, list_id).await?
        });
        tracing::info!("Reconciled list {list_id}: {report}");
        reports.push(report);
    }
    Ok(reports)
}

/// Failures confined to one item; anything else aborts the pass
fn skippable(error: &Error) -> bool {
    matches!(error, Error::MissingReference { .. } | Error::InvalidInput(_))
}

pub async fn reconcile_kind<T: EntityTranslator>(
    ctx: &SyncContext,
    translator: &T,
    list_id: &str,
) -> Result<ReconcileReport> {
    let kind = T::KIND;
    let store = ctx.store.as_ref();
    let mut report = ReconcileReport::new(kind);

    let mut locals: BTreeMap<LocalId, T::Entity> = BTreeMap::new();
    for entity in translator.load_all()? {
        if let Some(id) = T::id_of(&entity) {
            locals.insert(id, entity);
        }
    }
    let collection = RemotePath::collection(list_id, kind)?;
    let mut documents: BTreeMap<String, FieldMap> = ctx
        .remote
        .children(&collection)
        .await?
        .into_iter()
        .map(|document| (document.key, document.fields))
        .collect();

    // Tombstones and orphans
    let mut live: BTreeMap<LocalId, SyncRecord> = BTreeMap::new();
    for record in store.load_sync_records(kind, list_id)? {
        if record.deleted {
            if documents.remove(&record.external_id).is_some() {
                // No child listener exists yet, so nothing will echo this removal
                apply::remove_remote(ctx, &record, false).await?;
                report.removed_remote += 1;
            } else {
                store.remove_sync_record(record.id)?;
            }
            report.purged += 1;
        } else if locals.contains_key(&record.local_id) {
            live.insert(record.local_id, record);
        } else {
            tracing::debug!(
                "Dropping orphaned record of {} in list {list_id}",
                record.entity()
            );
            store.remove_sync_record(record.id)?;
            report.purged += 1;
        }
    }

    let linked_remote: HashSet<&str> = live
        .values()
        .map(|record| record.external_id.as_str())
        .collect();
    let mut linked_natural_ids = HashSet::new();
    let mut unlinked_by_natural_id: HashMap<String, LocalId> = HashMap::new();
    let mut new_locals = BTreeSet::new();
    for (id, entity) in &locals {
        let natural_id = translator.natural_id(entity)?;
        if live.contains_key(id) {
            linked_natural_ids.extend(natural_id);
        } else {
            new_locals.insert(*id);
            if let Some(natural_id) = natural_id {
                unlinked_by_natural_id.entry(natural_id).or_insert(*id);
            }
        }
    }

    // New remote documents, in key order so duplicate resolution is stable
    for (remote_id, fields) in &documents {
        if linked_remote.contains(remote_id.as_str()) {
            continue;
        }
        let natural_id = match translator.remote_natural_id(fields, list_id) {
            Ok(natural_id) => natural_id,
            Err(error) if skippable(&error) => {
                tracing::warn!("Skipping remote {kind} {remote_id}: {error}");
                report.skipped += 1;
                continue;
            }
            Err(error) => return Err(error),
        };

        if let Some(natural_id) = &natural_id {
            if let Some(local_id) = unlinked_by_natural_id.get(natural_id).copied() {
                let Some(entity) = locals.get(&local_id) else {
                    continue;
                };
                match apply::link_and_pull(ctx, translator, entity, remote_id, fields, list_id) {
                    Ok(_) => {}
                    Err(error) if skippable(&error) => {
                        tracing::warn!("Could not link remote {kind} {remote_id}: {error}");
                        report.skipped += 1;
                        continue;
                    }
                    Err(error) => return Err(error),
                }
                unlinked_by_natural_id.remove(natural_id);
                new_locals.remove(&local_id);
                linked_natural_ids.insert(natural_id.clone());
                if codec::last_change_date(fields).is_none() {
                    push_linked(ctx, translator, local_id, list_id).await?;
                }
                report.linked += 1;
                continue;
            }
            if linked_natural_ids.contains(natural_id) {
                tracing::warn!(
                    "Remote {kind} {remote_id} duplicates natural id '{natural_id}', leaving it unlinked"
                );
                report.skipped += 1;
                continue;
            }
        }

        let local_id = match apply::create_from_remote(ctx, translator, remote_id, fields, list_id)
        {
            Ok(local_id) => local_id,
            Err(error) if skippable(&error) => {
                tracing::warn!("Could not create local {kind} from {remote_id}: {error}");
                report.skipped += 1;
                continue;
            }
            Err(error) => return Err(error),
        };
        linked_natural_ids.extend(natural_id);
        if codec::last_change_date(fields).is_none() {
            push_linked(ctx, translator, local_id, list_id).await?;
        }
        report.created_local += 1;
    }

    // New local entities
    for local_id in &new_locals {
        let Some(entity) = locals.get(local_id) else {
            continue;
        };
        match apply::push_new(ctx, translator, entity, None, list_id).await {
            Ok(_) => report.created_remote += 1,
            Err(error) if skippable(&error) => {
                tracing::warn!("Could not push {kind}#{local_id}: {error}");
                report.skipped += 1;
            }
            Err(error) => return Err(error),
        }
    }

    // Linked pairs
    for (local_id, record) in &live {
        let Some(entity) = locals.get(local_id) else {
            continue;
        };
        let Some(fields) = documents.get(&record.external_id) else {
            store.remove_sync_record(record.id)?;
            apply::remove_cascade(ctx, translator, *local_id, list_id)?;
            report.removed_local += 1;
            continue;
        };
        let outcome = match decide(codec::last_change_date(fields), record.last_change_date) {
            Resolution::PushLocal => apply::push_existing(ctx, translator, entity, record)
                .await
                .map(|()| report.pushed += 1),
            Resolution::PullRemote => apply::pull(ctx, translator, entity, fields, list_id)
                .map(|()| report.pulled += 1),
            Resolution::Unchanged => Ok(()),
        };
        match outcome {
            Ok(()) => {}
            Err(error) if skippable(&error) => {
                tracing::warn!("Could not reconcile {}: {error}", record.entity());
                report.skipped += 1;
            }
            Err(error) => return Err(error),
        }
    }

    Ok(report)
}

/// Give a freshly linked pair a timestamp when its document had none
async fn push_linked<T: EntityTranslator>(
    ctx: &SyncContext,
    translator: &T,
    local_id: LocalId,
    list_id: &str,
) -> Result<()> {
    let (Some(entity), Some(record)) = (
        translator.find_local(local_id)?,
        ctx.store.find_sync_record(T::KIND, local_id, list_id)?,
    ) else {
        return Ok(());
    };
    apply::push_existing(ctx, translator, &entity, &record).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    use super::*;
    use crate::db::{LocalStore, SqliteLocalStore};
    use crate::models::{Category, NewSyncRecord, Product, ShopItem};
    use crate::remote::{MemoryRemoteStore, RemoteStore};

    const LIST: &str = "list-1";

    struct Fixture {
        store: Arc<SqliteLocalStore>,
        remote: Arc<MemoryRemoteStore>,
        ctx: SyncContext,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteLocalStore::open_in_memory().unwrap());
        let remote = Arc::new(MemoryRemoteStore::new());
        let ctx = SyncContext::new(store.clone(), remote.clone());
        Fixture { store, remote, ctx }
    }

    async fn put(remote: &MemoryRemoteStore, kind: EntityKind, key: &str, value: Value) {
        remote
            .set(&RemotePath::document(LIST, kind, key).unwrap(), value)
            .await
            .unwrap();
    }

    fn doc(remote: &MemoryRemoteStore, kind: EntityKind, key: &str) -> Option<Value> {
        remote.peek(&RemotePath::document(LIST, kind, key).unwrap())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fruit_links_by_natural_id_and_takes_remote_color() {
        let f = fixture();
        f.store
            .insert_category(&Category {
                id: Some(LocalId::new(42)),
                name: "Fruit".to_string(),
                color: None,
            })
            .unwrap();
        put(&f.remote, EntityKind::Category, "abc", json!({"naturalId": "fruit", "color": 100}))
            .await;

        let report = reconcile_kind(&f.ctx, &f.ctx.categories, LIST).await.unwrap();
        assert_eq!(report.linked, 1);
        assert_eq!(report.created_local + report.created_remote, 0);

        let records = f.store.load_sync_records(EntityKind::Category, LIST).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].local_id, LocalId::new(42));
        assert_eq!(records[0].external_id, "abc");
        let category = f.store.get_category(LocalId::new(42)).unwrap().unwrap();
        assert_eq!(category.color, Some(100));
        assert_eq!(category.name, "Fruit");
        assert_eq!(f.store.list_categories().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_pass_is_a_noop() {
        let f = fixture();
        f.store.insert_category(&Category::new("Dairy")).unwrap();
        put(&f.remote, EntityKind::Category, "k1", json!({"name": "Bakery", "lastChangeDate": 5}))
            .await;

        let first = reconcile_list(&f.ctx, LIST).await.unwrap();
        assert_eq!(first[0].created_local, 1);
        assert_eq!(first[0].created_remote, 1);

        let writes = f.remote.write_count();
        let second = reconcile_list(&f.ctx, LIST).await.unwrap();
        assert!(second.iter().all(ReconcileReport::is_noop), "{second:?}");
        assert_eq!(f.remote.write_count(), writes);
        assert_eq!(f.store.list_categories().unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_remote_natural_ids_keep_the_first_key() {
        let f = fixture();
        put(&f.remote, EntityKind::Category, "b", json!({"name": "Milk", "lastChangeDate": 1}))
            .await;
        put(&f.remote, EntityKind::Category, "a", json!({"name": "milk", "lastChangeDate": 2}))
            .await;

        let report = reconcile_kind(&f.ctx, &f.ctx.categories, LIST).await.unwrap();
        assert_eq!(report.created_local, 1);
        assert_eq!(report.skipped, 1);
        let records = f.store.load_sync_records(EntityKind::Category, LIST).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].external_id, "a");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn newer_side_wins_and_equal_is_untouched() {
        let f = fixture();
        let ids: Vec<LocalId> = ["Apples", "Pears", "Plums"]
            .into_iter()
            .map(|name| f.store.insert_category(&Category::new(name)).unwrap().id.unwrap())
            .collect();
        for (index, (id, local_ts)) in ids.iter().zip([300, 100, 200]).enumerate() {
            let key = format!("k{index}");
            f.store
                .add_sync_record(&NewSyncRecord::new(
                    EntityKind::Category,
                    *id,
                    &key,
                    LIST,
                    Some(local_ts),
                ))
                .unwrap();
            put(
                &f.remote,
                EntityKind::Category,
                &key,
                json!({"name": format!("Remote {index}"), "lastChangeDate": 200}),
            )
            .await;
        }

        let report = reconcile_kind(&f.ctx, &f.ctx.categories, LIST).await.unwrap();
        assert_eq!((report.pushed, report.pulled), (1, 1));

        assert_eq!(doc(&f.remote, EntityKind::Category, "k0").unwrap()["name"], json!("Apples"));
        assert_eq!(f.store.get_category(ids[1]).unwrap().unwrap().name, "Remote 1");
        assert_eq!(f.store.get_category(ids[2]).unwrap().unwrap().name, "Plums");
        assert_eq!(doc(&f.remote, EntityKind::Category, "k2").unwrap()["name"], json!("Remote 2"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tombstones_remove_documents_and_orphans_are_dropped() {
        let f = fixture();
        let kept = f.store.insert_category(&Category::new("Kept")).unwrap().id.unwrap();
        f.store
            .add_sync_record(&NewSyncRecord::new(EntityKind::Category, kept, "live", LIST, Some(1)))
            .unwrap();
        put(&f.remote, EntityKind::Category, "live", json!({"name": "Kept", "lastChangeDate": 1}))
            .await;
        // Orphan: record without entity
        f.store
            .add_sync_record(&NewSyncRecord::new(
                EntityKind::Category,
                LocalId::new(999),
                "orphan",
                LIST,
                Some(1),
            ))
            .unwrap();
        put(&f.remote, EntityKind::Category, "orphan", json!({"name": "Orphan", "lastChangeDate": 1}))
            .await;
        // Tombstone
        let gone = f.store.insert_category(&Category::new("Gone")).unwrap().id.unwrap();
        f.store
            .add_sync_record(&NewSyncRecord::new(EntityKind::Category, gone, "dead", LIST, Some(1)))
            .unwrap();
        f.store
            .update_sync_record(EntityKind::Category, gone, LIST, Some(2), true)
            .unwrap();
        f.store.remove_category(gone).unwrap();
        put(&f.remote, EntityKind::Category, "dead", json!({"name": "Gone", "lastChangeDate": 1}))
            .await;

        let report = reconcile_kind(&f.ctx, &f.ctx.categories, LIST).await.unwrap();
        assert_eq!(report.removed_remote, 1);
        assert_eq!(report.purged, 2);
        assert!(doc(&f.remote, EntityKind::Category, "dead").is_none());
        // The orphan's document is untouched and comes back as a new local entity
        assert_eq!(report.created_local, 1);
        assert!(doc(&f.remote, EntityKind::Category, "orphan").is_some());
        let names: Vec<String> = f
            .store
            .list_categories()
            .unwrap()
            .into_iter()
            .map(|category| category.name)
            .collect();
        assert!(names.contains(&"Orphan".to_string()));
        assert!(!names.contains(&"Gone".to_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn removal_between_passes_reaches_the_remote() {
        let f = fixture();
        let fruit = f.store.insert_category(&Category::new("Fruit")).unwrap().id.unwrap();
        reconcile_kind(&f.ctx, &f.ctx.categories, LIST).await.unwrap();
        let key = f
            .store
            .find_sync_record(EntityKind::Category, fruit, LIST)
            .unwrap()
            .unwrap()
            .external_id;

        f.store.remove_category(fruit).unwrap();
        let report = reconcile_kind(&f.ctx, &f.ctx.categories, LIST).await.unwrap();

        assert_eq!(report.removed_remote, 1);
        assert_eq!(report.created_local, 0);
        assert!(doc(&f.remote, EntityKind::Category, &key).is_none());
        assert!(f.store.list_categories().unwrap().is_empty());
        assert!(f
            .store
            .load_sync_records(EntityKind::Category, LIST)
            .unwrap()
            .is_empty());
        assert!(!f.ctx.markers.is_removing(EntityKind::Category, &key));
        assert!(f.ctx.markers.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn edit_between_passes_is_pushed() {
        let f = fixture();
        let fruit = f.store.insert_category(&Category::new("Fruit")).unwrap();
        let id = fruit.id.unwrap();
        reconcile_kind(&f.ctx, &f.ctx.categories, LIST).await.unwrap();
        let key = f
            .store
            .find_sync_record(EntityKind::Category, id, LIST)
            .unwrap()
            .unwrap()
            .external_id;

        f.store
            .update_category(&Category {
                name: "Fresh fruit".to_string(),
                ..fruit
            })
            .unwrap();
        let report = reconcile_kind(&f.ctx, &f.ctx.categories, LIST).await.unwrap();

        assert_eq!(report.pushed, 1);
        let document = doc(&f.remote, EntityKind::Category, &key).unwrap();
        assert_eq!(document["name"], json!("Fresh fruit"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn vanished_product_cascades_to_items() {
        let f = fixture();
        let product = f.store.insert_product(&Product::new("Milk")).unwrap().id.unwrap();
        let item = f.store.insert_shop_item(&ShopItem::new(product)).unwrap().id.unwrap();
        reconcile_list(&f.ctx, LIST).await.unwrap();
        let product_key = f
            .store
            .find_sync_record(EntityKind::Product, product, LIST)
            .unwrap()
            .unwrap()
            .external_id;
        let item_key = f
            .store
            .find_sync_record(EntityKind::ShopItem, item, LIST)
            .unwrap()
            .unwrap()
            .external_id;

        f.remote
            .remove(&RemotePath::document(LIST, EntityKind::Product, &product_key).unwrap())
            .await
            .unwrap();
        let reports = reconcile_list(&f.ctx, LIST).await.unwrap();
        assert_eq!(reports[1].removed_local, 1);
        assert_eq!(reports[2].removed_remote, 1);

        assert!(f.store.get_product(product).unwrap().is_none());
        assert!(f.store.get_shop_item(item).unwrap().is_none());
        assert!(doc(&f.remote, EntityKind::ShopItem, &item_key).is_none());
        for kind in EntityKind::ALL {
            assert!(f.store.load_sync_records(kind, LIST).unwrap().is_empty());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn item_with_unknown_product_is_skipped() {
        let f = fixture();
        put(&f.remote, EntityKind::ShopItem, "i1", json!({"productId": "nope", "lastChangeDate": 1}))
            .await;
        let reports = reconcile_list(&f.ctx, LIST).await.unwrap();
        assert_eq!(reports[2].skipped, 1);
        assert!(f.store.list_shop_items().unwrap().is_empty());
    }
}
