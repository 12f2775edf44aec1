//! Incremental propagation once a list is subscribed.
//!
//! Local handlers run on the local-change worker and are the only code that
//! writes to the remote store. Remote handlers run on the remote-notification
//! worker; when they decide the remote side needs a write they return a
//! [`FollowUp`] for the local-change worker instead.

use serde_json::Value;

use super::conflict::{decide, Resolution};
use super::translator::EntityTranslator;
use super::{apply, codec, SyncContext};
use crate::db::{ChangeOp, LocalChange};
use crate::error::Result;
use crate::models::{EntityKind, EntityRef, LocalId, SyncRecord};
use crate::remote::{ChildEvent, RemoteDocument, RemotePath};

/// Remote write requested by the remote-notification worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUp {
    /// Push the local state if it is still newer than the document
    Push(EntityRef),
    /// Delete the document of a tombstone and purge the tombstone
    RemoveRemote(SyncRecord),
}

impl FollowUp {
    pub const fn entity(&self) -> EntityRef {
        match self {
            Self::Push(entity) => *entity,
            Self::RemoveRemote(record) => record.entity(),
        }
    }
}

pub async fn handle_local_change(
    ctx: &SyncContext,
    change: LocalChange,
    list_id: &str,
) -> Result<()> {
    let local_id = change.entity.local_id;
    with_translator!(ctx, change.entity.kind, translator => match change.op {
        ChangeOp::Added => local_added(ctx, translator, local_id, list_id).await,
        ChangeOp::Changed => local_changed(ctx, translator, local_id, list_id).await,
        ChangeOp::Removed => local_removed(ctx, translator, local_id, list_id).await,
    })
}

pub async fn handle_follow_up(ctx: &SyncContext, follow_up: FollowUp, list_id: &str) -> Result<()> {
    match follow_up {
        FollowUp::Push(entity) => with_translator!(ctx, entity.kind, translator => {
            push_if_newer(ctx, translator, entity.local_id, list_id).await
        }),
        FollowUp::RemoveRemote(tombstone) => apply::remove_remote(ctx, &tombstone, true).await,
    }
}

pub async fn handle_remote_event(
    ctx: &SyncContext,
    kind: EntityKind,
    event: ChildEvent,
    list_id: &str,
) -> Result<Vec<FollowUp>> {
    with_translator!(ctx, kind, translator => match event {
        ChildEvent::Added(document) | ChildEvent::Changed(document) => {
            remote_upserted(ctx, translator, document, list_id).await
        }
        ChildEvent::Removed(document) => remote_removed(ctx, translator, &document.key, list_id),
    })
}

async fn local_added<T: EntityTranslator>(
    ctx: &SyncContext,
    translator: &T,
    local_id: LocalId,
    list_id: &str,
) -> Result<()> {
    let Some(entity) = translator.find_local(local_id)? else {
        return Ok(());
    };
    let natural_id = translator.natural_id(&entity)?;
    if let Some(natural_id) = &natural_id {
        if ctx.markers.take_created(T::KIND, natural_id) {
            tracing::debug!("Ignoring echo of {}#{local_id} created from remote", T::KIND);
            return Ok(());
        }
    }
    if ctx
        .store
        .find_sync_record(T::KIND, local_id, list_id)?
        .is_some()
    {
        return Ok(());
    }
    link_or_push(ctx, translator, &entity, natural_id.as_deref(), list_id).await
}

/// Push an unlinked entity, over an unlinked document with the same
/// natural id when there is one
async fn link_or_push<T: EntityTranslator>(
    ctx: &SyncContext,
    translator: &T,
    entity: &T::Entity,
    natural_id: Option<&str>,
    list_id: &str,
) -> Result<()> {
    let mut candidate = None;
    if let Some(natural_id) = natural_id {
        let collection = RemotePath::collection(list_id, T::KIND)?;
        let matches = ctx
            .remote
            .query_by_child(
                &collection,
                codec::NATURAL_ID,
                &Value::String(natural_id.to_string()),
            )
            .await?;
        let mut unlinked = Vec::new();
        for document in matches {
            if ctx
                .store
                .find_sync_record_by_external_id(T::KIND, &document.key, list_id)?
                .is_none()
            {
                unlinked.push(document.key);
            }
        }
        if unlinked.len() > 1 {
            tracing::warn!(
                "{} unlinked remote {} documents share natural id '{natural_id}', linking {}",
                unlinked.len(),
                T::KIND,
                unlinked[0]
            );
        }
        candidate = unlinked.into_iter().next();
    }
    apply::push_new(ctx, translator, entity, candidate.as_deref(), list_id).await?;
    Ok(())
}

async fn local_changed<T: EntityTranslator>(
    ctx: &SyncContext,
    translator: &T,
    local_id: LocalId,
    list_id: &str,
) -> Result<()> {
    if ctx.markers.take_written(EntityRef::new(T::KIND, local_id)) {
        tracing::debug!("Ignoring echo of {}#{local_id} written from remote", T::KIND);
        return Ok(());
    }
    let Some(entity) = translator.find_local(local_id)? else {
        return Ok(());
    };
    match ctx.store.find_sync_record(T::KIND, local_id, list_id)? {
        Some(record) => apply::push_existing(ctx, translator, &entity, &record).await,
        None => {
            let natural_id = translator.natural_id(&entity)?;
            link_or_push(ctx, translator, &entity, natural_id.as_deref(), list_id).await
        }
    }
}

async fn local_removed<T: EntityTranslator>(
    ctx: &SyncContext,
    _translator: &T,
    local_id: LocalId,
    list_id: &str,
) -> Result<()> {
    // The store turned the record into a tombstone along with the removal
    let Some(tombstone) = ctx.store.find_tombstone(T::KIND, local_id, list_id)? else {
        return Ok(());
    };
    apply::remove_remote(ctx, &tombstone, true).await
}

async fn push_if_newer<T: EntityTranslator>(
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
    let path = translator.remote_path(list_id, &record.external_id)?;
    let Some(value) = ctx.remote.get(&path).await? else {
        return Ok(());
    };
    let remote_ts = codec::last_change_date(&codec::into_fields(&path, value)?);
    if decide(remote_ts, record.last_change_date) == Resolution::PushLocal {
        apply::push_existing(ctx, translator, &entity, &record).await?;
    }
    Ok(())
}

async fn remote_upserted<T: EntityTranslator>(
    ctx: &SyncContext,
    translator: &T,
    document: RemoteDocument,
    list_id: &str,
) -> Result<Vec<FollowUp>> {
    let RemoteDocument { key, fields } = document;
    let Some(record) = ctx
        .store
        .find_sync_record_by_external_id(T::KIND, &key, list_id)?
    else {
        return adopt_remote(ctx, translator, &key, list_id).await;
    };
    if record.deleted {
        tracing::debug!("Remote {} {key} changed after local removal", T::KIND);
        return Ok(vec![FollowUp::RemoveRemote(record)]);
    }
    let Some(entity) = translator.find_local(record.local_id)? else {
        // Local removal is queued on the other worker
        return Ok(Vec::new());
    };
    match decide(codec::last_change_date(&fields), record.last_change_date) {
        Resolution::PullRemote => {
            apply::pull(ctx, translator, &entity, &fields, list_id)?;
            Ok(Vec::new())
        }
        Resolution::PushLocal => Ok(vec![FollowUp::Push(record.entity())]),
        Resolution::Unchanged => Ok(Vec::new()),
    }
}

/// A document without a record: link it by natural id or create it locally
async fn adopt_remote<T: EntityTranslator>(
    ctx: &SyncContext,
    translator: &T,
    key: &str,
    list_id: &str,
) -> Result<Vec<FollowUp>> {
    if ctx.markers.is_removing(T::KIND, key) {
        return Ok(Vec::new());
    }
    // Notifications can trail a removal; only adopt what still exists
    let path = translator.remote_path(list_id, key)?;
    let Some(value) = ctx.remote.get(&path).await? else {
        tracing::debug!("Ignoring stale notification for {path}");
        return Ok(Vec::new());
    };
    let fields = codec::into_fields(&path, value)?;

    let natural_id = translator.remote_natural_id(&fields, list_id)?;
    let local_id = match &natural_id {
        Some(natural_id) => {
            let mut unlinked = None;
            let mut linked = false;
            for entity in translator.find_local_by_natural_id(natural_id)? {
                let Some(id) = T::id_of(&entity) else {
                    continue;
                };
                if ctx.store.find_sync_record(T::KIND, id, list_id)?.is_some() {
                    linked = true;
                } else if unlinked.is_none() {
                    unlinked = Some(entity);
                }
            }
            match unlinked {
                Some(entity) => {
                    apply::link_and_pull(ctx, translator, &entity, key, &fields, list_id)?
                }
                None if linked => {
                    tracing::warn!(
                        "Remote {} {key} duplicates natural id '{natural_id}', leaving it unlinked",
                        T::KIND
                    );
                    return Ok(Vec::new());
                }
                None => apply::create_from_remote(ctx, translator, key, &fields, list_id)?,
            }
        }
        None => apply::create_from_remote(ctx, translator, key, &fields, list_id)?,
    };

    if codec::last_change_date(&fields).is_none() {
        return Ok(vec![FollowUp::Push(EntityRef::new(T::KIND, local_id))]);
    }
    Ok(Vec::new())
}

fn remote_removed<T: EntityTranslator>(
    ctx: &SyncContext,
    translator: &T,
    key: &str,
    list_id: &str,
) -> Result<Vec<FollowUp>> {
    let removing = ctx.markers.take_removing(T::KIND, key);
    let Some(record) = ctx
        .store
        .find_sync_record_by_external_id(T::KIND, key, list_id)?
    else {
        return Ok(Vec::new());
    };
    if record.deleted || removing {
        ctx.store.remove_sync_record(record.id)?;
        return Ok(Vec::new());
    }

    ctx.store.remove_sync_record(record.id)?;
    if translator.find_local(record.local_id)?.is_none() {
        return Ok(Vec::new());
    }
    let tombstones = apply::remove_cascade(ctx, translator, record.local_id, list_id)?;
    Ok(tombstones.into_iter().map(FollowUp::RemoveRemote).collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::db::{LocalStore, SqliteLocalStore};
    use crate::models::{Category, NewSyncRecord, Product, ShopItem};
    use crate::remote::{FieldMap, MemoryRemoteStore, RemoteStore};

    const LIST: &str = "list-1";

    fn setup() -> (Arc<SqliteLocalStore>, Arc<MemoryRemoteStore>, SyncContext) {
        let store = Arc::new(SqliteLocalStore::open_in_memory().unwrap());
        let remote = Arc::new(MemoryRemoteStore::new());
        let ctx = SyncContext::new(store.clone(), remote.clone());
        (store, remote, ctx)
    }

    fn fields(value: Value) -> FieldMap {
        value.as_object().cloned().unwrap()
    }

    fn path(kind: EntityKind, key: &str) -> RemotePath {
        RemotePath::document(LIST, kind, key).unwrap()
    }

    fn added(id: LocalId, kind: EntityKind) -> LocalChange {
        LocalChange::new(EntityRef::new(kind, id), ChangeOp::Added)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_add_links_to_matching_document() {
        let (store, remote, ctx) = setup();
        remote
            .set(&path(EntityKind::Category, "m1"), json!({"name": "Milk", "naturalId": "milk"}))
            .await
            .unwrap();
        let id = store.insert_category(&Category::new("MILK")).unwrap().id.unwrap();

        handle_local_change(&ctx, added(id, EntityKind::Category), LIST).await.unwrap();

        let record = store.find_sync_record(EntityKind::Category, id, LIST).unwrap().unwrap();
        assert_eq!(record.external_id, "m1");
        let document = remote.peek(&path(EntityKind::Category, "m1")).unwrap();
        assert_eq!(document["name"], json!("MILK"));
        assert_eq!(document["lastChangeDate"], json!(record.last_change_date.unwrap()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn echo_of_remote_creation_is_ignored() {
        let (store, remote, ctx) = setup();
        remote
            .set(&path(EntityKind::Category, "c1"), json!({"name": "Fruit", "lastChangeDate": 9}))
            .await
            .unwrap();
        let document = RemoteDocument::new("c1", fields(json!({"name": "Fruit", "lastChangeDate": 9})));
        let follow_ups =
            handle_remote_event(&ctx, EntityKind::Category, ChildEvent::Added(document), LIST)
                .await
                .unwrap();
        assert!(follow_ups.is_empty());
        let created = store.list_categories().unwrap();
        assert_eq!(created.len(), 1);

        let writes = remote.write_count();
        handle_local_change(&ctx, added(created[0].id.unwrap(), EntityKind::Category), LIST)
            .await
            .unwrap();
        assert_eq!(remote.write_count(), writes);
        assert!(ctx.markers.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn echo_of_remote_write_is_ignored() {
        let (store, remote, ctx) = setup();
        let id = store.insert_category(&Category::new("Fruit")).unwrap().id.unwrap();
        store
            .add_sync_record(&NewSyncRecord::new(EntityKind::Category, id, "c1", LIST, Some(1)))
            .unwrap();
        let document =
            RemoteDocument::new("c1", fields(json!({"name": "Fruits", "lastChangeDate": 2})));
        handle_remote_event(&ctx, EntityKind::Category, ChildEvent::Changed(document), LIST)
            .await
            .unwrap();
        assert_eq!(store.get_category(id).unwrap().unwrap().name, "Fruits");

        let change = LocalChange::new(EntityRef::new(EntityKind::Category, id), ChangeOp::Changed);
        handle_local_change(&ctx, change, LIST).await.unwrap();
        assert_eq!(remote.write_count(), 0);
        let record = store.find_sync_record(EntityKind::Category, id, LIST).unwrap().unwrap();
        assert_eq!(record.last_change_date, Some(2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_remote_change_asks_for_push() {
        let (store, _remote, ctx) = setup();
        let id = store.insert_category(&Category::new("Fruit")).unwrap().id.unwrap();
        store
            .add_sync_record(&NewSyncRecord::new(EntityKind::Category, id, "c1", LIST, Some(50)))
            .unwrap();
        let document =
            RemoteDocument::new("c1", fields(json!({"name": "Old", "lastChangeDate": 10})));
        let follow_ups =
            handle_remote_event(&ctx, EntityKind::Category, ChildEvent::Changed(document), LIST)
                .await
                .unwrap();
        assert_eq!(follow_ups, vec![FollowUp::Push(EntityRef::new(EntityKind::Category, id))]);
        assert_eq!(store.get_category(id).unwrap().unwrap().name, "Fruit");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn late_notification_after_removal_does_not_recreate() {
        let (store, remote, ctx) = setup();
        let id = store.insert_category(&Category::new("Fruit")).unwrap().id.unwrap();
        handle_local_change(&ctx, added(id, EntityKind::Category), LIST).await.unwrap();
        let key = store
            .find_sync_record(EntityKind::Category, id, LIST)
            .unwrap()
            .unwrap()
            .external_id;

        store.remove_category(id).unwrap();
        let removed = LocalChange::new(EntityRef::new(EntityKind::Category, id), ChangeOp::Removed);
        handle_local_change(&ctx, removed, LIST).await.unwrap();
        assert!(remote.peek(&path(EntityKind::Category, &key)).is_none());
        assert!(store.load_sync_records(EntityKind::Category, LIST).unwrap().is_empty());

        let late = RemoteDocument::new(key.clone(), fields(json!({"name": "Fruit", "lastChangeDate": 1})));
        handle_remote_event(&ctx, EntityKind::Category, ChildEvent::Removed(late.clone()), LIST)
            .await
            .unwrap();
        handle_remote_event(&ctx, EntityKind::Category, ChildEvent::Changed(late), LIST)
            .await
            .unwrap();
        assert!(store.list_categories().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_remote_delete_keeps_tombstone() {
        let (store, remote, ctx) = setup();
        let id = store.insert_category(&Category::new("Fruit")).unwrap().id.unwrap();
        handle_local_change(&ctx, added(id, EntityKind::Category), LIST).await.unwrap();

        remote.set_online(false);
        store.remove_category(id).unwrap();
        let removed = LocalChange::new(EntityRef::new(EntityKind::Category, id), ChangeOp::Removed);
        assert!(handle_local_change(&ctx, removed, LIST).await.is_err());

        let records = store.load_sync_records(EntityKind::Category, LIST).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_tombstone());
        assert!(ctx.markers.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tombstone_is_removed_only_once() {
        let (store, remote, ctx) = setup();
        let id = store.insert_category(&Category::new("Fruit")).unwrap().id.unwrap();
        handle_local_change(&ctx, added(id, EntityKind::Category), LIST).await.unwrap();

        store.remove_category(id).unwrap();
        let tombstone = store
            .find_tombstone(EntityKind::Category, id, LIST)
            .unwrap()
            .unwrap();
        let removed = LocalChange::new(EntityRef::new(EntityKind::Category, id), ChangeOp::Removed);
        handle_local_change(&ctx, removed, LIST).await.unwrap();
        let key = tombstone.external_id.clone();
        let writes = remote.write_count();

        handle_follow_up(&ctx, FollowUp::RemoveRemote(tombstone), LIST)
            .await
            .unwrap();
        assert_eq!(remote.write_count(), writes);
        assert!(ctx.markers.is_removing(EntityKind::Category, &key));
        assert!(ctx.markers.take_removing(EntityKind::Category, &key));
        assert!(ctx.markers.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_product_removal_tombstones_items() {
        let (store, _remote, ctx) = setup();
        let product = store.insert_product(&Product::new("Milk")).unwrap().id.unwrap();
        let item = store.insert_shop_item(&ShopItem::new(product)).unwrap().id.unwrap();
        store
            .add_sync_record(&NewSyncRecord::new(EntityKind::Product, product, "p1", LIST, Some(1)))
            .unwrap();
        store
            .add_sync_record(&NewSyncRecord::new(EntityKind::ShopItem, item, "i1", LIST, Some(1)))
            .unwrap();

        let gone = RemoteDocument::new("p1", FieldMap::new());
        let follow_ups =
            handle_remote_event(&ctx, EntityKind::Product, ChildEvent::Removed(gone), LIST)
                .await
                .unwrap();

        assert!(store.get_product(product).unwrap().is_none());
        assert!(store.get_shop_item(item).unwrap().is_none());
        assert_eq!(follow_ups.len(), 1);
        assert_eq!(follow_ups[0].entity(), EntityRef::new(EntityKind::ShopItem, item));
        assert!(store.load_sync_records(EntityKind::Product, LIST).unwrap().is_empty());

        handle_follow_up(&ctx, follow_ups[0].clone(), LIST).await.unwrap();
        assert!(store.load_sync_records(EntityKind::ShopItem, LIST).unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_add_for_tombstone_requests_removal() {
        let (store, _remote, ctx) = setup();
        store
            .add_sync_record(&NewSyncRecord::new(
                EntityKind::Category,
                LocalId::new(7),
                "c1",
                LIST,
                Some(1),
            ))
            .unwrap();
        store
            .update_sync_record(EntityKind::Category, LocalId::new(7), LIST, Some(2), true)
            .unwrap();
        let document = RemoteDocument::new("c1", fields(json!({"name": "Fruit"})));
        let follow_ups =
            handle_remote_event(&ctx, EntityKind::Category, ChildEvent::Added(document), LIST)
                .await
                .unwrap();
        assert!(matches!(follow_ups.as_slice(), [FollowUp::RemoveRemote(record)] if record.external_id == "c1"));
    }
}
