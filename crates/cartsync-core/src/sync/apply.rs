//! Single-entity side effects shared by bulk and incremental synchronization

use serde_json::Value;

use super::codec;
use super::translator::EntityTranslator;
use super::SyncContext;
use crate::error::{Error, Result};
use crate::models::{EntityRef, LocalId, NewSyncRecord, SyncRecord};
use crate::remote::{FieldMap, RemotePath};
use crate::util::unix_millis_now;

fn require_id<T: EntityTranslator>(entity: &T::Entity) -> Result<LocalId> {
    T::id_of(entity).ok_or_else(|| Error::InvalidInput(format!("{} has not been saved", T::KIND)))
}

/// Local entity with the document's fields applied, `None` if nothing changed
pub fn merged<T: EntityTranslator>(
    translator: &T,
    entity: &T::Entity,
    fields: &FieldMap,
    list_id: &str,
) -> Result<Option<T::Entity>> {
    let mut updated = entity.clone();
    translator.from_remote(&mut updated, fields, list_id)?;
    Ok((updated != *entity).then_some(updated))
}

/// Save a remote-originated update, suppressing its local echo
pub fn save_from_remote<T: EntityTranslator>(
    ctx: &SyncContext,
    translator: &T,
    entity: &T::Entity,
) -> Result<()> {
    let entity_ref = EntityRef::new(T::KIND, require_id::<T>(entity)?);
    ctx.markers.mark_written(entity_ref);
    translator.save_local(entity).inspect_err(|_| {
        ctx.markers.take_written(entity_ref);
    })
}

/// Copy the remote fields into a linked entity and stamp its record with
/// the remote timestamp. The record is written after the entity since
/// saving stamps it with the local clock.
pub fn pull<T: EntityTranslator>(
    ctx: &SyncContext,
    translator: &T,
    entity: &T::Entity,
    fields: &FieldMap,
    list_id: &str,
) -> Result<()> {
    let local_id = require_id::<T>(entity)?;
    if let Some(updated) = merged(translator, entity, fields, list_id)? {
        save_from_remote(ctx, translator, &updated)?;
    }
    ctx.store.update_sync_record(
        T::KIND,
        local_id,
        list_id,
        codec::last_change_date(fields),
        false,
    )?;
    tracing::debug!("Pulled {}#{local_id} from list {list_id}", T::KIND);
    Ok(())
}

/// Link an unlinked local entity to an existing document and take the
/// document's fields
pub fn link_and_pull<T: EntityTranslator>(
    ctx: &SyncContext,
    translator: &T,
    entity: &T::Entity,
    remote_id: &str,
    fields: &FieldMap,
    list_id: &str,
) -> Result<LocalId> {
    let local_id = require_id::<T>(entity)?;
    if let Some(updated) = merged(translator, entity, fields, list_id)? {
        save_from_remote(ctx, translator, &updated)?;
    }
    ctx.store.add_sync_record(&NewSyncRecord::new(
        T::KIND,
        local_id,
        remote_id,
        list_id,
        codec::last_change_date(fields),
    ))?;
    tracing::debug!(
        "Linked {}#{local_id} to remote {remote_id} in list {list_id}",
        T::KIND
    );
    Ok(local_id)
}

/// Create a local entity and its record from a document
pub fn create_from_remote<T: EntityTranslator>(
    ctx: &SyncContext,
    translator: &T,
    remote_id: &str,
    fields: &FieldMap,
    list_id: &str,
) -> Result<LocalId> {
    let entity = translator.new_local(fields, list_id)?;
    let natural_id = translator.natural_id(&entity)?;
    if let Some(natural_id) = &natural_id {
        ctx.markers.mark_created(T::KIND, natural_id);
    }
    let created = translator.insert_local(&entity).inspect_err(|_| {
        if let Some(natural_id) = &natural_id {
            ctx.markers.take_created(T::KIND, natural_id);
        }
    })?;
    let local_id = require_id::<T>(&created)?;
    ctx.store.add_sync_record(&NewSyncRecord::new(
        T::KIND,
        local_id,
        remote_id,
        list_id,
        codec::last_change_date(fields),
    ))?;
    tracing::debug!(
        "Created {}#{local_id} from remote {remote_id} in list {list_id}",
        T::KIND
    );
    Ok(local_id)
}

/// Write a local entity that has no record yet, either to a fresh document
/// or over `remote_id`. The record is rolled back when the write fails so
/// the entity is treated as new again later.
pub async fn push_new<T: EntityTranslator>(
    ctx: &SyncContext,
    translator: &T,
    entity: &T::Entity,
    remote_id: Option<&str>,
    list_id: &str,
) -> Result<String> {
    let local_id = require_id::<T>(entity)?;
    let now = unix_millis_now();
    let fields = translator.to_remote(entity, list_id, Some(now))?;
    let remote_id = remote_id.map_or_else(|| ctx.remote.new_key(), str::to_string);
    let path = translator.remote_path(list_id, &remote_id)?;
    let record = ctx.store.add_sync_record(&NewSyncRecord::new(
        T::KIND,
        local_id,
        &remote_id,
        list_id,
        Some(now),
    ))?;
    if let Err(error) = ctx.remote.set(&path, Value::Object(fields)).await {
        ctx.store.remove_sync_record(record.id)?;
        return Err(error.into());
    }
    tracing::debug!("Pushed new {}#{local_id} to {path}", T::KIND);
    Ok(remote_id)
}

/// Stamp a linked entity's record with now and overwrite its document.
/// The stamp stays when the write fails so the next reconciliation pushes.
pub async fn push_existing<T: EntityTranslator>(
    ctx: &SyncContext,
    translator: &T,
    entity: &T::Entity,
    record: &SyncRecord,
) -> Result<()> {
    let now = unix_millis_now();
    let fields = translator.to_remote(entity, &record.list_id, Some(now))?;
    ctx.store.update_sync_record(
        T::KIND,
        record.local_id,
        &record.list_id,
        Some(now),
        false,
    )?;
    let path = translator.remote_path(&record.list_id, &record.external_id)?;
    ctx.remote.set(&path, Value::Object(fields)).await?;
    tracing::debug!("Pushed {} to {path}", record.entity());
    Ok(())
}

/// Remove a local entity whose document is gone and return the tombstones
/// the store left for its dependents, whose documents must go as well. The
/// caller has already dropped the entity's own record.
pub fn remove_cascade<T: EntityTranslator>(
    ctx: &SyncContext,
    translator: &T,
    local_id: LocalId,
    list_id: &str,
) -> Result<Vec<SyncRecord>> {
    let dependents = translator.dependents(local_id)?;
    translator.remove_local(local_id)?;
    let mut tombstones = Vec::new();
    for dependent in dependents {
        let found = ctx
            .store
            .find_tombstone(dependent.kind, dependent.local_id, list_id)?;
        if let Some(tombstone) = found {
            tombstones.push(tombstone);
        }
    }
    tracing::debug!(
        "Removed {}#{local_id} after its remote copy disappeared from list {list_id}",
        T::KIND
    );
    Ok(tombstones)
}

/// Delete a document on behalf of a tombstone, then purge the tombstone.
/// With `listening` set the removal is marked so its own notification is
/// ignored; a tombstone that is already purged is skipped.
pub async fn remove_remote(
    ctx: &SyncContext,
    tombstone: &SyncRecord,
    listening: bool,
) -> Result<()> {
    if ctx.store.get_sync_record(tombstone.id)?.is_none() {
        tracing::debug!("Tombstone of {} is already purged", tombstone.entity());
        return Ok(());
    }
    let path = RemotePath::document(&tombstone.list_id, tombstone.kind, &tombstone.external_id)?;
    if listening {
        ctx.markers.mark_removing(tombstone.kind, &tombstone.external_id);
    }
    if let Err(error) = ctx.remote.remove(&path).await {
        if listening {
            ctx.markers.take_removing(tombstone.kind, &tombstone.external_id);
        }
        return Err(error.into());
    }
    ctx.store.remove_sync_record(tombstone.id)?;
    tracing::debug!("Removed {path} for deleted {}", tombstone.entity());
    Ok(())
}
