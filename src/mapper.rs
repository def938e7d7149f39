//! Generic entity ↔ row mapping and read-only entity queries.
//!
//! [`to_record`] and [`from_record`] are pure and inverse of each other for
//! any valid entity. [`EntityMapper`] is the read surface handed to
//! presentation and export layers: point reads, lazy keyset-paged listings
//! and relation traversal. It never writes and knows nothing about any
//! particular site type.

use std::collections::VecDeque;

use crate::error::{IngestError, Result};
use crate::models::{DedupKey, Entity, EntityId, StorageRow};
use crate::schema::EntityKind;
use crate::store::{ParentFilter, SchemaHandle, Store};

const PAGE_SIZE: i64 = 200;

/// Fill declared defaults and widen values to their declared field types.
///
/// Rejects unknown fields, values that cannot be losslessly converted and
/// missing required fields.
pub fn normalize(kind: &EntityKind, mut entity: Entity) -> Result<Entity> {
    check_kind(kind, &entity)?;
    for field in &kind.fields {
        match entity.fields.get(&field.name) {
            Some(value) if value.field_type() != field.ty => {
                let widened = value.widen(field.ty).ok_or_else(|| {
                    IngestError::InvalidEntity(format!(
                        "{}.{}: expected {}, got {}",
                        kind.name,
                        field.name,
                        field.ty,
                        value.field_type()
                    ))
                })?;
                entity.fields.insert(field.name.clone(), widened);
            }
            Some(_) => {}
            None => {
                if let Some(default) = &field.default {
                    entity.fields.insert(field.name.clone(), default.clone());
                }
            }
        }
    }
    check_fields(kind, &entity)?;
    Ok(entity)
}

/// Map an entity to its storage row, deriving the dedup key from the kind.
pub fn to_record(kind: &EntityKind, entity: &Entity) -> Result<StorageRow> {
    let key = DedupKey::derive(kind, entity)?;
    to_record_with_key(kind, entity, key)
}

/// Map an entity to its storage row with an externally computed key.
///
/// The row starts out incomplete; the sync engine flags it once every child
/// target has been visited.
pub fn to_record_with_key(kind: &EntityKind, entity: &Entity, key: DedupKey) -> Result<StorageRow> {
    check_kind(kind, entity)?;
    check_fields(kind, entity)?;
    let values = kind
        .fields
        .iter()
        .map(|f| (f.name.clone(), entity.fields.get(&f.name).cloned()))
        .collect();
    Ok(StorageRow {
        kind: kind.name.clone(),
        id: entity.id,
        parent_id: entity.parent,
        dedup_key: key,
        complete: false,
        values,
    })
}

/// Rebuild an entity from its storage row. `NULL` columns are omitted.
pub fn from_record(row: &StorageRow, kind: &EntityKind) -> Entity {
    let mut entity = Entity::new(kind.name.clone());
    entity.id = row.id;
    entity.parent = row.parent_id;
    for field in &kind.fields {
        if let Some(value) = row.value(&field.name) {
            entity.fields.insert(field.name.clone(), value.clone());
        }
    }
    entity
}

fn check_kind(kind: &EntityKind, entity: &Entity) -> Result<()> {
    if entity.kind != kind.name {
        return Err(IngestError::InvalidEntity(format!(
            "entity of kind '{}' mapped as '{}'",
            entity.kind, kind.name
        )));
    }
    Ok(())
}

fn check_fields(kind: &EntityKind, entity: &Entity) -> Result<()> {
    for (name, value) in &entity.fields {
        let field = kind.get_field(name).ok_or_else(|| {
            IngestError::InvalidEntity(format!("{}: undeclared field '{}'", kind.name, name))
        })?;
        if value.field_type() != field.ty {
            return Err(IngestError::InvalidEntity(format!(
                "{}.{}: expected {}, got {}",
                kind.name,
                name,
                field.ty,
                value.field_type()
            )));
        }
    }
    for field in kind.fields.iter().filter(|f| f.required) {
        if !entity.fields.contains_key(&field.name) {
            return Err(IngestError::InvalidEntity(format!(
                "{}: required field '{}' is missing",
                kind.name, field.name
            )));
        }
    }
    Ok(())
}

/// Term filter for [`EntityMapper::search`]: every `all` term, at least one
/// `any` term (when given) and no `not` term must occur in the field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TermQuery {
    pub all: Vec<String>,
    pub any: Vec<String>,
    pub not: Vec<String>,
}

impl TermQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(mut self, term: impl Into<String>) -> Self {
        self.all.push(term.into());
        self
    }

    pub fn any(mut self, term: impl Into<String>) -> Self {
        self.any.push(term.into());
        self
    }

    pub fn not(mut self, term: impl Into<String>) -> Self {
        self.not.push(term.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty() && self.any.is_empty() && self.not.is_empty()
    }
}

/// Read-only queries over one site's persisted entities.
#[derive(Clone)]
pub struct EntityMapper {
    store: Store,
    handle: SchemaHandle,
}

impl EntityMapper {
    pub fn new(store: Store, handle: SchemaHandle) -> Self {
        Self { store, handle }
    }

    pub fn handle(&self) -> &SchemaHandle {
        &self.handle
    }

    fn kind(&self, name: &str) -> Result<&EntityKind> {
        self.handle
            .schema
            .get(name)
            .ok_or_else(|| IngestError::UnknownKind(name.to_string()))
    }

    pub async fn get(&self, kind: &str, id: EntityId) -> Result<Option<Entity>> {
        let k = self.kind(kind)?;
        let row = self.store.get_row(&self.handle, kind, id).await?;
        Ok(row.map(|r| from_record(&r, k)))
    }

    pub async fn find(&self, kind: &str, key: &DedupKey) -> Result<Option<Entity>> {
        let k = self.kind(kind)?;
        let row = self.store.find_row(&self.handle, kind, key).await?;
        Ok(row.map(|r| from_record(&r, k)))
    }

    /// Entities of `kind` without a parent.
    pub fn roots(&self, kind: &str) -> Result<EntityCursor> {
        self.cursor(kind, ParentFilter::Root)
    }

    pub fn all(&self, kind: &str) -> Result<EntityCursor> {
        self.cursor(kind, ParentFilter::Any)
    }

    /// Children of a persisted entity along `relation`.
    pub fn children(&self, entity: &Entity, relation: &str) -> Result<EntityCursor> {
        let (child_kind, parent) = self.relation_target(entity, relation)?;
        self.cursor(&child_kind, ParentFilter::Of(parent))
    }

    pub async fn count(&self, kind: &str) -> Result<i64> {
        self.kind(kind)?;
        Ok(self.store.count(&self.handle, kind, ParentFilter::Any).await?)
    }

    pub async fn count_children(&self, entity: &Entity, relation: &str) -> Result<i64> {
        let (child_kind, parent) = self.relation_target(entity, relation)?;
        Ok(self
            .store
            .count(&self.handle, &child_kind, ParentFilter::Of(parent))
            .await?)
    }

    pub async fn search(
        &self,
        kind: &str,
        field: &str,
        terms: &TermQuery,
        limit: Option<i64>,
    ) -> Result<Vec<Entity>> {
        let k = self.kind(kind)?;
        let rows = self
            .store
            .search_rows(&self.handle, kind, field, terms, limit)
            .await?;
        Ok(rows.iter().map(|r| from_record(r, k)).collect())
    }

    fn relation_target(&self, entity: &Entity, relation: &str) -> Result<(String, EntityId)> {
        let kind = self.kind(&entity.kind)?;
        let rel = kind.get_relation(relation).ok_or_else(|| {
            IngestError::InvalidEntity(format!(
                "kind '{}' has no relation '{}'",
                kind.name, relation
            ))
        })?;
        let id = entity.id.ok_or_else(|| {
            IngestError::InvalidEntity(format!(
                "{} entity is not persisted; cannot traverse '{}'",
                kind.name, relation
            ))
        })?;
        Ok((rel.kind.clone(), id))
    }

    fn cursor(&self, kind: &str, filter: ParentFilter) -> Result<EntityCursor> {
        let k = self.kind(kind)?;
        Ok(EntityCursor {
            store: self.store.clone(),
            handle: self.handle.clone(),
            kind: k.clone(),
            filter,
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }
}

/// Lazy, finite sequence of entities backed by keyset-paged queries.
///
/// Nothing is cached across [`EntityCursor::restart`]; a restarted cursor
/// re-queries storage and sees rows committed since.
pub struct EntityCursor {
    store: Store,
    handle: SchemaHandle,
    kind: EntityKind,
    filter: ParentFilter,
    after: Option<EntityId>,
    buffer: VecDeque<Entity>,
    exhausted: bool,
}

impl EntityCursor {
    pub async fn next(&mut self) -> Result<Option<Entity>> {
        if self.buffer.is_empty() && !self.exhausted {
            let rows = self
                .store
                .rows_page(&self.handle, &self.kind.name, self.filter, self.after, PAGE_SIZE)
                .await?;
            if (rows.len() as i64) < PAGE_SIZE {
                self.exhausted = true;
            }
            if let Some(last) = rows.last() {
                self.after = last.id;
            }
            self.buffer
                .extend(rows.iter().map(|r| from_record(r, &self.kind)));
        }
        Ok(self.buffer.pop_front())
    }

    pub fn restart(&mut self) {
        self.after = None;
        self.buffer.clear();
        self.exhausted = false;
    }

    pub async fn collect_all(mut self) -> Result<Vec<Entity>> {
        let mut out = Vec::new();
        while let Some(entity) = self.next().await? {
            out.push(entity);
        }
        Ok(out)
    }
}
