//! SQLite-backed storage engine.
//!
//! Each (site, kind) pair owns one table named `"<site>__<kind>"`:
//!
//! | Column | Purpose |
//! |--------|---------|
//! | `_id` | Surrogate identity (autoincrement) |
//! | `_parent_id` | Surrogate identity of the parent entity (indexed) |
//! | `_dedup_key` | Content-derived key, `UNIQUE` within the kind |
//! | `_complete` | All child targets of this entity were visited |
//! | `_updated_at` | RFC 3339 time of the last write |
//! | *fields* | One nullable column per declared field |
//!
//! All writes go through a [`Txn`]. A `Txn` that is dropped without
//! [`Txn::commit`] is rolled back, and SQLite's journal guarantees the same
//! for transactions interrupted by process exit.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnection, SqlitePool, SqliteRow};
use sqlx::{Row, Transaction};

use crate::config::Config;
use crate::db;
use crate::error::{IngestError, Result, StorageError, StorageErrorKind};
use crate::mapper::{self, TermQuery};
use crate::migrate::{self, Change, SchemaDiff};
use crate::models::{format_timestamp, parse_timestamp, DedupKey, Entity, EntityId, StorageRow, Value};
use crate::schema::{check_identifier, EntityKind, EntitySchema, FieldType};

/// A registered site's active schema version.
#[derive(Debug, Clone)]
pub struct SchemaHandle {
    pub site: String,
    pub version: u32,
    pub schema: Arc<EntitySchema>,
}

impl SchemaHandle {
    pub fn new(site: impl Into<String>, version: u32, schema: EntitySchema) -> Self {
        Self {
            site: site.into(),
            version,
            schema: Arc::new(schema),
        }
    }

    pub fn kind(&self, name: &str) -> Result<&EntityKind, StorageError> {
        self.schema
            .get(name)
            .ok_or_else(|| StorageError::unknown_kind(name))
    }

    pub fn table(&self, kind: &str) -> String {
        table_name(&self.site, kind)
    }
}

pub fn table_name(site: &str, kind: &str) -> String {
    format!("{}__{}", site, kind)
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident)
}

/// Scoped write transaction. Rolled back on drop unless committed.
pub struct Txn {
    inner: Transaction<'static, Sqlite>,
}

impl Txn {
    pub async fn commit(self) -> Result<(), StorageError> {
        self.inner.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), StorageError> {
        self.inner.rollback().await?;
        Ok(())
    }

    fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.inner
    }
}

/// Restricts row listings by parent link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentFilter {
    Any,
    /// Rows without a parent.
    Root,
    Of(EntityId),
}

/// Latest schema version recorded for a site.
#[derive(Debug, Clone)]
pub struct SiteVersion {
    pub site: String,
    pub version: u32,
    pub applied_at: String,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open the database and create the internal tables.
    pub async fn open(config: &Config) -> Result<Self, StorageError> {
        let pool = db::connect(config).await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        migrate::ensure_internal_tables(&pool).await.map_err(|e| {
            StorageError::new(StorageErrorKind::Unavailable, e.to_string())
        })?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn begin(&self) -> Result<Txn, StorageError> {
        let inner = self.pool.begin().await?;
        Ok(Txn { inner })
    }

    // ---- schema ----

    /// Latest recorded schema version of `site`, if any.
    pub async fn current_schema(&self, site: &str) -> Result<Option<(u32, EntitySchema)>> {
        let row = sqlx::query(
            "SELECT version, schema_json FROM _schema_versions WHERE site = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(site)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let version: i64 = row.try_get("version")?;
        let json: String = row.try_get("schema_json")?;
        let schema: EntitySchema = serde_json::from_str(&json).map_err(|e| {
            StorageError::decode(format!("stored schema of '{}' v{}: {}", site, version, e))
        })?;
        Ok(Some((version as u32, schema)))
    }

    /// Handle for a site's stored schema, without registering anything.
    pub async fn handle(&self, site: &str) -> Result<Option<SchemaHandle>> {
        Ok(self
            .current_schema(site)
            .await?
            .map(|(version, schema)| SchemaHandle::new(site, version, schema)))
    }

    pub async fn registered_sites(&self) -> Result<Vec<SiteVersion>> {
        let rows = sqlx::query(
            "SELECT site, MAX(version) AS version, MAX(applied_at) AS applied_at \
             FROM _schema_versions GROUP BY site ORDER BY site",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut sites = Vec::with_capacity(rows.len());
        for row in &rows {
            let version: i64 = row.try_get("version")?;
            sites.push(SiteVersion {
                site: row.try_get("site")?,
                version: version as u32,
                applied_at: row.try_get("applied_at")?,
            });
        }
        Ok(sites)
    }

    /// Create or migrate the storage layout of `site` to `schema`.
    ///
    /// Idempotent: an equal schema returns the existing handle. Additive
    /// changes are applied in one transaction and bump the version. Anything
    /// else fails with [`IngestError::SchemaConflict`] and changes nothing.
    pub async fn create_schema(&self, site: &str, schema: &EntitySchema) -> Result<SchemaHandle> {
        check_identifier(site, "site")?;
        schema.validate()?;

        let (version, changes) = match self.current_schema(site).await? {
            None => (
                1,
                schema
                    .kinds
                    .iter()
                    .map(|k| Change::AddKind(k.name.clone()))
                    .collect::<Vec<_>>(),
            ),
            Some((version, old)) => match migrate::diff(&old, schema) {
                SchemaDiff::NoChange => {
                    tracing::debug!(site, version, "schema unchanged");
                    return Ok(SchemaHandle::new(site, version, old));
                }
                SchemaDiff::Incompatible(reasons) => {
                    return Err(IngestError::SchemaConflict {
                        site: site.to_string(),
                        reasons,
                    });
                }
                SchemaDiff::AdditiveCompatible(changes) => (version + 1, changes),
            },
        };

        let schema_json = serde_json::to_string(schema)
            .map_err(|e| StorageError::new(StorageErrorKind::Query, e.to_string()))?;

        let mut txn = self.begin().await?;
        apply_changes(&mut txn, site, schema, &changes).await?;
        sqlx::query(
            "INSERT INTO _schema_versions (site, version, schema_json, applied_at) VALUES (?, ?, ?, ?)",
        )
        .bind(site)
        .bind(version as i64)
        .bind(schema_json)
        .bind(format_timestamp(&Utc::now()))
        .execute(txn.conn())
        .await
        .map_err(StorageError::from)?;
        txn.commit().await?;

        for change in &changes {
            tracing::debug!(site, version, change = %change, "applied schema change");
        }
        tracing::info!(site, version, changes = changes.len(), "schema version applied");
        Ok(SchemaHandle::new(site, version, schema.clone()))
    }

    // ---- transactional entity access ----

    pub async fn lookup_row(
        &self,
        handle: &SchemaHandle,
        kind: &str,
        key: &DedupKey,
        txn: &mut Txn,
    ) -> Result<Option<StorageRow>, StorageError> {
        let k = handle.kind(kind)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE _dedup_key = ?",
            select_list(k),
            quote(&handle.table(kind))
        );
        let row = sqlx::query(&sql)
            .bind(key.as_str())
            .fetch_optional(txn.conn())
            .await?;
        row.map(|r| decode_row(k, &r)).transpose()
    }

    /// Point lookup by dedup key within the transaction.
    pub async fn lookup(
        &self,
        handle: &SchemaHandle,
        kind: &str,
        key: &DedupKey,
        txn: &mut Txn,
    ) -> Result<Option<Entity>, StorageError> {
        let k = handle.kind(kind)?;
        Ok(self
            .lookup_row(handle, kind, key, txn)
            .await?
            .map(|row| mapper::from_record(&row, k)))
    }

    /// Insert `row` (no id) or update it in place (id set).
    ///
    /// A second row with the same dedup key in a kind fails with
    /// [`StorageErrorKind::Constraint`].
    pub async fn upsert(
        &self,
        handle: &SchemaHandle,
        row: &StorageRow,
        txn: &mut Txn,
    ) -> Result<EntityId, StorageError> {
        let kind = handle.kind(&row.kind)?;
        let table = quote(&handle.table(&kind.name));
        let now = format_timestamp(&Utc::now());

        match row.id {
            Some(id) => {
                let mut sets = vec![
                    "_parent_id = ?".to_string(),
                    "_dedup_key = ?".to_string(),
                    "_complete = ?".to_string(),
                    "_updated_at = ?".to_string(),
                ];
                sets.extend(kind.fields.iter().map(|f| format!("{} = ?", quote(&f.name))));
                let sql = format!("UPDATE {} SET {} WHERE _id = ?", table, sets.join(", "));

                let mut q = sqlx::query(&sql)
                    .bind(row.parent_id.map(|p| p.0))
                    .bind(row.dedup_key.as_str())
                    .bind(row.complete)
                    .bind(now);
                for field in &kind.fields {
                    q = bind_value(q, row.value(&field.name));
                }
                let res = q.bind(id.0).execute(txn.conn()).await?;
                if res.rows_affected() == 0 {
                    return Err(StorageError::new(
                        StorageErrorKind::Query,
                        format!("no {} row with id {}", kind.name, id),
                    ));
                }
                Ok(id)
            }
            None => {
                let mut cols = vec![
                    "_parent_id".to_string(),
                    "_dedup_key".to_string(),
                    "_complete".to_string(),
                    "_updated_at".to_string(),
                ];
                cols.extend(kind.fields.iter().map(|f| quote(&f.name)));
                let placeholders = vec!["?"; cols.len()].join(", ");
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    table,
                    cols.join(", "),
                    placeholders
                );

                let mut q = sqlx::query(&sql)
                    .bind(row.parent_id.map(|p| p.0))
                    .bind(row.dedup_key.as_str())
                    .bind(row.complete)
                    .bind(now);
                for field in &kind.fields {
                    q = bind_value(q, row.value(&field.name));
                }
                let res = q.execute(txn.conn()).await?;
                Ok(EntityId(res.last_insert_rowid()))
            }
        }
    }

    /// Delete the entity with `key` and every descendant. Returns false when
    /// no such entity exists.
    pub async fn delete(
        &self,
        handle: &SchemaHandle,
        kind: &str,
        key: &DedupKey,
        txn: &mut Txn,
    ) -> Result<bool, StorageError> {
        let k = handle.kind(kind)?;
        let sql = format!(
            "SELECT _id FROM {} WHERE _dedup_key = ?",
            quote(&handle.table(kind))
        );
        let id: Option<i64> = sqlx::query_scalar(&sql)
            .bind(key.as_str())
            .fetch_optional(txn.conn())
            .await?;
        let Some(id) = id else {
            return Ok(false);
        };

        let mut stack: Vec<(&EntityKind, i64)> = vec![(k, id)];
        while let Some((kind, id)) = stack.pop() {
            for rel in &kind.relations {
                let child = handle.kind(&rel.kind)?;
                let sql = format!(
                    "SELECT _id FROM {} WHERE _parent_id = ?",
                    quote(&handle.table(&child.name))
                );
                let ids: Vec<i64> = sqlx::query_scalar(&sql)
                    .bind(id)
                    .fetch_all(txn.conn())
                    .await?;
                stack.extend(ids.into_iter().map(|c| (child, c)));
            }
            let sql = format!("DELETE FROM {} WHERE _id = ?", quote(&handle.table(&kind.name)));
            sqlx::query(&sql).bind(id).execute(txn.conn()).await?;
        }
        Ok(true)
    }

    /// Flag an entity's subtree as fully visited.
    pub async fn mark_complete(
        &self,
        handle: &SchemaHandle,
        kind: &str,
        id: EntityId,
        txn: &mut Txn,
    ) -> Result<(), StorageError> {
        handle.kind(kind)?;
        let sql = format!(
            "UPDATE {} SET _complete = 1 WHERE _id = ?",
            quote(&handle.table(kind))
        );
        sqlx::query(&sql).bind(id.0).execute(txn.conn()).await?;
        Ok(())
    }

    // ---- read-only queries ----

    pub async fn get_row(
        &self,
        handle: &SchemaHandle,
        kind: &str,
        id: EntityId,
    ) -> Result<Option<StorageRow>, StorageError> {
        let k = handle.kind(kind)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE _id = ?",
            select_list(k),
            quote(&handle.table(kind))
        );
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode_row(k, &r)).transpose()
    }

    pub async fn find_row(
        &self,
        handle: &SchemaHandle,
        kind: &str,
        key: &DedupKey,
    ) -> Result<Option<StorageRow>, StorageError> {
        let k = handle.kind(kind)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE _dedup_key = ?",
            select_list(k),
            quote(&handle.table(kind))
        );
        let row = sqlx::query(&sql)
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode_row(k, &r)).transpose()
    }

    /// One keyset page of rows ordered by `_id`, strictly after `after`.
    pub async fn rows_page(
        &self,
        handle: &SchemaHandle,
        kind: &str,
        parent: ParentFilter,
        after: Option<EntityId>,
        limit: i64,
    ) -> Result<Vec<StorageRow>, StorageError> {
        let k = handle.kind(kind)?;
        let mut sql = format!(
            "SELECT {} FROM {} WHERE _id > ?",
            select_list(k),
            quote(&handle.table(kind))
        );
        sql.push_str(parent_clause(parent));
        sql.push_str(" ORDER BY _id ASC LIMIT ?");

        let mut q = sqlx::query::<Sqlite>(&sql).bind(after.map(|a| a.0).unwrap_or(0));
        if let ParentFilter::Of(p) = parent {
            q = q.bind(p.0);
        }
        let rows = q.bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(|r| decode_row(k, r)).collect()
    }

    pub async fn count(
        &self,
        handle: &SchemaHandle,
        kind: &str,
        parent: ParentFilter,
    ) -> Result<i64, StorageError> {
        handle.kind(kind)?;
        let mut sql = format!(
            "SELECT COUNT(*) FROM {} WHERE 1 = 1",
            quote(&handle.table(kind))
        );
        sql.push_str(parent_clause(parent));
        let mut q = sqlx::query_scalar::<Sqlite, i64>(&sql);
        if let ParentFilter::Of(p) = parent {
            q = q.bind(p.0);
        }
        Ok(q.fetch_one(&self.pool).await?)
    }

    /// Rows whose `field` matches every `all` term, at least one `any` term
    /// and no `not` term (case-insensitive substring match).
    pub async fn search_rows(
        &self,
        handle: &SchemaHandle,
        kind: &str,
        field: &str,
        terms: &TermQuery,
        limit: Option<i64>,
    ) -> Result<Vec<StorageRow>, StorageError> {
        let k = handle.kind(kind)?;
        if k.get_field(field).is_none() {
            return Err(StorageError::new(
                StorageErrorKind::Query,
                format!("kind '{}' has no field '{}'", kind, field),
            ));
        }
        let col = format!("COALESCE(CAST({} AS TEXT), '')", quote(field));

        let mut conds = Vec::new();
        let mut binds = Vec::new();
        for term in &terms.all {
            conds.push(format!("{} LIKE ? ESCAPE '\\'", col));
            binds.push(like_pattern(term));
        }
        if !terms.any.is_empty() {
            let ors: Vec<String> = terms
                .any
                .iter()
                .map(|_| format!("{} LIKE ? ESCAPE '\\'", col))
                .collect();
            conds.push(format!("({})", ors.join(" OR ")));
            binds.extend(terms.any.iter().map(|t| like_pattern(t)));
        }
        for term in &terms.not {
            conds.push(format!("{} NOT LIKE ? ESCAPE '\\'", col));
            binds.push(like_pattern(term));
        }

        let mut sql = format!(
            "SELECT {} FROM {}",
            select_list(k),
            quote(&handle.table(kind))
        );
        if !conds.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conds.join(" AND "));
        }
        sql.push_str(" ORDER BY _id ASC LIMIT ?");

        let mut q = sqlx::query::<Sqlite>(&sql);
        for b in binds {
            q = q.bind(b);
        }
        let rows = q.bind(limit.unwrap_or(-1)).fetch_all(&self.pool).await?;
        rows.iter().map(|r| decode_row(k, r)).collect()
    }
}

fn parent_clause(parent: ParentFilter) -> &'static str {
    match parent {
        ParentFilter::Any => "",
        ParentFilter::Root => " AND _parent_id IS NULL",
        ParentFilter::Of(_) => " AND _parent_id = ?",
    }
}

fn like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

fn select_list(kind: &EntityKind) -> String {
    let mut cols = vec![
        "_id".to_string(),
        "_parent_id".to_string(),
        "_dedup_key".to_string(),
        "_complete".to_string(),
    ];
    cols.extend(kind.fields.iter().map(|f| quote(&f.name)));
    cols.join(", ")
}

fn bind_value<'q>(
    q: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: Option<&Value>,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        None => q.bind(None::<String>),
        Some(Value::Text(s)) => q.bind(s.clone()),
        Some(Value::Integer(n)) => q.bind(*n),
        Some(Value::Real(r)) => q.bind(*r),
        Some(Value::Timestamp(ts)) => q.bind(format_timestamp(ts)),
        Some(Value::Blob(b)) => q.bind(b.clone()),
    }
}

fn decode_row(kind: &EntityKind, row: &SqliteRow) -> Result<StorageRow, StorageError> {
    let id: i64 = row.try_get("_id")?;
    let parent_id: Option<i64> = row.try_get("_parent_id")?;
    let dedup_key: String = row.try_get("_dedup_key")?;
    let complete: bool = row.try_get("_complete")?;

    let mut values = Vec::with_capacity(kind.fields.len());
    for field in &kind.fields {
        let value = decode_value(row, &kind.name, &field.name, field.ty)?;
        values.push((field.name.clone(), value));
    }

    Ok(StorageRow {
        kind: kind.name.clone(),
        id: Some(EntityId(id)),
        parent_id: parent_id.map(EntityId),
        dedup_key: DedupKey(dedup_key),
        complete,
        values,
    })
}

fn decode_value(
    row: &SqliteRow,
    kind: &str,
    col: &str,
    ty: FieldType,
) -> Result<Option<Value>, StorageError> {
    let value = match ty {
        FieldType::Text => row.try_get::<Option<String>, _>(col)?.map(Value::Text),
        FieldType::Integer => row.try_get::<Option<i64>, _>(col)?.map(Value::Integer),
        FieldType::Real => row.try_get::<Option<f64>, _>(col)?.map(Value::Real),
        FieldType::Blob => row.try_get::<Option<Vec<u8>>, _>(col)?.map(Value::Blob),
        FieldType::Timestamp => match row.try_get::<Option<String>, _>(col)? {
            None => None,
            Some(s) => Some(Value::Timestamp(parse_timestamp(&s).ok_or_else(|| {
                StorageError::decode(format!("{}.{}: invalid timestamp '{}'", kind, col, s))
            })?)),
        },
    };
    Ok(value)
}

fn create_table_sql(table: &str, kind: &EntityKind) -> String {
    let mut cols = vec![
        "_id INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
        "_parent_id INTEGER".to_string(),
        "_dedup_key TEXT NOT NULL UNIQUE".to_string(),
        "_complete INTEGER NOT NULL DEFAULT 0".to_string(),
        "_updated_at TEXT NOT NULL".to_string(),
    ];
    cols.extend(
        kind.fields
            .iter()
            .map(|f| format!("{} {}", quote(&f.name), f.ty.sql_type())),
    );
    format!("CREATE TABLE IF NOT EXISTS {} (\n    {}\n)", quote(table), cols.join(",\n    "))
}

async fn create_parent_index(txn: &mut Txn, table: &str) -> Result<(), StorageError> {
    let sql = format!(
        "CREATE INDEX IF NOT EXISTS {} ON {}(_parent_id)",
        quote(&format!("idx_{}_parent", table)),
        quote(table)
    );
    sqlx::query(&sql).execute(txn.conn()).await?;
    Ok(())
}

/// Apply one version's worth of additive changes inside `txn`.
async fn apply_changes(
    txn: &mut Txn,
    site: &str,
    schema: &EntitySchema,
    changes: &[Change],
) -> Result<(), StorageError> {
    // Kinds with a widened column are rebuilt, which also covers their new fields.
    let mut widened: BTreeMap<&str, BTreeMap<&str, FieldType>> = BTreeMap::new();
    let mut added: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for change in changes {
        match change {
            Change::WidenField {
                kind, field, from, ..
            } => {
                widened
                    .entry(kind.as_str())
                    .or_default()
                    .insert(field.as_str(), *from);
            }
            Change::AddField { kind, field } => {
                added.entry(kind.as_str()).or_default().insert(field.as_str());
            }
            _ => {}
        }
    }

    for change in changes {
        match change {
            Change::AddKind(name) => {
                let kind = schema.get(name).ok_or_else(|| StorageError::unknown_kind(name))?;
                let table = table_name(site, name);
                sqlx::query(&create_table_sql(&table, kind))
                    .execute(txn.conn())
                    .await?;
                create_parent_index(txn, &table).await?;
            }
            Change::AddField { kind, field } if !widened.contains_key(kind.as_str()) => {
                let k = schema.get(kind).ok_or_else(|| StorageError::unknown_kind(kind))?;
                let f = k.get_field(field).ok_or_else(|| {
                    StorageError::new(
                        StorageErrorKind::Query,
                        format!("field '{}.{}' is not declared", kind, field),
                    )
                })?;
                let sql = format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    quote(&table_name(site, kind)),
                    quote(field),
                    f.ty.sql_type()
                );
                sqlx::query(&sql).execute(txn.conn()).await?;
            }
            _ => {}
        }
    }

    for (name, widened_fields) in &widened {
        let kind = schema.get(name).ok_or_else(|| StorageError::unknown_kind(name))?;
        let new_fields = added.get(name).cloned().unwrap_or_default();
        rebuild_table(txn, site, kind, widened_fields, &new_fields).await?;
    }

    // Backfill defaults for rows persisted before the field existed.
    for (name, fields) in &added {
        let kind = schema.get(name).ok_or_else(|| StorageError::unknown_kind(name))?;
        for field in fields {
            let Some(default) = kind.get_field(field).and_then(|f| f.default.as_ref()) else {
                continue;
            };
            let sql = format!(
                "UPDATE {} SET {} = ? WHERE {} IS NULL",
                quote(&table_name(site, name)),
                quote(field),
                quote(field)
            );
            bind_value(sqlx::query(&sql), Some(default))
                .execute(txn.conn())
                .await?;
        }
    }

    Ok(())
}

/// Recreate a kind's table with widened columns, keeping `_id`s.
///
/// Widened values are converted with [`Value::widen`] rather than SQL
/// `CAST`, so stored rows read back exactly as a fresh candidate of the new
/// type would (SQLite renders `10.0` as `'10.0'`, Rust as `"10"`).
async fn rebuild_table(
    txn: &mut Txn,
    site: &str,
    kind: &EntityKind,
    widened: &BTreeMap<&str, FieldType>,
    added: &BTreeSet<&str>,
) -> Result<(), StorageError> {
    let table = table_name(site, &kind.name);
    let scratch = format!("_rebuild_{}", table);

    sqlx::query(&create_table_sql(&scratch, kind))
        .execute(txn.conn())
        .await?;

    let mut cols = vec![
        "_id".to_string(),
        "_parent_id".to_string(),
        "_dedup_key".to_string(),
        "_complete".to_string(),
        "_updated_at".to_string(),
    ];
    let mut exprs = cols.clone();
    for field in &kind.fields {
        let name = field.name.as_str();
        cols.push(quote(name));
        exprs.push(if added.contains(name) || widened.contains_key(name) {
            "NULL".to_string()
        } else {
            quote(name)
        });
    }

    let copy = format!(
        "INSERT INTO {} ({}) SELECT {} FROM {}",
        quote(&scratch),
        cols.join(", "),
        exprs.join(", "),
        quote(&table)
    );
    sqlx::query(&copy).execute(txn.conn()).await?;

    for (&name, &from) in widened {
        let to = kind.get_field(name).map(|f| f.ty).ok_or_else(|| {
            StorageError::new(
                StorageErrorKind::Query,
                format!("field '{}.{}' is not declared", kind.name, name),
            )
        })?;
        widen_column(txn, &table, &scratch, &kind.name, name, from, to).await?;
    }

    sqlx::query(&format!("DROP TABLE {}", quote(&table)))
        .execute(txn.conn())
        .await?;
    sqlx::query(&format!(
        "ALTER TABLE {} RENAME TO {}",
        quote(&scratch),
        quote(&table)
    ))
    .execute(txn.conn())
    .await?;
    create_parent_index(txn, &table).await?;

    let fields: Vec<&str> = widened.keys().copied().collect();
    tracing::debug!(table = %table, fields = ?fields, "rebuilt table with widened columns");
    Ok(())
}

/// Copy column `name` from `table` into `scratch`, converting `from` to `to`.
async fn widen_column(
    txn: &mut Txn,
    table: &str,
    scratch: &str,
    kind: &str,
    name: &str,
    from: FieldType,
    to: FieldType,
) -> Result<(), StorageError> {
    let select = format!(
        "SELECT _id, {col} FROM {} WHERE {col} IS NOT NULL",
        quote(table),
        col = quote(name)
    );
    let rows = sqlx::query(&select).fetch_all(txn.conn()).await?;

    let update = format!("UPDATE {} SET {} = ? WHERE _id = ?", quote(scratch), quote(name));
    for row in &rows {
        let id: i64 = row.try_get("_id")?;
        let Some(old) = decode_value(row, kind, name, from)? else {
            continue;
        };
        let new = old.widen(to).ok_or_else(|| {
            StorageError::new(
                StorageErrorKind::Constraint,
                format!(
                    "{}.{}: stored value {} of row {} cannot widen to {} without loss",
                    kind, name, old, id, to
                ),
            )
        })?;
        bind_value(sqlx::query(&update), Some(&new))
            .bind(id)
            .execute(txn.conn())
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("chair"), "%chair%");
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
        assert_eq!(like_pattern("a\\b"), "%a\\\\b%");
    }

    #[test]
    fn create_table_lists_internal_columns_first() {
        let kind = EntityKind::new("listing")
            .field(crate::schema::Field::text("id").required())
            .field(crate::schema::Field::real("price"))
            .dedup_key(["id"]);
        let sql = create_table_sql("demo__listing", &kind);
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"demo__listing\""));
        let id_pos = sql.find("_id INTEGER PRIMARY KEY").unwrap();
        let price_pos = sql.find("\"price\" REAL").unwrap();
        assert!(id_pos < price_pos);
        assert!(sql.contains("_dedup_key TEXT NOT NULL UNIQUE"));
    }
}
