//! Declarative site type over JSON documents.
//!
//! Configured under `[sites.json.<name>]`. Every fetch target's locator is
//! resolved against `base`, either a local directory or an `http(s)://` URL,
//! and the document found there describes one entity:
//!
//! ```json
//! {
//!   "kind": "listing",
//!   "fields": { "id": "L1", "title": "Oak desk" },
//!   "children": [ { "kind": "bid", "fields": { "listing_id": "L1", "amount": 10.0 } } ],
//!   "targets": [ { "kind": "photo", "locator": "photos/L1-1.json" } ],
//!   "next": "listings/page-2.json"
//! }
//! ```
//!
//! `children` are inline entities committed with the document's entity,
//! `targets` are fetched separately, and `next` (a locator, or a
//! `{kind, locator}` object) names the following page of roots.
//!
//! A text field may be given as `{"file": "<locator>"}`. It is stored as a
//! [`FileRef`]; when `[fetch] archive_dir` is set and `archive_defer` is off,
//! the file is downloaded into the archive during the sync.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::config::JsonSiteConfig;
use crate::error::SiteError;
use crate::fetch::{file_extension, FileArchive, FileRef, HttpFetcher};
use crate::models::{parse_timestamp, Entity, EntityTree, Value};
use crate::schema::{EntityKind, EntitySchema, FieldType};
use crate::site::{FetchTarget, Parsed, ResumeState, SiteType};

pub struct JsonSite {
    name: String,
    config: JsonSiteConfig,
    schema: EntitySchema,
    fetcher: Arc<HttpFetcher>,
}

#[derive(Debug, Deserialize)]
struct InlineDoc {
    kind: String,
    #[serde(default)]
    fields: serde_json::Map<String, JsonValue>,
    #[serde(default)]
    children: Vec<InlineDoc>,
}

#[derive(Debug, Deserialize)]
struct Document {
    #[serde(flatten)]
    entity: InlineDoc,
    #[serde(default)]
    targets: Vec<FetchTarget>,
    #[serde(default)]
    next: Option<JsonValue>,
}

impl JsonSite {
    pub fn new(name: String, config: JsonSiteConfig, fetcher: Arc<HttpFetcher>) -> Self {
        let schema = config.schema();
        Self {
            name,
            config,
            schema,
            fetcher,
        }
    }

    fn is_remote(&self) -> bool {
        self.config.base.starts_with("http://") || self.config.base.starts_with("https://")
    }

    fn resolve(&self, locator: &str) -> Source {
        if locator.starts_with("http://") || locator.starts_with("https://") {
            return Source::Url(locator.to_string());
        }
        if self.is_remote() {
            return Source::Url(format!(
                "{}/{}",
                self.config.base.trim_end_matches('/'),
                locator.trim_start_matches('/')
            ));
        }
        Source::Path(Path::new(&self.config.base).join(locator))
    }

    async fn load(&self, target: &FetchTarget) -> Result<String, SiteError> {
        match self.resolve(&target.locator) {
            Source::Url(url) => self.fetcher.get_text(target, &url).await,
            Source::Path(path) => {
                tracing::debug!(fetch = %target, path = %path.display(), "read");
                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| SiteError::fetch(target, format!("{}: {}", path.display(), e)))
            }
        }
    }

    async fn load_bytes(&self, target: &FetchTarget, locator: &str) -> Result<Vec<u8>, SiteError> {
        match self.resolve(locator) {
            Source::Url(url) => self.fetcher.get_bytes(target, &url).await,
            Source::Path(path) => tokio::fs::read(&path)
                .await
                .map_err(|e| SiteError::fetch(target, format!("{}: {}", path.display(), e))),
        }
    }

    /// Download every `{"file": ...}` field of the document into `archive`
    /// and replace it with its stored [`FileRef`].
    async fn archive_files(
        &self,
        target: &FetchTarget,
        archive: &FileArchive,
        doc: &mut JsonValue,
    ) -> Result<(), SiteError> {
        let mut refs = Vec::new();
        collect_file_fields(doc, &mut refs);
        for slot in refs {
            let Some(locator) = file_locator(slot).map(str::to_string) else {
                continue;
            };
            let data = self.load_bytes(target, &locator).await?;
            let name = archive
                .save(target, &data, &file_extension(&locator))
                .await?;
            let stored = FileRef {
                locator,
                archived: Some(name),
            };
            *slot = JsonValue::String(stored.to_string());
        }
        Ok(())
    }
}

enum Source {
    Url(String),
    Path(PathBuf),
}

/// `{"file": "<locator>"}`
fn file_locator(value: &JsonValue) -> Option<&str> {
    let obj = value.as_object().filter(|o| o.len() == 1)?;
    obj.get("file")?.as_str()
}

fn collect_file_fields<'a>(doc: &'a mut JsonValue, out: &mut Vec<&'a mut JsonValue>) {
    let Some(obj) = doc.as_object_mut() else {
        return;
    };
    for (key, value) in obj.iter_mut() {
        match key.as_str() {
            "fields" => {
                if let Some(fields) = value.as_object_mut() {
                    for field in fields.values_mut() {
                        if file_locator(field).is_some() {
                            out.push(field);
                        }
                    }
                }
            }
            "children" => {
                if let Some(children) = value.as_array_mut() {
                    for child in children {
                        collect_file_fields(child, out);
                    }
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl SiteType for JsonSite {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        self.config.description.as_deref().unwrap_or("JSON documents")
    }

    fn schema(&self) -> EntitySchema {
        self.schema.clone()
    }

    async fn root_targets(
        &self,
        previous: Option<&ResumeState>,
    ) -> Result<Vec<FetchTarget>, SiteError> {
        let mut roots = self.config.roots.clone();
        let resumed = previous
            .and_then(|p| p.continuation.as_deref())
            .and_then(|marker| self.continuation_target(marker));
        if let Some(target) = resumed {
            if !roots.contains(&target) {
                roots.push(target);
            }
        }
        Ok(roots)
    }

    async fn fetch_and_parse(&self, target: &FetchTarget) -> Result<Parsed, SiteError> {
        let text = self.load(target).await?;
        let mut doc: JsonValue = serde_json::from_str(&text)
            .map_err(|e| SiteError::parse(target, format!("invalid JSON: {}", e)))?;
        if let Some(archive) = self.fetcher.archive().filter(|a| !a.defer()) {
            self.archive_files(target, archive, &mut doc).await?;
        }
        parse_value(&self.schema, target, doc)
    }

    fn continuation_target(&self, marker: &str) -> Option<FetchTarget> {
        if let Ok(target) = serde_json::from_str::<FetchTarget>(marker) {
            return Some(target);
        }
        let kind = self.config.roots.first()?.kind.clone();
        Some(FetchTarget::new(kind, marker))
    }
}

/// Parse one JSON document into the entity it describes.
pub fn parse_document(
    schema: &EntitySchema,
    target: &FetchTarget,
    text: &str,
) -> Result<Parsed, SiteError> {
    let doc: JsonValue = serde_json::from_str(text)
        .map_err(|e| SiteError::parse(target, format!("invalid JSON: {}", e)))?;
    parse_value(schema, target, doc)
}

fn parse_value(
    schema: &EntitySchema,
    target: &FetchTarget,
    doc: JsonValue,
) -> Result<Parsed, SiteError> {
    let doc: Document = serde_json::from_value(doc)
        .map_err(|e| SiteError::parse(target, format!("invalid document: {}", e)))?;

    let tree = convert_tree(schema, target, &doc.entity)?;
    let mut parsed = Parsed::new(tree);
    for child in doc.targets {
        if schema.get(&child.kind).is_none() {
            return Err(SiteError::parse(
                target,
                format!("target '{}' names an undeclared kind", child),
            ));
        }
        parsed = parsed.with_target(child);
    }

    parsed.continuation = match doc.next {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(s)) => Some(s),
        Some(obj @ JsonValue::Object(_)) => {
            let next: FetchTarget = serde_json::from_value(obj)
                .map_err(|e| SiteError::parse(target, format!("invalid 'next': {}", e)))?;
            serde_json::to_string(&next).ok()
        }
        Some(other) => {
            return Err(SiteError::parse(
                target,
                format!("'next' must be a string or object, got {}", other),
            ))
        }
    };
    Ok(parsed)
}

fn convert_tree(
    schema: &EntitySchema,
    target: &FetchTarget,
    doc: &InlineDoc,
) -> Result<EntityTree, SiteError> {
    let kind = schema
        .get(&doc.kind)
        .ok_or_else(|| SiteError::parse(target, format!("undeclared kind '{}'", doc.kind)))?;

    let mut entity = Entity::new(&kind.name);
    for (name, raw) in &doc.fields {
        if let Some(value) = convert_field(kind, target, name, raw)? {
            entity.set(name.clone(), value);
        }
    }

    let mut tree = EntityTree::leaf(entity);
    for child in &doc.children {
        tree = tree.with_child(convert_tree(schema, target, child)?);
    }
    Ok(tree)
}

/// Convert a JSON value to the declared type of `kind.name`. `null` is an
/// absent value.
fn convert_field(
    kind: &EntityKind,
    target: &FetchTarget,
    name: &str,
    raw: &JsonValue,
) -> Result<Option<Value>, SiteError> {
    let field = kind.get_field(name).ok_or_else(|| {
        SiteError::parse(target, format!("{}: undeclared field '{}'", kind.name, name))
    })?;
    let bad = || {
        SiteError::parse(
            target,
            format!("{}.{}: cannot read {} as {:?}", kind.name, name, raw, field.ty),
        )
    };

    let value = match (field.ty, raw) {
        (_, JsonValue::Null) => return Ok(None),
        (FieldType::Text, JsonValue::String(s)) => Value::Text(s.clone()),
        (FieldType::Text, JsonValue::Number(n)) => Value::Text(n.to_string()),
        (FieldType::Text, JsonValue::Bool(b)) => Value::Text(b.to_string()),
        (FieldType::Text, JsonValue::Object(_)) => {
            let locator = file_locator(raw).ok_or_else(bad)?;
            Value::Text(
                FileRef {
                    locator: locator.to_string(),
                    archived: None,
                }
                .to_string(),
            )
        }
        (FieldType::Integer, JsonValue::Number(n)) => Value::Integer(n.as_i64().ok_or_else(bad)?),
        (FieldType::Integer, JsonValue::Bool(b)) => Value::Integer(i64::from(*b)),
        (FieldType::Integer, JsonValue::String(s)) => {
            Value::Integer(s.trim().parse().map_err(|_| bad())?)
        }
        (FieldType::Real, JsonValue::Number(n)) => Value::Real(n.as_f64().ok_or_else(bad)?),
        (FieldType::Real, JsonValue::String(s)) => Value::Real(s.trim().parse().map_err(|_| bad())?),
        (FieldType::Timestamp, JsonValue::String(s)) => {
            Value::Timestamp(parse_timestamp(s).ok_or_else(bad)?)
        }
        (FieldType::Timestamp, JsonValue::Number(n)) => {
            let secs = n.as_i64().ok_or_else(bad)?;
            Value::Timestamp(Utc.timestamp_opt(secs, 0).single().ok_or_else(bad)?)
        }
        (FieldType::Blob, JsonValue::String(s)) => Value::Blob(hex::decode(s).map_err(|_| bad())?),
        _ => return Err(bad()),
    };
    Ok(Some(value))
}
