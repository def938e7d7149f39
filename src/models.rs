//! Core data models that flow through the ingestion pipeline.
//!
//! Site types produce [`EntityTree`]s (a candidate [`Entity`] plus inline
//! children parsed from the same content). The sync engine normalizes and
//! commits them; the [`mapper`](crate::mapper) converts between entities and
//! [`StorageRow`]s.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::IngestError;
use crate::schema::{EntityKind, FieldType};

/// A typed scalar field value. Absent fields are stored as SQL `NULL`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    Text(String),
    Integer(i64),
    Real(f64),
    Timestamp(DateTime<Utc>),
    Blob(Vec<u8>),
}

impl Value {
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Text(_) => FieldType::Text,
            Value::Integer(_) => FieldType::Integer,
            Value::Real(_) => FieldType::Real,
            Value::Timestamp(_) => FieldType::Timestamp,
            Value::Blob(_) => FieldType::Blob,
        }
    }

    /// Convert this value to `ty` if that is a lossless widening (or the
    /// identity). Returns `None` otherwise, including for integers too large
    /// for an `f64` to hold exactly.
    pub fn widen(&self, ty: FieldType) -> Option<Value> {
        if self.field_type() == ty {
            return Some(self.clone());
        }
        match (self, ty) {
            (Value::Integer(n), FieldType::Real) if n.unsigned_abs() <= MAX_EXACT_REAL_INT => {
                Some(Value::Real(*n as f64))
            }
            (Value::Integer(n), FieldType::Text) => Some(Value::Text(n.to_string())),
            (Value::Real(r), FieldType::Text) => Some(Value::Text(r.to_string())),
            (Value::Timestamp(ts), FieldType::Text) => Some(Value::Text(format_timestamp(ts))),
            _ => None,
        }
    }

    /// Text form used in dedup keys.
    ///
    /// Carries no type tag, and every lossless widening preserves it:
    /// `v.widen(ty)` has the same key text as `v`. Keys stored before a
    /// widening migration therefore still match new candidates.
    pub fn key_text(&self) -> String {
        match self {
            Value::Text(s) => s.clone(),
            Value::Integer(n) => n.to_string(),
            Value::Real(r) => r.to_string(),
            Value::Timestamp(ts) => format_timestamp(ts),
            Value::Blob(b) => hex::encode(b),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => f.write_str(s),
            Value::Integer(n) => write!(f, "{}", n),
            Value::Real(r) => write!(f, "{}", r),
            Value::Timestamp(ts) => f.write_str(&format_timestamp(ts)),
            Value::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<f64> for Value {
    fn from(r: f64) -> Self {
        Value::Real(r)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Value::Timestamp(ts)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Blob(b)
    }
}

/// Largest integer magnitude an `f64` represents exactly (2^53).
pub const MAX_EXACT_REAL_INT: u64 = 1 << 53;

/// RFC 3339 with as many fractional digits as needed, so it round-trips.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Storage-assigned surrogate identity of a persisted entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub i64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

const KEY_SEPARATOR: char = '\u{1f}';

/// Content-derived identifier of a record within its kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DedupKey(pub String);

impl DedupKey {
    /// Derive the key from the kind's declared dedup key fields.
    ///
    /// A single-field key is kept readable (its [`Value::key_text`]; hex for
    /// blobs). Composite keys join the escaped key texts and digest them
    /// with SHA-256.
    pub fn derive(kind: &EntityKind, entity: &Entity) -> Result<Self, IngestError> {
        let mut values = Vec::with_capacity(kind.dedup_key.len());
        for name in &kind.dedup_key {
            let value = entity.fields.get(name).ok_or_else(|| {
                IngestError::InvalidEntity(format!(
                    "{}: dedup key field '{}' is missing",
                    kind.name, name
                ))
            })?;
            values.push(value);
        }

        if let [single] = values.as_slice() {
            return Ok(DedupKey(single.key_text()));
        }

        let mut canonical = String::new();
        for (i, value) in values.iter().enumerate() {
            if i > 0 {
                canonical.push(KEY_SEPARATOR);
            }
            for c in value.key_text().chars() {
                if c == KEY_SEPARATOR || c == '\\' {
                    canonical.push('\\');
                }
                canonical.push(c);
            }
        }
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(DedupKey(hex::encode(digest)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DedupKey {
    fn from(s: &str) -> Self {
        DedupKey(s.to_string())
    }
}

/// One record instance: its kind, typed field values, parent link and
/// (once persisted) surrogate identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub kind: String,
    pub id: Option<EntityId>,
    pub parent: Option<EntityId>,
    pub fields: BTreeMap<String, Value>,
}

impl Entity {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            parent: None,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// A candidate entity with the inline children parsed alongside it.
///
/// The whole tree is committed in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityTree {
    pub entity: Entity,
    pub children: Vec<EntityTree>,
}

impl EntityTree {
    pub fn leaf(entity: Entity) -> Self {
        Self {
            entity,
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: impl Into<EntityTree>) -> Self {
        self.children.push(child.into());
        self
    }
}

impl From<Entity> for EntityTree {
    fn from(entity: Entity) -> Self {
        EntityTree::leaf(entity)
    }
}

/// Generic storage representation of one entity row.
///
/// `values` lists every declared field of the kind in declaration order;
/// `None` maps to SQL `NULL`.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageRow {
    pub kind: String,
    pub id: Option<EntityId>,
    pub parent_id: Option<EntityId>,
    pub dedup_key: DedupKey,
    pub complete: bool,
    pub values: Vec<(String, Option<Value>)>,
}

impl StorageRow {
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field;
    use chrono::TimeZone;

    fn listing_kind() -> EntityKind {
        EntityKind::new("listing")
            .field(Field::text("id").required())
            .field(Field::text("title"))
            .dedup_key(["id"])
    }

    #[test]
    fn single_field_key_is_readable() {
        let e = Entity::new("listing").with("id", "L1").with("title", "Chair");
        let key = DedupKey::derive(&listing_kind(), &e).unwrap();
        assert_eq!(key.as_str(), "L1");
    }

    #[test]
    fn composite_key_is_stable_digest() {
        let kind = EntityKind::new("bid")
            .field(Field::text("listing_id").required())
            .field(Field::real("amount").required())
            .dedup_key(["listing_id", "amount"]);
        let a = Entity::new("bid").with("listing_id", "L1").with("amount", 10.0);
        let b = Entity::new("bid").with("amount", 10.0).with("listing_id", "L1");
        let c = Entity::new("bid").with("listing_id", "L1").with("amount", 12.5);

        let ka = DedupKey::derive(&kind, &a).unwrap();
        assert_eq!(ka, DedupKey::derive(&kind, &b).unwrap());
        assert_ne!(ka, DedupKey::derive(&kind, &c).unwrap());
        assert_eq!(ka.as_str().len(), 64);
    }

    #[test]
    fn missing_key_field_is_rejected() {
        let e = Entity::new("listing").with("title", "Chair");
        let err = DedupKey::derive(&listing_kind(), &e).unwrap_err();
        assert!(err.to_string().contains("dedup key field 'id'"));
    }

    #[test]
    fn widening_rules() {
        assert_eq!(
            Value::Integer(3).widen(FieldType::Real),
            Some(Value::Real(3.0))
        );
        assert_eq!(
            Value::Real(2.5).widen(FieldType::Text),
            Some(Value::Text("2.5".into()))
        );
        assert_eq!(Value::Real(2.5).widen(FieldType::Integer), None);
        assert_eq!(Value::Text("x".into()).widen(FieldType::Blob), None);

        let exact = MAX_EXACT_REAL_INT as i64;
        assert_eq!(
            Value::Integer(-exact).widen(FieldType::Real),
            Some(Value::Real(-(exact as f64)))
        );
        assert_eq!(Value::Integer(exact + 1).widen(FieldType::Real), None);
    }

    #[test]
    fn blob_key_is_hex_of_the_content() {
        let kind = EntityKind::new("image")
            .field(Field::blob("data").required())
            .dedup_key(["data"]);
        let a = Entity::new("image").with("data", vec![1u8, 2, 3, 4]);
        let b = Entity::new("image").with("data", vec![9u8, 9, 9, 9]);

        let ka = DedupKey::derive(&kind, &a).unwrap();
        assert_eq!(ka.as_str(), "01020304");
        assert_ne!(ka, DedupKey::derive(&kind, &b).unwrap());
    }

    #[test]
    fn widened_key_fields_keep_their_key() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        for (value, ty) in [
            (Value::Integer(42), FieldType::Real),
            (Value::Integer(-7), FieldType::Text),
            (Value::Real(10.0), FieldType::Text),
            (Value::Real(0.1), FieldType::Text),
            (Value::Timestamp(ts), FieldType::Text),
        ] {
            let widened = value.widen(ty).unwrap();
            assert_eq!(widened.key_text(), value.key_text(), "{:?} -> {}", value, ty);
        }
    }

    #[test]
    fn composite_key_escapes_the_separator() {
        let kind = EntityKind::new("pair")
            .field(Field::text("a").required())
            .field(Field::text("b").required())
            .dedup_key(["a", "b"]);
        let x = Entity::new("pair").with("a", "p\u{1f}").with("b", "q");
        let y = Entity::new("pair").with("a", "p").with("b", "\u{1f}q");
        assert_ne!(
            DedupKey::derive(&kind, &x).unwrap(),
            DedupKey::derive(&kind, &y).unwrap()
        );
    }

    #[test]
    fn timestamp_text_round_trips() {
        let ts = Utc::now();
        assert_eq!(parse_timestamp(&format_timestamp(&ts)), Some(ts));
    }
}
