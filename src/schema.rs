//! Entity schema declarations.
//!
//! A site type declares an [`EntitySchema`]: a set of [`EntityKind`]s, each
//! an ordered list of typed [`Field`]s, a dedup key, and relations to child
//! kinds. Relations must form a forest: every kind has at most one parent
//! and no kind is its own ancestor.
//!
//! Schemas are plain data (serde) so they can be declared in TOML, persisted
//! alongside each schema version, and diffed by the
//! [`migrate`](crate::migrate) module.
//!
//! ```rust
//! use site_archive::schema::{EntityKind, EntitySchema, Field};
//!
//! let schema = EntitySchema::new()
//!     .kind(
//!         EntityKind::new("listing")
//!             .field(Field::text("id").required())
//!             .field(Field::text("title"))
//!             .dedup_key(["id"])
//!             .relation("bids", "bid"),
//!     )
//!     .kind(
//!         EntityKind::new("bid")
//!             .field(Field::text("listing_id").required())
//!             .field(Field::real("amount").required())
//!             .dedup_key(["listing_id", "amount"]),
//!     );
//! schema.validate().unwrap();
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::models::Value;

/// Scalar storage type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Integer,
    Real,
    Timestamp,
    Blob,
}

impl FieldType {
    /// SQLite column type used for this field.
    pub fn sql_type(self) -> &'static str {
        match self {
            FieldType::Text | FieldType::Timestamp => "TEXT",
            FieldType::Integer => "INTEGER",
            FieldType::Real => "REAL",
            FieldType::Blob => "BLOB",
        }
    }

    /// True when values of `self` convert to `to` without loss.
    ///
    /// Integer to real holds for magnitudes up to 2^53; the migration that
    /// applies it fails if a stored integer is larger.
    pub fn widens_to(self, to: FieldType) -> bool {
        matches!(
            (self, to),
            (FieldType::Integer, FieldType::Real)
                | (FieldType::Integer, FieldType::Text)
                | (FieldType::Real, FieldType::Text)
                | (FieldType::Timestamp, FieldType::Text)
        )
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Real => "real",
            FieldType::Timestamp => "timestamp",
            FieldType::Blob => "blob",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Value used for rows persisted before this field existed, and for
    /// candidates that omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: false,
            default: None,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Text)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Integer)
    }

    pub fn real(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Real)
    }

    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Timestamp)
    }

    pub fn blob(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Blob)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// Named parent → child relation ("listing has many bids").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityKind {
    pub name: String,
    pub fields: Vec<Field>,
    pub dedup_key: Vec<String>,
    #[serde(default)]
    pub relations: Vec<Relation>,
    /// Always walk child targets, even when the entity is an unchanged
    /// duplicate (listing pages whose children grow over time).
    #[serde(default)]
    pub redescend: bool,
}

impl EntityKind {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            dedup_key: Vec::new(),
            relations: Vec::new(),
            redescend: false,
        }
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn dedup_key<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dedup_key = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn relation(mut self, name: impl Into<String>, kind: impl Into<String>) -> Self {
        self.relations.push(Relation {
            name: name.into(),
            kind: kind.into(),
        });
        self
    }

    pub fn redescend(mut self) -> Self {
        self.redescend = true;
        self
    }

    pub fn get_field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn get_relation(&self, name: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntitySchema {
    pub kinds: Vec<EntityKind>,
}

impl EntitySchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: EntityKind) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn get(&self, name: &str) -> Option<&EntityKind> {
        self.kinds.iter().find(|k| k.name == name)
    }

    /// The kind and relation that own `kind` as a child, if any.
    pub fn parent_of(&self, kind: &str) -> Option<(&EntityKind, &Relation)> {
        self.kinds.iter().find_map(|k| {
            k.relations
                .iter()
                .find(|r| r.kind == kind)
                .map(|r| (k, r))
        })
    }

    /// Kinds that are not the child of any relation.
    pub fn root_kinds(&self) -> impl Iterator<Item = &EntityKind> {
        self.kinds
            .iter()
            .filter(move |k| self.parent_of(&k.name).is_none())
    }

    /// Check structural invariants: valid identifiers, unique names, dedup
    /// keys over required fields, relation targets that exist, and a
    /// cycle-free forest of relations.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.kinds.is_empty() {
            return Err(invalid("schema declares no entity kinds"));
        }

        let mut kind_names = HashSet::new();
        for kind in &self.kinds {
            check_identifier(&kind.name, "kind")?;
            if !kind_names.insert(kind.name.as_str()) {
                return Err(invalid(format!("duplicate kind '{}'", kind.name)));
            }

            let mut field_names = HashSet::new();
            for field in &kind.fields {
                check_identifier(&field.name, "field")?;
                if !field_names.insert(field.name.as_str()) {
                    return Err(invalid(format!(
                        "duplicate field '{}.{}'",
                        kind.name, field.name
                    )));
                }
                if let Some(default) = &field.default {
                    if default.field_type() != field.ty {
                        return Err(invalid(format!(
                            "default for '{}.{}' is {} but the field is {}",
                            kind.name,
                            field.name,
                            default.field_type(),
                            field.ty
                        )));
                    }
                }
            }

            if kind.dedup_key.is_empty() {
                return Err(invalid(format!("kind '{}' has no dedup key", kind.name)));
            }
            for key in &kind.dedup_key {
                match kind.get_field(key) {
                    None => {
                        return Err(invalid(format!(
                            "dedup key '{}' of kind '{}' is not a declared field",
                            key, kind.name
                        )))
                    }
                    Some(f) if !f.required => {
                        return Err(invalid(format!(
                            "dedup key field '{}.{}' must be required",
                            kind.name, key
                        )))
                    }
                    Some(_) => {}
                }
            }

            let mut relation_names = HashSet::new();
            for rel in &kind.relations {
                check_identifier(&rel.name, "relation")?;
                if !relation_names.insert(rel.name.as_str()) {
                    return Err(invalid(format!(
                        "duplicate relation '{}.{}'",
                        kind.name, rel.name
                    )));
                }
            }
        }

        // Every child kind exists and has exactly one parent.
        let mut parent: HashMap<&str, &str> = HashMap::new();
        for kind in &self.kinds {
            for rel in &kind.relations {
                if !kind_names.contains(rel.kind.as_str()) {
                    return Err(invalid(format!(
                        "relation '{}.{}' targets unknown kind '{}'",
                        kind.name, rel.name, rel.kind
                    )));
                }
                if let Some(prev) = parent.insert(rel.kind.as_str(), kind.name.as_str()) {
                    return Err(invalid(format!(
                        "kind '{}' has two parents ('{}' and '{}')",
                        rel.kind, prev, kind.name
                    )));
                }
            }
        }

        for kind in &self.kinds {
            let mut seen = HashSet::new();
            let mut cur = kind.name.as_str();
            while let Some(&p) = parent.get(cur) {
                if p == kind.name || !seen.insert(p) {
                    return Err(invalid(format!(
                        "relation cycle through kind '{}'",
                        kind.name
                    )));
                }
                cur = p;
            }
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> IngestError {
    IngestError::InvalidSchema(msg.into())
}

/// Names become SQL identifiers, so only `[a-z][a-z0-9_]*` is accepted. A
/// leading underscore is reserved for internal columns and `__` separates
/// the site from the kind in table names.
pub fn check_identifier(name: &str, what: &str) -> Result<(), IngestError> {
    let mut chars = name.chars();
    let ok = match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {
            chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
                && !name.contains("__")
        }
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(invalid(format!(
            "{} name '{}' must match [a-z][a-z0-9_]* without '__'",
            what, name
        )))
    }
}
