//! Field values and the per-type field registry.
//!
//! The registry replaces attribute interception: each cache-fronted record
//! type declares which of its fields are numeric and which are routed through
//! the cache. Hooks and the flush worker consult it instead of guessing from
//! runtime values.

use crate::identity::TypeTag;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Name of the identity field when a schema does not override it.
pub const DEFAULT_IDENTITY_FIELD: &str = "id";

/// A single field value as the backing store exposes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Decimal(f64),
    Text(String),
}

impl FieldValue {
    /// Numeric view of the value. Text is accepted when it parses as a
    /// number, matching how stores commonly return decimal columns.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Decimal(v) => Some(*v),
            FieldValue::Text(s) => s.trim().parse::<f64>().ok(),
            FieldValue::Null | FieldValue::Bool(_) => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.as_f64().is_some()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Build the value to stage for a reconciled scaled integer, keeping
    /// integer columns integral when the value has no fractional part.
    pub fn from_scaled_like(scaled: i64, like: &FieldValue) -> FieldValue {
        let factor = crate::scale::SCALE_FACTOR;
        match like {
            FieldValue::Integer(_) if scaled % factor == 0 => FieldValue::Integer(scaled / factor),
            _ => FieldValue::Decimal(crate::scale::descale(scaled)),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Decimal(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

/// Metadata for one field of a record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub numeric: bool,
    pub cached: bool,
}

impl FieldSpec {
    /// Numeric field routed through the cache.
    pub fn cached_numeric() -> Self {
        Self {
            numeric: true,
            cached: true,
        }
    }

    /// Numeric field always read from the record.
    pub fn plain_numeric() -> Self {
        Self {
            numeric: true,
            cached: false,
        }
    }

    /// Non-numeric field; never cached.
    pub fn opaque() -> Self {
        Self {
            numeric: false,
            cached: false,
        }
    }

    pub fn is_cached_numeric(&self) -> bool {
        self.numeric && self.cached
    }
}

/// Field layout of one record type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeSchema {
    identity_field: String,
    fields: BTreeMap<String, FieldSpec>,
}

impl TypeSchema {
    pub fn new() -> Self {
        Self {
            identity_field: DEFAULT_IDENTITY_FIELD.to_string(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_identity(mut self, field: impl Into<String>) -> Self {
        self.identity_field = field.into();
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    /// Shorthand for a cached numeric field.
    pub fn cached(self, name: impl Into<String>) -> Self {
        self.with_field(name, FieldSpec::cached_numeric())
    }

    pub fn identity_field(&self) -> &str {
        &self.identity_field
    }

    pub fn is_identity(&self, field: &str) -> bool {
        self.identity_field == field
    }

    pub fn spec(&self, field: &str) -> Option<FieldSpec> {
        self.fields.get(field).copied()
    }

    /// Whether `field` is routed through the cache. The identity field never is.
    pub fn is_cached(&self, field: &str) -> bool {
        !self.is_identity(field)
            && self
                .spec(field)
                .map(|s| s.is_cached_numeric())
                .unwrap_or(false)
    }

    /// Names of every cached numeric field, in stable order.
    pub fn cached_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|(name, spec)| spec.is_cached_numeric() && !self.is_identity(name))
            .map(|(name, _)| name.as_str())
    }
}

impl Default for TypeSchema {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of cache-fronted record types.
///
/// Built once at wiring time and shared read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct FieldRegistry {
    types: HashMap<TypeTag, TypeSchema>,
}

impl FieldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type. Idempotent: registering the same schema twice is a
    /// no-op and returns `false`; a differing schema replaces the old one.
    pub fn register(&mut self, type_tag: TypeTag, schema: TypeSchema) -> bool {
        match self.types.get(&type_tag) {
            Some(existing) if *existing == schema => false,
            _ => {
                self.types.insert(type_tag, schema);
                true
            }
        }
    }

    pub fn schema(&self, type_tag: &TypeTag) -> Option<&TypeSchema> {
        self.types.get(type_tag)
    }

    /// Identity field for `type_tag`, falling back to `"id"`.
    pub fn identity_field(&self, type_tag: &TypeTag) -> &str {
        self.schema(type_tag)
            .map(|s| s.identity_field())
            .unwrap_or(DEFAULT_IDENTITY_FIELD)
    }

    /// Whether `field` of `type_tag` is routed through the cache.
    ///
    /// Unregistered types treat every non-identity field as cacheable; the
    /// caller still checks the value is numeric.
    pub fn is_cached(&self, type_tag: &TypeTag, field: &str) -> bool {
        match self.schema(type_tag) {
            Some(schema) => schema.is_cached(field),
            None => field != DEFAULT_IDENTITY_FIELD,
        }
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
