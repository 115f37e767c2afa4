//! Cache key namespace for cache-fronted records.
//!
//! Every key the protocol touches is derived from a `(TypeTag, RecordId)` pair
//! through [`RecordKey`]. The layout is textual and readable:
//!
//! ```text
//! {type}:{id}:{field}          cached numeric value (field = "" is the record key)
//! {type}:{id}::cache_version   version token
//! {type}:{id}::short           scheduling marker, short window
//! {type}:{id}::long            scheduling marker, long window
//! ```
//!
//! Components are escaped (`%` → `%25`, `:` → `%3A`) before joining, so two
//! distinct triples can never render to the same key even when a tag or id
//! contains the separator. Ordinary identifiers render unchanged.

use crate::constants::{BOUND_LOCK_PREFIX, OVERLAP_PREFIX, RECORD_LOCK_PREFIX, VERSION_SUFFIX};
use crate::identity::{RecordId, TypeTag};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

const SEPARATOR: char = ':';

/// Reconciliation window a scheduling marker belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScheduleWindow {
    /// Fast reconciliation, seconds after the first write.
    Short,
    /// Slow reconciliation, a randomized multi-hour delay after a cold read.
    Long,
}

impl ScheduleWindow {
    pub const ALL: [ScheduleWindow; 2] = [ScheduleWindow::Short, ScheduleWindow::Long];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleWindow::Short => "short",
            ScheduleWindow::Long => "long",
        }
    }
}

impl fmt::Display for ScheduleWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key derivation for one record.
///
/// The private inner struct keeps construction going through [`RecordKey::new`],
/// so a key can never be assembled from a half-specified identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    inner: RecordKeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RecordKeyInner {
    type_tag: TypeTag,
    record_id: RecordId,
}

impl RecordKey {
    pub fn new(type_tag: TypeTag, record_id: RecordId) -> Self {
        Self {
            inner: RecordKeyInner {
                type_tag,
                record_id,
            },
        }
    }

    pub fn type_tag(&self) -> &TypeTag {
        &self.inner.type_tag
    }

    pub fn record_id(&self) -> &RecordId {
        &self.inner.record_id
    }

    /// Key holding the cached value of `field`.
    pub fn field(&self, field: &str) -> String {
        cache_key(&self.inner.type_tag, &self.inner.record_id, field)
    }

    /// Record-level key (`field = ""`).
    pub fn record(&self) -> String {
        self.field("")
    }

    /// Key holding the record's version token.
    pub fn version(&self) -> String {
        version_key(&self.inner.type_tag, &self.inner.record_id)
    }

    /// Key of the scheduling marker for `window`.
    pub fn marker(&self, window: ScheduleWindow) -> String {
        format!("{}{}{}", self.record(), SEPARATOR, window.as_str())
    }

    /// Lock serialising cold population and reconciliation of the record.
    pub fn lock_name(&self) -> String {
        format!("{}{}{}", RECORD_LOCK_PREFIX, SEPARATOR, self.record())
    }

    /// Lock serialising bounded check-then-act on one field.
    pub fn bound_lock_name(&self, field: &str) -> String {
        format!("{}{}{}", BOUND_LOCK_PREFIX, SEPARATOR, self.field(field))
    }

    /// Job-level overlap guard, `model_cache|{type}|{id}`.
    pub fn overlap_key(&self) -> String {
        format!(
            "{}|{}|{}",
            OVERLAP_PREFIX,
            escape(self.inner.type_tag.as_str()),
            escape(self.inner.record_id.as_str())
        )
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.inner.type_tag, self.inner.record_id)
    }
}

/// Cache key for `(type_tag, id, field)`; `field = ""` denotes the record.
pub fn cache_key(type_tag: &TypeTag, id: &RecordId, field: &str) -> String {
    format!(
        "{}{sep}{}{sep}{}",
        escape(type_tag.as_str()),
        escape(id.as_str()),
        escape(field),
        sep = SEPARATOR
    )
}

/// Version token key: the record key followed by `:cache_version`.
pub fn version_key(type_tag: &TypeTag, id: &RecordId) -> String {
    format!("{}{}{}", cache_key(type_tag, id, ""), SEPARATOR, VERSION_SUFFIX)
}

fn escape(component: &str) -> Cow<'_, str> {
    if component.contains(['%', SEPARATOR]) {
        Cow::Owned(component.replace('%', "%25").replace(SEPARATOR, "%3A"))
    } else {
        Cow::Borrowed(component)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(tag: &str, id: &str) -> RecordKey {
        RecordKey::new(TypeTag::new(tag), RecordId::new(id))
    }

    #[test]
    fn test_key_layout() {
        let k = key("account", "7");
        assert_eq!(k.field("balance"), "account:7:balance");
        assert_eq!(k.record(), "account:7:");
        assert_eq!(k.version(), "account:7::cache_version");
        assert_eq!(k.marker(ScheduleWindow::Short), "account:7::short");
        assert_eq!(k.marker(ScheduleWindow::Long), "account:7::long");
        assert_eq!(k.lock_name(), "save_model_lock:account:7:");
        assert_eq!(k.overlap_key(), "model_cache|account|7");
    }

    #[test]
    fn test_version_key_matches_free_function() {
        let k = key("account", "7");
        assert_eq!(
            k.version(),
            version_key(&TypeTag::new("account"), &RecordId::new("7"))
        );
    }

    #[test]
    fn test_separator_in_components_is_escaped() {
        let a = cache_key(&TypeTag::new("a:b"), &RecordId::new("c"), "f");
        let b = cache_key(&TypeTag::new("a"), &RecordId::new("b:c"), "f");
        assert_ne!(a, b);
        assert_eq!(a, "a%3Ab:c:f");
    }

    #[test]
    fn test_marker_cannot_collide_with_field() {
        let k = key("account", "7");
        assert_ne!(k.marker(ScheduleWindow::Short), k.field(":short"));
        assert_ne!(k.version(), k.field(":cache_version"));
    }

    proptest! {
        #[test]
        fn prop_distinct_triples_give_distinct_keys(
            a in ("[a-z:%]{1,6}", "[0-9a-z:%]{1,6}", "[a-z:%]{0,6}"),
            b in ("[a-z:%]{1,6}", "[0-9a-z:%]{1,6}", "[a-z:%]{0,6}"),
        ) {
            let ka = cache_key(&TypeTag::new(a.0.clone()), &RecordId::new(a.1.clone()), &a.2);
            let kb = cache_key(&TypeTag::new(b.0.clone()), &RecordId::new(b.1.clone()), &b.2);
            prop_assert_eq!(ka == kb, a == b);
        }

        #[test]
        fn prop_key_derivation_is_deterministic(tag in "[a-z_]{1,12}", id in 0i64..1_000_000, field in "[a-z_]{0,12}") {
            let first = cache_key(&TypeTag::new(tag.clone()), &RecordId::from(id), &field);
            let second = cache_key(&TypeTag::new(tag), &RecordId::from(id), &field);
            prop_assert_eq!(first, second);
        }
    }
}
