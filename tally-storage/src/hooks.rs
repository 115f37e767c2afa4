//! Hooks exposed to the backing store's own read and save paths.
//!
//! Code that reads records straight from the store (not through a proxy)
//! would otherwise see values that lag the cache by up to a flush window.
//! `read_field` closes that gap for cache-fronted records; `refresh_on_save`
//! keeps the cache in step when something saves a record natively.

use tally_core::{
    cache_key, descale, new_version_token, scale, FieldRegistry, FieldValue, RecordId,
    RecordKey, ScheduleWindow, TallyResult, TypeTag,
};

use crate::cache::{CacheStore, CacheStoreExt, CacheValue};
use crate::store::Record;

/// Read-only lookup of a cached field value, descaled.
///
/// `None` when nothing is cached. Never locks and never populates.
pub async fn read_cached_field(
    cache: &dyn CacheStore,
    type_tag: &TypeTag,
    id: &RecordId,
    field: &str,
) -> TallyResult<Option<f64>> {
    Ok(cache
        .get_counter(&cache_key(type_tag, id, field))
        .await?
        .map(descale))
}

/// Whether a flush is pending for the record in either window.
pub async fn is_cache_fronted(cache: &dyn CacheStore, key: &RecordKey) -> TallyResult<bool> {
    for window in ScheduleWindow::ALL {
        if cache.has(&key.marker(window)).await? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Field-read hook.
///
/// Returns the cache-resident value when the record has a pending flush and
/// the field is a cached numeric field; otherwise the record's own value.
pub async fn read_field<R: Record>(
    cache: &dyn CacheStore,
    registry: &FieldRegistry,
    type_tag: &TypeTag,
    record: &R,
    field: &str,
) -> TallyResult<FieldValue> {
    let raw = record.get(field)?;
    if !registry.is_cached(type_tag, field) || !raw.is_numeric() {
        return Ok(raw);
    }

    let key = RecordKey::new(type_tag.clone(), record.id());
    if !is_cache_fronted(cache, &key).await? {
        return Ok(raw);
    }

    match cache.get_counter(&key.field(field)).await? {
        Some(scaled) => Ok(FieldValue::from_scaled_like(scaled, &raw)),
        None => Ok(raw),
    }
}

/// Native-save hook, called after the store saved `record`.
///
/// Live cache entries among `saved_fields` are overwritten with the saved
/// values, then the version token is bumped so proxies holding an older
/// token reload before their next population. Caller holds the record lock.
pub async fn refresh_on_save<R: Record>(
    cache: &dyn CacheStore,
    registry: &FieldRegistry,
    type_tag: &TypeTag,
    record: &R,
    saved_fields: &[String],
) -> TallyResult<usize> {
    let key = RecordKey::new(type_tag.clone(), record.id());
    let mut refreshed = 0usize;

    for field in saved_fields {
        if !registry.is_cached(type_tag, field) {
            continue;
        }
        let Some(value) = record.get(field)?.as_f64() else {
            continue;
        };
        let field_key = key.field(field);
        if cache.has(&field_key).await? {
            cache
                .put(&field_key, CacheValue::Counter(scale(value)), None)
                .await?;
            refreshed += 1;
        }
    }

    cache
        .put(&key.version(), CacheValue::Text(new_version_token()), None)
        .await?;

    tracing::debug!(
        type_tag = %type_tag,
        record_id = %key.record_id(),
        refreshed,
        "Native save refreshed cache"
    );
    Ok(refreshed)
}
