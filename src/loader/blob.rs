// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

//! Blob backend: decodes the raw GTFS-RT payload held in the feed cache
//! and indexes only the entities relevant to the requesting station.

use super::{
    FreshnessVerdict, LoadedAlerts, LoadedTripUpdates, RtLoadRequest, RtSource, disabled_result,
    evaluate_freshness, missing_cache_result,
};
use crate::config::BoardConfig;
use crate::feed_cache::{DecodedFeedCache, FeedCacheError, FeedIdentityToken};
use crate::models::{CacheStatus, FreshnessReason, FreshnessResult};
use crate::rt_index::{BoardTripScheduleRelationship, BoardTripUpdate, TripUpdateIndex};
use crate::store::{CacheStore, StoreError};
use crate::{expand_stop_id_scope, stop_id_root};
use ahash::AHashSet;
use std::time::Instant;

pub async fn load_trip_updates_from_blob<S: CacheStore>(
    store: &S,
    feed_cache: &DecodedFeedCache,
    request: &RtLoadRequest,
    config: &BoardConfig,
) -> Result<LoadedTripUpdates, StoreError> {
    if !request.enabled || !config.rt_enabled {
        return Ok(disabled_result(RtSource::Blob));
    }

    let meta = match store.get_cache_meta(&request.feed_key).await? {
        Some(meta) if meta.payload_bytes > 0 => meta,
        _ => return Ok(missing_cache_result(RtSource::Blob)),
    };

    let payload_sha = match &meta.etag {
        Some(_) => None,
        None => store.get_payload_sha(&request.feed_key).await?,
    };
    let token = FeedIdentityToken::from_meta(&meta, payload_sha.as_deref());

    let hit = match feed_cache
        .fetch_or_join(store, &request.feed_key, &token)
        .await
    {
        Ok(hit) => hit,
        Err(FeedCacheError::Store(err)) => return Err(err),
        Err(FeedCacheError::PayloadMissing) => {
            return Ok(missing_cache_result(RtSource::Blob));
        }
        Err(FeedCacheError::Decode(message)) => {
            tracing::warn!(feed_key = %request.feed_key, %message, "realtime payload undecodable");
            return Ok(LoadedTripUpdates {
                index: TripUpdateIndex::new(),
                freshness: FreshnessResult::not_applied(
                    FreshnessReason::DecodeFailed,
                    CacheStatus::Error,
                ),
                rt_source: RtSource::Blob,
                read_source: None,
                payload_fetch_count: 0,
                decode_ms: 0,
            });
        }
    };

    let (age_ms, age_source) =
        match evaluate_freshness(store, &request.feed_key, &meta, request.now, config).await? {
            FreshnessVerdict::Fresh { age_ms, source } => (age_ms, source),
            FreshnessVerdict::Stale { age_ms } => {
                return Ok(LoadedTripUpdates {
                    index: TripUpdateIndex::new(),
                    freshness: FreshnessResult {
                        reason: FreshnessReason::StaleCache,
                        applied: false,
                        cache_status: CacheStatus::Stale,
                        age_ms: Some(age_ms),
                        freshness_age_source: None,
                    },
                    rt_source: RtSource::Blob,
                    read_source: Some(hit.read_source),
                    payload_fetch_count: hit.payload_fetch_count,
                    decode_ms: hit.entry.decode_ms,
                });
            }
        };

    let expanded_scope = expand_stop_id_scope(request.scope_stop_ids.iter());
    let mut index = TripUpdateIndex::new();

    // The scan guard starts only once the decoded payload is in hand, so
    // slow storage cannot eat the processing allowance.
    let scan_started = Instant::now();
    let mut scanned = 0usize;

    for entity in &hit.entry.feed.entity {
        scanned += 1;
        if scanned > config.max_scanned_entities
            || scan_started.elapsed().as_millis() as u64 > config.max_process_ms
        {
            tracing::warn!(
                feed_key = %request.feed_key,
                scanned,
                "entity scan guard tripped, discarding partial index"
            );
            return Ok(LoadedTripUpdates {
                index: TripUpdateIndex::new(),
                freshness: FreshnessResult {
                    reason: FreshnessReason::GuardTripped,
                    applied: false,
                    cache_status: CacheStatus::Fresh,
                    age_ms: Some(age_ms),
                    freshness_age_source: Some(age_source),
                },
                rt_source: RtSource::Blob,
                read_source: Some(hit.read_source),
                payload_fetch_count: hit.payload_fetch_count,
                decode_ms: hit.entry.decode_ms,
            });
        }

        let Some(trip_update) = &entity.trip_update else {
            continue;
        };

        if !entity_in_scope(trip_update, &request.scope_trip_ids, &expanded_scope) {
            continue;
        }

        let normalized = BoardTripUpdate::from(trip_update);
        if normalized.schedule_relationship == Some(BoardTripScheduleRelationship::Added) {
            index.add_added_trip(&normalized);
        } else {
            index.add_trip_update(&normalized, request.default_service_date, request.window);
        }
    }

    Ok(LoadedTripUpdates {
        index,
        freshness: FreshnessResult::applied(age_ms, age_source),
        rt_source: RtSource::Blob,
        read_source: Some(hit.read_source),
        payload_fetch_count: hit.payload_fetch_count,
        decode_ms: hit.entry.decode_ms,
    })
}

/// An entity is relevant when its trip is already on the scheduled board
/// or when any of its stop updates touches the station, matched through
/// platform-variant expansion in both directions.
fn entity_in_scope(
    trip_update: &gtfs_realtime::TripUpdate,
    scope_trip_ids: &AHashSet<compact_str::CompactString>,
    expanded_scope: &AHashSet<String>,
) -> bool {
    if let Some(trip_id) = &trip_update.trip.trip_id {
        if scope_trip_ids.contains(trip_id.as_str()) {
            return true;
        }
    }

    trip_update.stop_time_update.iter().any(|stu| {
        stu.stop_id.as_deref().is_some_and(|stop_id| {
            expanded_scope.contains(stop_id) || expanded_scope.contains(stop_id_root(stop_id))
        })
    })
}

/// Loads currently-active service alerts from a raw alerts payload,
/// through the same freshness gate as trip updates. A missing, stale or
/// undecodable alerts cache yields an empty list with the matching
/// reason; `no_alerts` is reserved for a fresh feed with nothing active.
pub async fn load_alerts_from_blob<S: CacheStore>(
    store: &S,
    feed_cache: &DecodedFeedCache,
    feed_key: &str,
    now: chrono::DateTime<chrono::Utc>,
    config: &BoardConfig,
) -> Result<LoadedAlerts, StoreError> {
    let meta = match store.get_cache_meta(feed_key).await? {
        Some(meta) if meta.payload_bytes > 0 => meta,
        _ => {
            return Ok(LoadedAlerts::unavailable(
                FreshnessReason::MissingCache,
                CacheStatus::Miss,
            ));
        }
    };

    let payload_sha = match &meta.etag {
        Some(_) => None,
        None => store.get_payload_sha(feed_key).await?,
    };
    let token = FeedIdentityToken::from_meta(&meta, payload_sha.as_deref());

    let hit = match feed_cache.fetch_or_join(store, feed_key, &token).await {
        Ok(hit) => hit,
        Err(FeedCacheError::Store(err)) => return Err(err),
        Err(FeedCacheError::PayloadMissing) => {
            return Ok(LoadedAlerts::unavailable(
                FreshnessReason::MissingCache,
                CacheStatus::Miss,
            ));
        }
        Err(FeedCacheError::Decode(message)) => {
            tracing::warn!(feed_key, %message, "alerts payload undecodable");
            return Ok(LoadedAlerts::unavailable(
                FreshnessReason::DecodeFailed,
                CacheStatus::Error,
            ));
        }
    };

    let (age_ms, age_source) =
        match evaluate_freshness(store, feed_key, &meta, now, config).await? {
            FreshnessVerdict::Fresh { age_ms, source } => (age_ms, source),
            FreshnessVerdict::Stale { age_ms } => return Ok(LoadedAlerts::stale(age_ms)),
        };

    let now_epoch = now.timestamp().max(0) as u64;
    let alerts = hit
        .entry
        .feed
        .entity
        .iter()
        .filter_map(|entity| {
            entity
                .alert
                .as_ref()
                .map(|alert| crate::rt_index::BoardAlert::from_feed(&entity.id, alert))
        })
        .filter(|alert| alert.is_active(now_epoch))
        .collect();

    Ok(LoadedAlerts::fresh(alerts, age_ms, age_source))
}
