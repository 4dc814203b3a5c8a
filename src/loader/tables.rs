// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

//! Parsed-table backend: reads stop-time update rows a poller has already
//! flattened into Postgres, never the payload blob. The rows are regrouped
//! into canonical trip updates and fed through the same index builder as
//! the blob backend, so both backends agree on any equivalent feed.

use super::{
    FreshnessVerdict, LoadedAlerts, LoadedTripUpdates, RtLoadRequest, RtSource, disabled_result,
    evaluate_freshness, missing_cache_result,
};
use crate::config::BoardConfig;
use crate::expand_stop_id_scope;
use crate::feed_cache::ReadSource;
use crate::models::{CacheStatus, FreshnessReason, FreshnessResult};
use crate::rt_index::{
    BoardAlert, BoardEntitySelector, BoardStopTimeEvent, BoardStopTimeUpdate, BoardTimeRange,
    BoardTripScheduleRelationship, BoardTripUpdate, TripUpdateIndex,
    option_i32_to_stop_time_schedule_relationship, option_i32_to_trip_schedule_relationship,
};
use crate::store::{CacheStore, RtAlertRow, RtStopTimeRow, StoreError};
use chrono::Duration;
use chrono::NaiveDate;
use compact_str::CompactString;
use ecow::EcoString;
use itertools::Itertools;
use std::time::Instant;

pub async fn load_trip_updates_from_tables<S: CacheStore>(
    store: &S,
    request: &RtLoadRequest,
    config: &BoardConfig,
) -> Result<LoadedTripUpdates, StoreError> {
    if !request.enabled || !config.rt_enabled {
        return Ok(disabled_result(RtSource::Parsed));
    }

    let meta = match store.get_cache_meta(&request.feed_key).await? {
        Some(meta) => meta,
        None => return Ok(missing_cache_result(RtSource::Parsed)),
    };

    let expanded_scope: Vec<String> = expand_stop_id_scope(request.scope_stop_ids.iter())
        .into_iter()
        .collect();
    let updated_since = request.now - Duration::seconds(config.parsed_lookback_sec);

    let rows = match store
        .query_trip_update_rows(&request.feed_key, &expanded_scope, updated_since)
        .await
    {
        Ok(rows) => rows,
        Err(StoreError::RelationMissing(relation)) => {
            tracing::warn!(feed_key = %request.feed_key, %relation, "parsed tables absent");
            return Ok(LoadedTripUpdates {
                index: TripUpdateIndex::new(),
                freshness: FreshnessResult::not_applied(
                    FreshnessReason::ParsedUnavailable,
                    CacheStatus::Error,
                ),
                rt_source: RtSource::Parsed,
                read_source: None,
                payload_fetch_count: 0,
                decode_ms: 0,
            });
        }
        Err(err) => return Err(err),
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
                    rt_source: RtSource::Parsed,
                    read_source: None,
                    payload_fetch_count: 0,
                    decode_ms: 0,
                });
            }
        };

    let build_started = Instant::now();
    let mut index = TripUpdateIndex::new();

    let grouped = rows
        .iter()
        .map(|row| {
            (
                (CompactString::from(row.trip_id.as_str()), row.service_date),
                row,
            )
        })
        .into_group_map();

    for ((trip_id, service_date), trip_rows) in grouped {
        if build_started.elapsed().as_millis() as u64 > config.max_process_ms {
            tracing::warn!(
                feed_key = %request.feed_key,
                "row regrouping guard tripped, discarding partial index"
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
                rt_source: RtSource::Parsed,
                read_source: Some(ReadSource::Table),
                payload_fetch_count: 0,
                decode_ms: 0,
            });
        }

        let normalized = regroup_trip(&trip_id, service_date, &trip_rows);
        if normalized.schedule_relationship == Some(BoardTripScheduleRelationship::Added) {
            index.add_added_trip(&normalized);
        } else {
            index.add_trip_update(&normalized, request.default_service_date, request.window);
        }
    }

    Ok(LoadedTripUpdates {
        index,
        freshness: FreshnessResult::applied(age_ms, age_source),
        rt_source: RtSource::Parsed,
        read_source: Some(ReadSource::Table),
        payload_fetch_count: 0,
        decode_ms: 0,
    })
}

fn regroup_trip(
    trip_id: &CompactString,
    service_date: Option<NaiveDate>,
    rows: &[&RtStopTimeRow],
) -> BoardTripUpdate {
    let trip_relationship = rows
        .iter()
        .find_map(|row| row.trip_schedule_relationship)
        .map(i32::from);

    BoardTripUpdate {
        trip_id: Some(trip_id.clone()),
        route_id: rows
            .iter()
            .find_map(|row| row.route_id.as_deref())
            .map(CompactString::from),
        start_date: service_date,
        start_time: None,
        schedule_relationship: option_i32_to_trip_schedule_relationship(&trip_relationship),
        delay: None,
        timestamp: None,
        stop_time_update: rows
            .iter()
            .map(|row| BoardStopTimeUpdate {
                stop_sequence: row.stop_sequence.map(|s| s as u32),
                stop_id: Some(EcoString::from(row.stop_id.as_str())),
                arrival: None,
                departure: Some(BoardStopTimeEvent {
                    delay: row.delay_sec,
                    time: row.departure_time.map(|t| t.timestamp()),
                }),
                schedule_relationship: option_i32_to_stop_time_schedule_relationship(
                    &row.schedule_relationship.map(i32::from),
                ),
                assigned_stop_id: row.assigned_stop_id.as_deref().map(EcoString::from),
            })
            .collect(),
    }
}

/// Loads currently-active alerts from the flattened alert rows, through
/// the same freshness gate as trip updates. Missing cache metadata, a
/// missing relation and a stale cache each yield an empty list with the
/// matching reason; `no_alerts` is reserved for a fresh feed with
/// nothing active.
pub async fn load_alerts_from_tables<S: CacheStore>(
    store: &S,
    feed_key: &str,
    now: chrono::DateTime<chrono::Utc>,
    config: &BoardConfig,
) -> Result<LoadedAlerts, StoreError> {
    let meta = match store.get_cache_meta(feed_key).await? {
        Some(meta) => meta,
        None => {
            return Ok(LoadedAlerts::unavailable(
                FreshnessReason::MissingCache,
                CacheStatus::Miss,
            ));
        }
    };

    let rows = match store.query_alert_rows(feed_key, now).await {
        Ok(rows) => rows,
        Err(StoreError::RelationMissing(relation)) => {
            tracing::warn!(feed_key, %relation, "alert tables absent");
            return Ok(LoadedAlerts::unavailable(
                FreshnessReason::ParsedUnavailable,
                CacheStatus::Error,
            ));
        }
        Err(err) => return Err(err),
    };

    let (age_ms, age_source) =
        match evaluate_freshness(store, feed_key, &meta, now, config).await? {
            FreshnessVerdict::Fresh { age_ms, source } => (age_ms, source),
            FreshnessVerdict::Stale { age_ms } => return Ok(LoadedAlerts::stale(age_ms)),
        };

    let alerts = rows.iter().map(alert_from_row).collect();
    Ok(LoadedAlerts::fresh(alerts, age_ms, age_source))
}

fn alert_from_row(row: &RtAlertRow) -> BoardAlert {
    let header_text = row.header.clone();
    let mut description_text = row.description.clone();
    if header_text.is_some() && header_text == description_text {
        description_text = None;
    }

    let mut informed_entity: Vec<BoardEntitySelector> = row
        .stop_ids
        .iter()
        .map(|stop_id| BoardEntitySelector {
            stop_id: Some(stop_id.clone()),
            ..Default::default()
        })
        .collect();
    informed_entity.extend(row.route_ids.iter().map(|route_id| BoardEntitySelector {
        route_id: Some(route_id.clone()),
        ..Default::default()
    }));

    let active_period = match (row.active_start, row.active_end) {
        (None, None) => Vec::new(),
        (start, end) => vec![BoardTimeRange {
            start: start.map(|t| t.timestamp() as u64),
            end: end.map(|t| t.timestamp() as u64),
        }],
    };

    BoardAlert {
        id: row.alert_id.clone(),
        active_period,
        informed_entity,
        cause: None,
        effect: None,
        header_text,
        description_text,
        departure_time: row.departure_time.map(|t| t.timestamp()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CacheMeta;
    use crate::store::test_support::MockStore;
    use ahash::AHashSet;
    use chrono::DateTime;
    use chrono::TimeZone;
    use chrono::Utc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 3, 10, 0, 0).unwrap()
    }

    fn service_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, 3).unwrap()
    }

    fn fresh_store() -> MockStore {
        let store = MockStore::new();
        store.set_meta(CacheMeta {
            fetched_at: now() - chrono::Duration::seconds(10),
            etag: None,
            last_status: Some(200),
            last_error: None,
            payload_bytes: 0,
        });
        store
    }

    fn stop_time_row(
        trip_id: &str,
        stop_id: &str,
        stop_sequence: i32,
        departure_epoch: i64,
    ) -> RtStopTimeRow {
        RtStopTimeRow {
            trip_id: trip_id.to_string(),
            route_id: None,
            stop_id: stop_id.to_string(),
            stop_sequence: Some(stop_sequence),
            service_date: Some(service_date()),
            departure_time: crate::datetime_from_epoch(departure_epoch),
            delay_sec: Some(120),
            schedule_relationship: None,
            trip_schedule_relationship: None,
            assigned_stop_id: None,
            updated_at: now() - chrono::Duration::seconds(5),
        }
    }

    fn request(stop_ids: Vec<&str>) -> RtLoadRequest {
        RtLoadRequest {
            feed_key: "feed".to_string(),
            enabled: true,
            now: now(),
            scope_trip_ids: AHashSet::new(),
            scope_stop_ids: stop_ids.into_iter().map(String::from).collect(),
            window: None,
            default_service_date: service_date(),
        }
    }

    #[tokio::test]
    async fn test_relation_missing_reports_parsed_unavailable() {
        let store = fresh_store();
        store.set_relation_missing(true);

        let loaded =
            load_trip_updates_from_tables(&store, &request(vec!["8503000"]), &BoardConfig::default())
                .await
                .unwrap();

        assert_eq!(loaded.freshness.reason, FreshnessReason::ParsedUnavailable);
        assert_eq!(loaded.freshness.cache_status, CacheStatus::Error);
    }

    #[tokio::test]
    async fn test_rows_regroup_into_index() {
        let store = fresh_store();
        store.set_trip_rows(vec![
            stop_time_row("T1", "8503000:0:1", 3, 1_762_164_000),
            stop_time_row("T1", "8503000:0:2", 4, 1_762_164_300),
        ]);

        let loaded = load_trip_updates_from_tables(
            &store,
            &request(vec!["8503000:0:1", "8503000:0:2"]),
            &BoardConfig::default(),
        )
        .await
        .unwrap();

        assert!(loaded.freshness.applied);
        assert_eq!(loaded.read_source, Some(ReadSource::Table));
        assert_eq!(loaded.index.by_key.len(), 2);
        let fallback = loaded
            .index
            .trip_fallback_by_trip_start
            .get(&crate::rt_index::TripStartKey {
                trip_id: CompactString::from("T1"),
                service_date: service_date(),
            })
            .unwrap();
        assert_eq!(fallback.len(), 2);
    }

    #[tokio::test]
    async fn test_lookback_excludes_old_rows() {
        let store = fresh_store();
        let mut old_row = stop_time_row("T1", "8503000", 3, 1_762_164_000);
        old_row.updated_at = now() - chrono::Duration::seconds(3600);
        store.set_trip_rows(vec![old_row]);

        let loaded =
            load_trip_updates_from_tables(&store, &request(vec!["8503000"]), &BoardConfig::default())
                .await
                .unwrap();

        assert!(loaded.freshness.applied);
        assert!(loaded.index.is_empty());
    }

    #[tokio::test]
    async fn test_equivalent_feed_yields_identical_index() {
        // Blob-side normalization of the same content.
        let mut blob_index = TripUpdateIndex::new();
        blob_index.add_trip_update(
            &BoardTripUpdate {
                trip_id: Some(CompactString::from("T1")),
                route_id: None,
                start_date: Some(service_date()),
                start_time: None,
                schedule_relationship: None,
                delay: None,
                timestamp: None,
                stop_time_update: vec![BoardStopTimeUpdate {
                    stop_sequence: Some(3),
                    stop_id: Some(EcoString::from("8503000:0:1")),
                    arrival: None,
                    departure: Some(BoardStopTimeEvent {
                        delay: Some(120),
                        time: Some(1_762_164_000),
                    }),
                    schedule_relationship: None,
                    assigned_stop_id: None,
                }],
            },
            service_date(),
            None,
        );

        let store = fresh_store();
        store.set_trip_rows(vec![stop_time_row("T1", "8503000:0:1", 3, 1_762_164_000)]);
        let loaded = load_trip_updates_from_tables(
            &store,
            &request(vec!["8503000:0:1"]),
            &BoardConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(loaded.index.by_key, blob_index.by_key);
        assert_eq!(loaded.index.by_trip_stop, blob_index.by_trip_stop);
    }

    fn alert_row(alert_id: &str, header: &str) -> RtAlertRow {
        RtAlertRow {
            alert_id: alert_id.to_string(),
            header: Some(header.to_string()),
            description: Some(header.to_string()),
            stop_ids: vec!["8503000".to_string()],
            route_ids: vec!["IC5".to_string()],
            departure_time: Some(now() + chrono::Duration::minutes(30)),
            active_start: None,
            active_end: None,
        }
    }

    #[tokio::test]
    async fn test_alert_rows_map_to_board_alerts() {
        let store = fresh_store();
        store.set_alert_rows(vec![alert_row("a1", "Track closure")]);

        let loaded = load_alerts_from_tables(&store, "feed", now(), &BoardConfig::default())
            .await
            .unwrap();

        assert_eq!(loaded.freshness.reason, FreshnessReason::Applied);
        assert_eq!(loaded.alerts.len(), 1);
        let alert = &loaded.alerts[0];
        assert_eq!(alert.header_text.as_deref(), Some("Track closure"));
        assert!(alert.description_text.is_none());
        assert_eq!(alert.informed_entity.len(), 2);
        assert!(alert.departure_time.is_some());
    }

    #[tokio::test]
    async fn test_stale_alerts_cache_is_not_served() {
        let store = MockStore::new();
        store.set_meta(CacheMeta {
            fetched_at: now() - chrono::Duration::seconds(600),
            etag: None,
            last_status: Some(200),
            last_error: None,
            payload_bytes: 0,
        });
        store.set_alert_rows(vec![alert_row("a1", "Old disruption")]);

        let loaded = load_alerts_from_tables(&store, "feed", now(), &BoardConfig::default())
            .await
            .unwrap();

        assert_eq!(loaded.freshness.reason, FreshnessReason::StaleCache);
        assert_eq!(loaded.freshness.cache_status, CacheStatus::Stale);
        assert!(loaded.alerts.is_empty());
    }

    #[tokio::test]
    async fn test_missing_alert_relation_reports_parsed_unavailable() {
        let store = fresh_store();
        store.set_relation_missing(true);

        let loaded = load_alerts_from_tables(&store, "feed", now(), &BoardConfig::default())
            .await
            .unwrap();

        assert_eq!(loaded.freshness.reason, FreshnessReason::ParsedUnavailable);
        assert_eq!(loaded.freshness.cache_status, CacheStatus::Error);
        assert!(loaded.alerts.is_empty());
    }
}
