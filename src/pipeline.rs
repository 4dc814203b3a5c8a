// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

//! Request-level assembly of a departure board: realtime load, merge,
//! recovery retries, alerts, and replacement supplements, all under one
//! time budget.
//!
//! Phase order is fixed. The primary load always runs; everything after
//! it is optional and drains gracefully as the budget empties. Refusing
//! the alerts phase ends the request immediately, so the supplement phase
//! structurally cannot run on a budget that could not afford alerts.

use crate::budget::{BoardPhase, RequestBudget};
use crate::config::BoardConfig;
use crate::feed_cache::{DecodedFeedCache, ReadSource};
use crate::loader::blob::{load_alerts_from_blob, load_trip_updates_from_blob};
use crate::loader::tables::{load_alerts_from_tables, load_trip_updates_from_tables};
use crate::loader::{LoadedAlerts, LoadedTripUpdates, RtLoadRequest};
use crate::models::{
    BoardAlerts, BudgetDebug, CacheStatus, FreshnessReason, FreshnessResult, RowSource,
    ScheduledDepartureRow,
};
use crate::reconcile::{
    apply_added_trips, apply_trip_updates, filter_relevant_alerts, synthesize_from_alerts,
};
use crate::rt_index::BoardAlert;
use crate::store::CacheStore;
use crate::stop_id_root;
use ahash::AHashMap;
use ahash::AHashSet;
use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use compact_str::CompactString;
use itertools::Itertools;

/// Which loader backend serves this request.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RtBackend {
    Blob,
    Parsed,
}

/// The station a request is about, as the schedule layer resolved it.
#[derive(Clone, Debug, Default)]
pub struct StationScope {
    pub stop_ids: Vec<String>,
    pub route_ids: Vec<String>,
    pub station_name: String,
}

/// One departure-board request, carrying the already-built scheduled rows.
#[derive(Clone, Debug)]
pub struct BoardRequest {
    pub feed_key: String,
    pub alerts_feed_key: Option<String>,
    pub base_rows: Vec<ScheduledDepartureRow>,
    pub scope: StationScope,
    pub platform_by_stop_id: AHashMap<String, String>,
    pub now: DateTime<Utc>,
    pub service_date: NaiveDate,
    pub route_timeout_ms: u64,
    /// Optional epoch-second departure window narrowing the index.
    pub window: Option<(i64, i64)>,
    pub backend: RtBackend,
}

/// Everything the response-shaping layer needs, schedule rows first in
/// their incoming order, synthesized rows appended.
#[derive(Clone, Debug)]
pub struct BoardOutcome {
    pub rows: Vec<ScheduledDepartureRow>,
    pub alerts: BoardAlerts,
    /// The alerts verdict once the phase ran (`Applied`, `NoAlerts`, or
    /// why the alerts cache was unusable), `None` otherwise.
    pub alerts_reason: Option<FreshnessReason>,
    pub freshness: FreshnessResult,
    pub budget: BudgetDebug,
    pub read_source: Option<ReadSource>,
    pub payload_fetch_count: u32,
}

pub async fn assemble_departure_board<S: CacheStore>(
    store: &S,
    feed_cache: &DecodedFeedCache,
    config: &BoardConfig,
    request: BoardRequest,
) -> BoardOutcome {
    let mut budget = RequestBudget::new(request.route_timeout_ms, config);
    let mut rows = request.base_rows.clone();

    let scope_trip_ids: AHashSet<CompactString> =
        rows.iter().map(|row| row.trip_id.clone()).collect();

    let mut load_request = RtLoadRequest {
        feed_key: request.feed_key.clone(),
        enabled: config.rt_enabled,
        now: request.now,
        scope_trip_ids,
        scope_stop_ids: request.scope.stop_ids.clone(),
        window: request.window,
        default_service_date: request.service_date,
    };

    let mut loaded = match load_trip_updates(store, feed_cache, &load_request, config, request.backend)
        .await
    {
        Ok(loaded) => loaded,
        Err(err) => {
            tracing::warn!(feed_key = %request.feed_key, error = %err, "realtime load failed");
            budget.record_failure("rt_load_failed");
            return finish_without_alerts(
                rows,
                FreshnessResult::not_applied(FreshnessReason::MissingCache, CacheStatus::Error),
                budget,
                None,
                0,
            );
        }
    };

    if loaded.freshness.applied {
        apply_trip_updates(&mut rows, &loaded.index, &request.platform_by_stop_id, config);
    }

    // Sparse-result retry: a departure window can hide updates whose new
    // departure time moved outside it. The need check comes first so a
    // healthy result never spends budget here.
    if loaded.freshness.applied
        && request.window.is_some()
        && touched_row_count(&rows) < config.sparse_result_threshold
        && budget.allow(BoardPhase::SparseRetry)
    {
        load_request.window = None;
        match load_trip_updates(store, feed_cache, &load_request, config, request.backend).await {
            Ok(retried) if retried.freshness.applied => {
                apply_trip_updates(&mut rows, &retried.index, &request.platform_by_stop_id, config);
                loaded = retried;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(feed_key = %request.feed_key, error = %err, "sparse retry failed");
                budget.record_failure("rt_load_failed");
            }
        }
    }

    // Zero-result scope fallback: some feeds key stop ids at the bare
    // station root, which exact-match table queries miss.
    if loaded.freshness.applied && touched_row_count(&rows) == 0 {
        let roots: Vec<String> = request
            .scope
            .stop_ids
            .iter()
            .map(|stop_id| stop_id_root(stop_id).to_string())
            .unique()
            .collect();

        if roots != request.scope.stop_ids && budget.allow(BoardPhase::ScopeFallback) {
            load_request.scope_stop_ids = roots;
            load_request.window = None;
            match load_trip_updates(store, feed_cache, &load_request, config, request.backend).await
            {
                Ok(retried) if retried.freshness.applied => {
                    apply_trip_updates(
                        &mut rows,
                        &retried.index,
                        &request.platform_by_stop_id,
                        config,
                    );
                    loaded = retried;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(feed_key = %request.feed_key, error = %err, "scope fallback failed");
                    budget.record_failure("rt_load_failed");
                }
            }
        }
    }

    if !budget.allow(BoardPhase::Alerts) {
        return finish_without_alerts(
            rows,
            loaded.freshness,
            budget,
            loaded.read_source,
            loaded.payload_fetch_count,
        );
    }

    let mut alerts_reason = None;
    let mut relevant_alerts: Vec<BoardAlert> = Vec::new();

    if let Some(alerts_feed_key) = &request.alerts_feed_key {
        let fetched = match request.backend {
            RtBackend::Blob => {
                load_alerts_from_blob(store, feed_cache, alerts_feed_key, request.now, config).await
            }
            RtBackend::Parsed => {
                load_alerts_from_tables(store, alerts_feed_key, request.now, config).await
            }
        };

        let loaded_alerts = match fetched {
            Ok(loaded_alerts) => loaded_alerts,
            Err(err) => {
                tracing::warn!(feed_key = %alerts_feed_key, error = %err, "alerts load failed");
                budget.record_failure("alerts_load_failed");
                LoadedAlerts::unavailable(FreshnessReason::MissingCache, CacheStatus::Error)
            }
        };

        relevant_alerts = filter_relevant_alerts(
            &loaded_alerts.alerts,
            &request.scope.stop_ids,
            &request.scope.route_ids,
            &request.scope.station_name,
        );

        // An unusable alerts cache keeps its loader verdict; a usable one
        // downgrades to no_alerts when nothing concerns this station.
        alerts_reason = Some(
            if loaded_alerts.freshness.applied && relevant_alerts.is_empty() {
                FreshnessReason::NoAlerts
            } else {
                loaded_alerts.freshness.reason
            },
        );

        rows.extend(synthesize_from_alerts(
            &relevant_alerts,
            &request.scope.stop_ids,
            &request.scope.route_ids,
            &request.scope.station_name,
            request.service_date,
            request.now,
            config,
        ));
    }

    if budget.allow(BoardPhase::Supplement) {
        rows.extend(apply_added_trips(
            &loaded.index,
            &request.scope.stop_ids,
            request.now,
            config,
        ));
    }

    BoardOutcome {
        rows,
        alerts: BoardAlerts {
            entities: relevant_alerts,
        },
        alerts_reason,
        freshness: loaded.freshness,
        budget: budget.debug(),
        read_source: loaded.read_source,
        payload_fetch_count: loaded.payload_fetch_count,
    }
}

async fn load_trip_updates<S: CacheStore>(
    store: &S,
    feed_cache: &DecodedFeedCache,
    load_request: &RtLoadRequest,
    config: &BoardConfig,
    backend: RtBackend,
) -> Result<LoadedTripUpdates, crate::store::StoreError> {
    match backend {
        RtBackend::Blob => {
            load_trip_updates_from_blob(store, feed_cache, load_request, config).await
        }
        RtBackend::Parsed => load_trip_updates_from_tables(store, load_request, config).await,
    }
}

fn touched_row_count(rows: &[ScheduledDepartureRow]) -> usize {
    rows.iter()
        .filter(|row| row.source != RowSource::Scheduled)
        .count()
}

fn finish_without_alerts(
    rows: Vec<ScheduledDepartureRow>,
    freshness: FreshnessResult,
    budget: RequestBudget,
    read_source: Option<ReadSource>,
    payload_fetch_count: u32,
) -> BoardOutcome {
    BoardOutcome {
        rows,
        alerts: BoardAlerts::default(),
        alerts_reason: None,
        freshness,
        budget: budget.debug(),
        read_source,
        payload_fetch_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::MockStore;
    use crate::store::{CacheMeta, CachePayload};
    use chrono::Duration;
    use chrono::TimeZone;
    use prost::Message;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 3, 10, 0, 0).unwrap()
    }

    fn service_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, 3).unwrap()
    }

    fn feed_with(entities: Vec<gtfs_realtime::FeedEntity>) -> Vec<u8> {
        gtfs_realtime::FeedMessage {
            header: gtfs_realtime::FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                ..Default::default()
            },
            entity: entities,
            ..Default::default()
        }
        .encode_to_vec()
    }

    fn delay_entity(trip_id: &str, stop_id: &str, stop_sequence: u32, time: i64) -> gtfs_realtime::FeedEntity {
        gtfs_realtime::FeedEntity {
            id: format!("e-{trip_id}"),
            trip_update: Some(gtfs_realtime::TripUpdate {
                trip: gtfs_realtime::TripDescriptor {
                    trip_id: Some(trip_id.to_string()),
                    start_date: Some("20251103".to_string()),
                    ..Default::default()
                },
                stop_time_update: vec![gtfs_realtime::trip_update::StopTimeUpdate {
                    stop_sequence: Some(stop_sequence),
                    stop_id: Some(stop_id.to_string()),
                    departure: Some(gtfs_realtime::trip_update::StopTimeEvent {
                        time: Some(time),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn added_entity(trip_id: &str, stop_id: &str, time: i64) -> gtfs_realtime::FeedEntity {
        gtfs_realtime::FeedEntity {
            id: format!("e-{trip_id}"),
            trip_update: Some(gtfs_realtime::TripUpdate {
                trip: gtfs_realtime::TripDescriptor {
                    trip_id: Some(trip_id.to_string()),
                    start_date: Some("20251103".to_string()),
                    schedule_relationship: Some(1),
                    ..Default::default()
                },
                stop_time_update: vec![gtfs_realtime::trip_update::StopTimeUpdate {
                    stop_sequence: Some(1),
                    stop_id: Some(stop_id.to_string()),
                    departure: Some(gtfs_realtime::trip_update::StopTimeEvent {
                        time: Some(time),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn store_with_feed(payload: Vec<u8>) -> MockStore {
        let store = MockStore::new();
        let fetched = now() - Duration::seconds(10);
        store.set_meta(CacheMeta {
            fetched_at: fetched,
            etag: Some("v1".to_string()),
            last_status: Some(200),
            last_error: None,
            payload_bytes: payload.len() as i64,
        });
        store.set_payload(CachePayload {
            payload,
            fetched_at: fetched,
            etag: Some("v1".to_string()),
            last_status: Some(200),
        });
        store
    }

    fn request(base_rows: Vec<ScheduledDepartureRow>) -> BoardRequest {
        BoardRequest {
            feed_key: "feed".to_string(),
            alerts_feed_key: None,
            base_rows,
            scope: StationScope {
                stop_ids: vec!["8503000:0:1".to_string()],
                route_ids: vec![],
                station_name: "Bern".to_string(),
            },
            platform_by_stop_id: AHashMap::new(),
            now: now(),
            service_date: service_date(),
            route_timeout_ms: 5000,
            window: None,
            backend: RtBackend::Blob,
        }
    }

    fn base_row(trip_id: &str, minutes_out: i64) -> ScheduledDepartureRow {
        ScheduledDepartureRow::scheduled(
            trip_id,
            "8503000:0:1",
            3,
            service_date(),
            now() + Duration::minutes(minutes_out),
        )
    }

    #[tokio::test]
    async fn test_happy_path_merges_and_reports_applied() {
        let row = base_row("T1", 10);
        let delayed = row.scheduled_departure.timestamp() + 240;
        let store = store_with_feed(feed_with(vec![delay_entity("T1", "8503000:0:1", 3, delayed)]));
        let cache = DecodedFeedCache::new();

        let outcome =
            assemble_departure_board(&store, &cache, &BoardConfig::default(), request(vec![row]))
                .await;

        assert!(outcome.freshness.applied);
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.rows[0].delay_min, 4);
        assert_eq!(outcome.rows[0].source, RowSource::TripUpdate);
        assert!(!outcome.budget.degraded_mode);
        assert_eq!(outcome.read_source, Some(ReadSource::Payload));
    }

    #[tokio::test]
    async fn test_store_failure_degrades_gracefully() {
        let store = MockStore::new();
        *store.inner.fail_meta.lock().unwrap() = true;
        let cache = DecodedFeedCache::new();
        let row = base_row("T1", 10);

        let outcome = assemble_departure_board(
            &store,
            &cache,
            &BoardConfig::default(),
            request(vec![row.clone()]),
        )
        .await;

        assert_eq!(outcome.rows, vec![row]);
        assert_eq!(outcome.freshness.reason, FreshnessReason::MissingCache);
        assert_eq!(outcome.freshness.cache_status, CacheStatus::Error);
        assert!(outcome.budget.degraded_mode);
        assert!(outcome
            .budget
            .degraded_reasons
            .contains(&"rt_load_failed".to_string()));
    }

    #[tokio::test]
    async fn test_sparse_retry_recovers_windowed_out_update() {
        let row = base_row("T1", 10);
        // Departure pushed far beyond the request window.
        let delayed = row.scheduled_departure.timestamp() + 7200;
        let store = store_with_feed(feed_with(vec![delay_entity("T1", "8503000:0:1", 3, delayed)]));
        let cache = DecodedFeedCache::new();

        let mut req = request(vec![row.clone()]);
        req.window = Some((
            now().timestamp(),
            row.scheduled_departure.timestamp() + 600,
        ));

        let outcome =
            assemble_departure_board(&store, &cache, &BoardConfig::default(), req).await;

        assert_eq!(outcome.rows[0].source, RowSource::TripUpdate);
        assert_eq!(outcome.rows[0].realtime_departure.timestamp(), delayed);
        // Both loads decode once thanks to the feed cache.
        assert_eq!(store.payload_reads(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_budget_short_circuits_before_alerts() {
        let row = base_row("T1", 10);
        let delayed = row.scheduled_departure.timestamp() + 240;
        let store = store_with_feed(feed_with(vec![
            delay_entity("T1", "8503000:0:1", 3, delayed),
            added_entity("EXTRA1", "8503000:0:1", now().timestamp() + 600),
        ]));
        let cache = DecodedFeedCache::new();

        let mut req = request(vec![row]);
        req.alerts_feed_key = Some("alerts".to_string());
        req.route_timeout_ms = 0;

        let outcome =
            assemble_departure_board(&store, &cache, &BoardConfig::default(), req).await;

        // The merge still happened, but nothing optional ran: no alerts
        // verdict, and the ADDED trip was never appended.
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.rows[0].delay_min, 4);
        assert!(outcome.alerts_reason.is_none());
        assert!(outcome.alerts.entities.is_empty());
        assert!(outcome
            .budget
            .degraded_reasons
            .contains(&"alerts_budget_skipped".to_string()));
        assert!(!outcome
            .budget
            .degraded_reasons
            .iter()
            .any(|r| r == "supplement_budget_skipped"));
    }

    #[tokio::test]
    async fn test_supplement_appends_replacement_rows() {
        let row = base_row("T1", 10);
        let store = store_with_feed(feed_with(vec![added_entity(
            "EXTRA1",
            "8503000:0:1",
            now().timestamp() + 600,
        )]));
        let cache = DecodedFeedCache::new();

        let outcome =
            assemble_departure_board(&store, &cache, &BoardConfig::default(), request(vec![row]))
                .await;

        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(outcome.rows[0].source, RowSource::Scheduled);
        assert_eq!(outcome.rows[1].source, RowSource::RtAdded);
        assert!(outcome.rows[1].has_tag("replacement"));
    }

    #[tokio::test]
    async fn test_empty_alerts_feed_reports_no_alerts() {
        let row = base_row("T1", 10);
        let store = store_with_feed(feed_with(vec![]));
        let cache = DecodedFeedCache::new();

        let mut req = request(vec![row]);
        req.alerts_feed_key = Some("feed".to_string());

        let outcome =
            assemble_departure_board(&store, &cache, &BoardConfig::default(), req).await;

        assert_eq!(outcome.alerts_reason, Some(FreshnessReason::NoAlerts));
        assert!(outcome.alerts.entities.is_empty());
    }

    #[tokio::test]
    async fn test_stale_alerts_cache_is_withheld() {
        let row = base_row("T1", 10);
        let translated = |text: &str| gtfs_realtime::TranslatedString {
            translation: vec![gtfs_realtime::translated_string::Translation {
                text: text.to_string(),
                language: None,
            }],
        };

        // An active, relevant alert whose cache entry is well past the
        // freshness threshold. It must not reach the response.
        let payload = feed_with(vec![gtfs_realtime::FeedEntity {
            id: "a1".to_string(),
            alert: Some(gtfs_realtime::Alert {
                informed_entity: vec![gtfs_realtime::EntitySelector {
                    stop_id: Some("8503000".to_string()),
                    ..Default::default()
                }],
                header_text: Some(translated("Ersatzbus um 14:35")),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        let store = MockStore::new();
        let fetched = now() - Duration::seconds(600);
        store.set_meta(CacheMeta {
            fetched_at: fetched,
            etag: Some("v1".to_string()),
            last_status: Some(200),
            last_error: None,
            payload_bytes: payload.len() as i64,
        });
        store.set_payload(CachePayload {
            payload,
            fetched_at: fetched,
            etag: Some("v1".to_string()),
            last_status: Some(200),
        });
        let cache = DecodedFeedCache::new();

        let mut req = request(vec![row]);
        req.alerts_feed_key = Some("alerts".to_string());

        let outcome =
            assemble_departure_board(&store, &cache, &BoardConfig::default(), req).await;

        assert_eq!(outcome.alerts_reason, Some(FreshnessReason::StaleCache));
        assert!(outcome.alerts.entities.is_empty());
        assert!(!outcome
            .rows
            .iter()
            .any(|r| r.source == RowSource::SyntheticAlert));
    }

    #[tokio::test]
    async fn test_relevant_alert_is_returned_and_synthesized() {
        let row = base_row("T1", 10);
        let translated = |text: &str| gtfs_realtime::TranslatedString {
            translation: vec![gtfs_realtime::translated_string::Translation {
                text: text.to_string(),
                language: None,
            }],
        };

        // The mock store holds a single payload per store, so this one
        // carries the alert alongside the (absent) trip updates and is
        // served for both feed keys.
        let store = store_with_feed(feed_with(vec![gtfs_realtime::FeedEntity {
            id: "a1".to_string(),
            alert: Some(gtfs_realtime::Alert {
                informed_entity: vec![gtfs_realtime::EntitySelector {
                    stop_id: Some("8503000".to_string()),
                    ..Default::default()
                }],
                header_text: Some(translated("Ersatzbus um 14:35")),
                ..Default::default()
            }),
            ..Default::default()
        }]));
        let cache = DecodedFeedCache::new();

        let mut req = request(vec![row]);
        req.alerts_feed_key = Some("alerts".to_string());

        let outcome =
            assemble_departure_board(&store, &cache, &BoardConfig::default(), req).await;

        assert_eq!(outcome.alerts_reason, Some(FreshnessReason::Applied));
        assert_eq!(outcome.alerts.entities.len(), 1);
        let synthesized: Vec<_> = outcome
            .rows
            .iter()
            .filter(|r| r.source == RowSource::SyntheticAlert)
            .collect();
        assert_eq!(synthesized.len(), 1);
        assert_eq!(synthesized[0].trip_id, "alert-a1");
    }
}
