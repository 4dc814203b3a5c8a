// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

//! Scoped, freshness-gated loading of realtime content into a
//! [`TripUpdateIndex`](crate::rt_index::TripUpdateIndex).
//!
//! Two interchangeable backends exist: `blob` decodes the raw protobuf
//! payload held in the feed cache, `tables` reads rows a poller has
//! already flattened into Postgres. Both feed the same index builder, so
//! an equivalent feed yields an identical index either way.

pub mod blob;
pub mod tables;

use crate::config::BoardConfig;
use crate::feed_cache::ReadSource;
use crate::models::{CacheStatus, FreshnessAgeSource, FreshnessReason, FreshnessResult};
use crate::rt_index::{BoardAlert, TripUpdateIndex};
use crate::store::{CacheMeta, CacheStore, StoreError};
use ahash::AHashSet;
use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use compact_str::CompactString;

/// Which representation of the feed a load went through.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RtSource {
    Blob,
    Parsed,
}

/// One realtime load, scoped to a single station request.
#[derive(Clone, Debug)]
pub struct RtLoadRequest {
    pub feed_key: String,
    pub enabled: bool,
    pub now: DateTime<Utc>,
    /// Trip ids on the scheduled board; matching updates always load.
    pub scope_trip_ids: AHashSet<CompactString>,
    /// Stop ids of the station, before variant expansion.
    pub scope_stop_ids: Vec<String>,
    /// Optional epoch-second departure window narrowing the index.
    pub window: Option<(i64, i64)>,
    pub default_service_date: NaiveDate,
}

/// Result of one load attempt. The index is only populated when
/// `freshness.applied` is true.
#[derive(Clone, Debug)]
pub struct LoadedTripUpdates {
    pub index: TripUpdateIndex,
    pub freshness: FreshnessResult,
    pub rt_source: RtSource,
    pub read_source: Option<ReadSource>,
    pub payload_fetch_count: u32,
    pub decode_ms: u64,
}

impl LoadedTripUpdates {
    fn empty(rt_source: RtSource, freshness: FreshnessResult) -> Self {
        LoadedTripUpdates {
            index: TripUpdateIndex::new(),
            freshness,
            rt_source,
            read_source: None,
            payload_fetch_count: 0,
            decode_ms: 0,
        }
    }
}

/// Result of one alerts load. Alerts go through the same freshness gate
/// as trip updates; the list is only populated when the cache was usable
/// and fresh, and the reason says why otherwise.
#[derive(Clone, Debug)]
pub struct LoadedAlerts {
    pub alerts: Vec<BoardAlert>,
    pub freshness: FreshnessResult,
}

impl LoadedAlerts {
    pub(crate) fn unavailable(reason: FreshnessReason, cache_status: CacheStatus) -> Self {
        LoadedAlerts {
            alerts: Vec::new(),
            freshness: FreshnessResult::not_applied(reason, cache_status),
        }
    }

    pub(crate) fn fresh(
        alerts: Vec<BoardAlert>,
        age_ms: u64,
        age_source: FreshnessAgeSource,
    ) -> Self {
        let freshness = if alerts.is_empty() {
            FreshnessResult {
                reason: FreshnessReason::NoAlerts,
                applied: false,
                cache_status: CacheStatus::Fresh,
                age_ms: Some(age_ms),
                freshness_age_source: Some(age_source),
            }
        } else {
            FreshnessResult::applied(age_ms, age_source)
        };
        LoadedAlerts { alerts, freshness }
    }

    pub(crate) fn stale(age_ms: u64) -> Self {
        LoadedAlerts {
            alerts: Vec::new(),
            freshness: FreshnessResult {
                reason: FreshnessReason::StaleCache,
                applied: false,
                cache_status: CacheStatus::Stale,
                age_ms: Some(age_ms),
                freshness_age_source: None,
            },
        }
    }
}

/// Freshness verdict for a cached feed, with the age that justified it.
pub(crate) enum FreshnessVerdict {
    Fresh {
        age_ms: u64,
        source: FreshnessAgeSource,
    },
    Stale {
        age_ms: u64,
    },
}

/// A feed counts as fresh when EITHER the cached payload's own fetch time
/// OR the poller's last successful poll is within the threshold. An older
/// timestamp can therefore never make a feed look fresher than its newest
/// evidence, only the other way around.
pub(crate) async fn evaluate_freshness<S: CacheStore>(
    store: &S,
    feed_key: &str,
    meta: &CacheMeta,
    now: DateTime<Utc>,
    config: &BoardConfig,
) -> Result<FreshnessVerdict, StoreError> {
    let fetched_age_ms = age_ms(now, meta.fetched_at);
    if fetched_age_ms <= config.freshness_threshold_ms {
        return Ok(FreshnessVerdict::Fresh {
            age_ms: fetched_age_ms,
            source: FreshnessAgeSource::FetchedAt,
        });
    }

    if let Some(last_poll) = store.get_last_successful_poll_at(feed_key).await? {
        let poll_age_ms = age_ms(now, last_poll);
        if poll_age_ms <= config.freshness_threshold_ms {
            return Ok(FreshnessVerdict::Fresh {
                age_ms: poll_age_ms,
                source: FreshnessAgeSource::LastSuccessfulPoll,
            });
        }
    }

    Ok(FreshnessVerdict::Stale {
        age_ms: fetched_age_ms,
    })
}

fn age_ms(now: DateTime<Utc>, then: DateTime<Utc>) -> u64 {
    (now - then).num_milliseconds().max(0) as u64
}

pub(crate) fn disabled_result(rt_source: RtSource) -> LoadedTripUpdates {
    LoadedTripUpdates::empty(
        rt_source,
        FreshnessResult::not_applied(FreshnessReason::Disabled, CacheStatus::Bypass),
    )
}

pub(crate) fn missing_cache_result(rt_source: RtSource) -> LoadedTripUpdates {
    LoadedTripUpdates::empty(
        rt_source,
        FreshnessResult::not_applied(FreshnessReason::MissingCache, CacheStatus::Miss),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::MockStore;
    use chrono::TimeZone;

    fn meta_at(fetched_at: DateTime<Utc>) -> CacheMeta {
        CacheMeta {
            fetched_at,
            etag: None,
            last_status: Some(200),
            last_error: None,
            payload_bytes: 100,
        }
    }

    #[tokio::test]
    async fn test_recent_fetch_is_fresh() {
        let store = MockStore::new();
        let config = BoardConfig::default();
        let now = Utc.with_ymd_and_hms(2025, 11, 3, 10, 0, 0).unwrap();
        let meta = meta_at(now - chrono::Duration::seconds(30));

        let verdict = evaluate_freshness(&store, "feed", &meta, now, &config)
            .await
            .unwrap();
        match verdict {
            FreshnessVerdict::Fresh { age_ms, source } => {
                assert_eq!(age_ms, 30_000);
                assert_eq!(source, FreshnessAgeSource::FetchedAt);
            }
            FreshnessVerdict::Stale { .. } => panic!("expected fresh"),
        }
    }

    #[tokio::test]
    async fn test_old_fetch_with_recent_poll_is_fresh() {
        let store = MockStore::new();
        let config = BoardConfig::default();
        let now = Utc.with_ymd_and_hms(2025, 11, 3, 10, 0, 0).unwrap();
        let meta = meta_at(now - chrono::Duration::seconds(600));
        store.set_last_poll(now - chrono::Duration::seconds(20));

        let verdict = evaluate_freshness(&store, "feed", &meta, now, &config)
            .await
            .unwrap();
        match verdict {
            FreshnessVerdict::Fresh { age_ms, source } => {
                assert_eq!(age_ms, 20_000);
                assert_eq!(source, FreshnessAgeSource::LastSuccessfulPoll);
            }
            FreshnessVerdict::Stale { .. } => panic!("expected fresh"),
        }
    }

    #[tokio::test]
    async fn test_both_old_is_stale() {
        let store = MockStore::new();
        let config = BoardConfig::default();
        let now = Utc.with_ymd_and_hms(2025, 11, 3, 10, 0, 0).unwrap();
        let meta = meta_at(now - chrono::Duration::seconds(600));
        store.set_last_poll(now - chrono::Duration::seconds(500));

        let verdict = evaluate_freshness(&store, "feed", &meta, now, &config)
            .await
            .unwrap();
        match verdict {
            FreshnessVerdict::Stale { age_ms } => assert_eq!(age_ms, 600_000),
            FreshnessVerdict::Fresh { .. } => panic!("expected stale"),
        }
    }
}
