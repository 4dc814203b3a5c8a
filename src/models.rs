use crate::rt_index::BoardAlert;
use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use compact_str::CompactString;
use std::collections::BTreeSet;

/// Where a departure row ultimately came from.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RowSource {
    Scheduled,
    TripUpdate,
    RtAdded,
    SyntheticAlert,
}

impl RowSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowSource::Scheduled => "scheduled",
            RowSource::TripUpdate => "tripupdate",
            RowSource::RtAdded => "rt_added",
            RowSource::SyntheticAlert => "synthetic_alert",
        }
    }
}

/// One departure on the board. Built per request from the static schedule,
/// mutated in place by the merge pass, discarded at response time.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScheduledDepartureRow {
    pub trip_id: CompactString,
    pub route_category: Option<CompactString>,
    pub number: Option<CompactString>,
    pub stop_id: CompactString,
    pub stop_sequence: u32,
    pub service_date: NaiveDate,
    pub scheduled_departure: DateTime<Utc>,
    /// Always the literal realtime instant, including small early jitter.
    /// Not kept in lockstep with `delay_min`; the two may disagree by up
    /// to a minute.
    pub realtime_departure: DateTime<Utc>,
    /// Display quantity, floored at 0. Never re-derived from
    /// `realtime_departure`.
    pub delay_min: i64,
    pub platform: Option<String>,
    pub platform_changed: bool,
    pub cancelled: bool,
    pub suppressed_stop: bool,
    pub source: RowSource,
    pub tags: BTreeSet<CompactString>,
}

impl ScheduledDepartureRow {
    /// A purely scheduled row, before any realtime merge.
    pub fn scheduled(
        trip_id: &str,
        stop_id: &str,
        stop_sequence: u32,
        service_date: NaiveDate,
        scheduled_departure: DateTime<Utc>,
    ) -> Self {
        ScheduledDepartureRow {
            trip_id: CompactString::from(trip_id),
            route_category: None,
            number: None,
            stop_id: CompactString::from(stop_id),
            stop_sequence,
            service_date,
            scheduled_departure,
            realtime_departure: scheduled_departure,
            delay_min: 0,
            platform: None,
            platform_changed: false,
            cancelled: false,
            suppressed_stop: false,
            source: RowSource::Scheduled,
            tags: BTreeSet::new(),
        }
    }

    pub fn tag(&mut self, tag: &str) {
        self.tags.insert(CompactString::from(tag));
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

/// Why the realtime merge did or did not happen.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessReason {
    Disabled,
    MissingCache,
    StaleCache,
    DecodeFailed,
    ParsedUnavailable,
    GuardTripped,
    NoAlerts,
    Applied,
}

impl FreshnessReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FreshnessReason::Disabled => "disabled",
            FreshnessReason::MissingCache => "missing_cache",
            FreshnessReason::StaleCache => "stale_cache",
            FreshnessReason::DecodeFailed => "decode_failed",
            FreshnessReason::ParsedUnavailable => "parsed_unavailable",
            FreshnessReason::GuardTripped => "guard_tripped",
            FreshnessReason::NoAlerts => "no_alerts",
            FreshnessReason::Applied => "applied",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheStatus {
    Miss,
    Stale,
    Fresh,
    Error,
    Bypass,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessAgeSource {
    FetchedAt,
    LastSuccessfulPoll,
}

/// Staleness/availability verdict exposed verbatim in debug payloads.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FreshnessResult {
    pub reason: FreshnessReason,
    pub applied: bool,
    pub cache_status: CacheStatus,
    pub age_ms: Option<u64>,
    pub freshness_age_source: Option<FreshnessAgeSource>,
}

impl FreshnessResult {
    pub fn not_applied(reason: FreshnessReason, cache_status: CacheStatus) -> Self {
        FreshnessResult {
            reason,
            applied: false,
            cache_status,
            age_ms: None,
            freshness_age_source: None,
        }
    }

    pub fn applied(age_ms: u64, source: FreshnessAgeSource) -> Self {
        FreshnessResult {
            reason: FreshnessReason::Applied,
            applied: true,
            cache_status: CacheStatus::Fresh,
            age_ms: Some(age_ms),
            freshness_age_source: Some(source),
        }
    }
}

/// Budget guard state, exposed verbatim in debug payloads.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BudgetDebug {
    pub degraded_mode: bool,
    pub degraded_reasons: Vec<String>,
    pub total_budget_ms: u64,
    pub low_budget_threshold_ms: u64,
}

/// Alert container handed to the response-shaping layer. `entities` is
/// always an array, never null.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct BoardAlerts {
    pub entities: Vec<BoardAlert>,
}
