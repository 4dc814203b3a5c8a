use chrono_tz::Tz;
use std::str::FromStr;

/// Tunables for the realtime merge path.
///
/// Every numeric constant observed in production behaviour lives here as a
/// named field so deployments can override it through the environment
/// instead of recompiling.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BoardConfig {
    /// Kill switch for the whole realtime path.
    pub rt_enabled: bool,
    /// Timezone used to anchor alert clock times and service dates.
    pub timezone: Tz,
    /// Early arrivals inside this window are jitter, not genuine earliness.
    pub early_jitter_window_sec: i64,
    /// Max |stop_sequence| distance a trip-level fallback match may bridge.
    pub fallback_max_sequence_gap: u32,
    /// Hard cap on the per-request budget regardless of route timeout.
    pub total_budget_cap_ms: u64,
    /// Below this remaining budget, optional phases are skipped.
    pub low_budget_threshold_ms: u64,
    /// Cache age beyond which the feed is reported stale.
    pub freshness_threshold_ms: u64,
    /// Blob backend: max feed entities examined before tripping the guard.
    pub max_scanned_entities: usize,
    /// Wall-clock guard for filtering/index building, started once the
    /// payload is already in hand.
    pub max_process_ms: u64,
    /// Parsed-table backend: only rows updated within this lookback are
    /// queried, to keep stop-scoped queries off a full table scan.
    pub parsed_lookback_sec: i64,
    /// Replacement departures are only synthesized inside this window.
    pub added_trip_window_minutes: i64,
    /// Max replacement departures appended per request.
    pub added_trip_limit: usize,
    /// Departures older than this grace are dropped from synthesis.
    pub departed_grace_sec: i64,
    /// Below this many realtime-touched rows, the sparse-result retry runs.
    pub sparse_result_threshold: usize,
}

impl Default for BoardConfig {
    fn default() -> Self {
        BoardConfig {
            rt_enabled: true,
            timezone: Tz::Europe__Zurich,
            early_jitter_window_sec: 60,
            fallback_max_sequence_gap: 4,
            total_budget_cap_ms: 5000,
            low_budget_threshold_ms: 400,
            freshness_threshold_ms: 90_000,
            max_scanned_entities: 5000,
            max_process_ms: 50,
            parsed_lookback_sec: 300,
            added_trip_window_minutes: 120,
            added_trip_limit: 10,
            departed_grace_sec: 90,
            sparse_result_threshold: 1,
        }
    }
}

fn env_override<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        if let Ok(parsed) = raw.parse::<T>() {
            *target = parsed;
        }
    }
}

impl BoardConfig {
    /// Defaults overlaid with `STATIONBOARD_*` environment variables.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let mut config = BoardConfig::default();

        env_override("STATIONBOARD_RT_ENABLED", &mut config.rt_enabled);
        env_override("STATIONBOARD_TIMEZONE", &mut config.timezone);
        env_override(
            "STATIONBOARD_EARLY_JITTER_WINDOW_SEC",
            &mut config.early_jitter_window_sec,
        );
        env_override(
            "STATIONBOARD_FALLBACK_MAX_SEQUENCE_GAP",
            &mut config.fallback_max_sequence_gap,
        );
        env_override(
            "STATIONBOARD_TOTAL_BUDGET_CAP_MS",
            &mut config.total_budget_cap_ms,
        );
        env_override(
            "STATIONBOARD_LOW_BUDGET_THRESHOLD_MS",
            &mut config.low_budget_threshold_ms,
        );
        env_override(
            "STATIONBOARD_FRESHNESS_THRESHOLD_MS",
            &mut config.freshness_threshold_ms,
        );
        env_override(
            "STATIONBOARD_MAX_SCANNED_ENTITIES",
            &mut config.max_scanned_entities,
        );
        env_override("STATIONBOARD_MAX_PROCESS_MS", &mut config.max_process_ms);
        env_override(
            "STATIONBOARD_PARSED_LOOKBACK_SEC",
            &mut config.parsed_lookback_sec,
        );
        env_override(
            "STATIONBOARD_ADDED_TRIP_WINDOW_MINUTES",
            &mut config.added_trip_window_minutes,
        );
        env_override(
            "STATIONBOARD_ADDED_TRIP_LIMIT",
            &mut config.added_trip_limit,
        );
        env_override(
            "STATIONBOARD_DEPARTED_GRACE_SEC",
            &mut config.departed_grace_sec,
        );
        env_override(
            "STATIONBOARD_SPARSE_RESULT_THRESHOLD",
            &mut config.sparse_result_threshold,
        );

        config
    }
}
