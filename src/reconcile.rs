// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

//! Reconciliation of realtime content onto scheduled departure rows.
//!
//! All functions here are pure over their inputs and idempotent: running
//! a merge twice with the same index leaves the rows unchanged, and the
//! incoming row order is preserved.

use crate::config::BoardConfig;
use crate::models::{RowSource, ScheduledDepartureRow};
use crate::rt_index::{
    BoardAlert, BoardStopTimeScheduleRelationship, StopStatus, StopTimeDelta, TripStartKey,
    TripUpdateIndex, UpdateKey, clamp_delay_min,
};
use crate::{datetime_from_epoch, expand_stop_id_scope, expand_stop_id_variants, stop_id_root};
use ahash::AHashMap;
use chrono::DateTime;
use chrono::Duration;
use chrono::NaiveDate;
use chrono::TimeZone;
use chrono::Utc;
use compact_str::CompactString;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref CLOCK_TIME_RE: Regex = Regex::new(r"\b([01]?\d|2[0-3]):([0-5]\d)\b").unwrap();
}

/// Mutates scheduled rows in place with everything the index knows about
/// them. Row order is untouched; no rows are added or removed.
pub fn apply_trip_updates(
    rows: &mut [ScheduledDepartureRow],
    index: &TripUpdateIndex,
    platform_by_stop_id: &AHashMap<String, String>,
    config: &BoardConfig,
) {
    for row in rows.iter_mut() {
        let trip_start_key = TripStartKey {
            trip_id: row.trip_id.clone(),
            service_date: row.service_date,
        };

        if index.cancelled_trip_ids.contains(&row.trip_id) {
            row.cancelled = true;
            row.source = RowSource::TripUpdate;
        }

        let status = find_stop_status(row, index);
        let mut row_is_skipped = false;

        if let Some(status) = &status {
            match status.relationship {
                BoardStopTimeScheduleRelationship::Skipped => {
                    row.suppressed_stop = true;
                    row.cancelled = true;
                    row.source = RowSource::TripUpdate;
                    row.tag("skipped_stop");
                    row_is_skipped = true;
                }
                // NO_DATA means the feed explicitly knows nothing; the
                // scheduled values stand.
                BoardStopTimeScheduleRelationship::NoData => continue,
                _ => {}
            }

            if let Some(assigned) = &status.assigned_stop_id {
                apply_platform(row, assigned, platform_by_stop_id);
            }
        }

        if row_is_skipped {
            continue;
        }

        if let Some(span) = index
            .trip_flags_by_trip_start
            .get(&trip_start_key)
            .or_else(|| index.trip_flags_by_trip_id.get(&row.trip_id))
        {
            if row.stop_sequence < span.min_skipped_sequence
                || row.stop_sequence > span.max_skipped_sequence
            {
                row.tag("short_turn");
            }
        }

        let Some((delta, matched_stop_id)) = find_delta(row, index, config) else {
            continue;
        };

        if !apply_delta(row, &delta, config) {
            continue;
        }
        row.source = RowSource::TripUpdate;

        // The feed may key the update at a different platform child of the
        // same station; when that id maps to a platform, the board shows it.
        if let Some(matched_stop_id) = matched_stop_id {
            if matched_stop_id != row.stop_id {
                if let Some(platform) = platform_by_stop_id.get(matched_stop_id.as_str()) {
                    if row.platform.as_deref() != Some(platform.as_str()) {
                        row.platform = Some(platform.clone());
                        row.platform_changed = true;
                    }
                }
            }
        }
    }
}

fn find_stop_status<'a>(
    row: &ScheduledDepartureRow,
    index: &'a TripUpdateIndex,
) -> Option<&'a StopStatus> {
    let exact = UpdateKey {
        trip_id: row.trip_id.clone(),
        stop_id: row.stop_id.clone(),
        stop_sequence: row.stop_sequence,
        service_date: row.service_date,
    };
    if let Some(status) = index.stop_status_by_key.get(&exact) {
        return Some(status);
    }

    for variant in expand_stop_id_variants(&row.stop_id) {
        let key = (
            row.trip_id.clone(),
            CompactString::from(variant),
            row.service_date,
        );
        if let Some(status) = index.stop_status_by_trip_stop.get(&key) {
            return Some(status);
        }
    }

    None
}

/// Match precedence: exact key, then platform-variant match without the
/// sequence, then the nearest same-trip update within the allowed
/// stop_sequence gap.
fn find_delta(
    row: &ScheduledDepartureRow,
    index: &TripUpdateIndex,
    config: &BoardConfig,
) -> Option<(StopTimeDelta, Option<CompactString>)> {
    let exact = UpdateKey {
        trip_id: row.trip_id.clone(),
        stop_id: row.stop_id.clone(),
        stop_sequence: row.stop_sequence,
        service_date: row.service_date,
    };
    if let Some(delta) = index.by_key.get(&exact) {
        return Some((*delta, Some(row.stop_id.clone())));
    }

    for variant in expand_stop_id_variants(&row.stop_id) {
        let variant = CompactString::from(variant);
        let key = (row.trip_id.clone(), variant.clone(), row.service_date);
        if let Some(delta) = index.by_trip_stop.get(&key) {
            return Some((*delta, Some(variant)));
        }
    }

    let fallback = index.trip_fallback_by_trip_start.get(&TripStartKey {
        trip_id: row.trip_id.clone(),
        service_date: row.service_date,
    })?;

    let nearest = fallback
        .iter()
        .filter_map(|update| {
            let stop_sequence = update.stop_sequence?;
            let gap = stop_sequence.abs_diff(row.stop_sequence);
            (gap <= config.fallback_max_sequence_gap).then_some((gap, update))
        })
        .min_by_key(|(gap, _)| *gap)?;

    // Fallback matches only ever contribute the delay field; a neighbor
    // stop's literal departure time (and stop id) is meaningless here.
    let delay_sec = nearest.1.delay_sec?;
    Some((
        StopTimeDelta {
            delay_sec: Some(delay_sec),
            delay_min: Some(clamp_delay_min(delay_sec as i64)),
            updated_departure_epoch: None,
        },
        None,
    ))
}

/// An updated departure instant always wins over a delay field; a delay
/// field is applied from the scheduled time, never from a previous merge
/// result, so repeated application is stable. Returns whether the row was
/// touched; an unrepresentable departure epoch discards the whole update.
fn apply_delta(row: &mut ScheduledDepartureRow, delta: &StopTimeDelta, config: &BoardConfig) -> bool {
    if let Some(epoch) = delta.updated_departure_epoch {
        let Some(updated_departure) = datetime_from_epoch(epoch) else {
            tracing::debug!(
                trip_id = %row.trip_id,
                stop_id = %row.stop_id,
                epoch,
                "unrepresentable departure epoch, ignoring update"
            );
            return false;
        };

        let diff_sec = epoch - row.scheduled_departure.timestamp();

        // The realtime instant is kept literal even when earlier than
        // scheduled; only the displayed delay is floored.
        row.realtime_departure = updated_departure;
        row.delay_min = clamp_delay_min(diff_sec);

        if diff_sec <= -config.early_jitter_window_sec {
            tracing::debug!(
                trip_id = %row.trip_id,
                stop_id = %row.stop_id,
                diff_sec,
                "departure reported earlier than schedule beyond jitter window"
            );
        }
        true
    } else if let Some(delay_sec) = delta.delay_sec {
        row.realtime_departure = row.scheduled_departure + Duration::seconds(delay_sec as i64);
        row.delay_min = clamp_delay_min(delay_sec as i64);
        true
    } else {
        false
    }
}

fn apply_platform(
    row: &mut ScheduledDepartureRow,
    assigned_stop_id: &str,
    platform_by_stop_id: &AHashMap<String, String>,
) {
    let platform = platform_by_stop_id
        .get(assigned_stop_id)
        .cloned()
        .unwrap_or_else(|| assigned_stop_id.to_string());

    if row.platform.as_deref() != Some(platform.as_str()) {
        row.platform = Some(platform);
        row.platform_changed = true;
    }
}

/// Builds replacement departure rows from ADDED trips touching the
/// station. Departures already gone beyond the grace period or further out
/// than the synthesis window are dropped; the result is departure-sorted
/// and capped.
pub fn apply_added_trips(
    index: &TripUpdateIndex,
    station_stop_ids: &[String],
    now: DateTime<Utc>,
    config: &BoardConfig,
) -> Vec<ScheduledDepartureRow> {
    let expanded_scope = expand_stop_id_scope(station_stop_ids.iter());
    let earliest = now.timestamp() - config.departed_grace_sec;
    let latest = now.timestamp() + config.added_trip_window_minutes * 60;

    let mut rows: Vec<ScheduledDepartureRow> = index
        .added_trip_stop_updates
        .iter()
        .filter(|update| {
            expanded_scope.contains(update.stop_id.as_str())
                || expanded_scope.contains(stop_id_root(&update.stop_id))
        })
        .filter_map(|update| {
            let departure_epoch = update.departure_epoch?;
            if departure_epoch < earliest || departure_epoch > latest {
                return None;
            }

            let departure = datetime_from_epoch(departure_epoch)?;
            let service_date = update
                .trip_start_date
                .unwrap_or_else(|| now.with_timezone(&config.timezone).date_naive());

            let mut row = ScheduledDepartureRow::scheduled(
                &update.trip_id,
                update.stop_id.as_str(),
                update.stop_sequence.unwrap_or(0),
                service_date,
                departure,
            );
            row.number = update.route_id.clone();
            row.source = RowSource::RtAdded;
            row.tag("replacement");
            Some(row)
        })
        .collect();

    rows.sort_by_key(|row| row.realtime_departure);
    rows.truncate(config.added_trip_limit);
    rows
}

/// Synthesizes departure rows from free-text service alerts that describe
/// a concrete departure. Both a relevance signal (informed entity or
/// station name in the text) and a timing signal (an attached departure
/// time or a clock time in the text) are required; either alone never
/// produces a row.
pub fn synthesize_from_alerts(
    alerts: &[BoardAlert],
    stop_scope: &[String],
    route_scope: &[String],
    station_name: &str,
    service_date: NaiveDate,
    now: DateTime<Utc>,
    config: &BoardConfig,
) -> Vec<ScheduledDepartureRow> {
    let expanded_scope = expand_stop_id_scope(stop_scope.iter());
    let earliest = now - Duration::seconds(config.departed_grace_sec);
    let fallback_stop_id = stop_scope.first().cloned().unwrap_or_default();

    alerts
        .iter()
        .filter_map(|alert| {
            let matched_stop = alert_relevance(alert, &expanded_scope, route_scope, station_name)?;
            let departure = alert_departure_time(alert, service_date, config)?;
            if departure < earliest {
                return None;
            }

            let stop_id = matched_stop.unwrap_or_else(|| fallback_stop_id.clone());
            let trip_id = format!("alert-{}", alert.id);

            let mut row =
                ScheduledDepartureRow::scheduled(&trip_id, &stop_id, 0, service_date, departure);
            row.source = RowSource::SyntheticAlert;
            row.tag("alert_derived");
            Some(row)
        })
        .collect()
}

/// Keeps only the alerts that concern this station, whether or not they
/// carry enough timing detail to synthesize a departure row from.
pub fn filter_relevant_alerts(
    alerts: &[BoardAlert],
    stop_scope: &[String],
    route_scope: &[String],
    station_name: &str,
) -> Vec<BoardAlert> {
    let expanded_scope = expand_stop_id_scope(stop_scope.iter());
    alerts
        .iter()
        .filter(|alert| alert_relevance(alert, &expanded_scope, route_scope, station_name).is_some())
        .cloned()
        .collect()
}

/// `Some(matched_stop)` when the alert concerns this station, `None`
/// otherwise. The inner option carries the matched stop id when the
/// relevance came from an informed entity.
fn alert_relevance(
    alert: &BoardAlert,
    expanded_scope: &ahash::AHashSet<String>,
    route_scope: &[String],
    station_name: &str,
) -> Option<Option<String>> {
    for entity in &alert.informed_entity {
        if let Some(stop_id) = &entity.stop_id {
            if expanded_scope.contains(stop_id) || expanded_scope.contains(stop_id_root(stop_id)) {
                return Some(Some(stop_id.clone()));
            }
        }
        if let Some(route_id) = &entity.route_id {
            if route_scope.iter().any(|r| r == route_id) {
                return Some(None);
            }
        }
    }

    // Untargeted alerts still count when the text names the station.
    if alert.informed_entity.is_empty() && !station_name.is_empty() {
        let station_lower = station_name.to_lowercase();
        let mentions = |text: &Option<String>| {
            text.as_ref()
                .is_some_and(|t| t.to_lowercase().contains(&station_lower))
        };
        if mentions(&alert.header_text) || mentions(&alert.description_text) {
            return Some(None);
        }
    }

    None
}

fn alert_departure_time(
    alert: &BoardAlert,
    service_date: NaiveDate,
    config: &BoardConfig,
) -> Option<DateTime<Utc>> {
    if let Some(epoch) = alert.departure_time {
        return datetime_from_epoch(epoch);
    }

    let text = alert
        .header_text
        .as_deref()
        .into_iter()
        .chain(alert.description_text.as_deref())
        .collect::<Vec<_>>()
        .join(" ");

    let captures = CLOCK_TIME_RE.captures(&text)?;
    let hour: u32 = captures.get(1)?.as_str().parse().ok()?;
    let minute: u32 = captures.get(2)?.as_str().parse().ok()?;

    // Clock times in alert prose are local to the network's timezone.
    let local = service_date.and_hms_opt(hour, minute, 0)?;
    match config.timezone.from_local_datetime(&local) {
        chrono::LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        chrono::LocalResult::Ambiguous(dt, _) => Some(dt.with_timezone(&Utc)),
        chrono::LocalResult::None => None,
    }
}
