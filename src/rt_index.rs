// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

//! Canonical internal shapes for GTFS-RT content, plus the trip-update
//! index the reconciliation engine matches against.
//!
//! Everything downstream of the loader only ever sees these types; raw
//! protobuf field variants are normalized here, at the ingestion boundary.

use ahash::AHashMap;
use ahash::AHashSet;
use chrono::NaiveDate;
use compact_str::CompactString;
use ecow::EcoString;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum BoardTripScheduleRelationship {
    Scheduled = 0,
    Added = 1,
    Unscheduled = 2,
    Cancelled = 3,
    Replacement = 5,
    Duplicated = 6,
    Deleted = 7,
}

pub fn option_i32_to_trip_schedule_relationship(
    schedule_relationship: &Option<i32>,
) -> Option<BoardTripScheduleRelationship> {
    match schedule_relationship {
        Some(status) => match status {
            0 => Some(BoardTripScheduleRelationship::Scheduled),
            1 => Some(BoardTripScheduleRelationship::Added),
            2 => Some(BoardTripScheduleRelationship::Unscheduled),
            3 => Some(BoardTripScheduleRelationship::Cancelled),
            5 => Some(BoardTripScheduleRelationship::Replacement),
            6 => Some(BoardTripScheduleRelationship::Duplicated),
            7 => Some(BoardTripScheduleRelationship::Deleted),
            _ => None,
        },
        None => None,
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum BoardStopTimeScheduleRelationship {
    Scheduled = 0,
    Skipped = 1,
    NoData = 2,
    Unscheduled = 3,
}

pub fn option_i32_to_stop_time_schedule_relationship(
    schedule_relationship: &Option<i32>,
) -> Option<BoardStopTimeScheduleRelationship> {
    match schedule_relationship {
        Some(status) => match status {
            0 => Some(BoardStopTimeScheduleRelationship::Scheduled),
            1 => Some(BoardStopTimeScheduleRelationship::Skipped),
            2 => Some(BoardStopTimeScheduleRelationship::NoData),
            3 => Some(BoardStopTimeScheduleRelationship::Unscheduled),
            _ => None,
        },
        None => None,
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BoardStopTimeEvent {
    pub delay: Option<i32>,
    pub time: Option<i64>,
}

impl From<&gtfs_realtime::trip_update::StopTimeEvent> for BoardStopTimeEvent {
    fn from(stop_time_event: &gtfs_realtime::trip_update::StopTimeEvent) -> Self {
        BoardStopTimeEvent {
            delay: stop_time_event.delay,
            time: stop_time_event.time,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BoardStopTimeUpdate {
    pub stop_sequence: Option<u32>,
    pub stop_id: Option<EcoString>,
    pub arrival: Option<BoardStopTimeEvent>,
    pub departure: Option<BoardStopTimeEvent>,
    pub schedule_relationship: Option<BoardStopTimeScheduleRelationship>,
    pub assigned_stop_id: Option<EcoString>,
}

impl From<&gtfs_realtime::trip_update::StopTimeUpdate> for BoardStopTimeUpdate {
    fn from(stop_time_update: &gtfs_realtime::trip_update::StopTimeUpdate) -> Self {
        BoardStopTimeUpdate {
            stop_sequence: stop_time_update.stop_sequence,
            stop_id: stop_time_update.stop_id.as_deref().map(EcoString::from),
            arrival: stop_time_update.arrival.as_ref().map(|x| x.into()),
            departure: stop_time_update.departure.as_ref().map(|x| x.into()),
            schedule_relationship: option_i32_to_stop_time_schedule_relationship(
                &stop_time_update.schedule_relationship,
            ),
            assigned_stop_id: stop_time_update
                .stop_time_properties
                .as_ref()
                .and_then(|p| p.assigned_stop_id.as_deref())
                .map(EcoString::from),
        }
    }
}

/// One trip update in canonical form, whichever representation it came from.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BoardTripUpdate {
    pub trip_id: Option<CompactString>,
    pub route_id: Option<CompactString>,
    pub start_date: Option<NaiveDate>,
    pub start_time: Option<String>,
    pub schedule_relationship: Option<BoardTripScheduleRelationship>,
    pub delay: Option<i32>,
    pub timestamp: Option<u64>,
    pub stop_time_update: Vec<BoardStopTimeUpdate>,
}

impl From<&gtfs_realtime::TripUpdate> for BoardTripUpdate {
    fn from(trip_update: &gtfs_realtime::TripUpdate) -> Self {
        BoardTripUpdate {
            trip_id: trip_update.trip.trip_id.as_deref().map(CompactString::from),
            route_id: trip_update
                .trip
                .route_id
                .as_deref()
                .map(CompactString::from),
            start_date: trip_update
                .trip
                .start_date
                .as_deref()
                .and_then(|date| NaiveDate::parse_from_str(date, "%Y%m%d").ok()),
            start_time: trip_update.trip.start_time.clone(),
            schedule_relationship: option_i32_to_trip_schedule_relationship(
                &trip_update.trip.schedule_relationship,
            ),
            delay: trip_update.delay,
            timestamp: trip_update.timestamp,
            stop_time_update: trip_update
                .stop_time_update
                .iter()
                .map(|x| x.into())
                .collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct BoardTimeRange {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
pub struct BoardEntitySelector {
    pub agency_id: Option<String>,
    pub route_id: Option<String>,
    pub stop_id: Option<String>,
    pub trip_id: Option<String>,
}

impl From<&gtfs_realtime::EntitySelector> for BoardEntitySelector {
    fn from(entity_selector: &gtfs_realtime::EntitySelector) -> Self {
        BoardEntitySelector {
            agency_id: entity_selector.agency_id.clone(),
            route_id: entity_selector.route_id.clone(),
            stop_id: entity_selector.stop_id.clone(),
            trip_id: entity_selector
                .trip
                .as_ref()
                .and_then(|t| t.trip_id.clone()),
        }
    }
}

fn first_translation(translated: &Option<gtfs_realtime::TranslatedString>) -> Option<String> {
    translated
        .as_ref()
        .and_then(|t| t.translation.first())
        .map(|t| t.text.clone())
}

/// One service alert in canonical form. Translations are flattened to the
/// first entry; `departure_time` is only populated by the parsed-table
/// backend, where poller-side extraction may have attached one.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BoardAlert {
    pub id: String,
    pub active_period: Vec<BoardTimeRange>,
    pub informed_entity: Vec<BoardEntitySelector>,
    pub cause: Option<i32>,
    pub effect: Option<i32>,
    pub header_text: Option<String>,
    pub description_text: Option<String>,
    pub departure_time: Option<i64>,
}

impl BoardAlert {
    pub fn from_feed(id: &str, alert: &gtfs_realtime::Alert) -> Self {
        let header_text = first_translation(&alert.header_text);
        let mut description_text = first_translation(&alert.description_text);

        // Some agencies repeat the header verbatim in the description.
        if header_text.is_some() && header_text == description_text {
            description_text = None;
        }

        BoardAlert {
            id: id.to_string(),
            active_period: alert
                .active_period
                .iter()
                .map(|range| BoardTimeRange {
                    start: range.start,
                    end: range.end,
                })
                .collect(),
            informed_entity: alert.informed_entity.iter().map(|x| x.into()).collect(),
            cause: alert.cause,
            effect: alert.effect,
            header_text,
            description_text,
            departure_time: None,
        }
    }

    /// Active when any period contains `now`, or when no periods are given.
    pub fn is_active(&self, now_epoch: u64) -> bool {
        if self.active_period.is_empty() {
            return true;
        }

        self.active_period.iter().any(|period| {
            period.start.map(|s| s <= now_epoch).unwrap_or(true)
                && period.end.map(|e| now_epoch <= e).unwrap_or(true)
        })
    }
}

/// Exact merge key: one scheduled stop call of one trip on one service day.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UpdateKey {
    pub trip_id: CompactString,
    pub stop_id: CompactString,
    pub stop_sequence: u32,
    pub service_date: NaiveDate,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TripStartKey {
    pub trip_id: CompactString,
    pub service_date: NaiveDate,
}

/// Realtime departure delta for one stop call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StopTimeDelta {
    pub delay_sec: Option<i32>,
    pub delay_min: Option<i64>,
    pub updated_departure_epoch: Option<i64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StopStatus {
    pub relationship: BoardStopTimeScheduleRelationship,
    pub updated_departure_epoch: Option<i64>,
    pub assigned_stop_id: Option<EcoString>,
}

/// Span of suppressed stop_sequences on a trip, for short-turn tagging.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TripSkipSpan {
    pub min_skipped_sequence: u32,
    pub max_skipped_sequence: u32,
}

impl TripSkipSpan {
    fn observe(&mut self, stop_sequence: u32) {
        self.min_skipped_sequence = self.min_skipped_sequence.min(stop_sequence);
        self.max_skipped_sequence = self.max_skipped_sequence.max(stop_sequence);
    }
}

/// Per-stop update kept for trip-level fallback matching, ordered by
/// stop_sequence.
#[derive(Clone, Debug, PartialEq)]
pub struct FallbackStopUpdate {
    pub stop_sequence: Option<u32>,
    pub stop_id: Option<EcoString>,
    pub delay_sec: Option<i32>,
    pub updated_departure_epoch: Option<i64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AddedTripStopUpdate {
    pub trip_id: CompactString,
    pub route_id: Option<CompactString>,
    pub stop_id: EcoString,
    pub stop_sequence: Option<u32>,
    pub departure_epoch: Option<i64>,
    pub delay_sec: Option<i32>,
    pub trip_start_date: Option<NaiveDate>,
}

/// Display delay: minutes, rounded, floored at zero. Small early jitter
/// therefore shows as 0 while `realtime_departure` keeps the literal time.
pub fn clamp_delay_min(diff_sec: i64) -> i64 {
    let rounded = (diff_sec as f64 / 60.0).round() as i64;
    rounded.max(0)
}

/// Normalized lookup structure the reconciliation engine matches against.
///
/// Both loader backends feed the same builder, so an equivalent feed
/// produces an identical index whichever representation it came from.
#[derive(Clone, Debug, Default)]
pub struct TripUpdateIndex {
    pub by_key: AHashMap<UpdateKey, StopTimeDelta>,
    pub by_trip_stop: AHashMap<(CompactString, CompactString, NaiveDate), StopTimeDelta>,
    pub trip_fallback_by_trip_start: AHashMap<TripStartKey, Vec<FallbackStopUpdate>>,
    pub cancelled_trip_ids: AHashSet<CompactString>,
    pub stop_status_by_key: AHashMap<UpdateKey, StopStatus>,
    pub stop_status_by_trip_stop: AHashMap<(CompactString, CompactString, NaiveDate), StopStatus>,
    pub trip_flags_by_trip_id: AHashMap<CompactString, TripSkipSpan>,
    pub trip_flags_by_trip_start: AHashMap<TripStartKey, TripSkipSpan>,
    pub added_trip_stop_updates: Vec<AddedTripStopUpdate>,
}

impl TripUpdateIndex {
    pub fn new() -> Self {
        TripUpdateIndex::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
            && self.by_trip_stop.is_empty()
            && self.trip_fallback_by_trip_start.is_empty()
            && self.cancelled_trip_ids.is_empty()
            && self.stop_status_by_key.is_empty()
            && self.added_trip_stop_updates.is_empty()
    }

    /// Ingests one scheduled-trip update. ADDED trips go through
    /// [`TripUpdateIndex::add_added_trip`] instead.
    pub fn add_trip_update(
        &mut self,
        trip_update: &BoardTripUpdate,
        default_service_date: NaiveDate,
        window: Option<(i64, i64)>,
    ) {
        let trip_id = match &trip_update.trip_id {
            Some(trip_id) => trip_id.clone(),
            None => return,
        };

        let service_date = trip_update.start_date.unwrap_or(default_service_date);
        let trip_start_key = TripStartKey {
            trip_id: trip_id.clone(),
            service_date,
        };

        if trip_update.schedule_relationship == Some(BoardTripScheduleRelationship::Cancelled)
            || trip_update.schedule_relationship == Some(BoardTripScheduleRelationship::Deleted)
        {
            self.cancelled_trip_ids.insert(trip_id.clone());
        }

        for stop_time_update in &trip_update.stop_time_update {
            let relationship = stop_time_update
                .schedule_relationship
                .unwrap_or(BoardStopTimeScheduleRelationship::Scheduled);

            let updated_departure_epoch = stop_time_update
                .departure
                .as_ref()
                .and_then(|e| e.time)
                .or_else(|| stop_time_update.arrival.as_ref().and_then(|e| e.time));

            let delay_sec = stop_time_update
                .departure
                .as_ref()
                .and_then(|e| e.delay)
                .or_else(|| stop_time_update.arrival.as_ref().and_then(|e| e.delay))
                .or(trip_update.delay);

            if relationship == BoardStopTimeScheduleRelationship::Skipped {
                if let Some(stop_sequence) = stop_time_update.stop_sequence {
                    self.trip_flags_by_trip_id
                        .entry(trip_id.clone())
                        .and_modify(|span| span.observe(stop_sequence))
                        .or_insert(TripSkipSpan {
                            min_skipped_sequence: stop_sequence,
                            max_skipped_sequence: stop_sequence,
                        });
                    self.trip_flags_by_trip_start
                        .entry(trip_start_key.clone())
                        .and_modify(|span| span.observe(stop_sequence))
                        .or_insert(TripSkipSpan {
                            min_skipped_sequence: stop_sequence,
                            max_skipped_sequence: stop_sequence,
                        });
                }
            }

            if let Some(stop_id) = &stop_time_update.stop_id {
                let stop_id = CompactString::from(stop_id.as_str());

                // An ordinary delayed stop call may still carry a platform
                // reassignment; the status has to exist for it to surface.
                if relationship != BoardStopTimeScheduleRelationship::Scheduled
                    || stop_time_update.assigned_stop_id.is_some()
                {
                    let status = StopStatus {
                        relationship,
                        updated_departure_epoch,
                        assigned_stop_id: stop_time_update.assigned_stop_id.clone(),
                    };

                    if let Some(stop_sequence) = stop_time_update.stop_sequence {
                        self.stop_status_by_key.insert(
                            UpdateKey {
                                trip_id: trip_id.clone(),
                                stop_id: stop_id.clone(),
                                stop_sequence,
                                service_date,
                            },
                            status.clone(),
                        );
                    }

                    self.stop_status_by_trip_stop.insert(
                        (trip_id.clone(), stop_id.clone(), service_date),
                        status,
                    );
                }

                // SKIPPED and NO_DATA stops never contribute a delta.
                if relationship == BoardStopTimeScheduleRelationship::Skipped
                    || relationship == BoardStopTimeScheduleRelationship::NoData
                {
                    continue;
                }

                if let (Some((window_start, window_end)), Some(epoch)) =
                    (window, updated_departure_epoch)
                {
                    if epoch < window_start || epoch > window_end {
                        continue;
                    }
                }

                if updated_departure_epoch.is_none() && delay_sec.is_none() {
                    continue;
                }

                let delta = StopTimeDelta {
                    delay_sec,
                    delay_min: delay_sec.map(|d| clamp_delay_min(d as i64)),
                    updated_departure_epoch,
                };

                if let Some(stop_sequence) = stop_time_update.stop_sequence {
                    self.by_key.insert(
                        UpdateKey {
                            trip_id: trip_id.clone(),
                            stop_id: stop_id.clone(),
                            stop_sequence,
                            service_date,
                        },
                        delta,
                    );
                }

                self.by_trip_stop
                    .insert((trip_id.clone(), stop_id, service_date), delta);

                self.trip_fallback_by_trip_start
                    .entry(trip_start_key.clone())
                    .or_default()
                    .push(FallbackStopUpdate {
                        stop_sequence: stop_time_update.stop_sequence,
                        stop_id: stop_time_update.stop_id.clone(),
                        delay_sec,
                        updated_departure_epoch,
                    });
            }
        }

        if let Some(fallback) = self.trip_fallback_by_trip_start.get_mut(&trip_start_key) {
            fallback.sort_by_key(|update| update.stop_sequence);
        }
    }

    /// Ingests an ADDED trip already scope-checked by the loader. SKIPPED
    /// stop updates are excluded here so they can never be synthesized.
    pub fn add_added_trip(&mut self, trip_update: &BoardTripUpdate) {
        let trip_id = match &trip_update.trip_id {
            Some(trip_id) => trip_id.clone(),
            None => return,
        };

        for stop_time_update in &trip_update.stop_time_update {
            if stop_time_update.schedule_relationship
                == Some(BoardStopTimeScheduleRelationship::Skipped)
            {
                continue;
            }

            let stop_id = match &stop_time_update.stop_id {
                Some(stop_id) => stop_id.clone(),
                None => continue,
            };

            self.added_trip_stop_updates.push(AddedTripStopUpdate {
                trip_id: trip_id.clone(),
                route_id: trip_update.route_id.clone(),
                stop_id,
                stop_sequence: stop_time_update.stop_sequence,
                departure_epoch: stop_time_update
                    .departure
                    .as_ref()
                    .and_then(|e| e.time)
                    .or_else(|| stop_time_update.arrival.as_ref().and_then(|e| e.time)),
                delay_sec: stop_time_update
                    .departure
                    .as_ref()
                    .and_then(|e| e.delay)
                    .or(trip_update.delay),
                trip_start_date: trip_update.start_date,
            });
        }
    }
}
