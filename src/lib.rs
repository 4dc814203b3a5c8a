// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

#![deny(
    clippy::mutable_key_type,
    clippy::map_entry,
    clippy::boxed_local,
    clippy::let_unit_value,
    clippy::redundant_allocation,
    clippy::bool_comparison,
    clippy::bind_instead_of_map,
    clippy::vec_box,
    clippy::while_let_loop,
    clippy::useless_asref,
    clippy::repeat_once,
    clippy::deref_addrof,
    clippy::suspicious_map,
    clippy::single_char_pattern,
    clippy::for_kv_map,
    clippy::let_and_return,
    clippy::iter_nth,
    clippy::iter_cloned_collect,
    clippy::match_result_ok,
    clippy::cmp_owned,
    clippy::op_ref
)]

#[macro_use]
extern crate serde;

pub mod budget;
pub mod config;
pub mod feed_cache;
pub mod loader;
pub mod models;
pub mod pipeline;
pub mod reconcile;
pub mod rt_index;
pub mod store;

use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn duration_since_unix_epoch() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap()
}

/// `None` when the epoch falls outside chrono's representable range, so a
/// garbage feed timestamp is dropped rather than rendered as a departure.
pub fn datetime_from_epoch(epoch_sec: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(epoch_sec, 0).single()
}

pub fn parse_gtfs_rt_message(
    bytes: &[u8],
) -> Result<gtfs_realtime::FeedMessage, prost::DecodeError> {
    prost::Message::decode(bytes)
}

/// Station-level root of a platform-scoped stop id.
///
/// Swiss-style ids carry the platform as trailing colon segments,
/// e.g. `8587387:0:A` is platform A of station `8587387`.
pub fn stop_id_root(stop_id: &str) -> &str {
    match stop_id.find(':') {
        Some(idx) => &stop_id[..idx],
        None => stop_id,
    }
}

/// Expands a stop id into the set of ids a realtime feed may use for it:
/// the id itself, every truncation of trailing `:` segments, and the bare
/// station root. `8503000:0:1` yields `8503000:0:1`, `8503000:0`, `8503000`.
pub fn expand_stop_id_variants(stop_id: &str) -> Vec<String> {
    let mut variants = vec![stop_id.to_string()];

    let mut remainder = stop_id;
    while let Some(idx) = remainder.rfind(':') {
        remainder = &remainder[..idx];
        if !remainder.is_empty() {
            variants.push(remainder.to_string());
        }
    }

    variants.dedup();
    variants
}

/// Expands a whole scope set at once, for membership tests against raw
/// feed stop ids.
pub fn expand_stop_id_scope<'a, I: IntoIterator<Item = &'a String>>(
    stop_ids: I,
) -> ahash::AHashSet<String> {
    let mut expanded = ahash::AHashSet::new();

    for stop_id in stop_ids {
        for variant in expand_stop_id_variants(stop_id) {
            expanded.insert(variant);
        }
    }

    expanded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datetime_from_epoch_rejects_out_of_range() {
        assert!(datetime_from_epoch(1_762_164_000).is_some());
        assert!(datetime_from_epoch(i64::MAX).is_none());
        assert!(datetime_from_epoch(i64::MIN).is_none());
    }

    #[test]
    fn test_stop_id_root() {
        assert_eq!(stop_id_root("8587387:0:A"), "8587387");
        assert_eq!(stop_id_root("8587387"), "8587387");
    }

    #[test]
    fn test_expand_stop_id_variants() {
        assert_eq!(
            expand_stop_id_variants("8503000:0:1"),
            vec![
                "8503000:0:1".to_string(),
                "8503000:0".to_string(),
                "8503000".to_string()
            ]
        );
        assert_eq!(
            expand_stop_id_variants("8503000"),
            vec!["8503000".to_string()]
        );
    }

    #[test]
    fn test_expand_scope_matches_bare_parent() {
        let scope = vec!["8587387:0:A".to_string()];
        let expanded = expand_stop_id_scope(scope.iter());
        assert!(expanded.contains("8587387"));
        assert!(expanded.contains("8587387:0"));
        assert!(!expanded.contains("8587388"));
    }
}
