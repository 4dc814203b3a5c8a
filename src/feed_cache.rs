// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

//! Process-wide cache of decoded GTFS-RT feeds.
//!
//! One entry per feed key, identified by an identity token taken from a
//! single store read so etag and fetched_at can never be compared across
//! reads. Concurrent readers of a feed whose payload is being refetched
//! coalesce onto one outstanding fetch+decode; exactly one of them is
//! billed the payload read.
//!
//! Constructed once per process and passed by reference into request
//! handlers; there is no hidden global.

use crate::store::{CacheMeta, CacheStore, StoreError};
use ahash::AHashMap;
use chrono::DateTime;
use chrono::Utc;
use gtfs_realtime::FeedMessage;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::watch;

/// Preference order: etag over payload sha over fetched_at. Both sides of
/// a comparison always originate from one atomic store read each.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedIdentityToken {
    Etag(String),
    PayloadSha(String),
    FetchedAt(i64),
}

impl FeedIdentityToken {
    pub fn from_meta(meta: &CacheMeta, payload_sha: Option<&str>) -> Self {
        if let Some(etag) = &meta.etag {
            return FeedIdentityToken::Etag(etag.clone());
        }
        if let Some(sha) = payload_sha {
            return FeedIdentityToken::PayloadSha(sha.to_string());
        }
        FeedIdentityToken::FetchedAt(meta.fetched_at.timestamp_millis())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReadSource {
    Memory,
    Payload,
    Table,
}

#[derive(Clone, Debug)]
pub struct DecodedFeedEntry {
    pub feed: Arc<FeedMessage>,
    pub token: FeedIdentityToken,
    pub decoded_at: DateTime<Utc>,
    pub decode_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum FeedCacheError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("payload missing from cache")]
    PayloadMissing,
    #[error("payload failed to decode: {0}")]
    Decode(String),
}

/// Clonable error shape for sharing an outcome across coalesced waiters.
#[derive(Clone, Debug)]
enum SharedFetchError {
    Store(String),
    PayloadMissing,
    Decode(String),
}

impl From<&FeedCacheError> for SharedFetchError {
    fn from(err: &FeedCacheError) -> Self {
        match err {
            FeedCacheError::Store(e) => SharedFetchError::Store(e.to_string()),
            FeedCacheError::PayloadMissing => SharedFetchError::PayloadMissing,
            FeedCacheError::Decode(msg) => SharedFetchError::Decode(msg.clone()),
        }
    }
}

impl From<SharedFetchError> for FeedCacheError {
    fn from(err: SharedFetchError) -> Self {
        match err {
            SharedFetchError::Store(msg) => FeedCacheError::Store(StoreError::Unavailable(msg)),
            SharedFetchError::PayloadMissing => FeedCacheError::PayloadMissing,
            SharedFetchError::Decode(msg) => FeedCacheError::Decode(msg),
        }
    }
}

type FetchOutcome = Result<DecodedFeedEntry, SharedFetchError>;

#[derive(Clone, Debug)]
pub struct FeedCacheHit {
    pub entry: DecodedFeedEntry,
    pub read_source: ReadSource,
    pub payload_fetch_count: u32,
}

#[derive(Default)]
struct FeedCacheState {
    entries: AHashMap<String, DecodedFeedEntry>,
    in_flight: AHashMap<String, watch::Receiver<Option<FetchOutcome>>>,
}

#[derive(Default)]
pub struct DecodedFeedCache {
    state: Mutex<FeedCacheState>,
}

enum FetchRole {
    Hit(DecodedFeedEntry),
    Follower(watch::Receiver<Option<FetchOutcome>>),
    Creator(watch::Sender<Option<FetchOutcome>>),
}

/// Clears the in-flight marker for a key when its creator finishes,
/// including when the creator future is dropped mid-fetch. Without this,
/// every later caller would join a closed channel until an invalidate.
struct InFlightGuard<'a> {
    cache: &'a DecodedFeedCache,
    feed_key: &'a str,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.cache.state.lock().unwrap();
        state.in_flight.remove(self.feed_key);
    }
}

impl DecodedFeedCache {
    pub fn new() -> Self {
        DecodedFeedCache::default()
    }

    /// Cheap hit check against the stored identity token. No payload I/O.
    pub fn lookup(&self, feed_key: &str, token: &FeedIdentityToken) -> Option<DecodedFeedEntry> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .get(feed_key)
            .filter(|entry| entry.token == *token)
            .cloned()
    }

    /// Returns the cached decoded feed when the identity token is
    /// unchanged; otherwise fetches and decodes the payload, sharing one
    /// outstanding fetch across all concurrent callers for the key.
    pub async fn fetch_or_join<S: CacheStore>(
        &self,
        store: &S,
        feed_key: &str,
        token: &FeedIdentityToken,
    ) -> Result<FeedCacheHit, FeedCacheError> {
        let role = {
            let mut state = self.state.lock().unwrap();

            if let Some(entry) = state
                .entries
                .get(feed_key)
                .filter(|entry| entry.token == *token)
            {
                FetchRole::Hit(entry.clone())
            } else if let Some(rx) = state.in_flight.get(feed_key) {
                FetchRole::Follower(rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                state.in_flight.insert(feed_key.to_string(), rx);
                FetchRole::Creator(tx)
            }
        };

        match role {
            FetchRole::Hit(entry) => Ok(FeedCacheHit {
                entry,
                read_source: ReadSource::Memory,
                payload_fetch_count: 0,
            }),
            FetchRole::Follower(mut rx) => {
                let outcome = match rx.wait_for(|value| value.is_some()).await {
                    Ok(value) => value.clone(),
                    Err(_) => {
                        return Err(FeedCacheError::Store(StoreError::Unavailable(
                            "coalesced payload fetch abandoned".to_string(),
                        )));
                    }
                };

                match outcome {
                    Some(Ok(entry)) => Ok(FeedCacheHit {
                        entry,
                        read_source: ReadSource::Memory,
                        payload_fetch_count: 0,
                    }),
                    Some(Err(shared)) => Err(shared.into()),
                    None => Err(FeedCacheError::Store(StoreError::Unavailable(
                        "coalesced payload fetch abandoned".to_string(),
                    ))),
                }
            }
            FetchRole::Creator(tx) => {
                let _in_flight = InFlightGuard {
                    cache: self,
                    feed_key,
                };

                let result = self.fetch_and_decode(store, feed_key).await;

                if let Ok(entry) = &result {
                    let mut state = self.state.lock().unwrap();
                    state.entries.insert(feed_key.to_string(), entry.clone());
                }

                let shared: FetchOutcome = match &result {
                    Ok(entry) => Ok(entry.clone()),
                    Err(err) => Err(err.into()),
                };
                let _ = tx.send(Some(shared));

                result.map(|entry| FeedCacheHit {
                    entry,
                    read_source: ReadSource::Payload,
                    payload_fetch_count: 1,
                })
            }
        }
    }

    async fn fetch_and_decode<S: CacheStore>(
        &self,
        store: &S,
        feed_key: &str,
    ) -> Result<DecodedFeedEntry, FeedCacheError> {
        let payload = store
            .get_cache_payload(feed_key)
            .await?
            .ok_or(FeedCacheError::PayloadMissing)?;

        let decode_started = Instant::now();
        let feed = crate::parse_gtfs_rt_message(&payload.payload)
            .map_err(|e| FeedCacheError::Decode(e.to_string()))?;
        let decode_ms = decode_started.elapsed().as_millis() as u64;

        // Token components come from the payload read itself, never mixed
        // with the earlier metadata read.
        let token = match &payload.etag {
            Some(etag) => FeedIdentityToken::Etag(etag.clone()),
            None => match store.get_payload_sha(feed_key).await {
                Ok(Some(sha)) => FeedIdentityToken::PayloadSha(sha),
                _ => FeedIdentityToken::FetchedAt(payload.fetched_at.timestamp_millis()),
            },
        };

        tracing::debug!(feed_key, decode_ms, "decoded realtime payload");

        Ok(DecodedFeedEntry {
            feed: Arc::new(feed),
            token,
            decoded_at: Utc::now(),
            decode_ms,
        })
    }

    /// Test hook: drop one feed entry regardless of identity comparison.
    pub fn invalidate(&self, feed_key: &str) {
        let mut state = self.state.lock().unwrap();
        state.entries.remove(feed_key);
    }

    /// Test hook: drop everything.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.entries.clear();
    }
}
