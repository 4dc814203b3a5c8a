// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

//! Injected cache-store boundary. The poller process owns the tables; this
//! crate only ever reads them, through this trait, so the whole merge path
//! is testable without a live database.

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("backing relation missing: {0}")]
    RelationMissing(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Cheap per-feed metadata. Never touches the payload blob.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct CacheMeta {
    pub fetched_at: DateTime<Utc>,
    pub etag: Option<String>,
    pub last_status: Option<i32>,
    pub last_error: Option<String>,
    pub payload_bytes: i64,
}

/// Full payload read, with the identity pair taken in the same row read.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct CachePayload {
    pub payload: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
    pub etag: Option<String>,
    pub last_status: Option<i32>,
}

/// One flattened stop-time update row from the parsed-table backend.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct RtStopTimeRow {
    pub trip_id: String,
    pub route_id: Option<String>,
    pub stop_id: String,
    pub stop_sequence: Option<i32>,
    pub service_date: Option<NaiveDate>,
    pub departure_time: Option<DateTime<Utc>>,
    pub delay_sec: Option<i32>,
    pub schedule_relationship: Option<i16>,
    pub trip_schedule_relationship: Option<i16>,
    pub assigned_stop_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// One flattened service-alert row from the parsed-table backend.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct RtAlertRow {
    pub alert_id: String,
    pub header: Option<String>,
    pub description: Option<String>,
    pub stop_ids: Vec<String>,
    pub route_ids: Vec<String>,
    pub departure_time: Option<DateTime<Utc>>,
    pub active_start: Option<DateTime<Utc>>,
    pub active_end: Option<DateTime<Utc>>,
}

#[allow(async_fn_in_trait)]
pub trait CacheStore {
    async fn get_cache_meta(&self, feed_key: &str) -> Result<Option<CacheMeta>, StoreError>;

    async fn get_cache_payload(&self, feed_key: &str)
    -> Result<Option<CachePayload>, StoreError>;

    async fn get_payload_sha(&self, feed_key: &str) -> Result<Option<String>, StoreError>;

    async fn get_last_successful_poll_at(
        &self,
        feed_key: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Stop-scoped trip-update rows, bounded by `updated_since` so the
    /// query never degenerates into a full-table scan.
    async fn query_trip_update_rows(
        &self,
        feed_key: &str,
        stop_ids: &[String],
        updated_since: DateTime<Utc>,
    ) -> Result<Vec<RtStopTimeRow>, StoreError>;

    async fn query_alert_rows(
        &self,
        feed_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RtAlertRow>, StoreError>;
}

/// Production store on the poller's Postgres schema.
#[derive(Clone)]
pub struct PgCacheStore {
    pool: sqlx::PgPool,
}

impl PgCacheStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        PgCacheStore { pool }
    }
}

// Postgres reports a missing relation as SQLSTATE 42P01.
fn map_relation_missing(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("42P01") {
            return StoreError::RelationMissing(db_err.message().to_string());
        }
    }
    StoreError::Database(err)
}

impl CacheStore for PgCacheStore {
    async fn get_cache_meta(&self, feed_key: &str) -> Result<Option<CacheMeta>, StoreError> {
        let meta = sqlx::query_as::<_, CacheMeta>(
            "SELECT fetched_at, etag, last_status, last_error,
                    COALESCE(octet_length(payload), 0)::BIGINT AS payload_bytes
             FROM rt_feed_cache WHERE feed_key = $1",
        )
        .bind(feed_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(meta)
    }

    async fn get_cache_payload(
        &self,
        feed_key: &str,
    ) -> Result<Option<CachePayload>, StoreError> {
        let payload = sqlx::query_as::<_, CachePayload>(
            "SELECT payload, fetched_at, etag, last_status
             FROM rt_feed_cache WHERE feed_key = $1 AND payload IS NOT NULL",
        )
        .bind(feed_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payload)
    }

    async fn get_payload_sha(&self, feed_key: &str) -> Result<Option<String>, StoreError> {
        let sha: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT payload_sha256 FROM rt_feed_cache WHERE feed_key = $1",
        )
        .bind(feed_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(sha.and_then(|row| row.0))
    }

    async fn get_last_successful_poll_at(
        &self,
        feed_key: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let poll: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(
            "SELECT last_successful_poll_at FROM rt_feed_poll_status WHERE feed_key = $1",
        )
        .bind(feed_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(poll.and_then(|row| row.0))
    }

    async fn query_trip_update_rows(
        &self,
        feed_key: &str,
        stop_ids: &[String],
        updated_since: DateTime<Utc>,
    ) -> Result<Vec<RtStopTimeRow>, StoreError> {
        sqlx::query_as::<_, RtStopTimeRow>(
            "SELECT trip_id, route_id, stop_id, stop_sequence, service_date,
                    departure_time, delay_sec, schedule_relationship,
                    trip_schedule_relationship, assigned_stop_id, updated_at
             FROM rt_trip_update_stop_times
             WHERE feed_key = $1 AND stop_id = ANY($2) AND updated_at >= $3",
        )
        .bind(feed_key)
        .bind(stop_ids)
        .bind(updated_since)
        .fetch_all(&self.pool)
        .await
        .map_err(map_relation_missing)
    }

    async fn query_alert_rows(
        &self,
        feed_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RtAlertRow>, StoreError> {
        sqlx::query_as::<_, RtAlertRow>(
            "SELECT alert_id, header, description, stop_ids, route_ids,
                    departure_time, active_start, active_end
             FROM rt_alerts
             WHERE feed_key = $1
               AND (active_start IS NULL OR active_start <= $2)
               AND (active_end IS NULL OR active_end >= $2)",
        )
        .bind(feed_key)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(map_relation_missing)
    }
}
