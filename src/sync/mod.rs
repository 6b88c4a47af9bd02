//! Background publication of the three KV blobs.
//!
//! Two independent periodic workers: a short-cadence realtime aggregation
//! and a daily schedule rebuild. Neither shares state with the other or
//! with request handlers; the KV store is the only thing they touch, and
//! each run either publishes a complete value or leaves the previous one
//! in place.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Utc};
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::kv::{
    KvError, KvStore, PutOptions, REALTIME_STATUS_KEY, SCHEDULE_DATA_KEY, SCHEDULE_META_KEY,
};
use crate::providers::gtfs::error::GtfsError;
use crate::providers::gtfs::realtime::{fetch_feed, merge_feeds, RealtimeStatus};
use crate::providers::gtfs::static_data::{build_schedule, fetch_archive, StaticSchedule};
use crate::providers::gtfs::validate::validate;
use crate::redact::redact_secret;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Gtfs(#[from] GtfsError),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("feed fetch timed out after {0}s")]
    FetchTimeout(u64),
    #[error("schedule failed validation with {0} violation(s)")]
    Validation(usize),
    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Owns the two worker loops. One instance per process; each loop awaits
/// its run before ticking again, so at most one run is in flight.
pub struct SyncManager {
    kv: Arc<dyn KvStore>,
    client: reqwest::Client,
    config: Config,
}

impl SyncManager {
    pub fn new(kv: Arc<dyn KvStore>, config: Config) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(GtfsError::from)?;
        Ok(Self { kv, client, config })
    }

    /// Run both workers forever. The first tick of each interval fires
    /// immediately, so a fresh process builds the schedule and publishes a
    /// realtime status right away.
    pub async fn start(self: Arc<Self>) {
        info!("Starting sync manager");

        let schedule_self = self.clone();
        let schedule_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                schedule_self.config.schedule_sync.interval_secs,
            ));
            loop {
                interval.tick().await;
                schedule_self.run_schedule_sync().await;
            }
        });

        let realtime_self = self.clone();
        let realtime_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                realtime_self.config.realtime_sync.interval_secs,
            ));
            loop {
                interval.tick().await;
                realtime_self.run_realtime_sync().await;
            }
        });

        let _ = tokio::join!(schedule_handle, realtime_handle);
    }

    /// One realtime run. Never panics and never logs the API key; on any
    /// failure the previous status keeps serving until its TTL expires.
    async fn run_realtime_sync(&self) {
        let Some(api_key) = self.config.api_key() else {
            warn!("No upstream API key configured, skipping realtime sync");
            return;
        };
        match self.realtime_tick(api_key).await {
            Ok(feed_timestamp) => {
                info!(feed_timestamp, "Published realtime status");
            }
            Err(e) => {
                error!(
                    error = %redact_secret(&e.to_string(), api_key),
                    "Realtime sync failed, keeping previous status"
                );
            }
        }
    }

    async fn realtime_tick(&self, api_key: &str) -> Result<u64, SyncError> {
        let upstream = &self.config.upstream;
        let trip_updates_url = with_api_key(&upstream.trip_updates_url, api_key);
        let vehicle_positions_url = with_api_key(&upstream.vehicle_positions_url, api_key);
        let alerts_url = with_api_key(&upstream.alerts_url, api_key);

        // One deadline across all three fetches; hitting it cancels
        // whatever is still in flight.
        let budget = self.config.realtime_sync.fetch_timeout_secs;
        let fetches = futures::future::try_join3(
            fetch_feed(&self.client, &trip_updates_url),
            fetch_feed(&self.client, &vehicle_positions_url),
            fetch_feed(&self.client, &alerts_url),
        );
        let (trip_updates, vehicle_positions, alerts) =
            tokio::time::timeout(Duration::from_secs(budget), fetches)
                .await
                .map_err(|_| SyncError::FetchTimeout(budget))??;

        let status = merge_feeds(&trip_updates, &vehicle_positions, &alerts);
        publish_realtime(
            self.kv.as_ref(),
            &status,
            Duration::from_secs(self.config.realtime_sync.ttl_secs),
        )
        .await?;
        Ok(status.timestamp)
    }

    /// One schedule run. A failed fetch, build, or validation keeps
    /// yesterday's bundle serving.
    async fn run_schedule_sync(&self) {
        let Some(api_key) = self.config.api_key() else {
            warn!("No upstream API key configured, skipping schedule sync");
            return;
        };
        match self.schedule_tick(api_key).await {
            Ok(true) => info!("Published new schedule bundle"),
            Ok(false) => info!("Schedule unchanged, nothing published"),
            Err(e) => {
                error!(
                    error = %redact_secret(&e.to_string(), api_key),
                    "Schedule sync failed, keeping previous bundle"
                );
            }
        }
    }

    async fn schedule_tick(&self, api_key: &str) -> Result<bool, SyncError> {
        let url = with_api_key(&self.config.upstream.schedule_url, api_key);
        let bytes = fetch_archive(&self.client, &url).await?;

        let schedule =
            tokio::task::spawn_blocking(move || build_schedule(&bytes)).await??;

        let min_end_date = self
            .config
            .schedule_sync
            .min_calendar_end_date
            .unwrap_or_else(today_yyyymmdd);
        publish_schedule(self.kv.as_ref(), &schedule, min_end_date).await
    }
}

/// Validate and publish a built schedule. Returns false when the stored
/// version already matches (nothing written). Both blobs persist without
/// TTL until the next successful run replaces them.
pub async fn publish_schedule(
    kv: &dyn KvStore,
    schedule: &StaticSchedule,
    min_end_date: u32,
) -> Result<bool, SyncError> {
    let violations = validate(schedule, min_end_date);
    if !violations.is_empty() {
        for violation in &violations {
            error!(violation = %violation, "Schedule validation failed");
        }
        return Err(SyncError::Validation(violations.len()));
    }

    let current_version = match kv.get(SCHEDULE_META_KEY).await? {
        Some(entry) => serde_json::from_slice::<serde_json::Value>(&entry.value)
            .ok()
            .and_then(|meta| meta.get("v").and_then(|v| v.as_str()).map(String::from)),
        None => None,
    };
    if current_version.as_deref() == Some(schedule.meta.version.as_str()) {
        return Ok(false);
    }

    kv.put(
        SCHEDULE_DATA_KEY,
        serde_json::to_vec(schedule)?,
        PutOptions::default(),
    )
    .await?;
    kv.put(
        SCHEDULE_META_KEY,
        serde_json::to_vec(&schedule.meta)?,
        PutOptions::default(),
    )
    .await?;
    Ok(true)
}

/// Publish the merged realtime status with its freshness TTL and the feed
/// timestamp as metadata (the read API derives the ETag from it).
pub async fn publish_realtime(
    kv: &dyn KvStore,
    status: &RealtimeStatus,
    ttl: Duration,
) -> Result<(), SyncError> {
    kv.put(
        REALTIME_STATUS_KEY,
        serde_json::to_vec(status)?,
        PutOptions {
            ttl: Some(ttl),
            metadata: Some(json!({ "t": status.timestamp })),
        },
    )
    .await?;
    Ok(())
}

/// Append the upstream API key as a query parameter.
fn with_api_key(url: &str, api_key: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}api_key={}", url, separator, urlencoding::encode(api_key))
}

fn today_yyyymmdd() -> u32 {
    let today = Utc::now().date_naive();
    today.year() as u32 * 10_000 + today.month() * 100 + today.day()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::providers::gtfs::validate::tests::make_valid_schedule;
    use std::collections::BTreeMap;

    #[test]
    fn with_api_key_respects_existing_query() {
        assert_eq!(
            with_api_key("https://host/feed?agency=CT", "k1"),
            "https://host/feed?agency=CT&api_key=k1"
        );
        assert_eq!(
            with_api_key("https://host/feed", "k1"),
            "https://host/feed?api_key=k1"
        );
    }

    #[test]
    fn with_api_key_encodes_the_key() {
        let url = with_api_key("https://host/feed", "a/b c");
        assert_eq!(url, "https://host/feed?api_key=a%2Fb%20c");
    }

    #[tokio::test]
    async fn publish_schedule_writes_data_then_meta() {
        let kv = MemoryKv::new();
        let schedule = make_valid_schedule();

        let wrote = publish_schedule(&kv, &schedule, 20260101).await.unwrap();
        assert!(wrote);

        let data = kv.get(SCHEDULE_DATA_KEY).await.unwrap().unwrap();
        let stored: crate::providers::gtfs::static_data::StaticSchedule =
            serde_json::from_slice(&data.value).unwrap();
        assert_eq!(stored.meta.version, schedule.meta.version);

        let meta = kv.get(SCHEDULE_META_KEY).await.unwrap().unwrap();
        let meta: serde_json::Value = serde_json::from_slice(&meta.value).unwrap();
        assert_eq!(meta["v"], serde_json::json!(schedule.meta.version));
        assert_eq!(meta["e"], serde_json::json!(schedule.meta.end_date));
    }

    #[tokio::test]
    async fn unchanged_version_skips_the_write() {
        let kv = MemoryKv::new();
        let schedule = make_valid_schedule();

        assert!(publish_schedule(&kv, &schedule, 20260101).await.unwrap());
        assert!(!publish_schedule(&kv, &schedule, 20260101).await.unwrap());

        let mut changed = schedule.clone();
        changed.meta.version = "0".repeat(64);
        assert!(publish_schedule(&kv, &changed, 20260101).await.unwrap());
    }

    #[tokio::test]
    async fn failed_validation_blocks_the_publish() {
        let kv = MemoryKv::new();
        let mut schedule = make_valid_schedule();
        schedule.trips.truncate(1);

        let result = publish_schedule(&kv, &schedule, 20260101).await;
        assert!(matches!(result, Err(SyncError::Validation(_))));
        assert!(kv.get(SCHEDULE_DATA_KEY).await.unwrap().is_none());
        assert!(kv.get(SCHEDULE_META_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_calendar_blocks_the_publish() {
        let kv = MemoryKv::new();
        let schedule = make_valid_schedule();
        let result = publish_schedule(&kv, &schedule, 20270101).await;
        assert!(matches!(result, Err(SyncError::Validation(1))));
    }

    #[tokio::test(start_paused = true)]
    async fn realtime_status_expires_without_refresh() {
        let kv = MemoryKv::new();
        let status = RealtimeStatus {
            timestamp: 1_735_689_600,
            by_trip: BTreeMap::new(),
            alerts: Vec::new(),
        };

        publish_realtime(&kv, &status, Duration::from_secs(180))
            .await
            .unwrap();

        let entry = kv.get(REALTIME_STATUS_KEY).await.unwrap().unwrap();
        assert_eq!(
            entry.metadata,
            Some(serde_json::json!({ "t": 1_735_689_600u64 }))
        );

        tokio::time::advance(Duration::from_secs(181)).await;
        assert!(kv.get(REALTIME_STATUS_KEY).await.unwrap().is_none());
    }
}
