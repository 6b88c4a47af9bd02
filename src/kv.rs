//! Key–value store adapter.
//!
//! The pipeline publishes exactly three blobs: the compact schedule bundle,
//! its metadata, and the merged realtime status. Writers replace values
//! whole; readers never observe a partial value. The trait is the seam
//! where a remote store would plug in — the in-process [`MemoryKv`] is the
//! default binding.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Daily schedule bundle (JSON `StaticSchedule`). No TTL.
pub const SCHEDULE_DATA_KEY: &str = "schedule:data";
/// Schedule metadata (JSON `ScheduleMeta`). No TTL.
pub const SCHEDULE_META_KEY: &str = "schedule:meta";
/// Merged realtime status (JSON `RealtimeStatus`). TTL'd; expiry means 404.
pub const REALTIME_STATUS_KEY: &str = "realtime:status";

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("store error: {0}")]
    Store(String),
}

/// A stored value plus the metadata recorded at write time.
#[derive(Debug, Clone)]
pub struct KvEntry {
    pub value: Vec<u8>,
    pub metadata: Option<serde_json::Value>,
}

/// Write options. `Default` is the plain variant used for the schedule
/// blobs (no TTL, no metadata).
#[derive(Debug, Default)]
pub struct PutOptions {
    pub ttl: Option<Duration>,
    pub metadata: Option<serde_json::Value>,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a value with its metadata. Expired values read as absent.
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, KvError>;

    /// Atomically replace the value under `key`.
    async fn put(&self, key: &str, value: Vec<u8>, options: PutOptions) -> Result<(), KvError>;
}

struct Stored {
    value: Vec<u8>,
    metadata: Option<serde_json::Value>,
    expires_at: Option<Instant>,
}

/// In-process store. Whole-value replacement under the write lock makes
/// partial reads impossible; expiry is checked on read against the tokio
/// clock so it is deterministic under paused test time.
#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, Stored>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, KvError> {
        let entries = self.entries.read().await;
        let Some(stored) = entries.get(key) else {
            return Ok(None);
        };
        if let Some(expires_at) = stored.expires_at {
            if Instant::now() >= expires_at {
                return Ok(None);
            }
        }
        Ok(Some(KvEntry {
            value: stored.value.clone(),
            metadata: stored.metadata.clone(),
        }))
    }

    async fn put(&self, key: &str, value: Vec<u8>, options: PutOptions) -> Result<(), KvError> {
        let stored = Stored {
            value,
            metadata: options.metadata,
            expires_at: options.ttl.map(|ttl| Instant::now() + ttl),
        };
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), stored);
        Ok(())
    }
}
