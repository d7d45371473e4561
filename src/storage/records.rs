//! Record sink implementations and the bulk reader used by export.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::catalog::TrackRecord;
use crate::error::StoreError;

pub const TRACK_KEY_PREFIX: &str = "track:";

pub fn track_key(track_id: &str) -> String {
    format!("{}{}", TRACK_KEY_PREFIX, track_id)
}

/// Durable storage of fetched tracks.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Writes every record, overwriting earlier versions of the same track.
    async fn store_tracks(&self, tracks: &[TrackRecord]) -> Result<(), StoreError>;
}

/// Paged bulk read of stored records.
#[async_trait]
pub trait RecordSource: Send {
    /// Next page of `(key, raw json)` pairs, `None` once exhausted.
    async fn next_page(&mut self) -> Result<Option<Vec<(String, String)>>, StoreError>;
}

/// Sink writing JSON strings to Redis.
pub struct RedisRecordSink {
    redis: ConnectionManager,
}

impl RedisRecordSink {
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl RecordSink for RedisRecordSink {
    async fn store_tracks(&self, tracks: &[TrackRecord]) -> Result<(), StoreError> {
        if tracks.is_empty() {
            return Ok(());
        }

        // serialize everything before touching the store
        let mut entries = Vec::with_capacity(tracks.len());
        for track in tracks {
            entries.push((track_key(track.id()), serde_json::to_string(track)?));
        }

        let mut pipe = redis::pipe();
        for (key, value) in &entries {
            pipe.set(key, value).ignore();
        }

        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

/// In-process sink keeping the serialized form, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRecordSink {
    records: Mutex<HashMap<String, String>>,
}

impl MemoryRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the stored records, paged in key order.
    pub fn reader(&self, page_size: usize) -> Result<MemoryRecordReader, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        let mut entries: Vec<(String, String)> = records.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort();
        Ok(MemoryRecordReader {
            entries: entries.into_iter(),
            page_size: page_size.max(1),
        })
    }

    /// Decodes the stored record for `track_id`.
    pub fn get(&self, track_id: &str) -> Result<Option<TrackRecord>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        records
            .get(&track_key(track_id))
            .map(|raw| serde_json::from_str(raw).map_err(StoreError::from))
            .transpose()
    }
}

#[async_trait]
impl RecordSink for MemoryRecordSink {
    async fn store_tracks(&self, tracks: &[TrackRecord]) -> Result<(), StoreError> {
        let mut entries = Vec::with_capacity(tracks.len());
        for track in tracks {
            entries.push((track_key(track.id()), serde_json::to_string(track)?));
        }

        let mut records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        records.extend(entries);
        Ok(())
    }
}

pub struct MemoryRecordReader {
    entries: std::vec::IntoIter<(String, String)>,
    page_size: usize,
}

#[async_trait]
impl RecordSource for MemoryRecordReader {
    async fn next_page(&mut self) -> Result<Option<Vec<(String, String)>>, StoreError> {
        let page: Vec<_> = self.entries.by_ref().take(self.page_size).collect();
        Ok((!page.is_empty()).then_some(page))
    }
}

/// Pages through every stored record with `SCAN`.
pub struct RedisRecordReader {
    redis: ConnectionManager,
    page_size: usize,
    cursor: u64,
    finished: bool,
}

impl RedisRecordReader {
    pub fn from_connection(redis: ConnectionManager, page_size: usize) -> Self {
        Self {
            redis,
            page_size: page_size.max(1),
            cursor: 0,
            finished: false,
        }
    }
}

#[async_trait]
impl RecordSource for RedisRecordReader {
    /// Pages may be empty; SCAN guarantees every key present for the whole
    /// scan is returned at least once.
    async fn next_page(&mut self) -> Result<Option<Vec<(String, String)>>, StoreError> {
        if self.finished {
            return Ok(None);
        }

        let mut conn = self.redis.clone();
        let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(self.cursor)
            .arg("MATCH")
            .arg(format!("{}*", TRACK_KEY_PREFIX))
            .arg("COUNT")
            .arg(self.page_size)
            .query_async(&mut conn)
            .await?;

        self.cursor = next_cursor;
        if next_cursor == 0 {
            self.finished = true;
        }

        if keys.is_empty() {
            return Ok(Some(Vec::new()));
        }

        let values: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        // keys can vanish between SCAN and MGET
        let page = keys
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect();

        Ok(Some(page))
    }
}
