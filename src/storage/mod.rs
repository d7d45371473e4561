//! Persistence of fetched track records.
//!
//! Records live in Redis next to the frontier, one JSON string per track
//! under `track:<track_id>`. Workers only ever write them; the export
//! command reads them back in bulk.

pub mod records;

pub use records::{
    track_key, MemoryRecordReader, MemoryRecordSink, RecordSink, RecordSource, RedisRecordReader, RedisRecordSink,
    TRACK_KEY_PREFIX,
};

use redis::aio::ConnectionManager;
use tracing::info;

use crate::config::RedisConfig;
use crate::error::StoreError;

/// Opens a managed connection and checks the server answers.
///
/// # Errors
///
/// Returns `StoreError::ConnectionFailed` if the server is unreachable.
pub async fn connect_redis(config: &RedisConfig) -> Result<ConnectionManager, StoreError> {
    let client = redis::Client::open(config.url())
        .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

    let mut conn = ConnectionManager::new(client)
        .await
        .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

    let _: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

    info!(host = %config.host, port = config.port, database = config.database, "connected to redis");
    Ok(conn)
}
