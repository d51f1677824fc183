// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis-backed store.
//!
//! One [`RedisStore`] provides all three store capabilities against a single
//! Redis server:
//!
//! | Capability | Redis structure |
//! |------------|-----------------|
//! | Change feed | Stream `{stream_key}`, entries `op`, `key`, `doc` |
//! | Documents | String keys `{document_prefix}{key}` holding JSON |
//! | Checkpoints | Hash `{checkpoint_key}`, field = checkpoint id |
//!
//! # Stream Entry Format
//!
//! ```text
//! XADD changes * op insert key a1 doc '{"_id":"a1","value":5}'
//! ```
//!
//! The `doc` payload may be zstd-compressed; compressed payloads are
//! detected by their magic bytes.
//!
//! # Inserts
//!
//! Inserts are a single Lua script: `SET NX` on the document key, then (if
//! `emit_changes` is on) `XADD` an `insert` entry carrying the stamped
//! document. A peer relay tailing this stream sees the provenance marker and
//! filters the entry out, which is what stops bidirectional loops.

use crate::config::RedisStoreConfig;
use crate::document::{Document, DocumentKey};
use crate::error::{RelayError, Result};
use crate::feed::{compare_positions, ChangeEvent, OperationKind, Position};
use crate::filter::FeedFilter;
use crate::metrics;
use crate::resilience::RetryConfig;
use crate::store::{BoxFuture, ChangeFeedSource, CheckpointBackend, DocumentStore, FeedHandle, StoreHandle};
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, Script};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

/// zstd magic bytes for decompression detection
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Stream position before any entry.
const ZERO_POSITION: &str = "0-0";

/// SET NX the document, then optionally emit an insert entry.
///
/// KEYS[1] = document key, KEYS[2] = stream key
/// ARGV[1] = document JSON, ARGV[2] = "1" to emit, ARGV[3] = canonical key
const INSERT_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX') then
  if ARGV[2] == '1' then
    redis.call('XADD', KEYS[2], '*', 'op', 'insert', 'key', ARGV[3], 'doc', ARGV[1])
  end
  return 1
end
return 0
"#;

/// A Redis server acting as source, destination, or checkpoint backend.
pub struct RedisStore {
    config: RedisStoreConfig,
    conn: ConnectionManager,
    insert_script: Script,
    closed: Arc<AtomicBool>,
}

impl RedisStore {
    /// Connect using the startup retry policy and the configured timeout.
    pub async fn connect(config: RedisStoreConfig) -> Result<Self> {
        let retry = RetryConfig {
            connection_timeout: config.connect_timeout_duration(),
            ..RetryConfig::startup()
        };
        Self::connect_with_retry(config, &retry).await
    }

    /// Connect, retrying failed or timed-out attempts with backoff.
    pub async fn connect_with_retry(config: RedisStoreConfig, retry: &RetryConfig) -> Result<Self> {
        info!(store = %config.name, url = %config.url, "Connecting to store");

        let client = Client::open(config.url.as_str()).map_err(|e| {
            RelayError::connection(&config.name, format!("Invalid Redis URL: {}", e))
        })?;

        let mut attempt = 0;
        loop {
            attempt += 1;

            // Bound each attempt so an unreachable host can't hang startup
            let last_error = match timeout(retry.connection_timeout, client.get_connection_manager()).await {
                Ok(Ok(conn)) => {
                    metrics::record_store_connection(&config.name, true);
                    if attempt > 1 {
                        info!(store = %config.name, attempt, "Connected to store after retry");
                    } else {
                        info!(store = %config.name, "Connected to store");
                    }
                    return Ok(Self {
                        config,
                        conn,
                        insert_script: Script::new(INSERT_SCRIPT),
                        closed: Arc::new(AtomicBool::new(false)),
                    });
                }
                Ok(Err(e)) => format!("{}", e),
                Err(_) => format!("timed out after {}ms", retry.connection_timeout.as_millis()),
            };

            metrics::record_store_connection(&config.name, false);

            if attempt >= retry.max_attempts {
                error!(store = %config.name, attempt, error = %last_error, "Failed to connect after max retries");
                return Err(RelayError::connection(
                    &config.name,
                    format!("Connection failed after {} attempts: {}", attempt, last_error),
                ));
            }

            let delay = retry.delay_for_attempt(attempt);
            warn!(
                store = %config.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %last_error,
                "Connection attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn conn(&self) -> Result<ConnectionManager> {
        if self.is_closed() {
            return Err(RelayError::Shutdown(self.config.name.clone()));
        }
        Ok(self.conn.clone())
    }

    /// Oldest position still in the stream, if any.
    pub async fn oldest_position(&self) -> Result<Option<Position>> {
        let mut conn = self.conn()?;
        edge_position(&mut conn, &self.config.stream_key, "XRANGE").await
    }

    /// Newest position in the stream, if any.
    pub async fn latest_position(&self) -> Result<Option<Position>> {
        let mut conn = self.conn()?;
        edge_position(&mut conn, &self.config.stream_key, "XREVRANGE").await
    }

    /// Number of entries currently in the stream.
    pub async fn stream_length(&self) -> Result<u64> {
        let mut conn = self.conn()?;
        let len: u64 = redis::cmd("XLEN")
            .arg(&self.config.stream_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::redis("XLEN", e))?;
        Ok(len)
    }

    /// Append a change entry to the stream directly.
    ///
    /// This is how an upstream producer records changes; the relay itself
    /// only appends through [`DocumentStore::insert`].
    pub async fn append_change(
        &self,
        operation: &OperationKind,
        key: &DocumentKey,
        document: Option<&Document>,
    ) -> Result<Position> {
        let mut conn = self.conn()?;
        let mut fields: Vec<(&str, Vec<u8>)> = vec![
            ("op", operation.as_str().as_bytes().to_vec()),
            ("key", key.canonical().into_bytes()),
        ];
        if let Some(doc) = document {
            let bytes = doc
                .to_json_bytes()
                .map_err(|e| RelayError::Internal(format!("Cannot encode document: {}", e)))?;
            fields.push(("doc", bytes));
        }
        let id: String = conn
            .xadd(&self.config.stream_key, "*", &fields)
            .await
            .map_err(|e| RelayError::redis("XADD", e))?;
        Ok(Position::new(id))
    }

    /// Trim the stream to at most `max_len` entries (exact trim).
    pub async fn trim_stream(&self, max_len: usize) -> Result<u64> {
        let mut conn = self.conn()?;
        let removed: u64 = redis::cmd("XTRIM")
            .arg(&self.config.stream_key)
            .arg("MAXLEN")
            .arg(max_len)
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::redis("XTRIM", e))?;
        Ok(removed)
    }
}

/// Check that `stream_key` still holds every entry after `position`.
///
/// Run when a feed opens and again before every read, so entries trimmed
/// while the consumer lags surface as `ResumeUnavailable` instead of being
/// stepped over.
async fn check_resume(conn: &mut ConnectionManager, stream_key: &str, position: &Position) -> Result<()> {
    let oldest = edge_position(conn, stream_key, "XRANGE").await?;
    if let Some(oldest) = &oldest {
        if compare_positions(position.as_str(), oldest.as_str()) != CmpOrdering::Less {
            return Ok(());
        }
    }

    // Either the stream is empty or the position predates its oldest entry.
    // Redis 7 tells us whether anything after it was deleted.
    let trimmed_past = match max_deleted_position(conn, stream_key).await? {
        Some(deleted) => compare_positions(deleted.as_str(), position.as_str()) == CmpOrdering::Greater,
        // Older servers: assume a gap whenever entries exist past a real position
        None => oldest.is_some() && position.as_str() != ZERO_POSITION,
    };

    if trimmed_past {
        return Err(RelayError::ResumeUnavailable {
            position: position.to_string(),
            message: format!(
                "stream {} was trimmed past {} (oldest entry {})",
                stream_key,
                position,
                oldest.as_ref().map(|p| p.as_str()).unwrap_or("none")
            ),
        });
    }
    Ok(())
}

/// First (`XRANGE`) or last (`XREVRANGE`) entry id of a stream.
async fn edge_position(conn: &mut ConnectionManager, stream_key: &str, command: &str) -> Result<Option<Position>> {
    let (from, to) = if command == "XRANGE" { ("-", "+") } else { ("+", "-") };
    let result: Vec<(String, HashMap<String, redis::Value>)> = redis::cmd(command)
        .arg(stream_key)
        .arg(from)
        .arg(to)
        .arg("COUNT")
        .arg(1)
        .query_async(conn)
        .await
        .map_err(|e| RelayError::redis(command, e))?;
    Ok(result.into_iter().next().map(|(id, _)| Position::new(id)))
}

/// `max-deleted-entry-id` from `XINFO STREAM`, when the server reports it.
async fn max_deleted_position(conn: &mut ConnectionManager, stream_key: &str) -> Result<Option<Position>> {
    let info: redis::RedisResult<HashMap<String, redis::Value>> = redis::cmd("XINFO")
        .arg("STREAM")
        .arg(stream_key)
        .query_async(conn)
        .await;

    let info = match info {
        Ok(info) => info,
        // No such key: nothing was ever written, so nothing was trimmed
        Err(e) if e.kind() == redis::ErrorKind::ResponseError => return Ok(Some(Position::from(ZERO_POSITION))),
        Err(e) => return Err(RelayError::redis("XINFO", e)),
    };

    Ok(info.get("max-deleted-entry-id").and_then(|v| match v {
        redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok().map(Position::new),
        redis::Value::SimpleString(s) => Some(Position::new(s.clone())),
        _ => None,
    }))
}

impl StoreHandle for RedisStore {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::AcqRel) {
                info!(store = %self.config.name, "Store closed");
            }
            Ok(())
        })
    }
}

impl ChangeFeedSource for RedisStore {
    fn open_change_feed(
        &self,
        filter: FeedFilter,
        resume_from: Option<Position>,
    ) -> BoxFuture<'_, Box<dyn FeedHandle>> {
        Box::pin(async move {
            let mut conn = self.conn()?;

            let cursor = match resume_from {
                Some(position) => {
                    check_resume(&mut conn, &self.config.stream_key, &position).await?;
                    position
                }
                None => edge_position(&mut conn, &self.config.stream_key, "XREVRANGE")
                    .await?
                    .unwrap_or_else(|| Position::from(ZERO_POSITION)),
            };

            info!(
                store = %self.config.name,
                stream = %self.config.stream_key,
                cursor = %cursor,
                match_expression = %filter.to_match_expression(),
                "Change feed opened"
            );

            let feed: Box<dyn FeedHandle> = Box::new(RedisFeed {
                conn,
                store: self.config.name.clone(),
                stream_key: self.config.stream_key.clone(),
                filter,
                cursor,
                pending: VecDeque::new(),
                block_timeout: self.config.block_timeout_duration(),
                batch_size: self.config.batch_size,
                store_closed: Arc::clone(&self.closed),
                closed: false,
            });
            Ok(feed)
        })
    }
}

impl DocumentStore for RedisStore {
    fn find_by_key(&self, key: &DocumentKey) -> BoxFuture<'_, Option<Document>> {
        let canonical = key.canonical();
        let redis_key = self.config.document_key(&canonical);
        Box::pin(async move {
            let mut conn = self.conn()?;
            let raw: Option<Vec<u8>> = conn
                .get(&redis_key)
                .await
                .map_err(|e| RelayError::redis("GET", e))?;

            match raw {
                None => Ok(None),
                Some(raw) => {
                    Ok(Some(decode_stored_document(&canonical, &redis_key, &raw)?))
                }
            }
        })
    }

    fn insert(&self, document: Document) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let key = document
                .key()
                .ok_or_else(|| RelayError::apply("<none>", "document has no _id"))?
                .canonical();
            let bytes = document
                .to_json_bytes()
                .map_err(|e| RelayError::apply(&key, format!("Cannot encode document: {}", e)))?;

            let mut conn = self.conn()?;
            let inserted: i64 = self
                .insert_script
                .key(self.config.document_key(&key))
                .key(&self.config.stream_key)
                .arg(bytes)
                .arg(if self.config.emit_changes { "1" } else { "0" })
                .arg(&key)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| RelayError::redis("EVALSHA", e))?;

            if inserted == 0 {
                return Err(RelayError::DuplicateKey(key));
            }
            trace!(store = %self.config.name, key = %key, "Document inserted");
            Ok(())
        })
    }
}

impl CheckpointBackend for RedisStore {
    fn upsert_checkpoint(&self, id: &str, position: &Position) -> BoxFuture<'_, ()> {
        let id = id.to_string();
        let position = position.as_str().to_string();
        Box::pin(async move {
            let mut conn = self.conn()?;
            let _: () = conn
                .hset(&self.config.checkpoint_key, &id, &position)
                .await
                .map_err(|e| RelayError::redis("HSET", e))?;
            Ok(())
        })
    }

    fn get_checkpoint(&self, id: &str) -> BoxFuture<'_, Option<Position>> {
        let id = id.to_string();
        Box::pin(async move {
            let mut conn = self.conn()?;
            let position: Option<String> = conn
                .hget(&self.config.checkpoint_key, &id)
                .await
                .map_err(|e| RelayError::redis("HGET", e))?;
            Ok(position.map(Position::new))
        })
    }
}

/// Tails a stream with `XREAD BLOCK`, applying the filter to each entry.
struct RedisFeed {
    conn: ConnectionManager,
    store: String,
    stream_key: String,
    filter: FeedFilter,
    /// Last entry handed out (or skipped); reads continue strictly after it
    cursor: Position,
    pending: VecDeque<StreamId>,
    block_timeout: Duration,
    batch_size: usize,
    store_closed: Arc<AtomicBool>,
    closed: bool,
}

impl RedisFeed {
    async fn fill(&mut self) -> Result<()> {
        check_resume(&mut self.conn, &self.stream_key, &self.cursor).await?;

        let opts = StreamReadOptions::default()
            .block(self.block_timeout.as_millis() as usize)
            .count(self.batch_size);

        let started = Instant::now();
        let reply: StreamReadReply = self
            .conn
            .xread_options(&[&self.stream_key], &[self.cursor.as_str()], &opts)
            .await
            .map_err(|e| RelayError::redis("XREAD", e))?;

        let mut count = 0;
        for stream in reply.keys {
            count += stream.ids.len();
            self.pending.extend(stream.ids);
        }
        metrics::record_feed_read(&self.store, count, started.elapsed());
        Ok(())
    }
}

impl FeedHandle for RedisFeed {
    fn next_event(&mut self) -> BoxFuture<'_, Option<ChangeEvent>> {
        Box::pin(async move {
            loop {
                if self.closed || self.store_closed.load(Ordering::Acquire) {
                    return Ok(None);
                }

                let Some(entry) = self.pending.pop_front() else {
                    self.fill().await?;
                    continue;
                };
                self.cursor = Position::new(entry.id.clone());

                let event = match parse_entry(&entry.id, &entry.map) {
                    Ok(event) => event,
                    Err(e) => {
                        metrics::record_feed_parse_error(&self.store);
                        return Err(e);
                    }
                };

                if self.filter.accept(&event) {
                    trace!(store = %self.store, position = %event.position, key = %event.document_key, "Feed event");
                    return Ok(Some(event));
                }

                metrics::record_feed_filtered(&self.store);
                trace!(
                    store = %self.store,
                    position = %event.position,
                    operation = %event.operation,
                    sync_source = event.sync_source().unwrap_or(""),
                    "Filtered feed entry"
                );
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.closed {
                self.closed = true;
                self.pending.clear();
                debug!(store = %self.store, cursor = %self.cursor, "Change feed closed");
            }
            Ok(())
        })
    }
}

/// Parse a stream entry into a [`ChangeEvent`].
fn parse_entry(id: &str, fields: &HashMap<String, redis::Value>) -> Result<ChangeEvent> {
    let operation = OperationKind::parse(&get_string_field(fields, "op")?);
    let key = get_string_field(fields, "key")?;

    let full_document = if fields.contains_key("doc") {
        let raw = get_bytes_field(fields, "doc")?;
        let bytes = maybe_decompress(&raw)?;
        let document = Document::from_json_bytes(&bytes)
            .map_err(|e| RelayError::FeedParse(format!("Invalid document JSON in {}: {}", id, e)))?;
        Some(document)
    } else {
        None
    };

    let document_key = full_document
        .as_ref()
        .and_then(|d| d.key())
        .unwrap_or_else(|| DocumentKey::from(key));

    Ok(ChangeEvent {
        operation,
        document_key,
        full_document,
        position: Position::new(id),
    })
}

/// Extract a string field from a stream entry.
fn get_string_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<String> {
    let value = fields
        .get(name)
        .ok_or_else(|| RelayError::FeedParse(format!("Missing field: {}", name)))?;

    match value {
        redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone())
            .map_err(|e| RelayError::FeedParse(format!("Invalid UTF-8 in {}: {}", name, e))),
        redis::Value::SimpleString(s) => Ok(s.clone()),
        _ => Err(RelayError::FeedParse(format!(
            "Unexpected type for field {}: {:?}",
            name, value
        ))),
    }
}

/// Extract a bytes field from a stream entry.
fn get_bytes_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<Vec<u8>> {
    let value = fields
        .get(name)
        .ok_or_else(|| RelayError::FeedParse(format!("Missing field: {}", name)))?;

    match value {
        redis::Value::BulkString(bytes) => Ok(bytes.clone()),
        redis::Value::SimpleString(s) => Ok(s.as_bytes().to_vec()),
        _ => Err(RelayError::FeedParse(format!(
            "Unexpected type for field {}: {:?}",
            name, value
        ))),
    }
}

/// Decode a stored document. Corruption is permanent, so it is reported as
/// a non-retryable apply error for `key`.
fn decode_stored_document(key: &str, redis_key: &str, raw: &[u8]) -> Result<Document> {
    let bytes = maybe_decompress(raw)
        .map_err(|e| RelayError::apply(key, format!("Corrupt document at {}: {}", redis_key, e)))?;
    Document::from_json_bytes(&bytes)
        .map_err(|e| RelayError::apply(key, format!("Corrupt document at {}: {}", redis_key, e)))
}

/// Decompress zstd data if it has the magic header, otherwise return as-is.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder = zstd::Decoder::new(data)
            .map_err(|e| RelayError::Decompression(format!("zstd init: {}", e)))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| RelayError::Decompression(format!("zstd decode: {}", e)))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}
