// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process data store.
//!
//! Implements every store capability on top of in-memory maps. Used as a
//! fake in tests and for embedding a relay in-process.
//!
//! # Change Log
//!
//! Inserts (when `emit_changes` is on) and recorded updates/deletes are
//! appended to a change log with positions minted in `{millis}-{seq}` form,
//! strictly increasing. [`trim_through`](MemoryStore::trim_through) drops old
//! entries to simulate a bounded retention window; feeds resuming from before
//! the trim point fail with `ResumeUnavailable`.
//!
//! # Fault Injection
//!
//! Inserts, checkpoint saves and open feeds can be made to fail on demand so
//! tests can exercise retry, hold and fatal paths without a real database.

use super::{BoxFuture, ChangeFeedSource, CheckpointBackend, DocumentStore, FeedHandle, StoreHandle};
use crate::document::{Document, DocumentKey};
use crate::error::RelayError;
use crate::feed::{compare_positions, ChangeEvent, OperationKind, Position};
use crate::filter::FeedFilter;
use chrono::Utc;
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, trace};

#[derive(Default)]
struct Inner {
    documents: HashMap<String, Document>,
    log: Vec<ChangeEvent>,
    /// Position of the newest entry removed by trimming.
    trimmed_through: Option<Position>,
    last_ms: u64,
    last_seq: u64,
    checkpoints: HashMap<String, Position>,
}

impl Inner {
    fn next_position(&mut self) -> Position {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        if now > self.last_ms {
            self.last_ms = now;
            self.last_seq = 0;
        } else {
            self.last_seq += 1;
        }
        Position::from_parts(self.last_ms, self.last_seq)
    }

    fn head(&self) -> Position {
        Position::from_parts(self.last_ms, self.last_seq)
    }

    fn append(&mut self, operation: OperationKind, key: DocumentKey, doc: Option<Document>) -> Position {
        let position = self.next_position();
        self.log.push(ChangeEvent {
            operation,
            document_key: key,
            full_document: doc,
            position: position.clone(),
        });
        position
    }

    /// True if events after `position` have been trimmed away.
    fn is_trimmed_past(&self, position: &Position) -> bool {
        match &self.trimmed_through {
            Some(t) => compare_positions(position.as_str(), t.as_str()) == CmpOrdering::Less,
            None => false,
        }
    }

    /// First retained event strictly after `position`.
    fn first_after(&self, position: &Position) -> Option<&ChangeEvent> {
        let idx = self
            .log
            .partition_point(|e| e.position <= *position);
        self.log.get(idx)
    }
}

#[derive(Default)]
struct Faults {
    insert_failures: AtomicUsize,
    insert_connection_failures: AtomicUsize,
    checkpoint_failures: AtomicUsize,
    unreachable: AtomicBool,
    feeds_broken: AtomicBool,
}

/// Consume one unit from a fault counter, if any remain.
fn take_fault(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-memory store implementing every store capability.
pub struct MemoryStore {
    name: String,
    emit_changes: bool,
    inner: Arc<RwLock<Inner>>,
    notify: Arc<Notify>,
    faults: Arc<Faults>,
    closed: Arc<AtomicBool>,
    close_count: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty store whose inserts emit change events.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            emit_changes: true,
            inner: Arc::new(RwLock::new(Inner::default())),
            notify: Arc::new(Notify::new()),
            faults: Arc::new(Faults::default()),
            closed: Arc::new(AtomicBool::new(false)),
            close_count: AtomicUsize::new(0),
        }
    }

    /// Open another handle onto the same data.
    ///
    /// Handles close independently, like separate connections to one
    /// database. Fault injection is shared.
    pub fn new_handle(&self) -> Self {
        Self {
            name: self.name.clone(),
            emit_changes: self.emit_changes,
            inner: Arc::clone(&self.inner),
            notify: Arc::clone(&self.notify),
            faults: Arc::clone(&self.faults),
            closed: Arc::new(AtomicBool::new(false)),
            close_count: AtomicUsize::new(0),
        }
    }

    /// Control whether inserts append to the change log.
    pub fn with_emit_changes(mut self, emit: bool) -> Self {
        self.emit_changes = emit;
        self
    }

    /// Number of stored documents.
    pub async fn document_count(&self) -> usize {
        self.inner.read().await.documents.len()
    }

    /// Fetch a document by its canonical key.
    pub async fn document(&self, key: &str) -> Option<Document> {
        self.inner.read().await.documents.get(key).cloned()
    }

    /// Position of the newest change log entry ever minted.
    pub async fn head_position(&self) -> Position {
        self.inner.read().await.head()
    }

    /// Read a checkpoint without fault injection.
    pub async fn checkpoint(&self, id: &str) -> Option<Position> {
        self.inner.read().await.checkpoints.get(id).cloned()
    }

    /// Record an update event for an existing document.
    pub async fn record_update(&self, document: Document) -> Option<Position> {
        let key = document.key()?;
        let position = {
            let mut inner = self.inner.write().await;
            inner.documents.insert(key.canonical(), document.clone());
            inner.append(OperationKind::Update, key, Some(document))
        };
        self.notify.notify_waiters();
        Some(position)
    }

    /// Record a delete event.
    pub async fn record_delete(&self, key: DocumentKey) -> Position {
        let position = {
            let mut inner = self.inner.write().await;
            inner.documents.remove(&key.canonical());
            inner.append(OperationKind::Delete, key, None)
        };
        self.notify.notify_waiters();
        position
    }

    /// Drop change log entries up to and including `position`.
    pub async fn trim_through(&self, position: &Position) {
        let mut inner = self.inner.write().await;
        inner.log.retain(|e| e.position > *position);
        let advance = match &inner.trimmed_through {
            Some(t) => position > t,
            None => true,
        };
        if advance {
            inner.trimmed_through = Some(position.clone());
        }
        debug!(store = %self.name, through = %position, "Trimmed change log");
    }

    /// Fail the next `n` inserts with a non-retryable apply error.
    pub fn fail_next_inserts(&self, n: usize) {
        self.faults.insert_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` inserts with a retryable connection error.
    pub fn fail_next_inserts_transiently(&self, n: usize) {
        self.faults.insert_connection_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` checkpoint writes with a retryable connection error.
    pub fn fail_next_checkpoint_saves(&self, n: usize) {
        self.faults.checkpoint_failures.store(n, Ordering::SeqCst);
    }

    /// Make every operation fail with a connection error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.faults.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make open feeds fail on their next read.
    pub fn break_feeds(&self) {
        self.faults.feeds_broken.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// How many times `close` has been called.
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> crate::Result<()> {
        if self.faults.unreachable.load(Ordering::SeqCst) {
            return Err(RelayError::connection(&self.name, "store unreachable"));
        }
        if self.is_closed() {
            return Err(RelayError::Shutdown(self.name.clone()));
        }
        Ok(())
    }
}

impl StoreHandle for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.close_count.fetch_add(1, Ordering::SeqCst);
            if !self.closed.swap(true, Ordering::SeqCst) {
                debug!(store = %self.name, "Memory store closed");
                self.notify.notify_waiters();
            }
            Ok(())
        })
    }
}

impl DocumentStore for MemoryStore {
    fn find_by_key(&self, key: &DocumentKey) -> BoxFuture<'_, Option<Document>> {
        let key = key.canonical();
        Box::pin(async move {
            self.check_reachable()?;
            Ok(self.inner.read().await.documents.get(&key).cloned())
        })
    }

    fn insert(&self, document: Document) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.check_reachable()?;
            let key = document
                .key()
                .ok_or_else(|| RelayError::apply("<none>", "document has no _id"))?;
            let canonical = key.canonical();

            if take_fault(&self.faults.insert_connection_failures) {
                return Err(RelayError::connection(&self.name, "injected transient failure"));
            }
            if take_fault(&self.faults.insert_failures) {
                return Err(RelayError::apply(canonical, "injected insert failure"));
            }

            {
                let mut inner = self.inner.write().await;
                if inner.documents.contains_key(&canonical) {
                    return Err(RelayError::DuplicateKey(canonical));
                }
                inner.documents.insert(canonical.clone(), document.clone());
                if self.emit_changes {
                    let position = inner.append(OperationKind::Insert, key, Some(document));
                    trace!(store = %self.name, key = %canonical, position = %position, "Insert recorded");
                }
            }
            self.notify.notify_waiters();
            Ok(())
        })
    }
}

impl CheckpointBackend for MemoryStore {
    fn upsert_checkpoint(&self, id: &str, position: &Position) -> BoxFuture<'_, ()> {
        let id = id.to_string();
        let position = position.clone();
        Box::pin(async move {
            self.check_reachable()?;
            if take_fault(&self.faults.checkpoint_failures) {
                return Err(RelayError::connection(&self.name, "injected checkpoint failure"));
            }
            self.inner.write().await.checkpoints.insert(id, position);
            Ok(())
        })
    }

    fn get_checkpoint(&self, id: &str) -> BoxFuture<'_, Option<Position>> {
        let id = id.to_string();
        Box::pin(async move {
            self.check_reachable()?;
            Ok(self.inner.read().await.checkpoints.get(&id).cloned())
        })
    }
}

impl ChangeFeedSource for MemoryStore {
    fn open_change_feed(
        &self,
        filter: FeedFilter,
        resume_from: Option<Position>,
    ) -> BoxFuture<'_, Box<dyn FeedHandle>> {
        Box::pin(async move {
            self.check_reachable()?;
            let inner = self.inner.read().await;

            let cursor = match resume_from {
                Some(position) => {
                    if inner.is_trimmed_past(&position) {
                        return Err(RelayError::ResumeUnavailable {
                            position: position.to_string(),
                            message: format!(
                                "change log trimmed through {}",
                                inner.trimmed_through.as_ref().map(Position::as_str).unwrap_or("?")
                            ),
                        });
                    }
                    position
                }
                None => inner.head(),
            };

            debug!(store = %self.name, cursor = %cursor, "Opened change feed");

            let feed = MemoryFeed {
                store: self.name.clone(),
                inner: Arc::clone(&self.inner),
                notify: Arc::clone(&self.notify),
                faults: Arc::clone(&self.faults),
                store_closed: Arc::clone(&self.closed),
                filter,
                cursor,
                closed: false,
            };
            Ok(Box::new(feed) as Box<dyn FeedHandle>)
        })
    }
}

/// Feed over a [`MemoryStore`] change log.
struct MemoryFeed {
    store: String,
    inner: Arc<RwLock<Inner>>,
    notify: Arc<Notify>,
    faults: Arc<Faults>,
    store_closed: Arc<AtomicBool>,
    filter: FeedFilter,
    /// Last position handed out (or skipped by the filter).
    cursor: Position,
    closed: bool,
}

impl FeedHandle for MemoryFeed {
    fn next_event(&mut self) -> BoxFuture<'_, Option<ChangeEvent>> {
        Box::pin(async move {
            loop {
                // Register for wakeups before looking, so an append between
                // the scan and the await isn't missed.
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.closed || self.store_closed.load(Ordering::SeqCst) {
                    return Ok(None);
                }
                if self.faults.feeds_broken.load(Ordering::SeqCst) {
                    return Err(RelayError::connection(&self.store, "change feed connection lost"));
                }

                {
                    let inner = self.inner.read().await;
                    if inner.is_trimmed_past(&self.cursor) {
                        return Err(RelayError::ResumeUnavailable {
                            position: self.cursor.to_string(),
                            message: "change log trimmed past feed cursor".to_string(),
                        });
                    }

                    let mut next = inner.first_after(&self.cursor);
                    while let Some(event) = next {
                        self.cursor = event.position.clone();
                        if self.filter.accept(event) {
                            return Ok(Some(event.clone()));
                        }
                        trace!(
                            store = %self.store,
                            position = %event.position,
                            op = %event.operation,
                            "Event excluded by feed filter"
                        );
                        next = inner.first_after(&self.cursor);
                    }
                }

                notified.await;
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed = true;
            Ok(())
        })
    }
}
