// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Data store capabilities.
//!
//! The relay never talks to a concrete database directly. It depends on a
//! small set of capabilities that a data store handle provides:
//!
//! - [`ChangeFeedSource`]: open a filtered, resumable change feed
//! - [`DocumentStore`]: read and insert documents by key
//! - [`CheckpointBackend`]: persist small checkpoint records
//!
//! All three extend [`StoreHandle`], which names the store and releases its
//! resources. Stores are shared as `Arc` dependencies, so tests can swap in
//! [`MemoryStore`](memory::MemoryStore).
//!
//! # Example
//!
//! ```rust,no_run
//! use changefeed_relay::store::{BoxFuture, DocumentStore, StoreHandle};
//! use changefeed_relay::{Document, DocumentKey};
//!
//! struct MyStore;
//!
//! impl StoreHandle for MyStore {
//!     fn name(&self) -> &str {
//!         "my-store"
//!     }
//! }
//!
//! impl DocumentStore for MyStore {
//!     fn find_by_key(&self, _key: &DocumentKey) -> BoxFuture<'_, Option<Document>> {
//!         Box::pin(async move { Ok(None) })
//!     }
//!
//!     fn insert(&self, _document: Document) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//! }
//! ```

pub mod memory;
pub mod redis;

use crate::document::{Document, DocumentKey};
use crate::error::Result;
use crate::feed::{ChangeEvent, Position};
use crate::filter::FeedFilter;
use std::future::Future;
use std::pin::Pin;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Base capability shared by every store handle.
pub trait StoreHandle: Send + Sync + 'static {
    /// Human-readable store name (for logs and errors).
    fn name(&self) -> &str;

    /// Release the store's resources.
    ///
    /// Must be idempotent: the relay may call it on several exit paths.
    /// Default implementation does nothing.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

impl<T: StoreHandle + ?Sized> StoreHandle for std::sync::Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        (**self).close()
    }
}

/// An open change feed subscription.
///
/// Owned by exactly one consumer. Not `Sync`: only the pump task touches it.
pub trait FeedHandle: Send {
    /// Wait for the next accepted event.
    ///
    /// Returns `Ok(None)` once the feed has ended (closed or exhausted).
    /// Errors are feed-level failures, e.g. a lost resume position or a
    /// broken connection.
    fn next_event(&mut self) -> BoxFuture<'_, Option<ChangeEvent>>;

    /// Stop the subscription. Idempotent.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// A store that can produce a change feed.
pub trait ChangeFeedSource: StoreHandle {
    /// Open a feed that yields events accepted by `filter`.
    ///
    /// With `resume_from`, the feed yields only events strictly after that
    /// position, in order; without it, the feed starts at "now". Fails with
    /// [`RelayError::ResumeUnavailable`](crate::RelayError::ResumeUnavailable)
    /// if the position has fallen out of the retention window.
    fn open_change_feed(
        &self,
        filter: FeedFilter,
        resume_from: Option<Position>,
    ) -> BoxFuture<'_, Box<dyn FeedHandle>>;
}

/// A store documents can be read from and inserted into.
pub trait DocumentStore: StoreHandle {
    /// Fetch a document by key.
    fn find_by_key(&self, key: &DocumentKey) -> BoxFuture<'_, Option<Document>>;

    /// Insert a new document.
    ///
    /// Fails with [`RelayError::DuplicateKey`](crate::RelayError::DuplicateKey)
    /// if a document with the same key already exists.
    fn insert(&self, document: Document) -> BoxFuture<'_, ()>;
}

/// A store that can persist checkpoint records.
pub trait CheckpointBackend: StoreHandle {
    /// Insert or replace the checkpoint record `id`.
    fn upsert_checkpoint(&self, id: &str, position: &Position) -> BoxFuture<'_, ()>;

    /// Read checkpoint record `id`. A missing record is `Ok(None)`.
    fn get_checkpoint(&self, id: &str) -> BoxFuture<'_, Option<Position>>;
}
