// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence for feed positions.
//!
//! A checkpoint is a singleton record (id `"latestToken"` by default) holding
//! the most recent position that was **fully applied** at the destination.
//!
//! ## Checkpoint Semantics
//!
//! ```text
//! receive event P → apply to destination → save checkpoint P
//!                   (crash here = redeliver P, idempotent)
//! ```
//!
//! The record is absent until the first successful save, meaning "start from
//! the current moment". It is never deleted during normal operation.
//!
//! Any [`CheckpointBackend`] can hold the record: the destination store
//! itself (the default), a Redis hash, or a local SQLite file
//! ([`sqlite::SqliteCheckpointBackend`]).

pub mod sqlite;

use crate::error::Result;
use crate::feed::Position;
use crate::resilience::{retry, RetryConfig};
use crate::store::CheckpointBackend;
use std::sync::Arc;
use tracing::{debug, info};

pub use sqlite::SqliteCheckpointBackend;

/// Default checkpoint record id.
pub const DEFAULT_CHECKPOINT_ID: &str = "latestToken";

/// Loads and saves the relay's checkpoint record.
pub struct CheckpointStore<B: CheckpointBackend + ?Sized> {
    backend: Arc<B>,
    id: String,
    retry: RetryConfig,
}

impl<B: CheckpointBackend + ?Sized> CheckpointStore<B> {
    /// Create a store for the default record id.
    pub fn new(backend: Arc<B>) -> Self {
        Self::with_id(backend, DEFAULT_CHECKPOINT_ID)
    }

    /// Create a store for a custom record id.
    pub fn with_id(backend: Arc<B>, id: impl Into<String>) -> Self {
        Self {
            backend,
            id: id.into(),
            retry: RetryConfig::per_event(),
        }
    }

    /// Set the retry policy for saves.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Last durable checkpoint, or `None` if no position was ever saved.
    pub async fn load(&self) -> Result<Option<Position>> {
        let position = self.backend.get_checkpoint(&self.id).await?;
        match &position {
            Some(p) => info!(id = %self.id, position = %p, backend = %self.backend.name(), "Loaded checkpoint"),
            None => info!(id = %self.id, backend = %self.backend.name(), "No checkpoint found, starting from now"),
        }
        Ok(position)
    }

    /// Upsert the checkpoint record.
    ///
    /// Retryable failures are retried with backoff; the final error, if
    /// any, is returned to the caller.
    pub async fn save(&self, position: &Position) -> Result<()> {
        let backend = &self.backend;
        let id = self.id.as_str();
        retry("checkpoint_save", &self.retry, || async move {
            backend.upsert_checkpoint(id, position).await
        })
        .await?;
        debug!(id = %self.id, position = %position, "Checkpoint saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let backend = Arc::new(MemoryStore::new("ck"));
        let store = CheckpointStore::new(backend);
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let backend = Arc::new(MemoryStore::new("ck"));
        let store = CheckpointStore::new(Arc::clone(&backend));

        store.save(&Position::from("100-0")).await.unwrap();
        store.save(&Position::from("100-0")).await.unwrap();
        store.save(&Position::from("200-1")).await.unwrap();

        assert_eq!(store.load().await.unwrap(), Some(Position::from("200-1")));
        assert_eq!(
            backend.checkpoint(DEFAULT_CHECKPOINT_ID).await,
            Some(Position::from("200-1"))
        );
    }

    #[tokio::test]
    async fn test_custom_id() {
        let backend = Arc::new(MemoryStore::new("ck"));
        let store = CheckpointStore::with_id(Arc::clone(&backend), "relay-b");
        store.save(&Position::from("5-0")).await.unwrap();
        assert_eq!(store.id(), "relay-b");
        assert!(backend.checkpoint(DEFAULT_CHECKPOINT_ID).await.is_none());
        assert_eq!(backend.checkpoint("relay-b").await, Some(Position::from("5-0")));
    }

    #[tokio::test]
    async fn test_save_retries_transient_failures() {
        let backend = Arc::new(MemoryStore::new("ck"));
        let store = CheckpointStore::new(Arc::clone(&backend)).with_retry(RetryConfig::testing());

        backend.fail_next_checkpoint_saves(2);
        store.save(&Position::from("1-0")).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(Position::from("1-0")));
    }

    #[tokio::test]
    async fn test_save_reports_exhausted_retries() {
        let backend = Arc::new(MemoryStore::new("ck"));
        let store = CheckpointStore::new(Arc::clone(&backend)).with_retry(RetryConfig::testing());

        backend.fail_next_checkpoint_saves(10);
        let err = store.save(&Position::from("1-0")).await.unwrap_err();
        assert!(matches!(err, RelayError::Connection { .. }));
        assert!(backend.checkpoint(DEFAULT_CHECKPOINT_ID).await.is_none());
    }

    #[tokio::test]
    async fn test_works_with_trait_object() {
        let backend: Arc<dyn CheckpointBackend> = Arc::new(MemoryStore::new("ck"));
        let store = CheckpointStore::new(backend);
        store.save(&Position::from("9-9")).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(Position::from("9-9")));
    }
}
