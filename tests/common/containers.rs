// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Provides helpers to spin up Redis containers for integration tests.

#![allow(dead_code)]

use changefeed_relay::config::RedisStoreConfig;
use changefeed_relay::RedisStore;
use redis::AsyncCommands;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container (streams-compatible).
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// A Redis container playing one data store.
pub struct TestRedis<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub name: String,
    pub url: String,
}

impl<'a> TestRedis<'a> {
    pub fn new(docker: &'a Cli, name: &str) -> Self {
        let container = redis_container(docker);
        let url = redis_url(&container);
        Self {
            container,
            name: name.to_string(),
            url,
        }
    }

    /// Store config pointing at this container.
    pub fn store_config(&self) -> RedisStoreConfig {
        RedisStoreConfig::for_testing(&self.name, &self.url)
    }

    /// Connect a store handle.
    pub async fn store(&self) -> RedisStore {
        RedisStore::connect(self.store_config())
            .await
            .expect("Failed to connect to test Redis")
    }

    async fn conn(&self) -> redis::aio::MultiplexedConnection {
        let client = redis::Client::open(self.url.as_str()).unwrap();
        client.get_multiplexed_async_connection().await.unwrap()
    }

    /// Append a raw entry to the change stream, as an upstream writer would.
    pub async fn add_change(&self, op: &str, key: &str, doc: Option<&[u8]>) -> String {
        let mut fields: Vec<(&str, Vec<u8>)> = vec![
            ("op", op.as_bytes().to_vec()),
            ("key", key.as_bytes().to_vec()),
        ];
        if let Some(d) = doc {
            fields.push(("doc", d.to_vec()));
        }
        let mut conn = self.conn().await;
        conn.xadd("changes", "*", &fields).await.unwrap()
    }

    /// Append an insert entry with a JSON document.
    pub async fn add_insert(&self, key: &str, json: &str) -> String {
        self.add_change("insert", key, Some(json.as_bytes())).await
    }

    /// Raw JSON of a stored document.
    pub async fn document_json(&self, key: &str) -> Option<serde_json::Value> {
        let mut conn = self.conn().await;
        let raw: Option<String> = conn.get(format!("doc:{}", key)).await.unwrap();
        raw.map(|s| serde_json::from_str(&s).unwrap())
    }

    /// Checkpoint stored in the checkpoint hash.
    pub async fn checkpoint(&self, id: &str) -> Option<String> {
        let mut conn = self.conn().await;
        conn.hget("relay:checkpoints", id).await.unwrap()
    }

    pub async fn stream_len(&self) -> usize {
        let mut conn = self.conn().await;
        conn.xlen("changes").await.unwrap()
    }
}
