//! Redis connection management for the distributed hot-tier mirror.
//!
//! Connection pooling through `ConnectionManager`, automatic reconnection,
//! and bounded retries. The matching path never waits on this client; all
//! mirror writes are fire-and-forget.

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::RedisConfig;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 100;

pub struct RedisClient {
    url: String,
    max_retries: u32,
    retry_delay_ms: u64,
    client: Client,
    connection: Arc<RwLock<Option<ConnectionManager>>>,
}

impl RedisClient {
    pub async fn connect(config: &RedisConfig) -> Result<Self, RedisError> {
        let url = config.url();
        let client = Client::open(url.as_str())?;
        let this = Self {
            url,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            client,
            connection: Arc::new(RwLock::new(None)),
        };
        this.ensure_connected().await?;
        Ok(this)
    }

    async fn ensure_connected(&self) -> Result<(), RedisError> {
        let mut conn = self.connection.write().await;
        if conn.is_none() {
            tracing::info!("establishing redis connection to {}", self.url);
            let manager = ConnectionManager::new(self.client.clone()).await?;
            *conn = Some(manager);
        }
        Ok(())
    }

    async fn get_connection(&self) -> Result<ConnectionManager, RedisError> {
        self.ensure_connected().await?;
        let conn = self.connection.read().await;
        conn.clone()
            .ok_or_else(|| RedisError::from((redis::ErrorKind::IoError, "connection not available")))
    }

    /// Run an operation with reconnect-and-retry semantics.
    pub async fn with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T, RedisError>
    where
        F: FnMut(ConnectionManager) -> Fut,
        Fut: std::future::Future<Output = Result<T, RedisError>>,
    {
        let mut last_error = None;

        for attempt in 0..self.max_retries {
            match self.get_connection().await {
                Ok(conn) => match operation(conn).await {
                    Ok(result) => return Ok(result),
                    Err(e) => {
                        tracing::warn!(
                            "redis operation failed (attempt {}/{}): {}",
                            attempt + 1,
                            self.max_retries,
                            e
                        );
                        last_error = Some(e);
                        // Drop the cached connection so the next attempt
                        // reconnects.
                        if attempt < self.max_retries - 1 {
                            *self.connection.write().await = None;
                            tokio::time::sleep(Duration::from_millis(
                                self.retry_delay_ms * (attempt as u64 + 1),
                            ))
                            .await;
                        }
                    }
                },
                Err(e) => {
                    last_error = Some(e);
                    if attempt < self.max_retries - 1 {
                        tokio::time::sleep(Duration::from_millis(
                            self.retry_delay_ms * (attempt as u64 + 1),
                        ))
                        .await;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| RedisError::from((redis::ErrorKind::IoError, "max retries exceeded"))))
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, RedisError> {
        self.with_retry(|mut conn| {
            let key = key.to_string();
            async move { conn.get(&key).await }
        })
        .await
    }

    pub async fn set_ex(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), RedisError> {
        self.with_retry(|mut conn| {
            let key = key.to_string();
            let value = value.clone();
            async move { conn.set_ex(&key, value, ttl_secs).await }
        })
        .await
    }

    pub async fn del(&self, key: &str) -> Result<bool, RedisError> {
        self.with_retry(|mut conn| {
            let key = key.to_string();
            async move {
                let count: i32 = conn.del(&key).await?;
                Ok(count > 0)
            }
        })
        .await
    }

    /// ZADD keyed by a float score (price or timestamp ordering).
    pub async fn zadd(&self, key: &str, score: f64, member: String) -> Result<(), RedisError> {
        self.with_retry(|mut conn| {
            let key = key.to_string();
            let member = member.clone();
            async move {
                let _: i32 = conn.zadd(&key, member, score).await?;
                Ok(())
            }
        })
        .await
    }

    pub async fn zrem(&self, key: &str, member: String) -> Result<(), RedisError> {
        self.with_retry(|mut conn| {
            let key = key.to_string();
            let member = member.clone();
            async move {
                let _: i32 = conn.zrem(&key, member).await?;
                Ok(())
            }
        })
        .await
    }

    pub async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, RedisError> {
        self.with_retry(|mut conn| {
            let key = key.to_string();
            async move { conn.zrange(&key, start, stop).await }
        })
        .await
    }

    pub async fn publish(&self, channel: &str, message: String) -> Result<i32, RedisError> {
        self.with_retry(|mut conn| {
            let channel = channel.to_string();
            let message = message.clone();
            async move { conn.publish(&channel, message).await }
        })
        .await
    }

    pub async fn ping(&self) -> Result<bool, RedisError> {
        self.with_retry(|mut conn| async move {
            let result: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(result == "PONG")
        })
        .await
    }

    pub async fn is_available(&self) -> bool {
        self.ping().await.unwrap_or(false)
    }
}
