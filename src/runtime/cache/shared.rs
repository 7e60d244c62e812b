//! Shared (networked) cache tier
//!
//! The runtime consumes the second tier through the [`SharedStore`] trait so
//! deployments can plug in whatever backing store they run. The shipped
//! adapter speaks a small HTTP key-value protocol.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::runtime::error::RuntimeError;

/// Contract for the optional networked cache tier. All errors from
/// implementations are treated as misses by the tiered cache, never as hard
/// failures.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RuntimeError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), RuntimeError>;

    async fn delete(&self, key: &str) -> Result<bool, RuntimeError>;

    async fn exists(&self, key: &str) -> Result<bool, RuntimeError>;

    /// Keys matching a `prefix*` or exact pattern
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, RuntimeError>;
}

/// HTTP adapter for the shared tier.
///
/// Protocol: `GET/PUT/DELETE/HEAD {base}/kv?key=K` for entry operations
/// (`PUT` carries the raw payload and a `ttl` query parameter in seconds)
/// and `GET {base}/kv/keys?pattern=P` returning a JSON array of keys.
pub struct HttpKvStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpKvStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RuntimeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RuntimeError::Configuration(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn entry_url(&self) -> String {
        format!("{}/kv", self.base_url)
    }
}

#[async_trait]
impl SharedStore for HttpKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RuntimeError> {
        let response = self
            .client
            .get(self.entry_url())
            .query(&[("key", key)])
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.bytes().await?.to_vec())),
            status => Err(RuntimeError::Cache(format!(
                "shared store get returned {}",
                status
            ))),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), RuntimeError> {
        let response = self
            .client
            .put(self.entry_url())
            .query(&[("key", key), ("ttl", &ttl.as_secs().to_string())])
            .body(value.to_vec())
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(RuntimeError::Cache(format!(
                "shared store set returned {}",
                response.status()
            )))
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, RuntimeError> {
        let response = self
            .client
            .delete(self.entry_url())
            .query(&[("key", key)])
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(RuntimeError::Cache(format!(
                "shared store delete returned {}",
                status
            ))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, RuntimeError> {
        let response = self
            .client
            .head(self.entry_url())
            .query(&[("key", key)])
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(RuntimeError::Cache(format!(
                "shared store exists returned {}",
                status
            ))),
        }
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, RuntimeError> {
        let response = self
            .client
            .get(format!("{}/kv/keys", self.base_url))
            .query(&[("pattern", pattern)])
            .send()
            .await?;

        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(RuntimeError::Cache(format!(
                "shared store keys returned {}",
                response.status()
            )))
        }
    }
}
