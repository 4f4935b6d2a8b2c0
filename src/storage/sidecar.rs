// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Durable sidecar client.
//!
//! The sidecar is a small key/value + list service. The daemon owns a
//! handful of keys in it: `pool:state:cid`, `pool:epoch:<id>`,
//! `pool:epochs:history`, `pool:epoch:<id>:proofs`, and `pool:epoch:current`.
//! Lists are push-front, so index 0 is always the newest entry.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("network error: {0}")]
    Network(String),
    #[error("sidecar backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait SidecarStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, SidecarError>;
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>)
        -> Result<(), SidecarError>;
    /// Push to the front of a list, creating it if absent.
    async fn lpush(&self, key: &str, value: &str) -> Result<(), SidecarError>;
    /// Inclusive range over a list; `stop = -1` means the end.
    async fn lrange(&self, key: &str, start: i64, stop: i64)
        -> Result<Vec<String>, SidecarError>;
    async fn del(&self, key: &str) -> Result<(), SidecarError>;
}

#[derive(Debug, Deserialize)]
struct ValueResponse {
    value: String,
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    values: Vec<String>,
}

/// HTTP backend against the sidecar's REST surface.
pub struct HttpSidecar {
    client: Client,
    base_url: String,
}

impl HttpSidecar {
    pub fn new(base_url: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/kv/{}", self.base_url, key)
    }

    fn list_url(&self, key: &str) -> String {
        format!("{}/lists/{}", self.base_url, key)
    }
}

#[async_trait]
impl SidecarStore for HttpSidecar {
    async fn get(&self, key: &str) -> Result<Option<String>, SidecarError> {
        let response = self
            .client
            .get(self.kv_url(key))
            .send()
            .await
            .map_err(|e| SidecarError::Network(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: ValueResponse = response
                    .json()
                    .await
                    .map_err(|e| SidecarError::Backend(e.to_string()))?;
                Ok(Some(body.value))
            }
            status => Err(SidecarError::Backend(format!("{} on get {}", status, key))),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl_secs: Option<u64>,
    ) -> Result<(), SidecarError> {
        let mut body = json!({ "value": value });
        if let Some(ttl) = ttl_secs {
            body["ttl"] = json!(ttl);
        }
        let response = self
            .client
            .put(self.kv_url(key))
            .json(&body)
            .send()
            .await
            .map_err(|e| SidecarError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SidecarError::Backend(format!(
                "{} on set {}",
                response.status(),
                key
            )));
        }
        Ok(())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), SidecarError> {
        let response = self
            .client
            .post(self.list_url(key))
            .json(&json!({ "value": value }))
            .send()
            .await
            .map_err(|e| SidecarError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SidecarError::Backend(format!(
                "{} on lpush {}",
                response.status(),
                key
            )));
        }
        Ok(())
    }

    async fn lrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, SidecarError> {
        let url = format!("{}?start={}&stop={}", self.list_url(key), start, stop);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SidecarError::Network(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status if status.is_success() => {
                let body: RangeResponse = response
                    .json()
                    .await
                    .map_err(|e| SidecarError::Backend(e.to_string()))?;
                Ok(body.values)
            }
            status => Err(SidecarError::Backend(format!(
                "{} on lrange {}",
                status, key
            ))),
        }
    }

    async fn del(&self, key: &str) -> Result<(), SidecarError> {
        let response = self
            .client
            .delete(self.kv_url(key))
            .send()
            .await
            .map_err(|e| SidecarError::Network(e.to_string()))?;

        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(SidecarError::Backend(format!(
                "{} on del {}",
                response.status(),
                key
            )));
        }
        Ok(())
    }
}

/// In-memory backend for tests and single-process runs. TTLs are accepted
/// and ignored; tests never sleep long enough to care.
#[derive(Debug, Default)]
pub struct MemorySidecar {
    values: Mutex<HashMap<String, String>>,
    lists: Mutex<HashMap<String, VecDeque<String>>>,
}

impl MemorySidecar {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SidecarStore for MemorySidecar {
    async fn get(&self, key: &str) -> Result<Option<String>, SidecarError> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        _ttl_secs: Option<u64>,
    ) -> Result<(), SidecarError> {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), SidecarError> {
        self.lists
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn lrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, SidecarError> {
        let lists = self.lists.lock().unwrap();
        let Some(list) = lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as i64;
        let norm = |index: i64| -> i64 {
            if index < 0 {
                (len + index).max(0)
            } else {
                index.min(len - 1)
            }
        };
        if len == 0 {
            return Ok(Vec::new());
        }
        let (start, stop) = (norm(start), norm(stop));
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn del(&self, key: &str) -> Result<(), SidecarError> {
        self.values.lock().unwrap().remove(key);
        self.lists.lock().unwrap().remove(key);
        Ok(())
    }
}
