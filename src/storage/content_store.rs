// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Content-addressable store client.
//!
//! Talks to a content-store gateway over a small REST surface:
//! `GET /content/{cid}` fetches a blob, `POST /content` uploads one and
//! returns its identifier, `POST /pins/{cid}` pins it. Identifiers are
//! opaque strings; an `ipfs://` prefix is tolerated and stripped.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("network error: {0}")]
    Network(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("server error: {0}")]
    Server(String),
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Fetch a blob by content identifier. `Ok(None)` means the blob is
    /// missing or not JSON; callers drop the message either way.
    async fn fetch_json(&self, cid: &str) -> Result<Option<Value>, StorageError>;

    /// Upload a JSON object, returning its content identifier.
    async fn upload_json(&self, value: &Value) -> Result<String, StorageError>;

    /// Pin a blob so the gateway keeps it available.
    async fn pin(&self, cid: &str) -> Result<(), StorageError>;
}

fn strip_scheme(cid: &str) -> &str {
    cid.strip_prefix("ipfs://").unwrap_or(cid)
}

#[derive(Debug, Clone, Deserialize)]
struct UploadResponse {
    cid: String,
}

/// HTTP gateway backend.
pub struct HttpContentStore {
    client: Client,
    api_url: String,
}

impl HttpContentStore {
    pub fn new(api_url: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ContentStore for HttpContentStore {
    async fn fetch_json(&self, cid: &str) -> Result<Option<Value>, StorageError> {
        let url = format!("{}/content/{}", self.api_url, strip_scheme(cid));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| StorageError::Network(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => match response.json::<Value>().await {
                Ok(value) => Ok(Some(value)),
                Err(_) => Ok(None),
            },
            status => Err(StorageError::Server(format!("{} from {}", status, url))),
        }
    }

    async fn upload_json(&self, value: &Value) -> Result<String, StorageError> {
        let url = format!("{}/content", self.api_url);
        let response = self
            .client
            .post(&url)
            .json(value)
            .send()
            .await
            .map_err(|e| StorageError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StorageError::Server(format!(
                "{} from {}",
                response.status(),
                url
            )));
        }

        let uploaded: UploadResponse = response
            .json()
            .await
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(uploaded.cid)
    }

    async fn pin(&self, cid: &str) -> Result<(), StorageError> {
        let url = format!("{}/pins/{}", self.api_url, strip_scheme(cid));
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| StorageError::Network(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(cid.to_string()));
        }
        if !response.status().is_success() {
            return Err(StorageError::Server(format!(
                "{} from {}",
                response.status(),
                url
            )));
        }
        Ok(())
    }
}

/// In-memory backend for tests. Identifiers are derived from the canonical
/// bytes of the stored object, so equal objects get equal identifiers.
#[derive(Debug, Default)]
pub struct MockContentStore {
    objects: Mutex<HashMap<String, Value>>,
    pins: Mutex<HashSet<String>>,
    fail_uploads: AtomicBool,
}

impl MockContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object under its derived identifier and return it.
    pub fn insert_json(&self, value: Value) -> String {
        let cid = derive_cid(&value);
        self.objects.lock().unwrap().insert(cid.clone(), value);
        cid
    }

    /// Store an object under a caller-chosen identifier.
    pub fn insert_with_cid(&self, cid: &str, value: Value) {
        self.objects.lock().unwrap().insert(cid.to_string(), value);
    }

    pub fn is_pinned(&self, cid: &str) -> bool {
        self.pins.lock().unwrap().contains(strip_scheme(cid))
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Make subsequent uploads fail, to exercise seal/publish retry paths.
    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }
}

fn derive_cid(value: &Value) -> String {
    let canonical = serde_json::to_string(value).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    format!("bafy{}", hex::encode(&digest[..20]))
}

#[async_trait]
impl ContentStore for MockContentStore {
    async fn fetch_json(&self, cid: &str) -> Result<Option<Value>, StorageError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(strip_scheme(cid))
            .cloned())
    }

    async fn upload_json(&self, value: &Value) -> Result<String, StorageError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(StorageError::Network("injected upload failure".to_string()));
        }
        Ok(self.insert_json(value.clone()))
    }

    async fn pin(&self, cid: &str) -> Result<(), StorageError> {
        let cid = strip_scheme(cid);
        if !self.objects.lock().unwrap().contains_key(cid) {
            return Err(StorageError::NotFound(cid.to_string()));
        }
        self.pins.lock().unwrap().insert(cid.to_string());
        Ok(())
    }
}
