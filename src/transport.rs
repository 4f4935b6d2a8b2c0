// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Publish/subscribe transport.
//!
//! The daemon consumes a topic-based pub/sub service through three calls:
//! subscribe, get_message (bounded wait), publish. The production backend
//! talks to a pub/sub REST gateway; the mock keeps per-process queues and
//! records every publish so tests can assert on emitted events.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport read error: {0}")]
    Read(String),
    #[error("transport publish error: {0}")]
    Publish(String),
    #[error("transport subscribe error: {0}")]
    Subscribe(String),
}

/// One message received from a subscribed topic.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    pub topic: String,
    pub payload: Value,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next message across all subscriptions.
    /// `Ok(None)` means the wait elapsed with nothing to deliver.
    async fn get_message(
        &self,
        timeout: Duration,
    ) -> Result<Option<TransportMessage>, TransportError>;

    async fn publish(&self, topic: &str, payload: &Value) -> Result<(), TransportError>;
}

#[derive(Debug, Deserialize)]
struct GatewayMessage {
    topic: String,
    payload: Value,
}

/// Pub/sub REST gateway backend.
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let url = format!("{}/subscriptions", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "topic": topic }))
            .send()
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::Subscribe(format!(
                "{} subscribing to {}",
                response.status(),
                topic
            )));
        }
        Ok(())
    }

    async fn get_message(
        &self,
        timeout: Duration,
    ) -> Result<Option<TransportMessage>, TransportError> {
        let url = format!(
            "{}/messages?timeout_ms={}",
            self.base_url,
            timeout.as_millis()
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TransportError::Read(e.to_string()))?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => {
                let message: GatewayMessage = response
                    .json()
                    .await
                    .map_err(|e| TransportError::Read(e.to_string()))?;
                Ok(Some(TransportMessage {
                    topic: message.topic,
                    payload: message.payload,
                }))
            }
            status => Err(TransportError::Read(format!("{} from gateway", status))),
        }
    }

    async fn publish(&self, topic: &str, payload: &Value) -> Result<(), TransportError> {
        let url = format!("{}/publish", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "topic": topic, "payload": payload }))
            .send()
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::Publish(format!(
                "{} publishing to {}",
                response.status(),
                topic
            )));
        }
        Ok(())
    }
}

/// In-memory transport for tests. Inbound messages are queued with
/// `push_inbound`; everything published is recorded for assertions.
#[derive(Debug, Default)]
pub struct MockTransport {
    subscriptions: Mutex<Vec<String>>,
    inbound: Mutex<VecDeque<TransportMessage>>,
    published: Mutex<Vec<TransportMessage>>,
    fail_reads: AtomicBool,
    fail_publishes: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_inbound(&self, topic: &str, payload: Value) {
        self.inbound.lock().unwrap().push_back(TransportMessage {
            topic: topic.to_string(),
            payload,
        });
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    /// Payloads published to topics containing `fragment`.
    pub fn published_on(&self, fragment: &str) -> Vec<Value> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.topic.contains(fragment))
            .map(|m| m.payload.clone())
            .collect()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.subscriptions.lock().unwrap().push(topic.to_string());
        Ok(())
    }

    async fn get_message(
        &self,
        timeout: Duration,
    ) -> Result<Option<TransportMessage>, TransportError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(TransportError::Read("injected read failure".to_string()));
        }
        if let Some(message) = self.inbound.lock().unwrap().pop_front() {
            return Ok(Some(message));
        }
        // Emulate the gateway's bounded wait without busy-looping callers.
        tokio::time::sleep(timeout.min(Duration::from_millis(10))).await;
        Ok(self.inbound.lock().unwrap().pop_front())
    }

    async fn publish(&self, topic: &str, payload: &Value) -> Result<(), TransportError> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(TransportError::Publish(
                "injected publish failure".to_string(),
            ));
        }
        self.published.lock().unwrap().push(TransportMessage {
            topic: topic.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_delivers_in_arrival_order() {
        let transport = MockTransport::new();
        transport.push_inbound("swarmpool.eth/jobs", json!({ "cid": "a" }));
        transport.push_inbound("swarmpool.eth/jobs", json!({ "cid": "b" }));

        let first = transport
            .get_message(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.payload["cid"], "a");

        let second = transport
            .get_message(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.payload["cid"], "b");

        assert!(transport
            .get_message(Duration::from_secs(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn mock_records_publishes_by_topic() {
        let transport = MockTransport::new();
        transport
            .publish("swarmpool.eth/jobs/new", &json!({ "cid": "x" }))
            .await
            .unwrap();
        transport
            .publish("swarmpool.eth/state", &json!({ "cid": "y" }))
            .await
            .unwrap();

        assert_eq!(transport.published_on("jobs/new").len(), 1);
        assert_eq!(transport.published_on("state").len(), 1);
        assert!(transport.published_on("epochs").is_empty());
    }
}
