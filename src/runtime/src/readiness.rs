//! Retry-until-ready polling.
//!
//! A probe error and a `false` result both mean "not ready yet". The same
//! two functions serve the container daemon gate and the node health check.

use async_trait::async_trait;
use nodevm_core::config::NodeSettings;
use nodevm_core::error::{Result, VmError};
use serde_json::json;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Probe up to `retries` times, sleeping `delay` between attempts.
///
/// Returns `true` as soon as the probe reports ready, `false` once the
/// budget is exhausted.
pub async fn poll_until<F, Fut, E>(retries: u32, delay: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<bool, E>>,
    E: Display,
{
    for attempt in 1..=retries {
        match probe().await {
            Ok(true) => {
                tracing::debug!(attempt, "Probe ready");
                return true;
            }
            Ok(false) => tracing::trace!(attempt, "Probe not ready"),
            Err(e) => tracing::trace!(attempt, error = %e, "Probe failed"),
        }
        if attempt < retries {
            tokio::time::sleep(delay).await;
        }
    }
    tracing::debug!(retries, "Probe budget exhausted");
    false
}

/// Probe with a fixed interval until it reports ready.
pub async fn poll_forever<F, Fut, E>(interval: Duration, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<bool, E>>,
    E: Display,
{
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        match probe().await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => tracing::trace!(attempt, error = %e, "Probe failed"),
        }
        if attempt % 30 == 0 {
            tracing::info!(attempt, "Still waiting for readiness");
        }
        tokio::time::sleep(interval).await;
    }
}

/// Health check of the embedded node process.
#[async_trait]
pub trait StatusProbe: Send + Sync {
    /// Whether the node reports itself online.
    async fn online(&self, node: &NodeSettings) -> Result<bool>;
}

/// Queries the node's loopback JSON-RPC endpoint.
///
/// The endpoint answers `{"result": {"online": true}}` once it is serving.
pub struct JsonRpcStatusProbe {
    client: reqwest::Client,
}

impl JsonRpcStatusProbe {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for JsonRpcStatusProbe {
    fn default() -> Self {
        Self::new()
    }
}

fn http_error(e: reqwest::Error) -> VmError {
    if e.is_timeout() {
        VmError::TimeoutError(e.to_string())
    } else {
        VmError::HttpError(e.to_string())
    }
}

#[async_trait]
impl StatusProbe for JsonRpcStatusProbe {
    async fn online(&self, node: &NodeSettings) -> Result<bool> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": node.status_method,
            "params": [],
        });

        let response = self
            .client
            .post(&node.status_url)
            .json(&body)
            .send()
            .await
            .map_err(http_error)?;

        if !response.status().is_success() {
            return Ok(false);
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(http_error)?;

        Ok(value
            .pointer("/result/online")
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }
}
