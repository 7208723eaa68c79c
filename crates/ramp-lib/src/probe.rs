//! Node health probing over JSON-RPC
//!
//! Queries the local node and an optional reference node for their chain
//! height and turns the pair into a [`HealthSample`]. Transient RPC failures
//! are retried with a bounded policy; a probe that still fails reports the
//! node as unhealthy rather than returning an error.

use crate::models::{HealthSample, HealthStatus};
use crate::retry::RetryPolicy;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Source of periodic health samples
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe the node once; never fails, failures are reported as unhealthy
    async fn sample(&self) -> HealthSample;
}

/// RPC call used to read the chain height
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeightMethod {
    /// `getSlot`, result is a JSON number
    #[default]
    GetSlot,
    /// `eth_blockNumber`, result is a `0x` hex string
    EthBlockNumber,
}

impl HeightMethod {
    pub fn rpc_method(&self) -> &'static str {
        match self {
            HeightMethod::GetSlot => "getSlot",
            HeightMethod::EthBlockNumber => "eth_blockNumber",
        }
    }

    /// Extract the height from a JSON-RPC `result` value
    pub fn parse_result(&self, result: &Value) -> Result<u64> {
        match self {
            HeightMethod::GetSlot => result
                .as_u64()
                .with_context(|| format!("getSlot result is not an integer: {}", result)),
            HeightMethod::EthBlockNumber => {
                let text = result
                    .as_str()
                    .with_context(|| format!("eth_blockNumber result is not a string: {}", result))?;
                let digits = text.trim_start_matches("0x");
                u64::from_str_radix(digits, 16)
                    .with_context(|| format!("Invalid hex block number {}", text))
            }
        }
    }
}

/// Configuration for the RPC health probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub local_rpc_url: String,
    pub reference_rpc_url: Option<String>,
    pub height_method: HeightMethod,
    /// Per-request timeout; attempts plus backoff must fit in one interval
    pub request_timeout_ms: u64,
    /// Largest lag behind the reference that still counts as healthy
    pub max_healthy_lag: u64,
    /// Divergence beyond which the node is treated as having lost data
    pub data_loss_lag: u64,
    pub retry: RetryPolicy,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            local_rpc_url: "http://127.0.0.1:8899".to_string(),
            reference_rpc_url: None,
            height_method: HeightMethod::GetSlot,
            request_timeout_ms: 1000,
            max_healthy_lag: 100,
            data_loss_lag: 1000,
            retry: RetryPolicy::default(),
        }
    }
}

impl ProbeConfig {
    /// Worst-case duration of one probe call
    pub fn worst_case(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
            .saturating_mul(self.retry.max_attempts.max(1))
            + self.retry.total_backoff()
    }

    /// Turn the observed heights into a health sample
    pub fn assess(
        &self,
        timestamp: DateTime<Utc>,
        local_height: Option<u64>,
        reference_height: Option<u64>,
        latency: Duration,
    ) -> HealthSample {
        let height_diff = match (local_height, reference_height) {
            (Some(local), Some(reference)) => Some(reference as i64 - local as i64),
            _ => None,
        };

        let heights_missing = local_height.is_none() && reference_height.is_none();
        let severe_divergence = height_diff.is_some_and(|d| d.unsigned_abs() > self.data_loss_lag);
        let data_loss = heights_missing || severe_divergence;

        let in_sync = height_diff.map_or(true, |d| d <= self.max_healthy_lag as i64);
        let status = if local_height.is_some() && in_sync && !data_loss {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        HealthSample {
            timestamp,
            local_height,
            reference_height,
            height_diff,
            status,
            data_loss,
            latency_ms: latency.as_secs_f64() * 1000.0,
        }
    }
}

/// Health probe that reads chain heights over JSON-RPC
pub struct RpcHealthProbe {
    client: reqwest::Client,
    config: ProbeConfig,
}

impl RpcHealthProbe {
    pub fn new(config: ProbeConfig) -> Result<Self> {
        url::Url::parse(&config.local_rpc_url)
            .with_context(|| format!("Invalid local RPC URL: {}", config.local_rpc_url))?;
        if let Some(reference) = &config.reference_rpc_url {
            url::Url::parse(reference)
                .with_context(|| format!("Invalid reference RPC URL: {}", reference))?;
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .context("Failed to create RPC client")?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// One height query, no retries
    async fn query_height(&self, endpoint: &str) -> Result<u64> {
        let method = self.config.height_method;
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method.rpc_method(),
            "params": [],
        });

        let response = self
            .client
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", endpoint))?;

        if !response.status().is_success() {
            anyhow::bail!("RPC {} returned HTTP {}", endpoint, response.status());
        }

        let payload: Value = response
            .json()
            .await
            .context("Failed to parse RPC response")?;

        if let Some(error) = payload.get("error") {
            anyhow::bail!("RPC {} returned error: {}", endpoint, error);
        }

        let result = payload
            .get("result")
            .context("RPC response has no result")?;
        method.parse_result(result)
    }

    async fn height_with_retry(&self, endpoint: &str) -> Option<u64> {
        match self
            .config
            .retry
            .run(endpoint, || self.query_height(endpoint))
            .await
        {
            Ok(height) => Some(height),
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Height query failed after retries");
                None
            }
        }
    }
}

#[async_trait]
impl HealthProbe for RpcHealthProbe {
    async fn sample(&self) -> HealthSample {
        let start = Instant::now();
        let local = self.height_with_retry(&self.config.local_rpc_url);
        let reference = async {
            match &self.config.reference_rpc_url {
                Some(url) => self.height_with_retry(url).await,
                None => None,
            }
        };

        let (local_height, reference_height) = tokio::join!(local, reference);
        let sample =
            self.config
                .assess(Utc::now(), local_height, reference_height, start.elapsed());

        debug!(
            local_height = ?sample.local_height,
            reference_height = ?sample.reference_height,
            status = ?sample.status,
            data_loss = sample.data_loss,
            "Health probe complete"
        );

        sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn fast_config(local: String, reference: Option<String>) -> ProbeConfig {
        ProbeConfig {
            local_rpc_url: local,
            reference_rpc_url: reference,
            request_timeout_ms: 500,
            retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)),
            ..ProbeConfig::default()
        }
    }

    #[test]
    fn test_parse_eth_block_number() {
        let height = HeightMethod::EthBlockNumber
            .parse_result(&json!("0x1b4"))
            .unwrap();
        assert_eq!(height, 436);
        assert!(HeightMethod::GetSlot.parse_result(&json!("0x1")).is_err());
    }

    #[test]
    fn test_assess_in_sync_is_healthy() {
        let config = ProbeConfig::default();
        let sample = config.assess(Utc::now(), Some(1000), Some(1040), Duration::from_millis(12));

        assert_eq!(sample.status, HealthStatus::Healthy);
        assert_eq!(sample.height_diff, Some(40));
        assert!(!sample.data_loss);
    }

    #[test]
    fn test_assess_lagging_is_unhealthy_without_data_loss() {
        let config = ProbeConfig::default();
        let sample = config.assess(Utc::now(), Some(1000), Some(1500), Duration::ZERO);

        assert_eq!(sample.status, HealthStatus::Unhealthy);
        assert!(!sample.data_loss);
    }

    #[test]
    fn test_assess_severe_divergence_is_data_loss() {
        let config = ProbeConfig::default();
        let sample = config.assess(Utc::now(), Some(1000), Some(2500), Duration::ZERO);

        assert!(sample.data_loss);
        assert_eq!(sample.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_assess_both_heights_missing_is_data_loss() {
        let config = ProbeConfig::default();
        let sample = config.assess(Utc::now(), None, None, Duration::ZERO);

        assert!(sample.data_loss);
        assert_eq!(sample.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_assess_local_only_unreachable() {
        let config = ProbeConfig::default();
        let sample = config.assess(Utc::now(), None, Some(1000), Duration::ZERO);

        assert!(!sample.data_loss);
        assert_eq!(sample.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_rejects_invalid_url() {
        let config = fast_config("not a url".to_string(), None);
        assert!(RpcHealthProbe::new(config).is_err());
    }

    #[tokio::test]
    async fn test_probe_reads_heights() {
        let mut local = mockito::Server::new_async().await;
        let mut reference = mockito::Server::new_async().await;

        local
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({"method": "getSlot"})))
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","result":5000,"id":1}"#)
            .create_async()
            .await;
        reference
            .mock("POST", "/")
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","result":5010,"id":1}"#)
            .create_async()
            .await;

        let probe = RpcHealthProbe::new(fast_config(local.url(), Some(reference.url()))).unwrap();
        let sample = probe.sample().await;

        assert_eq!(sample.local_height, Some(5000));
        assert_eq!(sample.reference_height, Some(5010));
        assert_eq!(sample.height_diff, Some(10));
        assert_eq!(sample.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_probe_retries_then_reports_unhealthy() {
        let mut local = mockito::Server::new_async().await;
        let failing = local
            .mock("POST", "/")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let probe = RpcHealthProbe::new(fast_config(local.url(), None)).unwrap();
        let sample = probe.sample().await;

        failing.assert_async().await;
        assert_eq!(sample.status, HealthStatus::Unhealthy);
        assert!(sample.data_loss);
    }

    #[tokio::test]
    async fn test_probe_treats_rpc_error_as_failure() {
        let mut local = mockito::Server::new_async().await;
        local
            .mock("POST", "/")
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","error":{"code":-32005,"message":"Node is behind"},"id":1}"#)
            .create_async()
            .await;

        let probe = RpcHealthProbe::new(fast_config(local.url(), None)).unwrap();
        let sample = probe.sample().await;

        assert!(sample.local_height.is_none());
        assert_eq!(sample.status, HealthStatus::Unhealthy);
    }
}
