//! RPC Client Module - Multi-Chain JSON-RPC
//!
//! 1. Ordered endpoint list per chain (explicit URL, Alchemy, public fallback)
//! 2. Exponential backoff retry with jitter on transient failures
//! 3. User-Agent header & API key protection in logs
//! 4. Gzip compression for large responses
//! 5. Batch requests (max 50 per batch)
//! 6. Typed helpers for the calls the sweep engine needs
//!
//! Every error leaving this module is an `AppError` whose code tells the
//! caller whether retrying makes sense.

use alloy_primitives::{Address, Bytes, U256};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::models::config::ChainConfig;
use crate::models::errors::{AppError, AppResult, ErrorCode};
use crate::utils::abi;
use crate::utils::backoff::Backoff;
use crate::utils::constants::{get_chain_name, USER_AGENT as USER_AGENT_CONST};

// ============================================
// RETRY CONSTANTS
// ============================================

/// Maximum batch size (50 keeps providers reliable)
pub const MAX_BATCH_SIZE: usize = 50;

/// Base retry delay in milliseconds
pub const BASE_RETRY_MS: u64 = 250;

/// Maximum retry delay in milliseconds
pub const MAX_RETRY_MS: u64 = 8_000;

/// Attempts per endpoint before moving to the next one
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Batch JSON-RPC request item
#[derive(Debug, Clone, Serialize)]
pub struct BatchRequestItem {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: serde_json::Value,
    pub id: u64,
}

/// Batch JSON-RPC response item
#[derive(Debug, Clone, Deserialize)]
pub struct BatchResponseItem<T> {
    pub result: Option<T>,
    pub error: Option<RpcError>,
    pub id: u64,
}

/// RPC Provider with retry logic and endpoint fallback
#[derive(Clone)]
pub struct RpcProvider {
    /// Primary first, fallbacks after
    urls: Vec<String>,
    /// HTTP client with custom headers (gzip enabled)
    client: reqwest::Client,
    chain_id: u64,
    /// Network name for logging
    network_name: String,
    max_retries: u32,
    backoff: Backoff,
}

impl RpcProvider {
    /// Create a provider for an explicit endpoint list
    pub fn new(chain_id: u64, urls: Vec<String>, timeout: Duration) -> AppResult<Self> {
        if urls.is_empty() {
            return Err(AppError::invalid_config(format!(
                "No RPC endpoint configured for chain {}",
                chain_id
            )));
        }

        Ok(Self {
            urls,
            client: build_http_client(timeout)?,
            chain_id,
            network_name: get_chain_name(chain_id).to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: Backoff::new(
                Duration::from_millis(BASE_RETRY_MS),
                Duration::from_millis(MAX_RETRY_MS),
            ),
        })
    }

    /// Create a provider from chain configuration
    pub fn for_chain(config: &ChainConfig, timeout: Duration) -> AppResult<Self> {
        Self::new(config.chain_id, config.rpc_urls.clone(), timeout)
    }

    /// Override retry policy
    pub fn with_retries(mut self, max_retries: u32, backoff: Backoff) -> Self {
        self.max_retries = max_retries.max(1);
        self.backoff = backoff;
        self
    }

    /// Execute JSON-RPC call with retry logic and fallback
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> AppResult<T> {
        self.call_optional::<T>(method, params)
            .await?
            .ok_or_else(|| AppError::new(ErrorCode::RpcInvalidResponse, format!("No result for {}", method)))
    }

    /// Like `call`, but a `null` result is `Ok(None)` rather than an error
    pub async fn call_optional<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> AppResult<Option<T>> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let mut last_error = None;
        for (idx, url) in self.urls.iter().enumerate() {
            if idx > 0 {
                info!("🔄 Trying fallback RPC #{} for {}", idx, self.network_name);
            }
            match self.call_with_retry(url, &payload).await {
                Ok(result) => return Ok(result),
                Err(e) if !is_endpoint_failure(&e) => return Err(e),
                Err(e) => {
                    warn!("⚠️ RPC endpoint #{} failed on {}: {}", idx, self.network_name, e);
                    last_error = Some(e);
                }
            }
        }

        Err(AppError::endpoint_unavailable(format!(
            "All RPC endpoints failed for {} ({}): {}",
            self.network_name,
            method,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Execute call with exponential backoff and jitter
    async fn call_with_retry<T: DeserializeOwned>(
        &self,
        url: &str,
        payload: &serde_json::Value,
    ) -> AppResult<Option<T>> {
        let mut last_error = None;

        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let delay = self.backoff.delay(attempt - 1);
                debug!("⏳ Retry {}/{} after {}ms", attempt + 1, self.max_retries, delay.as_millis());
                tokio::time::sleep(delay).await;
            }

            match self.execute_call::<T>(url, payload).await {
                Ok(result) => return Ok(result),
                Err(e) if !is_endpoint_failure(&e) => return Err(e),
                Err(e) => {
                    if e.code == ErrorCode::RpcRateLimited {
                        warn!(
                            "⏳ Rate limited, backing off (attempt {}/{})",
                            attempt + 1,
                            self.max_retries
                        );
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            AppError::endpoint_unavailable(format!("No attempt made after {} retries", self.max_retries))
        }))
    }

    /// Execute single RPC call
    async fn execute_call<T: DeserializeOwned>(
        &self,
        url: &str,
        payload: &serde_json::Value,
    ) -> AppResult<Option<T>> {
        let response = self.client.post(url).json(payload).send().await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(AppError::rpc_rate_limited());
        }
        if !status.is_success() {
            return Err(AppError::endpoint_unavailable(format!("HTTP error: {}", status)));
        }

        let json: RpcResponse<T> = response.json().await.map_err(|e| {
            AppError::with_source(ErrorCode::RpcInvalidResponse, "Failed to parse response", e)
        })?;

        if let Some(error) = json.error {
            return Err(error.into_app_error());
        }

        Ok(json.result)
    }

    // ============================================
    // TYPED HELPERS
    // ============================================

    /// Execute eth_call against latest state
    pub async fn eth_call(&self, to: Address, data: &Bytes) -> AppResult<Bytes> {
        let params = serde_json::json!([{ "to": to, "data": data }, "latest"]);
        self.call::<Bytes>("eth_call", params).await
    }

    /// Native balance of an account
    pub async fn get_balance(&self, owner: Address) -> AppResult<U256> {
        self.call::<U256>("eth_getBalance", serde_json::json!([owner, "latest"]))
            .await
    }

    /// Current gas price in wei
    pub async fn gas_price(&self) -> AppResult<U256> {
        self.call::<U256>("eth_gasPrice", serde_json::json!([])).await
    }

    /// ERC-4337 account nonce (key 0) from the EntryPoint
    pub async fn get_nonce(&self, entry_point: Address, sender: Address) -> AppResult<U256> {
        let data = self.eth_call(entry_point, &abi::encode_get_nonce(sender)).await?;
        abi::decode_uint256(&data).ok_or_else(|| {
            AppError::new(ErrorCode::RpcInvalidResponse, "Undecodable getNonce result")
        })
    }

    /// ERC-20 allowance
    pub async fn allowance(&self, token: Address, owner: Address, spender: Address) -> AppResult<U256> {
        let data = self
            .eth_call(token, &abi::encode_allowance(owner, spender))
            .await?;
        abi::decode_uint256(&data).ok_or_else(|| {
            AppError::new(ErrorCode::RpcInvalidResponse, "Undecodable allowance result")
        })
    }

    /// Get RPC URL (masked for logging)
    pub fn masked_url(&self) -> String {
        self.urls.first().map(|u| mask_url(u)).unwrap_or_default()
    }

    /// Get chain ID
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn endpoint_count(&self) -> usize {
        self.urls.len()
    }

    // ============================================
    // BATCH REQUESTS
    // ============================================

    /// Execute batch JSON-RPC calls (max 50 per batch). Results come back in
    /// request order; each item fails independently.
    pub async fn batch_call<T: DeserializeOwned>(
        &self,
        requests: Vec<(String, serde_json::Value)>,
    ) -> AppResult<Vec<AppResult<T>>> {
        if requests.is_empty() {
            return Ok(vec![]);
        }

        let mut all_results = Vec::with_capacity(requests.len());

        for chunk in requests.chunks(MAX_BATCH_SIZE) {
            let batch_payload: Vec<BatchRequestItem> = chunk
                .iter()
                .enumerate()
                .map(|(idx, (method, params))| BatchRequestItem {
                    jsonrpc: "2.0",
                    method: method.clone(),
                    params: params.clone(),
                    id: idx as u64 + 1,
                })
                .collect();

            let results = self.execute_batch::<T>(&batch_payload).await?;
            all_results.extend(results);
        }

        Ok(all_results)
    }

    /// Execute one batch with retry, walking the endpoint list
    async fn execute_batch<T: DeserializeOwned>(
        &self,
        batch_payload: &[BatchRequestItem],
    ) -> AppResult<Vec<AppResult<T>>> {
        let mut last_error = None;

        for url in &self.urls {
            for attempt in 0..self.max_retries {
                if attempt > 0 {
                    tokio::time::sleep(self.backoff.delay(attempt - 1)).await;
                }

                let resp = match self.client.post(url).json(batch_payload).send().await {
                    Ok(resp) => resp,
                    Err(e) => {
                        last_error = Some(AppError::from(e));
                        continue;
                    }
                };

                let status = resp.status();
                if status.as_u16() == 429 {
                    last_error = Some(AppError::rpc_rate_limited());
                    continue;
                }
                if !status.is_success() {
                    last_error = Some(AppError::endpoint_unavailable(format!("HTTP error: {}", status)));
                    continue;
                }

                let batch_response: Vec<BatchResponseItem<T>> = resp.json().await.map_err(|e| {
                    AppError::with_source(ErrorCode::RpcInvalidResponse, "Failed to parse batch response", e)
                })?;

                return Ok(order_batch_results(batch_payload.len(), batch_response));
            }
        }

        Err(last_error.unwrap_or_else(|| {
            AppError::endpoint_unavailable(format!("Batch request failed on {}", self.network_name))
        }))
    }
}

/// Build the shared HTTP client (gzip, user agent, timeout)
pub fn build_http_client(timeout: Duration) -> AppResult<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_CONST));
    headers.insert("Content-Type", HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .gzip(true)
        .build()
        .map_err(|e| AppError::with_source(ErrorCode::ConfigInvalidValue, "Failed to build HTTP client", e))
}

/// Mask API keys embedded in a URL path
pub fn mask_url(url: &str) -> String {
    match url.split_once("/v2/") {
        Some((head, _)) => format!("{}/v2/***HIDDEN***", head),
        None => url.to_string(),
    }
}

/// Failures worth trying again or on another endpoint
fn is_endpoint_failure(err: &AppError) -> bool {
    matches!(
        err.code,
        ErrorCode::EndpointUnavailable | ErrorCode::RpcTimeout | ErrorCode::RpcRateLimited
    )
}

/// Re-order batch items by id; missing ids become per-item errors
fn order_batch_results<T>(len: usize, items: Vec<BatchResponseItem<T>>) -> Vec<AppResult<T>> {
    let mut by_id: HashMap<u64, BatchResponseItem<T>> =
        items.into_iter().map(|item| (item.id, item)).collect();

    (1..=len as u64)
        .map(|id| match by_id.remove(&id) {
            Some(BatchResponseItem { error: Some(error), .. }) => Err(error.into_app_error()),
            Some(BatchResponseItem { result: Some(result), .. }) => Ok(result),
            _ => Err(AppError::new(
                ErrorCode::RpcInvalidResponse,
                format!("No result in batch response for id {}", id),
            )),
        })
        .collect()
}

/// JSON-RPC response structure
#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

/// JSON-RPC error structure
#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    /// Rate limit error (HTTP 429 equivalent or code -32005)
    pub fn is_rate_limit(&self) -> bool {
        self.code == -32005 || self.message.to_lowercase().contains("rate limit")
    }

    pub fn into_app_error(self) -> AppError {
        if self.is_rate_limit() {
            AppError::rpc_rate_limited()
        } else {
            AppError::new(
                ErrorCode::RpcError,
                format!("RPC error: {} (code: {})", self.message, self.code),
            )
        }
    }
}
