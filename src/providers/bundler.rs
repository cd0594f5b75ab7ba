//! ERC-4337 Bundler & Paymaster Clients
//!
//! JSON-RPC clients for the user operation namespace (EntryPoint v0.6):
//! - `eth_sendUserOperation` / `eth_getUserOperationReceipt` on the bundler
//! - `pm_sponsorUserOperation` on the paymaster
//!
//! Both reuse `RpcProvider`, so endpoint retry, gzip and key masking behave
//! exactly like ordinary chain RPC.

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::rpc::RpcProvider;
use crate::core::sponsorship::Paymaster;
use crate::core::submitter::{Bundler, LogEntry, UserOpReceipt};
use crate::models::config::{ChainConfig, EngineConfig};
use crate::models::errors::{AppError, AppResult, ErrorCode};
use crate::models::types::{GasLimits, SponsorshipData, UserOperationBatch};
use crate::utils::backoff::Backoff;

// ============================================
// WIRE TYPES
// ============================================

/// v0.6 user operation as the bundler namespace expects it
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationJson {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl From<&UserOperationBatch> for UserOperationJson {
    fn from(batch: &UserOperationBatch) -> Self {
        Self {
            sender: batch.sender,
            nonce: batch.nonce,
            init_code: batch.init_code.clone(),
            call_data: batch.call_data.clone(),
            call_gas_limit: batch.gas.call_gas_limit,
            verification_gas_limit: batch.gas.verification_gas_limit,
            pre_verification_gas: batch.gas.pre_verification_gas,
            max_fee_per_gas: batch.gas.max_fee_per_gas,
            max_priority_fee_per_gas: batch.gas.max_priority_fee_per_gas,
            paymaster_and_data: batch.paymaster_and_data(),
            signature: batch.signature.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: Address,
    #[serde(default)]
    pub topics: Vec<B256>,
    #[serde(default)]
    pub data: Bytes,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTxReceipt {
    pub transaction_hash: Option<B256>,
}

/// `eth_getUserOperationReceipt` result
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawUserOpReceipt {
    pub user_op_hash: B256,
    pub success: bool,
    #[serde(default)]
    pub actual_gas_cost: U256,
    #[serde(default)]
    pub actual_gas_used: U256,
    pub reason: Option<String>,
    #[serde(default)]
    pub logs: Vec<RawLog>,
    pub receipt: Option<RawTxReceipt>,
}

impl From<RawUserOpReceipt> for UserOpReceipt {
    fn from(raw: RawUserOpReceipt) -> Self {
        Self {
            success: raw.success,
            tx_hash: raw.receipt.and_then(|r| r.transaction_hash),
            gas_used: raw.actual_gas_used,
            actual_gas_cost: raw.actual_gas_cost,
            reason: raw.reason.filter(|r| !r.is_empty() && r != "0x"),
            logs: raw
                .logs
                .into_iter()
                .map(|l| LogEntry {
                    address: l.address,
                    topics: l.topics,
                    data: l.data,
                })
                .collect(),
        }
    }
}

/// `pm_sponsorUserOperation` result
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsorResult {
    pub paymaster_and_data: Bytes,
    pub call_gas_limit: Option<U256>,
    pub verification_gas_limit: Option<U256>,
    pub pre_verification_gas: Option<U256>,
}

impl SponsorResult {
    /// Merge re-estimated limits over the batch's own
    fn gas_overrides(&self, current: &GasLimits) -> Option<GasLimits> {
        if self.call_gas_limit.is_none() && self.verification_gas_limit.is_none() && self.pre_verification_gas.is_none() {
            return None;
        }
        Some(GasLimits {
            call_gas_limit: self.call_gas_limit.unwrap_or(current.call_gas_limit),
            verification_gas_limit: self.verification_gas_limit.unwrap_or(current.verification_gas_limit),
            pre_verification_gas: self.pre_verification_gas.unwrap_or(current.pre_verification_gas),
            ..current.clone()
        })
    }
}

/// Map bundler rejections onto the engine taxonomy
fn classify_bundler_error(err: AppError) -> AppError {
    if err.code != ErrorCode::RpcError {
        return err;
    }
    // AA25: the account nonce no longer matches
    if err.message.contains("AA25") {
        return AppError::new(ErrorCode::NonceStale, err.message);
    }
    AppError::submission_failed(err.message)
}

/// Providers for every chain that configures `url_of`
fn providers_for(
    config: &EngineConfig,
    url_of: impl Fn(&ChainConfig) -> Option<String>,
    timeout: Duration,
) -> AppResult<HashMap<u64, RpcProvider>> {
    let mut providers = HashMap::new();
    for (chain_id, chain) in &config.chains {
        if let Some(url) = url_of(chain) {
            // Callers run their own retry loops
            let provider = RpcProvider::new(*chain_id, vec![url], timeout)?
                .with_retries(1, Backoff::new(config.retry.backoff_base, config.retry.backoff_max));
            providers.insert(*chain_id, provider);
        }
    }
    Ok(providers)
}

// ============================================
// BUNDLER CLIENT
// ============================================

pub struct BundlerClient {
    endpoints: HashMap<u64, RpcProvider>,
}

impl BundlerClient {
    pub fn from_config(config: &EngineConfig) -> AppResult<Self> {
        let endpoints = providers_for(config, |c| c.bundler_url.clone(), config.timeouts.bundler)?;
        for provider in endpoints.values() {
            info!("📦 Bundler for chain {}: {}", provider.chain_id(), provider.masked_url());
        }
        Ok(Self { endpoints })
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        self.endpoints.keys().copied().collect()
    }

    fn endpoint(&self, chain_id: u64) -> AppResult<&RpcProvider> {
        self.endpoints
            .get(&chain_id)
            .ok_or_else(|| AppError::submission_failed(format!("no bundler configured for chain {}", chain_id)))
    }
}

#[async_trait]
impl Bundler for BundlerClient {
    async fn send_user_operation(&self, batch: &UserOperationBatch) -> AppResult<B256> {
        let provider = self.endpoint(batch.chain_id)?;
        let params = serde_json::json!([UserOperationJson::from(batch), batch.entry_point]);
        provider
            .call::<B256>("eth_sendUserOperation", params)
            .await
            .map_err(classify_bundler_error)
    }

    async fn user_operation_receipt(&self, chain_id: u64, user_op_hash: B256) -> AppResult<Option<UserOpReceipt>> {
        let provider = self.endpoint(chain_id)?;
        let receipt = provider
            .call_optional::<RawUserOpReceipt>("eth_getUserOperationReceipt", serde_json::json!([user_op_hash]))
            .await?;
        if let Some(raw) = &receipt {
            debug!("🧾 {} included (success: {})", raw.user_op_hash, raw.success);
        }
        Ok(receipt.map(UserOpReceipt::from))
    }
}

// ============================================
// PAYMASTER CLIENT
// ============================================

pub struct PaymasterClient {
    endpoints: HashMap<u64, RpcProvider>,
}

impl PaymasterClient {
    pub fn from_config(config: &EngineConfig) -> AppResult<Self> {
        let endpoints = providers_for(config, |c| c.paymaster_url.clone(), config.timeouts.bundler)?;
        for provider in endpoints.values() {
            info!("⛽ Paymaster for chain {}: {}", provider.chain_id(), provider.masked_url());
        }
        Ok(Self { endpoints })
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        self.endpoints.keys().copied().collect()
    }
}

#[async_trait]
impl Paymaster for PaymasterClient {
    async fn sponsor(&self, batch: &UserOperationBatch, policy_id: &str) -> AppResult<SponsorshipData> {
        let provider = self.endpoints.get(&batch.chain_id).ok_or_else(|| {
            AppError::new(
                ErrorCode::PaymasterUnavailable,
                format!("no paymaster configured for chain {}", batch.chain_id),
            )
        })?;

        let params = serde_json::json!([
            UserOperationJson::from(batch),
            batch.entry_point,
            { "sponsorshipPolicyId": policy_id }
        ]);

        let result = match provider.call::<SponsorResult>("pm_sponsorUserOperation", params).await {
            Ok(result) => result,
            Err(e) if e.code == ErrorCode::RpcError => {
                warn!("⛽ Paymaster refused operation for {}: {}", batch.sender, e.message);
                return Err(AppError::sponsorship_denied(e.message));
            }
            Err(e) => {
                return Err(AppError::new(
                    ErrorCode::PaymasterUnavailable,
                    format!("pm_sponsorUserOperation: {}", e.message),
                ))
            }
        };

        Ok(SponsorshipData {
            gas_overrides: result.gas_overrides(&batch.gas),
            paymaster_and_data: result.paymaster_and_data,
            sponsored_gas_usd: batch.estimated_gas_usd,
            policy_id: policy_id.to_string(),
            valid_until: None,
        })
    }
}
