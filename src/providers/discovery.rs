//! Token Discovery Sources
//!
//! Answers "which ERC-20 contracts might this wallet hold?" for the chain
//! scanner. Balances themselves are always re-read on-chain through
//! multicall, so discovery only needs to be a superset.
//!
//! 1. Alchemy Token API - `alchemy_getTokenBalances` (20 CU)
//! 2. Static list - fixed per-chain contracts from configuration

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use super::rpc::RpcProvider;
use crate::core::scanner::TokenDiscovery;
use crate::models::errors::{AppError, AppResult, ErrorCode};

// ============================================
// ALCHEMY TOKEN API TYPES
// ============================================

/// Token balance entry
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalance {
    pub contract_address: String,
    pub token_balance: Option<String>,
    pub error: Option<String>,
}

/// Response from alchemy_getTokenBalances
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalancesResponse {
    pub address: String,
    pub token_balances: Vec<TokenBalance>,
}

impl TokenBalancesResponse {
    /// Contracts with a readable, non-zero balance
    pub fn held_tokens(&self) -> Vec<Address> {
        self.token_balances
            .iter()
            .filter(|b| b.error.is_none())
            .filter(|b| {
                b.token_balance
                    .as_deref()
                    .and_then(|raw| U256::from_str(raw).ok())
                    .map(|v| !v.is_zero())
                    .unwrap_or(false)
            })
            .filter_map(|b| Address::from_str(&b.contract_address).ok())
            .collect()
    }
}

// ============================================
// ALCHEMY DISCOVERY
// ============================================

/// Indexer-backed discovery through the Alchemy Token API
pub struct AlchemyTokenDiscovery {
    provider: RpcProvider,
}

impl AlchemyTokenDiscovery {
    pub fn new(chain_id: u64, url: String, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            provider: RpcProvider::new(chain_id, vec![url], timeout)?,
        })
    }

    pub fn from_provider(provider: RpcProvider) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl TokenDiscovery for AlchemyTokenDiscovery {
    fn name(&self) -> &str {
        "alchemy"
    }

    async fn discover(&self, chain_id: u64, wallet: Address) -> AppResult<Vec<Address>> {
        if chain_id != self.provider.chain_id() {
            return Err(AppError::unsupported_chain(chain_id));
        }

        debug!("💰 Fetching token balances for {} on chain {}", wallet, chain_id);
        let params = serde_json::json!([wallet, "erc20"]);
        let response = self
            .provider
            .call::<TokenBalancesResponse>("alchemy_getTokenBalances", params)
            .await
            .map_err(|e| {
                AppError::new(
                    ErrorCode::DiscoveryFailed,
                    format!("alchemy_getTokenBalances on chain {}: {}", chain_id, e.message),
                )
            })?;

        let failed = response.token_balances.iter().filter(|b| b.error.is_some()).count();
        if failed > 0 {
            warn!("⚠️ {} token balances unreadable for {} on chain {}", failed, wallet, chain_id);
        }

        Ok(response.held_tokens())
    }
}

// ============================================
// STATIC LIST
// ============================================

/// Fixed token list per chain
#[derive(Debug, Clone, Default)]
pub struct StaticTokenList {
    tokens: HashMap<u64, Vec<Address>>,
}

impl StaticTokenList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chain(mut self, chain_id: u64, tokens: Vec<Address>) -> Self {
        self.tokens.insert(chain_id, tokens);
        self
    }
}

#[async_trait]
impl TokenDiscovery for StaticTokenList {
    fn name(&self) -> &str {
        "static"
    }

    async fn discover(&self, chain_id: u64, _wallet: Address) -> AppResult<Vec<Address>> {
        Ok(self.tokens.get(&chain_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_held_tokens_skips_zero_and_errors() {
        let json = r#"{
            "address": "0x4242424242424242424242424242424242424242",
            "tokenBalances": [
                {"contractAddress": "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48", "tokenBalance": "0x00000000000000000000000000000000000000000000000000000000000f4240", "error": null},
                {"contractAddress": "0xdac17f958d2ee523a2206206994597c13d831ec7", "tokenBalance": "0x0000000000000000000000000000000000000000000000000000000000000000", "error": null},
                {"contractAddress": "0x6b175474e89094c44da98b954eedeac495271d0f", "tokenBalance": null, "error": "execution reverted"}
            ]
        }"#;

        let response: TokenBalancesResponse = serde_json::from_str(json).unwrap();
        let held = response.held_tokens();
        assert_eq!(held.len(), 1);
        assert_eq!(
            held[0],
            Address::from_str("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48").unwrap()
        );
    }

    #[tokio::test]
    async fn test_static_list_per_chain() {
        let token = Address::repeat_byte(0x11);
        let list = StaticTokenList::new().with_chain(8453, vec![token]);
        assert_eq!(list.discover(8453, Address::ZERO).await.unwrap(), vec![token]);
        assert!(list.discover(1, Address::ZERO).await.unwrap().is_empty());
    }
}
