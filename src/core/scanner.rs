//! Chain Scanner Module
//!
//! `ChainScanner` is the capability set one chain offers: list a wallet's
//! holdings and price a token. `EvmChainScanner` implements it over
//! JSON-RPC with Multicall3 batching; chain differences live in
//! `ChainConfig`, not in subtypes. `CachedScanner` wraps any scanner with
//! the shared cache, the per-chain RPC limit and the price staleness bound,
//! and produces the `ChainBalance` records the classifier consumes.

use alloy_primitives::{Address, Bytes, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::models::config::{CacheTtls, ChainConfig};
use crate::models::errors::{AppError, AppResult, ErrorCode};
use crate::models::types::{ChainBalance, TokenHolding, TokenPrice, WalletAddress};
use crate::providers::registry::ChainLimits;
use crate::providers::rpc::RpcProvider;
use crate::utils::abi;
use crate::utils::cache::SweepCache;
use crate::utils::constants::{units_to_f64, NATIVE_TOKEN};

// ============================================
// CAPABILITIES
// ============================================

/// Source of the token set a wallet may hold (indexer, static list)
#[async_trait]
pub trait TokenDiscovery: Send + Sync {
    fn name(&self) -> &str;

    async fn discover(&self, chain_id: u64, wallet: Address) -> AppResult<Vec<Address>>;
}

/// USD price source
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &str;

    /// `PriceUnavailable` when the source has no price for the token
    async fn price(&self, chain_id: u64, token: Address) -> AppResult<TokenPrice>;
}

/// Holdings of one wallet on one chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldingsSnapshot {
    pub holdings: Vec<TokenHolding>,
    /// False when discovery failed and only the native balance is known
    pub discovery_complete: bool,
}

/// Capability interface of one chain
#[async_trait]
pub trait ChainScanner: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn list_holdings(&self, wallet: Address) -> AppResult<HoldingsSnapshot>;

    async fn price_of(&self, token: Address) -> AppResult<TokenPrice>;
}

// ============================================
// EVM SCANNER
// ============================================

/// JSON-RPC backed scanner for EVM chains
pub struct EvmChainScanner {
    config: ChainConfig,
    rpc: RpcProvider,
    discovery: Option<Arc<dyn TokenDiscovery>>,
    prices: Arc<dyn PriceSource>,
}

impl EvmChainScanner {
    pub fn new(
        config: ChainConfig,
        rpc: RpcProvider,
        discovery: Option<Arc<dyn TokenDiscovery>>,
        prices: Arc<dyn PriceSource>,
    ) -> Self {
        Self {
            config,
            rpc,
            discovery,
            prices,
        }
    }

    /// Balances and decimals for `tokens`; zero balances are dropped
    async fn token_holdings(&self, wallet: Address, tokens: &[Address]) -> AppResult<Vec<TokenHolding>> {
        let mut holdings = Vec::new();
        let batch_size = self.config.multicall_batch_size.max(1);

        for chunk in tokens.chunks(batch_size) {
            let pairs = match self.config.multicall {
                Some(multicall) => match self.multicall_chunk(multicall, wallet, chunk).await {
                    Ok(pairs) => pairs,
                    Err(e) if e.code == ErrorCode::RpcError || e.code == ErrorCode::RpcInvalidResponse => {
                        warn!(
                            "⚠️ Multicall failed on chain {} ({}), falling back to batch eth_call",
                            self.config.chain_id, e
                        );
                        self.batch_chunk(wallet, chunk).await?
                    }
                    Err(e) => return Err(e),
                },
                None => self.batch_chunk(wallet, chunk).await?,
            };

            for (token, pair) in chunk.iter().zip(pairs) {
                if let Some((raw_amount, decimals)) = pair {
                    if raw_amount > U256::ZERO {
                        holdings.push(TokenHolding {
                            token_address: *token,
                            raw_amount,
                            decimals,
                            symbol: None,
                        });
                    }
                }
            }
        }

        Ok(holdings)
    }

    /// One `aggregate3` round trip: balanceOf + decimals per token
    async fn multicall_chunk(
        &self,
        multicall: Address,
        wallet: Address,
        tokens: &[Address],
    ) -> AppResult<Vec<Option<(U256, u8)>>> {
        let calls: Vec<(Address, Bytes)> = tokens
            .iter()
            .flat_map(|token| {
                [
                    (*token, abi::encode_balance_of(wallet)),
                    (*token, abi::encode_decimals()),
                ]
            })
            .collect();

        let data = self.rpc.eth_call(multicall, &abi::encode_aggregate3(&calls)).await?;
        let results = abi::decode_aggregate3(&data).ok_or_else(|| {
            AppError::new(ErrorCode::RpcInvalidResponse, "Undecodable aggregate3 result")
        })?;
        if results.len() != calls.len() {
            return Err(AppError::new(
                ErrorCode::RpcInvalidResponse,
                format!("aggregate3 returned {} results for {} calls", results.len(), calls.len()),
            ));
        }

        Ok(results
            .chunks(2)
            .map(|pair| decode_pair((pair[0].0, &pair[0].1), (pair[1].0, &pair[1].1)))
            .collect())
    }

    /// JSON-RPC batch fallback for chains without Multicall3
    async fn batch_chunk(&self, wallet: Address, tokens: &[Address]) -> AppResult<Vec<Option<(U256, u8)>>> {
        let requests: Vec<(String, serde_json::Value)> = tokens
            .iter()
            .flat_map(|token| {
                [
                    (
                        "eth_call".to_string(),
                        serde_json::json!([{ "to": token, "data": abi::encode_balance_of(wallet) }, "latest"]),
                    ),
                    (
                        "eth_call".to_string(),
                        serde_json::json!([{ "to": token, "data": abi::encode_decimals() }, "latest"]),
                    ),
                ]
            })
            .collect();

        let results = self.rpc.batch_call::<Bytes>(requests).await?;

        Ok(results
            .chunks(2)
            .map(|pair| match (&pair[0], &pair[1]) {
                (Ok(balance), Ok(decimals)) => decode_pair((true, balance), (true, decimals)),
                _ => None,
            })
            .collect())
    }
}

fn decode_pair(balance: (bool, &Bytes), decimals: (bool, &Bytes)) -> Option<(U256, u8)> {
    if !balance.0 || !decimals.0 {
        return None;
    }
    Some((abi::decode_uint256(balance.1)?, abi::decode_decimals(decimals.1)?))
}

#[async_trait]
impl ChainScanner for EvmChainScanner {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    async fn list_holdings(&self, wallet: Address) -> AppResult<HoldingsSnapshot> {
        let native = self.rpc.get_balance(wallet).await?;
        let mut holdings = Vec::new();
        if native > U256::ZERO {
            holdings.push(TokenHolding {
                token_address: NATIVE_TOKEN,
                raw_amount: native,
                decimals: 18,
                symbol: Some(self.config.native_symbol.clone()),
            });
        }

        let discovery = match &self.discovery {
            Some(discovery) => discovery,
            None => {
                return Ok(HoldingsSnapshot {
                    holdings,
                    discovery_complete: true,
                })
            }
        };

        let tokens = match discovery.discover(self.config.chain_id, wallet).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(
                    "⚠️ Token discovery ({}) failed on {}: {}; native balance only",
                    discovery.name(),
                    self.config.name,
                    e
                );
                return Ok(HoldingsSnapshot {
                    holdings,
                    discovery_complete: false,
                });
            }
        };

        match self.token_holdings(wallet, &tokens).await {
            Ok(tokens) => {
                holdings.extend(tokens);
                Ok(HoldingsSnapshot {
                    holdings,
                    discovery_complete: true,
                })
            }
            Err(e) => {
                warn!("⚠️ Token balance read failed on {}: {}; native balance only", self.config.name, e);
                Ok(HoldingsSnapshot {
                    holdings,
                    discovery_complete: false,
                })
            }
        }
    }

    async fn price_of(&self, token: Address) -> AppResult<TokenPrice> {
        let priced = if token == NATIVE_TOKEN {
            self.config.wrapped_native.ok_or_else(|| {
                AppError::price_unavailable(format!("No wrapped native token on {}", self.config.name))
            })?
        } else {
            token
        };
        self.prices.price(self.config.chain_id, priced).await
    }
}

// ============================================
// CACHED SCANNER
// ============================================

/// Result of scanning one wallet on one chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub chain_id: u64,
    pub wallet: WalletAddress,
    pub balances: Vec<ChainBalance>,
    pub discovery_complete: bool,
    pub scanned_at: DateTime<Utc>,
}

impl ScanReport {
    /// Reference recorded on the job instead of a copy of the balances
    pub fn scan_ref(&self) -> String {
        format!("scan:{}:{}:{}", self.chain_id, self.wallet, self.scanned_at.timestamp_millis())
    }

    pub fn unpriced_count(&self) -> usize {
        self.balances.iter().filter(|b| !b.is_priced()).count()
    }
}

/// Scanner behind the shared cache and the chain's RPC limit
pub struct CachedScanner {
    scanner: Arc<dyn ChainScanner>,
    cache: SweepCache,
    limits: ChainLimits,
    ttls: CacheTtls,
    staleness: Duration,
}

impl CachedScanner {
    pub fn new(
        scanner: Arc<dyn ChainScanner>,
        cache: SweepCache,
        limits: ChainLimits,
        ttls: CacheTtls,
        staleness: Duration,
    ) -> Self {
        Self {
            scanner,
            cache,
            limits,
            ttls,
            staleness,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.scanner.chain_id()
    }

    fn holdings_key(&self, wallet: &WalletAddress) -> String {
        format!("holdings:{}:{}", self.chain_id(), wallet)
    }

    /// Value every holding of `wallet` on this chain
    pub async fn scan(&self, wallet: &WalletAddress) -> AppResult<ScanReport> {
        let chain_id = self.chain_id();
        let key = self.holdings_key(wallet);
        let address = wallet.address();

        let snapshot: HoldingsSnapshot = self
            .cache
            .get_or_fetch(&key, self.ttls.holdings, || async {
                let _permit = self.limits.acquire(chain_id).await?;
                self.scanner.list_holdings(address).await
            })
            .await?;

        // A degraded token set must not be served from cache
        if !snapshot.discovery_complete {
            self.cache.invalidate(&key);
        }

        let now = Utc::now();
        let balances = join_all(
            snapshot
                .holdings
                .iter()
                .map(|holding| self.value_holding(holding, now)),
        )
        .await
        .into_iter()
        .collect::<AppResult<Vec<_>>>()?;

        let report = ScanReport {
            chain_id,
            wallet: *wallet,
            balances,
            discovery_complete: snapshot.discovery_complete,
            scanned_at: now,
        };

        info!(
            chain_id,
            wallet = %wallet,
            holdings = report.balances.len(),
            unpriced = report.unpriced_count(),
            "🔍 Scan complete"
        );
        Ok(report)
    }

    /// Cached USD price of a token
    pub async fn price_of(&self, token: Address) -> AppResult<TokenPrice> {
        let chain_id = self.chain_id();
        let key = format!("price:{}:{:#x}", chain_id, token);
        self.cache
            .get_or_fetch(&key, self.ttls.price, || async {
                let _permit = self.limits.acquire(chain_id).await?;
                self.scanner.price_of(token).await
            })
            .await
    }

    /// Drop the cached holdings index (after a sweep lands)
    pub fn invalidate_holdings(&self, wallet: &WalletAddress) {
        self.cache.invalidate(&self.holdings_key(wallet));
    }

    /// Only a missing price leaves the balance unvalued; an unreachable
    /// price source fails the scan so it can be retried.
    async fn value_holding(
        &self,
        holding: &TokenHolding,
        now: DateTime<Utc>,
    ) -> AppResult<ChainBalance> {
        let mut balance = ChainBalance {
            chain_id: self.chain_id(),
            token_address: holding.token_address,
            symbol: holding.symbol.clone(),
            raw_amount: holding.raw_amount,
            decimals: holding.decimals,
            usd_value: None,
            price_as_of: None,
            stale: false,
        };

        match self.price_of(holding.token_address).await {
            Ok(price) => {
                let age = price.age(now);
                balance.stale = age.num_milliseconds() > self.staleness.as_millis() as i64;
                balance.usd_value = Some(units_to_f64(holding.raw_amount, holding.decimals) * price.usd);
                balance.price_as_of = Some(price.as_of);
                if balance.stale {
                    debug!(
                        "⏳ Stale price for {} ({}s old)",
                        balance.label(),
                        age.num_seconds()
                    );
                }
            }
            Err(e) if e.code == ErrorCode::PriceUnavailable => {
                debug!("💸 No price for {}: {}", balance.label(), e);
            }
            Err(e) => return Err(e),
        }

        Ok(balance)
    }
}
