//! USD Price Sources
//!
//! 1. Alchemy Prices API - `POST /prices/v1/{key}/tokens/by-address` (40 CU)
//! 2. DexScreener - `GET /latest/dex/tokens/{address}`, free, no key
//! 3. Fallback chain - first source with an answer wins
//!
//! The native asset is priced through the chain's wrapped token, since
//! neither API knows the `0xEeee…` sentinel.

use alloy_primitives::Address;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::rpc::build_http_client;
use crate::core::scanner::PriceSource;
use crate::models::errors::{AppError, AppResult};
use crate::models::types::TokenPrice;
use crate::utils::constants::{
    chain_id_to_dexscreener_name, get_alchemy_subdomain, get_wrapped_native, NATIVE_TOKEN,
};

/// Token address the price APIs understand
fn priced_address(chain_id: u64, token: Address) -> AppResult<Address> {
    if token == NATIVE_TOKEN {
        get_wrapped_native(chain_id).ok_or_else(|| {
            AppError::price_unavailable(format!("no wrapped native token for chain {}", chain_id))
        })
    } else {
        Ok(token)
    }
}

// ============================================
// ALCHEMY PRICES API
// ============================================

/// Individual price entry
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceEntry {
    pub currency: String,
    pub value: String,
    pub last_updated_at: String,
}

/// Prices for one address
#[derive(Debug, Clone, Deserialize)]
pub struct AddressPrices {
    pub network: String,
    pub address: String,
    #[serde(default)]
    pub prices: Vec<PriceEntry>,
    pub error: Option<String>,
}

/// Prices API response
#[derive(Debug, Clone, Deserialize)]
pub struct PricesResponse {
    pub data: Vec<AddressPrices>,
}

impl PricesResponse {
    /// USD price of the first entry, with its publication time
    pub fn usd_price(&self) -> AppResult<TokenPrice> {
        let entry = self
            .data
            .first()
            .ok_or_else(|| AppError::price_unavailable("alchemy: empty price response"))?;
        if let Some(err) = &entry.error {
            return Err(AppError::price_unavailable(format!("alchemy: {}", err)));
        }

        let price = entry
            .prices
            .iter()
            .find(|p| p.currency.eq_ignore_ascii_case("usd"))
            .ok_or_else(|| AppError::price_unavailable(format!("alchemy: no usd price for {}", entry.address)))?;

        let usd: f64 = price
            .value
            .parse()
            .map_err(|_| AppError::price_unavailable(format!("alchemy: bad price value {}", price.value)))?;
        if !usd.is_finite() || usd < 0.0 {
            return Err(AppError::price_unavailable(format!("alchemy: bad price value {}", price.value)));
        }

        let as_of = DateTime::parse_from_rfc3339(&price.last_updated_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(TokenPrice {
            usd,
            as_of,
            source: "alchemy".to_string(),
        })
    }
}

/// Alchemy Prices API client
pub struct AlchemyPriceSource {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AlchemyPriceSource {
    pub fn new(api_key: String, timeout: Duration) -> AppResult<Self> {
        if api_key.is_empty() || api_key == "YOUR_API_KEY" {
            return Err(AppError::missing_env("ALCHEMY_API_KEY"));
        }
        Ok(Self {
            client: build_http_client(timeout)?,
            api_key,
            base_url: "https://api.g.alchemy.com/prices/v1".to_string(),
        })
    }
}

#[async_trait]
impl PriceSource for AlchemyPriceSource {
    fn name(&self) -> &str {
        "alchemy"
    }

    async fn price(&self, chain_id: u64, token: Address) -> AppResult<TokenPrice> {
        let network = get_alchemy_subdomain(chain_id).ok_or_else(|| AppError::unsupported_chain(chain_id))?;
        let address = priced_address(chain_id, token)?;

        // Key is part of the path; never log the URL
        let url = format!("{}/{}/tokens/by-address", self.base_url, self.api_key);
        let body = serde_json::json!({
            "addresses": [{ "network": network, "address": address }]
        });

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(AppError::rpc_rate_limited());
        }
        if !status.is_success() {
            return Err(AppError::endpoint_unavailable(format!("Prices API error: {}", status)));
        }

        let parsed: PricesResponse = response.json().await?;
        let price = parsed.usd_price()?;
        debug!("💵 alchemy price {} on {}: ${}", token, network, price.usd);
        Ok(price)
    }
}

// ============================================
// DEXSCREENER
// ============================================

/// DexScreener API response
#[derive(Debug, Deserialize)]
pub struct DexScreenerResponse {
    #[serde(default)]
    pub pairs: Option<Vec<DexPair>>,
}

/// A trading pair from DexScreener
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DexPair {
    /// Chain name (e.g., "ethereum", "bsc", "base")
    pub chain_id: String,
    pub dex_id: String,
    pub base_token: DexToken,
    pub liquidity: Option<DexLiquidity>,
    /// Base token price in USD
    pub price_usd: Option<String>,
}

impl DexPair {
    fn liquidity_usd(&self) -> f64 {
        self.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DexToken {
    pub address: String,
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DexLiquidity {
    pub usd: Option<f64>,
}

/// Price from the deepest pair on `chain_name` where `token` is the base
/// token. Thin pairs below `min_liquidity_usd` are ignored.
pub fn best_pair_price(pairs: &[DexPair], chain_name: &str, token: Address, min_liquidity_usd: f64) -> Option<f64> {
    let mut candidates: Vec<&DexPair> = pairs
        .iter()
        .filter(|p| p.chain_id.eq_ignore_ascii_case(chain_name))
        .filter(|p| {
            Address::from_str(&p.base_token.address)
                .map(|a| a == token)
                .unwrap_or(false)
        })
        .filter(|p| p.liquidity_usd() >= min_liquidity_usd)
        .collect();

    // Sort by liquidity (highest first)
    candidates.sort_by(|a, b| {
        b.liquidity_usd()
            .partial_cmp(&a.liquidity_usd())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    candidates
        .into_iter()
        .filter_map(|p| p.price_usd.as_deref()?.parse::<f64>().ok())
        .find(|usd| usd.is_finite() && *usd >= 0.0)
}

/// DexScreener price client
pub struct DexScreenerPriceSource {
    client: reqwest::Client,
    base_url: String,
    min_liquidity_usd: f64,
}

impl DexScreenerPriceSource {
    pub fn new(timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            client: build_http_client(timeout)?,
            base_url: "https://api.dexscreener.com/latest/dex".to_string(),
            min_liquidity_usd: 1_000.0,
        })
    }

    pub fn with_min_liquidity(mut self, usd: f64) -> Self {
        self.min_liquidity_usd = usd;
        self
    }
}

#[async_trait]
impl PriceSource for DexScreenerPriceSource {
    fn name(&self) -> &str {
        "dexscreener"
    }

    async fn price(&self, chain_id: u64, token: Address) -> AppResult<TokenPrice> {
        let chain_name = chain_id_to_dexscreener_name(chain_id).ok_or_else(|| AppError::unsupported_chain(chain_id))?;
        let address = priced_address(chain_id, token)?;

        let url = format!("{}/tokens/{}", self.base_url, address);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(AppError::rpc_rate_limited());
        }
        if !status.is_success() {
            return Err(AppError::endpoint_unavailable(format!("DexScreener API error: {}", status)));
        }

        let data: DexScreenerResponse = response.json().await?;
        let pairs = data.pairs.unwrap_or_default();
        let usd = best_pair_price(&pairs, chain_name, address, self.min_liquidity_usd).ok_or_else(|| {
            AppError::price_unavailable(format!("dexscreener: no liquid pair for {} on {}", address, chain_name))
        })?;

        debug!("💵 dexscreener price {} on {}: ${} ({} pairs)", token, chain_name, usd, pairs.len());
        // DexScreener lags a few seconds and carries no timestamp
        Ok(TokenPrice {
            usd,
            as_of: Utc::now(),
            source: "dexscreener".to_string(),
        })
    }
}

// ============================================
// FALLBACK CHAIN
// ============================================

/// Tries each source in order; the first price wins
pub struct FallbackPriceSource {
    sources: Vec<Arc<dyn PriceSource>>,
}

impl FallbackPriceSource {
    pub fn new(sources: Vec<Arc<dyn PriceSource>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl PriceSource for FallbackPriceSource {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn price(&self, chain_id: u64, token: Address) -> AppResult<TokenPrice> {
        let mut reasons = Vec::with_capacity(self.sources.len());
        let mut outage = None;
        for source in &self.sources {
            match source.price(chain_id, token).await {
                Ok(price) => return Ok(price),
                Err(e) => {
                    warn!("⚠️ {} has no price for {} on chain {}: {}", source.name(), token, chain_id, e);
                    if outage.is_none() && e.code.is_retryable() {
                        outage = Some(e.code);
                    }
                    reasons.push(format!("{}: {}", source.name(), e.message));
                }
            }
        }

        // A source that was down may still know the token; retry later
        let message = format!("no price for {} on chain {} ({})", token, chain_id, reasons.join("; "));
        Err(match outage {
            Some(code) => AppError::new(code, message),
            None => AppError::price_unavailable(message),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::errors::ErrorCode;

    #[test]
    fn test_alchemy_usd_price() {
        let json = r#"{
            "data": [{
                "network": "base-mainnet",
                "address": "0x4200000000000000000000000000000000000006",
                "prices": [
                    {"currency": "eur", "value": "2900.1", "lastUpdatedAt": "2024-05-01T10:00:00Z"},
                    {"currency": "usd", "value": "3120.55", "lastUpdatedAt": "2024-05-01T10:00:00Z"}
                ],
                "error": null
            }]
        }"#;
        let response: PricesResponse = serde_json::from_str(json).unwrap();
        let price = response.usd_price().unwrap();
        assert!((price.usd - 3120.55).abs() < 1e-9);
        assert_eq!(price.as_of.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert_eq!(price.source, "alchemy");
    }

    #[test]
    fn test_alchemy_missing_price_is_unavailable() {
        let json = r#"{"data": [{"network": "eth-mainnet", "address": "0x01", "prices": [], "error": "Token not found"}]}"#;
        let response: PricesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.usd_price().unwrap_err().code, ErrorCode::PriceUnavailable);
    }

    #[test]
    fn test_best_pair_prefers_liquidity_on_chain() {
        let token = "0x1111111111111111111111111111111111111111";
        let json = format!(
            r#"{{"pairs": [
                {{"chainId": "base", "dexId": "aerodrome", "baseToken": {{"address": "{t}", "symbol": "T"}}, "liquidity": {{"usd": 5000.0}}, "priceUsd": "1.10"}},
                {{"chainId": "base", "dexId": "uniswap", "baseToken": {{"address": "{t}", "symbol": "T"}}, "liquidity": {{"usd": 90000.0}}, "priceUsd": "1.00"}},
                {{"chainId": "ethereum", "dexId": "uniswap", "baseToken": {{"address": "{t}", "symbol": "T"}}, "liquidity": {{"usd": 900000.0}}, "priceUsd": "0.90"}},
                {{"chainId": "base", "dexId": "scam", "baseToken": {{"address": "{t}", "symbol": "T"}}, "liquidity": {{"usd": 10.0}}, "priceUsd": "50.0"}}
            ]}}"#,
            t = token
        );
        let data: DexScreenerResponse = serde_json::from_str(&json).unwrap();
        let pairs = data.pairs.unwrap();
        let addr = Address::from_str(token).unwrap();

        assert_eq!(best_pair_price(&pairs, "base", addr, 1_000.0), Some(1.00));
        assert_eq!(best_pair_price(&pairs, "bsc", addr, 1_000.0), None);
        assert_eq!(best_pair_price(&pairs, "base", Address::ZERO, 1_000.0), None);
    }

    struct Fixed(Option<f64>);

    #[async_trait]
    impl PriceSource for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn price(&self, _chain_id: u64, _token: Address) -> AppResult<TokenPrice> {
            match self.0 {
                Some(usd) => Ok(TokenPrice {
                    usd,
                    as_of: Utc::now(),
                    source: "fixed".to_string(),
                }),
                None => Err(AppError::price_unavailable("nothing")),
            }
        }
    }

    #[tokio::test]
    async fn test_fallback_takes_first_answer() {
        let chain = FallbackPriceSource::new(vec![Arc::new(Fixed(None)), Arc::new(Fixed(Some(2.0)))]);
        assert_eq!(chain.price(1, Address::ZERO).await.unwrap().usd, 2.0);

        let none = FallbackPriceSource::new(vec![Arc::new(Fixed(None))]);
        let err = none.price(1, Address::ZERO).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PriceUnavailable);
        assert!(err.message.contains("fixed: nothing"));
    }

    struct Down;

    #[async_trait]
    impl PriceSource for Down {
        fn name(&self) -> &str {
            "down"
        }

        async fn price(&self, _chain_id: u64, _token: Address) -> AppResult<TokenPrice> {
            Err(AppError::endpoint_unavailable("HTTP 503"))
        }
    }

    #[tokio::test]
    async fn test_outage_is_not_reported_as_missing_price() {
        let sources = FallbackPriceSource::new(vec![Arc::new(Down), Arc::new(Fixed(None))]);
        let err = sources.price(1, Address::ZERO).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::EndpointUnavailable);
        assert!(err.message.contains("down: HTTP 503"));
        assert!(err.message.contains("fixed: nothing"));
    }

    #[test]
    fn test_native_is_priced_through_wrapped() {
        assert_eq!(priced_address(8453, NATIVE_TOKEN).unwrap(), get_wrapped_native(8453).unwrap());
        let token = Address::repeat_byte(0x22);
        assert_eq!(priced_address(8453, token).unwrap(), token);
    }
}
