//! 0x Swap API quote provider
//!
//! `GET /swap/v1/quote` on the chain's 0x domain. The quote carries the
//! calldata the smart account executes and the spender that needs an
//! allowance. 0x does not return an expiry, so quotes are given a fixed
//! validity window from the moment they are received.

use alloy_primitives::{keccak256, Address, Bytes, U256};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use super::rpc::build_http_client;
use crate::core::aggregator::{QuoteProvider, QuoteRequest};
use crate::models::errors::{AppError, AppResult, ErrorCode};
use crate::models::types::{FeeBreakdown, SwapTransaction, SweepQuote};
use crate::utils::constants::{
    CHAIN_ID_ARBITRUM, CHAIN_ID_AVALANCHE, CHAIN_ID_BASE, CHAIN_ID_BSC, CHAIN_ID_ETHEREUM,
    CHAIN_ID_OPTIMISM, CHAIN_ID_POLYGON,
};

/// Seconds a 0x quote is treated as executable
pub const DEFAULT_ZEROEX_VALIDITY_SECS: i64 = 30;

/// Slippage tolerance sent with every request
const SLIPPAGE_PERCENTAGE: &str = "0.01";

/// Per-chain 0x API host
pub fn zeroex_base_url(chain_id: u64) -> Option<&'static str> {
    match chain_id {
        CHAIN_ID_ETHEREUM => Some("https://api.0x.org"),
        CHAIN_ID_BSC => Some("https://bsc.api.0x.org"),
        CHAIN_ID_POLYGON => Some("https://polygon.api.0x.org"),
        CHAIN_ID_ARBITRUM => Some("https://arbitrum.api.0x.org"),
        CHAIN_ID_OPTIMISM => Some("https://optimism.api.0x.org"),
        CHAIN_ID_AVALANCHE => Some("https://avalanche.api.0x.org"),
        CHAIN_ID_BASE => Some("https://base.api.0x.org"),
        _ => None,
    }
}

// ============================================
// RESPONSE TYPES
// ============================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZeroExFee {
    pub fee_token: Option<String>,
    pub fee_amount: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZeroExFees {
    pub zero_ex_fee: Option<ZeroExFee>,
}

/// `/swap/v1/quote` response (fields the sweep uses)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZeroExQuote {
    pub to: Address,
    pub data: Bytes,
    pub value: String,
    pub buy_amount: String,
    pub sell_amount: String,
    pub allowance_target: Option<Address>,
    /// Percent, e.g. "0.12"
    pub estimated_price_impact: Option<String>,
    #[serde(default)]
    pub fees: Option<ZeroExFees>,
}

/// 0x error body
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZeroExError {
    pub code: Option<i64>,
    pub reason: Option<String>,
    #[serde(default)]
    pub validation_errors: Vec<serde_json::Value>,
}

impl ZeroExError {
    /// 0x reports missing liquidity as a validation error
    fn is_no_route(&self) -> bool {
        self.validation_errors.iter().any(|v| {
            v.get("reason")
                .and_then(|r| r.as_str())
                .map(|r| r.contains("INSUFFICIENT_ASSET_LIQUIDITY"))
                .unwrap_or(false)
        })
    }
}

fn parse_amount(field: &str, raw: &str) -> AppResult<U256> {
    U256::from_str(raw).map_err(|e| {
        AppError::new(ErrorCode::RpcInvalidResponse, format!("0x {} {}: {}", field, raw, e))
    })
}

impl ZeroExQuote {
    /// Convert into an engine quote for `request`
    pub fn into_sweep_quote(self, request: &QuoteRequest, validity: ChronoDuration) -> AppResult<SweepQuote> {
        let estimated_output = parse_amount("buyAmount", &self.buy_amount)?;
        let input_amount = parse_amount("sellAmount", &self.sell_amount)?;
        let value = parse_amount("value", &self.value)?;

        // Only fees taken in the output token reduce what the wallet receives
        let protocol_fee = self
            .fees
            .as_ref()
            .and_then(|f| f.zero_ex_fee.as_ref())
            .filter(|fee| {
                fee.fee_token
                    .as_deref()
                    .and_then(|t| Address::from_str(t).ok())
                    .map(|t| t == request.output_token)
                    .unwrap_or(false)
            })
            .and_then(|fee| fee.fee_amount.as_deref())
            .map(|raw| parse_amount("feeAmount", raw))
            .transpose()?
            .unwrap_or(U256::ZERO);

        let price_impact_bps = self
            .estimated_price_impact
            .as_deref()
            .and_then(|p| p.parse::<f64>().ok())
            .filter(|p| p.is_finite() && *p > 0.0)
            .map(|p| (p * 100.0).round().min(10_000.0) as u32)
            .unwrap_or(0);

        let allowance_target = self.allowance_target.filter(|a| !a.is_zero());
        let calldata_hash = keccak256(&self.data);

        Ok(SweepQuote {
            route_id: format!("0x:{}:{}", request.chain_id, hex::encode(&calldata_hash[..8])),
            provider: "0x".to_string(),
            chain_id: request.chain_id,
            input_token: request.input_token,
            output_token: request.output_token,
            input_amount,
            estimated_output,
            fee_breakdown: FeeBreakdown {
                protocol_fee,
                gas_fee: U256::ZERO,
            },
            price_impact_bps,
            expires_at: Utc::now() + validity,
            recipient: request.taker,
            tx: SwapTransaction {
                to: self.to,
                data: self.data,
                value,
                allowance_target,
            },
        })
    }
}

// ============================================
// PROVIDER
// ============================================

pub struct ZeroExQuoteProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    /// Replaces the per-chain host when set
    base_url: Option<String>,
    validity: ChronoDuration,
}

impl ZeroExQuoteProvider {
    pub fn new(api_key: Option<String>, base_url: Option<String>, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            client: build_http_client(timeout)?,
            api_key,
            base_url,
            validity: ChronoDuration::seconds(DEFAULT_ZEROEX_VALIDITY_SECS),
        })
    }

    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = ChronoDuration::milliseconds(validity.as_millis() as i64);
        self
    }

    fn endpoint(&self, chain_id: u64) -> AppResult<String> {
        let host = match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => zeroex_base_url(chain_id)
                .ok_or_else(|| AppError::unsupported_chain(chain_id))?
                .to_string(),
        };
        Ok(format!("{}/swap/v1/quote", host))
    }
}

#[async_trait]
impl QuoteProvider for ZeroExQuoteProvider {
    fn name(&self) -> &str {
        "0x"
    }

    async fn quote(&self, request: &QuoteRequest) -> AppResult<SweepQuote> {
        let url = self.endpoint(request.chain_id)?;
        let sell_amount = request.input_amount.to_string();
        let query = [
            ("sellToken", request.input_token.to_string()),
            ("buyToken", request.output_token.to_string()),
            ("sellAmount", sell_amount),
            ("takerAddress", request.taker.to_string()),
            ("slippagePercentage", SLIPPAGE_PERCENTAGE.to_string()),
            ("skipValidation", "true".to_string()),
        ];

        let mut http = self.client.get(&url).query(&query);
        if let Some(key) = &self.api_key {
            http = http.header("0x-api-key", key);
        }
        if self.base_url.is_some() {
            http = http.header("0x-chain-id", request.chain_id.to_string());
        }

        let response = http.send().await?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(AppError::rpc_rate_limited());
        }
        if status.is_client_error() {
            let body: Option<ZeroExError> = response.json().await.ok();
            let reason = body
                .as_ref()
                .and_then(|b| b.reason.clone())
                .unwrap_or_else(|| status.to_string());
            let code = if body.as_ref().map(|b| b.is_no_route()).unwrap_or(false) {
                ErrorCode::NoRoute
            } else {
                ErrorCode::RpcError
            };
            return Err(AppError::new(
                code,
                format!("0x quote {} -> {}: {}", request.input_token, request.output_token, reason),
            ));
        }
        if !status.is_success() {
            return Err(AppError::endpoint_unavailable(format!("0x API error: {}", status)));
        }

        let raw: ZeroExQuote = response.json().await?;
        let quote = raw.into_sweep_quote(request, self.validity)?;
        debug!(
            route = %quote.route_id,
            output = %quote.estimated_output,
            impact_bps = quote.price_impact_bps,
            "📈 0x quote received"
        );
        Ok(quote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> QuoteRequest {
        QuoteRequest {
            chain_id: 8453,
            input_token: Address::repeat_byte(0x11),
            output_token: Address::from_str("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913").unwrap(),
            input_amount: U256::from(1_000_000u64),
            taker: Address::repeat_byte(0x42),
            recipient: Address::repeat_byte(0x42),
        }
    }

    #[test]
    fn test_quote_conversion() {
        let json = r#"{
            "price": "0.99",
            "to": "0xdef1c0ded9bec7f1a1670819833240f027b25eff",
            "data": "0xd9627aa4",
            "value": "0",
            "buyAmount": "990000",
            "sellAmount": "1000000",
            "allowanceTarget": "0xdef1c0ded9bec7f1a1670819833240f027b25eff",
            "estimatedPriceImpact": "0.25",
            "fees": {"zeroExFee": {"feeType": "volume", "feeToken": "0x833589fcd6edb6e08f4c7c32d4f71b54bda02913", "feeAmount": "1500", "billingType": "on-chain"}}
        }"#;
        let raw: ZeroExQuote = serde_json::from_str(json).unwrap();
        let quote = raw.into_sweep_quote(&request(), ChronoDuration::seconds(30)).unwrap();

        assert_eq!(quote.provider, "0x");
        assert!(quote.route_id.starts_with("0x:8453:"));
        assert_eq!(quote.estimated_output, U256::from(990_000u64));
        assert_eq!(quote.fee_breakdown.protocol_fee, U256::from(1_500u64));
        assert_eq!(quote.price_impact_bps, 25);
        assert_eq!(quote.recipient, request().taker);
        assert!(quote.tx.allowance_target.is_some());
        assert!(quote.is_valid_at(Utc::now() + ChronoDuration::seconds(20)));
        assert!(!quote.is_valid_at(Utc::now() + ChronoDuration::seconds(31)));
    }

    #[test]
    fn test_zero_allowance_target_means_none() {
        let json = r#"{
            "to": "0xdef1c0ded9bec7f1a1670819833240f027b25eff",
            "data": "0x",
            "value": "0",
            "buyAmount": "5",
            "sellAmount": "7",
            "allowanceTarget": "0x0000000000000000000000000000000000000000"
        }"#;
        let raw: ZeroExQuote = serde_json::from_str(json).unwrap();
        let quote = raw.into_sweep_quote(&request(), ChronoDuration::seconds(30)).unwrap();
        assert_eq!(quote.tx.allowance_target, None);
        assert_eq!(quote.price_impact_bps, 0);
        assert_eq!(quote.fee_breakdown.total(), U256::ZERO);
    }

    #[test]
    fn test_no_route_detection() {
        let body: ZeroExError = serde_json::from_str(
            r#"{"code": 100, "reason": "Validation Failed", "validationErrors": [{"field": "sellAmount", "code": 1004, "reason": "INSUFFICIENT_ASSET_LIQUIDITY"}]}"#,
        )
        .unwrap();
        assert!(body.is_no_route());
    }

    #[test]
    fn test_endpoint_per_chain() {
        let provider = ZeroExQuoteProvider::new(None, None, Duration::from_secs(5)).unwrap();
        assert_eq!(provider.endpoint(8453).unwrap(), "https://base.api.0x.org/swap/v1/quote");
        assert!(provider.endpoint(999).is_err());

        let custom = ZeroExQuoteProvider::new(None, Some("http://localhost:9000/".into()), Duration::from_secs(5)).unwrap();
        assert_eq!(custom.endpoint(999).unwrap(), "http://localhost:9000/swap/v1/quote");
    }
}
