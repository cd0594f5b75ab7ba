//! Route Aggregator Module
//!
//! Fans each dust candidate out to every quote provider with bounded
//! concurrency, keeps the best quote per (input, output) pair and reports
//! candidates no provider could route. A failing provider only removes
//! itself for that pair.
//!
//! Ranking: net output (`estimatedOutput - fees`, discounted by
//! `priceImpactBps`), then the configured tie-break on `expiresAt`, then
//! provider name so the choice is deterministic.

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::models::config::QuoteTieBreak;
use crate::models::errors::{AppError, AppResult, ErrorCode};
use crate::models::types::{DustCandidate, SweepQuote};
use crate::utils::cache::SweepCache;

/// Swap quote request for one candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub chain_id: u64,
    pub input_token: Address,
    pub output_token: Address,
    pub input_amount: U256,
    /// Account executing the swap
    pub taker: Address,
    /// Where the output should land
    pub recipient: Address,
}

/// Black-box quote provider (DEX aggregator, bridge)
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn quote(&self, request: &QuoteRequest) -> AppResult<SweepQuote>;
}

/// Candidate no provider could quote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedCandidate {
    pub token: Address,
    pub reason: String,
}

/// Outcome of quoting a candidate set
#[derive(Debug, Clone, Default)]
pub struct RouteSelection {
    /// Candidate order is preserved
    pub selected: Vec<(DustCandidate, SweepQuote)>,
    pub dropped: Vec<DroppedCandidate>,
}

impl RouteSelection {
    pub fn route_ids(&self) -> Vec<String> {
        self.selected.iter().map(|(_, q)| q.route_id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }
}

/// Quote fan-out settings
#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub provider_timeout: Duration,
    pub concurrency: usize,
    pub quote_ttl: Duration,
    pub tie_break: QuoteTieBreak,
}

pub struct RouteAggregator {
    providers: Vec<Arc<dyn QuoteProvider>>,
    cache: SweepCache,
    settings: AggregatorSettings,
}

impl RouteAggregator {
    pub fn new(providers: Vec<Arc<dyn QuoteProvider>>, cache: SweepCache, settings: AggregatorSettings) -> Self {
        Self {
            providers,
            cache,
            settings,
        }
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Quote every candidate into `target`.
    ///
    /// `fresh` drops cached quotes for this wallet first (used after a
    /// quote expired during batch building).
    pub async fn quote_all(
        &self,
        chain_id: u64,
        wallet: Address,
        target: Address,
        candidates: &[DustCandidate],
        fresh: bool,
    ) -> RouteSelection {
        if fresh {
            let dropped = self
                .cache
                .invalidate_prefix(&format!("quote:{}:{:#x}:", chain_id, wallet));
            debug!("🧹 Dropped {} cached quotes before re-quoting", dropped);
        }

        let outcomes: Vec<(DustCandidate, Result<SweepQuote, String>)> = stream::iter(candidates.iter().cloned())
            .map(|candidate| async move {
                let request = QuoteRequest {
                    chain_id,
                    input_token: candidate.balance.token_address,
                    output_token: target,
                    input_amount: candidate.balance.raw_amount,
                    taker: wallet,
                    recipient: wallet,
                };
                let outcome = if request.input_token == target {
                    Err("already in target asset".to_string())
                } else {
                    self.best_quote(&request).await
                };
                (candidate, outcome)
            })
            .buffered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut selection = RouteSelection::default();
        for (candidate, outcome) in outcomes {
            match outcome {
                Ok(quote) => selection.selected.push((candidate, quote)),
                Err(reason) => {
                    warn!("🚫 No route for {}: {}", candidate.balance.label(), reason);
                    selection.dropped.push(DroppedCandidate {
                        token: candidate.balance.token_address,
                        reason,
                    });
                }
            }
        }

        info!(
            chain_id,
            selected = selection.selected.len(),
            dropped = selection.dropped.len(),
            "📈 Quotes ranked"
        );
        selection
    }

    /// Best quote across providers, or the collected failure reasons
    async fn best_quote(&self, request: &QuoteRequest) -> Result<SweepQuote, String> {
        let attempts = futures_util::future::join_all(
            self.providers
                .iter()
                .map(|provider| self.provider_quote(provider.as_ref(), request)),
        )
        .await;

        let mut quotes = Vec::new();
        let mut failures = Vec::new();
        for (provider, attempt) in self.providers.iter().zip(attempts) {
            match attempt {
                Ok(quote) => quotes.push(quote),
                Err(e) => {
                    debug!("Provider {} failed: {}", provider.name(), e);
                    failures.push(format!("{}: {}", provider.name(), e.message));
                }
            }
        }

        rank_quotes(quotes, self.settings.tie_break).ok_or_else(|| {
            if failures.is_empty() {
                "no quote providers configured".to_string()
            } else {
                failures.join("; ")
            }
        })
    }

    /// One provider, through the quote cache and under its own timeout
    async fn provider_quote(&self, provider: &dyn QuoteProvider, request: &QuoteRequest) -> AppResult<SweepQuote> {
        let key = format!(
            "quote:{}:{:#x}:{:#x}:{:#x}:{}:{}",
            request.chain_id,
            request.taker,
            request.input_token,
            request.output_token,
            amount_bucket(request.input_amount),
            provider.name()
        );

        if let Some(cached) = self.cache.get::<SweepQuote>(&key) {
            if cached.input_amount == request.input_amount && cached.is_valid_at(Utc::now()) {
                return Ok(cached);
            }
            self.cache.invalidate(&key);
        }

        let quote = tokio::time::timeout(self.settings.provider_timeout, provider.quote(request))
            .await
            .map_err(|_| {
                AppError::new(
                    ErrorCode::QuoteTimeout,
                    format!("no answer within {}ms", self.settings.provider_timeout.as_millis()),
                )
            })??;

        if !quote.is_valid_at(Utc::now()) {
            return Err(AppError::quote_expired("provider returned an expired quote"));
        }
        if quote.input_amount != request.input_amount {
            return Err(AppError::new(
                ErrorCode::RpcInvalidResponse,
                "provider quoted a different input amount",
            ));
        }

        if let Err(e) = self.cache.set(&key, &quote, self.settings.quote_ttl) {
            debug!("Quote not cached: {}", e);
        }
        Ok(quote)
    }
}

/// Pick the best quote under `tie_break`
pub fn rank_quotes(quotes: Vec<SweepQuote>, tie_break: QuoteTieBreak) -> Option<SweepQuote> {
    quotes
        .into_iter()
        .max_by(|a, b| compare_quotes(a, b, tie_break))
}

/// `Greater` means `a` is the better quote
pub fn compare_quotes(a: &SweepQuote, b: &SweepQuote, tie_break: QuoteTieBreak) -> Ordering {
    a.net_output()
        .cmp(&b.net_output())
        .then_with(|| match tie_break {
            QuoteTieBreak::LongestValidity => a.expires_at.cmp(&b.expires_at),
            QuoteTieBreak::EarliestExpiry => b.expires_at.cmp(&a.expires_at),
        })
        .then_with(|| b.provider.cmp(&a.provider))
}

/// Three significant digits plus magnitude; nearby amounts share a bucket
pub fn amount_bucket(amount: U256) -> String {
    let digits = amount.to_string();
    if digits.len() <= 3 {
        return digits;
    }
    format!("{}e{}", &digits[..3], digits.len() - 3)
}
