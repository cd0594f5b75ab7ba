//! Batch Builder Module
//!
//! Turns ranked (candidate, quote) pairs into one unsigned ERC-4337 user
//! operation: approvals first, then one swap per route, then a final
//! transfer only when a route delivers somewhere other than the sweep
//! recipient.
//!
//! Rebuilding with the same inputs and the same on-chain nonce returns the
//! same batch. A batch is never reused across nonces.

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::config::{ChainConfig, GasModel};
use crate::models::errors::{AppError, AppResult};
use crate::models::types::{
    CallKind, DustCandidate, GasLimits, SweepCall, SweepQuote, UserOperationBatch,
};
use crate::utils::abi;
use crate::utils::constants::units_to_f64;

/// On-chain account state needed to build and submit batches
#[async_trait]
pub trait ChainStateReader: Send + Sync {
    /// EntryPoint nonce of `sender`
    async fn account_nonce(&self, chain_id: u64, sender: Address) -> AppResult<U256>;

    async fn allowance(
        &self,
        chain_id: u64,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> AppResult<U256>;

    /// Gas price in wei
    async fn gas_price(&self, chain_id: u64) -> AppResult<U256>;
}

/// Inputs of one build
pub struct BatchRequest<'a> {
    pub job_id: Uuid,
    pub chain: &'a ChainConfig,
    pub wallet: Address,
    pub target_asset: Address,
    /// Where swept value must end up; usually the wallet itself
    pub recipient: Address,
    /// Ordered by descending candidate value
    pub selections: &'a [(DustCandidate, SweepQuote)],
    pub native_price_usd: f64,
}

/// Last batch built for a job
#[derive(Clone)]
struct BuiltBatch {
    nonce: U256,
    fingerprint: B256,
    /// Tokens whose swaps survived trimming
    tokens: Vec<Address>,
    batch: UserOperationBatch,
}

pub struct BatchBuilder {
    state: Arc<dyn ChainStateReader>,
    gas: GasModel,
    max_economic_gas_ratio: f64,
    estimated_build_time: Duration,
    built: DashMap<Uuid, BuiltBatch>,
}

impl BatchBuilder {
    pub fn new(
        state: Arc<dyn ChainStateReader>,
        gas: GasModel,
        max_economic_gas_ratio: f64,
        estimated_build_time: Duration,
    ) -> Self {
        Self {
            state,
            gas,
            max_economic_gas_ratio,
            estimated_build_time,
            built: DashMap::new(),
        }
    }

    /// Build (or reuse) the unsigned batch for a job
    pub async fn build(&self, request: BatchRequest<'_>) -> AppResult<UserOperationBatch> {
        let chain_id = request.chain.chain_id;
        if request.selections.is_empty() {
            return Err(AppError::empty_batch("no quoted candidates"));
        }

        // Every quote must outlive the build
        let deadline = Utc::now()
            + ChronoDuration::milliseconds(self.estimated_build_time.as_millis() as i64);
        if let Some((candidate, quote)) = request
            .selections
            .iter()
            .find(|(_, q)| !q.is_valid_at(deadline))
        {
            return Err(AppError::quote_expired(format!(
                "quote {} for {} expires at {}",
                quote.route_id,
                candidate.balance.label(),
                quote.expires_at.format("%H:%M:%S%.3f")
            )));
        }

        let nonce = self.state.account_nonce(chain_id, request.wallet).await?;
        let gas_price = self.state.gas_price(chain_id).await?;

        // Which swaps need an approval first
        let mut needs_approval = Vec::with_capacity(request.selections.len());
        for (candidate, quote) in request.selections {
            let spender = match quote.tx.allowance_target {
                Some(spender) if !candidate.balance.is_native() && !self.gas.gasless_approvals => spender,
                _ => {
                    needs_approval.push(false);
                    continue;
                }
            };
            let allowance = self
                .state
                .allowance(chain_id, candidate.balance.token_address, request.wallet, spender)
                .await?;
            needs_approval.push(allowance < candidate.balance.raw_amount);
        }

        let kept = self.trim_uneconomical(&request, &needs_approval, gas_price)?;
        let selections: Vec<(&(DustCandidate, SweepQuote), bool)> = kept
            .iter()
            .map(|&i| (&request.selections[i], needs_approval[i]))
            .collect();

        let fingerprint = fingerprint(&selections, request.recipient);
        if let Some(previous) = self.built.get(&request.job_id) {
            if previous.nonce == nonce && previous.fingerprint == fingerprint {
                debug!("♻️ Reusing batch for job {} at nonce {}", request.job_id, nonce);
                return Ok(previous.batch.clone());
            }
            if previous.nonce != nonce {
                debug!(
                    "🗑️ Discarding batch for job {}: nonce {} -> {}",
                    request.job_id, previous.nonce, nonce
                );
            }
        }

        let calls = assemble_calls(&selections, request.wallet, request.target_asset, request.recipient);
        let encoded: Vec<(Address, U256, Bytes)> = calls
            .iter()
            .map(|c| (c.target, c.value, c.data.clone()))
            .collect();

        let call_gas = self.call_gas(&selections);
        let verification_gas = self.gas.base_gas * 2 / 3;
        let gas = GasLimits {
            call_gas_limit: U256::from(call_gas),
            verification_gas_limit: U256::from(verification_gas),
            pre_verification_gas: U256::from(self.gas.base_gas - verification_gas),
            max_fee_per_gas: gas_price,
            max_priority_fee_per_gas: gas_price / U256::from(10u64),
        };
        let estimated_gas_usd = gas_cost_usd(gas.total_gas(), gas_price, request.native_price_usd);

        let mut batch = UserOperationBatch {
            chain_id,
            entry_point: request.chain.entry_point,
            sender: request.wallet,
            nonce,
            init_code: Bytes::new(),
            calls,
            call_data: abi::encode_execute_batch(&encoded),
            gas,
            estimated_gas_usd,
            sponsorship: None,
            signature: Bytes::new(),
            hash: None,
            built_at: Utc::now(),
        };
        batch.hash = Some(batch.compute_hash());

        info!(
            job_id = %request.job_id,
            chain_id,
            nonce = %nonce,
            calls = batch.calls.len(),
            gas_usd = format!("{:.4}", estimated_gas_usd),
            "🧱 Batch built"
        );

        self.built.insert(
            request.job_id,
            BuiltBatch {
                nonce,
                fingerprint,
                tokens: selections
                    .iter()
                    .map(|((candidate, _), _)| candidate.balance.token_address)
                    .collect(),
                batch: batch.clone(),
            },
        );
        Ok(batch)
    }

    /// Tokens swapped by the last batch built for a job
    pub fn batched_tokens(&self, job_id: &Uuid) -> Option<Vec<Address>> {
        self.built.get(job_id).map(|b| b.tokens.clone())
    }

    /// Forget the cached batch of a finished job
    pub fn discard(&self, job_id: &Uuid) {
        self.built.remove(job_id);
    }

    /// Estimated USD gas cost of moving one candidate on its own margin
    pub fn marginal_cost_usd(&self, needs_approval: bool, gas_price: U256, native_price_usd: f64) -> f64 {
        gas_cost_usd(
            U256::from(self.gas.per_token_gas(needs_approval)),
            gas_price,
            native_price_usd,
        )
    }

    fn call_gas(&self, selections: &[(&(DustCandidate, SweepQuote), bool)]) -> u64 {
        selections
            .iter()
            .map(|(_, approve)| self.gas.per_token_gas(*approve))
            .sum()
    }

    /// Drop the smallest candidates until gas <= value * ratio.
    /// Returns indices of the kept selections, in order.
    fn trim_uneconomical(
        &self,
        request: &BatchRequest<'_>,
        needs_approval: &[bool],
        gas_price: U256,
    ) -> AppResult<Vec<usize>> {
        let mut kept: Vec<usize> = (0..request.selections.len()).collect();

        loop {
            if kept.is_empty() {
                return Err(AppError::empty_batch(
                    "every candidate costs more to sweep than it is worth",
                ));
            }

            let gas: u64 = self.gas.base_gas
                + kept
                    .iter()
                    .map(|&i| self.gas.per_token_gas(needs_approval[i]))
                    .sum::<u64>();
            let cost = gas_cost_usd(U256::from(gas), gas_price, request.native_price_usd);
            let value: f64 = kept
                .iter()
                .map(|&i| request.selections[i].0.usd_value())
                .sum();

            if cost <= value * self.max_economic_gas_ratio {
                return Ok(kept);
            }

            // Selections arrive in descending value order; the last is the smallest
            if let Some(dropped) = kept.pop() {
                debug!(
                    "✂️ Dropping {} (${:.6}) from batch: gas ${:.4} > value ${:.4}",
                    request.selections[dropped].0.balance.label(),
                    request.selections[dropped].0.usd_value(),
                    cost,
                    value
                );
            }
        }
    }
}

/// USD cost of `gas` units at `gas_price` wei
pub fn gas_cost_usd(gas: U256, gas_price: U256, native_price_usd: f64) -> f64 {
    units_to_f64(gas.saturating_mul(gas_price), 18) * native_price_usd
}

/// Ordered call list: approvals, swaps, then forwarding transfers
fn assemble_calls(
    selections: &[(&(DustCandidate, SweepQuote), bool)],
    wallet: Address,
    target_asset: Address,
    recipient: Address,
) -> Vec<SweepCall> {
    let mut calls = Vec::new();

    for ((candidate, quote), approve) in selections {
        if let (true, Some(spender)) = (*approve, quote.tx.allowance_target) {
            calls.push(SweepCall {
                kind: CallKind::Approval,
                target: candidate.balance.token_address,
                value: U256::ZERO,
                data: abi::encode_approve(spender, candidate.balance.raw_amount),
            });
        }
    }

    for ((_, quote), _) in selections {
        calls.push(SweepCall {
            kind: CallKind::Swap,
            target: quote.tx.to,
            value: quote.tx.value,
            data: quote.tx.data.clone(),
        });
    }

    // Routes that paid the wallet while the sweep goes elsewhere
    if recipient != wallet {
        let forwarded = selections
            .iter()
            .filter(|((_, q), _)| q.recipient == wallet)
            .fold(U256::ZERO, |acc, ((_, q), _)| acc.saturating_add(q.net_output()));
        if forwarded > U256::ZERO {
            calls.push(SweepCall {
                kind: CallKind::Transfer,
                target: target_asset,
                value: U256::ZERO,
                data: abi::encode_transfer(recipient, forwarded),
            });
        }
    }

    calls
}

/// Identity of a build input set
fn fingerprint(selections: &[(&(DustCandidate, SweepQuote), bool)], recipient: Address) -> B256 {
    let mut buf = Vec::with_capacity(selections.len() * 64 + 20);
    buf.extend_from_slice(recipient.as_slice());
    for ((candidate, quote), approve) in selections {
        buf.extend_from_slice(candidate.balance.token_address.as_slice());
        buf.extend_from_slice(&candidate.balance.raw_amount.to_be_bytes::<32>());
        buf.extend_from_slice(quote.route_id.as_bytes());
        buf.push(*approve as u8);
    }
    keccak256(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::types::{ChainBalance, Classification, FeeBreakdown, SwapTransaction};
    use crate::models::errors::ErrorCode;
    use std::sync::atomic::{AtomicU64, Ordering};

    const ROUTER: Address = Address::repeat_byte(0xEE);
    const USDC: Address = Address::repeat_byte(0xCC);
    const WALLET: Address = Address::repeat_byte(0x42);

    struct MockState {
        nonce: AtomicU64,
        allowance: U256,
        gas_price_gwei: u64,
    }

    #[async_trait]
    impl ChainStateReader for MockState {
        async fn account_nonce(&self, _chain_id: u64, _sender: Address) -> AppResult<U256> {
            Ok(U256::from(self.nonce.load(Ordering::SeqCst)))
        }

        async fn allowance(&self, _: u64, _: Address, _: Address, _: Address) -> AppResult<U256> {
            Ok(self.allowance)
        }

        async fn gas_price(&self, _chain_id: u64) -> AppResult<U256> {
            Ok(U256::from(self.gas_price_gwei) * U256::from(1_000_000_000u64))
        }
    }

    fn state(gas_price_gwei: u64) -> Arc<MockState> {
        Arc::new(MockState {
            nonce: AtomicU64::new(7),
            allowance: U256::ZERO,
            gas_price_gwei,
        })
    }

    fn selection(byte: u8, usd: f64, valid_secs: i64) -> (DustCandidate, SweepQuote) {
        let token = Address::repeat_byte(byte);
        let candidate = DustCandidate {
            balance: ChainBalance {
                chain_id: 8453,
                token_address: token,
                symbol: None,
                raw_amount: U256::from(1_000_000u64),
                decimals: 6,
                usd_value: Some(usd),
                price_as_of: Some(Utc::now()),
                stale: false,
            },
            classification: Classification::Dust,
            reason: String::new(),
            sweep_cost_usd: 0.0,
            economical: true,
        };
        let quote = SweepQuote {
            route_id: format!("route-{}", byte),
            provider: "mock".into(),
            chain_id: 8453,
            input_token: token,
            output_token: USDC,
            input_amount: U256::from(1_000_000u64),
            estimated_output: U256::from((usd * 1e6) as u64),
            fee_breakdown: FeeBreakdown::default(),
            price_impact_bps: 0,
            expires_at: Utc::now() + ChronoDuration::seconds(valid_secs),
            recipient: WALLET,
            tx: SwapTransaction {
                to: ROUTER,
                data: Bytes::from(vec![byte]),
                value: U256::ZERO,
                allowance_target: Some(ROUTER),
            },
        };
        (candidate, quote)
    }

    fn builder(state: Arc<MockState>) -> BatchBuilder {
        BatchBuilder::new(state, GasModel::default(), 1.0, Duration::from_secs(3))
    }

    fn request<'a>(
        job_id: Uuid,
        chain: &'a ChainConfig,
        selections: &'a [(DustCandidate, SweepQuote)],
    ) -> BatchRequest<'a> {
        BatchRequest {
            job_id,
            chain,
            wallet: WALLET,
            target_asset: USDC,
            recipient: WALLET,
            selections,
            native_price_usd: 2_000.0,
        }
    }

    #[tokio::test]
    async fn test_calls_are_approvals_then_swaps() {
        let chain = ChainConfig::with_defaults(8453);
        let selections = vec![selection(1, 3.0, 60), selection(2, 2.0, 60)];
        // 0.001 gwei keeps gas far below value
        let batch = builder(state(0)).build(request(Uuid::new_v4(), &chain, &selections)).await.unwrap();

        let kinds: Vec<CallKind> = batch.calls.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![CallKind::Approval, CallKind::Approval, CallKind::Swap, CallKind::Swap]
        );
        assert_eq!(batch.calls[0].target, Address::repeat_byte(1));
        assert_eq!(batch.nonce, U256::from(7u64));
        assert_eq!(batch.hash, Some(batch.compute_hash()));
    }

    #[tokio::test]
    async fn test_expiring_quote_is_rejected() {
        let chain = ChainConfig::with_defaults(8453);
        // Expires 2s from now, build needs 3s
        let selections = vec![selection(1, 3.0, 2)];
        let err = builder(state(0))
            .build(request(Uuid::new_v4(), &chain, &selections))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::QuoteExpired);
    }

    #[tokio::test]
    async fn test_rebuild_is_idempotent_per_nonce() {
        let chain = ChainConfig::with_defaults(8453);
        let selections = vec![selection(1, 3.0, 60)];
        let state = state(0);
        let builder = builder(state.clone());
        let job = Uuid::new_v4();

        let first = builder.build(request(job, &chain, &selections)).await.unwrap();
        let again = builder.build(request(job, &chain, &selections)).await.unwrap();
        assert_eq!(first, again);

        state.nonce.store(8, Ordering::SeqCst);
        let bumped = builder.build(request(job, &chain, &selections)).await.unwrap();
        assert_eq!(bumped.nonce, U256::from(8u64));
        assert_ne!(bumped.hash, first.hash);
        assert_eq!(bumped.calls, first.calls);
    }

    #[tokio::test]
    async fn test_smallest_candidates_are_trimmed_until_economic() {
        let chain = ChainConfig::with_defaults(8453);
        // 1 gwei at $2000: base 150k + 230k per token
        // one token: 380k gas = $0.76; two tokens: 610k = $1.22
        let selections = vec![selection(1, 1.0, 60), selection(2, 0.10, 60)];
        let builder = builder(state(1));
        let job = Uuid::new_v4();
        let batch = builder.build(request(job, &chain, &selections)).await.unwrap();

        assert_eq!(batch.swap_count(), 1);
        assert!(batch.estimated_gas_usd <= 1.0);
        assert_eq!(builder.batched_tokens(&job), Some(vec![Address::repeat_byte(1)]));

        builder.discard(&job);
        assert_eq!(builder.batched_tokens(&job), None);
    }

    #[tokio::test]
    async fn test_nothing_economic_is_an_empty_batch() {
        let chain = ChainConfig::with_defaults(8453);
        let selections = vec![selection(1, 0.0001, 60)];
        let err = builder(state(1))
            .build(request(Uuid::new_v4(), &chain, &selections))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::EmptyBatch);
    }

    #[tokio::test]
    async fn test_forwarding_transfer_when_recipient_differs() {
        let chain = ChainConfig::with_defaults(8453);
        let selections = vec![selection(1, 3.0, 60)];
        let mut req = request(Uuid::new_v4(), &chain, &selections);
        req.recipient = Address::repeat_byte(0x99);
        let batch = builder(state(0)).build(req).await.unwrap();

        let last = batch.calls.last().unwrap();
        assert_eq!(last.kind, CallKind::Transfer);
        assert_eq!(last.target, USDC);
    }

    #[test]
    fn test_gas_cost_usd() {
        // 100k gas at 10 gwei = 0.001 ETH = $2 at $2000
        let cost = gas_cost_usd(
            U256::from(100_000u64),
            U256::from(10_000_000_000u64),
            2_000.0,
        );
        assert!((cost - 2.0).abs() < 1e-9);
    }
}
