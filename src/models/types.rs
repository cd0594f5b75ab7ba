//! Type definitions for the sweep engine
//! Balances, candidates, quotes, user operations, jobs and receipts

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_sol_types::SolValue;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::errors::{AppError, AppResult};
use crate::utils::constants::{units_to_f64, NATIVE_TOKEN};

// ============================================
// WALLET
// ============================================

/// Owning account of a sweep; usually a smart-contract account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletAddress(pub Address);

impl WalletAddress {
    /// Parse a hex address; malformed input is fatal for the job
    pub fn parse(input: &str) -> AppResult<Self> {
        let trimmed = input.trim();
        if !trimmed.starts_with("0x") || trimmed.len() != 42 {
            return Err(AppError::invalid_wallet(format!("Malformed wallet address: {}", input)));
        }
        Address::from_str(trimmed)
            .map(Self)
            .map_err(|e| AppError::invalid_wallet(format!("Malformed wallet address {}: {}", input, e)))
    }

    pub fn address(&self) -> Address {
        self.0
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<Address> for WalletAddress {
    fn from(address: Address) -> Self {
        Self(address)
    }
}

// ============================================
// BALANCES
// ============================================

/// Raw holding as listed by a chain scanner, before pricing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenHolding {
    pub token_address: Address,
    pub raw_amount: U256,
    pub decimals: u8,
    pub symbol: Option<String>,
}

impl TokenHolding {
    pub fn is_native(&self) -> bool {
        self.token_address == NATIVE_TOKEN
    }
}

/// USD price observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPrice {
    pub usd: f64,
    /// When the source last updated this price
    pub as_of: DateTime<Utc>,
    pub source: String,
}

impl TokenPrice {
    pub fn age(&self, now: DateTime<Utc>) -> ChronoDuration {
        now - self.as_of
    }
}

/// Valued balance of one token on one chain. Superseded, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainBalance {
    pub chain_id: u64,
    pub token_address: Address,
    pub symbol: Option<String>,
    pub raw_amount: U256,
    pub decimals: u8,
    /// `None` when no acceptable price exists
    pub usd_value: Option<f64>,
    pub price_as_of: Option<DateTime<Utc>>,
    /// Price exists but is older than the staleness bound
    pub stale: bool,
}

impl ChainBalance {
    pub fn is_native(&self) -> bool {
        self.token_address == NATIVE_TOKEN
    }

    /// Amount in whole-token units
    pub fn amount(&self) -> f64 {
        units_to_f64(self.raw_amount, self.decimals)
    }

    /// Price is present and fresh
    pub fn is_priced(&self) -> bool {
        self.usd_value.is_some() && !self.stale
    }

    pub fn label(&self) -> String {
        self.symbol
            .clone()
            .unwrap_or_else(|| format!("{:#x}", self.token_address))
    }
}

// ============================================
// CLASSIFICATION
// ============================================

/// Dust classification outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    Dust,
    NotDust,
    Unpriceable,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Dust => "DUST",
            Classification::NotDust => "NOT_DUST",
            Classification::Unpriceable => "UNPRICEABLE",
        }
    }
}

/// Classified balance, recomputed every scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DustCandidate {
    pub balance: ChainBalance,
    pub classification: Classification,
    pub reason: String,
    /// Estimated USD cost of moving this balance
    pub sweep_cost_usd: f64,
    /// Dust whose sweep cost fits within the economic ratio
    pub economical: bool,
}

impl DustCandidate {
    pub fn usd_value(&self) -> f64 {
        self.balance.usd_value.unwrap_or(0.0)
    }

    pub fn is_sweepable(&self) -> bool {
        self.classification == Classification::Dust && self.economical
    }
}

// ============================================
// QUOTES
// ============================================

/// Fees charged by a route, in output-token units
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub protocol_fee: U256,
    pub gas_fee: U256,
}

impl FeeBreakdown {
    pub fn total(&self) -> U256 {
        self.protocol_fee.saturating_add(self.gas_fee)
    }
}

/// Transaction a route asks the wallet to execute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapTransaction {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    /// Spender that needs an ERC-20 allowance, if any
    pub allowance_target: Option<Address>,
}

/// Time-boxed swap quote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepQuote {
    pub route_id: String,
    pub provider: String,
    pub chain_id: u64,
    pub input_token: Address,
    pub output_token: Address,
    pub input_amount: U256,
    pub estimated_output: U256,
    pub fee_breakdown: FeeBreakdown,
    pub price_impact_bps: u32,
    pub expires_at: DateTime<Utc>,
    /// Where the route delivers its output
    pub recipient: Address,
    pub tx: SwapTransaction,
}

impl SweepQuote {
    /// Output after fees, discounted by price impact
    pub fn net_output(&self) -> U256 {
        let after_fees = self.estimated_output.saturating_sub(self.fee_breakdown.total());
        let impact = self.price_impact_bps.min(10_000);
        after_fees * U256::from(10_000 - impact) / U256::from(10_000u64)
    }

    /// Still valid at `at`
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.expires_at > at
    }

    pub fn remaining_validity(&self, now: DateTime<Utc>) -> ChronoDuration {
        self.expires_at - now
    }
}

// ============================================
// USER OPERATIONS
// ============================================

/// Purpose of a call inside a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallKind {
    Approval,
    Swap,
    Transfer,
}

/// One call of a batched user operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepCall {
    pub kind: CallKind,
    pub target: Address,
    pub value: U256,
    pub data: Bytes,
}

/// ERC-4337 gas fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasLimits {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

impl GasLimits {
    /// Upper bound of gas the operation may consume
    pub fn total_gas(&self) -> U256 {
        self.call_gas_limit
            .saturating_add(self.verification_gas_limit)
            .saturating_add(self.pre_verification_gas)
    }
}

/// Paymaster answer attached to a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SponsorshipData {
    pub paymaster_and_data: Bytes,
    pub sponsored_gas_usd: f64,
    pub policy_id: String,
    /// Paymasters may re-estimate gas; these replace the batch's limits
    pub gas_overrides: Option<GasLimits>,
    pub valid_until: Option<DateTime<Utc>>,
}

/// Batched, optionally sponsored user operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserOperationBatch {
    pub chain_id: u64,
    pub entry_point: Address,
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub calls: Vec<SweepCall>,
    pub call_data: Bytes,
    pub gas: GasLimits,
    pub estimated_gas_usd: f64,
    pub sponsorship: Option<SponsorshipData>,
    pub signature: Bytes,
    pub hash: Option<B256>,
    pub built_at: DateTime<Utc>,
}

impl UserOperationBatch {
    pub fn paymaster_and_data(&self) -> Bytes {
        self.sponsorship
            .as_ref()
            .map(|s| s.paymaster_and_data.clone())
            .unwrap_or_default()
    }

    /// EntryPoint v0.6 user operation hash
    pub fn compute_hash(&self) -> B256 {
        let packed = (
            self.sender,
            self.nonce,
            keccak256(&self.init_code),
            keccak256(&self.call_data),
            self.gas.call_gas_limit,
            self.gas.verification_gas_limit,
            self.gas.pre_verification_gas,
            self.gas.max_fee_per_gas,
            self.gas.max_priority_fee_per_gas,
            keccak256(self.paymaster_and_data()),
        )
            .abi_encode();
        keccak256((keccak256(packed), self.entry_point, U256::from(self.chain_id)).abi_encode())
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }

    pub fn swap_count(&self) -> usize {
        self.calls.iter().filter(|c| c.kind == CallKind::Swap).count()
    }
}

// ============================================
// JOBS
// ============================================

/// Sweep job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Scanning,
    Quoting,
    Building,
    Authorizing,
    Submitted,
    Confirmed,
    Failed,
    Expired,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Confirmed | JobStatus::Failed | JobStatus::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Scanning => "SCANNING",
            JobStatus::Quoting => "QUOTING",
            JobStatus::Building => "BUILDING",
            JobStatus::Authorizing => "AUTHORIZING",
            JobStatus::Submitted => "SUBMITTED",
            JobStatus::Confirmed => "CONFIRMED",
            JobStatus::Failed => "FAILED",
            JobStatus::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub at: DateTime<Utc>,
    pub from: JobStatus,
    pub to: JobStatus,
    pub note: String,
}

/// Terminal outcome of a submitted batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: Option<B256>,
    pub user_op_hash: B256,
    pub success: bool,
    pub gas_used: U256,
    pub actual_gas_cost: U256,
    pub actual_output_value: Option<U256>,
    pub error: Option<String>,
}

/// Aggregate root of one sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepJob {
    pub id: Uuid,
    pub wallet: WalletAddress,
    pub chain_id: u64,
    pub target_asset: Address,
    pub idempotency_key: String,
    pub status: JobStatus,
    /// Attempts spent in the current state
    pub attempts: u32,
    /// Backward transitions taken (stale quote / stale nonce)
    pub rebuilds: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<JobEvent>,
    pub last_error: Option<String>,
    /// Terminal reason for FAILED / EXPIRED
    pub outcome: Option<String>,
    /// Reference to the balance snapshot used
    pub scan_ref: Option<String>,
    /// Route ids of the chosen quotes
    pub quote_ids: Vec<String>,
    /// Hash of the current batch
    pub batch_hash: Option<B256>,
    /// Policy id of the sponsorship decision
    pub sponsorship_ref: Option<String>,
    pub receipt: Option<Receipt>,
    pub archived: bool,
}

impl SweepJob {
    pub fn new(wallet: WalletAddress, chain_id: u64, target_asset: Address) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            idempotency_key: Self::idempotency_key_for(&wallet, chain_id, target_asset),
            wallet,
            chain_id,
            target_asset,
            status: JobStatus::Pending,
            attempts: 0,
            rebuilds: 0,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
            last_error: None,
            outcome: None,
            scan_ref: None,
            quote_ids: Vec::new(),
            batch_hash: None,
            sponsorship_ref: None,
            receipt: None,
            archived: false,
        }
    }

    /// One non-terminal job per (wallet, chain, target asset)
    pub fn idempotency_key_for(wallet: &WalletAddress, chain_id: u64, target_asset: Address) -> String {
        format!("{:#x}:{}:{:#x}", wallet.address(), chain_id, target_asset)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Status path taken so far, starting at PENDING
    pub fn status_path(&self) -> Vec<JobStatus> {
        let mut path = vec![JobStatus::Pending];
        path.extend(self.history.iter().map(|e| e.to));
        path
    }
}
