//! Configuration module for the sweep engine
//!
//! Uses constants from utils/constants.rs; no hardcoded addresses or chain
//! ids in this file. Every knob has a default, environment variables
//! override it.

use alloy_primitives::{Address, U256};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::models::errors::{AppError, AppResult};
use crate::models::types::WalletAddress;
use crate::utils::constants::{
    build_alchemy_url, get_chain_name, get_native_symbol, get_public_rpc_fallback,
    get_usdc_address, get_wrapped_native, CHAIN_ID_ARBITRUM, CHAIN_ID_AVALANCHE, CHAIN_ID_BASE,
    CHAIN_ID_BSC, CHAIN_ID_ETHEREUM, CHAIN_ID_OPTIMISM, CHAIN_ID_POLYGON,
    DEFAULT_BUNDLER_TIMEOUT_SECS, DEFAULT_HOLDINGS_TTL_SECS, DEFAULT_MULTICALL_BATCH_SIZE,
    DEFAULT_PRICE_STALENESS_SECS, DEFAULT_PRICE_TTL_SECS, DEFAULT_QUOTE_TIMEOUT_SECS,
    DEFAULT_QUOTE_TTL_SECS, DEFAULT_RPC_TIMEOUT_SECS, DEFAULT_SUBMISSION_TIMEOUT_SECS,
    ENTRY_POINT_V06, MULTICALL3, SUPPORTED_CHAIN_IDS,
};

// ============================================
// CHAIN CONFIGURATION
// ============================================

/// How a chain scanner learns which tokens a wallet holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryStrategy {
    /// Indexer call (`alchemy_getTokenBalances`) on the given endpoint
    Alchemy { url: String },
    /// Fixed token list probed with multicall
    Static(Vec<Address>),
    /// Native balance only
    NativeOnly,
}

/// Per-chain configuration (endpoints, contracts, limits)
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub native_symbol: String,
    /// Primary first, fallbacks after
    pub rpc_urls: Vec<String>,
    pub bundler_url: Option<String>,
    pub paymaster_url: Option<String>,
    pub discovery: DiscoveryStrategy,
    /// `None` disables multicall; holdings fall back to JSON-RPC batches
    pub multicall: Option<Address>,
    pub entry_point: Address,
    pub wrapped_native: Option<Address>,
    /// Asset swept into when the caller does not name one
    pub default_target: Option<Address>,
    /// Concurrent RPC calls allowed against this chain
    pub rpc_concurrency: usize,
    pub multicall_batch_size: usize,
}

impl ChainConfig {
    /// Minimal config for one chain with only a public RPC
    pub fn with_defaults(chain_id: u64) -> Self {
        Self {
            chain_id,
            name: get_chain_name(chain_id).to_string(),
            native_symbol: get_native_symbol(chain_id).to_string(),
            rpc_urls: get_public_rpc_fallback(chain_id)
                .map(|u| vec![u.to_string()])
                .unwrap_or_default(),
            bundler_url: None,
            paymaster_url: None,
            discovery: DiscoveryStrategy::NativeOnly,
            multicall: Some(MULTICALL3),
            entry_point: ENTRY_POINT_V06,
            wrapped_native: get_wrapped_native(chain_id),
            default_target: get_usdc_address(chain_id),
            rpc_concurrency: 8,
            multicall_batch_size: DEFAULT_MULTICALL_BATCH_SIZE,
        }
    }

    /// Overlay environment settings for one chain
    fn from_env(chain_id: u64, alchemy_key: Option<&str>) -> AppResult<Self> {
        let prefix = env_prefix(chain_id);
        let mut config = Self::with_defaults(chain_id);
        let alchemy_url = alchemy_key.and_then(|k| build_alchemy_url(chain_id, k));

        // Explicit URL wins, then Alchemy, then the public fallback
        let mut urls = Vec::new();
        if let Some(url) = env_string(&format!("{}_HTTP_URL", prefix)) {
            urls.push(url);
        }
        if let Some(url) = &alchemy_url {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        for url in config.rpc_urls.drain(..) {
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        config.rpc_urls = urls;

        config.bundler_url = env_string(&format!("{}_BUNDLER_URL", prefix)).or(alchemy_url.clone());
        config.paymaster_url = env_string(&format!("{}_PAYMASTER_URL", prefix));

        config.discovery = match env_string(&format!("{}_TOKEN_LIST", prefix)) {
            Some(list) => DiscoveryStrategy::Static(parse_address_list(&list)?),
            None => match alchemy_url {
                Some(url) => DiscoveryStrategy::Alchemy { url },
                None => DiscoveryStrategy::NativeOnly,
            },
        };

        if env_bool(&format!("{}_DISABLE_MULTICALL", prefix), false)? {
            config.multicall = None;
        }
        if let Some(target) = env_string(&format!("{}_TARGET_ASSET", prefix)) {
            config.default_target = Some(parse_address(&target)?);
        }
        config.rpc_concurrency = env_parse(&format!("{}_RPC_CONCURRENCY", prefix), config.rpc_concurrency)?;
        if config.rpc_concurrency == 0 {
            return Err(AppError::invalid_config(format!("{}_RPC_CONCURRENCY must be > 0", prefix)));
        }

        Ok(config)
    }
}

/// Env variable prefix for a chain
fn env_prefix(chain_id: u64) -> &'static str {
    match chain_id {
        CHAIN_ID_ETHEREUM => "ETH",
        CHAIN_ID_BSC => "BSC",
        CHAIN_ID_POLYGON => "POLYGON",
        CHAIN_ID_ARBITRUM => "ARBITRUM",
        CHAIN_ID_OPTIMISM => "OPTIMISM",
        CHAIN_ID_AVALANCHE => "AVALANCHE",
        CHAIN_ID_BASE => "BASE",
        _ => "CHAIN",
    }
}

// ============================================
// POLICIES
// ============================================

/// Dust threshold policy
#[derive(Debug, Clone, Serialize)]
pub struct DustPolicy {
    /// Balances valued below this are dust
    pub min_usd_value: f64,
    /// Balances with fewer raw units are ignored entirely
    pub min_raw_amount: U256,
    /// Sweep only when gas cost <= ratio * value
    pub max_economic_gas_ratio: f64,
}

impl Default for DustPolicy {
    fn default() -> Self {
        Self {
            min_usd_value: 5.0,
            min_raw_amount: U256::from(1u64),
            max_economic_gas_ratio: 1.0,
        }
    }
}

/// Gas usage model used to price a sweep before it is built
#[derive(Debug, Clone, Serialize)]
pub struct GasModel {
    /// Fixed overhead of one user operation (verification + pre-verification)
    pub base_gas: u64,
    pub gas_per_swap: u64,
    pub gas_per_approval: u64,
    /// Approvals are signed off-chain (permit-style) instead of batched
    pub gasless_approvals: bool,
}

impl Default for GasModel {
    fn default() -> Self {
        Self {
            base_gas: 150_000,
            gas_per_swap: 180_000,
            gas_per_approval: 50_000,
            gasless_approvals: false,
        }
    }
}

impl GasModel {
    /// Marginal gas of moving one token
    pub fn per_token_gas(&self, needs_approval: bool) -> u64 {
        let approval = if needs_approval && !self.gasless_approvals {
            self.gas_per_approval
        } else {
            0
        };
        self.gas_per_swap + approval
    }
}

/// Gas sponsorship policy; serialized into every audit record
#[derive(Debug, Clone, Serialize)]
pub struct SponsorshipPolicy {
    pub policy_id: String,
    pub max_gas_usd_per_job: f64,
    pub daily_cap_usd_per_wallet: f64,
    /// Empty allow list means every wallet not denied is eligible
    pub allow_list: HashSet<Address>,
    pub deny_list: HashSet<Address>,
    /// Caller opted into user-paid gas when sponsorship is refused
    pub allow_unsponsored_fallback: bool,
}

impl Default for SponsorshipPolicy {
    fn default() -> Self {
        Self {
            policy_id: "default".to_string(),
            max_gas_usd_per_job: 5.0,
            daily_cap_usd_per_wallet: 20.0,
            allow_list: HashSet::new(),
            deny_list: HashSet::new(),
            allow_unsponsored_fallback: false,
        }
    }
}

/// Bounded retry budgets
#[derive(Debug, Clone)]
pub struct RetryBudget {
    /// Transient failures tolerated in one state
    pub max_attempts_per_state: u32,
    /// Backward transitions tolerated per job
    pub max_rebuilds: u32,
    /// Resubmissions of the same signed batch
    pub max_submission_retries: u32,
    /// Queue deliveries before dead-lettering
    pub max_deliveries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            max_attempts_per_state: 5,
            max_rebuilds: 3,
            max_submission_retries: 3,
            max_deliveries: 10,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Per-call and job-level timeouts
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub rpc: Duration,
    pub quote: Duration,
    pub bundler: Duration,
    /// Job-level bound on waiting for a receipt
    pub submission: Duration,
    pub receipt_poll_base: Duration,
    pub receipt_poll_max: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            rpc: Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS),
            quote: Duration::from_secs(DEFAULT_QUOTE_TIMEOUT_SECS),
            bundler: Duration::from_secs(DEFAULT_BUNDLER_TIMEOUT_SECS),
            submission: Duration::from_secs(DEFAULT_SUBMISSION_TIMEOUT_SECS),
            receipt_poll_base: Duration::from_secs(1),
            receipt_poll_max: Duration::from_secs(15),
        }
    }
}

/// Worker pool sizing
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub scan_workers: usize,
    pub quote_workers: usize,
    pub submit_workers: usize,
    /// Parallel quote requests within one job
    pub quote_concurrency: usize,
    /// Queue visibility timeout before redelivery
    pub visibility_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scan_workers: 4,
            quote_workers: 4,
            submit_workers: 2,
            quote_concurrency: 8,
            visibility_timeout: Duration::from_secs(180),
        }
    }
}

/// Cache TTLs
#[derive(Debug, Clone)]
pub struct CacheTtls {
    pub price: Duration,
    pub holdings: Duration,
    pub quote: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            price: Duration::from_secs(DEFAULT_PRICE_TTL_SECS),
            holdings: Duration::from_secs(DEFAULT_HOLDINGS_TTL_SECS),
            quote: Duration::from_secs(DEFAULT_QUOTE_TTL_SECS),
        }
    }
}

/// Tie-break between quotes with equal net output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum QuoteTieBreak {
    /// Prefer the quote that stays valid longest
    #[default]
    LongestValidity,
    /// Prefer the quote that expires first
    EarliestExpiry,
}

impl FromStr for QuoteTieBreak {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "longest_validity" | "longest" => Ok(Self::LongestValidity),
            "earliest_expiry" | "earliest" => Ok(Self::EarliestExpiry),
            other => Err(AppError::invalid_config(format!("Unknown QUOTE_TIE_BREAK: {}", other))),
        }
    }
}

// ============================================
// ENGINE CONFIGURATION
// ============================================

/// Top-level configuration for the sweep engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub chains: HashMap<u64, ChainConfig>,
    pub dust: DustPolicy,
    pub gas: GasModel,
    pub sponsorship: SponsorshipPolicy,
    pub retry: RetryBudget,
    pub timeouts: Timeouts,
    pub workers: WorkerConfig,
    pub cache_ttls: CacheTtls,
    /// Maximum accepted price age
    pub price_staleness: Duration,
    /// Quotes must outlive now + this when a batch is built
    pub estimated_build_time: Duration,
    pub lease_ttl: Duration,
    pub quote_tie_break: QuoteTieBreak,
    pub zeroex_api_url: Option<String>,
    pub zeroex_api_key: Option<String>,
    pub signer_url: Option<String>,
    pub alchemy_api_key: Option<String>,
    pub scan_interval: Duration,
    pub sweep_wallets: Vec<WalletAddress>,
    pub telemetry_path: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chains: SUPPORTED_CHAIN_IDS
                .iter()
                .map(|&id| (id, ChainConfig::with_defaults(id)))
                .collect(),
            dust: DustPolicy::default(),
            gas: GasModel::default(),
            sponsorship: SponsorshipPolicy::default(),
            retry: RetryBudget::default(),
            timeouts: Timeouts::default(),
            workers: WorkerConfig::default(),
            cache_ttls: CacheTtls::default(),
            price_staleness: Duration::from_secs(DEFAULT_PRICE_STALENESS_SECS),
            estimated_build_time: Duration::from_secs(3),
            lease_ttl: Duration::from_secs(300),
            quote_tie_break: QuoteTieBreak::default(),
            zeroex_api_url: None,
            zeroex_api_key: None,
            signer_url: None,
            alchemy_api_key: None,
            scan_interval: Duration::from_secs(3600),
            sweep_wallets: Vec::new(),
            telemetry_path: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the environment
    /// Security: API keys are NEVER logged
    pub fn from_env() -> AppResult<Self> {
        let defaults = Self::default();

        let alchemy_api_key = env_string("ALCHEMY_API_KEY").filter(|k| k != "YOUR_API_KEY");
        if alchemy_api_key.is_some() {
            info!("🔑 ALCHEMY_API_KEY configured (key hidden for security)");
        }

        let enabled: Vec<u64> = match env_string("ENABLED_CHAINS") {
            Some(list) => parse_chain_list(&list)?,
            None => SUPPORTED_CHAIN_IDS.to_vec(),
        };

        let mut chains = HashMap::new();
        for chain_id in enabled {
            let config = ChainConfig::from_env(chain_id, alchemy_api_key.as_deref())?;
            if config.rpc_urls.is_empty() {
                warn!("⚠️ No RPC endpoint for chain {}; skipping", chain_id);
                continue;
            }
            chains.insert(chain_id, config);
        }

        let dust = DustPolicy {
            min_usd_value: env_parse("DUST_MIN_USD", defaults.dust.min_usd_value)?,
            min_raw_amount: match env_string("DUST_MIN_RAW_AMOUNT") {
                Some(raw) => U256::from_str(&raw)
                    .map_err(|e| AppError::invalid_config(format!("DUST_MIN_RAW_AMOUNT: {}", e)))?,
                None => defaults.dust.min_raw_amount,
            },
            max_economic_gas_ratio: env_parse("DUST_MAX_GAS_RATIO", defaults.dust.max_economic_gas_ratio)?,
        };

        let gas = GasModel {
            base_gas: env_parse("GAS_BASE", defaults.gas.base_gas)?,
            gas_per_swap: env_parse("GAS_PER_SWAP", defaults.gas.gas_per_swap)?,
            gas_per_approval: env_parse("GAS_PER_APPROVAL", defaults.gas.gas_per_approval)?,
            gasless_approvals: env_bool("GASLESS_APPROVALS", defaults.gas.gasless_approvals)?,
        };

        let sponsorship = SponsorshipPolicy {
            policy_id: env_string("SPONSOR_POLICY_ID").unwrap_or(defaults.sponsorship.policy_id),
            max_gas_usd_per_job: env_parse("SPONSOR_MAX_PER_JOB_USD", defaults.sponsorship.max_gas_usd_per_job)?,
            daily_cap_usd_per_wallet: env_parse(
                "SPONSOR_DAILY_CAP_USD",
                defaults.sponsorship.daily_cap_usd_per_wallet,
            )?,
            allow_list: parse_address_list(&env_string("SPONSOR_ALLOW_LIST").unwrap_or_default())?
                .into_iter()
                .collect(),
            deny_list: parse_address_list(&env_string("SPONSOR_DENY_LIST").unwrap_or_default())?
                .into_iter()
                .collect(),
            allow_unsponsored_fallback: env_bool("SPONSOR_ALLOW_UNSPONSORED", false)?,
        };

        let retry = RetryBudget {
            max_attempts_per_state: env_parse("RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts_per_state)?,
            max_rebuilds: env_parse("RETRY_MAX_REBUILDS", defaults.retry.max_rebuilds)?,
            max_submission_retries: env_parse("RETRY_MAX_SUBMISSIONS", defaults.retry.max_submission_retries)?,
            max_deliveries: env_parse("QUEUE_MAX_DELIVERIES", defaults.retry.max_deliveries)?,
            backoff_base: env_millis("RETRY_BACKOFF_BASE_MS", defaults.retry.backoff_base)?,
            backoff_max: env_millis("RETRY_BACKOFF_MAX_MS", defaults.retry.backoff_max)?,
        };

        let timeouts = Timeouts {
            rpc: env_secs("RPC_TIMEOUT_SECS", defaults.timeouts.rpc)?,
            quote: env_secs("QUOTE_TIMEOUT_SECS", defaults.timeouts.quote)?,
            bundler: env_secs("BUNDLER_TIMEOUT_SECS", defaults.timeouts.bundler)?,
            submission: env_secs("SUBMISSION_TIMEOUT_SECS", defaults.timeouts.submission)?,
            ..defaults.timeouts
        };

        let workers = WorkerConfig {
            scan_workers: env_parse("SCAN_WORKERS", defaults.workers.scan_workers)?,
            quote_workers: env_parse("QUOTE_WORKERS", defaults.workers.quote_workers)?,
            submit_workers: env_parse("SUBMIT_WORKERS", defaults.workers.submit_workers)?,
            quote_concurrency: env_parse("QUOTE_CONCURRENCY", defaults.workers.quote_concurrency)?,
            visibility_timeout: env_secs("QUEUE_VISIBILITY_SECS", defaults.workers.visibility_timeout)?,
        };

        let cache_ttls = CacheTtls {
            price: env_secs("CACHE_PRICE_TTL_SECS", defaults.cache_ttls.price)?,
            holdings: env_secs("CACHE_HOLDINGS_TTL_SECS", defaults.cache_ttls.holdings)?,
            quote: env_secs("CACHE_QUOTE_TTL_SECS", defaults.cache_ttls.quote)?,
        };

        let sweep_wallets = env_string("SWEEP_WALLETS")
            .map(|list| {
                split_list(&list)
                    .map(WalletAddress::parse)
                    .collect::<AppResult<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        let config = Self {
            chains,
            dust,
            gas,
            sponsorship,
            retry,
            timeouts,
            workers,
            cache_ttls,
            price_staleness: env_secs("PRICE_STALENESS_SECS", defaults.price_staleness)?,
            estimated_build_time: env_millis("ESTIMATED_BUILD_MS", defaults.estimated_build_time)?,
            lease_ttl: env_secs("LEASE_TTL_SECS", defaults.lease_ttl)?,
            quote_tie_break: match env_string("QUOTE_TIE_BREAK") {
                Some(v) => v.parse()?,
                None => defaults.quote_tie_break,
            },
            zeroex_api_url: env_string("ZEROEX_API_URL"),
            zeroex_api_key: env_string("ZEROEX_API_KEY"),
            signer_url: env_string("SIGNER_URL"),
            alchemy_api_key,
            scan_interval: env_secs("SCAN_INTERVAL_SECS", defaults.scan_interval)?,
            sweep_wallets,
            telemetry_path: env_string("TELEMETRY_EXPORT_PATH"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> AppResult<()> {
        if self.dust.min_usd_value < 0.0 {
            return Err(AppError::invalid_config("DUST_MIN_USD must be >= 0"));
        }
        if self.dust.max_economic_gas_ratio <= 0.0 {
            return Err(AppError::invalid_config("DUST_MAX_GAS_RATIO must be > 0"));
        }
        if self.workers.scan_workers == 0 || self.workers.quote_workers == 0 || self.workers.submit_workers == 0 {
            return Err(AppError::invalid_config("Worker pools need at least one worker each"));
        }
        if self.retry.max_attempts_per_state == 0 {
            return Err(AppError::invalid_config("RETRY_MAX_ATTEMPTS must be > 0"));
        }
        Ok(())
    }

    pub fn chain(&self, chain_id: u64) -> AppResult<&ChainConfig> {
        self.chains
            .get(&chain_id)
            .ok_or_else(|| AppError::unsupported_chain(chain_id))
    }
}

// ============================================
// ENV HELPERS
// ============================================

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> AppResult<T>
where
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| AppError::invalid_config(format!("{}={}: {}", key, raw, e))),
        None => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> AppResult<bool> {
    match env_string(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if v == "1" || v == "true" || v == "yes" => Ok(true),
        Some(v) if v == "0" || v == "false" || v == "no" => Ok(false),
        Some(v) => Err(AppError::invalid_config(format!("{}={}: expected a boolean", key, v))),
    }
}

fn env_secs(key: &str, default: Duration) -> AppResult<Duration> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

fn env_millis(key: &str, default: Duration) -> AppResult<Duration> {
    env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_address(raw: &str) -> AppResult<Address> {
    Address::from_str(raw.trim())
        .map_err(|e| AppError::invalid_config(format!("Invalid address {}: {}", raw, e)))
}

/// Comma-separated addresses
pub fn parse_address_list(list: &str) -> AppResult<Vec<Address>> {
    split_list(list).map(parse_address).collect()
}

/// Comma-separated chain ids; unknown chains are rejected
pub fn parse_chain_list(list: &str) -> AppResult<Vec<u64>> {
    split_list(list)
        .map(|s| {
            let id: u64 = s
                .parse()
                .map_err(|_| AppError::invalid_config(format!("Invalid chain id: {}", s)))?;
            if SUPPORTED_CHAIN_IDS.contains(&id) {
                Ok(id)
            } else {
                Err(AppError::unsupported_chain(id))
            }
        })
        .collect()
}
