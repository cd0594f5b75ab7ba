//! Constants Module - Single Source of Truth
//!
//! Chain ids, well-known contract addresses, endpoint builders and unit
//! conversion helpers shared by the whole engine. No other module
//! hardcodes an address or a chain id.

use alloy_primitives::{address, Address, U256};

// ============================================
// APPLICATION CONSTANTS
// ============================================

/// Application name
pub const APP_NAME: &str = "DustSweeper";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// User-Agent for HTTP requests
pub const USER_AGENT: &str = "DustSweeper/0.1.0";

// ============================================
// TIMING DEFAULTS
// ============================================

/// Default timeout for a single RPC request (seconds)
pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 10;

/// Default timeout for one quote provider call (seconds)
pub const DEFAULT_QUOTE_TIMEOUT_SECS: u64 = 5;

/// Default timeout for one bundler/paymaster call (seconds)
pub const DEFAULT_BUNDLER_TIMEOUT_SECS: u64 = 10;

/// Default job-level submission timeout (seconds)
pub const DEFAULT_SUBMISSION_TIMEOUT_SECS: u64 = 120;

/// Price cache TTL (seconds) - prices move, keep it short
pub const DEFAULT_PRICE_TTL_SECS: u64 = 30;

/// Holdings index TTL (seconds) - token set changes rarely
pub const DEFAULT_HOLDINGS_TTL_SECS: u64 = 300;

/// Quote cache TTL (seconds)
pub const DEFAULT_QUOTE_TTL_SECS: u64 = 8;

/// Maximum accepted age of a price (seconds)
pub const DEFAULT_PRICE_STALENESS_SECS: u64 = 120;

/// Tokens per multicall round trip
pub const DEFAULT_MULTICALL_BATCH_SIZE: usize = 100;

// ============================================
// CHAIN IDS - Single Source of Truth
// ============================================

/// Ethereum Mainnet
pub const CHAIN_ID_ETHEREUM: u64 = 1;
/// BNB Smart Chain
pub const CHAIN_ID_BSC: u64 = 56;
/// Polygon
pub const CHAIN_ID_POLYGON: u64 = 137;
/// Arbitrum One
pub const CHAIN_ID_ARBITRUM: u64 = 42161;
/// Optimism
pub const CHAIN_ID_OPTIMISM: u64 = 10;
/// Avalanche C-Chain
pub const CHAIN_ID_AVALANCHE: u64 = 43114;
/// Base
pub const CHAIN_ID_BASE: u64 = 8453;

/// All supported EVM chain IDs
pub const SUPPORTED_CHAIN_IDS: [u64; 7] = [
    CHAIN_ID_ETHEREUM,
    CHAIN_ID_BSC,
    CHAIN_ID_POLYGON,
    CHAIN_ID_ARBITRUM,
    CHAIN_ID_OPTIMISM,
    CHAIN_ID_AVALANCHE,
    CHAIN_ID_BASE,
];

// ============================================
// WELL-KNOWN CONTRACTS
// ============================================

/// Sentinel used by aggregators and by this engine for the chain's native coin
pub const NATIVE_TOKEN: Address = address!("EeeeeEeeeEeEeeEeEeEeeEEEeeeeEeeeeeeeEEeE");

/// Multicall3 (same deployment address on every supported chain)
pub const MULTICALL3: Address = address!("cA11bde05977b3631167028862bE2a173976CA11");

/// ERC-4337 EntryPoint v0.6
pub const ENTRY_POINT_V06: Address = address!("5FF137D4b0FDCD49DcA30c7CF57E578a026d2789");

/// Get wrapped native token address for a chain (used for native pricing)
pub fn get_wrapped_native(chain_id: u64) -> Option<Address> {
    match chain_id {
        CHAIN_ID_ETHEREUM => Some(address!("C02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2")),
        CHAIN_ID_BSC => Some(address!("bb4CdB9CBd36B01bD1cBaEBF2De08d9173bc095c")),
        CHAIN_ID_POLYGON => Some(address!("0d500B1d8E8eF31E21C99d1Db9A6444d3ADf1270")),
        CHAIN_ID_ARBITRUM => Some(address!("82aF49447D8a07e3bd95BD0d56f35241523fBab1")),
        CHAIN_ID_OPTIMISM => Some(address!("4200000000000000000000000000000000000006")),
        CHAIN_ID_AVALANCHE => Some(address!("B31f66AA3C1e785363F0875A1B74E27b85FD66c7")),
        CHAIN_ID_BASE => Some(address!("4200000000000000000000000000000000000006")),
        _ => None,
    }
}

/// Get USDC address for a chain (default sweep target)
pub fn get_usdc_address(chain_id: u64) -> Option<Address> {
    match chain_id {
        CHAIN_ID_ETHEREUM => Some(address!("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48")),
        CHAIN_ID_BSC => Some(address!("8AC76a51cc950d9822D68b83fE1Ad97B32Cd580d")),
        CHAIN_ID_POLYGON => Some(address!("3c499c542cEF5E3811e1192ce70d8cC03d5c3359")),
        CHAIN_ID_ARBITRUM => Some(address!("af88d065e77c8cC2239327C5EDb3A432268e5831")),
        CHAIN_ID_OPTIMISM => Some(address!("0b2C639c533813f4Aa9D7837CAf62653d097Ff85")),
        CHAIN_ID_AVALANCHE => Some(address!("B97EF9Ef8734C71904D8002F8b6Bc66Dd9c48a6E")),
        CHAIN_ID_BASE => Some(address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913")),
        _ => None,
    }
}

// ============================================
// PUBLIC RPC FALLBACKS
// ============================================

/// Get public RPC fallback URL for a chain
pub fn get_public_rpc_fallback(chain_id: u64) -> Option<&'static str> {
    match chain_id {
        CHAIN_ID_ETHEREUM => Some("https://eth.llamarpc.com"),
        CHAIN_ID_BSC => Some("https://bsc-dataseed.binance.org"),
        CHAIN_ID_POLYGON => Some("https://polygon-rpc.com"),
        CHAIN_ID_ARBITRUM => Some("https://arb1.arbitrum.io/rpc"),
        CHAIN_ID_OPTIMISM => Some("https://mainnet.optimism.io"),
        CHAIN_ID_AVALANCHE => Some("https://api.avax.network/ext/bc/C/rpc"),
        CHAIN_ID_BASE => Some("https://mainnet.base.org"),
        _ => None,
    }
}

// ============================================
// ALCHEMY NETWORK MAPPING
// ============================================

/// Get Alchemy subdomain for a chain
pub fn get_alchemy_subdomain(chain_id: u64) -> Option<&'static str> {
    match chain_id {
        CHAIN_ID_ETHEREUM => Some("eth-mainnet"),
        CHAIN_ID_BSC => Some("bnb-mainnet"),
        CHAIN_ID_POLYGON => Some("polygon-mainnet"),
        CHAIN_ID_ARBITRUM => Some("arb-mainnet"),
        CHAIN_ID_OPTIMISM => Some("opt-mainnet"),
        CHAIN_ID_AVALANCHE => Some("avax-mainnet"),
        CHAIN_ID_BASE => Some("base-mainnet"),
        _ => None,
    }
}

/// Build Alchemy URL for a chain (also serves the bundler namespace)
pub fn build_alchemy_url(chain_id: u64, api_key: &str) -> Option<String> {
    get_alchemy_subdomain(chain_id)
        .map(|subdomain| format!("https://{}.g.alchemy.com/v2/{}", subdomain, api_key))
}

// ============================================
// CHAIN METADATA
// ============================================

/// Get chain name
pub fn get_chain_name(chain_id: u64) -> &'static str {
    match chain_id {
        CHAIN_ID_ETHEREUM => "Ethereum",
        CHAIN_ID_BSC => "BNB Smart Chain",
        CHAIN_ID_POLYGON => "Polygon",
        CHAIN_ID_ARBITRUM => "Arbitrum One",
        CHAIN_ID_OPTIMISM => "Optimism",
        CHAIN_ID_AVALANCHE => "Avalanche C-Chain",
        CHAIN_ID_BASE => "Base",
        _ => "Unknown",
    }
}

/// Get native token symbol
pub fn get_native_symbol(chain_id: u64) -> &'static str {
    match chain_id {
        CHAIN_ID_BSC => "BNB",
        CHAIN_ID_POLYGON => "POL",
        CHAIN_ID_AVALANCHE => "AVAX",
        _ => "ETH",
    }
}

/// Convert numeric chain ID to DexScreener chain name
pub fn chain_id_to_dexscreener_name(chain_id: u64) -> Option<&'static str> {
    match chain_id {
        CHAIN_ID_ETHEREUM => Some("ethereum"),
        CHAIN_ID_BSC => Some("bsc"),
        CHAIN_ID_POLYGON => Some("polygon"),
        CHAIN_ID_ARBITRUM => Some("arbitrum"),
        CHAIN_ID_OPTIMISM => Some("optimism"),
        CHAIN_ID_AVALANCHE => Some("avalanche"),
        CHAIN_ID_BASE => Some("base"),
        _ => None,
    }
}

/// Check if chain ID is supported
#[inline]
pub fn is_chain_supported(chain_id: u64) -> bool {
    SUPPORTED_CHAIN_IDS.contains(&chain_id)
}

// ============================================
// CONVERSION UTILITIES
// ============================================

/// Convert a raw integer amount to a float in whole-token units.
///
/// Goes through the decimal string so amounts above `u128::MAX` still
/// produce a finite value instead of saturating.
pub fn units_to_f64(raw: U256, decimals: u8) -> f64 {
    let whole: f64 = raw.to_string().parse().unwrap_or(f64::MAX);
    whole / 10f64.powi(decimals as i32)
}
