//! Providers Module - External Service Clients
//!
//! Chain RPC, token discovery, prices, swap quotes, the ERC-4337 bundler
//! and paymaster, and the remote signer. Each client implements the trait
//! its consumer in `core` defines.

pub mod bundler;
pub mod discovery;
pub mod prices;
pub mod quotes;
pub mod registry;
pub mod rpc;
pub mod signer;

pub use bundler::{BundlerClient, PaymasterClient};
pub use discovery::{AlchemyTokenDiscovery, StaticTokenList};
pub use prices::{AlchemyPriceSource, DexScreenerPriceSource, FallbackPriceSource};
pub use quotes::ZeroExQuoteProvider;
pub use registry::{ChainLimits, RpcRegistry};
pub use rpc::RpcProvider;
pub use signer::RemoteSigner;
