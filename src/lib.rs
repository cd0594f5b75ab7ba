//! Dust Sweeper Library
//!
//! Multi-chain dust detection and batched, gas-sponsored sweeps:
//! - Scan wallets across EVM chains and value every holding in USD
//! - Classify dust and decide which holdings are economical to move
//! - Route each dust token into one target asset through quote providers
//! - Batch the swaps into a single ERC-4337 user operation
//! - Sponsor gas under per-wallet policy and track every job to a receipt

pub mod core;
pub mod models;
pub mod providers;
pub mod telemetry;
pub mod utils;

pub use crate::core::{EngineDeps, JobOrchestrator, ScanSummary};
pub use models::config::EngineConfig;
pub use models::errors::{AppError, AppResult, ErrorClass, ErrorCode};
pub use models::types::{
    Classification, DustCandidate, JobStatus, Receipt, SweepJob, SweepQuote, UserOperationBatch,
    WalletAddress,
};
pub use telemetry::{SweepStats, SweepTelemetry};
