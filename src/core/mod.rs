//! Core Module - Sweep Engine Business Logic
//!
//! Scanning, classification, routing, batching, sponsorship, submission and
//! the job state machine that strings them together. Collaborators that talk
//! to the outside world are traits defined next to the code that uses them;
//! concrete clients live in `providers`.

pub mod aggregator;
pub mod batch;
pub mod classifier;
pub mod machine;
pub mod orchestrator;
pub mod queue;
pub mod scanner;
pub mod sponsorship;
pub mod store;
pub mod submitter;

pub use aggregator::{QuoteProvider, QuoteRequest, RouteAggregator, RouteSelection};
pub use batch::{BatchBuilder, BatchRequest, ChainStateReader};
pub use classifier::{classify, ClassificationReport};
pub use orchestrator::{EngineDeps, JobOrchestrator, ScanSummary};
pub use queue::{InMemoryQueue, JobQueue, Lane};
pub use scanner::{CachedScanner, ChainScanner, EvmChainScanner, PriceSource, TokenDiscovery};
pub use sponsorship::{Paymaster, PolicyStore, SponsorshipCoordinator, SponsorshipDecision, StaticPolicyStore};
pub use store::{InMemoryJobStore, JobStore};
pub use submitter::{Bundler, Signer, Submitter};
