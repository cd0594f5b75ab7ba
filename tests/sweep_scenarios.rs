//! End-to-end sweep scenarios against in-process chain, router, paymaster,
//! signer and bundler fakes.

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use dust_sweeper::core::aggregator::AggregatorSettings;
use dust_sweeper::core::scanner::HoldingsSnapshot;
use dust_sweeper::core::submitter::{LogEntry, UserOpReceipt, TRANSFER_TOPIC};
use dust_sweeper::core::{
    BatchBuilder, Bundler, CachedScanner, ChainScanner, ChainStateReader, EngineDeps, InMemoryJobStore,
    InMemoryQueue, JobOrchestrator, JobQueue, JobStore, Lane, Paymaster, QuoteProvider, QuoteRequest,
    RouteAggregator, Signer, SponsorshipCoordinator, StaticPolicyStore, Submitter,
};
use dust_sweeper::models::config::{ChainConfig, EngineConfig, GasModel, RetryBudget, SponsorshipPolicy, Timeouts};
use dust_sweeper::models::errors::{AppError, AppResult, ErrorCode};
use dust_sweeper::models::types::{
    FeeBreakdown, JobStatus, SponsorshipData, SwapTransaction, SweepJob, SweepQuote, TokenHolding, TokenPrice,
    UserOperationBatch, WalletAddress,
};
use dust_sweeper::providers::ChainLimits;
use dust_sweeper::telemetry::SweepTelemetry;
use dust_sweeper::utils::cache::SweepCache;
use dust_sweeper::utils::constants::NATIVE_TOKEN;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

const BASE: u64 = 8453;
const WALLET: Address = Address::repeat_byte(0x42);
const TARGET: Address = Address::repeat_byte(0xCC);
const ROUTER: Address = Address::repeat_byte(0xEE);
const TOKEN_A: Address = Address::repeat_byte(0x0A);
const TOKEN_B: Address = Address::repeat_byte(0x0B);
const TOKEN_C: Address = Address::repeat_byte(0x0C);
const TOKEN_D: Address = Address::repeat_byte(0x0D);

/// Millionths of an 18-decimal token
fn micro(n: u64) -> U256 {
    U256::from(n) * U256::from(1_000_000_000_000u64)
}

fn holding(token: Address, raw_amount: U256) -> TokenHolding {
    TokenHolding {
        token_address: token,
        raw_amount,
        decimals: 18,
        symbol: None,
    }
}

fn gwei(n: u64) -> U256 {
    U256::from(n) * U256::from(1_000_000_000u64)
}

// ============================================
// FAKES
// ============================================

/// Price lookups fail with a 503 until `price_outages` runs out
struct FakeChain {
    holdings: Vec<TokenHolding>,
    prices: HashMap<Address, f64>,
    price_outages: AtomicUsize,
}

#[async_trait]
impl ChainScanner for FakeChain {
    fn chain_id(&self) -> u64 {
        BASE
    }

    async fn list_holdings(&self, _wallet: Address) -> AppResult<HoldingsSnapshot> {
        Ok(HoldingsSnapshot {
            holdings: self.holdings.clone(),
            discovery_complete: true,
        })
    }

    async fn price_of(&self, token: Address) -> AppResult<TokenPrice> {
        let down = self
            .price_outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if down {
            return Err(AppError::endpoint_unavailable("price API returned 503"));
        }
        self.prices
            .get(&token)
            .map(|usd| TokenPrice {
                usd: *usd,
                as_of: Utc::now(),
                source: "fake".into(),
            })
            .ok_or_else(|| AppError::price_unavailable(format!("no price for {:#x}", token)))
    }
}

/// Nonce and gas price reads walk their sequences; the last value repeats
struct FakeState {
    nonces: Mutex<VecDeque<u64>>,
    gas_prices: Mutex<VecDeque<U256>>,
    nonce_reads: AtomicUsize,
}

#[async_trait]
impl ChainStateReader for FakeState {
    async fn account_nonce(&self, _chain_id: u64, _sender: Address) -> AppResult<U256> {
        self.nonce_reads.fetch_add(1, Ordering::SeqCst);
        let mut nonces = self.nonces.lock().unwrap();
        let nonce = if nonces.len() > 1 {
            nonces.pop_front().unwrap()
        } else {
            nonces.front().copied().unwrap_or(0)
        };
        Ok(U256::from(nonce))
    }

    async fn allowance(&self, _: u64, _: Address, _: Address, _: Address) -> AppResult<U256> {
        Ok(U256::MAX)
    }

    async fn gas_price(&self, _chain_id: u64) -> AppResult<U256> {
        let mut prices = self.gas_prices.lock().unwrap();
        let price = if prices.len() > 1 {
            prices.pop_front().unwrap()
        } else {
            prices.front().copied().unwrap_or_default()
        };
        Ok(price)
    }
}

/// 1:1 USD router into a 6-decimal target; the first quote may be short-lived
struct FakeRouter {
    calls: AtomicUsize,
    first_validity_secs: i64,
}

#[async_trait]
impl QuoteProvider for FakeRouter {
    fn name(&self) -> &str {
        "fake-router"
    }

    async fn quote(&self, request: &QuoteRequest) -> AppResult<SweepQuote> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let validity = if n == 0 { self.first_validity_secs } else { 60 };
        Ok(SweepQuote {
            route_id: format!("fake:{}", n),
            provider: self.name().to_string(),
            chain_id: request.chain_id,
            input_token: request.input_token,
            output_token: request.output_token,
            input_amount: request.input_amount,
            estimated_output: request.input_amount / U256::from(1_000_000_000_000u64),
            fee_breakdown: FeeBreakdown::default(),
            price_impact_bps: 0,
            expires_at: Utc::now() + ChronoDuration::seconds(validity),
            recipient: request.recipient,
            tx: SwapTransaction {
                to: ROUTER,
                data: Bytes::from(vec![0x12, 0x34]),
                value: U256::ZERO,
                allowance_target: None,
            },
        })
    }
}

struct FakePaymaster;

#[async_trait]
impl Paymaster for FakePaymaster {
    async fn sponsor(&self, batch: &UserOperationBatch, policy_id: &str) -> AppResult<SponsorshipData> {
        Ok(SponsorshipData {
            paymaster_and_data: Bytes::from(vec![0xAA; 20]),
            sponsored_gas_usd: batch.estimated_gas_usd,
            policy_id: policy_id.to_string(),
            gas_overrides: None,
            valid_until: None,
        })
    }
}

#[derive(Default)]
struct FakeSigner {
    calls: AtomicUsize,
}

#[async_trait]
impl Signer for FakeSigner {
    async fn sign(&self, _chain_id: u64, _sender: Address, _hash: B256) -> AppResult<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Bytes::from(vec![0x1B; 65]))
    }
}

/// Delivers `output` of the target; the first `pending_polls` receipt
/// lookups see nothing yet
struct FakeBundler {
    sent_nonces: Mutex<Vec<U256>>,
    output: U256,
    pending_polls: AtomicUsize,
}

#[async_trait]
impl Bundler for FakeBundler {
    async fn send_user_operation(&self, batch: &UserOperationBatch) -> AppResult<B256> {
        assert!(batch.is_signed(), "unsigned operation reached the bundler");
        self.sent_nonces.lock().unwrap().push(batch.nonce);
        Ok(batch.hash.unwrap_or_else(|| batch.compute_hash()))
    }

    async fn user_operation_receipt(&self, _chain_id: u64, _hash: B256) -> AppResult<Option<UserOpReceipt>> {
        let pending = self
            .pending_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if pending {
            return Ok(None);
        }
        let mut data = [0u8; 32];
        data.copy_from_slice(&self.output.to_be_bytes::<32>());
        Ok(Some(UserOpReceipt {
            success: true,
            tx_hash: Some(B256::repeat_byte(0x77)),
            gas_used: U256::from(400_000u64),
            actual_gas_cost: U256::from(40_000_000_000_000u64),
            reason: None,
            logs: vec![LogEntry {
                address: TARGET,
                topics: vec![
                    TRANSFER_TOPIC,
                    B256::left_padding_from(ROUTER.as_slice()),
                    B256::left_padding_from(WALLET.as_slice()),
                ],
                data: Bytes::copy_from_slice(&data),
            }],
        }))
    }
}

/// Job store that refuses to persist any non-terminal state
struct ReadOnlyProgressStore {
    inner: InMemoryJobStore,
}

#[async_trait]
impl JobStore for ReadOnlyProgressStore {
    async fn create_or_get(&self, job: SweepJob, holder: &str, lease_ttl: Duration) -> AppResult<(SweepJob, bool)> {
        self.inner.create_or_get(job, holder, lease_ttl).await
    }

    async fn get(&self, id: &Uuid) -> AppResult<SweepJob> {
        self.inner.get(id).await
    }

    async fn find_by_key(&self, key: &str) -> AppResult<Option<SweepJob>> {
        self.inner.find_by_key(key).await
    }

    async fn list_by_status(&self, status: JobStatus) -> AppResult<Vec<SweepJob>> {
        self.inner.list_by_status(status).await
    }

    async fn acquire_lease(&self, id: &Uuid, holder: &str, ttl: Duration) -> AppResult<()> {
        self.inner.acquire_lease(id, holder, ttl).await
    }

    async fn update(&self, job: &SweepJob, holder: &str) -> AppResult<()> {
        if !job.is_terminal() {
            return Err(AppError::endpoint_unavailable("job store is read-only"));
        }
        self.inner.update(job, holder).await
    }

    async fn request_cancel(&self, id: &Uuid) -> AppResult<()> {
        self.inner.request_cancel(id).await
    }

    async fn is_cancel_requested(&self, id: &Uuid) -> bool {
        self.inner.is_cancel_requested(id).await
    }
}

// ============================================
// HARNESS
// ============================================

struct Setup {
    holdings: Vec<TokenHolding>,
    prices: Vec<(Address, f64)>,
    price_outages: usize,
    gas_price: U256,
    /// Gas price from the second read on
    later_gas_price: Option<U256>,
    nonces: Vec<u64>,
    first_quote_validity_secs: i64,
    pending_receipt_polls: usize,
    gas: GasModel,
    policy: SponsorshipPolicy,
    max_deliveries: u32,
    read_only_progress: bool,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            holdings: vec![holding(TOKEN_C, micro(1_000_000)), holding(TOKEN_D, micro(2_000_000))],
            prices: vec![(NATIVE_TOKEN, 2000.0), (TOKEN_A, 0.40), (TOKEN_B, 1.0), (TOKEN_C, 1.0), (TOKEN_D, 1.0)],
            // 0.1 gwei: one ERC-20 costs about $0.046 to move
            price_outages: 0,
            gas_price: U256::from(100_000_000u64),
            later_gas_price: None,
            nonces: vec![0],
            first_quote_validity_secs: 60,
            pending_receipt_polls: 0,
            gas: GasModel::default(),
            policy: SponsorshipPolicy::default(),
            max_deliveries: RetryBudget::default().max_deliveries,
            read_only_progress: false,
        }
    }
}

struct Harness {
    orchestrator: Arc<JobOrchestrator>,
    telemetry: Arc<SweepTelemetry>,
    state: Arc<FakeState>,
    router: Arc<FakeRouter>,
    signer: Arc<FakeSigner>,
    bundler: Arc<FakeBundler>,
    queue: Arc<InMemoryQueue>,
}

impl Harness {
    fn new(setup: Setup) -> Self {
        let mut chain = ChainConfig::with_defaults(BASE);
        chain.default_target = Some(TARGET);

        let config = EngineConfig {
            chains: HashMap::from([(BASE, chain)]),
            gas: setup.gas,
            sponsorship: setup.policy,
            retry: RetryBudget {
                backoff_base: Duration::from_millis(10),
                backoff_max: Duration::from_millis(50),
                max_deliveries: setup.max_deliveries,
                ..RetryBudget::default()
            },
            timeouts: Timeouts {
                receipt_poll_base: Duration::from_millis(10),
                receipt_poll_max: Duration::from_millis(50),
                ..Timeouts::default()
            },
            ..EngineConfig::default()
        };

        let cache = SweepCache::new();
        let limits = ChainLimits::new([(BASE, 4)]);
        let telemetry = Arc::new(SweepTelemetry::new());

        let fake_chain = Arc::new(FakeChain {
            holdings: setup.holdings,
            prices: setup.prices.into_iter().collect(),
            price_outages: AtomicUsize::new(setup.price_outages),
        });
        let scanner = Arc::new(CachedScanner::new(
            fake_chain,
            cache.clone(),
            limits.clone(),
            config.cache_ttls.clone(),
            config.price_staleness,
        ));

        let router = Arc::new(FakeRouter {
            calls: AtomicUsize::new(0),
            first_validity_secs: setup.first_quote_validity_secs,
        });
        let aggregator = Arc::new(RouteAggregator::new(
            vec![router.clone() as Arc<dyn QuoteProvider>],
            cache.clone(),
            AggregatorSettings {
                provider_timeout: config.timeouts.quote,
                concurrency: config.workers.quote_concurrency,
                quote_ttl: config.cache_ttls.quote,
                tie_break: config.quote_tie_break,
            },
        ));

        let state = Arc::new(FakeState {
            nonces: Mutex::new(setup.nonces.into_iter().collect()),
            gas_prices: Mutex::new(std::iter::once(setup.gas_price).chain(setup.later_gas_price).collect()),
            nonce_reads: AtomicUsize::new(0),
        });
        let reader: Arc<dyn ChainStateReader> = state.clone();
        let builder = Arc::new(BatchBuilder::new(
            reader.clone(),
            config.gas.clone(),
            config.dust.max_economic_gas_ratio,
            config.estimated_build_time,
        ));

        let paymasters: HashMap<u64, Arc<dyn Paymaster>> = HashMap::from([(BASE, Arc::new(FakePaymaster) as Arc<dyn Paymaster>)]);
        let signer = Arc::new(FakeSigner::default());
        let bundler = Arc::new(FakeBundler {
            sent_nonces: Mutex::new(Vec::new()),
            output: U256::from(3_000_000u64),
            pending_polls: AtomicUsize::new(setup.pending_receipt_polls),
        });
        let submitter = Arc::new(Submitter::new(
            signer.clone(),
            bundler.clone(),
            reader.clone(),
            limits,
            config.retry.clone(),
            config.timeouts.clone(),
        ));

        let queue = Arc::new(InMemoryQueue::new(
            config.workers.visibility_timeout,
            config.retry.max_deliveries,
        ));
        let store: Arc<dyn JobStore> = if setup.read_only_progress {
            Arc::new(ReadOnlyProgressStore {
                inner: InMemoryJobStore::new(),
            })
        } else {
            Arc::new(InMemoryJobStore::new())
        };

        let deps = EngineDeps {
            scanners: HashMap::from([(BASE, scanner)]),
            aggregator,
            builder,
            sponsorship: Arc::new(SponsorshipCoordinator::new(paymasters)),
            policies: Arc::new(StaticPolicyStore::new(config.sponsorship.clone())),
            submitter,
            state: reader,
            store,
            queue: queue.clone(),
            telemetry: telemetry.clone(),
        };

        Self {
            orchestrator: Arc::new(JobOrchestrator::new(config, deps)),
            telemetry,
            state,
            router,
            signer,
            bundler,
            queue,
        }
    }

    fn signatures(&self) -> usize {
        self.signer.calls.load(Ordering::SeqCst)
    }

    fn sent_nonces(&self) -> Vec<U256> {
        self.bundler.sent_nonces.lock().unwrap().clone()
    }
}

fn wallet() -> WalletAddress {
    WalletAddress(WALLET)
}

// ============================================
// SCENARIOS
// ============================================

#[tokio::test]
async fn test_economical_dust_is_swept_and_confirmed() {
    let h = Harness::new(Setup::default());

    let job = h.orchestrator.enqueue_sweep(wallet(), BASE, TARGET).await.unwrap();
    let done = h.orchestrator.run_to_completion(job.id).await.unwrap();

    assert_eq!(done.status, JobStatus::Confirmed);
    assert_eq!(
        done.status_path(),
        vec![
            JobStatus::Pending,
            JobStatus::Scanning,
            JobStatus::Quoting,
            JobStatus::Building,
            JobStatus::Authorizing,
            JobStatus::Submitted,
            JobStatus::Confirmed,
        ]
    );
    assert_eq!(done.quote_ids.len(), 2);
    assert_eq!(done.sponsorship_ref.as_deref(), Some("default"));

    let receipt = done.receipt.expect("confirmed job keeps its receipt");
    assert!(receipt.success);
    assert_eq!(receipt.actual_output_value, Some(U256::from(3_000_000u64)));

    assert_eq!(h.signatures(), 1);
    assert_eq!(h.sent_nonces(), vec![U256::ZERO]);

    let stats = h.telemetry.get_stats();
    assert_eq!(stats.jobs_confirmed, 1);
    assert!((stats.usd_swept - 3.0).abs() < 1e-6);
    // Sponsored gas stays well under the value moved
    assert!(stats.gas_sponsored_usd > 0.0 && stats.gas_sponsored_usd < stats.usd_swept);
}

#[tokio::test]
async fn test_concurrent_enqueue_returns_the_same_job() {
    let h = Harness::new(Setup::default());

    let (a, b) = tokio::join!(
        h.orchestrator.enqueue_sweep(wallet(), BASE, TARGET),
        h.orchestrator.enqueue_sweep(wallet(), BASE, TARGET)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.id, b.id);

    let stats = h.telemetry.get_stats();
    assert_eq!(stats.jobs_created, 1);
    assert_eq!(stats.jobs_deduplicated, 1);

    // The key is released once the job is terminal
    h.orchestrator.run_to_completion(a.id).await.unwrap();
    let next = h.orchestrator.enqueue_sweep(wallet(), BASE, TARGET).await.unwrap();
    assert_ne!(next.id, a.id);
}

#[tokio::test]
async fn test_uneconomical_dust_expires_without_signing() {
    // TokenA is worth $0.00012, far below its ~$0.046 sweep cost; TokenB is $12
    let h = Harness::new(Setup {
        holdings: vec![holding(TOKEN_A, micro(300)), holding(TOKEN_B, micro(12_000_000))],
        ..Setup::default()
    });

    let job = h.orchestrator.enqueue_sweep(wallet(), BASE, TARGET).await.unwrap();
    let done = h.orchestrator.run_to_completion(job.id).await.unwrap();

    assert_eq!(done.status, JobStatus::Expired);
    let outcome = done.outcome.unwrap();
    assert!(outcome.starts_with("empty batch"), "{}", outcome);
    assert!(outcome.contains("1 dust below sweep cost"), "{}", outcome);
    assert!(outcome.contains("1 not dust"), "{}", outcome);

    assert_eq!(h.router.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.signatures(), 0);
    assert_eq!(h.telemetry.get_stats().jobs_expired, 1);
}

#[tokio::test]
async fn test_scan_enqueues_only_where_sweepable_dust_exists() {
    let h = Harness::new(Setup {
        holdings: vec![
            holding(TOKEN_A, micro(300)),
            holding(TOKEN_B, micro(12_000_000)),
            holding(TOKEN_C, micro(1_000_000)),
        ],
        ..Setup::default()
    });

    let summaries = h.orchestrator.enqueue_scan(wallet(), &[BASE]).await;
    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0];
    assert!(summary.error.is_none());
    assert_eq!(summary.holdings, 3);
    assert_eq!(summary.dust, 2);
    assert_eq!(summary.sweepable, 1);
    assert!((summary.sweepable_usd - 1.0).abs() < 1e-9);

    let job_id = summary.job_id.expect("sweepable dust enqueues a job");
    let job = h.orchestrator.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.target_asset, TARGET);
}

#[tokio::test]
async fn test_scan_without_sweepable_dust_creates_no_job() {
    let h = Harness::new(Setup {
        holdings: vec![holding(TOKEN_A, micro(300)), holding(TOKEN_B, micro(12_000_000))],
        ..Setup::default()
    });

    let summaries = h.orchestrator.enqueue_scan(wallet(), &[BASE, 999]).await;
    let base = summaries.iter().find(|s| s.chain_id == BASE).unwrap();
    assert_eq!(base.dust, 1);
    assert_eq!(base.sweepable, 0);
    assert!(base.job_id.is_none());

    // An unknown chain fails on its own
    let unknown = summaries.iter().find(|s| s.chain_id == 999).unwrap();
    assert!(unknown.error.is_some());
    assert_eq!(h.telemetry.get_stats().jobs_created, 0);
}

#[tokio::test]
async fn test_quote_expiring_during_build_is_requoted() {
    // The first quote outlives quoting but not the 3s build window
    let h = Harness::new(Setup {
        holdings: vec![holding(TOKEN_C, micro(1_000_000))],
        first_quote_validity_secs: 1,
        ..Setup::default()
    });

    let job = h.orchestrator.enqueue_sweep(wallet(), BASE, TARGET).await.unwrap();
    let done = h.orchestrator.run_to_completion(job.id).await.unwrap();

    assert_eq!(done.status, JobStatus::Confirmed);
    assert_eq!(
        done.status_path(),
        vec![
            JobStatus::Pending,
            JobStatus::Scanning,
            JobStatus::Quoting,
            JobStatus::Building,
            JobStatus::Quoting,
            JobStatus::Building,
            JobStatus::Authorizing,
            JobStatus::Submitted,
            JobStatus::Confirmed,
        ]
    );
    assert_eq!(done.rebuilds, 1);
    assert_eq!(done.quote_ids, vec!["fake:1".to_string()]);
    assert_eq!(h.router.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.signatures(), 1);
    assert_eq!(h.telemetry.get_stats().rebuilds, 1);
}

#[tokio::test]
async fn test_daily_cap_denial_fails_before_signing() {
    // 250k gas at 5 gwei and $2000 = $2.50 for a $4 candidate, over a $2 cap
    let h = Harness::new(Setup {
        holdings: vec![holding(TOKEN_C, micro(4_000_000))],
        gas_price: gwei(5),
        gas: GasModel {
            base_gas: 100_000,
            gas_per_swap: 150_000,
            gas_per_approval: 0,
            gasless_approvals: false,
        },
        policy: SponsorshipPolicy {
            daily_cap_usd_per_wallet: 2.0,
            ..SponsorshipPolicy::default()
        },
        ..Setup::default()
    });

    let job = h.orchestrator.enqueue_sweep(wallet(), BASE, TARGET).await.unwrap();
    let done = h.orchestrator.run_to_completion(job.id).await.unwrap();

    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.outcome.as_deref(), Some("sponsorship denied: daily cap exceeded"));
    assert_eq!(done.sponsorship_ref.as_deref(), Some("denied: daily cap exceeded"));
    assert_eq!(h.signatures(), 0);
    assert!(h.sent_nonces().is_empty());

    let stats = h.telemetry.get_stats();
    assert_eq!(stats.denials_by_reason.get("daily cap exceeded"), Some(&1));
    assert_eq!(stats.jobs_failed, 1);
}

#[tokio::test]
async fn test_nonce_moved_before_signing_rebuilds_instead_of_resubmitting() {
    // Built at nonce 7; the chain is at 8 by the time the batch is signed
    let h = Harness::new(Setup {
        nonces: vec![7, 8],
        ..Setup::default()
    });

    let job = h.orchestrator.enqueue_sweep(wallet(), BASE, TARGET).await.unwrap();
    let done = h.orchestrator.run_to_completion(job.id).await.unwrap();

    assert_eq!(done.status, JobStatus::Confirmed);
    let path = done.status_path();
    assert!(
        path.windows(2)
            .any(|w| w == [JobStatus::Authorizing, JobStatus::Building]),
        "{:?}",
        path
    );
    assert_eq!(done.rebuilds, 1);

    // Signed once, at the fresh nonce
    assert_eq!(h.signatures(), 1);
    assert_eq!(h.sent_nonces(), vec![U256::from(8u64)]);
    assert!(h.state.nonce_reads.load(Ordering::SeqCst) >= 4);
}

#[tokio::test]
async fn test_batch_overhead_never_produces_a_loss() {
    // At 2 gwei each token passes on its own margin ($0.92), but the shared
    // base gas pushes every batch above the value it would move
    let h = Harness::new(Setup {
        holdings: vec![holding(TOKEN_C, micro(950_000)), holding(TOKEN_D, micro(1_000_000))],
        gas_price: gwei(2),
        ..Setup::default()
    });

    let job = h.orchestrator.enqueue_sweep(wallet(), BASE, TARGET).await.unwrap();
    let done = h.orchestrator.run_to_completion(job.id).await.unwrap();

    assert_eq!(done.status, JobStatus::Expired);
    assert_eq!(
        done.status_path(),
        vec![
            JobStatus::Pending,
            JobStatus::Scanning,
            JobStatus::Quoting,
            JobStatus::Building,
            JobStatus::Expired,
        ]
    );
    assert_eq!(h.signatures(), 0);
    assert!(h.sent_nonces().is_empty());
}

#[tokio::test]
async fn test_cancellation_is_honored_at_the_next_step() {
    let h = Harness::new(Setup::default());

    let job = h.orchestrator.enqueue_sweep(wallet(), BASE, TARGET).await.unwrap();
    let advanced = h.orchestrator.advance(job.id).await.unwrap();
    assert_eq!(advanced.job.status, JobStatus::Scanning);

    h.orchestrator.cancel_job(&job.id).await.unwrap();
    let done = h.orchestrator.run_to_completion(job.id).await.unwrap();

    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.outcome.as_deref(), Some("cancelled: cancellation requested"));
    assert_eq!(h.router.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.signatures(), 0);
}

#[tokio::test]
async fn test_unsupported_chain_is_refused_before_job_creation() {
    let h = Harness::new(Setup::default());

    let err = h.orchestrator.enqueue_sweep(wallet(), 999, TARGET).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::UnsupportedChain);
    assert_eq!(h.telemetry.get_stats().jobs_created, 0);
}

#[tokio::test]
async fn test_worker_pools_drive_jobs_to_completion() {
    let h = Harness::new(Setup::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = h.orchestrator.spawn_workers(shutdown_rx);

    let job = h.orchestrator.enqueue_sweep(wallet(), BASE, TARGET).await.unwrap();

    let done = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let current = h.orchestrator.get_job(&job.id).await.unwrap();
            if current.is_terminal() {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job finished within 10s");

    assert_eq!(done.status, JobStatus::Confirmed);
    assert_eq!(h.signatures(), 1);

    shutdown_tx.send(true).unwrap();
    for worker in workers {
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("worker stopped")
            .unwrap();
    }
}

#[tokio::test]
async fn test_price_outage_is_retried_then_swept() {
    let h = Harness::new(Setup {
        price_outages: 2,
        ..Setup::default()
    });

    let job = h.orchestrator.enqueue_sweep(wallet(), BASE, TARGET).await.unwrap();
    let done = h.orchestrator.run_to_completion(job.id).await.unwrap();

    assert_eq!(done.status, JobStatus::Confirmed);
    let last_error = done.last_error.unwrap();
    assert!(last_error.contains("price API returned 503"), "{}", last_error);
    assert!((h.telemetry.get_stats().usd_swept - 3.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_price_outage_exhausts_the_scan_budget() {
    let h = Harness::new(Setup {
        price_outages: usize::MAX,
        ..Setup::default()
    });

    let job = h.orchestrator.enqueue_sweep(wallet(), BASE, TARGET).await.unwrap();

    let mut attempts = Vec::new();
    let done = loop {
        let advanced = h.orchestrator.advance(job.id).await.unwrap();
        if advanced.job.is_terminal() {
            break advanced.job;
        }
        if advanced.job.status == JobStatus::Scanning {
            attempts.push(advanced.job.attempts);
        }
    };

    // The first entry is the move into SCANNING itself
    assert_eq!(attempts, vec![0, 1, 2, 3, 4]);
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(
        done.outcome.as_deref(),
        Some("price API returned 503 after 5 attempts")
    );
    assert_eq!(
        done.status_path(),
        vec![JobStatus::Pending, JobStatus::Scanning, JobStatus::Failed]
    );
    assert_eq!(h.router.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.telemetry.get_stats().jobs_failed, 1);
}

#[tokio::test]
async fn test_nonce_consumed_while_submitted_rebuilds_at_the_new_nonce() {
    // Nonce 0 is taken by someone else while our operation waits; the
    // receipt stays missing through the grace polls
    let h = Harness::new(Setup {
        nonces: vec![0, 0, 1],
        pending_receipt_polls: 4,
        ..Setup::default()
    });

    let job = h.orchestrator.enqueue_sweep(wallet(), BASE, TARGET).await.unwrap();
    let done = h.orchestrator.run_to_completion(job.id).await.unwrap();

    assert_eq!(done.status, JobStatus::Confirmed);
    let path = done.status_path();
    assert!(
        path.windows(2)
            .any(|w| w == [JobStatus::Submitted, JobStatus::Building]),
        "{:?}",
        path
    );
    assert_eq!(done.rebuilds, 1);
    assert_eq!(h.signatures(), 2);
    assert_eq!(h.sent_nonces(), vec![U256::ZERO, U256::from(1u64)]);
    assert!(done.receipt.unwrap().success);
}

#[tokio::test]
async fn test_usd_swept_counts_only_batched_tokens() {
    // At 0.1 gwei both tokens look economical. By build time gas is 2 gwei:
    // both swaps cost $2.04 for $1.80, so TokenC is trimmed and TokenD
    // alone costs $1.32 for $1.50
    let h = Harness::new(Setup {
        holdings: vec![holding(TOKEN_C, micro(300_000)), holding(TOKEN_D, micro(1_500_000))],
        later_gas_price: Some(gwei(2)),
        ..Setup::default()
    });

    let job = h.orchestrator.enqueue_sweep(wallet(), BASE, TARGET).await.unwrap();
    let done = h.orchestrator.run_to_completion(job.id).await.unwrap();

    assert_eq!(done.status, JobStatus::Confirmed);
    assert_eq!(done.quote_ids.len(), 2);

    let stats = h.telemetry.get_stats();
    assert_eq!(stats.jobs_confirmed, 1);
    assert!((stats.usd_swept - 1.5).abs() < 1e-6, "{}", stats.usd_swept);
}

#[tokio::test]
async fn test_dead_lettered_job_fails_and_frees_its_key() {
    let h = Harness::new(Setup {
        price_outages: 1,
        ..Setup::default()
    });

    let job = h.orchestrator.enqueue_sweep(wallet(), BASE, TARGET).await.unwrap();
    // PENDING -> SCANNING, then one failed scan
    h.orchestrator.advance(job.id).await.unwrap();
    let retried = h.orchestrator.advance(job.id).await.unwrap();
    assert_eq!(retried.job.attempts, 1);

    // The ticket is handed out until the queue gives up on it
    for _ in 0..RetryBudget::default().max_deliveries {
        let ticket = h.queue.pop(Lane::Scan).await.unwrap().unwrap();
        h.queue.nack(&ticket, Duration::ZERO).await.unwrap();
    }
    assert!(h.queue.pop(Lane::Scan).await.unwrap().is_none());

    assert_eq!(h.orchestrator.reap_dead_letters().await.unwrap(), 1);
    assert_eq!(h.orchestrator.reap_dead_letters().await.unwrap(), 0);

    let failed = h.orchestrator.get_job(&job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    let outcome = failed.outcome.unwrap();
    assert!(outcome.starts_with("undeliverable on scan lane after 10 deliveries"), "{}", outcome);
    assert!(outcome.contains("price API returned 503"), "{}", outcome);
    assert_eq!(h.telemetry.get_stats().jobs_failed, 1);

    let next = h.orchestrator.enqueue_sweep(wallet(), BASE, TARGET).await.unwrap();
    assert_ne!(next.id, job.id);
}

#[tokio::test]
async fn test_worker_fails_a_job_it_can_never_advance() {
    let h = Harness::new(Setup {
        max_deliveries: 3,
        read_only_progress: true,
        ..Setup::default()
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = h.orchestrator.spawn_workers(shutdown_rx);

    let job = h.orchestrator.enqueue_sweep(wallet(), BASE, TARGET).await.unwrap();

    let done = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let current = h.orchestrator.get_job(&job.id).await.unwrap();
            if current.is_terminal() {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job failed within 10s");

    assert_eq!(done.status, JobStatus::Failed);
    let outcome = done.outcome.unwrap();
    assert!(outcome.contains("job store is read-only"), "{}", outcome);
    assert!(outcome.contains("after 3 deliveries"), "{}", outcome);
    assert_eq!(h.signatures(), 0);

    shutdown_tx.send(true).unwrap();
    for worker in workers {
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("worker stopped")
            .unwrap();
    }
}
