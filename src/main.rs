//! Dust Sweeper - scheduled multi-chain dust sweeps
//!
//! Scans every wallet in `SWEEP_WALLETS` on every configured chain each
//! `SCAN_INTERVAL_SECS`, enqueues a sweep wherever economical dust exists,
//! and drives the jobs through scan, quote, build, sponsorship and
//! submission on three worker pools.
//!
//! Environment:
//!   ALCHEMY_API_KEY   - Alchemy RPC, token discovery and prices
//!   SIGNER_URL        - Remote signer for user operation hashes (required)
//!   ZEROEX_API_KEY    - 0x Swap API key
//!   SWEEP_WALLETS     - Comma-separated smart account addresses
//!   RUST_LOG          - Log level (default: info)

use dust_sweeper::core::aggregator::AggregatorSettings;
use dust_sweeper::core::scanner::{PriceSource, TokenDiscovery};
use dust_sweeper::core::sponsorship::Paymaster;
use dust_sweeper::core::{
    BatchBuilder, CachedScanner, ChainStateReader, EngineDeps, EvmChainScanner, InMemoryJobStore,
    InMemoryQueue, JobOrchestrator, RouteAggregator, SponsorshipCoordinator, StaticPolicyStore,
    Submitter,
};
use dust_sweeper::models::config::{DiscoveryStrategy, EngineConfig};
use dust_sweeper::models::errors::AppError;
use dust_sweeper::providers::{
    AlchemyPriceSource, AlchemyTokenDiscovery, BundlerClient, DexScreenerPriceSource,
    FallbackPriceSource, PaymasterClient, RemoteSigner, RpcRegistry, StaticTokenList,
    ZeroExQuoteProvider,
};
use dust_sweeper::telemetry::SweepTelemetry;
use dust_sweeper::utils::cache::SweepCache;

use eyre::{Result, WrapErr};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    print_banner();

    let config = EngineConfig::from_env().wrap_err("Failed to load configuration")?;
    if config.chains.is_empty() {
        eyre::bail!("No chain has an RPC endpoint; set ALCHEMY_API_KEY or <CHAIN>_HTTP_URL");
    }

    let registry = Arc::new(RpcRegistry::from_config(&config).wrap_err("Failed to initialize RPC registry")?);
    let limits = registry.limits();
    let cache = SweepCache::new();
    let telemetry = Arc::new(SweepTelemetry::new());

    // Prices: Alchemy first when a key is present, DexScreener always
    let mut price_sources: Vec<Arc<dyn PriceSource>> = Vec::new();
    if let Some(key) = config.alchemy_api_key.clone() {
        price_sources.push(Arc::new(AlchemyPriceSource::new(key, config.timeouts.rpc)?));
    }
    price_sources.push(Arc::new(DexScreenerPriceSource::new(config.timeouts.rpc)?));
    let prices: Arc<dyn PriceSource> = Arc::new(FallbackPriceSource::new(price_sources));

    let mut scanners = HashMap::new();
    for chain_id in registry.chain_ids() {
        let chain = config.chain(chain_id)?.clone();
        let discovery: Option<Arc<dyn TokenDiscovery>> = match &chain.discovery {
            DiscoveryStrategy::Alchemy { url } => Some(Arc::new(AlchemyTokenDiscovery::new(
                chain_id,
                url.clone(),
                config.timeouts.rpc,
            )?)),
            DiscoveryStrategy::Static(tokens) => {
                Some(Arc::new(StaticTokenList::new().with_chain(chain_id, tokens.clone())))
            }
            DiscoveryStrategy::NativeOnly => None,
        };
        let rpc = registry.get(chain_id)?.clone();
        let scanner = EvmChainScanner::new(chain, rpc, discovery, prices.clone());
        scanners.insert(
            chain_id,
            Arc::new(CachedScanner::new(
                Arc::new(scanner),
                cache.clone(),
                limits.clone(),
                config.cache_ttls.clone(),
                config.price_staleness,
            )),
        );
    }

    let aggregator = Arc::new(RouteAggregator::new(
        vec![Arc::new(ZeroExQuoteProvider::new(
            config.zeroex_api_key.clone(),
            config.zeroex_api_url.clone(),
            config.timeouts.quote,
        )?)],
        cache.clone(),
        AggregatorSettings {
            provider_timeout: config.timeouts.quote,
            concurrency: config.workers.quote_concurrency,
            quote_ttl: config.cache_ttls.quote,
            tie_break: config.quote_tie_break,
        },
    ));

    let state: Arc<dyn ChainStateReader> = registry.clone();
    let builder = Arc::new(BatchBuilder::new(
        state.clone(),
        config.gas.clone(),
        config.dust.max_economic_gas_ratio,
        config.estimated_build_time,
    ));

    let paymaster = Arc::new(PaymasterClient::from_config(&config)?);
    let paymasters: HashMap<u64, Arc<dyn Paymaster>> = paymaster
        .chain_ids()
        .into_iter()
        .map(|chain_id| (chain_id, paymaster.clone() as Arc<dyn Paymaster>))
        .collect();
    if paymasters.is_empty() {
        warn!("⚠️ No paymaster configured; sweeps only run where unsponsored fallback is allowed");
    }
    let sponsorship = Arc::new(SponsorshipCoordinator::new(paymasters));
    let policies = Arc::new(StaticPolicyStore::new(config.sponsorship.clone()));

    let signer_url = config
        .signer_url
        .clone()
        .ok_or_else(|| AppError::missing_env("SIGNER_URL"))?;
    let submitter = Arc::new(Submitter::new(
        Arc::new(RemoteSigner::new(signer_url, config.timeouts.bundler)?),
        Arc::new(BundlerClient::from_config(&config)?),
        state.clone(),
        limits.clone(),
        config.retry.clone(),
        config.timeouts.clone(),
    ));

    let deps = EngineDeps {
        scanners,
        aggregator,
        builder,
        sponsorship,
        policies,
        submitter,
        state,
        store: Arc::new(InMemoryJobStore::new()),
        queue: Arc::new(InMemoryQueue::new(
            config.workers.visibility_timeout,
            config.retry.max_deliveries,
        )),
        telemetry: telemetry.clone(),
    };

    let wallets = config.sweep_wallets.clone();
    let scan_interval = config.scan_interval;
    let telemetry_path = config.telemetry_path.clone();
    let chain_ids = registry.chain_ids();
    let orchestrator = Arc::new(JobOrchestrator::new(config, deps));

    let requeued = orchestrator.requeue_active().await?;
    if requeued > 0 {
        info!("🔁 Requeued {} active jobs", requeued);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = orchestrator.spawn_workers(shutdown_rx);
    info!(
        "🚀 {} started: {} workers, {} chains, {} wallets, scan every {}s",
        orchestrator.instance_id(),
        workers.len(),
        chain_ids.len(),
        wallets.len(),
        scan_interval.as_secs()
    );
    if wallets.is_empty() {
        warn!("⚠️ SWEEP_WALLETS is empty; nothing will be scanned");
    }

    let mut ticker = tokio::time::interval(scan_interval.max(Duration::from_secs(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_scan_round(&orchestrator, &wallets, &chain_ids).await;
                let evicted = cache.cleanup_expired();
                if evicted > 0 {
                    info!("🧹 Evicted {} expired cache entries", evicted);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Shutdown signal received, cleaning up...");
                break;
            }
        }
    }

    // Graceful shutdown sequence
    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(e) = tokio::time::timeout(Duration::from_secs(10), worker).await {
            warn!("⚠️ Worker did not stop in time: {}", e);
        }
    }
    registry.shutdown();

    let stats = telemetry.get_stats();
    println!("{}", stats.summary());

    if let Some(dir) = telemetry_path.map(PathBuf::from) {
        match telemetry.export_stats_json(&dir) {
            Ok(path) => info!("   ✅ JSON exported to: {}", path.display()),
            Err(e) => warn!("   ❌ JSON export failed: {}", e),
        }
        match telemetry.export_stats_csv(&dir) {
            Ok(path) => info!("   ✅ CSV exported to: {}", path.display()),
            Err(e) => warn!("   ❌ CSV export failed: {}", e),
        }
    }

    info!("👋 Dust sweeper shutdown complete");
    Ok(())
}

/// One pass over every configured wallet
async fn run_scan_round(orchestrator: &JobOrchestrator, wallets: &[dust_sweeper::WalletAddress], chain_ids: &[u64]) {
    for wallet in wallets {
        let summaries = orchestrator.enqueue_scan(*wallet, chain_ids).await;
        for summary in summaries {
            match (&summary.error, summary.job_id) {
                (Some(e), _) => error!(chain_id = summary.chain_id, wallet = %wallet, "❌ Scan failed: {}", e),
                (None, Some(job_id)) => info!(
                    chain_id = summary.chain_id,
                    wallet = %wallet,
                    job_id = %job_id,
                    "🧹 {} sweepable of {} dust (${:.2})",
                    summary.sweepable,
                    summary.dust,
                    summary.sweepable_usd
                ),
                (None, None) => info!(
                    chain_id = summary.chain_id,
                    wallet = %wallet,
                    "🔍 {} holdings, {} dust, nothing economical to sweep",
                    summary.holdings,
                    summary.dust
                ),
            }
        }
    }
}

fn print_banner() {
    println!(
        r#"
    ╔══════════════════════════════════════════════════════════════╗
    ║                                                              ║
    ║               🧹  D U S T   S W E E P E R  🧹                ║
    ║                                                              ║
    ║        Multi-chain dust detection & sponsored sweeps         ║
    ║                        v{}                                ║
    ║                                                              ║
    ╚══════════════════════════════════════════════════════════════╝
    "#,
        env!("CARGO_PKG_VERSION")
    );
}
