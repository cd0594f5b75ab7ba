//! Job Orchestrator
//!
//! Drives sweep jobs through the state machine. One `advance` call runs the
//! current state's step for one job under its lease, feeds the result to
//! `machine::decide` and persists the transition. Worker pools per lane
//! (scan, quote, submit) pull job ids from the queue and call `advance`;
//! many jobs move in parallel but the steps of one job never overlap. A job
//! whose tickets can no longer be delivered is failed closed.
//!
//! Step artifacts (candidates, quotes, batch) stay in memory keyed by job
//! id; the job record only keeps references to them. A job that lost its
//! artifacts rewinds to the stage that produces them.

use alloy_primitives::Address;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::aggregator::{RouteAggregator, RouteSelection};
use crate::core::batch::{BatchBuilder, BatchRequest, ChainStateReader};
use crate::core::classifier::{classify, ClassificationReport};
use crate::core::machine::{self, StepResult, Transition};
use crate::core::queue::{JobQueue, Lane, Ticket};
use crate::core::scanner::{CachedScanner, ScanReport};
use crate::core::sponsorship::{apply_sponsorship, PolicyStore, SponsorshipCoordinator, SponsorshipDecision};
use crate::core::store::JobStore;
use crate::core::submitter::Submitter;
use crate::models::config::EngineConfig;
use crate::models::errors::{AppError, AppResult, ErrorCode};
use crate::models::types::{
    ChainBalance, DustCandidate, JobStatus, SweepJob, UserOperationBatch, WalletAddress,
};
use crate::telemetry::SweepTelemetry;
use crate::utils::constants::NATIVE_TOKEN;

/// Collaborators injected into the orchestrator
pub struct EngineDeps {
    pub scanners: HashMap<u64, Arc<CachedScanner>>,
    pub aggregator: Arc<RouteAggregator>,
    pub builder: Arc<BatchBuilder>,
    pub sponsorship: Arc<SponsorshipCoordinator>,
    pub policies: Arc<dyn PolicyStore>,
    pub submitter: Arc<Submitter>,
    pub state: Arc<dyn ChainStateReader>,
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobQueue>,
    pub telemetry: Arc<SweepTelemetry>,
}

/// In-memory products of earlier steps
#[derive(Debug, Clone, Default)]
struct JobArtifacts {
    candidates: Vec<DustCandidate>,
    native_price_usd: Option<f64>,
    selection: Option<RouteSelection>,
    batch: Option<UserOperationBatch>,
}

/// Result of one `advance`
#[derive(Debug, Clone)]
pub struct Advanced {
    pub job: SweepJob,
    pub transition: Transition,
}

/// Per-chain outcome of `enqueue_scan`
#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub chain_id: u64,
    pub holdings: usize,
    pub dust: usize,
    pub sweepable: usize,
    pub sweepable_usd: f64,
    pub unpriceable: usize,
    pub job_id: Option<Uuid>,
    pub error: Option<String>,
}

/// Scan and classification of one wallet on one chain
struct Evaluation {
    report: ScanReport,
    classified: ClassificationReport,
    native_price_usd: Option<f64>,
}

/// Clears the in-process running flag of a job
struct RunningGuard<'a> {
    running: &'a DashMap<Uuid, ()>,
    job_id: Uuid,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.job_id);
    }
}

pub struct JobOrchestrator {
    instance_id: String,
    config: EngineConfig,
    deps: EngineDeps,
    artifacts: DashMap<Uuid, JobArtifacts>,
    running: DashMap<Uuid, ()>,
}

impl JobOrchestrator {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Self {
        Self {
            instance_id: format!("orchestrator-{}", Uuid::new_v4()),
            config,
            deps,
            artifacts: DashMap::new(),
            running: DashMap::new(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn telemetry(&self) -> &SweepTelemetry {
        &self.deps.telemetry
    }

    pub fn sponsorship(&self) -> &SponsorshipCoordinator {
        &self.deps.sponsorship
    }

    fn scanner(&self, chain_id: u64) -> AppResult<&Arc<CachedScanner>> {
        self.deps
            .scanners
            .get(&chain_id)
            .ok_or_else(|| AppError::unsupported_chain(chain_id))
    }

    // ============================================
    // PUBLIC OPERATIONS
    // ============================================

    /// Create (or return the active) sweep job for wallet/chain/target.
    ///
    /// An unsupported chain is refused here, before any job or external call.
    pub async fn enqueue_sweep(
        &self,
        wallet: WalletAddress,
        chain_id: u64,
        target_asset: Address,
    ) -> AppResult<SweepJob> {
        self.config.chain(chain_id)?;
        self.scanner(chain_id)?;

        let (job, created) = self
            .deps
            .store
            .create_or_get(
                SweepJob::new(wallet, chain_id, target_asset),
                &self.instance_id,
                self.config.lease_ttl,
            )
            .await?;
        self.deps.telemetry.record_created(created);

        if created {
            self.deps.queue.push(Lane::Scan, job.id, Duration::ZERO).await?;
            info!(
                job_id = %job.id,
                chain_id,
                wallet = %wallet,
                target = %format!("{:#x}", target_asset),
                "📥 Sweep job created"
            );
        } else {
            debug!(job_id = %job.id, "📥 Sweep already active, returning existing job");
        }
        Ok(job)
    }

    /// Scan `wallet` on each chain and enqueue a sweep wherever sweepable
    /// dust exists. One chain failing does not affect the others.
    pub async fn enqueue_scan(&self, wallet: WalletAddress, chains: &[u64]) -> Vec<ScanSummary> {
        join_all(chains.iter().map(|&chain_id| async move {
            match self.scan_and_enqueue(wallet, chain_id).await {
                Ok(summary) => summary,
                Err(e) => {
                    warn!(chain_id, wallet = %wallet, "⚠️ Scan failed: {}", e);
                    ScanSummary {
                        chain_id,
                        holdings: 0,
                        dust: 0,
                        sweepable: 0,
                        sweepable_usd: 0.0,
                        unpriceable: 0,
                        job_id: None,
                        error: Some(e.to_string()),
                    }
                }
            }
        }))
        .await
    }

    pub async fn get_job(&self, id: &Uuid) -> AppResult<SweepJob> {
        self.deps.store.get(id).await
    }

    /// Request cancellation; honored at the job's next state boundary
    pub async fn cancel_job(&self, id: &Uuid) -> AppResult<SweepJob> {
        self.deps.store.request_cancel(id).await?;
        let job = self.deps.store.get(id).await?;
        info!(job_id = %id, status = %job.status, "🛑 Cancellation requested");
        Ok(job)
    }

    /// Push every active job back on its lane (startup recovery)
    pub async fn requeue_active(&self) -> AppResult<usize> {
        let mut requeued = 0;
        for status in [
            JobStatus::Pending,
            JobStatus::Scanning,
            JobStatus::Quoting,
            JobStatus::Building,
            JobStatus::Authorizing,
            JobStatus::Submitted,
        ] {
            let Some(lane) = Lane::for_status(status) else { continue };
            for job in self.deps.store.list_by_status(status).await? {
                if !self.running.contains_key(&job.id) {
                    self.deps.queue.push(lane, job.id, Duration::ZERO).await?;
                    requeued += 1;
                }
            }
        }
        Ok(requeued)
    }

    // ============================================
    // STATE MACHINE DRIVER
    // ============================================

    /// Run the current step of one job and persist its transition
    pub async fn advance(&self, job_id: Uuid) -> AppResult<Advanced> {
        if self.running.insert(job_id, ()).is_some() {
            return Err(AppError::new(
                ErrorCode::LeaseConflict,
                format!("job {} is already running on this instance", job_id),
            ));
        }
        let _guard = RunningGuard {
            running: &self.running,
            job_id,
        };

        self.deps
            .store
            .acquire_lease(&job_id, &self.instance_id, self.config.lease_ttl)
            .await?;
        let mut job = self.deps.store.get(&job_id).await?;
        if job.is_terminal() {
            let transition = Transition::Terminal {
                to: job.status,
                reason: job.outcome.clone().unwrap_or_default(),
            };
            return Ok(Advanced { job, transition });
        }

        let from = job.status;
        let rebuilds_before = job.rebuilds;

        // A broadcast operation is followed to its receipt first
        let result = if from != JobStatus::Submitted && self.deps.store.is_cancel_requested(&job_id).await {
            StepResult::Error(AppError::new(ErrorCode::JobCancelled, "cancellation requested"))
        } else {
            match self.run_step(&mut job).await {
                Ok(result) => result,
                Err(e) => StepResult::Error(e),
            }
        };

        if let StepResult::Error(e) = &result {
            debug!(job_id = %job_id, state = %from, code = e.code_str(), "Step failed: {}", e.message);
        }

        let mut transition = machine::decide(&job, result, &self.config.retry);
        let now = Utc::now();
        if let Err(e) = machine::apply(&mut job, &transition, now) {
            error!(job_id = %job_id, "❌ {}", e);
            transition = Transition::Terminal {
                to: JobStatus::Failed,
                reason: e.to_string(),
            };
            machine::apply(&mut job, &transition, now)?;
        }

        if job.rebuilds > rebuilds_before {
            self.deps.telemetry.record_rebuild();
        }
        self.commit(&job, from, &transition).await?;

        Ok(Advanced { job, transition })
    }

    /// Fail a job that can no longer be delivered to a worker.
    ///
    /// Returns false when the job was already terminal or is running here.
    pub async fn fail_closed(&self, job_id: Uuid, cause: &str) -> AppResult<bool> {
        if self.running.insert(job_id, ()).is_some() {
            return Ok(false);
        }
        let _guard = RunningGuard {
            running: &self.running,
            job_id,
        };

        self.deps
            .store
            .acquire_lease(&job_id, &self.instance_id, self.config.lease_ttl)
            .await?;
        let mut job = self.deps.store.get(&job_id).await?;
        if job.is_terminal() {
            return Ok(false);
        }

        let from = job.status;
        let reason = match &job.last_error {
            Some(last) => format!("{} (last error: {})", cause, last),
            None => cause.to_string(),
        };
        let transition = Transition::Terminal {
            to: JobStatus::Failed,
            reason,
        };
        machine::apply(&mut job, &transition, Utc::now())?;
        self.commit(&job, from, &transition).await?;
        Ok(true)
    }

    /// Fail the jobs of every dead-lettered ticket
    pub async fn reap_dead_letters(&self) -> AppResult<usize> {
        let mut failed = 0;
        for ticket in self.deps.queue.drain_dead_letters().await {
            let cause = format!(
                "undeliverable on {} lane after {} deliveries",
                ticket.lane.as_str(),
                ticket.deliveries.saturating_sub(1)
            );
            match self.fail_closed(ticket.job_id, &cause).await {
                Ok(true) => failed += 1,
                Ok(false) => {}
                Err(e) if e.code == ErrorCode::JobNotFound => {}
                Err(e) => {
                    warn!(job_id = %ticket.job_id, "⚠️ Could not fail dead-lettered job: {}", e);
                }
            }
        }
        Ok(failed)
    }

    /// Advance a job until it is terminal, honoring retry delays
    pub async fn run_to_completion(&self, job_id: Uuid) -> AppResult<SweepJob> {
        loop {
            let advanced = self.advance(job_id).await?;
            if advanced.job.is_terminal() {
                return Ok(advanced.job);
            }
            if let Transition::Retry { delay, .. } = advanced.transition {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Start the per-lane worker pools. Workers exit when `shutdown` flips.
    pub fn spawn_workers(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let pools = [
            (Lane::Scan, self.config.workers.scan_workers),
            (Lane::Quote, self.config.workers.quote_workers),
            (Lane::Submit, self.config.workers.submit_workers),
        ];

        let mut handles = Vec::new();
        for (lane, count) in pools {
            for worker in 0..count.max(1) {
                let orchestrator = Arc::clone(self);
                let mut shutdown = shutdown.clone();
                handles.push(tokio::spawn(async move {
                    debug!("👷 {} worker {} started", lane.as_str(), worker);
                    while let Some(ticket) = orchestrator.deps.queue.recv(lane, &mut shutdown).await {
                        orchestrator.handle_ticket(&ticket).await;
                    }
                    debug!("👷 {} worker {} stopped", lane.as_str(), worker);
                }));
            }
        }

        // Dead-letter reaper
        let orchestrator = Arc::clone(self);
        let mut shutdown = shutdown;
        let period = self.config.workers.visibility_timeout.max(Duration::from_secs(1));
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                if *shutdown.borrow() {
                    break;
                }
                match orchestrator.reap_dead_letters().await {
                    Ok(0) => {}
                    Ok(n) => warn!("☠️ Failed {} dead-lettered jobs", n),
                    Err(e) => error!("❌ Dead-letter sweep failed: {}", e),
                }
            }
        }));

        info!("🚀 Started {} workers", handles.len());
        handles
    }

    async fn handle_ticket(&self, ticket: &Ticket) {
        let queue = &self.deps.queue;
        match self.advance(ticket.job_id).await {
            Ok(advanced) => {
                if let Some(lane) = Lane::for_status(advanced.job.status) {
                    let delay = match advanced.transition {
                        Transition::Retry { delay, .. } => delay,
                        _ => Duration::ZERO,
                    };
                    if let Err(e) = queue.push(lane, ticket.job_id, delay).await {
                        error!(job_id = %ticket.job_id, "❌ Requeue failed: {}", e);
                        let _ = queue.nack(ticket, delay).await;
                        return;
                    }
                }
                let _ = queue.ack(ticket).await;
            }
            // Another worker owns the job and will requeue it
            Err(e) if e.code == ErrorCode::LeaseConflict || e.code == ErrorCode::JobNotFound => {
                debug!(job_id = %ticket.job_id, "Dropping ticket: {}", e);
                let _ = queue.ack(ticket).await;
            }
            Err(e) if ticket.deliveries >= self.config.retry.max_deliveries => {
                let cause = format!("{} after {} deliveries", e, ticket.deliveries);
                match self.fail_closed(ticket.job_id, &cause).await {
                    Ok(_) => {
                        let _ = queue.ack(ticket).await;
                    }
                    Err(fail) => {
                        error!(job_id = %ticket.job_id, "❌ Could not fail job: {}", fail);
                        let _ = queue.nack(ticket, self.config.retry.backoff_base).await;
                    }
                }
            }
            Err(e) => {
                warn!(job_id = %ticket.job_id, "⚠️ Advance failed, redelivering: {}", e);
                let _ = queue.nack(ticket, self.config.retry.backoff_base).await;
            }
        }
    }

    // ============================================
    // STEPS
    // ============================================

    async fn run_step(&self, job: &mut SweepJob) -> AppResult<StepResult> {
        match job.status {
            JobStatus::Pending => self.step_validate(job),
            JobStatus::Scanning => self.step_scan(job).await,
            JobStatus::Quoting => self.step_quote(job).await,
            JobStatus::Building => self.step_build(job).await,
            JobStatus::Authorizing => self.step_authorize(job).await,
            JobStatus::Submitted => self.step_poll(job).await,
            status => Err(AppError::new(
                ErrorCode::InvalidTransition,
                format!("no step for terminal state {}", status),
            )),
        }
    }

    fn step_validate(&self, job: &SweepJob) -> AppResult<StepResult> {
        let chain = self.config.chain(job.chain_id)?;
        self.scanner(job.chain_id)?;
        if job.wallet.address() == Address::ZERO {
            return Err(AppError::invalid_wallet("zero address cannot own a sweep"));
        }
        Ok(StepResult::Advance(format!("validated on {}", chain.name)))
    }

    async fn step_scan(&self, job: &mut SweepJob) -> AppResult<StepResult> {
        let evaluation = self.evaluate(job.wallet, job.chain_id).await?;
        let candidates = evaluation.classified.sweepable_except(job.target_asset);
        job.scan_ref = Some(evaluation.report.scan_ref());

        if candidates.is_empty() {
            return Err(AppError::empty_batch(format!(
                "no economical dust ({} dust below sweep cost, {} unpriceable, {} not dust)",
                evaluation.classified.uneconomical().count(),
                evaluation.classified.unpriceable.len(),
                evaluation.classified.not_dust.len(),
            )));
        }

        let total: f64 = candidates.iter().map(|c| c.usd_value()).sum();
        let note = format!("{} candidates worth ${:.4}", candidates.len(), total);
        self.artifacts.insert(
            job.id,
            JobArtifacts {
                candidates,
                native_price_usd: evaluation.native_price_usd,
                ..JobArtifacts::default()
            },
        );
        Ok(StepResult::Advance(note))
    }

    async fn step_quote(&self, job: &mut SweepJob) -> AppResult<StepResult> {
        let candidates = self
            .artifacts
            .get(&job.id)
            .map(|a| a.candidates.clone())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AppError::new(ErrorCode::ArtifactsMissing, "scan results are gone"))?;

        let selection = self
            .deps
            .aggregator
            .quote_all(
                job.chain_id,
                job.wallet.address(),
                job.target_asset,
                &candidates,
                job.rebuilds > 0,
            )
            .await;

        if selection.is_empty() {
            let reasons: Vec<String> = selection.dropped.iter().map(|d| d.reason.clone()).collect();
            return Err(AppError::empty_batch(format!("no route for any candidate: {}", reasons.join("; "))));
        }

        job.quote_ids = selection.route_ids();
        let note = format!(
            "{} routes selected, {} dropped",
            selection.selected.len(),
            selection.dropped.len()
        );
        if let Some(mut artifacts) = self.artifacts.get_mut(&job.id) {
            artifacts.selection = Some(selection);
            artifacts.batch = None;
        }
        Ok(StepResult::Advance(note))
    }

    async fn step_build(&self, job: &mut SweepJob) -> AppResult<StepResult> {
        let (selection, native_price) = self
            .artifacts
            .get(&job.id)
            .and_then(|a| a.selection.clone().map(|s| (s, a.native_price_usd)))
            .ok_or_else(|| AppError::new(ErrorCode::ArtifactsMissing, "quotes are gone"))?;
        let native_price = native_price
            .ok_or_else(|| AppError::price_unavailable("no native price to estimate gas"))?;

        let chain = self.config.chain(job.chain_id)?;
        let batch = self
            .deps
            .builder
            .build(BatchRequest {
                job_id: job.id,
                chain,
                wallet: job.wallet.address(),
                target_asset: job.target_asset,
                recipient: job.wallet.address(),
                selections: &selection.selected,
                native_price_usd: native_price,
            })
            .await?;

        job.batch_hash = batch.hash;
        let note = format!(
            "{} calls at nonce {}, gas ${:.4}",
            batch.calls.len(),
            batch.nonce,
            batch.estimated_gas_usd
        );
        if let Some(mut artifacts) = self.artifacts.get_mut(&job.id) {
            artifacts.batch = Some(batch);
        }
        Ok(StepResult::Advance(note))
    }

    async fn step_authorize(&self, job: &mut SweepJob) -> AppResult<StepResult> {
        let mut batch = self
            .artifacts
            .get(&job.id)
            .and_then(|a| a.batch.clone())
            .ok_or_else(|| AppError::new(ErrorCode::ArtifactsMissing, "batch is gone"))?;

        let policy = self.deps.policies.policy_for(job.chain_id, job.wallet.address());
        match self.deps.sponsorship.authorize(job.id, &batch, &policy).await? {
            SponsorshipDecision::Sponsored(data) => {
                self.deps.telemetry.record_sponsored(data.sponsored_gas_usd);
                job.sponsorship_ref = Some(data.policy_id.clone());
                apply_sponsorship(&mut batch, data);
            }
            SponsorshipDecision::Unsponsored(reason) => {
                job.sponsorship_ref = Some(format!("unsponsored: {}", reason));
            }
            SponsorshipDecision::Denied(reason) => {
                self.deps.telemetry.record_denial(&reason.to_string());
                job.sponsorship_ref = Some(format!("denied: {}", reason));
                return Err(AppError::sponsorship_denied(reason.to_string()));
            }
        }

        let user_op_hash = self.deps.submitter.sign_and_send(&mut batch).await?;
        job.batch_hash = Some(user_op_hash);
        let note = format!("user operation {} at nonce {}", user_op_hash, batch.nonce);
        if let Some(mut artifacts) = self.artifacts.get_mut(&job.id) {
            artifacts.batch = Some(batch);
        }
        Ok(StepResult::Advance(note))
    }

    async fn step_poll(&self, job: &mut SweepJob) -> AppResult<StepResult> {
        let user_op_hash = job
            .batch_hash
            .ok_or_else(|| AppError::new(ErrorCode::ArtifactsMissing, "submitted job has no operation hash"))?;
        let batch_nonce = self
            .artifacts
            .get(&job.id)
            .and_then(|a| a.batch.as_ref().map(|b| b.nonce));

        let submitted_at = job
            .history
            .iter()
            .rev()
            .find(|e| e.to == JobStatus::Submitted)
            .map(|e| e.at)
            .unwrap_or_else(Utc::now);
        let deadline = submitted_at
            + ChronoDuration::milliseconds(self.config.timeouts.submission.as_millis() as i64);

        let receipt = self
            .deps
            .submitter
            .poll_receipt(
                job.chain_id,
                job.wallet.address(),
                batch_nonce,
                user_op_hash,
                job.target_asset,
                job.wallet.address(),
                deadline,
            )
            .await?;
        job.receipt = Some(receipt.clone());
        Ok(StepResult::Receipt(receipt))
    }

    // ============================================
    // HELPERS
    // ============================================

    /// Scan, price and classify one wallet on one chain
    async fn evaluate(&self, wallet: WalletAddress, chain_id: u64) -> AppResult<Evaluation> {
        let scanner = self.scanner(chain_id)?;
        let report = scanner.scan(&wallet).await?;
        self.deps.telemetry.record_scan();

        let native_price_usd = match scanner.price_of(NATIVE_TOKEN).await {
            Ok(price) if price.age(Utc::now()).num_milliseconds() <= self.config.price_staleness.as_millis() as i64 => {
                Some(price.usd)
            }
            Ok(_) => {
                warn!(chain_id, "⏳ Native price is stale; sweep cost unknown");
                None
            }
            Err(e) if e.code == ErrorCode::PriceUnavailable => {
                warn!(chain_id, "💸 No native price ({}); sweep cost unknown", e);
                None
            }
            Err(e) => return Err(e),
        };
        let gas_price = self.deps.state.gas_price(chain_id).await?;

        let builder = &self.deps.builder;
        // Unknown cost is never economical
        let cost = |balance: &ChainBalance| match native_price_usd {
            Some(native) => builder.marginal_cost_usd(!balance.is_native(), gas_price, native),
            None => f64::INFINITY,
        };
        let classified = classify(&report.balances, &self.config.dust, cost);

        Ok(Evaluation {
            report,
            classified,
            native_price_usd,
        })
    }

    async fn scan_and_enqueue(&self, wallet: WalletAddress, chain_id: u64) -> AppResult<ScanSummary> {
        let chain = self.config.chain(chain_id)?;
        let evaluation = self.evaluate(wallet, chain_id).await?;
        let classified = &evaluation.classified;

        let mut summary = ScanSummary {
            chain_id,
            holdings: evaluation.report.balances.len(),
            dust: classified.dust.len(),
            sweepable: classified.sweepable_count(),
            sweepable_usd: classified.sweepable_usd(),
            unpriceable: classified.unpriceable.len(),
            job_id: None,
            error: None,
        };

        let target = match chain.default_target {
            Some(target) => target,
            None => {
                summary.error = Some(format!("no default target asset on {}", chain.name));
                return Ok(summary);
            }
        };

        if !classified.sweepable_except(target).is_empty() {
            let job = self.enqueue_sweep(wallet, chain_id, target).await?;
            summary.job_id = Some(job.id);
        }

        info!(
            chain_id,
            wallet = %wallet,
            dust = summary.dust,
            sweepable = summary.sweepable,
            usd = format!("{:.4}", summary.sweepable_usd),
            "🧹 Scan evaluated"
        );
        Ok(summary)
    }

    /// Log and persist a transition, releasing resources on terminal ones
    async fn commit(&self, job: &SweepJob, from: JobStatus, transition: &Transition) -> AppResult<()> {
        self.log_transition(job, from, transition);

        let finished_usd = if job.is_terminal() {
            self.finish(job, from)
        } else {
            0.0
        };
        self.deps.store.update(job, &self.instance_id).await?;

        if job.is_terminal() {
            let latency = (job.updated_at - job.created_at).num_milliseconds().max(0) as u64;
            self.deps.telemetry.record_terminal(job.status, finished_usd, latency);
        }
        Ok(())
    }

    /// Release per-job resources. Returns the USD value swept.
    fn finish(&self, job: &SweepJob, from: JobStatus) -> f64 {
        let artifacts = self.artifacts.remove(&job.id).map(|(_, a)| a);
        let batched = self.deps.builder.batched_tokens(&job.id).unwrap_or_default();
        self.deps.builder.discard(&job.id);

        // Nothing was broadcast; the reserved sponsorship was never spent
        if job.status != JobStatus::Confirmed && from != JobStatus::Submitted {
            self.deps.sponsorship.release(&job.id);
        }

        if job.status != JobStatus::Confirmed {
            return 0.0;
        }
        if let Ok(scanner) = self.scanner(job.chain_id) {
            scanner.invalidate_holdings(&job.wallet);
        }
        // Only candidates that made it into the broadcast batch
        artifacts
            .and_then(|a| a.selection)
            .map(|s| {
                s.selected
                    .iter()
                    .filter(|(c, _)| batched.contains(&c.balance.token_address))
                    .map(|(c, _)| c.usd_value())
                    .sum()
            })
            .unwrap_or(0.0)
    }

    fn log_transition(&self, job: &SweepJob, from: JobStatus, transition: &Transition) {
        match transition {
            Transition::Move { to, note } if *to == JobStatus::Confirmed => info!(
                job_id = %job.id,
                chain_id = job.chain_id,
                "✅ {} -> {}: {}",
                from,
                to,
                note
            ),
            Transition::Move { to, note } => info!(
                job_id = %job.id,
                chain_id = job.chain_id,
                "➡️ {} -> {}: {}",
                from,
                to,
                note
            ),
            Transition::Retry { delay, note } => warn!(
                job_id = %job.id,
                chain_id = job.chain_id,
                attempts = job.attempts,
                "🔁 {} retry in {}ms: {}",
                from,
                delay.as_millis(),
                note
            ),
            Transition::Terminal { to, reason } => warn!(
                job_id = %job.id,
                chain_id = job.chain_id,
                "⛔ {} -> {}: {}",
                from,
                to,
                reason
            ),
        }
    }
}
