//! Telemetry Module for the sweep engine
//!
//! Counts job outcomes, rebuilds and money moved:
//! - Operator reports ("swept $1.2k of dust across 300 wallets today")
//! - Latency monitoring from enqueue to terminal state
//! - Sponsorship spend tracking
//!
//! Counters only: no wallet addresses or transaction hashes are kept here

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::models::types::JobStatus;

/// Aggregated statistics for reporting
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SweepStats {
    pub jobs_created: u64,
    /// Duplicate enqueues answered with an existing job
    pub jobs_deduplicated: u64,
    pub jobs_confirmed: u64,
    pub jobs_failed: u64,
    pub jobs_expired: u64,
    /// Backward transitions (stale quote / stale nonce)
    pub rebuilds: u64,
    /// Wallet scans performed
    pub scans: u64,
    /// Dust value of confirmed sweeps (USD)
    pub usd_swept: f64,
    /// Gas paid by sponsors (USD)
    pub gas_sponsored_usd: f64,
    /// Sponsorship refusals by reason
    pub denials_by_reason: HashMap<String, u64>,
    /// Average enqueue-to-terminal latency (ms)
    pub avg_latency_ms: f64,
    pub period_start: u64,
    pub period_end: u64,
}

impl SweepStats {
    /// Share of terminal jobs that confirmed
    pub fn success_rate(&self) -> f64 {
        let terminal = self.jobs_confirmed + self.jobs_failed + self.jobs_expired;
        if terminal == 0 {
            0.0
        } else {
            self.jobs_confirmed as f64 / terminal as f64
        }
    }

    /// Operator summary
    pub fn summary(&self) -> String {
        let period_hours = self.period_end.saturating_sub(self.period_start) / 3600;

        format!(
            r#"
╔══════════════════════════════════════════════════════════════════╗
║           🧹 DUST SWEEPER - SWEEP REPORT                         ║
╠══════════════════════════════════════════════════════════════════╣
║   📊 Period: {} hours
║   🔍 Scans:                    {:>10}
║   📥 Jobs Created:             {:>10}
║   ✅ Confirmed:                {:>10}
║   ❌ Failed:                   {:>10}
║   ⌛ Expired:                  {:>10}
║   🎯 Success Rate:             {:>9.1}%
║   🔄 Rebuilds:                 {:>10}
║   💰 Dust Swept:              ${:>10.2}
║   ⛽ Gas Sponsored:           ${:>10.2}
║   ⚡ Avg Job Latency:          {:>10.0}ms
╚══════════════════════════════════════════════════════════════════╝
"#,
            period_hours,
            self.scans,
            self.jobs_created,
            self.jobs_confirmed,
            self.jobs_failed,
            self.jobs_expired,
            self.success_rate() * 100.0,
            self.rebuilds,
            self.usd_swept,
            self.gas_sponsored_usd,
            self.avg_latency_ms,
        )
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Main telemetry collector
pub struct SweepTelemetry {
    jobs_created: AtomicU64,
    jobs_deduplicated: AtomicU64,
    jobs_confirmed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_expired: AtomicU64,
    rebuilds: AtomicU64,
    scans: AtomicU64,
    /// USD amounts kept as micro-dollars so they fit an atomic
    usd_swept_micros: AtomicU64,
    gas_sponsored_micros: AtomicU64,
    total_latency_ms: AtomicU64,
    denials: RwLock<HashMap<String, u64>>,
    session_start: u64,
}

impl SweepTelemetry {
    pub fn new() -> Self {
        Self {
            jobs_created: AtomicU64::new(0),
            jobs_deduplicated: AtomicU64::new(0),
            jobs_confirmed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_expired: AtomicU64::new(0),
            rebuilds: AtomicU64::new(0),
            scans: AtomicU64::new(0),
            usd_swept_micros: AtomicU64::new(0),
            gas_sponsored_micros: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            denials: RwLock::new(HashMap::new()),
            session_start: current_timestamp(),
        }
    }

    pub fn record_created(&self, fresh: bool) {
        if fresh {
            self.jobs_created.fetch_add(1, Ordering::Relaxed);
        } else {
            self.jobs_deduplicated.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_scan(&self) {
        self.scans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebuild(&self) {
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sponsored(&self, gas_usd: f64) {
        self.gas_sponsored_micros
            .fetch_add(to_micros(gas_usd), Ordering::Relaxed);
    }

    pub fn record_denial(&self, reason: &str) {
        if let Ok(mut denials) = self.denials.write() {
            *denials.entry(reason.to_string()).or_insert(0) += 1;
        }
    }

    /// Record a job reaching a terminal state
    pub fn record_terminal(&self, status: JobStatus, usd_swept: f64, latency_ms: u64) {
        let counter = match status {
            JobStatus::Confirmed => {
                self.usd_swept_micros
                    .fetch_add(to_micros(usd_swept), Ordering::Relaxed);
                &self.jobs_confirmed
            }
            JobStatus::Failed => &self.jobs_failed,
            JobStatus::Expired => &self.jobs_expired,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    /// Get current statistics
    pub fn get_stats(&self) -> SweepStats {
        let confirmed = self.jobs_confirmed.load(Ordering::Relaxed);
        let failed = self.jobs_failed.load(Ordering::Relaxed);
        let expired = self.jobs_expired.load(Ordering::Relaxed);
        let terminal = confirmed + failed + expired;

        let avg_latency_ms = if terminal > 0 {
            self.total_latency_ms.load(Ordering::Relaxed) as f64 / terminal as f64
        } else {
            0.0
        };

        SweepStats {
            jobs_created: self.jobs_created.load(Ordering::Relaxed),
            jobs_deduplicated: self.jobs_deduplicated.load(Ordering::Relaxed),
            jobs_confirmed: confirmed,
            jobs_failed: failed,
            jobs_expired: expired,
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
            usd_swept: from_micros(self.usd_swept_micros.load(Ordering::Relaxed)),
            gas_sponsored_usd: from_micros(self.gas_sponsored_micros.load(Ordering::Relaxed)),
            denials_by_reason: self.denials.read().map(|d| d.clone()).unwrap_or_default(),
            avg_latency_ms,
            period_start: self.session_start,
            period_end: current_timestamp(),
        }
    }

    /// Export current stats to a JSON file under `dir`
    pub fn export_stats_json(&self, dir: &Path) -> Result<PathBuf, std::io::Error> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("sweep_stats_{}.json", current_timestamp()));
        fs::write(&path, self.get_stats().to_json())?;
        Ok(path)
    }

    /// Append a CSV row to `dir/sweep_history.csv`
    pub fn export_stats_csv(&self, dir: &Path) -> Result<PathBuf, std::io::Error> {
        fs::create_dir_all(dir)?;
        let stats = self.get_stats();
        let path = dir.join("sweep_history.csv");
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;

        if file.metadata()?.len() == 0 {
            writeln!(
                file,
                "period_start,period_end,jobs_created,confirmed,failed,expired,rebuilds,usd_swept,gas_sponsored_usd"
            )?;
        }
        writeln!(
            file,
            "{},{},{},{},{},{},{},{:.2},{:.2}",
            stats.period_start,
            stats.period_end,
            stats.jobs_created,
            stats.jobs_confirmed,
            stats.jobs_failed,
            stats.jobs_expired,
            stats.rebuilds,
            stats.usd_swept,
            stats.gas_sponsored_usd,
        )?;
        Ok(path)
    }
}

impl Default for SweepTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

// Helper functions

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn to_micros(usd: f64) -> u64 {
    if usd.is_finite() && usd > 0.0 {
        (usd * 1e6).round() as u64
    } else {
        0
    }
}

fn from_micros(micros: u64) -> f64 {
    micros as f64 / 1e6
}
