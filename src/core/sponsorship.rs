//! Sponsorship Coordinator Module
//!
//! Cost-control choke point for third-party gas. Every batch passes
//! through `authorize`, which checks the policy in a fixed order
//! (deny list, allow list, per-job cap, daily per-wallet cap) before any
//! paymaster is asked. Every decision, granted or not, is logged with the
//! policy snapshot it was made under and kept in the audit trail.

use alloy_primitives::Address;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::config::SponsorshipPolicy;
use crate::models::errors::{AppResult, ErrorCode};
use crate::models::types::{SponsorshipData, UserOperationBatch};

/// Paymaster service of one chain
#[async_trait]
pub trait Paymaster: Send + Sync {
    /// `SponsorshipDenied` when the service refuses the operation
    async fn sponsor(&self, batch: &UserOperationBatch, policy_id: &str) -> AppResult<SponsorshipData>;
}

/// Source of the sponsorship policy that applies to a wallet
pub trait PolicyStore: Send + Sync {
    fn policy_for(&self, chain_id: u64, wallet: Address) -> SponsorshipPolicy;
}

/// One policy for every wallet, with optional per-chain overrides
#[derive(Debug, Clone, Default)]
pub struct StaticPolicyStore {
    default: SponsorshipPolicy,
    per_chain: HashMap<u64, SponsorshipPolicy>,
}

impl StaticPolicyStore {
    pub fn new(default: SponsorshipPolicy) -> Self {
        Self {
            default,
            per_chain: HashMap::new(),
        }
    }

    pub fn with_chain(mut self, chain_id: u64, policy: SponsorshipPolicy) -> Self {
        self.per_chain.insert(chain_id, policy);
        self
    }
}

impl PolicyStore for StaticPolicyStore {
    fn policy_for(&self, chain_id: u64, _wallet: Address) -> SponsorshipPolicy {
        self.per_chain
            .get(&chain_id)
            .unwrap_or(&self.default)
            .clone()
    }
}

// ============================================
// DECISIONS
// ============================================

/// Why sponsorship was refused
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DenialReason {
    DenyListed,
    NotAllowListed,
    PerJobCapExceeded { estimated_usd: f64, cap_usd: f64 },
    DailyCapExceeded { spent_usd: f64, estimated_usd: f64, cap_usd: f64 },
    NoPaymaster,
    PaymasterRejected(String),
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::DenyListed => f.write_str("wallet is deny-listed"),
            DenialReason::NotAllowListed => f.write_str("wallet not on allow list"),
            DenialReason::PerJobCapExceeded { .. } => f.write_str("per-job cap exceeded"),
            DenialReason::DailyCapExceeded { .. } => f.write_str("daily cap exceeded"),
            DenialReason::NoPaymaster => f.write_str("no paymaster for chain"),
            DenialReason::PaymasterRejected(msg) => write!(f, "paymaster rejected: {}", msg),
        }
    }
}

/// Outcome of `authorize`
#[derive(Debug, Clone, PartialEq)]
pub enum SponsorshipDecision {
    Sponsored(SponsorshipData),
    /// Caller opted into user-paid gas and sponsorship was refused
    Unsponsored(DenialReason),
    Denied(DenialReason),
}

impl SponsorshipDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            SponsorshipDecision::Sponsored(_) => "SPONSORED",
            SponsorshipDecision::Unsponsored(_) => "UNSPONSORED",
            SponsorshipDecision::Denied(_) => "DENIED",
        }
    }
}

/// Audit record of one decision
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub at: DateTime<Utc>,
    pub job_id: Uuid,
    pub chain_id: u64,
    pub wallet: Address,
    pub estimated_gas_usd: f64,
    pub decision: &'static str,
    pub reason: Option<String>,
    /// Policy as it was when the decision was made
    pub policy: serde_json::Value,
}

// ============================================
// SPEND LEDGER
// ============================================

#[derive(Debug, Clone, Copy)]
struct Reservation {
    wallet: Address,
    day: NaiveDate,
    usd: f64,
}

/// Sponsored spend per job; the daily total of a wallet is derived from it
#[derive(Default)]
struct SpendLedger {
    reservations: DashMap<Uuid, Reservation>,
}

impl SpendLedger {
    /// Spend of `wallet` on `day`, excluding `job_id`'s own reservation
    fn spent(&self, wallet: Address, day: NaiveDate, job_id: &Uuid) -> f64 {
        self.reservations
            .iter()
            .filter(|r| r.key() != job_id && r.wallet == wallet && r.day == day)
            .map(|r| r.usd)
            .sum()
    }

    /// Reserve (or replace) the job's spend
    fn reserve(&self, job_id: Uuid, wallet: Address, day: NaiveDate, usd: f64) {
        self.reservations.insert(job_id, Reservation { wallet, day, usd });
    }

    fn release(&self, job_id: &Uuid) -> Option<f64> {
        self.reservations.remove(job_id).map(|(_, r)| r.usd)
    }
}

// ============================================
// COORDINATOR
// ============================================

pub struct SponsorshipCoordinator {
    paymasters: HashMap<u64, Arc<dyn Paymaster>>,
    ledger: SpendLedger,
    audit: Mutex<Vec<AuditRecord>>,
}

impl SponsorshipCoordinator {
    pub fn new(paymasters: HashMap<u64, Arc<dyn Paymaster>>) -> Self {
        Self {
            paymasters,
            ledger: SpendLedger::default(),
            audit: Mutex::new(Vec::new()),
        }
    }

    /// Decide whether the batch's gas is sponsored under `policy`.
    ///
    /// Re-authorizing the same job replaces its reservation, so a rebuilt
    /// batch is not counted twice against the daily cap.
    pub async fn authorize(
        &self,
        job_id: Uuid,
        batch: &UserOperationBatch,
        policy: &SponsorshipPolicy,
    ) -> AppResult<SponsorshipDecision> {
        let wallet = batch.sender;
        let estimated = batch.estimated_gas_usd;
        let today = Utc::now().date_naive();

        let refusal = if policy.deny_list.contains(&wallet) {
            Some(DenialReason::DenyListed)
        } else if !policy.allow_list.is_empty() && !policy.allow_list.contains(&wallet) {
            Some(DenialReason::NotAllowListed)
        } else if estimated > policy.max_gas_usd_per_job {
            Some(DenialReason::PerJobCapExceeded {
                estimated_usd: estimated,
                cap_usd: policy.max_gas_usd_per_job,
            })
        } else {
            let spent = self.ledger.spent(wallet, today, &job_id);
            if spent + estimated > policy.daily_cap_usd_per_wallet {
                Some(DenialReason::DailyCapExceeded {
                    spent_usd: spent,
                    estimated_usd: estimated,
                    cap_usd: policy.daily_cap_usd_per_wallet,
                })
            } else {
                None
            }
        };

        let decision = match refusal {
            Some(reason) => self.refuse(reason, policy),
            None => match self.paymasters.get(&batch.chain_id) {
                None => self.refuse(DenialReason::NoPaymaster, policy),
                Some(paymaster) => match paymaster.sponsor(batch, &policy.policy_id).await {
                    Ok(data) => {
                        self.ledger.reserve(job_id, wallet, today, data.sponsored_gas_usd.max(estimated));
                        SponsorshipDecision::Sponsored(data)
                    }
                    Err(e) if e.code == ErrorCode::SponsorshipDenied => {
                        self.refuse(DenialReason::PaymasterRejected(e.message), policy)
                    }
                    // Paymaster outages are transient, not a decision
                    Err(e) => return Err(e),
                },
            },
        };

        self.record(job_id, batch, policy, &decision);
        Ok(decision)
    }

    fn refuse(&self, reason: DenialReason, policy: &SponsorshipPolicy) -> SponsorshipDecision {
        if policy.allow_unsponsored_fallback {
            SponsorshipDecision::Unsponsored(reason)
        } else {
            SponsorshipDecision::Denied(reason)
        }
    }

    fn record(
        &self,
        job_id: Uuid,
        batch: &UserOperationBatch,
        policy: &SponsorshipPolicy,
        decision: &SponsorshipDecision,
    ) {
        let reason = match decision {
            SponsorshipDecision::Sponsored(_) => None,
            SponsorshipDecision::Unsponsored(r) | SponsorshipDecision::Denied(r) => Some(r.to_string()),
        };
        let record = AuditRecord {
            at: Utc::now(),
            job_id,
            chain_id: batch.chain_id,
            wallet: batch.sender,
            estimated_gas_usd: batch.estimated_gas_usd,
            decision: decision.as_str(),
            reason,
            policy: serde_json::to_value(policy).unwrap_or(serde_json::Value::Null),
        };

        let snapshot = record.policy.to_string();
        match decision {
            SponsorshipDecision::Sponsored(data) => info!(
                job_id = %job_id,
                chain_id = batch.chain_id,
                wallet = %batch.sender,
                gas_usd = format!("{:.4}", data.sponsored_gas_usd),
                policy = %snapshot,
                "⛽ Sponsorship granted"
            ),
            _ => warn!(
                job_id = %job_id,
                chain_id = batch.chain_id,
                wallet = %batch.sender,
                gas_usd = format!("{:.4}", batch.estimated_gas_usd),
                decision = record.decision,
                reason = record.reason.as_deref().unwrap_or_default(),
                policy = %snapshot,
                "🚫 Sponsorship refused"
            ),
        }

        if let Ok(mut audit) = self.audit.lock() {
            audit.push(record);
        }
    }

    /// Give back a job's reserved spend (job failed before broadcasting)
    pub fn release(&self, job_id: &Uuid) {
        if let Some(usd) = self.ledger.release(job_id) {
            info!("↩️ Released ${:.4} of sponsorship for job {}", usd, job_id);
        }
    }

    /// Sponsored spend of a wallet today
    pub fn spent_today(&self, wallet: Address) -> f64 {
        self.ledger.spent(wallet, Utc::now().date_naive(), &Uuid::nil())
    }

    /// Audit trail, oldest first
    pub fn audit_trail(&self) -> Vec<AuditRecord> {
        self.audit.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn audit_for(&self, job_id: &Uuid) -> Vec<AuditRecord> {
        self.audit_trail()
            .into_iter()
            .filter(|r| &r.job_id == job_id)
            .collect()
    }
}

/// Attach sponsorship to a batch; the hash changes with it
pub fn apply_sponsorship(batch: &mut UserOperationBatch, data: SponsorshipData) {
    if let Some(gas) = data.gas_overrides.clone() {
        batch.gas = gas;
    }
    batch.sponsorship = Some(data);
    batch.hash = Some(batch.compute_hash());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::errors::AppError;
    use crate::models::types::GasLimits;
    use alloy_primitives::{Bytes, U256};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WALLET: Address = Address::repeat_byte(0x42);

    struct MockPaymaster {
        calls: AtomicUsize,
        reject: bool,
    }

    #[async_trait]
    impl Paymaster for MockPaymaster {
        async fn sponsor(&self, batch: &UserOperationBatch, policy_id: &str) -> AppResult<SponsorshipData> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reject {
                return Err(AppError::sponsorship_denied("policy rejected sender"));
            }
            Ok(SponsorshipData {
                paymaster_and_data: Bytes::from(vec![0xAA; 20]),
                sponsored_gas_usd: batch.estimated_gas_usd,
                policy_id: policy_id.to_string(),
                gas_overrides: None,
                valid_until: None,
            })
        }
    }

    fn batch(gas_usd: f64) -> UserOperationBatch {
        let mut batch = UserOperationBatch {
            chain_id: 8453,
            entry_point: crate::utils::constants::ENTRY_POINT_V06,
            sender: WALLET,
            nonce: U256::ZERO,
            init_code: Bytes::new(),
            calls: vec![],
            call_data: Bytes::from(vec![1]),
            gas: GasLimits::default(),
            estimated_gas_usd: gas_usd,
            sponsorship: None,
            signature: Bytes::new(),
            hash: None,
            built_at: Utc::now(),
        };
        batch.hash = Some(batch.compute_hash());
        batch
    }

    fn coordinator(reject: bool) -> (Arc<MockPaymaster>, SponsorshipCoordinator) {
        let paymaster = Arc::new(MockPaymaster {
            calls: AtomicUsize::new(0),
            reject,
        });
        let mut paymasters: HashMap<u64, Arc<dyn Paymaster>> = HashMap::new();
        paymasters.insert(8453, paymaster.clone());
        (paymaster, SponsorshipCoordinator::new(paymasters))
    }

    fn policy(daily_cap: f64) -> SponsorshipPolicy {
        SponsorshipPolicy {
            daily_cap_usd_per_wallet: daily_cap,
            ..SponsorshipPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_daily_cap_denies_without_asking_paymaster() {
        let (paymaster, coordinator) = coordinator(false);
        let decision = coordinator
            .authorize(Uuid::new_v4(), &batch(2.5), &policy(2.0))
            .await
            .unwrap();

        match decision {
            SponsorshipDecision::Denied(reason) => assert_eq!(reason.to_string(), "daily cap exceeded"),
            other => panic!("expected denial, got {:?}", other),
        }
        assert_eq!(paymaster.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_daily_cap_accumulates_across_jobs_not_rebuilds() {
        let (_, coordinator) = coordinator(false);
        let job = Uuid::new_v4();

        // Same job authorized twice counts once
        for _ in 0..2 {
            let d = coordinator.authorize(job, &batch(1.5), &policy(2.0)).await.unwrap();
            assert!(matches!(d, SponsorshipDecision::Sponsored(_)));
        }
        assert!((coordinator.spent_today(WALLET) - 1.5).abs() < 1e-9);

        let second = coordinator.authorize(Uuid::new_v4(), &batch(1.0), &policy(2.0)).await.unwrap();
        assert!(matches!(second, SponsorshipDecision::Denied(DenialReason::DailyCapExceeded { .. })));

        coordinator.release(&job);
        assert_eq!(coordinator.spent_today(WALLET), 0.0);
    }

    #[tokio::test]
    async fn test_lists_and_per_job_cap() {
        let (_, coordinator) = coordinator(false);

        let mut deny = policy(100.0);
        deny.deny_list.insert(WALLET);
        let d = coordinator.authorize(Uuid::new_v4(), &batch(0.1), &deny).await.unwrap();
        assert_eq!(d, SponsorshipDecision::Denied(DenialReason::DenyListed));

        let mut allow = policy(100.0);
        allow.allow_list.insert(Address::repeat_byte(0x01));
        let d = coordinator.authorize(Uuid::new_v4(), &batch(0.1), &allow).await.unwrap();
        assert_eq!(d, SponsorshipDecision::Denied(DenialReason::NotAllowListed));

        let d = coordinator.authorize(Uuid::new_v4(), &batch(6.0), &policy(100.0)).await.unwrap();
        assert!(matches!(d, SponsorshipDecision::Denied(DenialReason::PerJobCapExceeded { .. })));
    }

    #[tokio::test]
    async fn test_fallback_only_when_opted_in() {
        let (_, coordinator) = coordinator(true);
        let mut opted_in = policy(100.0);
        opted_in.allow_unsponsored_fallback = true;

        let d = coordinator.authorize(Uuid::new_v4(), &batch(0.1), &opted_in).await.unwrap();
        assert!(matches!(d, SponsorshipDecision::Unsponsored(DenialReason::PaymasterRejected(_))));

        let d = coordinator.authorize(Uuid::new_v4(), &batch(0.1), &policy(100.0)).await.unwrap();
        assert!(matches!(d, SponsorshipDecision::Denied(DenialReason::PaymasterRejected(_))));
    }

    #[tokio::test]
    async fn test_every_decision_is_audited_with_policy() {
        let (_, coordinator) = coordinator(false);
        let job = Uuid::new_v4();
        coordinator.authorize(job, &batch(2.5), &policy(2.0)).await.unwrap();
        coordinator.authorize(Uuid::new_v4(), &batch(0.5), &policy(2.0)).await.unwrap();

        let trail = coordinator.audit_trail();
        assert_eq!(trail.len(), 2);
        let denied = coordinator.audit_for(&job);
        assert_eq!(denied[0].decision, "DENIED");
        assert_eq!(denied[0].reason.as_deref(), Some("daily cap exceeded"));
        assert_eq!(denied[0].policy["daily_cap_usd_per_wallet"], 2.0);
        assert_eq!(trail[1].decision, "SPONSORED");
    }

    #[test]
    fn test_apply_sponsorship_rehashes() {
        let mut b = batch(0.1);
        let before = b.hash;
        apply_sponsorship(
            &mut b,
            SponsorshipData {
                paymaster_and_data: Bytes::from(vec![0xAB; 20]),
                sponsored_gas_usd: 0.1,
                policy_id: "default".into(),
                gas_overrides: Some(GasLimits {
                    call_gas_limit: U256::from(1u64),
                    ..GasLimits::default()
                }),
                valid_until: None,
            },
        );
        assert_ne!(b.hash, before);
        assert_eq!(b.gas.call_gas_limit, U256::from(1u64));
    }
}
