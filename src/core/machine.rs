//! Job state machine
//!
//! Pure transition logic: `(job, step result) -> Transition`. No I/O and no
//! clock reads beyond what the caller passes in, so every path is testable
//! without a runtime.
//!
//! ```text
//! PENDING -> SCANNING -> QUOTING -> BUILDING -> AUTHORIZING -> SUBMITTED
//!                           ^          |  ^          |            |
//!                           +----------+  +----------+------------+   (rebuild)
//! any non-terminal -> FAILED | EXPIRED ;  SUBMITTED -> CONFIRMED
//! ```

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::models::config::RetryBudget;
use crate::models::errors::{AppError, ErrorClass, ErrorCode};
use crate::models::types::{JobEvent, JobStatus, Receipt, SweepJob};
use crate::utils::backoff::Backoff;

/// What one executed step produced
#[derive(Debug)]
pub enum StepResult {
    /// Step succeeded; move to the next state
    Advance(String),
    /// Terminal receipt from the submitted state
    Receipt(Receipt),
    Error(AppError),
}

/// Decision for the job
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Move { to: JobStatus, note: String },
    /// Stay in the current state and run the step again after `delay`
    Retry { delay: Duration, note: String },
    Terminal { to: JobStatus, reason: String },
}

/// Forward successor of a non-terminal state
pub fn next_state(status: JobStatus) -> Option<JobStatus> {
    match status {
        JobStatus::Pending => Some(JobStatus::Scanning),
        JobStatus::Scanning => Some(JobStatus::Quoting),
        JobStatus::Quoting => Some(JobStatus::Building),
        JobStatus::Building => Some(JobStatus::Authorizing),
        JobStatus::Authorizing => Some(JobStatus::Submitted),
        JobStatus::Submitted => Some(JobStatus::Confirmed),
        JobStatus::Confirmed | JobStatus::Failed | JobStatus::Expired => None,
    }
}

/// Whether `from -> to` is a legal edge
pub fn is_allowed(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    if from.is_terminal() {
        return false;
    }
    if matches!(to, Failed | Expired) {
        return true;
    }
    if next_state(from) == Some(to) {
        return true;
    }
    // Backward rebuild edges
    matches!(
        (from, to),
        (Building, Quoting)
            | (Building, Building)
            | (Authorizing, Building)
            | (Submitted, Building)
            | (Scanning, Pending)
            | (Quoting, Scanning)
            | (Authorizing, Quoting)
    )
}

/// State to re-enter when a rebuild error is raised in `from`
fn rebuild_target(from: JobStatus, code: ErrorCode) -> JobStatus {
    match (code, from) {
        (ErrorCode::QuoteExpired, JobStatus::Building | JobStatus::Authorizing) => JobStatus::Quoting,
        (ErrorCode::NonceStale, JobStatus::Building | JobStatus::Authorizing | JobStatus::Submitted) => {
            JobStatus::Building
        }
        // Lost in-memory artifacts: redo the stage that produces them
        (ErrorCode::ArtifactsMissing, JobStatus::Quoting) => JobStatus::Scanning,
        (ErrorCode::ArtifactsMissing, JobStatus::Building) => JobStatus::Quoting,
        (ErrorCode::ArtifactsMissing, JobStatus::Authorizing) => JobStatus::Building,
        (_, from) => from,
    }
}

fn rebuild_cause(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::QuoteExpired => "quote expired",
        ErrorCode::NonceStale => "nonce changed",
        _ => "artifacts lost",
    }
}

/// Decide the transition for `result` observed in `job.status`
pub fn decide(job: &SweepJob, result: StepResult, budget: &RetryBudget) -> Transition {
    let from = job.status;

    match result {
        StepResult::Advance(note) => match next_state(from) {
            // Confirmation only comes with a receipt
            Some(to) if to != JobStatus::Confirmed => Transition::Move { to, note },
            _ => Transition::Terminal {
                to: JobStatus::Failed,
                reason: format!("no forward transition from {}", from),
            },
        },

        StepResult::Receipt(receipt) => {
            if receipt.success {
                Transition::Move {
                    to: JobStatus::Confirmed,
                    note: format!("confirmed in {}", display_tx(&receipt)),
                }
            } else {
                Transition::Terminal {
                    to: JobStatus::Failed,
                    reason: format!(
                        "reverted: {}",
                        receipt.error.as_deref().unwrap_or("execution reverted")
                    ),
                }
            }
        }

        StepResult::Error(err) => match err.class() {
            ErrorClass::Transient => {
                let attempts = job.attempts + 1;
                if attempts >= budget.max_attempts_per_state {
                    Transition::Terminal {
                        to: JobStatus::Failed,
                        reason: format!("{} after {} attempts", err.message, attempts),
                    }
                } else {
                    let backoff = Backoff::new(budget.backoff_base, budget.backoff_max);
                    Transition::Retry {
                        delay: backoff.delay(job.attempts),
                        note: format!("attempt {} failed: {}", attempts, err),
                    }
                }
            }

            ErrorClass::Rebuild => {
                let rebuilds = job.rebuilds + 1;
                let cause = rebuild_cause(err.code);
                if rebuilds > budget.max_rebuilds {
                    return Transition::Terminal {
                        to: JobStatus::Failed,
                        reason: format!("{} {} times", cause, rebuilds),
                    };
                }
                let to = rebuild_target(from, err.code);
                if to == from && from != JobStatus::Building {
                    return Transition::Terminal {
                        to: JobStatus::Failed,
                        reason: format!("{} in {}: {}", cause, from, err.message),
                    };
                }
                Transition::Move {
                    to,
                    note: format!("{}: {}", cause, err.message),
                }
            }

            ErrorClass::PolicyDenied => match err.code {
                ErrorCode::EmptyBatch => Transition::Terminal {
                    to: JobStatus::Expired,
                    reason: format!("empty batch: {}", err.message),
                },
                ErrorCode::SponsorshipDenied => Transition::Terminal {
                    to: JobStatus::Failed,
                    reason: format!("sponsorship denied: {}", err.message),
                },
                _ => Transition::Terminal {
                    to: JobStatus::Failed,
                    reason: format!("cancelled: {}", err.message),
                },
            },

            ErrorClass::Fatal => Transition::Terminal {
                to: JobStatus::Failed,
                reason: err.to_string(),
            },
        },
    }
}

/// Apply a transition to the job record.
///
/// Returns `InvalidTransition` for an edge the machine does not allow; the
/// job is left untouched in that case.
pub fn apply(job: &mut SweepJob, transition: &Transition, at: DateTime<Utc>) -> Result<(), AppError> {
    let from = job.status;
    match transition {
        Transition::Move { to, note } => {
            if !is_allowed(from, *to) {
                return Err(AppError::new(
                    ErrorCode::InvalidTransition,
                    format!("{} -> {} is not a legal transition", from, to),
                ));
            }
            // Backward edges count as rebuilds
            if is_backward(from, *to) {
                job.rebuilds += 1;
            }
            job.attempts = 0;
            job.status = *to;
            job.history.push(JobEvent {
                at,
                from,
                to: *to,
                note: note.clone(),
            });
        }
        Transition::Retry { note, .. } => {
            if from.is_terminal() {
                return Err(AppError::new(
                    ErrorCode::InvalidTransition,
                    format!("cannot retry terminal job in {}", from),
                ));
            }
            job.attempts += 1;
            job.last_error = Some(note.clone());
        }
        Transition::Terminal { to, reason } => {
            if !is_allowed(from, *to) {
                return Err(AppError::new(
                    ErrorCode::InvalidTransition,
                    format!("{} -> {} is not a legal transition", from, to),
                ));
            }
            job.status = *to;
            job.outcome = Some(reason.clone());
            job.history.push(JobEvent {
                at,
                from,
                to: *to,
                note: reason.clone(),
            });
        }
    }
    job.updated_at = at;
    Ok(())
}

fn is_backward(from: JobStatus, to: JobStatus) -> bool {
    !to.is_terminal() && next_state(from) != Some(to)
}

fn display_tx(receipt: &Receipt) -> String {
    match receipt.tx_hash {
        Some(tx) => format!("{}", tx),
        None => format!("user op {}", receipt.user_op_hash),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::types::WalletAddress;
    use alloy_primitives::{Address, B256, U256};

    fn job(status: JobStatus) -> SweepJob {
        let mut job = SweepJob::new(WalletAddress(Address::repeat_byte(0x42)), 8453, Address::repeat_byte(0xCC));
        job.status = status;
        job
    }

    fn budget() -> RetryBudget {
        RetryBudget {
            max_attempts_per_state: 3,
            max_rebuilds: 2,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(1),
            ..RetryBudget::default()
        }
    }

    fn receipt(success: bool) -> Receipt {
        Receipt {
            tx_hash: Some(B256::repeat_byte(7)),
            user_op_hash: B256::repeat_byte(8),
            success,
            gas_used: U256::ZERO,
            actual_gas_cost: U256::ZERO,
            actual_output_value: None,
            error: (!success).then(|| "STF".to_string()),
        }
    }

    #[test]
    fn test_happy_path_never_skips_a_state() {
        let mut j = job(JobStatus::Pending);
        let now = Utc::now();
        for _ in 0..5 {
            let t = decide(&j, StepResult::Advance("ok".into()), &budget());
            apply(&mut j, &t, now).unwrap();
        }
        assert_eq!(j.status, JobStatus::Submitted);
        let t = decide(&j, StepResult::Receipt(receipt(true)), &budget());
        apply(&mut j, &t, now).unwrap();

        assert_eq!(
            j.status_path(),
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
    }

    #[test]
    fn test_skipping_is_rejected() {
        let mut j = job(JobStatus::Scanning);
        let t = Transition::Move {
            to: JobStatus::Building,
            note: String::new(),
        };
        let err = apply(&mut j, &t, Utc::now()).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTransition);
        assert_eq!(j.status, JobStatus::Scanning);

        assert!(!is_allowed(JobStatus::Confirmed, JobStatus::Failed));
    }

    #[test]
    fn test_transient_retries_then_fails_with_cause() {
        let mut j = job(JobStatus::Scanning);
        let now = Utc::now();
        for _ in 0..2 {
            let t = decide(&j, StepResult::Error(AppError::endpoint_unavailable("node down")), &budget());
            assert!(matches!(t, Transition::Retry { .. }));
            apply(&mut j, &t, now).unwrap();
        }
        assert_eq!(j.attempts, 2);

        let t = decide(&j, StepResult::Error(AppError::endpoint_unavailable("node down")), &budget());
        apply(&mut j, &t, now).unwrap();
        assert_eq!(j.status, JobStatus::Failed);
        assert_eq!(j.outcome.as_deref(), Some("node down after 3 attempts"));
    }

    #[test]
    fn test_quote_expiry_goes_back_to_quoting() {
        let mut j = job(JobStatus::Building);
        j.attempts = 2;
        let t = decide(&j, StepResult::Error(AppError::quote_expired("late")), &budget());
        assert!(matches!(t, Transition::Move { to: JobStatus::Quoting, .. }));
        apply(&mut j, &t, Utc::now()).unwrap();
        assert_eq!(j.rebuilds, 1);
        assert_eq!(j.attempts, 0);
    }

    #[test]
    fn test_nonce_stale_rebuilds_from_submitted() {
        let mut j = job(JobStatus::Submitted);
        let t = decide(&j, StepResult::Error(AppError::nonce_stale(3, 4)), &budget());
        apply(&mut j, &t, Utc::now()).unwrap();
        assert_eq!(j.status, JobStatus::Building);

        // Building -> Building with a fresh nonce is allowed
        let t = decide(&j, StepResult::Error(AppError::nonce_stale(4, 5)), &budget());
        apply(&mut j, &t, Utc::now()).unwrap();
        assert_eq!(j.status, JobStatus::Building);
        assert_eq!(j.rebuilds, 2);
    }

    #[test]
    fn test_rebuild_budget_is_bounded() {
        let mut j = job(JobStatus::Building);
        j.rebuilds = 2;
        let t = decide(&j, StepResult::Error(AppError::quote_expired("late")), &budget());
        apply(&mut j, &t, Utc::now()).unwrap();
        assert_eq!(j.status, JobStatus::Failed);
        assert_eq!(j.outcome.as_deref(), Some("quote expired 3 times"));
    }

    #[test]
    fn test_policy_outcomes() {
        let empty = decide(
            &job(JobStatus::Scanning),
            StepResult::Error(AppError::empty_batch("nothing economical")),
            &budget(),
        );
        assert_eq!(
            empty,
            Transition::Terminal {
                to: JobStatus::Expired,
                reason: "empty batch: nothing economical".into()
            }
        );

        let denied = decide(
            &job(JobStatus::Authorizing),
            StepResult::Error(AppError::sponsorship_denied("daily cap exceeded")),
            &budget(),
        );
        assert_eq!(
            denied,
            Transition::Terminal {
                to: JobStatus::Failed,
                reason: "sponsorship denied: daily cap exceeded".into()
            }
        );
    }

    #[test]
    fn test_fatal_and_revert() {
        let t = decide(
            &job(JobStatus::Pending),
            StepResult::Error(AppError::unsupported_chain(999)),
            &budget(),
        );
        assert!(matches!(t, Transition::Terminal { to: JobStatus::Failed, .. }));

        let t = decide(&job(JobStatus::Submitted), StepResult::Receipt(receipt(false)), &budget());
        assert_eq!(
            t,
            Transition::Terminal {
                to: JobStatus::Failed,
                reason: "reverted: STF".into()
            }
        );
    }
}
