//! Dust classification
//!
//! Pure function over valued balances and a `DustPolicy`. A balance is dust
//! when its USD value is below the threshold; dust whose sweep would cost
//! more than `max_economic_gas_ratio` of its value is kept in the report but
//! marked uneconomical and never batched. Balances without a fresh price
//! are `Unpriceable`: no value is ever assumed.

use alloy_primitives::Address;
use std::cmp::Ordering;

use crate::models::config::DustPolicy;
use crate::models::types::{ChainBalance, Classification, DustCandidate};

/// Classified balances of one scan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassificationReport {
    /// Dust, ordered by descending USD value then ascending token address
    pub dust: Vec<DustCandidate>,
    pub not_dust: Vec<DustCandidate>,
    pub unpriceable: Vec<DustCandidate>,
}

impl ClassificationReport {
    /// Dust worth sweeping, in batch order
    pub fn sweepable(&self) -> impl Iterator<Item = &DustCandidate> {
        self.dust.iter().filter(|c| c.economical)
    }

    pub fn sweepable_count(&self) -> usize {
        self.sweepable().count()
    }

    pub fn uneconomical(&self) -> impl Iterator<Item = &DustCandidate> {
        self.dust.iter().filter(|c| !c.economical)
    }

    /// Combined USD value of sweepable dust
    pub fn sweepable_usd(&self) -> f64 {
        self.sweepable().map(|c| c.usd_value()).sum()
    }

    /// Sweepable dust excluding the target asset itself
    pub fn sweepable_except(&self, target: Address) -> Vec<DustCandidate> {
        self.sweepable()
            .filter(|c| c.balance.token_address != target)
            .cloned()
            .collect()
    }
}

/// Classify every balance under `policy`.
///
/// `sweep_cost_usd` returns the estimated USD gas cost of moving one
/// balance; it is chain-specific and supplied by the caller.
pub fn classify<F>(balances: &[ChainBalance], policy: &DustPolicy, sweep_cost_usd: F) -> ClassificationReport
where
    F: Fn(&ChainBalance) -> f64,
{
    let mut report = ClassificationReport::default();

    for balance in balances {
        let candidate = classify_one(balance, policy, &sweep_cost_usd);
        match candidate.classification {
            Classification::Dust => report.dust.push(candidate),
            Classification::NotDust => report.not_dust.push(candidate),
            Classification::Unpriceable => report.unpriceable.push(candidate),
        }
    }

    report.dust.sort_by(candidate_order);
    report
}

fn classify_one<F>(balance: &ChainBalance, policy: &DustPolicy, sweep_cost_usd: &F) -> DustCandidate
where
    F: Fn(&ChainBalance) -> f64,
{
    let candidate = |classification, reason: String, cost: f64, economical| DustCandidate {
        balance: balance.clone(),
        classification,
        reason,
        sweep_cost_usd: cost,
        economical,
    };

    if balance.raw_amount < policy.min_raw_amount {
        return candidate(
            Classification::NotDust,
            format!("raw amount {} below minimum {}", balance.raw_amount, policy.min_raw_amount),
            0.0,
            false,
        );
    }

    let usd = match balance.usd_value {
        None => return candidate(Classification::Unpriceable, "no price available".into(), 0.0, false),
        Some(_) if balance.stale => {
            return candidate(Classification::Unpriceable, "price is stale".into(), 0.0, false)
        }
        Some(usd) if !usd.is_finite() || usd < 0.0 => {
            return candidate(Classification::Unpriceable, "price is invalid".into(), 0.0, false)
        }
        Some(usd) => usd,
    };

    if usd >= policy.min_usd_value {
        return candidate(
            Classification::NotDust,
            format!("${:.4} at or above ${:.2} threshold", usd, policy.min_usd_value),
            0.0,
            false,
        );
    }

    let cost = sweep_cost_usd(balance);
    let economical = cost <= usd * policy.max_economic_gas_ratio;
    let reason = if economical {
        format!("${:.6} below threshold, sweep cost ${:.4}", usd, cost)
    } else {
        format!(
            "${:.6} below threshold but sweep cost ${:.4} exceeds {}x value",
            usd, cost, policy.max_economic_gas_ratio
        )
    };
    candidate(Classification::Dust, reason, cost, economical)
}

/// Descending USD value, then ascending token address
pub fn candidate_order(a: &DustCandidate, b: &DustCandidate) -> Ordering {
    b.usd_value()
        .partial_cmp(&a.usd_value())
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.balance.token_address.cmp(&b.balance.token_address))
}
