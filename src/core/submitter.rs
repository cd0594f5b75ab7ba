//! Submitter Module
//!
//! Signs a batch through an external signer, hands it to a bundler and
//! polls for a terminal receipt. Submission-layer failures resend the same
//! signed operation; nothing is re-signed here. The on-chain nonce is
//! re-read right before signing and while polling: a moved nonce sends the
//! job back to the batch builder instead of resubmitting.

use alloy_primitives::{b256, Address, Bytes, B256, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::batch::ChainStateReader;
use crate::models::config::{RetryBudget, Timeouts};
use crate::models::errors::{AppError, AppResult, ErrorCode};
use crate::models::types::{Receipt, UserOperationBatch};
use crate::providers::registry::ChainLimits;
use crate::utils::backoff::Backoff;

/// Extra receipt lookups once the nonce has moved past ours
const RECEIPT_GRACE_POLLS: u32 = 3;

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

/// Signature contract; key material lives outside the engine
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, chain_id: u64, sender: Address, user_op_hash: B256) -> AppResult<Bytes>;
}

/// Raw log of a receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

/// Bundler view of an included user operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserOpReceipt {
    pub success: bool,
    pub tx_hash: Option<B256>,
    pub gas_used: U256,
    pub actual_gas_cost: U256,
    pub reason: Option<String>,
    pub logs: Vec<LogEntry>,
}

/// ERC-4337 bundler / relay
#[async_trait]
pub trait Bundler: Send + Sync {
    /// Returns the user operation hash the bundler accepted
    async fn send_user_operation(&self, batch: &UserOperationBatch) -> AppResult<B256>;

    /// `None` while the operation is not yet included
    async fn user_operation_receipt(&self, chain_id: u64, user_op_hash: B256) -> AppResult<Option<UserOpReceipt>>;
}

pub struct Submitter {
    signer: Arc<dyn Signer>,
    bundler: Arc<dyn Bundler>,
    state: Arc<dyn ChainStateReader>,
    limits: ChainLimits,
    retry: RetryBudget,
    timeouts: Timeouts,
}

impl Submitter {
    pub fn new(
        signer: Arc<dyn Signer>,
        bundler: Arc<dyn Bundler>,
        state: Arc<dyn ChainStateReader>,
        limits: ChainLimits,
        retry: RetryBudget,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            signer,
            bundler,
            state,
            limits,
            retry,
            timeouts,
        }
    }

    /// Sign `batch` and submit it. Returns the user operation hash.
    pub async fn sign_and_send(&self, batch: &mut UserOperationBatch) -> AppResult<B256> {
        let chain_id = batch.chain_id;

        // The signed nonce must be the one on chain right now
        let on_chain = self.state.account_nonce(chain_id, batch.sender).await?;
        if on_chain != batch.nonce {
            warn!(
                chain_id,
                sender = %batch.sender,
                "🔢 Nonce moved before signing: batch {}, chain {}",
                batch.nonce,
                on_chain
            );
            return Err(AppError::nonce_stale(batch.nonce, on_chain));
        }

        let hash = batch.compute_hash();
        batch.hash = Some(hash);
        batch.signature = tokio::time::timeout(
            self.timeouts.bundler,
            self.signer.sign(chain_id, batch.sender, hash),
        )
        .await
        .map_err(|_| AppError::endpoint_unavailable("Signer did not answer in time"))??;

        let backoff = Backoff::new(self.retry.backoff_base, self.retry.backoff_max);
        let max_attempts = self.retry.max_submission_retries.max(1);
        let mut last_error = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff.delay(attempt - 1)).await;
            }

            let sent = {
                let _permit = self.limits.acquire(chain_id).await?;
                tokio::time::timeout(self.timeouts.bundler, self.bundler.send_user_operation(batch)).await
            };

            match sent {
                Ok(Ok(accepted)) => {
                    if accepted != hash {
                        warn!("⚠️ Bundler returned {} for locally computed {}", accepted, hash);
                    }
                    info!(
                        chain_id,
                        sender = %batch.sender,
                        nonce = %batch.nonce,
                        user_op_hash = %accepted,
                        "📤 User operation submitted"
                    );
                    return Ok(accepted);
                }
                Ok(Err(e)) if !e.code.is_retryable() => return Err(e),
                Ok(Err(e)) => {
                    debug!("📤 Submission attempt {}/{} failed: {}", attempt + 1, max_attempts, e);
                    last_error = Some(e.to_string());
                }
                Err(_) => {
                    debug!("📤 Submission attempt {}/{} timed out", attempt + 1, max_attempts);
                    last_error = Some("bundler timeout".to_string());
                }
            }
        }

        Err(AppError::submission_failed(format!(
            "bundler unreachable after {} attempts: {}",
            max_attempts,
            last_error.unwrap_or_default()
        )))
    }

    /// Poll for the terminal receipt of a submitted operation.
    ///
    /// `batch_nonce` is the nonce the operation was signed with; if the
    /// chain moves past it and our receipt still does not show up after a
    /// short grace window, the operation was replaced and the job must
    /// rebuild.
    #[allow(clippy::too_many_arguments)]
    pub async fn poll_receipt(
        &self,
        chain_id: u64,
        sender: Address,
        batch_nonce: Option<U256>,
        user_op_hash: B256,
        target_asset: Address,
        recipient: Address,
        deadline: DateTime<Utc>,
    ) -> AppResult<Receipt> {
        let backoff = Backoff::new(self.timeouts.receipt_poll_base, self.timeouts.receipt_poll_max);
        let mut attempt = 0u32;

        loop {
            let polled = {
                let _permit = self.limits.acquire(chain_id).await?;
                tokio::time::timeout(
                    self.timeouts.bundler,
                    self.bundler.user_operation_receipt(chain_id, user_op_hash),
                )
                .await
            };

            match polled {
                Ok(Ok(Some(receipt))) => {
                    info!(
                        chain_id,
                        user_op_hash = %user_op_hash,
                        success = receipt.success,
                        "🧾 Receipt received"
                    );
                    return Ok(to_receipt(receipt, user_op_hash, target_asset, recipient));
                }
                Ok(Ok(None)) => {
                    if let Some(expected) = batch_nonce {
                        let on_chain = self.state.account_nonce(chain_id, sender).await?;
                        if on_chain > expected {
                            // Our own inclusion moves the nonce too; the receipt index may lag
                            if let Some(receipt) = self.grace_receipt(chain_id, user_op_hash).await? {
                                info!(
                                    chain_id,
                                    user_op_hash = %user_op_hash,
                                    success = receipt.success,
                                    "🧾 Receipt received after nonce moved"
                                );
                                return Ok(to_receipt(receipt, user_op_hash, target_asset, recipient));
                            }
                            warn!(
                                chain_id,
                                user_op_hash = %user_op_hash,
                                "🔢 Nonce {} consumed by another operation (chain at {})",
                                expected,
                                on_chain
                            );
                            return Err(AppError::nonce_stale(expected, on_chain));
                        }
                    }
                }
                Ok(Err(e)) if !e.code.is_retryable() => return Err(e),
                Ok(Err(e)) => debug!("🧾 Receipt poll failed: {}", e),
                Err(_) => debug!("🧾 Receipt poll timed out"),
            }

            let delay = backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            let now = Utc::now();
            if now >= deadline {
                return Err(AppError::new(
                    ErrorCode::SubmissionTimeout,
                    format!("no receipt for {} before {}", user_op_hash, deadline.format("%H:%M:%S")),
                ));
            }
            let remaining = (deadline - now).to_std().unwrap_or_default();
            tokio::time::sleep(delay.min(remaining)).await;
        }
    }

    /// A few spaced receipt lookups before calling the nonce replaced
    async fn grace_receipt(&self, chain_id: u64, user_op_hash: B256) -> AppResult<Option<UserOpReceipt>> {
        for _ in 0..RECEIPT_GRACE_POLLS {
            tokio::time::sleep(self.timeouts.receipt_poll_base).await;
            let polled = {
                let _permit = self.limits.acquire(chain_id).await?;
                tokio::time::timeout(
                    self.timeouts.bundler,
                    self.bundler.user_operation_receipt(chain_id, user_op_hash),
                )
                .await
            };
            match polled {
                Ok(Ok(Some(receipt))) => return Ok(Some(receipt)),
                Ok(Err(e)) if !e.code.is_retryable() => return Err(e),
                _ => {}
            }
        }
        Ok(None)
    }
}

fn to_receipt(receipt: UserOpReceipt, user_op_hash: B256, target_asset: Address, recipient: Address) -> Receipt {
    let output = output_value(&receipt.logs, target_asset, recipient);
    Receipt {
        tx_hash: receipt.tx_hash,
        user_op_hash,
        success: receipt.success,
        gas_used: receipt.gas_used,
        actual_gas_cost: receipt.actual_gas_cost,
        actual_output_value: receipt.success.then_some(output),
        error: if receipt.success {
            None
        } else {
            Some(receipt.reason.unwrap_or_else(|| "execution reverted".to_string()))
        },
    }
}

/// Target-asset value delivered to `recipient`, from ERC-20 Transfer logs
pub fn output_value(logs: &[LogEntry], target_asset: Address, recipient: Address) -> U256 {
    let recipient_topic = B256::left_padding_from(recipient.as_slice());
    logs.iter()
        .filter(|log| {
            log.address == target_asset
                && log.topics.len() == 3
                && log.topics[0] == TRANSFER_TOPIC
                && log.topics[2] == recipient_topic
        })
        .fold(U256::ZERO, |acc, log| {
            acc.saturating_add(U256::try_from_be_slice(&log.data).unwrap_or_default())
        })
}
