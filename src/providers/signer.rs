//! Remote signer client
//!
//! Key material never enters the engine. The signer service receives the
//! user operation hash and returns the account's signature over it.

use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::rpc::build_http_client;
use crate::core::submitter::Signer;
use crate::models::errors::{AppError, AppResult, ErrorCode};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignRequest {
    chain_id: u64,
    sender: Address,
    hash: B256,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    signature: Option<Bytes>,
    error: Option<String>,
}

pub struct RemoteSigner {
    client: reqwest::Client,
    url: String,
}

impl RemoteSigner {
    pub fn new(url: String, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            client: build_http_client(timeout)?,
            url,
        })
    }
}

#[async_trait]
impl Signer for RemoteSigner {
    async fn sign(&self, chain_id: u64, sender: Address, user_op_hash: B256) -> AppResult<Bytes> {
        let request = SignRequest {
            chain_id,
            sender,
            hash: user_op_hash,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(AppError::from)?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::endpoint_unavailable(format!("signer answered HTTP {}", status)));
        }
        let body: SignResponse = response
            .json()
            .await
            .map_err(|e| AppError::with_source(ErrorCode::SigningFailed, "unreadable signer response", e))?;

        let signature = read_signature(status, body, user_op_hash)?;
        debug!("✍️ Signed {} for {}", user_op_hash, sender);
        Ok(signature)
    }
}

/// Signature out of a signer reply; an explicit refusal is final
fn read_signature(status: StatusCode, body: SignResponse, user_op_hash: B256) -> AppResult<Bytes> {
    match (status.is_success(), body.signature, body.error) {
        (true, Some(signature), _) if !signature.is_empty() => Ok(signature),
        (_, _, Some(error)) => Err(AppError::new(
            ErrorCode::SigningFailed,
            format!("signer refused {}: {}", user_op_hash, error),
        )),
        _ => Err(AppError::new(
            ErrorCode::SigningFailed,
            format!("signer returned no signature (HTTP {})", status),
        )),
    }
}
