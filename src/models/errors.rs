//! Centralized Error Handling Module
//!
//! Every failure in the sweep engine carries a unique error code. The code
//! decides how the job state machine reacts: retry, rebuild, stop with a
//! policy outcome, or fail immediately.
//!
//! Error codes follow pattern: CATEGORY_SPECIFIC_ERROR
//! - RPC_xxx: chain endpoint errors
//! - SCAN_xxx: balance/price discovery errors
//! - QUOTE_xxx: route aggregation errors
//! - BATCH_xxx: batch construction errors
//! - SPONSOR_xxx: gas sponsorship errors
//! - SUBMIT_xxx: bundler/relay errors
//! - JOB_xxx: job store and lease errors
//! - CFG_xxx: configuration errors

use std::fmt;

/// Application-wide error type
#[derive(Debug)]
pub struct AppError {
    /// Unique error code for logging/monitoring
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
    /// Optional underlying error
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl AppError {
    /// Create a new AppError
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Create AppError with source error
    pub fn with_source(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Get error code as string (for logging)
    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    /// Taxonomy bucket of this error
    pub fn class(&self) -> ErrorClass {
        self.code.class()
    }

    /// Copy of this error without the boxed source, for fan-out to waiters
    pub fn detached(&self) -> Self {
        Self::new(self.code, self.message.clone())
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// How the orchestrator treats a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Endpoint timeouts, rate limits: retry the same step with backoff
    Transient,
    /// Stale quote or nonce: move the job backward and rebuild
    Rebuild,
    /// Sponsorship denial or nothing to sweep: terminal, reported
    PolicyDenied,
    /// Unsupported chain, malformed wallet: terminal immediately
    Fatal,
}

/// Unique error codes for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // ============================================
    // RPC Errors
    // ============================================
    /// No endpoint answered (connection refused, 5xx, exhausted fallbacks)
    EndpointUnavailable,
    /// RPC request timeout
    RpcTimeout,
    /// RPC rate limited (HTTP 429 / -32005)
    RpcRateLimited,
    /// RPC returned an error object
    RpcError,
    /// Response could not be decoded
    RpcInvalidResponse,

    // ============================================
    // Scan Errors
    // ============================================
    /// Chain is not in the registry
    UnsupportedChain,
    /// Wallet address could not be parsed
    InvalidWallet,
    /// No usable price for a token
    PriceUnavailable,
    /// Token discovery source failed
    DiscoveryFailed,

    // ============================================
    // Quote Errors
    // ============================================
    /// Provider did not answer within its timeout
    QuoteTimeout,
    /// Provider has no route for the pair
    NoRoute,
    /// Quote validity ends before the batch can be built
    QuoteExpired,

    // ============================================
    // Batch Errors
    // ============================================
    /// On-chain nonce moved since the batch was built
    NonceStale,
    /// Every candidate was dropped
    EmptyBatch,

    // ============================================
    // Sponsorship Errors
    // ============================================
    /// Policy refused to pay for gas
    SponsorshipDenied,
    /// Paymaster service failed to answer
    PaymasterUnavailable,

    // ============================================
    // Submission Errors
    // ============================================
    /// Bundler unreachable or refused the operation
    SubmissionFailed,
    /// No terminal receipt before the submission timeout
    SubmissionTimeout,
    /// Signer refused or failed
    SigningFailed,

    // ============================================
    // Job Errors
    // ============================================
    /// Unknown job id
    JobNotFound,
    /// Another holder owns the idempotency lease
    LeaseConflict,
    /// Job was cancelled by request
    JobCancelled,
    /// In-memory artifacts for a step are gone (restart, takeover)
    ArtifactsMissing,
    /// Invalid state machine transition
    InvalidTransition,

    // ============================================
    // Configuration Errors
    // ============================================
    /// Missing environment variable
    ConfigMissingEnv,
    /// Invalid configuration value
    ConfigInvalidValue,

    // ============================================
    // Generic Errors
    // ============================================
    /// Unknown error
    Unknown,
}

impl ErrorCode {
    /// Get string representation of error code
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EndpointUnavailable => "RPC_ENDPOINT_UNAVAILABLE",
            Self::RpcTimeout => "RPC_TIMEOUT",
            Self::RpcRateLimited => "RPC_RATE_LIMITED",
            Self::RpcError => "RPC_ERROR",
            Self::RpcInvalidResponse => "RPC_INVALID_RESPONSE",

            Self::UnsupportedChain => "SCAN_UNSUPPORTED_CHAIN",
            Self::InvalidWallet => "SCAN_INVALID_WALLET",
            Self::PriceUnavailable => "SCAN_PRICE_UNAVAILABLE",
            Self::DiscoveryFailed => "SCAN_DISCOVERY_FAILED",

            Self::QuoteTimeout => "QUOTE_TIMEOUT",
            Self::NoRoute => "QUOTE_NO_ROUTE",
            Self::QuoteExpired => "QUOTE_EXPIRED",

            Self::NonceStale => "BATCH_NONCE_STALE",
            Self::EmptyBatch => "BATCH_EMPTY",

            Self::SponsorshipDenied => "SPONSOR_DENIED",
            Self::PaymasterUnavailable => "SPONSOR_PAYMASTER_UNAVAILABLE",

            Self::SubmissionFailed => "SUBMIT_FAILED",
            Self::SubmissionTimeout => "SUBMIT_TIMEOUT",
            Self::SigningFailed => "SUBMIT_SIGNING_FAILED",

            Self::JobNotFound => "JOB_NOT_FOUND",
            Self::LeaseConflict => "JOB_LEASE_CONFLICT",
            Self::JobCancelled => "JOB_CANCELLED",
            Self::ArtifactsMissing => "JOB_ARTIFACTS_MISSING",
            Self::InvalidTransition => "JOB_INVALID_TRANSITION",

            Self::ConfigMissingEnv => "CFG_MISSING_ENV",
            Self::ConfigInvalidValue => "CFG_INVALID_VALUE",

            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    /// Map onto the retry taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::EndpointUnavailable
            | Self::RpcTimeout
            | Self::RpcRateLimited
            | Self::RpcError
            | Self::RpcInvalidResponse
            | Self::DiscoveryFailed
            | Self::QuoteTimeout
            | Self::PaymasterUnavailable
            | Self::SubmissionFailed
            | Self::SubmissionTimeout
            | Self::LeaseConflict
            | Self::Unknown => ErrorClass::Transient,

            Self::QuoteExpired | Self::NonceStale | Self::ArtifactsMissing => ErrorClass::Rebuild,

            Self::SponsorshipDenied | Self::EmptyBatch | Self::JobCancelled => {
                ErrorClass::PolicyDenied
            }

            Self::UnsupportedChain
            | Self::InvalidWallet
            | Self::PriceUnavailable
            | Self::NoRoute
            | Self::SigningFailed
            | Self::JobNotFound
            | Self::InvalidTransition
            | Self::ConfigMissingEnv
            | Self::ConfigInvalidValue => ErrorClass::Fatal,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

// ============================================
// Convenience constructors
// ============================================

impl AppError {
    pub fn endpoint_unavailable(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::EndpointUnavailable, msg)
    }

    pub fn rpc_timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::RpcTimeout, msg)
    }

    pub fn rpc_rate_limited() -> Self {
        Self::new(ErrorCode::RpcRateLimited, "Rate limited (HTTP 429)")
    }

    pub fn unsupported_chain(chain_id: u64) -> Self {
        Self::new(
            ErrorCode::UnsupportedChain,
            format!("Unsupported chain_id: {}", chain_id),
        )
    }

    pub fn invalid_wallet(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidWallet, msg)
    }

    pub fn price_unavailable(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::PriceUnavailable, msg)
    }

    pub fn quote_expired(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::QuoteExpired, msg)
    }

    pub fn nonce_stale(expected: impl fmt::Display, observed: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::NonceStale,
            format!("nonce moved: batch built for {}, chain reports {}", expected, observed),
        )
    }

    pub fn empty_batch(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::EmptyBatch, msg)
    }

    pub fn sponsorship_denied(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::SponsorshipDenied, msg)
    }

    pub fn submission_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::SubmissionFailed, msg)
    }

    pub fn job_not_found(id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::JobNotFound, format!("Job {} not found", id))
    }

    pub fn missing_env(key_name: &str) -> Self {
        Self::new(
            ErrorCode::ConfigMissingEnv,
            format!("Missing environment variable: {}", key_name),
        )
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigInvalidValue, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unknown, msg)
    }
}

// ============================================
// Result type alias
// ============================================

/// Application Result type
pub type AppResult<T> = Result<T, AppError>;

// ============================================
// Conversion from common error types
// ============================================

impl From<eyre::Report> for AppError {
    fn from(err: eyre::Report) -> Self {
        Self::new(ErrorCode::Unknown, err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::with_source(ErrorCode::Unknown, "IO error", err)
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::new(ErrorCode::RpcTimeout, "Request timeout")
        } else if err.is_connect() {
            Self::new(ErrorCode::EndpointUnavailable, "Connection failed")
        } else if err.status().map(|s| s.as_u16()) == Some(429) {
            Self::rpc_rate_limited()
        } else {
            Self::new(ErrorCode::EndpointUnavailable, err.to_string())
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_source(ErrorCode::RpcInvalidResponse, "JSON parse error", err)
    }
}

impl From<tokio::time::error::Elapsed> for AppError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::new(ErrorCode::RpcTimeout, "Call exceeded its timeout")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = AppError::rpc_timeout("Connection timed out");
        assert_eq!(err.code, ErrorCode::RpcTimeout);
        assert_eq!(err.code_str(), "RPC_TIMEOUT");
    }

    #[test]
    fn test_taxonomy() {
        assert_eq!(ErrorCode::EndpointUnavailable.class(), ErrorClass::Transient);
        assert_eq!(ErrorCode::QuoteExpired.class(), ErrorClass::Rebuild);
        assert_eq!(ErrorCode::NonceStale.class(), ErrorClass::Rebuild);
        assert_eq!(ErrorCode::SponsorshipDenied.class(), ErrorClass::PolicyDenied);
        assert_eq!(ErrorCode::EmptyBatch.class(), ErrorClass::PolicyDenied);
        assert_eq!(ErrorCode::UnsupportedChain.class(), ErrorClass::Fatal);
        assert_eq!(ErrorCode::InvalidWallet.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_retryable() {
        assert!(ErrorCode::RpcTimeout.is_retryable());
        assert!(ErrorCode::SubmissionFailed.is_retryable());
        assert!(!ErrorCode::SponsorshipDenied.is_retryable());
        assert!(!ErrorCode::QuoteExpired.is_retryable());
    }

    #[test]
    fn test_detached_keeps_code_and_message() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        let err = AppError::with_source(ErrorCode::EndpointUnavailable, "node down", io);
        let copy = err.detached();
        assert_eq!(copy.code, ErrorCode::EndpointUnavailable);
        assert_eq!(copy.message, "node down");
        assert!(copy.source.is_none());
    }
}
