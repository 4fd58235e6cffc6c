//! Billing error taxonomy.
//!
//! Authentication and funding failures are raised before any upstream cost is
//! incurred. Settlement and refund failures happen after the caller already has
//! their answer; they are logged and turned into reconciliation work instead of
//! failing the response.

use crate::credential::CredentialError;
use crate::money::{MoneyError, Usd};
use crate::pricing::CostError;

/// Errors surfaced by the billing pipeline.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Bad, expired or revoked credential.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Credential lacks the scope for this operation.
    #[error("forbidden: missing scope {0:?}")]
    Forbidden(String),

    /// No funding source covers the cost.
    #[error("insufficient funds: {required} required")]
    InsufficientFunds {
        /// Amount that could not be covered.
        required: Usd,
    },

    /// Payment payload was rejected; the caller must resubmit a fresh one.
    #[error("payment verification failed: {reason}")]
    PaymentVerificationFailed {
        /// Machine-readable reason.
        reason: String,
    },

    /// The upstream provider failed. Nothing is charged.
    #[error("upstream provider error ({status}): {message}")]
    UpstreamProviderError {
        /// Upstream HTTP status, or 502 for transport failures.
        status: u16,
        /// Diagnostic message.
        message: String,
    },

    /// The on-chain transfer could not be confirmed.
    #[error("settlement failed for transaction {transaction_id}: {reason}")]
    SettlementFailed {
        /// Ledger transaction id.
        transaction_id: String,
        /// Diagnostic reason.
        reason: String,
    },

    /// The overpayment refund could not be sent.
    #[error("refund failed for transaction {transaction_id}: {reason}")]
    RefundFailed {
        /// Ledger transaction id.
        transaction_id: String,
        /// Diagnostic reason.
        reason: String,
    },

    /// Malformed request or unpriced model.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Ledger or other internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Shorthand for [`BillingError::PaymentVerificationFailed`].
    #[must_use]
    pub fn payment(reason: impl Into<String>) -> Self {
        Self::PaymentVerificationFailed {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`BillingError::Internal`] from any displayable error.
    #[must_use]
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }

    /// HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Unauthorized(_) => 401,
            Self::Forbidden(_) => 403,
            Self::InsufficientFunds { .. } | Self::PaymentVerificationFailed { .. } => 402,
            Self::UpstreamProviderError { status, .. } => *status,
            Self::BadRequest(_) => 400,
            Self::NotFound(_) => 404,
            Self::SettlementFailed { .. } | Self::RefundFailed { .. } | Self::Internal(_) => 500,
        }
    }

    /// Stable machine-readable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::PaymentVerificationFailed { .. } => "payment_verification_failed",
            Self::UpstreamProviderError { .. } => "upstream_provider_error",
            Self::SettlementFailed { .. } => "settlement_failed",
            Self::RefundFailed { .. } => "refund_failed",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<CredentialError> for BillingError {
    fn from(err: CredentialError) -> Self {
        if err.is_unauthorized() {
            Self::Unauthorized(err.to_string())
        } else {
            Self::Internal(err.to_string())
        }
    }
}

impl From<CostError> for BillingError {
    fn from(err: CostError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<MoneyError> for BillingError {
    fn from(err: MoneyError) -> Self {
        Self::Internal(err.to_string())
    }
}
