//! Seams to the outside world of on-chain settlement.
//!
//! [`Facilitator`] verifies and executes x402 authorizations. [`RefundSender`]
//! pushes overpayments back to the payer. Both are object-safe so the HTTP
//! layer can hold them behind `Arc<dyn _>`.

use std::fmt::Debug;

use async_trait::async_trait;

use crate::proto::{SettleRequest, SettleResponse, VerifyRequest, VerifyResponse};

/// Boxed error for settlement seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A remote x402 facilitator.
#[async_trait]
pub trait Facilitator: Debug + Send + Sync {
    /// Checks a payment payload against its requirements without moving funds.
    async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse, BoxError>;

    /// Executes the authorization on-chain. `idempotency_key` is stable across
    /// retries of the same billed call.
    async fn settle(
        &self,
        request: &SettleRequest,
        idempotency_key: &str,
    ) -> Result<SettleResponse, BoxError>;
}

/// An overpayment to return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundRequest {
    /// Stable key of the billed call.
    pub idempotency_key: String,
    /// CAIP-2 network.
    pub network: String,
    /// Token contract.
    pub asset: String,
    /// Payer address receiving the refund.
    pub to: String,
    /// Refund in the asset's smallest unit, always non-zero.
    pub amount_units: u64,
}

/// Proof a refund was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundReceipt {
    /// On-chain transaction hash.
    pub transaction: String,
}

/// Sends refunds on-chain.
#[async_trait]
pub trait RefundSender: Debug + Send + Sync {
    /// Transfers `refund.amount_units` to `refund.to`.
    async fn send_refund(&self, refund: &RefundRequest) -> Result<RefundReceipt, BoxError>;
}
