//! Version 2 x402 payment messages.
//!
//! Networks are CAIP-2 identifiers (`eip155:8453`) and amounts are strings of the
//! asset's smallest unit.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ExactEvmPayload, X402_VERSION};

/// Describes the resource being paid for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    /// Request path of the paid call.
    pub url: String,

    /// Optional human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Optional MIME type of the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// What the proxy accepts as payment for one call.
///
/// ```json
/// {
///   "scheme": "exact",
///   "network": "eip155:8453",
///   "asset": "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
///   "amount": "1350000",
///   "payTo": "0x...",
///   "maxTimeoutSeconds": 300,
///   "extra": { "name": "USD Coin", "version": "2", "nonce": "..." }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    /// Payment scheme identifier, always `exact` here.
    pub scheme: String,

    /// CAIP-2 network identifier.
    pub network: String,

    /// Token contract address.
    pub asset: String,

    /// Amount in the asset's smallest unit.
    pub amount: String,

    /// Recipient address.
    pub pay_to: String,

    /// Maximum time in seconds the authorization must stay valid.
    pub max_timeout_seconds: u64,

    /// EIP-712 domain parameters and the challenge nonce.
    #[serde(default = "default_empty_object")]
    pub extra: Value,
}

impl PaymentRequirements {
    /// Returns the challenge nonce carried in `extra.nonce`.
    #[must_use]
    pub fn challenge_nonce(&self) -> Option<&str> {
        self.extra.get("nonce").and_then(Value::as_str)
    }

    /// Parses the amount as integer units.
    #[must_use]
    pub fn amount_units(&self) -> Option<u64> {
        self.amount.parse().ok()
    }

    /// Compares the fields a payer may not alter, ignoring address case.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        self.scheme == other.scheme
            && self.network == other.network
            && self.asset.eq_ignore_ascii_case(&other.asset)
            && self.pay_to.eq_ignore_ascii_case(&other.pay_to)
            && self.amount == other.amount
            && self.challenge_nonce() == other.challenge_nonce()
    }
}

/// A signed payment, sent base64-encoded in the `X-Payment` header.
///
/// ```json
/// {
///   "x402Version": 2,
///   "payload": { "authorization": {...}, "signature": "0x..." },
///   "accepted": { "scheme": "exact", "network": "eip155:8453", ... }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    /// Protocol version.
    #[serde(default = "default_version")]
    pub x402_version: u32,

    /// Scheme-specific payload.
    pub payload: Value,

    /// The requirements being fulfilled.
    pub accepted: PaymentRequirements,

    /// Optional resource information.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceInfo>,

    /// Optional extension data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl PaymentPayload {
    /// Decodes the payload as an EIP-3009 `exact` authorization.
    ///
    /// # Errors
    ///
    /// Returns the JSON error when the payload has another shape.
    pub fn exact_evm(&self) -> Result<ExactEvmPayload, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Body of `POST /verify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    /// Protocol version.
    #[serde(default = "default_version")]
    pub x402_version: u32,

    /// The payment to verify.
    pub payment_payload: PaymentPayload,

    /// The requirements to verify against.
    pub payment_requirements: PaymentRequirements,
}

impl VerifyRequest {
    /// Pairs a payload with its requirements.
    #[must_use]
    pub const fn new(payment_payload: PaymentPayload, payment_requirements: PaymentRequirements) -> Self {
        Self {
            x402_version: X402_VERSION,
            payment_payload,
            payment_requirements,
        }
    }
}

/// Body of `POST /settle`. Identical in shape to [`VerifyRequest`].
pub type SettleRequest = VerifyRequest;

const fn default_version() -> u32 {
    X402_VERSION
}

fn default_empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}
