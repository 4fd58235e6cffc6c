//! x402 wire format.
//!
//! - [`PaymentChallenge`] - body of a 402 response
//! - [`PaymentPayload`] - the signed authorization a caller resubmits in `X-Payment`
//! - [`VerifyRequest`] / [`VerifyResponse`] - facilitator `POST /verify`
//! - [`SettleRequest`] / [`SettleResponse`] - facilitator `POST /settle`
//!
//! All types serialize with camelCase field names.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::money::Usd;
use crate::timestamp::UnixTimestamp;

pub mod encoding;
pub mod v2;

pub use v2::{PaymentPayload, PaymentRequirements, ResourceInfo, SettleRequest, VerifyRequest};

/// Protocol version spoken by this proxy.
pub const X402_VERSION: u32 = 2;

/// The only supported scheme: pay an exact amount via EIP-3009.
pub const SCHEME_EXACT: &str = "exact";

/// An EIP-3009 `transferWithAuthorization` authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eip3009Authorization {
    /// Payer address.
    pub from: String,
    /// Recipient address.
    pub to: String,
    /// Authorized amount in the asset's smallest unit.
    pub value: String,
    /// Not valid before this time.
    pub valid_after: UnixTimestamp,
    /// Not valid at or after this time.
    pub valid_before: UnixTimestamp,
    /// 32-byte hex nonce chosen by the payer.
    pub nonce: String,
}

impl Eip3009Authorization {
    /// Parses the authorized amount.
    #[must_use]
    pub fn value_units(&self) -> Option<u64> {
        self.value.parse().ok()
    }
}

/// Payload of the `exact` scheme on EVM networks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExactEvmPayload {
    /// Payer signature over the EIP-712 typed authorization.
    pub signature: String,
    /// The authorization itself.
    pub authorization: Eip3009Authorization,
}

/// Body of a 402 response.
///
/// The flat fields summarize the single accepted option for simple clients;
/// `accepts` carries the full requirements x402 SDKs expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentChallenge {
    /// Protocol version.
    pub x402_version: u32,
    /// Why payment is required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Amount in the asset's smallest unit.
    pub amount: String,
    /// Amount in dollars, for display.
    pub amount_usd: Usd,
    /// Token contract address.
    pub asset: String,
    /// Recipient address.
    pub pay_to: String,
    /// Single-use challenge nonce.
    pub nonce: String,
    /// Challenge expiry.
    pub expires_at: UnixTimestamp,
    /// The paid resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceInfo>,
    /// Accepted payment options.
    pub accepts: Vec<PaymentRequirements>,
}

/// Result of `POST /verify`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResponse {
    /// The payload satisfies the requirements.
    Valid {
        /// Payer address.
        payer: String,
    },
    /// The payload was rejected.
    Invalid {
        /// Machine-readable reason.
        reason: String,
        /// The payer, if identifiable.
        payer: Option<String>,
    },
}

impl VerifyResponse {
    /// Returns `true` if verification succeeded.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponseWire {
    is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invalid_reason: Option<String>,
}

impl Serialize for VerifyResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = match self {
            Self::Valid { payer } => VerifyResponseWire {
                is_valid: true,
                payer: Some(payer.clone()),
                invalid_reason: None,
            },
            Self::Invalid { reason, payer } => VerifyResponseWire {
                is_valid: false,
                payer: payer.clone(),
                invalid_reason: Some(reason.clone()),
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for VerifyResponse {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = VerifyResponseWire::deserialize(deserializer)?;
        if wire.is_valid {
            let payer = wire
                .payer
                .ok_or_else(|| serde::de::Error::missing_field("payer"))?;
            Ok(Self::Valid { payer })
        } else {
            Ok(Self::Invalid {
                reason: wire
                    .invalid_reason
                    .unwrap_or_else(|| "unspecified".to_owned()),
                payer: wire.payer,
            })
        }
    }
}

/// Result of `POST /settle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleResponse {
    /// The transfer executed on-chain.
    Success {
        /// Payer address.
        payer: String,
        /// On-chain transaction hash.
        transaction: String,
        /// CAIP-2 network.
        network: String,
    },
    /// The transfer failed.
    Error {
        /// Machine-readable reason.
        reason: String,
        /// CAIP-2 network.
        network: String,
    },
}

impl SettleResponse {
    /// Returns `true` if settlement succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettleResponseWire {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    transaction: Option<String>,
    #[serde(default)]
    network: String,
}

impl Serialize for SettleResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = match self {
            Self::Success {
                payer,
                transaction,
                network,
            } => SettleResponseWire {
                success: true,
                error_reason: None,
                payer: Some(payer.clone()),
                transaction: Some(transaction.clone()),
                network: network.clone(),
            },
            Self::Error { reason, network } => SettleResponseWire {
                success: false,
                error_reason: Some(reason.clone()),
                payer: None,
                transaction: None,
                network: network.clone(),
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SettleResponse {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = SettleResponseWire::deserialize(deserializer)?;
        if wire.success {
            let transaction = wire
                .transaction
                .ok_or_else(|| serde::de::Error::missing_field("transaction"))?;
            Ok(Self::Success {
                payer: wire.payer.unwrap_or_default(),
                transaction,
                network: wire.network,
            })
        } else {
            Ok(Self::Error {
                reason: wire.error_reason.unwrap_or_else(|| "unspecified".to_owned()),
                network: wire.network,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn verify_response_wire_shape() {
        let valid: VerifyResponse =
            serde_json::from_value(json!({ "isValid": true, "payer": "0xabc" })).unwrap();
        assert_eq!(
            valid,
            VerifyResponse::Valid {
                payer: "0xabc".into()
            }
        );
        let invalid: VerifyResponse = serde_json::from_value(
            json!({ "isValid": false, "invalidReason": "invalid_exact_evm_payload_signature" }),
        )
        .unwrap();
        assert!(!invalid.is_valid());
        assert!(serde_json::from_value::<VerifyResponse>(json!({ "isValid": true })).is_err());
    }

    #[test]
    fn settle_response_wire_shape() {
        let ok: SettleResponse = serde_json::from_value(json!({
            "success": true,
            "transaction": "0xfeed",
            "network": "eip155:8453",
            "payer": "0xabc"
        }))
        .unwrap();
        assert!(ok.is_success());
        let round = serde_json::to_value(&ok).unwrap();
        assert_eq!(round["transaction"], "0xfeed");

        let failed: SettleResponse = serde_json::from_value(
            json!({ "success": false, "errorReason": "insufficient_funds", "network": "eip155:8453" }),
        )
        .unwrap();
        assert_eq!(
            failed,
            SettleResponse::Error {
                reason: "insufficient_funds".into(),
                network: "eip155:8453".into()
            }
        );
    }

    #[test]
    fn payload_decodes_exact_evm_authorization() {
        let payload: PaymentPayload = serde_json::from_value(json!({
            "x402Version": 2,
            "payload": {
                "signature": "0xsig",
                "authorization": {
                    "from": "0xpayer",
                    "to": "0xpayee",
                    "value": "2000000",
                    "validAfter": "0",
                    "validBefore": 1900000000u64,
                    "nonce": "0x01"
                }
            },
            "accepted": {
                "scheme": "exact",
                "network": "eip155:8453",
                "asset": "0xA",
                "amount": "2000000",
                "payTo": "0xpayee",
                "maxTimeoutSeconds": 300,
                "extra": { "nonce": "n1" }
            }
        }))
        .unwrap();
        let exact = payload.exact_evm().unwrap();
        assert_eq!(exact.authorization.value_units(), Some(2_000_000));
        assert_eq!(payload.accepted.challenge_nonce(), Some("n1"));
    }
}
