//! Per-call x402 payment state machine.
//!
//! ```text
//! NoPaymentOffered ─▶ ChallengeIssued ─▶ PayloadReceived ─▶ Verified ─▶ Settled ─▶ [Completed]
//!        │                  │                   │              │           │
//!        └──────────────────┴───────────────────┴──────────────┴───────────┴──▶ [Failed]
//! ```
//!
//! A challenge and its paid resubmission are separate HTTP requests; the second
//! request resumes the machine from [`X402State::ChallengeIssued`] using the
//! challenge stored in the ledger.

use std::fmt;

use crate::timestamp::UnixTimestamp;

/// Where a call's on-demand payment stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum X402State {
    /// No payment requested yet.
    NoPaymentOffered,
    /// A 402 challenge was sent.
    ChallengeIssued {
        /// Challenge nonce.
        nonce: String,
        /// Requested amount, smallest asset units.
        amount_units: u64,
        /// Challenge expiry.
        expires_at: UnixTimestamp,
    },
    /// The caller resubmitted with a payment payload.
    PayloadReceived {
        /// Challenge nonce.
        nonce: String,
        /// Amount the payload authorizes.
        authorized_units: u64,
    },
    /// The facilitator accepted the payload.
    Verified {
        /// Payer address.
        payer: String,
        /// Amount the payload authorizes.
        authorized_units: u64,
    },
    /// The transfer executed on-chain.
    Settled {
        /// Payer address.
        payer: String,
        /// Amount transferred.
        authorized_units: u64,
        /// Amount the call actually cost.
        owed_units: u64,
        /// Settlement transaction hash.
        transaction: String,
    },
    /// Terminal: paid, and any overpayment handled.
    Completed {
        /// Settlement transaction hash.
        transaction: String,
        /// Units refunded to the payer (zero when nothing was owed back).
        refunded_units: u64,
    },
    /// Terminal: the payment did not go through.
    Failed {
        /// State the failure happened in.
        stage: &'static str,
        /// Diagnostic reason.
        reason: String,
    },
}

/// Inputs that move the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum X402Event {
    /// Send a 402 challenge.
    IssueChallenge {
        /// Challenge nonce.
        nonce: String,
        /// Requested amount.
        amount_units: u64,
        /// Challenge expiry.
        expires_at: UnixTimestamp,
    },
    /// A payload arrived for the challenge.
    ReceivePayload {
        /// Nonce the payload answers.
        nonce: String,
        /// Amount the payload authorizes.
        authorized_units: u64,
    },
    /// Facilitator verification succeeded.
    Verify {
        /// Payer address.
        payer: String,
    },
    /// Facilitator settlement succeeded.
    Settle {
        /// Amount the call cost.
        owed_units: u64,
        /// Settlement transaction hash.
        transaction: String,
    },
    /// Overpayment handled (or nothing to refund).
    Complete {
        /// Units refunded.
        refunded_units: u64,
    },
    /// Any failure.
    Fail {
        /// Diagnostic reason.
        reason: String,
    },
}

/// An event that is not valid in the current state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid x402 transition: {event} in state {state}")]
pub struct TransitionError {
    /// State name.
    pub state: &'static str,
    /// Event name.
    pub event: &'static str,
}

impl X402State {
    /// Short state name for logs and storage.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::NoPaymentOffered => "no_payment_offered",
            Self::ChallengeIssued { .. } => "challenge_issued",
            Self::PayloadReceived { .. } => "payload_received",
            Self::Verified { .. } => "verified",
            Self::Settled { .. } => "settled",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }

    /// Returns `true` for `Completed` and `Failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }

    /// Applies `event`, returning the next state.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] for events that do not apply to the current
    /// state, including any event after a terminal state.
    pub fn apply(self, event: X402Event) -> Result<Self, TransitionError> {
        let state = self.name();
        match (self, event) {
            (current, X402Event::Fail { reason }) if !current.is_terminal() => Ok(Self::Failed {
                stage: state,
                reason,
            }),
            (
                Self::NoPaymentOffered,
                X402Event::IssueChallenge {
                    nonce,
                    amount_units,
                    expires_at,
                },
            ) => Ok(Self::ChallengeIssued {
                nonce,
                amount_units,
                expires_at,
            }),
            (
                Self::ChallengeIssued {
                    nonce: expected, ..
                },
                X402Event::ReceivePayload {
                    nonce,
                    authorized_units,
                },
            ) if expected == nonce => Ok(Self::PayloadReceived {
                nonce,
                authorized_units,
            }),
            (
                Self::PayloadReceived {
                    authorized_units, ..
                },
                X402Event::Verify { payer },
            ) => Ok(Self::Verified {
                payer,
                authorized_units,
            }),
            (
                Self::Verified {
                    payer,
                    authorized_units,
                },
                X402Event::Settle {
                    owed_units,
                    transaction,
                },
            ) => Ok(Self::Settled {
                payer,
                authorized_units,
                owed_units,
                transaction,
            }),
            (Self::Settled { transaction, .. }, X402Event::Complete { refunded_units }) => {
                Ok(Self::Completed {
                    transaction,
                    refunded_units,
                })
            }
            (_, event) => Err(TransitionError {
                state,
                event: event.name(),
            }),
        }
    }
}

impl X402Event {
    /// Short event name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::IssueChallenge { .. } => "issue_challenge",
            Self::ReceivePayload { .. } => "receive_payload",
            Self::Verify { .. } => "verify",
            Self::Settle { .. } => "settle",
            Self::Complete { .. } => "complete",
            Self::Fail { .. } => "fail",
        }
    }
}

impl fmt::Display for X402State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
