//! Row types returned by the ledger.

use std::fmt;

use rust_decimal::Decimal;
use serde::Serialize;
use tollgate::credential::Scope;
use tollgate::money::Usd;
use tollgate::pricing::{CostBreakdown, Markup, TokenUsage};
use tollgate::proto::{PaymentPayload, PaymentRequirements};
use tollgate::timestamp::UnixTimestamp;

use crate::LedgerError;

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident, $column:literal { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Stored representation.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub(crate) fn parse(value: &str) -> Result<Self, LedgerError> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(LedgerError::Corrupt {
                        column: $column,
                        value: other.to_owned(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(
    /// A user's role in an app.
    MemberRole, "app_members.role" {
        /// Owns the app and collects its markup.
        Owner => "owner",
        /// Uses the app.
        Customer => "customer",
    }
);

string_enum!(
    /// What paid for a call.
    FundingSource, "transactions.funding_source" {
        /// The app's free-tier spend pool.
        SpendPool => "spend_pool",
        /// The user's prepaid balance.
        UserBalance => "user_balance",
        /// An on-demand x402 payment.
        X402 => "x402",
    }
);

string_enum!(
    /// Who a payout goes to.
    RecipientKind, "payouts.recipient_kind" {
        /// The app (its owners).
        App => "app",
        /// The app's referrer.
        Referrer => "referrer",
    }
);

string_enum!(
    /// Lifecycle of an x402 settle call.
    SettleState, "x402_settlements.settle_state" {
        /// Not attempted yet.
        Pending => "pending",
        /// A worker is talking to the facilitator.
        InFlight => "in_flight",
        /// Executed on-chain.
        Settled => "settled",
        /// Last attempt failed; retryable.
        Failed => "failed",
    }
);

string_enum!(
    /// Lifecycle of an overpayment refund.
    RefundState, "x402_settlements.refund_state" {
        /// Paid exactly what was owed.
        NotRequired => "not_required",
        /// Waiting for settlement to finish.
        Pending => "pending",
        /// A worker is sending it.
        InFlight => "in_flight",
        /// Transferred on-chain.
        Sent => "sent",
        /// Last attempt failed; retryable.
        Failed => "failed",
    }
);

/// A user and their prepaid totals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// User id.
    pub id: String,
    /// Contact email.
    pub email: Option<String>,
    /// Funds paid in.
    pub total_paid: Usd,
    /// Funds spent, including open reservations.
    pub total_spent: Usd,
    /// Archived users cannot authenticate.
    pub archived: bool,
}

/// A billable tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct App {
    /// App id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Markup multiplier charged on top of raw cost.
    pub markup: Markup,
    /// User who referred the app, if any.
    pub referrer_user_id: Option<String>,
    /// Fraction of the app markup profit owed to the referrer.
    pub referral_share: Decimal,
    /// Archived apps cannot be used.
    pub archived: bool,
}

/// Input to [`crate::Ledger::create_app`].
#[derive(Debug, Clone)]
pub struct NewApp {
    /// Display name.
    pub name: String,
    /// Markup multiplier.
    pub markup: Markup,
    /// First owner.
    pub owner_user_id: String,
    /// Referrer, if any.
    pub referrer_user_id: Option<String>,
    /// Referrer share of the markup profit, in `[0, 1]`.
    pub referral_share: Decimal,
}

/// A provisioned API key. The plaintext is only returned at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKey {
    /// Key id.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Bound app.
    pub app_id: String,
    /// Granted scopes.
    pub scope: Scope,
    /// Optional label.
    pub name: Option<String>,
}

/// A user's prepaid balance as served to the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserBalance {
    /// User id.
    pub user_id: String,
    /// `total_paid − total_spent`.
    pub balance: Usd,
    /// Funds paid in.
    pub total_paid: Usd,
    /// Funds spent, including open reservations.
    pub total_spent: Usd,
}

/// A spend pool's balance as served to the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolBalance {
    /// Owning app.
    pub app_id: String,
    /// `total_funded − total_spent`.
    pub balance: Usd,
    /// Funds put into the pool.
    pub total_funded: Usd,
    /// Funds drawn from the pool.
    pub total_spent: Usd,
    /// Maximum any single user may draw.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_user_limit: Option<Usd>,
}

/// A hold placed before forwarding a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Reservation id.
    pub id: String,
    /// Billed user.
    pub user_id: String,
    /// App the call goes through.
    pub app_id: String,
    /// Held source. Never [`FundingSource::X402`].
    pub source: FundingSource,
    /// Amount held.
    pub amount: Usd,
    /// When the hold was placed.
    pub created_at: UnixTimestamp,
}

/// The funding decision for a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Funding {
    /// Funds are held on a spend pool or prepaid balance.
    Reserved(Reservation),
    /// Neither covers the call; the caller must pay on demand.
    OnDemand,
}

/// What one billed call consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRecord {
    /// Billed user.
    pub user_id: String,
    /// App the call went through.
    pub app_id: String,
    /// API key used, if any.
    pub api_key_id: Option<String>,
    /// Upstream provider name.
    pub provider: String,
    /// Upstream model.
    pub model: String,
    /// Tokens consumed.
    pub usage: TokenUsage,
    /// Cost after markup.
    pub cost: CostBreakdown,
}

/// Result of committing a reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedCharge {
    /// Transaction id.
    pub transaction_id: String,
    /// What was actually collected.
    pub cost: CostBreakdown,
    /// `true` when the source could not cover the full cost.
    pub under_collected: bool,
}

/// An immutable billed-call record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    /// Transaction id.
    pub id: String,
    /// Billed user.
    pub user_id: String,
    /// App the call went through.
    pub app_id: String,
    /// API key used, if any.
    pub api_key_id: Option<String>,
    /// What paid.
    pub funding_source: FundingSource,
    /// Upstream provider.
    pub provider: String,
    /// Upstream model.
    pub model: String,
    /// Tokens consumed.
    pub usage: TokenUsage,
    /// Persisted cost split.
    pub cost: CostBreakdown,
    /// When the call was billed.
    pub created_at: UnixTimestamp,
}

/// A transaction, or a served call that never became one, that needs an
/// operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationItem {
    /// Item id.
    pub id: i64,
    /// Affected transaction, if one was written.
    pub transaction_id: Option<String>,
    /// Reservation id or challenge nonce of a call with no transaction.
    pub reference: Option<String>,
    /// Problem category (`under_collected`, `settlement_failed`, `refund_failed`,
    /// `commit_failed`, `unbilled_payment`).
    pub kind: String,
    /// Diagnostic detail.
    pub detail: String,
    /// When it was flagged.
    pub created_at: UnixTimestamp,
}

/// Pending payouts for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayoutSummary {
    /// App or referrer.
    pub recipient_kind: RecipientKind,
    /// App id or referrer user id.
    pub recipient_id: String,
    /// Sum owed.
    pub amount: Usd,
    /// Number of accrued rows.
    pub count: i64,
}

/// A completed payout batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayoutBatch {
    /// Batch id.
    pub batch_id: String,
    /// App or referrer.
    pub recipient_kind: RecipientKind,
    /// App id or referrer user id.
    pub recipient_id: String,
    /// Sum paid out.
    pub amount: Usd,
    /// Number of rows included.
    pub count: i64,
}

/// An issued 402 challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRecord {
    /// Single-use nonce.
    pub nonce: String,
    /// User the challenge was issued to.
    pub user_id: String,
    /// App the call goes through.
    pub app_id: String,
    /// Requested amount in asset units.
    pub amount_units: u64,
    /// Requirements sent to the caller, nonce included.
    pub requirements: PaymentRequirements,
    /// Expiry.
    pub expires_at: UnixTimestamp,
}

/// Everything recorded when an x402-funded call completes.
#[derive(Debug, Clone)]
pub struct X402Charge {
    /// Challenge the payment answered.
    pub challenge_nonce: String,
    /// Payment row created at claim time.
    pub payment_id: String,
    /// The billed call.
    pub charge: ChargeRecord,
    /// Payer address.
    pub payer: String,
    /// Units the payload authorizes.
    pub paid_units: u64,
    /// Units the call costs, capped at `paid_units`.
    pub owed_units: u64,
    /// Units to refund.
    pub refund_units: u64,
    /// Actual cost exceeded the authorization.
    pub under_collected: bool,
    /// The signed payload, kept for settlement retries.
    pub payload: PaymentPayload,
    /// Requirements the payload was verified against.
    pub requirements: PaymentRequirements,
}

/// Settlement bookkeeping for one x402 transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRecord {
    /// Transaction id, also the idempotency key.
    pub transaction_id: String,
    /// Payment row.
    pub payment_id: String,
    /// Payer address.
    pub payer: String,
    /// Units authorized.
    pub paid_units: u64,
    /// Units owed.
    pub owed_units: u64,
    /// Units to refund.
    pub refund_units: u64,
    /// Signed payload.
    pub payload: PaymentPayload,
    /// Verified requirements.
    pub requirements: PaymentRequirements,
    /// Settle progress.
    pub settle_state: SettleState,
    /// Settlement transaction hash.
    pub settle_tx: Option<String>,
    /// Refund progress.
    pub refund_state: RefundState,
    /// Refund transaction hash.
    pub refund_tx: Option<String>,
    /// Number of settle attempts.
    pub attempts: i64,
}

/// Outcome of trying to take ownership of a settle or refund step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepClaim {
    /// The caller owns the step and must finish it.
    Proceed(SettlementRecord),
    /// The step already completed; nothing to do.
    Done(SettlementRecord),
    /// Another worker owns the step, or a prerequisite is unmet.
    Busy(SettlementRecord),
}
