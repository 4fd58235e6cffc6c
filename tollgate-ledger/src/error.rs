use tollgate::BillingError;
use tollgate::money::{MoneyError, Usd};
use tollgate::pricing::CostError;

/// Errors raised by [`crate::Ledger`] operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The database failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored JSON document could not be (de)serialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An amount could not be represented.
    #[error(transparent)]
    Money(#[from] MoneyError),

    /// A stored markup or share is invalid.
    #[error(transparent)]
    Cost(#[from] CostError),

    /// A stored value does not parse.
    #[error("invalid stored value in {column}: {value:?}")]
    Corrupt {
        /// Column holding the value.
        column: &'static str,
        /// Offending value.
        value: String,
    },

    /// A referenced row does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// No funding source covers the amount.
    #[error("insufficient funds: {required} required")]
    InsufficientFunds {
        /// Amount that could not be covered.
        required: Usd,
    },

    /// The reservation was already committed or released.
    #[error("reservation {0} is already finalized")]
    ReservationFinalized(String),

    /// The challenge is unknown, expired, already used or belongs to someone else.
    #[error("payment challenge {0:?} is unknown, expired or already used")]
    ChallengeUnavailable(String),

    /// The payment authorization was already used.
    #[error("payment {0} was already used")]
    PaymentReplay(String),

    /// A value passed in is outside its allowed range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<LedgerError> for BillingError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds { required } => Self::InsufficientFunds { required },
            LedgerError::ChallengeUnavailable(_) | LedgerError::PaymentReplay(_) => {
                Self::payment(err.to_string())
            }
            LedgerError::NotFound(what) => Self::NotFound(what),
            LedgerError::InvalidArgument(msg) => Self::BadRequest(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
