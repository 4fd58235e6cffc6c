#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! The tollgate ledger.
//!
//! The single source of truth for "can this request be paid for". Every balance
//! lives here as `i64` fixed-point nano-dollars and every mutation of a balance
//! happens in the same SQLite transaction as the record that explains it.
//!
//! Debits never read-then-write. Each one is a single conditional update:
//!
//! ```sql
//! UPDATE users SET total_spent = total_spent + :amount
//! WHERE id = :user AND total_paid - total_spent >= :amount
//! ```
//!
//! so two concurrent calls cannot both pass a balance check against the same
//! remaining funds.
//!
//! # Modules
//!
//! - [`accounts`] - Users, apps, memberships, API keys and token revocation
//! - [`debit`] - Balance selection, reservations, charge commit and release
//! - [`x402`] - Payment challenges and per-transaction settlement records
//! - [`payments`] - Card top-ups delivered by webhook
//! - [`payouts`] - Markup and referral payouts
//! - [`records`] - Row types returned by the ledger

use std::str::FromStr;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tollgate::money::Usd;
use tollgate::timestamp::UnixTimestamp;

pub mod accounts;
pub mod debit;
mod error;
pub mod payments;
pub mod payouts;
pub mod records;
mod schema;
pub mod x402;

pub use error::LedgerError;
pub use payments::{CardPaymentEvent, CardPaymentOutcome, CreditTarget, WebhookOutcome};
pub use records::*;

/// Handle to the ledger database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    /// Opens (creating if needed) the database at `url` and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the database cannot be opened.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        let ledger = Self { pool };
        ledger.init_schema().await?;
        tracing::info!(url, max_connections, "Ledger opened");
        Ok(ledger)
    }

    /// A private in-memory ledger on a single connection.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if `SQLite` cannot be initialized.
    pub async fn in_memory() -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let ledger = Self { pool };
        ledger.init_schema().await?;
        Ok(ledger)
    }

    /// Applies the schema. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on failure.
    pub async fn init_schema(&self) -> Result<(), LedgerError> {
        schema::init(&self.pool).await
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

fn now() -> i64 {
    UnixTimestamp::now().as_i64()
}

fn units(amount: Usd) -> Result<i64, LedgerError> {
    Ok(amount.to_ledger_units()?)
}

fn asset_units_to_i64(value: u64, column: &'static str) -> Result<i64, LedgerError> {
    i64::try_from(value).map_err(|_| LedgerError::Corrupt {
        column,
        value: value.to_string(),
    })
}

fn asset_units_from_i64(value: i64, column: &'static str) -> Result<u64, LedgerError> {
    u64::try_from(value).map_err(|_| LedgerError::Corrupt {
        column,
        value: value.to_string(),
    })
}
