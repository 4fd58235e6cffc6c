//! Balance selection, reservations, charge commit and release.
//!
//! A call is paid for in two steps. Before forwarding, [`Ledger::select_funding`]
//! holds the estimated cost on the first source that covers it (spend pool,
//! then prepaid balance). After the provider answers, [`Ledger::commit_charge`]
//! turns the hold into a transaction for the actual cost, or
//! [`Ledger::release_reservation`] returns it if the call failed.
//!
//! Holds are real debits: a reserved amount is already counted in
//! `total_spent`, so concurrent calls see it immediately.

use sqlx::{Sqlite, Transaction};
use tollgate::money::Usd;
use tollgate::pricing::{CostBreakdown, TokenUsage};
use tollgate::timestamp::UnixTimestamp;

use crate::accounts::app_from_row;
use crate::records::{
    ChargeRecord, CommittedCharge, Funding, FundingSource, ReconciliationItem, Reservation,
    TransactionRecord,
};
use crate::{Ledger, LedgerError, new_id, now, units};

type ReservationRow = (String, String, String, String, i64, String, i64);

impl Ledger {
    /// Holds `amount` on the first source that covers it.
    ///
    /// Order: the app's spend pool (if the user is a member, the pool has the
    /// funds and the user is under their limit), then the user's prepaid
    /// balance. When neither covers it the result is [`Funding::OnDemand`] if
    /// `on_demand_available`, otherwise [`LedgerError::InsufficientFunds`].
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InsufficientFunds`] when nothing covers the amount.
    pub async fn select_funding(
        &self,
        user_id: &str,
        app_id: &str,
        amount: Usd,
        on_demand_available: bool,
    ) -> Result<Funding, LedgerError> {
        if amount.is_negative() {
            return Err(LedgerError::InvalidArgument(format!(
                "reservation {amount} must not be negative"
            )));
        }
        if let Some(reservation) = self.reserve_from_spend_pool(user_id, app_id, amount).await? {
            return Ok(Funding::Reserved(reservation));
        }
        if let Some(reservation) = self.reserve_from_user(user_id, app_id, amount).await? {
            return Ok(Funding::Reserved(reservation));
        }
        if on_demand_available {
            tracing::debug!(user_id, app_id, %amount, "No balance covers call, offering x402");
            return Ok(Funding::OnDemand);
        }
        Err(LedgerError::InsufficientFunds { required: amount })
    }

    /// Holds `amount` on the app's spend pool. `None` if the pool cannot cover it.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on failure.
    pub async fn reserve_from_spend_pool(
        &self,
        user_id: &str,
        app_id: &str,
        amount: Usd,
    ) -> Result<Option<Reservation>, LedgerError> {
        let amount_units = units(amount)?;
        let mut tx = self.pool.begin().await?;
        let debited = sqlx::query(
            "UPDATE spend_pools SET total_spent = total_spent + ?1 \
             WHERE app_id = ?2 AND total_funded - total_spent >= ?1 \
               AND EXISTS (SELECT 1 FROM app_members WHERE app_id = ?2 AND user_id = ?3) \
               AND EXISTS (SELECT 1 FROM apps WHERE id = ?2 AND archived = 0)",
        )
        .bind(amount_units)
        .bind(app_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if debited == 0 {
            return Ok(None);
        }
        let within_limit = sqlx::query(
            "INSERT INTO spend_pool_usage (app_id, user_id, spent) \
             SELECT ?1, ?2, ?3 FROM spend_pools \
             WHERE app_id = ?1 AND (per_user_limit IS NULL OR per_user_limit >= ?3) \
             ON CONFLICT (app_id, user_id) DO UPDATE SET spent = spent + excluded.spent \
             WHERE (SELECT per_user_limit FROM spend_pools WHERE app_id = ?1) IS NULL \
                OR spent + excluded.spent <= (SELECT per_user_limit FROM spend_pools WHERE app_id = ?1)",
        )
        .bind(app_id)
        .bind(user_id)
        .bind(amount_units)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if within_limit == 0 {
            tracing::debug!(user_id, app_id, %amount, "Per-user pool limit reached");
            return Ok(None);
        }
        let reservation = insert_reservation(
            &mut tx,
            user_id,
            app_id,
            FundingSource::SpendPool,
            amount,
            amount_units,
        )
        .await?;
        tx.commit().await?;
        tracing::debug!(reservation_id = %reservation.id, app_id, %amount, "Reserved on spend pool");
        Ok(Some(reservation))
    }

    /// Holds `amount` on the user's prepaid balance. `None` if it cannot cover it.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on failure.
    pub async fn reserve_from_user(
        &self,
        user_id: &str,
        app_id: &str,
        amount: Usd,
    ) -> Result<Option<Reservation>, LedgerError> {
        let amount_units = units(amount)?;
        let mut tx = self.pool.begin().await?;
        let debited = sqlx::query(
            "UPDATE users SET total_spent = total_spent + ?1 \
             WHERE id = ?2 AND archived = 0 AND total_paid - total_spent >= ?1",
        )
        .bind(amount_units)
        .bind(user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if debited == 0 {
            return Ok(None);
        }
        let reservation = insert_reservation(
            &mut tx,
            user_id,
            app_id,
            FundingSource::UserBalance,
            amount,
            amount_units,
        )
        .await?;
        tx.commit().await?;
        tracing::debug!(reservation_id = %reservation.id, user_id, %amount, "Reserved on user balance");
        Ok(Some(reservation))
    }

    /// Converts a hold into a transaction for the actual cost.
    ///
    /// When the actual cost exceeds the hold the difference is debited if the
    /// source still covers it. Otherwise the source is drained to zero, the
    /// persisted cost is capped at what was collected and a reconciliation
    /// item records the shortfall. Any unused part of the hold is returned.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::ReservationFinalized`] if the hold was already
    /// committed or released.
    pub async fn commit_charge(
        &self,
        reservation_id: &str,
        charge: &ChargeRecord,
    ) -> Result<CommittedCharge, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let closed = sqlx::query(
            "UPDATE reservations SET state = 'committed' WHERE id = ? AND state = 'open'",
        )
        .bind(reservation_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if closed == 0 {
            return Err(LedgerError::ReservationFinalized(reservation_id.to_owned()));
        }
        let reservation = load_reservation(&mut tx, reservation_id).await?;
        let held = units(reservation.amount)?;
        let owed = units(charge.cost.total_cost)?;

        let mut cost = charge.cost;
        let mut under_collected = false;
        if owed > held {
            let extra = owed - held;
            let topped_up = adjust_source(&mut tx, &reservation, Adjust::TopUp(extra)).await?;
            if !topped_up {
                let available = source_available(&mut tx, &reservation).await?;
                let collected = held + available;
                adjust_source(&mut tx, &reservation, Adjust::Drain(available)).await?;
                cost = cost.capped_at(Usd::from_ledger_units(collected));
                under_collected = true;
            }
        } else if held > owed {
            adjust_source(&mut tx, &reservation, Adjust::Release(held - owed)).await?;
        }

        let transaction_id = new_id("txn");
        insert_transaction(
            &mut tx,
            &transaction_id,
            charge,
            &cost,
            reservation.source,
            Some(reservation_id),
            None,
        )
        .await?;
        accrue_payouts(&mut tx, &transaction_id, &charge.app_id, &cost).await?;
        if under_collected {
            insert_reconciliation(
                &mut tx,
                &transaction_id,
                "under_collected",
                &format!(
                    "actual cost {} exceeded available funds; collected {}",
                    charge.cost.total_cost, cost.total_cost
                ),
            )
            .await?;
        }
        tx.commit().await?;

        if under_collected {
            tracing::warn!(
                transaction_id,
                owed = %charge.cost.total_cost,
                collected = %cost.total_cost,
                "Charge under-collected"
            );
        } else {
            tracing::info!(
                transaction_id,
                source = %reservation.source,
                total = %cost.total_cost,
                model = %charge.model,
                "Charge committed"
            );
        }
        Ok(CommittedCharge {
            transaction_id,
            cost,
            under_collected,
        })
    }

    /// Returns a hold in full. `false` if it was already committed or released.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] for an unknown reservation.
    pub async fn release_reservation(&self, reservation_id: &str) -> Result<bool, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let closed = sqlx::query(
            "UPDATE reservations SET state = 'released' WHERE id = ? AND state = 'open'",
        )
        .bind(reservation_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if closed == 0 {
            return Ok(false);
        }
        let reservation = load_reservation(&mut tx, reservation_id).await?;
        adjust_source(
            &mut tx,
            &reservation,
            Adjust::Release(units(reservation.amount)?),
        )
        .await?;
        tx.commit().await?;
        tracing::debug!(reservation_id, amount = %reservation.amount, "Reservation released");
        Ok(true)
    }

    /// Releases holds older than `max_age_secs`, left behind by a crash
    /// between reserve and commit. Returns how many were released.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on failure.
    pub async fn release_stale_reservations(&self, max_age_secs: u64) -> Result<usize, LedgerError> {
        let cutoff = (UnixTimestamp::now() - max_age_secs).as_i64();
        let stale = sqlx::query_scalar::<_, String>(
            "SELECT id FROM reservations WHERE state = 'open' AND created_at < ? ORDER BY created_at",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        let mut released = 0;
        for id in stale {
            if self.release_reservation(&id).await? {
                released += 1;
            }
        }
        if released > 0 {
            tracing::warn!(released, "Released stale reservations");
        }
        Ok(released)
    }

    /// Loads a reservation.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] for an unknown reservation.
    pub async fn reservation(&self, reservation_id: &str) -> Result<Reservation, LedgerError> {
        let row = sqlx::query_as::<_, ReservationRow>(RESERVATION_SELECT)
            .bind(reservation_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("reservation {reservation_id}")))?;
        reservation_from_row(row)
    }

    /// Loads a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] for an unknown transaction.
    pub async fn transaction(&self, transaction_id: &str) -> Result<TransactionRecord, LedgerError> {
        let row = sqlx::query_as::<_, TransactionRow>(
            "SELECT id, user_id, app_id, api_key_id, funding_source, provider, model, \
                    input_tokens, output_tokens, cached_input_tokens, \
                    raw_cost, app_markup_profit, platform_markup_profit, total_cost, created_at \
             FROM transactions WHERE id = ?",
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("transaction {transaction_id}")))?;
        transaction_from_row(row)
    }

    /// Unresolved reconciliation items, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on failure.
    pub async fn transactions_needing_reconciliation(&self) -> Result<Vec<ReconciliationItem>, LedgerError> {
        let rows = sqlx::query_as::<_, (i64, Option<String>, Option<String>, String, String, i64)>(
            "SELECT id, transaction_id, reference, kind, detail, created_at \
             FROM reconciliation_items WHERE resolved = 0 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, transaction_id, reference, kind, detail, created_at)| ReconciliationItem {
                id,
                transaction_id,
                reference,
                kind,
                detail,
                created_at: UnixTimestamp::from_i64(created_at),
            })
            .collect())
    }

    /// Flags a call that was served but could not be billed. `reference` is
    /// its reservation id or challenge nonce. Returns the item id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on failure.
    pub async fn flag_unbilled_call(&self, reference: &str, detail: &str) -> Result<i64, LedgerError> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO reconciliation_items (reference, kind, detail, created_at) \
             VALUES (?, 'commit_failed', ?, ?) RETURNING id",
        )
        .bind(reference)
        .bind(detail)
        .bind(now())
        .fetch_one(&self.pool)
        .await?;
        tracing::warn!(reference, detail, item_id = id, "Served call flagged as unbilled");
        Ok(id)
    }

    /// Marks a reconciliation item resolved.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] for an unknown or already resolved item.
    pub async fn resolve_reconciliation_item(&self, id: i64) -> Result<(), LedgerError> {
        let affected = sqlx::query(
            "UPDATE reconciliation_items SET resolved = 1 WHERE id = ? AND resolved = 0",
        )
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected == 0 {
            return Err(LedgerError::NotFound(format!("reconciliation item {id}")));
        }
        Ok(())
    }
}

enum Adjust {
    /// Debit more, only if the source covers it.
    TopUp(i64),
    /// Debit exactly this, known to be available.
    Drain(i64),
    /// Give back part of the hold.
    Release(i64),
}

/// Applies `adjust` to the reservation's source. Returns `false` only when a
/// top-up did not fit.
async fn adjust_source(
    tx: &mut Transaction<'_, Sqlite>,
    reservation: &Reservation,
    adjust: Adjust,
) -> Result<bool, LedgerError> {
    let (delta, conditional) = match adjust {
        Adjust::TopUp(amount) => (amount, true),
        Adjust::Drain(amount) => (amount, false),
        Adjust::Release(amount) => (-amount, false),
    };
    if delta == 0 {
        return Ok(true);
    }
    let affected = match reservation.source {
        FundingSource::UserBalance => {
            let sql = if conditional {
                "UPDATE users SET total_spent = total_spent + ?1 \
                 WHERE id = ?2 AND total_paid - total_spent >= ?1"
            } else {
                "UPDATE users SET total_spent = total_spent + ?1 WHERE id = ?2"
            };
            sqlx::query(sql)
                .bind(delta)
                .bind(&reservation.user_id)
                .execute(&mut **tx)
                .await?
                .rows_affected()
        }
        FundingSource::SpendPool => {
            let query = if conditional {
                sqlx::query(
                    "UPDATE spend_pools SET total_spent = total_spent + ?1 \
                     WHERE app_id = ?2 AND total_funded - total_spent >= ?1 \
                       AND (per_user_limit IS NULL OR per_user_limit >= ?1 + \
                            (SELECT spent FROM spend_pool_usage WHERE app_id = ?2 AND user_id = ?3))",
                )
                .bind(delta)
                .bind(&reservation.app_id)
                .bind(&reservation.user_id)
            } else {
                sqlx::query("UPDATE spend_pools SET total_spent = total_spent + ? WHERE app_id = ?")
                    .bind(delta)
                    .bind(&reservation.app_id)
            };
            let pooled = query.execute(&mut **tx).await?.rows_affected();
            if pooled > 0 {
                sqlx::query(
                    "UPDATE spend_pool_usage SET spent = spent + ? WHERE app_id = ? AND user_id = ?",
                )
                .bind(delta)
                .bind(&reservation.app_id)
                .bind(&reservation.user_id)
                .execute(&mut **tx)
                .await?;
            }
            pooled
        }
        FundingSource::X402 => {
            return Err(LedgerError::Corrupt {
                column: "reservations.source",
                value: reservation.source.to_string(),
            });
        }
    };
    Ok(affected > 0)
}

/// Funds the reservation's source could still provide, in ledger units.
async fn source_available(
    tx: &mut Transaction<'_, Sqlite>,
    reservation: &Reservation,
) -> Result<i64, LedgerError> {
    let available = match reservation.source {
        FundingSource::UserBalance => {
            sqlx::query_scalar::<_, i64>("SELECT total_paid - total_spent FROM users WHERE id = ?")
                .bind(&reservation.user_id)
                .fetch_one(&mut **tx)
                .await?
        }
        FundingSource::SpendPool => {
            let (pool_left, limit_left) = sqlx::query_as::<_, (i64, Option<i64>)>(
                "SELECT p.total_funded - p.total_spent, p.per_user_limit - u.spent \
                 FROM spend_pools p \
                 JOIN spend_pool_usage u ON u.app_id = p.app_id AND u.user_id = ? \
                 WHERE p.app_id = ?",
            )
            .bind(&reservation.user_id)
            .bind(&reservation.app_id)
            .fetch_one(&mut **tx)
            .await?;
            limit_left.map_or(pool_left, |limit| pool_left.min(limit))
        }
        FundingSource::X402 => 0,
    };
    Ok(available.max(0))
}

const RESERVATION_SELECT: &str =
    "SELECT id, user_id, app_id, source, amount, state, created_at FROM reservations WHERE id = ?";

async fn load_reservation(
    tx: &mut Transaction<'_, Sqlite>,
    reservation_id: &str,
) -> Result<Reservation, LedgerError> {
    let row = sqlx::query_as::<_, ReservationRow>(RESERVATION_SELECT)
        .bind(reservation_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("reservation {reservation_id}")))?;
    reservation_from_row(row)
}

fn reservation_from_row(row: ReservationRow) -> Result<Reservation, LedgerError> {
    let (id, user_id, app_id, source, amount, _state, created_at) = row;
    Ok(Reservation {
        id,
        user_id,
        app_id,
        source: FundingSource::parse(&source)?,
        amount: Usd::from_ledger_units(amount),
        created_at: UnixTimestamp::from_i64(created_at),
    })
}

async fn insert_reservation(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: &str,
    app_id: &str,
    source: FundingSource,
    amount: Usd,
    amount_units: i64,
) -> Result<Reservation, LedgerError> {
    let id = new_id("res");
    let ts = now();
    sqlx::query(
        "INSERT INTO reservations (id, user_id, app_id, source, amount, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(user_id)
    .bind(app_id)
    .bind(source.as_str())
    .bind(amount_units)
    .bind(ts)
    .execute(&mut **tx)
    .await?;
    Ok(Reservation {
        id,
        user_id: user_id.to_owned(),
        app_id: app_id.to_owned(),
        source,
        amount: amount.round_to_ledger(),
        created_at: UnixTimestamp::from_i64(ts),
    })
}

type TransactionRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    i64,
    i64,
    i64,
    i64,
    i64,
    i64,
    i64,
    i64,
);

fn transaction_from_row(row: TransactionRow) -> Result<TransactionRecord, LedgerError> {
    let token = |value: i64, column: &'static str| {
        u64::try_from(value).map_err(|_| LedgerError::Corrupt {
            column,
            value: value.to_string(),
        })
    };
    Ok(TransactionRecord {
        id: row.0,
        user_id: row.1,
        app_id: row.2,
        api_key_id: row.3,
        funding_source: FundingSource::parse(&row.4)?,
        provider: row.5,
        model: row.6,
        usage: TokenUsage {
            input_tokens: token(row.7, "transactions.input_tokens")?,
            output_tokens: token(row.8, "transactions.output_tokens")?,
            cached_input_tokens: token(row.9, "transactions.cached_input_tokens")?,
        },
        cost: CostBreakdown {
            raw_cost: Usd::from_ledger_units(row.10),
            app_markup_profit: Usd::from_ledger_units(row.11),
            platform_markup_profit: Usd::from_ledger_units(row.12),
            total_cost: Usd::from_ledger_units(row.13),
        },
        created_at: UnixTimestamp::from_i64(row.14),
    })
}

fn token_count(value: u64) -> Result<i64, LedgerError> {
    i64::try_from(value)
        .map_err(|_| LedgerError::InvalidArgument(format!("token count {value} out of range")))
}

pub(crate) async fn insert_transaction(
    tx: &mut Transaction<'_, Sqlite>,
    transaction_id: &str,
    charge: &ChargeRecord,
    cost: &CostBreakdown,
    source: FundingSource,
    reservation_id: Option<&str>,
    payment_id: Option<&str>,
) -> Result<(), LedgerError> {
    sqlx::query(
        "INSERT INTO transactions (id, user_id, app_id, api_key_id, funding_source, \
             reservation_id, payment_id, provider, model, \
             input_tokens, output_tokens, cached_input_tokens, \
             raw_cost, app_markup_profit, platform_markup_profit, total_cost, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(transaction_id)
    .bind(&charge.user_id)
    .bind(&charge.app_id)
    .bind(&charge.api_key_id)
    .bind(source.as_str())
    .bind(reservation_id)
    .bind(payment_id)
    .bind(&charge.provider)
    .bind(&charge.model)
    .bind(token_count(charge.usage.input_tokens)?)
    .bind(token_count(charge.usage.output_tokens)?)
    .bind(token_count(charge.usage.cached_input_tokens)?)
    .bind(units(cost.raw_cost)?)
    .bind(units(cost.app_markup_profit)?)
    .bind(units(cost.platform_markup_profit)?)
    .bind(units(cost.total_cost)?)
    .bind(now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Splits the app markup profit between the referrer and the app.
pub(crate) async fn accrue_payouts(
    tx: &mut Transaction<'_, Sqlite>,
    transaction_id: &str,
    app_id: &str,
    cost: &CostBreakdown,
) -> Result<(), LedgerError> {
    if cost.app_markup_profit.is_zero() {
        return Ok(());
    }
    let row = sqlx::query_as::<_, (String, String, String, Option<String>, String, bool)>(
        "SELECT id, name, markup, referrer_user_id, referral_share, archived FROM apps WHERE id = ?",
    )
    .bind(app_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| LedgerError::NotFound(format!("app {app_id}")))?;
    let app = app_from_row(row)?;

    let referral = match &app.referrer_user_id {
        Some(_) => cost
            .app_markup_profit
            .scale_by(app.referral_share)
            .round_to_ledger(),
        None => Usd::ZERO,
    };
    let app_share = cost.app_markup_profit - referral;
    let ts = now();
    let shares = [
        ("app", Some(app.id.as_str()), app_share),
        ("referrer", app.referrer_user_id.as_deref(), referral),
    ];
    for (kind, recipient, amount) in shares {
        let Some(recipient) = recipient else { continue };
        let amount_units = units(amount)?;
        if amount_units <= 0 {
            continue;
        }
        sqlx::query(
            "INSERT INTO payouts (id, transaction_id, app_id, recipient_kind, recipient_id, amount, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new_id("pyo"))
        .bind(transaction_id)
        .bind(app_id)
        .bind(kind)
        .bind(recipient)
        .bind(amount_units)
        .bind(ts)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Opens a reconciliation item, or refreshes the detail of the open item of
/// the same kind for the transaction.
pub(crate) async fn insert_reconciliation(
    tx: &mut Transaction<'_, Sqlite>,
    transaction_id: &str,
    kind: &str,
    detail: &str,
) -> Result<(), LedgerError> {
    let refreshed = sqlx::query(
        "UPDATE reconciliation_items SET detail = ? \
         WHERE transaction_id = ? AND kind = ? AND resolved = 0",
    )
    .bind(detail)
    .bind(transaction_id)
    .bind(kind)
    .execute(&mut **tx)
    .await?
    .rows_affected();
    if refreshed > 0 {
        return Ok(());
    }
    sqlx::query(
        "INSERT INTO reconciliation_items (transaction_id, kind, detail, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(transaction_id)
    .bind(kind)
    .bind(detail)
    .bind(now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}
