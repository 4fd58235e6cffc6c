//! Payment challenges and per-transaction settlement records.
//!
//! A challenge is single-use: [`Ledger::claim_challenge`] flips it from
//! `issued` to `claimed` with a conditional update and, in the same database
//! transaction, records the payment under the authorization's own nonce.
//! Replaying either the challenge or the signed authorization fails there.
//!
//! Settlement and refund are each guarded by a claim
//! ([`Ledger::begin_settlement`], [`Ledger::begin_refund`]) so retries after a
//! crash or a concurrent reconcile run execute each step at most once.

use sqlx::{Sqlite, Transaction};
use tollgate::money::Usd;
use tollgate::proto::{PaymentPayload, PaymentRequirements};
use tollgate::timestamp::UnixTimestamp;

use crate::debit::{accrue_payouts, insert_reconciliation, insert_transaction};
use crate::error::is_unique_violation;
use crate::records::{
    ChallengeRecord, CommittedCharge, FundingSource, RefundState, SettleState, SettlementRecord,
    StepClaim, X402Charge,
};
use crate::{Ledger, LedgerError, asset_units_from_i64, asset_units_to_i64, new_id, now, units};

/// A step left `in_flight` longer than this is assumed abandoned and may be
/// claimed again.
pub const IN_FLIGHT_TIMEOUT_SECS: u64 = 300;

type ChallengeRow = (String, String, String, i64, String, i64);

type SettlementRow = (
    String,
    String,
    String,
    i64,
    i64,
    i64,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    i64,
);

const SETTLEMENT_SELECT: &str = "SELECT transaction_id, payment_id, payer, paid_units, owed_units, \
     refund_units, payload, requirements, settle_state, settle_tx, refund_state, refund_tx, attempts \
     FROM x402_settlements WHERE transaction_id = ?";

impl Ledger {
    /// Records a 402 challenge for `user_id`. A fresh nonce is written into
    /// `requirements.extra.nonce`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidArgument`] if the requirements amount is
    /// not an integer.
    pub async fn issue_challenge(
        &self,
        user_id: &str,
        app_id: &str,
        mut requirements: PaymentRequirements,
        ttl_secs: u64,
    ) -> Result<ChallengeRecord, LedgerError> {
        let amount_units = requirements.amount_units().ok_or_else(|| {
            LedgerError::InvalidArgument(format!("amount {:?} is not integer units", requirements.amount))
        })?;
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        if !requirements.extra.is_object() {
            requirements.extra = serde_json::Value::Object(serde_json::Map::new());
        }
        if let Some(extra) = requirements.extra.as_object_mut() {
            extra.insert("nonce".to_owned(), serde_json::Value::String(nonce.clone()));
        }
        let issued_at = UnixTimestamp::now();
        let expires_at = issued_at + ttl_secs;
        sqlx::query(
            "INSERT INTO x402_challenges (nonce, user_id, app_id, amount_units, requirements, expires_at, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&nonce)
        .bind(user_id)
        .bind(app_id)
        .bind(asset_units_to_i64(amount_units, "x402_challenges.amount_units")?)
        .bind(serde_json::to_string(&requirements)?)
        .bind(expires_at.as_i64())
        .bind(issued_at.as_i64())
        .execute(&self.pool)
        .await?;
        tracing::debug!(nonce, user_id, amount_units, "Payment challenge issued");
        Ok(ChallengeRecord {
            nonce,
            user_id: user_id.to_owned(),
            app_id: app_id.to_owned(),
            amount_units,
            requirements,
            expires_at,
        })
    }

    /// Loads a challenge regardless of its state.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on failure.
    pub async fn challenge(&self, nonce: &str) -> Result<Option<ChallengeRecord>, LedgerError> {
        let row = sqlx::query_as::<_, ChallengeRow>(
            "SELECT nonce, user_id, app_id, amount_units, requirements, expires_at \
             FROM x402_challenges WHERE nonce = ?",
        )
        .bind(nonce)
        .fetch_optional(&self.pool)
        .await?;
        row.map(challenge_from_row).transpose()
    }

    /// Consumes an issued, unexpired challenge for `user_id` and records a
    /// pending payment keyed by `payment_external_id`. Returns the challenge
    /// and the new payment id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::ChallengeUnavailable`] if the challenge is
    /// unknown, expired, already used or issued to another user, and
    /// [`LedgerError::PaymentReplay`] if the authorization was seen before.
    pub async fn claim_challenge(
        &self,
        nonce: &str,
        user_id: &str,
        payment_external_id: &str,
        authorized: Usd,
    ) -> Result<(ChallengeRecord, String), LedgerError> {
        let ts = now();
        let mut tx = self.pool.begin().await?;
        let claimed = sqlx::query(
            "UPDATE x402_challenges SET state = 'claimed' \
             WHERE nonce = ? AND user_id = ? AND state = 'issued' AND expires_at >= ?",
        )
        .bind(nonce)
        .bind(user_id)
        .bind(ts)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if claimed == 0 {
            return Err(LedgerError::ChallengeUnavailable(nonce.to_owned()));
        }
        let challenge = sqlx::query_as::<_, ChallengeRow>(
            "SELECT nonce, user_id, app_id, amount_units, requirements, expires_at \
             FROM x402_challenges WHERE nonce = ?",
        )
        .bind(nonce)
        .fetch_one(&mut *tx)
        .await
        .map_err(LedgerError::from)
        .and_then(challenge_from_row)?;

        let payment_id = new_id("pay");
        sqlx::query(
            "INSERT INTO payments (id, external_id, user_id, app_id, kind, amount, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, 'crypto', ?, 'pending', ?, ?)",
        )
        .bind(&payment_id)
        .bind(payment_external_id)
        .bind(user_id)
        .bind(&challenge.app_id)
        .bind(units(authorized)?)
        .bind(ts)
        .bind(ts)
        .execute(&mut *tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                LedgerError::PaymentReplay(payment_external_id.to_owned())
            } else {
                LedgerError::Database(err)
            }
        })?;
        sqlx::query("UPDATE x402_challenges SET payment_id = ? WHERE nonce = ?")
            .bind(&payment_id)
            .bind(nonce)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::debug!(nonce, payment_id, "Payment challenge claimed");
        Ok((challenge, payment_id))
    }

    /// Marks a challenge and its pending payment failed. Returns `false` if the
    /// challenge had already completed or failed.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on failure.
    pub async fn fail_challenge(&self, nonce: &str, reason: &str) -> Result<bool, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let failed = sqlx::query(
            "UPDATE x402_challenges SET state = 'failed', failure = ? \
             WHERE nonce = ? AND state IN ('issued', 'claimed')",
        )
        .bind(reason)
        .bind(nonce)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if failed == 0 {
            return Ok(false);
        }
        sqlx::query(
            "UPDATE payments SET status = 'failed', updated_at = ? \
             WHERE id = (SELECT payment_id FROM x402_challenges WHERE nonce = ?) AND status = 'pending'",
        )
        .bind(now())
        .bind(nonce)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        tracing::debug!(nonce, reason, "Payment challenge failed");
        Ok(true)
    }

    /// Fails issued challenges past their expiry, and claimed challenges that
    /// never produced a transaction within `claimed_grace_secs` after expiry.
    /// The payments of the latter are failed and flagged as `unbilled_payment`.
    /// Returns how many challenges were failed.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on failure.
    pub async fn expire_challenges(&self, claimed_grace_secs: u64) -> Result<u64, LedgerError> {
        let ts = now();
        let grace = i64::try_from(claimed_grace_secs).unwrap_or(i64::MAX);
        let mut tx = self.pool.begin().await?;
        let issued = sqlx::query(
            "UPDATE x402_challenges SET state = 'failed', failure = 'expired' \
             WHERE state = 'issued' AND expires_at < ?",
        )
        .bind(ts)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let stranded = sqlx::query_as::<_, (String, Option<String>)>(
            "SELECT nonce, payment_id FROM x402_challenges \
             WHERE state = 'claimed' AND expires_at < ?",
        )
        .bind(ts.saturating_sub(grace))
        .fetch_all(&mut *tx)
        .await?;
        for (nonce, payment_id) in &stranded {
            sqlx::query(
                "UPDATE x402_challenges SET state = 'failed', failure = 'never billed' \
                 WHERE nonce = ? AND state = 'claimed'",
            )
            .bind(nonce)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "UPDATE payments SET status = 'failed', updated_at = ? \
                 WHERE id = ? AND status = 'pending'",
            )
            .bind(ts)
            .bind(payment_id)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "INSERT INTO reconciliation_items (reference, kind, detail, created_at) \
                 VALUES (?, 'unbilled_payment', ?, ?)",
            )
            .bind(nonce)
            .bind(format!(
                "payment {} was verified but its call was never billed; nothing settled",
                payment_id.as_deref().unwrap_or("unknown")
            ))
            .bind(ts)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        if !stranded.is_empty() {
            tracing::warn!(count = stranded.len(), "Failed claimed challenges that were never billed");
        }
        Ok(issued + u64::try_from(stranded.len()).unwrap_or(u64::MAX))
    }

    /// Records a completed x402-funded call: the transaction, its payouts and
    /// a pending settlement. `charge.charge.cost` is the amount collected.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::ChallengeUnavailable`] if the challenge was not
    /// claimed by this payment.
    pub async fn commit_x402_charge(
        &self,
        charge: &X402Charge,
    ) -> Result<CommittedCharge, LedgerError> {
        let ts = now();
        let cost = charge.charge.cost;
        let mut tx = self.pool.begin().await?;
        let completed = sqlx::query(
            "UPDATE x402_challenges SET state = 'completed' \
             WHERE nonce = ? AND payment_id = ? AND state = 'claimed'",
        )
        .bind(&charge.challenge_nonce)
        .bind(&charge.payment_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if completed == 0 {
            return Err(LedgerError::ChallengeUnavailable(charge.challenge_nonce.clone()));
        }
        sqlx::query("UPDATE payments SET amount = ?, updated_at = ? WHERE id = ?")
            .bind(units(cost.total_cost)?)
            .bind(ts)
            .bind(&charge.payment_id)
            .execute(&mut *tx)
            .await?;

        let transaction_id = new_id("txn");
        insert_transaction(
            &mut tx,
            &transaction_id,
            &charge.charge,
            &cost,
            FundingSource::X402,
            None,
            Some(&charge.payment_id),
        )
        .await?;
        accrue_payouts(&mut tx, &transaction_id, &charge.charge.app_id, &cost).await?;

        let refund_state = if charge.refund_units == 0 {
            RefundState::NotRequired
        } else {
            RefundState::Pending
        };
        sqlx::query(
            "INSERT INTO x402_settlements (transaction_id, payment_id, payer, paid_units, owed_units, \
                 refund_units, payload, requirements, refund_state, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&transaction_id)
        .bind(&charge.payment_id)
        .bind(&charge.payer)
        .bind(asset_units_to_i64(charge.paid_units, "x402_settlements.paid_units")?)
        .bind(asset_units_to_i64(charge.owed_units, "x402_settlements.owed_units")?)
        .bind(asset_units_to_i64(charge.refund_units, "x402_settlements.refund_units")?)
        .bind(serde_json::to_string(&charge.payload)?)
        .bind(serde_json::to_string(&charge.requirements)?)
        .bind(refund_state.as_str())
        .bind(ts)
        .execute(&mut *tx)
        .await?;
        if charge.under_collected {
            insert_reconciliation(
                &mut tx,
                &transaction_id,
                "under_collected",
                &format!(
                    "actual cost exceeded the {} units authorized by {}",
                    charge.paid_units, charge.payer
                ),
            )
            .await?;
        }
        tx.commit().await?;
        tracing::info!(
            transaction_id,
            payer = %charge.payer,
            owed_units = charge.owed_units,
            refund_units = charge.refund_units,
            "x402 charge committed"
        );
        Ok(CommittedCharge {
            transaction_id,
            cost,
            under_collected: charge.under_collected,
        })
    }

    /// Loads the settlement record of an x402 transaction.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] for an unknown transaction.
    pub async fn settlement(&self, transaction_id: &str) -> Result<SettlementRecord, LedgerError> {
        let row = sqlx::query_as::<_, SettlementRow>(SETTLEMENT_SELECT)
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("settlement {transaction_id}")))?;
        settlement_from_row(row)
    }

    /// Takes ownership of the settle step.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] for an unknown transaction.
    pub async fn begin_settlement(&self, transaction_id: &str) -> Result<StepClaim, LedgerError> {
        let ts = now();
        let claimed = sqlx::query(
            "UPDATE x402_settlements SET settle_state = 'in_flight', attempts = attempts + 1, updated_at = ?1 \
             WHERE transaction_id = ?2 AND (settle_state IN ('pending', 'failed') \
                OR (settle_state = 'in_flight' AND updated_at < ?3))",
        )
        .bind(ts)
        .bind(transaction_id)
        .bind(ts - stale_offset())
        .execute(&self.pool)
        .await?
        .rows_affected();
        let record = self.settlement(transaction_id).await?;
        Ok(if claimed > 0 {
            StepClaim::Proceed(record)
        } else if record.settle_state == SettleState::Settled {
            StepClaim::Done(record)
        } else {
            StepClaim::Busy(record)
        })
    }

    /// Records the outcome of a settle attempt started with
    /// [`Ledger::begin_settlement`]. `Ok` carries the on-chain transaction hash,
    /// `Err` the failure reason.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] for an unknown transaction.
    pub async fn finish_settlement(
        &self,
        transaction_id: &str,
        outcome: Result<&str, &str>,
    ) -> Result<SettlementRecord, LedgerError> {
        let ts = now();
        let mut tx = self.pool.begin().await?;
        match outcome {
            Ok(hash) => {
                sqlx::query(
                    "UPDATE x402_settlements SET settle_state = 'settled', settle_tx = ?, \
                         settle_error = NULL, updated_at = ? \
                     WHERE transaction_id = ? AND settle_state = 'in_flight'",
                )
                .bind(hash)
                .bind(ts)
                .bind(transaction_id)
                .execute(&mut *tx)
                .await?;
                set_payment_status(&mut tx, transaction_id, "completed", ts).await?;
            }
            Err(reason) => {
                let failed = sqlx::query(
                    "UPDATE x402_settlements SET settle_state = 'failed', settle_error = ?, updated_at = ? \
                     WHERE transaction_id = ? AND settle_state = 'in_flight'",
                )
                .bind(reason)
                .bind(ts)
                .bind(transaction_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if failed > 0 {
                    set_payment_status(&mut tx, transaction_id, "failed", ts).await?;
                    insert_reconciliation(&mut tx, transaction_id, "settlement_failed", reason)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        self.settlement(transaction_id).await
    }

    /// Takes ownership of the refund step. Only possible once settled.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] for an unknown transaction.
    pub async fn begin_refund(&self, transaction_id: &str) -> Result<StepClaim, LedgerError> {
        let ts = now();
        let claimed = sqlx::query(
            "UPDATE x402_settlements SET refund_state = 'in_flight', updated_at = ?1 \
             WHERE transaction_id = ?2 AND settle_state = 'settled' \
               AND (refund_state IN ('pending', 'failed') \
                    OR (refund_state = 'in_flight' AND updated_at < ?3))",
        )
        .bind(ts)
        .bind(transaction_id)
        .bind(ts - stale_offset())
        .execute(&self.pool)
        .await?
        .rows_affected();
        let record = self.settlement(transaction_id).await?;
        Ok(if claimed > 0 {
            StepClaim::Proceed(record)
        } else if matches!(record.refund_state, RefundState::Sent | RefundState::NotRequired) {
            StepClaim::Done(record)
        } else {
            StepClaim::Busy(record)
        })
    }

    /// Records the outcome of a refund started with [`Ledger::begin_refund`].
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] for an unknown transaction.
    pub async fn finish_refund(
        &self,
        transaction_id: &str,
        outcome: Result<&str, &str>,
    ) -> Result<SettlementRecord, LedgerError> {
        let ts = now();
        let mut tx = self.pool.begin().await?;
        match outcome {
            Ok(hash) => {
                sqlx::query(
                    "UPDATE x402_settlements SET refund_state = 'sent', refund_tx = ?, \
                         refund_error = NULL, updated_at = ? \
                     WHERE transaction_id = ? AND refund_state = 'in_flight'",
                )
                .bind(hash)
                .bind(ts)
                .bind(transaction_id)
                .execute(&mut *tx)
                .await?;
            }
            Err(reason) => {
                let failed = sqlx::query(
                    "UPDATE x402_settlements SET refund_state = 'failed', refund_error = ?, updated_at = ? \
                     WHERE transaction_id = ? AND refund_state = 'in_flight'",
                )
                .bind(reason)
                .bind(ts)
                .bind(transaction_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if failed > 0 {
                    insert_reconciliation(&mut tx, transaction_id, "refund_failed", reason).await?;
                }
            }
        }
        tx.commit().await?;
        self.settlement(transaction_id).await
    }

    /// Transactions whose settlement or refund still needs work, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on failure.
    pub async fn pending_settlements(&self) -> Result<Vec<String>, LedgerError> {
        Ok(sqlx::query_scalar::<_, String>(
            "SELECT transaction_id FROM x402_settlements \
             WHERE settle_state IN ('pending', 'failed', 'in_flight') \
                OR (settle_state = 'settled' AND refund_state IN ('pending', 'failed', 'in_flight')) \
             ORDER BY updated_at",
        )
        .fetch_all(&self.pool)
        .await?)
    }
}

fn stale_offset() -> i64 {
    i64::try_from(IN_FLIGHT_TIMEOUT_SECS).unwrap_or(i64::MAX)
}

async fn set_payment_status(
    tx: &mut Transaction<'_, Sqlite>,
    transaction_id: &str,
    status: &str,
    ts: i64,
) -> Result<(), LedgerError> {
    sqlx::query(
        "UPDATE payments SET status = ?, updated_at = ? \
         WHERE id = (SELECT payment_id FROM x402_settlements WHERE transaction_id = ?)",
    )
    .bind(status)
    .bind(ts)
    .bind(transaction_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn challenge_from_row(row: ChallengeRow) -> Result<ChallengeRecord, LedgerError> {
    let (nonce, user_id, app_id, amount_units, requirements, expires_at) = row;
    Ok(ChallengeRecord {
        nonce,
        user_id,
        app_id,
        amount_units: asset_units_from_i64(amount_units, "x402_challenges.amount_units")?,
        requirements: serde_json::from_str(&requirements)?,
        expires_at: UnixTimestamp::from_i64(expires_at),
    })
}

fn settlement_from_row(row: SettlementRow) -> Result<SettlementRecord, LedgerError> {
    let payload: PaymentPayload = serde_json::from_str(&row.6)?;
    let requirements: PaymentRequirements = serde_json::from_str(&row.7)?;
    Ok(SettlementRecord {
        transaction_id: row.0,
        payment_id: row.1,
        payer: row.2,
        paid_units: asset_units_from_i64(row.3, "x402_settlements.paid_units")?,
        owed_units: asset_units_from_i64(row.4, "x402_settlements.owed_units")?,
        refund_units: asset_units_from_i64(row.5, "x402_settlements.refund_units")?,
        payload,
        requirements,
        settle_state: SettleState::parse(&row.8)?,
        settle_tx: row.9,
        refund_state: RefundState::parse(&row.10)?,
        refund_tx: row.11,
        attempts: row.12,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{ChargeRecord, NewApp};
    use rust_decimal::Decimal;
    use serde_json::json;
    use tollgate::pricing::{CostBreakdown, Markup, TokenUsage};

    fn usd(s: &str) -> Usd {
        Usd::parse(s).unwrap()
    }

    fn requirements() -> PaymentRequirements {
        PaymentRequirements {
            scheme: "exact".into(),
            network: "eip155:84532".into(),
            asset: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".into(),
            amount: "2000000".into(),
            pay_to: "0x1111111111111111111111111111111111111111".into(),
            max_timeout_seconds: 300,
            extra: json!({ "name": "USDC", "version": "2" }),
        }
    }

    async fn setup() -> (Ledger, String, String) {
        let ledger = Ledger::in_memory().await.unwrap();
        let owner = ledger.create_user(None).await.unwrap();
        let app = ledger
            .create_app(NewApp {
                name: "app".into(),
                markup: Markup::new("1.5".parse().unwrap()).unwrap(),
                owner_user_id: owner.id,
                referrer_user_id: None,
                referral_share: Decimal::ZERO,
            })
            .await
            .unwrap();
        let user = ledger.create_user(None).await.unwrap();
        (ledger, user.id, app.id)
    }

    fn x402_charge(
        challenge: &ChallengeRecord,
        payment_id: &str,
        owed_units: u64,
    ) -> X402Charge {
        let cost = CostBreakdown::compute(
            usd("0.9"),
            Markup::new("1.5".parse().unwrap()).unwrap(),
            Markup::NONE,
        );
        X402Charge {
            challenge_nonce: challenge.nonce.clone(),
            payment_id: payment_id.to_owned(),
            charge: ChargeRecord {
                user_id: challenge.user_id.clone(),
                app_id: challenge.app_id.clone(),
                api_key_id: None,
                provider: "openai".into(),
                model: "gpt-4o".into(),
                usage: TokenUsage::new(100, 100),
                cost,
            },
            payer: "0xpayer".into(),
            paid_units: challenge.amount_units,
            owed_units,
            refund_units: challenge.amount_units - owed_units,
            under_collected: false,
            payload: PaymentPayload {
                x402_version: 2,
                payload: json!({ "signature": "0x00" }),
                accepted: challenge.requirements.clone(),
                resource: None,
                extensions: None,
            },
            requirements: challenge.requirements.clone(),
        }
    }

    #[tokio::test]
    async fn challenge_carries_nonce_and_is_single_use() {
        let (ledger, user, app) = setup().await;
        let challenge = ledger
            .issue_challenge(&user, &app, requirements(), 300)
            .await
            .unwrap();
        assert_eq!(challenge.requirements.challenge_nonce(), Some(challenge.nonce.as_str()));
        assert_eq!(challenge.amount_units, 2_000_000);

        ledger
            .claim_challenge(&challenge.nonce, &user, "x402:eip155:84532:0xaa", usd("2"))
            .await
            .unwrap();
        assert!(matches!(
            ledger
                .claim_challenge(&challenge.nonce, &user, "x402:eip155:84532:0xbb", usd("2"))
                .await,
            Err(LedgerError::ChallengeUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn authorization_replay_is_rejected_on_a_fresh_challenge() {
        let (ledger, user, app) = setup().await;
        let first = ledger.issue_challenge(&user, &app, requirements(), 300).await.unwrap();
        let second = ledger.issue_challenge(&user, &app, requirements(), 300).await.unwrap();
        ledger
            .claim_challenge(&first.nonce, &user, "x402:eip155:84532:0xaa", usd("2"))
            .await
            .unwrap();
        assert!(matches!(
            ledger
                .claim_challenge(&second.nonce, &user, "x402:eip155:84532:0xaa", usd("2"))
                .await,
            Err(LedgerError::PaymentReplay(_))
        ));
        // The rejected claim rolled back, so the second challenge is still usable.
        ledger
            .claim_challenge(&second.nonce, &user, "x402:eip155:84532:0xcc", usd("2"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expired_or_foreign_challenges_cannot_be_claimed() {
        let (ledger, user, app) = setup().await;
        let other = ledger.create_user(None).await.unwrap();
        let challenge = ledger.issue_challenge(&user, &app, requirements(), 300).await.unwrap();
        assert!(
            ledger
                .claim_challenge(&challenge.nonce, &other.id, "x402:a", usd("2"))
                .await
                .is_err()
        );

        let stale = ledger.issue_challenge(&user, &app, requirements(), 300).await.unwrap();
        sqlx::query("UPDATE x402_challenges SET expires_at = expires_at - 3600 WHERE nonce = ?")
            .bind(&stale.nonce)
            .execute(ledger.pool())
            .await
            .unwrap();
        assert!(matches!(
            ledger.claim_challenge(&stale.nonce, &user, "x402:b", usd("2")).await,
            Err(LedgerError::ChallengeUnavailable(_))
        ));
        assert_eq!(ledger.expire_challenges(900).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn settlement_and_refund_run_once() {
        let (ledger, user, app) = setup().await;
        let challenge = ledger.issue_challenge(&user, &app, requirements(), 300).await.unwrap();
        let (challenge, payment_id) = ledger
            .claim_challenge(&challenge.nonce, &user, "x402:eip155:84532:0xaa", usd("2"))
            .await
            .unwrap();
        let committed = ledger
            .commit_x402_charge(&x402_charge(&challenge, &payment_id, 1_350_000))
            .await
            .unwrap();
        let txn = &committed.transaction_id;
        assert_eq!(
            ledger.transaction(txn).await.unwrap().funding_source,
            FundingSource::X402
        );
        assert_eq!(ledger.pending_settlements().await.unwrap(), vec![txn.clone()]);

        assert!(matches!(ledger.begin_refund(txn).await.unwrap(), StepClaim::Busy(_)));
        let StepClaim::Proceed(record) = ledger.begin_settlement(txn).await.unwrap() else {
            panic!("first claim must proceed");
        };
        assert_eq!(record.refund_units, 650_000);
        assert!(matches!(ledger.begin_settlement(txn).await.unwrap(), StepClaim::Busy(_)));
        ledger.finish_settlement(txn, Ok("0xsettle")).await.unwrap();
        assert!(matches!(ledger.begin_settlement(txn).await.unwrap(), StepClaim::Done(_)));

        assert!(matches!(ledger.begin_refund(txn).await.unwrap(), StepClaim::Proceed(_)));
        let record = ledger.finish_refund(txn, Ok("0xrefund")).await.unwrap();
        assert_eq!(record.refund_state, RefundState::Sent);
        assert!(matches!(ledger.begin_refund(txn).await.unwrap(), StepClaim::Done(_)));
        assert!(ledger.pending_settlements().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_settlement_is_flagged_and_retryable() {
        let (ledger, user, app) = setup().await;
        let challenge = ledger.issue_challenge(&user, &app, requirements(), 300).await.unwrap();
        let (challenge, payment_id) = ledger
            .claim_challenge(&challenge.nonce, &user, "x402:eip155:84532:0xaa", usd("2"))
            .await
            .unwrap();
        let committed = ledger
            .commit_x402_charge(&x402_charge(&challenge, &payment_id, 2_000_000))
            .await
            .unwrap();
        let txn = &committed.transaction_id;

        ledger.begin_settlement(txn).await.unwrap();
        let record = ledger.finish_settlement(txn, Err("rpc timeout")).await.unwrap();
        assert_eq!(record.settle_state, SettleState::Failed);
        assert_eq!(record.refund_state, RefundState::NotRequired);
        let items = ledger.transactions_needing_reconciliation().await.unwrap();
        assert_eq!(items[0].kind, "settlement_failed");

        let StepClaim::Proceed(retry) = ledger.begin_settlement(txn).await.unwrap() else {
            panic!("failed settlement must be retryable");
        };
        assert_eq!(retry.attempts, 2);

        // A second failure refreshes the open item instead of adding another.
        ledger.finish_settlement(txn, Err("invalid signature")).await.unwrap();
        let items = ledger.transactions_needing_reconciliation().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].detail, "invalid signature");
    }

    #[tokio::test]
    async fn claimed_challenge_that_never_committed_is_failed_and_flagged() {
        let (ledger, user, app) = setup().await;
        let challenge = ledger.issue_challenge(&user, &app, requirements(), 300).await.unwrap();
        let (_, payment_id) = ledger
            .claim_challenge(&challenge.nonce, &user, "x402:eip155:84532:0xaa", usd("2"))
            .await
            .unwrap();

        // Still inside its lifetime: a slow call may yet commit.
        assert_eq!(ledger.expire_challenges(900).await.unwrap(), 0);

        sqlx::query("UPDATE x402_challenges SET expires_at = expires_at - 2000 WHERE nonce = ?")
            .bind(&challenge.nonce)
            .execute(ledger.pool())
            .await
            .unwrap();
        assert_eq!(ledger.expire_challenges(900).await.unwrap(), 1);
        assert_eq!(ledger.expire_challenges(900).await.unwrap(), 0);

        let status: String = sqlx::query_scalar("SELECT status FROM payments WHERE id = ?")
            .bind(&payment_id)
            .fetch_one(ledger.pool())
            .await
            .unwrap();
        assert_eq!(status, "failed");
        let items = ledger.transactions_needing_reconciliation().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, "unbilled_payment");
        assert_eq!(items[0].reference.as_deref(), Some(challenge.nonce.as_str()));
        assert_eq!(items[0].transaction_id, None);
    }

    #[tokio::test]
    async fn failed_challenge_fails_pending_payment() {
        let (ledger, user, app) = setup().await;
        let challenge = ledger.issue_challenge(&user, &app, requirements(), 300).await.unwrap();
        let (_, payment_id) = ledger
            .claim_challenge(&challenge.nonce, &user, "x402:a", usd("2"))
            .await
            .unwrap();
        assert!(ledger.fail_challenge(&challenge.nonce, "upstream 500").await.unwrap());
        assert!(!ledger.fail_challenge(&challenge.nonce, "again").await.unwrap());
        let status: String = sqlx::query_scalar("SELECT status FROM payments WHERE id = ?")
            .bind(&payment_id)
            .fetch_one(ledger.pool())
            .await
            .unwrap();
        assert_eq!(status, "failed");
    }
}
