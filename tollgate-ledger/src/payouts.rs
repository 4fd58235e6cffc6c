//! Markup and referral payouts.
//!
//! Every committed charge with a non-zero app markup accrues pending payout
//! rows. Operators pay them out per recipient in batches.

use tollgate::money::Usd;

use crate::records::{PayoutBatch, PayoutSummary, RecipientKind};
use crate::{Ledger, LedgerError, new_id, now};

impl Ledger {
    /// Pending payouts grouped by recipient, largest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on failure.
    pub async fn pending_payouts(&self) -> Result<Vec<PayoutSummary>, LedgerError> {
        let rows = sqlx::query_as::<_, (String, String, i64, i64)>(
            "SELECT recipient_kind, recipient_id, SUM(amount), COUNT(*) FROM payouts \
             WHERE status = 'pending' GROUP BY recipient_kind, recipient_id \
             ORDER BY SUM(amount) DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(kind, recipient_id, amount, count)| {
                Ok(PayoutSummary {
                    recipient_kind: RecipientKind::parse(&kind)?,
                    recipient_id,
                    amount: Usd::from_ledger_units(amount),
                    count,
                })
            })
            .collect()
    }

    /// Marks every pending payout of one recipient as paid under a new batch.
    /// Returns `None` when nothing was pending.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on failure.
    pub async fn complete_payout_batch(
        &self,
        recipient_kind: RecipientKind,
        recipient_id: &str,
    ) -> Result<Option<PayoutBatch>, LedgerError> {
        let batch_id = new_id("batch");
        let mut tx = self.pool.begin().await?;
        let count = sqlx::query(
            "UPDATE payouts SET status = 'completed', batch_id = ?, paid_at = ? \
             WHERE status = 'pending' AND recipient_kind = ? AND recipient_id = ?",
        )
        .bind(&batch_id)
        .bind(now())
        .bind(recipient_kind.as_str())
        .bind(recipient_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if count == 0 {
            return Ok(None);
        }
        let amount = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(amount), 0) FROM payouts WHERE batch_id = ?",
        )
        .bind(&batch_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        let batch = PayoutBatch {
            batch_id,
            recipient_kind,
            recipient_id: recipient_id.to_owned(),
            amount: Usd::from_ledger_units(amount),
            count: i64::try_from(count).unwrap_or(i64::MAX),
        };
        tracing::info!(
            batch_id = %batch.batch_id,
            recipient = %recipient_id,
            amount = %batch.amount,
            count = batch.count,
            "Payout batch completed"
        );
        Ok(Some(batch))
    }
}
