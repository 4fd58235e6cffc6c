//! Card top-ups delivered by the payment processor's webhook.

use tollgate::money::Usd;

use crate::{Ledger, LedgerError, new_id, now, units};

/// Where a completed top-up is credited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreditTarget {
    /// A user's prepaid balance.
    User(String),
    /// An app's spend pool.
    SpendPool(String),
}

/// What the processor reports about a checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardPaymentOutcome {
    /// Funds captured; credit the target.
    Completed,
    /// Checkout expired or the charge failed.
    Failed,
    /// Still waiting on the customer or the bank.
    Pending,
}

/// A normalized payment webhook event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardPaymentEvent {
    /// Processor event id, used for idempotency.
    pub event_id: String,
    /// Processor event type, kept for auditing.
    pub event_type: String,
    /// Processor payment id (e.g. the checkout session id).
    pub external_id: String,
    /// Who gets credited.
    pub target: CreditTarget,
    /// Amount paid.
    pub amount: Usd,
    /// Reported state.
    pub outcome: CardPaymentOutcome,
}

/// What applying a webhook event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The event changed the ledger.
    Applied,
    /// The event id was already processed.
    Duplicate,
    /// The event was recorded but had no effect on balances.
    Ignored,
}

impl Ledger {
    /// Applies a webhook event at most once per event id and credits each
    /// external payment at most once.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] if the target user or app does not
    /// exist, which rolls the event back so the processor retries it.
    pub async fn apply_card_payment(
        &self,
        event: &CardPaymentEvent,
    ) -> Result<WebhookOutcome, LedgerError> {
        if event.amount.is_negative() {
            return Err(LedgerError::InvalidArgument(format!(
                "payment amount {} must not be negative",
                event.amount
            )));
        }
        let ts = now();
        let amount_units = units(event.amount)?;
        let mut tx = self.pool.begin().await?;
        let fresh = sqlx::query(
            "INSERT INTO webhook_events (event_id, event_type, received_at) VALUES (?, ?, ?) \
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(ts)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if fresh == 0 {
            tracing::debug!(event_id = %event.event_id, "Duplicate webhook event");
            return Ok(WebhookOutcome::Duplicate);
        }

        let (user_id, app_id) = match &event.target {
            CreditTarget::User(user) => (Some(user.as_str()), None),
            CreditTarget::SpendPool(app) => (None, Some(app.as_str())),
        };
        sqlx::query(
            "INSERT INTO payments (id, external_id, user_id, app_id, kind, amount, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, 'card', ?, 'pending', ?, ?) \
             ON CONFLICT (external_id) DO NOTHING",
        )
        .bind(new_id("pay"))
        .bind(&event.external_id)
        .bind(user_id)
        .bind(app_id)
        .bind(amount_units)
        .bind(ts)
        .bind(ts)
        .execute(&mut *tx)
        .await
        .map_err(|err| crate::accounts::foreign_key_to_not_found(err, "payment target"))?;

        let outcome = match event.outcome {
            CardPaymentOutcome::Completed => {
                let transitioned = sqlx::query(
                    "UPDATE payments SET status = 'completed', amount = ?, updated_at = ? \
                     WHERE external_id = ? AND status != 'completed'",
                )
                .bind(amount_units)
                .bind(ts)
                .bind(&event.external_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if transitioned == 0 {
                    WebhookOutcome::Ignored
                } else {
                    let credited = match &event.target {
                        CreditTarget::User(user) => {
                            sqlx::query("UPDATE users SET total_paid = total_paid + ? WHERE id = ?")
                                .bind(amount_units)
                                .bind(user)
                                .execute(&mut *tx)
                                .await?
                                .rows_affected()
                        }
                        CreditTarget::SpendPool(app) => {
                            sqlx::query(
                                "INSERT INTO spend_pools (app_id, total_funded) VALUES (?, ?) \
                                 ON CONFLICT (app_id) DO UPDATE SET total_funded = total_funded + excluded.total_funded",
                            )
                            .bind(app)
                            .bind(amount_units)
                            .execute(&mut *tx)
                            .await
                            .map_err(|err| crate::accounts::foreign_key_to_not_found(err, "app"))?
                            .rows_affected()
                        }
                    };
                    if credited == 0 {
                        return Err(LedgerError::NotFound(format!("{:?}", event.target)));
                    }
                    WebhookOutcome::Applied
                }
            }
            CardPaymentOutcome::Failed => {
                let failed = sqlx::query(
                    "UPDATE payments SET status = 'failed', updated_at = ? \
                     WHERE external_id = ? AND status = 'pending'",
                )
                .bind(ts)
                .bind(&event.external_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if failed == 0 {
                    WebhookOutcome::Ignored
                } else {
                    WebhookOutcome::Applied
                }
            }
            CardPaymentOutcome::Pending => WebhookOutcome::Ignored,
        };
        tx.commit().await?;
        tracing::info!(
            event_id = %event.event_id,
            external_id = %event.external_id,
            amount = %event.amount,
            ?outcome,
            "Payment webhook applied"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usd(s: &str) -> Usd {
        Usd::parse(s).unwrap()
    }

    fn event(event_id: &str, external_id: &str, user: &str, outcome: CardPaymentOutcome) -> CardPaymentEvent {
        CardPaymentEvent {
            event_id: event_id.into(),
            event_type: "checkout.session.completed".into(),
            external_id: external_id.into(),
            target: CreditTarget::User(user.into()),
            amount: usd("25"),
            outcome,
        }
    }

    #[tokio::test]
    async fn duplicate_events_credit_once() {
        let ledger = Ledger::in_memory().await.unwrap();
        let user = ledger.create_user(None).await.unwrap();
        let completed = event("evt_1", "cs_1", &user.id, CardPaymentOutcome::Completed);

        assert_eq!(ledger.apply_card_payment(&completed).await.unwrap(), WebhookOutcome::Applied);
        assert_eq!(ledger.apply_card_payment(&completed).await.unwrap(), WebhookOutcome::Duplicate);
        // A different event for the same checkout does not credit again.
        let redelivered = event("evt_2", "cs_1", &user.id, CardPaymentOutcome::Completed);
        assert_eq!(ledger.apply_card_payment(&redelivered).await.unwrap(), WebhookOutcome::Ignored);

        assert_eq!(ledger.user_balance(&user.id).await.unwrap().balance, usd("25"));
    }

    #[tokio::test]
    async fn failed_checkout_never_credits() {
        let ledger = Ledger::in_memory().await.unwrap();
        let user = ledger.create_user(None).await.unwrap();
        let expired = event("evt_1", "cs_1", &user.id, CardPaymentOutcome::Failed);
        assert_eq!(ledger.apply_card_payment(&expired).await.unwrap(), WebhookOutcome::Applied);
        assert_eq!(ledger.user_balance(&user.id).await.unwrap().balance, Usd::ZERO);
    }

    #[tokio::test]
    async fn unknown_user_rolls_back_the_event() {
        let ledger = Ledger::in_memory().await.unwrap();
        let completed = event("evt_1", "cs_1", "usr_missing", CardPaymentOutcome::Completed);
        assert!(matches!(
            ledger.apply_card_payment(&completed).await,
            Err(LedgerError::NotFound(_))
        ));
        let user = ledger.create_user(None).await.unwrap();
        let retried = event("evt_1", "cs_1", &user.id, CardPaymentOutcome::Completed);
        assert_eq!(ledger.apply_card_payment(&retried).await.unwrap(), WebhookOutcome::Applied);
    }
}
