//! Settlement engine: executes committed x402 charges and refunds overpayments.
//!
//! Each step is claimed in the ledger before it runs, so settling the same
//! transaction twice (a retry, a reconcile run racing a request) calls the
//! facilitator once and returns the stored receipt afterwards.

use std::sync::Arc;

use tollgate::BillingError;
use tollgate::flow::{X402Event, X402State};
use tollgate::proto::{SettleRequest, SettleResponse};
use tollgate::settlement::{Facilitator, RefundRequest, RefundSender};
use tollgate_ledger::{Ledger, RefundState, SettlementRecord, StepClaim};

/// Drives the settle and refund steps of x402 transactions.
#[derive(Debug, Clone)]
pub struct SettlementEngine {
    ledger: Ledger,
    facilitator: Arc<dyn Facilitator>,
    refunds: Option<Arc<dyn RefundSender>>,
}

/// Result of a reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Transactions now settled and refunded (or owing nothing back).
    pub completed: Vec<String>,
    /// Transactions whose settle or refund step failed again.
    pub failed: Vec<(String, String)>,
}

impl SettlementEngine {
    /// An engine without a refund sender; overpayments are flagged for an operator.
    #[must_use]
    pub fn new(ledger: Ledger, facilitator: Arc<dyn Facilitator>) -> Self {
        Self {
            ledger,
            facilitator,
            refunds: None,
        }
    }

    /// Sends overpayment refunds through `sender`.
    #[must_use]
    pub fn with_refund_sender(mut self, sender: Arc<dyn RefundSender>) -> Self {
        self.refunds = Some(sender);
        self
    }

    /// Settles `transaction_id` with the facilitator, then refunds any
    /// overpayment. Returns the settlement receipt.
    ///
    /// # Errors
    ///
    /// [`BillingError::SettlementFailed`] if the facilitator rejects or cannot
    /// be reached, or another worker holds the step. Refund failures are
    /// logged and flagged, never returned.
    #[tracing::instrument(name = "x402.settle", skip(self))]
    pub async fn settle(&self, transaction_id: &str) -> Result<SettleResponse, BillingError> {
        let record = match self.ledger.begin_settlement(transaction_id).await? {
            StepClaim::Done(record) => {
                tracing::debug!("Settlement already recorded");
                self.refund_logged(transaction_id).await;
                return Ok(receipt(&record));
            }
            StepClaim::Busy(_) => {
                return Err(BillingError::SettlementFailed {
                    transaction_id: transaction_id.to_owned(),
                    reason: "settlement already in progress".to_owned(),
                });
            }
            StepClaim::Proceed(record) => record,
        };

        let state = X402State::Verified {
            payer: record.payer.clone(),
            authorized_units: record.paid_units,
        };
        let request = SettleRequest::new(record.payload.clone(), record.requirements.clone());
        let outcome = match self.facilitator.settle(&request, transaction_id).await {
            Ok(SettleResponse::Success { transaction, .. }) => Ok(transaction),
            Ok(SettleResponse::Error { reason, .. }) => Err(reason),
            Err(err) => Err(format!("facilitator unavailable: {err}")),
        };

        match outcome {
            Ok(hash) => {
                let record = self.ledger.finish_settlement(transaction_id, Ok(&hash)).await?;
                let state = advance(
                    state,
                    X402Event::Settle {
                        owed_units: record.owed_units,
                        transaction: hash,
                    },
                );
                let refunded_units = self.refund_logged(transaction_id).await;
                let state = match refunded_units {
                    Some(refunded_units) => advance(state, X402Event::Complete { refunded_units }),
                    None => advance(
                        state,
                        X402Event::Fail {
                            reason: "refund pending".to_owned(),
                        },
                    ),
                };
                tracing::info!(
                    payer = %record.payer,
                    owed_units = record.owed_units,
                    refund_units = record.refund_units,
                    %state,
                    "x402 settlement completed"
                );
                Ok(receipt(&record))
            }
            Err(reason) => {
                self.ledger
                    .finish_settlement(transaction_id, Err(&reason))
                    .await?;
                let state = advance(
                    state,
                    X402Event::Fail {
                        reason: reason.clone(),
                    },
                );
                tracing::error!(%reason, %state, "x402 settlement failed; flagged for reconciliation");
                Err(BillingError::SettlementFailed {
                    transaction_id: transaction_id.to_owned(),
                    reason,
                })
            }
        }
    }

    /// Sends the refund of a settled transaction. Returns the units refunded,
    /// zero when nothing was owed back.
    ///
    /// # Errors
    ///
    /// [`BillingError::RefundFailed`] if no refund sender is configured, the
    /// transfer fails, or another worker holds the step.
    #[tracing::instrument(name = "x402.refund", skip(self))]
    pub async fn refund(&self, transaction_id: &str) -> Result<u64, BillingError> {
        let record = match self.ledger.begin_refund(transaction_id).await? {
            StepClaim::Done(record) => return Ok(refunded(&record)),
            StepClaim::Busy(record) => {
                let reason = if record.refund_state == RefundState::InFlight {
                    "refund already in progress"
                } else {
                    "transaction is not settled"
                };
                return Err(BillingError::RefundFailed {
                    transaction_id: transaction_id.to_owned(),
                    reason: reason.to_owned(),
                });
            }
            StepClaim::Proceed(record) => record,
        };

        let Some(sender) = &self.refunds else {
            return self
                .fail_refund(transaction_id, "no refund sender configured".to_owned())
                .await;
        };
        let request = RefundRequest {
            idempotency_key: transaction_id.to_owned(),
            network: record.requirements.network.clone(),
            asset: record.requirements.asset.clone(),
            to: record.payer.clone(),
            amount_units: record.refund_units,
        };
        match sender.send_refund(&request).await {
            Ok(refund_receipt) => {
                self.ledger
                    .finish_refund(transaction_id, Ok(&refund_receipt.transaction))
                    .await?;
                tracing::info!(
                    to = %request.to,
                    amount_units = request.amount_units,
                    refund_tx = %refund_receipt.transaction,
                    "Overpayment refunded"
                );
                Ok(record.refund_units)
            }
            Err(err) => self.fail_refund(transaction_id, err.to_string()).await,
        }
    }

    /// Retries every settlement or refund left pending, failed or abandoned.
    ///
    /// # Errors
    ///
    /// [`BillingError::Internal`] if the ledger cannot be read.
    pub async fn reconcile_pending(&self) -> Result<ReconcileReport, BillingError> {
        let mut report = ReconcileReport::default();
        for transaction_id in self.ledger.pending_settlements().await? {
            if let Err(err) = self.settle(&transaction_id).await {
                report.failed.push((transaction_id, err.to_string()));
                continue;
            }
            let record = self.ledger.settlement(&transaction_id).await?;
            if matches!(record.refund_state, RefundState::Sent | RefundState::NotRequired) {
                report.completed.push(transaction_id);
            } else {
                report
                    .failed
                    .push((transaction_id, format!("refund {}", record.refund_state)));
            }
        }
        tracing::info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            "Settlement reconcile pass finished"
        );
        Ok(report)
    }

    async fn refund_logged(&self, transaction_id: &str) -> Option<u64> {
        match self.refund(transaction_id).await {
            Ok(units) => Some(units),
            Err(err) => {
                tracing::error!(error = %err, alert = true, "Refund failed; flagged for reconciliation");
                None
            }
        }
    }

    async fn fail_refund(&self, transaction_id: &str, reason: String) -> Result<u64, BillingError> {
        self.ledger
            .finish_refund(transaction_id, Err(&reason))
            .await?;
        Err(BillingError::RefundFailed {
            transaction_id: transaction_id.to_owned(),
            reason,
        })
    }
}

fn advance(state: X402State, event: X402Event) -> X402State {
    let from = state.name();
    state.apply(event).unwrap_or_else(|err| {
        tracing::error!(error = %err, "Unexpected x402 transition");
        X402State::Failed {
            stage: from,
            reason: err.to_string(),
        }
    })
}

fn receipt(record: &SettlementRecord) -> SettleResponse {
    SettleResponse::Success {
        payer: record.payer.clone(),
        transaction: record.settle_tx.clone().unwrap_or_default(),
        network: record.requirements.network.clone(),
    }
}

const fn refunded(record: &SettlementRecord) -> u64 {
    match record.refund_state {
        RefundState::Sent => record.refund_units,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use serde_json::json;
    use tollgate::money::{Usd, refund_units};
    use tollgate::pricing::{CostBreakdown, Markup, TokenUsage};
    use tollgate::proto::{PaymentPayload, PaymentRequirements, VerifyRequest, VerifyResponse};
    use tollgate::settlement::{BoxError, RefundReceipt};
    use tollgate_ledger::{ChargeRecord, NewApp, SettleState, X402Charge};

    use crate::facilitator_client::FacilitatorClient;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Default)]
    struct RecordingRefunds(Mutex<Vec<RefundRequest>>);

    #[async_trait]
    impl RefundSender for RecordingRefunds {
        async fn send_refund(&self, refund: &RefundRequest) -> Result<RefundReceipt, BoxError> {
            self.0.lock().unwrap().push(refund.clone());
            Ok(RefundReceipt {
                transaction: "0xrefund".into(),
            })
        }
    }

    #[derive(Debug)]
    struct DownFacilitator;

    #[async_trait]
    impl Facilitator for DownFacilitator {
        async fn verify(&self, _: &VerifyRequest) -> Result<VerifyResponse, BoxError> {
            Err("connection refused".into())
        }
        async fn settle(&self, _: &SettleRequest, _: &str) -> Result<SettleResponse, BoxError> {
            Err("connection refused".into())
        }
    }

    fn requirements(amount: u64) -> PaymentRequirements {
        serde_json::from_value(json!({
            "scheme": "exact",
            "network": "eip155:8453",
            "asset": "0xusdc",
            "amount": amount.to_string(),
            "payTo": "0xpayee",
            "maxTimeoutSeconds": 300
        }))
        .unwrap()
    }

    /// Commits an x402 charge of $2.00 authorized, $1.35 owed.
    async fn committed(ledger: &Ledger) -> String {
        let user = ledger.create_user(None).await.unwrap();
        let app = ledger
            .create_app(NewApp {
                name: "app".into(),
                markup: Markup::NONE,
                owner_user_id: user.id.clone(),
                referrer_user_id: None,
                referral_share: Decimal::ZERO,
            })
            .await
            .unwrap();
        let challenge = ledger
            .issue_challenge(&user.id, &app.id, requirements(2_000_000), 300)
            .await
            .unwrap();
        let (_, payment_id) = ledger
            .claim_challenge(
                &challenge.nonce,
                &user.id,
                "x402:eip155:8453:0x01",
                Usd::parse("2").unwrap(),
            )
            .await
            .unwrap();
        let owed = 1_350_000;
        let charge = X402Charge {
            challenge_nonce: challenge.nonce.clone(),
            payment_id,
            charge: ChargeRecord {
                user_id: user.id.clone(),
                app_id: app.id.clone(),
                api_key_id: None,
                provider: "openai".into(),
                model: "gpt-4o".into(),
                usage: TokenUsage::new(100, 100),
                cost: CostBreakdown::compute(Usd::parse("1.35").unwrap(), Markup::NONE, Markup::NONE),
            },
            payer: "0xpayer".into(),
            paid_units: 2_000_000,
            owed_units: owed,
            refund_units: refund_units(2_000_000, owed),
            under_collected: false,
            payload: PaymentPayload {
                x402_version: 2,
                payload: json!({}),
                accepted: challenge.requirements.clone(),
                resource: None,
                extensions: None,
            },
            requirements: challenge.requirements,
        };
        ledger.commit_x402_charge(&charge).await.unwrap().transaction_id
    }

    #[tokio::test]
    async fn settles_once_and_refunds_overpayment() {
        let ledger = Ledger::in_memory().await.unwrap();
        let transaction_id = committed(&ledger).await;

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/settle"))
            .and(header("idempotency-key", transaction_id.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "transaction": "0xsettled",
                "network": "eip155:8453",
                "payer": "0xpayer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let refunds = Arc::new(RecordingRefunds::default());
        let engine = SettlementEngine::new(
            ledger.clone(),
            Arc::new(FacilitatorClient::try_from(server.uri()).unwrap()),
        )
        .with_refund_sender(refunds.clone());

        let first = engine.settle(&transaction_id).await.unwrap();
        let second = engine.settle(&transaction_id).await.unwrap();
        assert_eq!(first, second);

        let sent = refunds.0.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].amount_units, 650_000);
        assert_eq!(sent[0].to, "0xpayer");
        assert_eq!(sent[0].idempotency_key, transaction_id);

        let record = ledger.settlement(&transaction_id).await.unwrap();
        assert_eq!(record.settle_state, SettleState::Settled);
        assert_eq!(record.refund_state, RefundState::Sent);
    }

    #[tokio::test]
    async fn facilitator_outage_flags_transaction() {
        let ledger = Ledger::in_memory().await.unwrap();
        let transaction_id = committed(&ledger).await;
        let engine = SettlementEngine::new(ledger.clone(), Arc::new(DownFacilitator));

        let err = engine.settle(&transaction_id).await.unwrap_err();
        assert!(matches!(err, BillingError::SettlementFailed { .. }));
        let flagged = ledger.transactions_needing_reconciliation().await.unwrap();
        assert!(flagged.iter().any(|item| item.transaction_id.as_deref() == Some(transaction_id.as_str())
            && item.kind == "settlement_failed"));
        assert_eq!(ledger.pending_settlements().await.unwrap(), vec![transaction_id]);
    }

    #[tokio::test]
    async fn missing_refund_sender_is_flagged_not_fatal() {
        let ledger = Ledger::in_memory().await.unwrap();
        let transaction_id = committed(&ledger).await;

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/settle"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "transaction": "0xsettled",
                "network": "eip155:8453"
            })))
            .mount(&server)
            .await;
        let engine = SettlementEngine::new(
            ledger.clone(),
            Arc::new(FacilitatorClient::try_from(server.uri()).unwrap()),
        );

        assert!(engine.settle(&transaction_id).await.is_ok());
        let record = ledger.settlement(&transaction_id).await.unwrap();
        assert_eq!(record.refund_state, RefundState::Failed);

        let report = engine.reconcile_pending().await.unwrap();
        assert_eq!(report.failed.len(), 1);
    }
}
