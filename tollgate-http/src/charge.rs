//! The billing half of a proxied call.
//!
//! A [`PendingCharge`] is created once funding is secured and lives until the
//! response is fully delivered. Exactly one of [`PendingCharge::commit`] or
//! [`PendingCharge::abandon`] consumes it, so a call is billed once or not at
//! all.

use async_trait::async_trait;
use tollgate::BillingError;
use tollgate::credential::Principal;
use tollgate::money::{Usd, refund_units};
use tollgate::pricing::{CostBreakdown, Markup, TokenUsage};
use tollgate_ledger::{ChargeRecord, Reservation, X402Charge};

use crate::metering::{StreamEnd, StreamFinalizer};
use crate::paygate::PaidCall;
use crate::providers::ObservedUsage;
use crate::state::GatewayState;

/// What pays for a call.
#[derive(Debug, Clone)]
pub enum CallFunding {
    /// A hold on a spend pool or prepaid balance.
    Reserved(Reservation),
    /// A verified x402 payment.
    X402(PaidCall),
}

/// A committed call.
#[derive(Debug, Clone)]
pub struct BilledCall {
    /// Ledger transaction id.
    pub transaction_id: String,
    /// Cost actually collected.
    pub cost: CostBreakdown,
    /// `true` if the call was paid with x402 and still has to be settled.
    pub needs_settlement: bool,
}

/// A funded call that has not been billed yet.
#[derive(Debug)]
pub struct PendingCharge {
    gateway: GatewayState,
    principal: Principal,
    provider: &'static str,
    model: String,
    app_markup: Markup,
    estimated_input_tokens: u64,
    funding: CallFunding,
}

impl PendingCharge {
    /// Ties `funding` to the call it pays for.
    #[must_use]
    pub fn new(
        gateway: GatewayState,
        principal: Principal,
        provider: &'static str,
        model: String,
        app_markup: Markup,
        estimated_input_tokens: u64,
        funding: CallFunding,
    ) -> Self {
        Self {
            gateway,
            principal,
            provider,
            model,
            app_markup,
            estimated_input_tokens,
            funding,
        }
    }

    /// Pre-flight input estimate, used when the provider reports no usage.
    #[must_use]
    pub const fn estimated_input_tokens(&self) -> u64 {
        self.estimated_input_tokens
    }

    /// Bills `usage` against the call's funding.
    ///
    /// # Errors
    ///
    /// [`BillingError::Internal`] if the ledger write fails. The call is then
    /// flagged as `commit_failed` for reconciliation and its funding released,
    /// so an x402 authorization is never settled.
    pub async fn commit(self, usage: TokenUsage) -> Result<BilledCall, BillingError> {
        match self.write_charge(usage).await {
            Ok(billed) => Ok(billed),
            Err(err) => {
                self.flag_unbilled(usage, &err).await;
                Err(err)
            }
        }
    }

    async fn write_charge(&self, usage: TokenUsage) -> Result<BilledCall, BillingError> {
        let cost = self
            .gateway
            .costs
            .charge(&self.model, &usage, self.app_markup)?;
        let charge = ChargeRecord {
            user_id: self.principal.user_id.clone(),
            app_id: self.principal.app_id.clone(),
            api_key_id: self.principal.api_key_id.clone(),
            provider: self.provider.to_owned(),
            model: self.model.clone(),
            usage,
            cost,
        };

        match &self.funding {
            CallFunding::Reserved(reservation) => {
                let committed = self
                    .gateway
                    .ledger
                    .commit_charge(&reservation.id, &charge)
                    .await?;
                if committed.under_collected {
                    tracing::warn!(
                        transaction_id = %committed.transaction_id,
                        held = %reservation.amount,
                        cost = %cost.total_cost,
                        "Call cost more than its hold could cover"
                    );
                }
                Ok(BilledCall {
                    transaction_id: committed.transaction_id,
                    cost: committed.cost,
                    needs_settlement: false,
                })
            }
            CallFunding::X402(paid) => {
                let owed_uncapped = cost.total_cost.to_asset_units_ceil(paid.decimals)?;
                let under_collected = owed_uncapped > paid.paid_units;
                let owed_units = owed_uncapped.min(paid.paid_units);
                let collected = if under_collected {
                    cost.capped_at(Usd::from_asset_units(paid.paid_units, paid.decimals))
                } else {
                    cost
                };
                let committed = self
                    .gateway
                    .ledger
                    .commit_x402_charge(&X402Charge {
                        challenge_nonce: paid.challenge_nonce.clone(),
                        payment_id: paid.payment_id.clone(),
                        charge: ChargeRecord {
                            cost: collected,
                            ..charge
                        },
                        payer: paid.payer.clone(),
                        paid_units: paid.paid_units,
                        owed_units,
                        refund_units: refund_units(paid.paid_units, owed_units),
                        under_collected,
                        payload: paid.payload.clone(),
                        requirements: paid.requirements.clone(),
                    })
                    .await?;
                Ok(BilledCall {
                    transaction_id: committed.transaction_id,
                    cost: committed.cost,
                    needs_settlement: true,
                })
            }
        }
    }

    /// Records what a call that could not be billed consumed, then releases
    /// its funding.
    async fn flag_unbilled(self, usage: TokenUsage, err: &BillingError) {
        let reference = match &self.funding {
            CallFunding::Reserved(reservation) => reservation.id.clone(),
            CallFunding::X402(paid) => paid.challenge_nonce.clone(),
        };
        let owed = self
            .gateway
            .costs
            .charge(&self.model, &usage, self.app_markup)
            .map_or_else(|_| "unpriced".to_owned(), |cost| cost.total_cost.to_string());
        let detail = format!(
            "{err}; user {} app {} {}/{} used {} input and {} output tokens, owed {owed}",
            self.principal.user_id,
            self.principal.app_id,
            self.provider,
            self.model,
            usage.input_tokens,
            usage.output_tokens,
        );
        if let Err(flag_err) = self.gateway.ledger.flag_unbilled_call(&reference, &detail).await {
            tracing::error!(reference, error = %flag_err, %detail, "Failed to flag unbilled call");
        }
        self.abandon("billing failed").await;
    }

    /// Releases the call's funding without billing it.
    pub async fn abandon(self, reason: &str) {
        match self.funding {
            CallFunding::Reserved(reservation) => {
                match self.gateway.ledger.release_reservation(&reservation.id).await {
                    Ok(released) => tracing::info!(
                        reservation_id = %reservation.id,
                        released,
                        reason,
                        "Released hold"
                    ),
                    Err(err) => tracing::error!(
                        reservation_id = %reservation.id,
                        error = %err,
                        "Failed to release hold"
                    ),
                }
            }
            CallFunding::X402(paid) => match &self.gateway.paygate {
                Some(paygate) => paygate.abandon(paid, reason).await,
                None => tracing::error!(
                    nonce = %paid.challenge_nonce,
                    "x402 call abandoned with payments disabled"
                ),
            },
        }
    }

    /// Bills observed usage and, for x402 calls, settles in the background.
    async fn bill(self, usage: TokenUsage) {
        let gateway = self.gateway.clone();
        let user_id = self.principal.user_id.clone();
        match self.commit(usage).await {
            Ok(billed) => {
                tracing::info!(
                    transaction_id = %billed.transaction_id,
                    %user_id,
                    cost = %billed.cost.total_cost,
                    "Billed streamed call"
                );
                if billed.needs_settlement {
                    settle_in_background(&gateway, billed.transaction_id);
                }
            }
            Err(err) => tracing::error!(%user_id, error = %err, "Failed to bill streamed call"),
        }
    }
}

/// Settles an x402 transaction without holding up the caller.
pub fn settle_in_background(gateway: &GatewayState, transaction_id: String) {
    let gateway = gateway.clone();
    tokio::spawn(async move {
        let Some(engine) = &gateway.settlement else {
            tracing::error!(%transaction_id, "x402 transaction with no settlement engine");
            return;
        };
        if let Err(err) = engine.settle(&transaction_id).await {
            tracing::warn!(%transaction_id, error = %err, "Settlement deferred to reconcile");
        }
    });
}

#[async_trait]
impl StreamFinalizer for PendingCharge {
    async fn finalize(self: Box<Self>, usage: ObservedUsage, end: StreamEnd) {
        let estimated = self.estimated_input_tokens;
        match end {
            StreamEnd::Completed => self.bill(usage.resolve(estimated)).await,
            StreamEnd::Error | StreamEnd::Aborted
                if usage.produced_output() || usage.input_tokens.is_some() =>
            {
                tracing::info!(?end, ?usage, "Billing partial stream");
                self.bill(usage.resolve(estimated)).await;
            }
            StreamEnd::Error => self.abandon("stream failed before any output").await,
            StreamEnd::Aborted => self.abandon("caller left before any output").await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rust_decimal::Decimal;
    use serde_json::json;
    use tollgate::credential::{
        ApiKeyHasher, CredentialKind, CredentialVerifier, Scope, TokenAuthority,
    };
    use tollgate::pricing::{CostModel, ModelPrice, PriceTable};
    use tollgate::proto::PaymentPayload;
    use tollgate::proto::encoding::encode_header;
    use tollgate::settlement::Facilitator;
    use tollgate_ledger::{Ledger, NewApp};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::facilitator_client::FacilitatorClient;
    use crate::paygate::{Paygate, X402Config};
    use crate::providers::RoutingTable;
    use crate::settlement::SettlementEngine;
    use crate::state::Gateway;

    fn usd(s: &str) -> Usd {
        Usd::parse(s).unwrap()
    }

    fn costs() -> CostModel {
        let prices = PriceTable::new().with_model(
            "gpt-4o",
            ModelPrice {
                input_per_million: usd("2"),
                output_per_million: usd("10"),
                cached_input_per_million: None,
            },
        );
        CostModel::new(prices, Markup::NONE, 4096)
    }

    fn gateway(ledger: &Ledger, facilitator: Option<&MockServer>) -> GatewayState {
        let verifier = CredentialVerifier::new(
            TokenAuthority::new(b"jwt-secret", "tollgate", None),
            ApiKeyHasher::new(b"pepper".to_vec()),
            Arc::new(ledger.clone()),
        );
        let mut gateway = Gateway::new(
            ledger.clone(),
            verifier,
            costs(),
            RoutingTable::new(),
            reqwest::Client::new(),
        );
        if let Some(facilitator) = facilitator {
            let client: Arc<dyn Facilitator> =
                Arc::new(FacilitatorClient::try_from(facilitator.uri()).unwrap());
            let config = X402Config {
                network: "eip155:84532".into(),
                asset: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".into(),
                decimals: 6,
                pay_to: "0xPayee".into(),
                asset_name: "USDC".into(),
                asset_version: "2".into(),
                max_timeout_seconds: 300,
                challenge_ttl_secs: 300,
            };
            gateway = gateway.with_x402(
                Paygate::new(ledger.clone(), Arc::clone(&client), config),
                SettlementEngine::new(ledger.clone(), client),
            );
        }
        Arc::new(gateway)
    }

    async fn principal(ledger: &Ledger) -> Principal {
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
        Principal {
            user_id: user.id,
            app_id: app.id,
            scope: Scope::all(),
            api_key_id: None,
            kind: CredentialKind::ApiKey,
        }
    }

    /// Makes every transaction insert fail, as a full disk would.
    async fn break_transactions(ledger: &Ledger) {
        sqlx::query(
            "CREATE TRIGGER no_transactions BEFORE INSERT ON transactions \
             BEGIN SELECT RAISE(ABORT, 'database or disk is full'); END",
        )
        .execute(ledger.pool())
        .await
        .unwrap();
    }

    fn pending(gateway: &GatewayState, principal: &Principal, funding: CallFunding) -> PendingCharge {
        PendingCharge::new(
            Arc::clone(gateway),
            principal.clone(),
            "openai",
            "gpt-4o".into(),
            Markup::NONE,
            100,
            funding,
        )
    }

    #[tokio::test]
    async fn failed_commit_on_a_hold_is_flagged_and_released() {
        let ledger = Ledger::in_memory().await.unwrap();
        let gateway = gateway(&ledger, None);
        let principal = principal(&ledger).await;
        ledger.credit_user(&principal.user_id, usd("1"), "topup").await.unwrap();
        let reservation = ledger
            .reserve_from_user(&principal.user_id, &principal.app_id, usd("0.5"))
            .await
            .unwrap()
            .unwrap();
        break_transactions(&ledger).await;

        let err = pending(&gateway, &principal, CallFunding::Reserved(reservation.clone()))
            .commit(TokenUsage::new(1_000, 500))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Internal(_)));

        let items = ledger.transactions_needing_reconciliation().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, "commit_failed");
        assert_eq!(items[0].reference.as_deref(), Some(reservation.id.as_str()));
        assert!(items[0].detail.contains("owed 0.007"), "{}", items[0].detail);

        let balance = ledger.user_balance(&principal.user_id).await.unwrap();
        assert_eq!(balance.balance, usd("1"));
    }

    #[tokio::test]
    async fn failed_commit_on_x402_fails_the_payment_unsettled() {
        let facilitator = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "isValid": true, "payer": "0xPayer" })),
            )
            .mount(&facilitator)
            .await;
        let ledger = Ledger::in_memory().await.unwrap();
        let gateway = gateway(&ledger, Some(&facilitator));
        let principal = principal(&ledger).await;
        let Some(paygate) = &gateway.paygate else {
            panic!("x402 gateway has a paygate");
        };
        let challenge = *paygate
            .challenge(&principal, usd("0.5"), None)
            .await
            .unwrap()
            .challenge
            .unwrap();
        let payload = PaymentPayload {
            x402_version: 2,
            payload: json!({
                "signature": "0xsig",
                "authorization": {
                    "from": "0xPayer",
                    "to": "0xpayee",
                    "value": challenge.amount,
                    "validAfter": 0,
                    "validBefore": 4_000_000_000u64,
                    "nonce": "0x07"
                }
            }),
            accepted: challenge.accepts[0].clone(),
            resource: None,
            extensions: None,
        };
        let paid = paygate
            .accept(&principal, &encode_header(&payload).unwrap())
            .await
            .unwrap();
        let payment_id = paid.payment_id.clone();
        break_transactions(&ledger).await;

        pending(&gateway, &principal, CallFunding::X402(paid))
            .commit(TokenUsage::new(1_000, 500))
            .await
            .unwrap_err();

        let items = ledger.transactions_needing_reconciliation().await.unwrap();
        assert_eq!(items[0].kind, "commit_failed");
        assert_eq!(items[0].reference.as_deref(), Some(challenge.nonce.as_str()));
        let status: String = sqlx::query_scalar("SELECT status FROM payments WHERE id = ?")
            .bind(&payment_id)
            .fetch_one(ledger.pool())
            .await
            .unwrap();
        assert_eq!(status, "failed");
        assert!(ledger.pending_settlements().await.unwrap().is_empty());
        assert!(
            facilitator
                .received_requests()
                .await
                .unwrap()
                .iter()
                .all(|request| request.url.path() != "/settle")
        );
    }
}
