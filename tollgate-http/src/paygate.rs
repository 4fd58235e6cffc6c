//! On-demand x402 payments: issuing 402 challenges and accepting the paid
//! resubmission.
//!
//! A challenge and its answer arrive as two separate requests. The first ends
//! in [`Paygate::challenge`], which stores the nonce; the second carries an
//! `X-Payment` header that [`Paygate::accept`] checks, claims and verifies
//! with the facilitator before anything is forwarded upstream.

use std::sync::Arc;

use serde_json::json;
use tollgate::BillingError;
use tollgate::credential::Principal;
use tollgate::flow::{X402Event, X402State};
use tollgate::money::Usd;
use tollgate::proto::encoding::decode_header;
use tollgate::proto::{
    PaymentChallenge, PaymentPayload, PaymentRequirements, ResourceInfo, SCHEME_EXACT,
    VerifyRequest, VerifyResponse, X402_VERSION,
};
use tollgate::settlement::Facilitator;
use tollgate_ledger::Ledger;

use crate::error::ApiError;

/// What the server asks callers to pay with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X402Config {
    /// CAIP-2 network, e.g. `eip155:8453`.
    pub network: String,
    /// Token contract address.
    pub asset: String,
    /// Token decimals.
    pub decimals: u8,
    /// Address receiving payments.
    pub pay_to: String,
    /// EIP-712 domain name of the token, sent in `extra.name`.
    pub asset_name: String,
    /// EIP-712 domain version of the token, sent in `extra.version`.
    pub asset_version: String,
    /// Validity window callers may sign for.
    pub max_timeout_seconds: u64,
    /// How long a challenge nonce stays claimable.
    pub challenge_ttl_secs: u64,
}

/// A verified on-demand payment attached to one call.
#[derive(Debug, Clone)]
pub struct PaidCall {
    /// Challenge the payment answers.
    pub challenge_nonce: String,
    /// Ledger payment row.
    pub payment_id: String,
    /// Payer address.
    pub payer: String,
    /// Units authorized.
    pub paid_units: u64,
    /// Token decimals.
    pub decimals: u8,
    /// Signed payload.
    pub payload: PaymentPayload,
    /// Requirements verified against.
    pub requirements: PaymentRequirements,
    /// Where the payment stands.
    pub state: X402State,
}

/// Issues and accepts x402 payments.
#[derive(Debug, Clone)]
pub struct Paygate {
    ledger: Ledger,
    facilitator: Arc<dyn Facilitator>,
    config: X402Config,
}

impl Paygate {
    /// Creates a paygate.
    #[must_use]
    pub fn new(ledger: Ledger, facilitator: Arc<dyn Facilitator>, config: X402Config) -> Self {
        Self {
            ledger,
            facilitator,
            config,
        }
    }

    /// Payment settings.
    #[must_use]
    pub const fn config(&self) -> &X402Config {
        &self.config
    }

    /// Records a challenge for `amount` and returns the 402 to send.
    ///
    /// # Errors
    ///
    /// [`BillingError::Internal`] if the ledger fails.
    pub async fn challenge(
        &self,
        principal: &Principal,
        amount: Usd,
        resource: Option<ResourceInfo>,
    ) -> Result<ApiError, BillingError> {
        let amount_units = amount.to_asset_units_ceil(self.config.decimals)?;
        let requirements = PaymentRequirements {
            scheme: SCHEME_EXACT.to_owned(),
            network: self.config.network.clone(),
            asset: self.config.asset.clone(),
            amount: amount_units.to_string(),
            pay_to: self.config.pay_to.clone(),
            max_timeout_seconds: self.config.max_timeout_seconds,
            extra: json!({
                "name": self.config.asset_name,
                "version": self.config.asset_version,
            }),
        };
        let record = self
            .ledger
            .issue_challenge(
                &principal.user_id,
                &principal.app_id,
                requirements,
                self.config.challenge_ttl_secs,
            )
            .await?;
        let state = X402State::NoPaymentOffered
            .apply(X402Event::IssueChallenge {
                nonce: record.nonce.clone(),
                amount_units,
                expires_at: record.expires_at,
            })
            .map_err(BillingError::internal)?;
        tracing::info!(
            user_id = %principal.user_id,
            app_id = %principal.app_id,
            nonce = %record.nonce,
            amount_units,
            %state,
            "Issued payment challenge"
        );

        let challenge = PaymentChallenge {
            x402_version: X402_VERSION,
            error: None,
            amount: record.requirements.amount.clone(),
            amount_usd: amount,
            asset: record.requirements.asset.clone(),
            pay_to: record.requirements.pay_to.clone(),
            nonce: record.nonce,
            expires_at: record.expires_at,
            resource,
            accepts: vec![record.requirements],
        };
        Ok(ApiError::payment_required(
            BillingError::InsufficientFunds { required: amount },
            challenge,
        ))
    }

    /// Checks an `X-Payment` header against its challenge, claims the challenge
    /// and verifies the authorization with the facilitator.
    ///
    /// # Errors
    ///
    /// [`BillingError::PaymentVerificationFailed`] for every rejected payload.
    #[tracing::instrument(name = "x402.accept", skip_all, fields(user_id = %principal.user_id))]
    pub async fn accept(
        &self,
        principal: &Principal,
        header: &str,
    ) -> Result<PaidCall, BillingError> {
        let payload: PaymentPayload = decode_header(header)
            .map_err(|err| BillingError::payment(format!("invalid X-Payment header: {err}")))?;
        if payload.x402_version != X402_VERSION {
            return Err(BillingError::payment(format!(
                "unsupported x402 version {}",
                payload.x402_version
            )));
        }
        let nonce = payload
            .accepted
            .challenge_nonce()
            .ok_or_else(|| BillingError::payment("accepted requirements carry no challenge nonce"))?
            .to_owned();
        let challenge = self
            .ledger
            .challenge(&nonce)
            .await?
            .ok_or_else(|| BillingError::payment("unknown payment challenge"))?;
        if challenge.app_id != principal.app_id || challenge.user_id != principal.user_id {
            return Err(BillingError::payment("challenge was issued to another caller"));
        }
        if !challenge.requirements.matches(&payload.accepted) {
            return Err(BillingError::payment(
                "accepted requirements do not match the challenge",
            ));
        }

        let exact = payload
            .exact_evm()
            .map_err(|err| BillingError::payment(format!("invalid exact payload: {err}")))?;
        let authorization = &exact.authorization;
        let authorized_units = authorization
            .value_units()
            .ok_or_else(|| BillingError::payment("authorization value is not an integer"))?;
        if authorized_units < challenge.amount_units {
            return Err(BillingError::payment(format!(
                "authorization of {authorized_units} units is below the {} requested",
                challenge.amount_units
            )));
        }
        if !authorization.to.eq_ignore_ascii_case(&challenge.requirements.pay_to) {
            return Err(BillingError::payment("authorization pays the wrong recipient"));
        }

        let state = X402State::ChallengeIssued {
            nonce: nonce.clone(),
            amount_units: challenge.amount_units,
            expires_at: challenge.expires_at,
        }
        .apply(X402Event::ReceivePayload {
            nonce: nonce.clone(),
            authorized_units,
        })
        .map_err(BillingError::internal)?;

        let external_id = format!(
            "x402:{}:{}",
            challenge.requirements.network,
            authorization.nonce.to_ascii_lowercase()
        );
        let (challenge, payment_id) = self
            .ledger
            .claim_challenge(
                &nonce,
                &principal.user_id,
                &external_id,
                Usd::from_asset_units(authorized_units, self.config.decimals),
            )
            .await?;

        let request = VerifyRequest::new(payload.clone(), challenge.requirements.clone());
        let payer = match self.facilitator.verify(&request).await {
            Ok(VerifyResponse::Valid { payer }) => payer,
            Ok(VerifyResponse::Invalid { reason, .. }) => {
                return Err(self.reject(&nonce, state, reason).await);
            }
            Err(err) => {
                return Err(self
                    .reject(&nonce, state, format!("facilitator unavailable: {err}"))
                    .await);
            }
        };
        let state = state
            .apply(X402Event::Verify {
                payer: payer.clone(),
            })
            .map_err(BillingError::internal)?;
        tracing::info!(%payer, authorized_units, %state, "Payment verified");

        Ok(PaidCall {
            challenge_nonce: nonce,
            payment_id,
            payer,
            paid_units: authorized_units,
            decimals: self.config.decimals,
            payload,
            requirements: challenge.requirements,
            state,
        })
    }

    /// Fails the challenge of a payment that will not be charged.
    pub async fn abandon(&self, paid: PaidCall, reason: &str) {
        let state = paid.state.apply(X402Event::Fail {
            reason: reason.to_owned(),
        });
        match self.ledger.fail_challenge(&paid.challenge_nonce, reason).await {
            Ok(_) => tracing::info!(
                nonce = %paid.challenge_nonce,
                reason,
                state = ?state.as_ref().map(X402State::name),
                "Payment abandoned; nothing settled"
            ),
            Err(err) => tracing::error!(
                nonce = %paid.challenge_nonce,
                error = %err,
                "Failed to record abandoned payment"
            ),
        }
    }

    async fn reject(&self, nonce: &str, state: X402State, reason: String) -> BillingError {
        if let Err(err) = self.ledger.fail_challenge(nonce, &reason).await {
            tracing::error!(nonce, error = %err, "Failed to record rejected payment");
        }
        let state = state.apply(X402Event::Fail {
            reason: reason.clone(),
        });
        tracing::info!(nonce, %reason, state = ?state.map(|s| s.name()), "Payment rejected");
        BillingError::payment(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use tollgate::credential::{CredentialKind, Scope};
    use tollgate::pricing::Markup;
    use tollgate::proto::encoding::encode_header;
    use tollgate_ledger::NewApp;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::facilitator_client::FacilitatorClient;

    fn config() -> X402Config {
        X402Config {
            network: "eip155:84532".into(),
            asset: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".into(),
            decimals: 6,
            pay_to: "0xPayee".into(),
            asset_name: "USDC".into(),
            asset_version: "2".into(),
            max_timeout_seconds: 300,
            challenge_ttl_secs: 300,
        }
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
            kind: CredentialKind::AccessToken,
        }
    }

    fn pay(challenge: &PaymentChallenge, value: u64, auth_nonce: &str) -> String {
        let payload = PaymentPayload {
            x402_version: 2,
            payload: json!({
                "signature": "0xsig",
                "authorization": {
                    "from": "0xPayer",
                    "to": "0xpayee",
                    "value": value.to_string(),
                    "validAfter": 0,
                    "validBefore": 4_000_000_000u64,
                    "nonce": auth_nonce
                }
            }),
            accepted: challenge.accepts[0].clone(),
            resource: None,
            extensions: None,
        };
        encode_header(&payload).unwrap()
    }

    async fn facilitator(valid: bool) -> (MockServer, Arc<dyn Facilitator>) {
        let server = MockServer::start().await;
        let body = if valid {
            json!({ "isValid": true, "payer": "0xPayer" })
        } else {
            json!({ "isValid": false, "invalidReason": "invalid_exact_evm_payload_signature" })
        };
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;
        let client = FacilitatorClient::try_from(server.uri()).unwrap();
        (server, Arc::new(client))
    }

    async fn issue(gate: &Paygate, principal: &Principal, amount: &str) -> PaymentChallenge {
        let err = gate
            .challenge(principal, Usd::parse(amount).unwrap(), None)
            .await
            .unwrap();
        *err.challenge.unwrap()
    }

    #[tokio::test]
    async fn challenge_rounds_amount_up_to_asset_units() {
        let ledger = Ledger::in_memory().await.unwrap();
        let (_server, facilitator) = facilitator(true).await;
        let gate = Paygate::new(ledger.clone(), facilitator, config());
        let principal = principal(&ledger).await;

        let challenge = issue(&gate, &principal, "1.3500001").await;
        assert_eq!(challenge.amount, "1350001");
        assert_eq!(challenge.x402_version, 2);
        assert_eq!(challenge.accepts[0].challenge_nonce(), Some(challenge.nonce.as_str()));
        assert_eq!(challenge.accepts[0].extra["name"], "USDC");
    }

    #[tokio::test]
    async fn accepted_payment_is_single_use() {
        let ledger = Ledger::in_memory().await.unwrap();
        let (_server, facilitator) = facilitator(true).await;
        let gate = Paygate::new(ledger.clone(), facilitator, config());
        let principal = principal(&ledger).await;
        let challenge = issue(&gate, &principal, "1.35").await;

        let header = pay(&challenge, 2_000_000, "0xAB");
        let paid = gate.accept(&principal, &header).await.unwrap();
        assert_eq!(paid.paid_units, 2_000_000);
        assert_eq!(paid.payer, "0xPayer");
        assert_eq!(paid.state.name(), "verified");

        let replay = gate.accept(&principal, &header).await.unwrap_err();
        assert!(matches!(replay, BillingError::PaymentVerificationFailed { .. }));

        // The same signed authorization cannot pay a second challenge either.
        let second = issue(&gate, &principal, "1.35").await;
        let reused = gate
            .accept(&principal, &pay(&second, 2_000_000, "0xab"))
            .await
            .unwrap_err();
        assert!(matches!(reused, BillingError::PaymentVerificationFailed { .. }));
    }

    #[tokio::test]
    async fn underpayment_is_rejected_before_facilitator() {
        let ledger = Ledger::in_memory().await.unwrap();
        let (server, facilitator) = facilitator(true).await;
        let gate = Paygate::new(ledger.clone(), facilitator, config());
        let principal = principal(&ledger).await;
        let challenge = issue(&gate, &principal, "1.35").await;

        let err = gate
            .accept(&principal, &pay(&challenge, 1_000_000, "0x01"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PaymentVerificationFailed { .. }));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_signature_fails_the_challenge() {
        let ledger = Ledger::in_memory().await.unwrap();
        let (_server, facilitator) = facilitator(false).await;
        let gate = Paygate::new(ledger.clone(), facilitator, config());
        let principal = principal(&ledger).await;
        let challenge = issue(&gate, &principal, "1.35").await;

        let err = gate
            .accept(&principal, &pay(&challenge, 2_000_000, "0x02"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "payment verification failed: invalid_exact_evm_payload_signature"
        );
        assert!(gate.accept(&principal, &pay(&challenge, 2_000_000, "0x03")).await.is_err());
    }

    #[tokio::test]
    async fn garbage_header_is_a_payment_error() {
        let ledger = Ledger::in_memory().await.unwrap();
        let (_server, facilitator) = facilitator(true).await;
        let gate = Paygate::new(ledger.clone(), facilitator, config());
        let principal = principal(&ledger).await;
        let err = gate.accept(&principal, "not-base64!").await.unwrap_err();
        assert_eq!(err.status_code(), 402);
    }
}
