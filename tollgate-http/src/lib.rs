#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! HTTP surface of the tollgate proxy.
//!
//! [`router`] serves the metered provider proxy, balance reads and the card
//! payment webhook over one shared [`state::Gateway`].
//!
//! # Modules
//!
//! - [`proxy`] - `POST /v1/{*path}`: authenticate, price, fund, forward, bill
//! - [`providers`] - Upstream adapters and the path-keyed routing table
//! - [`metering`] - Usage tracking on relayed event streams
//! - [`charge`] - Commit or release of a funded call
//! - [`paygate`] - x402 challenges and payment acceptance
//! - [`settlement`] - Idempotent settle and refund of x402 transactions
//! - [`facilitator_client`] - HTTP client for a remote x402 facilitator
//! - [`billing`] - Balance endpoints
//! - [`webhook`] - Signed card top-up webhook
//! - [`auth`] - Bearer extraction and scope checks
//! - [`error`] - JSON error responses
//! - [`constants`] - Header names

use axum::Json;
use axum::Router;
use axum::http::{HeaderName, Method};
use axum::routing::{get, post};
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod auth;
pub mod billing;
pub mod charge;
pub mod constants;
pub mod error;
pub mod facilitator_client;
pub mod metering;
pub mod paygate;
pub mod providers;
pub mod proxy;
pub mod settlement;
pub mod state;
pub mod webhook;

pub use error::ApiError;
pub use state::{Gateway, GatewayState};

/// Builds the proxy router.
///
/// Endpoints:
/// - `POST /v1/{*path}` - proxied provider call
/// - `GET /billing/balance` - caller's prepaid balance
/// - `GET /billing/apps/{app_id}/free-tier` - an app's spend pool
/// - `POST /webhooks/payments` - card top-ups
/// - `GET /health` - liveness
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/v1/{*path}", post(proxy::proxy))
        .route("/billing/balance", get(billing::balance))
        .route("/billing/apps/{app_id}/free-tier", get(billing::free_tier))
        .route("/webhooks/payments", post(webhook::payments))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(Any)
                .expose_headers(constants::EXPOSED_HEADERS.map(HeaderName::from_static)),
        )
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use rust_decimal::Decimal;
    use tollgate::Usd;
    use tollgate::credential::{ApiKeyHasher, CredentialVerifier, Scope, TokenAuthority};
    use tollgate::pricing::{CostModel, Markup, ModelPrice, PriceTable};
    use tollgate::proto::encoding::{decode_header, encode_header};
    use tollgate::proto::{PaymentChallenge, PaymentPayload};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tollgate_ledger::{Ledger, NewApp};
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::facilitator_client::FacilitatorClient;
    use crate::paygate::{Paygate, X402Config};
    use crate::providers::{ProviderEndpoint, ProviderKind, RoutingTable};
    use crate::settlement::SettlementEngine;

    struct Harness {
        ledger: Ledger,
        app: Router,
        api_key: String,
        user_id: String,
    }

    fn costs() -> CostModel {
        let prices = PriceTable::new().with_model(
            "gpt-4o",
            ModelPrice {
                input_per_million: Usd::parse("2").unwrap(),
                output_per_million: Usd::parse("10").unwrap(),
                cached_input_per_million: None,
            },
        );
        CostModel::new(prices, Markup::new(Decimal::new(11, 1)).unwrap(), 4096)
    }

    async fn harness(upstream: &MockServer, facilitator: Option<&MockServer>, credit: &str) -> Harness {
        harness_at(upstream.uri(), facilitator, credit, None).await
    }

    async fn harness_at(
        upstream_uri: String,
        facilitator: Option<&MockServer>,
        credit: &str,
        webhook_secret: Option<&str>,
    ) -> Harness {
        let ledger = Ledger::in_memory().await.unwrap();
        let user = ledger.create_user(Some("dev@example.com")).await.unwrap();
        let app = ledger
            .create_app(NewApp {
                name: "chat".into(),
                markup: Markup::new(Decimal::new(15, 1)).unwrap(),
                owner_user_id: user.id.clone(),
                referrer_user_id: None,
                referral_share: Decimal::ZERO,
            })
            .await
            .unwrap();
        if credit != "0" {
            ledger
                .credit_user(&user.id, Usd::parse(credit).unwrap(), "topup_1")
                .await
                .unwrap();
        }
        let hasher = ApiKeyHasher::new(b"pepper".to_vec());
        let (api_key, _) = ledger
            .create_api_key(&user.id, &app.id, Scope::all(), None, &hasher)
            .await
            .unwrap();
        let verifier = CredentialVerifier::new(
            TokenAuthority::new(b"jwt-secret", "tollgate", None),
            hasher,
            Arc::new(ledger.clone()),
        );
        let routes = RoutingTable::new().register(
            ProviderKind::OpenAi,
            ProviderEndpoint {
                base_url: upstream_uri,
                api_key: "sk-upstream".into(),
            },
        );
        let mut gateway = Gateway::new(
            ledger.clone(),
            verifier,
            costs(),
            routes,
            reqwest::Client::new(),
        );
        if let Some(facilitator) = facilitator {
            let client: Arc<dyn tollgate::settlement::Facilitator> =
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
        if let Some(secret) = webhook_secret {
            gateway = gateway.with_webhook_secret(secret);
        }
        Harness {
            app: router(Arc::new(gateway)),
            ledger,
            api_key,
            user_id: user.id,
        }
    }

    fn chat(api_key: &str, body: &Value) -> Request<Body> {
        Request::post("/v1/chat/completions")
            .header("authorization", format!("Bearer {api_key}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn buffered_call_bills_markup_on_actual_usage() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "hi" } }],
                "usage": { "prompt_tokens": 1_000_000, "completion_tokens": 100_000 }
            })))
            .expect(1)
            .mount(&upstream)
            .await;
        let h = harness(&upstream, None, "5.00").await;

        let response = h
            .app
            .clone()
            .oneshot(chat(
                &h.api_key,
                &json!({ "model": "gpt-4o", "max_tokens": 1000, "messages": [] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let transaction_id = response.headers()[constants::TRANSACTION_HEADER]
            .to_str()
            .unwrap()
            .to_owned();

        let txn = h.ledger.transaction(&transaction_id).await.unwrap();
        assert_eq!(txn.cost.raw_cost, Usd::parse("3.00").unwrap());
        assert_eq!(txn.cost.app_markup_profit, Usd::parse("1.50").unwrap());
        assert_eq!(txn.cost.platform_markup_profit, Usd::parse("0.30").unwrap());
        assert_eq!(txn.cost.total_cost, Usd::parse("4.80").unwrap());

        let balance = h
            .app
            .clone()
            .oneshot(
                Request::get("/billing/balance")
                    .header("x-api-key", &h.api_key)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(balance.status(), StatusCode::OK);
        let body = json_body(balance).await;
        let remaining: Usd = serde_json::from_value(body["balance"].clone()).unwrap();
        assert_eq!(remaining, Usd::parse("0.20").unwrap());
    }

    #[tokio::test]
    async fn upstream_error_is_relayed_and_not_billed() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429).set_body_json(json!({ "error": "rate limited" })),
            )
            .mount(&upstream)
            .await;
        let h = harness(&upstream, None, "5.00").await;

        let response = h
            .app
            .clone()
            .oneshot(chat(&h.api_key, &json!({ "model": "gpt-4o", "messages": [] })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json_body(response).await["error"], "rate limited");

        let balance = h.ledger.user_balance(&h.user_id).await.unwrap();
        assert_eq!(balance.balance, Usd::parse("5.00").unwrap());
        assert_eq!(balance.total_spent, Usd::ZERO);
    }

    #[tokio::test]
    async fn streamed_call_is_billed_when_the_stream_ends() {
        let upstream = MockServer::start().await;
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":100,\"completion_tokens\":50}}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse),
            )
            .mount(&upstream)
            .await;
        let h = harness(&upstream, None, "1.00").await;

        let response = h
            .app
            .clone()
            .oneshot(chat(
                &h.api_key,
                &json!({ "model": "gpt-4o", "stream": true, "messages": [] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let relayed = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(relayed, sse.as_bytes());

        let requests = upstream.received_requests().await.unwrap();
        let forwarded: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(forwarded["stream_options"]["include_usage"], true);
        assert!(requests[0].headers.get("authorization").is_some_and(|v| v == "Bearer sk-upstream"));

        // 100 in at $2/M plus 50 out at $10/M, times (1 + 0.5 + 0.1).
        let balance = h.ledger.user_balance(&h.user_id).await.unwrap();
        assert_eq!(balance.total_spent, Usd::parse("0.00112").unwrap());
    }

    #[tokio::test]
    async fn unfunded_call_is_challenged_then_paid_with_x402() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "hi" } }],
                "usage": { "prompt_tokens": 10, "completion_tokens": 20 }
            })))
            .expect(1)
            .mount(&upstream)
            .await;
        let facilitator = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "isValid": true, "payer": "0xPayer" })),
            )
            .mount(&facilitator)
            .await;
        Mock::given(method("POST"))
            .and(path("/settle"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "transaction": "0xsettled",
                "network": "eip155:84532",
                "payer": "0xPayer"
            })))
            .expect(1)
            .mount(&facilitator)
            .await;
        let h = harness(&upstream, Some(&facilitator), "0").await;
        let request = json!({ "model": "gpt-4o", "max_tokens": 1000, "messages": [] });

        let challenged = h.app.clone().oneshot(chat(&h.api_key, &request)).await.unwrap();
        assert_eq!(challenged.status(), StatusCode::PAYMENT_REQUIRED);
        assert!(challenged.headers().contains_key(constants::PAYMENT_REQUIRED_HEADER));
        let challenge: PaymentChallenge =
            serde_json::from_value(json_body(challenged).await).unwrap();
        assert!(upstream.received_requests().await.unwrap().is_empty());

        let payload = PaymentPayload {
            x402_version: 2,
            payload: json!({
                "signature": "0xsig",
                "authorization": {
                    "from": "0xPayer",
                    "to": challenge.pay_to,
                    "value": challenge.amount,
                    "validAfter": 0,
                    "validBefore": 4_000_000_000u64,
                    "nonce": "0x01"
                }
            }),
            accepted: challenge.accepts[0].clone(),
            resource: None,
            extensions: None,
        };
        let mut paid = chat(&h.api_key, &request);
        paid.headers_mut().insert(
            constants::X_PAYMENT_HEADER,
            encode_header(&payload).unwrap().parse().unwrap(),
        );
        let response = h.app.clone().oneshot(paid).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let receipt: Value = decode_header(
            response.headers()[constants::PAYMENT_RESPONSE_HEADER]
                .to_str()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(receipt["transaction"], "0xsettled");

        let transaction_id = response.headers()[constants::TRANSACTION_HEADER]
            .to_str()
            .unwrap();
        let record = h.ledger.settlement(transaction_id).await.unwrap();
        assert_eq!(record.paid_units.to_string(), challenge.amount);
        assert_eq!(record.refund_units, record.paid_units - record.owed_units);

        // The prepaid balance is never touched by an x402 call.
        let balance = h.ledger.user_balance(&h.user_id).await.unwrap();
        assert_eq!(balance.total_spent, Usd::ZERO);
    }

    #[tokio::test]
    async fn missing_credential_is_unauthorized() {
        let upstream = MockServer::start().await;
        let h = harness(&upstream, None, "1.00").await;
        let response = h
            .app
            .clone()
            .oneshot(
                Request::post("/v1/chat/completions")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["code"], "unauthorized");
    }

    #[tokio::test]
    async fn unpriced_model_is_a_bad_request() {
        let upstream = MockServer::start().await;
        let h = harness(&upstream, None, "1.00").await;
        let response = h
            .app
            .clone()
            .oneshot(chat(&h.api_key, &json!({ "model": "mystery-1", "messages": [] })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(upstream.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn prepaid_only_gateway_refuses_unfunded_calls_without_a_challenge() {
        let upstream = MockServer::start().await;
        let h = harness(&upstream, None, "0").await;

        let response = h
            .app
            .clone()
            .oneshot(chat(&h.api_key, &json!({ "model": "gpt-4o", "messages": [] })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        assert!(!response.headers().contains_key(constants::PAYMENT_REQUIRED_HEADER));
        let body = json_body(response).await;
        assert_eq!(body["code"], "insufficient_funds");
        assert!(body.get("accepts").is_none());
        assert!(upstream.received_requests().await.unwrap().is_empty());
    }

    fn webhook(body: &str, signature: &str) -> Request<Body> {
        Request::post("/webhooks/payments")
            .header(constants::WEBHOOK_SIGNATURE_HEADER, signature)
            .header("content-type", "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    #[tokio::test]
    async fn signed_checkout_webhook_credits_once() {
        const SECRET: &str = "whsec_test";
        let h = harness_at("http://127.0.0.1:9".to_owned(), None, "0", Some(SECRET)).await;
        let body = json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": { "object": {
                "id": "cs_1",
                "amount_total": 1250,
                "metadata": { "user_id": h.user_id }
            } }
        })
        .to_string();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let signature = webhook::sign(SECRET.as_bytes(), body.as_bytes(), now).unwrap();

        let forged = webhook::sign(b"whsec_other", body.as_bytes(), now).unwrap();
        let rejected = h.app.clone().oneshot(webhook(&body, &forged)).await.unwrap();
        assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(h.ledger.user_balance(&h.user_id).await.unwrap().balance, Usd::ZERO);

        let applied = h.app.clone().oneshot(webhook(&body, &signature)).await.unwrap();
        assert_eq!(applied.status(), StatusCode::OK);
        assert_eq!(json_body(applied).await["outcome"], "applied");

        let redelivered = h.app.clone().oneshot(webhook(&body, &signature)).await.unwrap();
        assert_eq!(redelivered.status(), StatusCode::OK);
        assert_eq!(json_body(redelivered).await["outcome"], "duplicate");

        let balance = h.ledger.user_balance(&h.user_id).await.unwrap();
        assert_eq!(balance.balance, Usd::parse("12.50").unwrap());
    }

    #[tokio::test]
    async fn truncated_upstream_error_is_relayed_empty_and_not_billed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0; 64 * 1024];
            let _ = socket.read(&mut request).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 100\r\n\r\npartial")
                .await
                .unwrap();
        });
        let h = harness_at(format!("http://{address}"), None, "1.00", None).await;

        let response = h
            .app
            .clone()
            .oneshot(chat(&h.api_key, &json!({ "model": "gpt-4o", "messages": [] })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(to_bytes(response.into_body(), usize::MAX).await.unwrap().is_empty());

        let balance = h.ledger.user_balance(&h.user_id).await.unwrap();
        assert_eq!(balance.balance, Usd::parse("1.00").unwrap());
        assert_eq!(balance.total_spent, Usd::ZERO);
    }
}
