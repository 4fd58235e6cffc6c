//! `POST /webhooks/payments`: card top-ups from a Stripe-style processor.
//!
//! The body is authenticated with `Stripe-Signature: t=<unix>,v1=<hex>` where
//! `v1 = hex(hmac_sha256(secret, "{t}.{body}"))`. Only checkout session events
//! touch the ledger; everything else is acknowledged and dropped.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::Sha256;
use tollgate::BillingError;
use tollgate::money::Usd;
use tollgate_ledger::{CardPaymentEvent, CardPaymentOutcome, CreditTarget, WebhookOutcome};

use crate::constants::WEBHOOK_SIGNATURE_HEADER;
use crate::error::ApiError;
use crate::state::GatewayState;

/// Accepted clock skew between the signature timestamp and now.
pub const SIGNATURE_TOLERANCE_SECS: u64 = 300;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    object: Value,
}

#[derive(Debug, Deserialize)]
struct CheckoutSession {
    id: String,
    #[serde(default)]
    amount_total: Option<i64>,
    #[serde(default)]
    metadata: CheckoutMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct CheckoutMetadata {
    user_id: Option<String>,
    app_id: Option<String>,
}

/// Verifies and applies one webhook delivery.
///
/// # Errors
///
/// 401 for a bad signature, 400 for a malformed event, 404 when the credited
/// user or app does not exist (the processor retries).
pub async fn payments(
    State(gateway): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let secret = gateway
        .webhook_secret
        .as_deref()
        .ok_or_else(|| BillingError::NotFound("payment webhook".to_owned()))?;
    let signature = headers
        .get(WEBHOOK_SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| BillingError::Unauthorized("missing webhook signature".to_owned()))?;
    verify_signature(secret.as_bytes(), signature, &body, unix_now())?;

    let envelope: WebhookEnvelope = serde_json::from_slice(&body)
        .map_err(|err| ApiError::bad_request(format!("malformed webhook event: {err}")))?;
    let Some(event) = card_payment(&envelope)? else {
        tracing::debug!(event_id = %envelope.id, event_type = %envelope.event_type, "Ignoring webhook event");
        return Ok(Json(json!({ "received": true, "outcome": "ignored" })));
    };

    let outcome = gateway.ledger.apply_card_payment(&event).await?;
    tracing::info!(
        event_id = %event.event_id,
        event_type = %event.event_type,
        external_id = %event.external_id,
        amount = %event.amount,
        ?outcome,
        "Applied payment webhook"
    );
    let outcome = match outcome {
        WebhookOutcome::Applied => "applied",
        WebhookOutcome::Duplicate => "duplicate",
        WebhookOutcome::Ignored => "ignored",
    };
    Ok(Json(json!({ "received": true, "outcome": outcome })))
}

fn card_payment(envelope: &WebhookEnvelope) -> Result<Option<CardPaymentEvent>, ApiError> {
    let outcome = match envelope.event_type.as_str() {
        "checkout.session.completed" | "checkout.session.async_payment_succeeded" => {
            CardPaymentOutcome::Completed
        }
        "checkout.session.expired" | "checkout.session.async_payment_failed" => {
            CardPaymentOutcome::Failed
        }
        _ => return Ok(None),
    };
    let session: CheckoutSession = serde_json::from_value(envelope.data.object.clone())
        .map_err(|err| ApiError::bad_request(format!("malformed checkout session: {err}")))?;
    let target = match (session.metadata.user_id, session.metadata.app_id) {
        (Some(user_id), _) => CreditTarget::User(user_id),
        (None, Some(app_id)) => CreditTarget::SpendPool(app_id),
        (None, None) => {
            return Err(ApiError::bad_request(
                "checkout session metadata names no user_id or app_id",
            ));
        }
    };
    let cents = session.amount_total.unwrap_or(0);
    if cents < 0 {
        return Err(ApiError::bad_request("negative amount_total"));
    }
    Ok(Some(CardPaymentEvent {
        event_id: envelope.id.clone(),
        event_type: envelope.event_type.clone(),
        external_id: session.id,
        target,
        amount: Usd::new(Decimal::new(cents, 2)),
        outcome,
    }))
}

/// Checks a `t=..,v1=..` signature header against `body`.
///
/// # Errors
///
/// [`BillingError::Unauthorized`] for a malformed, stale or mismatched signature.
pub fn verify_signature(
    secret: &[u8],
    header: &str,
    body: &[u8],
    now: u64,
) -> Result<(), BillingError> {
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<u64>().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp
        .ok_or_else(|| BillingError::Unauthorized("webhook signature has no timestamp".to_owned()))?;
    if now.abs_diff(timestamp) > SIGNATURE_TOLERANCE_SECS {
        return Err(BillingError::Unauthorized(
            "webhook signature outside tolerance".to_owned(),
        ));
    }

    for candidate in candidates {
        let Ok(expected) = hex::decode(candidate) else {
            continue;
        };
        let mut mac = signer(secret)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }
    Err(BillingError::Unauthorized(
        "webhook signature mismatch".to_owned(),
    ))
}

/// Produces a signature header for `body`, as the processor would.
///
/// # Errors
///
/// [`BillingError::Internal`] if the secret cannot key the MAC.
pub fn sign(secret: &[u8], body: &[u8], timestamp: u64) -> Result<String, BillingError> {
    let mut mac = signer(secret)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(format!(
        "t={timestamp},v1={}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

fn signer(secret: &[u8]) -> Result<HmacSha256, BillingError> {
    HmacSha256::new_from_slice(secret).map_err(BillingError::internal)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"whsec_test";

    #[test]
    fn signature_round_trips_within_tolerance() {
        let body = br#"{"id":"evt_1"}"#;
        let header = sign(SECRET, body, 1_000).unwrap();
        assert!(verify_signature(SECRET, &header, body, 1_200).is_ok());
        assert!(verify_signature(SECRET, &header, body, 1_301).is_err());
        assert!(verify_signature(b"other", &header, body, 1_000).is_err());
        assert!(verify_signature(SECRET, &header, b"tampered", 1_000).is_err());
    }

    #[test]
    fn any_matching_v1_is_accepted() {
        let body = b"{}";
        let good = sign(SECRET, body, 50).unwrap();
        let v1 = good.split("v1=").nth(1).unwrap();
        let header = format!("t=50,v1=deadbeef,v1={v1}");
        assert!(verify_signature(SECRET, &header, body, 50).is_ok());
    }

    #[test]
    fn checkout_completed_credits_cents() {
        let envelope: WebhookEnvelope = serde_json::from_value(json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": { "object": {
                "id": "cs_1",
                "amount_total": 1050,
                "metadata": { "user_id": "usr_1" }
            }}
        }))
        .unwrap();
        let event = card_payment(&envelope).unwrap().unwrap();
        assert_eq!(event.amount, Usd::parse("10.50").unwrap());
        assert_eq!(event.target, CreditTarget::User("usr_1".into()));
        assert_eq!(event.external_id, "cs_1");
        assert_eq!(event.outcome, CardPaymentOutcome::Completed);
    }

    #[test]
    fn unknown_events_are_ignored() {
        let envelope: WebhookEnvelope = serde_json::from_value(json!({
            "id": "evt_2",
            "type": "customer.created",
            "data": { "object": {} }
        }))
        .unwrap();
        assert!(card_payment(&envelope).unwrap().is_none());
    }
}
