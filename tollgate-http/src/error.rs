//! HTTP rendering of [`BillingError`].
//!
//! Every failure the proxy returns goes through [`ApiError`]. A 402 that
//! carries a payment challenge renders the challenge itself as the body and
//! mirrors it, base64 encoded, in the `Payment-Required` header.

use axum::Json;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tollgate::BillingError;
use tollgate::proto::PaymentChallenge;
use tollgate::proto::encoding::encode_header;
use tollgate_ledger::LedgerError;

use crate::constants::PAYMENT_REQUIRED_HEADER;

/// A billing error on its way to the caller.
#[derive(Debug)]
pub struct ApiError {
    /// The failure.
    pub error: BillingError,
    /// Challenge to render instead of the plain error body.
    pub challenge: Option<Box<PaymentChallenge>>,
}

impl ApiError {
    /// A 402 offering an on-demand payment.
    #[must_use]
    pub fn payment_required(error: BillingError, challenge: PaymentChallenge) -> Self {
        Self {
            error,
            challenge: Some(Box::new(challenge)),
        }
    }

    /// Shorthand for [`BillingError::BadRequest`].
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        BillingError::BadRequest(message.into()).into()
    }
}

impl From<BillingError> for ApiError {
    fn from(error: BillingError) -> Self {
        Self {
            error,
            challenge: None,
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(error: LedgerError) -> Self {
        BillingError::from(error).into()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.error.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
        if status.is_server_error() {
            tracing::error!(error = %self.error, code = self.error.code(), "Request failed");
        } else {
            tracing::debug!(error = %self.error, code = self.error.code(), "Request rejected");
        }

        if let Some(challenge) = self.challenge {
            let mut challenge = *challenge;
            challenge.error = Some(self.error.to_string());
            let header = encode_header(&challenge)
                .ok()
                .and_then(|encoded| HeaderValue::from_str(&encoded).ok());
            let mut response = (status, Json(challenge)).into_response();
            if let Some(header) = header {
                response
                    .headers_mut()
                    .insert(PAYMENT_REQUIRED_HEADER, header);
            }
            return response;
        }

        let message = match &self.error {
            // Internal details stay in the logs.
            BillingError::Internal(_) => "internal error".to_owned(),
            other => other.to_string(),
        };
        (
            status,
            Json(json!({ "error": message, "code": self.error.code() })),
        )
            .into_response()
    }
}
