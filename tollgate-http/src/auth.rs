//! Bearer extraction and scope checks.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use tollgate::BillingError;
use tollgate::credential::{CredentialVerifier, Principal};

use crate::constants::{X_API_KEY_HEADER, X_GOOG_API_KEY_HEADER};

/// Finds the caller's credential: `Authorization: Bearer`, then `x-api-key`,
/// then `x-goog-api-key`.
#[must_use]
pub fn bearer(headers: &HeaderMap) -> Option<&str> {
    let from_authorization = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
        });
    from_authorization
        .or_else(|| header_str(headers, X_API_KEY_HEADER))
        .or_else(|| header_str(headers, X_GOOG_API_KEY_HEADER))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Verifies the caller and checks it holds `scope`.
///
/// # Errors
///
/// [`BillingError::Unauthorized`] for a missing or invalid credential,
/// [`BillingError::Forbidden`] when the scope is not granted.
pub async fn authenticate(
    verifier: &CredentialVerifier,
    headers: &HeaderMap,
    scope: &str,
) -> Result<Principal, BillingError> {
    let token = bearer(headers)
        .ok_or_else(|| BillingError::Unauthorized("missing credential".to_owned()))?;
    let principal = verifier.verify(token).await?;
    if !principal.scope.allows(scope) {
        tracing::debug!(user_id = %principal.user_id, scope, "Credential lacks scope");
        return Err(BillingError::Forbidden(scope.to_owned()));
    }
    Ok(principal)
}
