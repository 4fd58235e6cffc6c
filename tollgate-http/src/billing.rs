//! Balance reads for dashboards and SDKs.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use tollgate::BillingError;
use tollgate::credential::SCOPE_BALANCE_READ;
use tollgate_ledger::{PoolBalance, UserBalance};

use crate::auth::authenticate;
use crate::error::ApiError;
use crate::state::GatewayState;

/// `GET /billing/balance`: the caller's prepaid balance.
pub async fn balance(
    State(gateway): State<GatewayState>,
    headers: HeaderMap,
) -> Result<Json<UserBalance>, ApiError> {
    let principal = authenticate(&gateway.verifier, &headers, SCOPE_BALANCE_READ).await?;
    Ok(Json(gateway.ledger.user_balance(&principal.user_id).await?))
}

/// `GET /billing/apps/{app_id}/free-tier`: an app's spend pool. Readable by
/// credentials bound to the app and by its members.
pub async fn free_tier(
    State(gateway): State<GatewayState>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PoolBalance>, ApiError> {
    let principal = authenticate(&gateway.verifier, &headers, SCOPE_BALANCE_READ).await?;
    if principal.app_id != app_id
        && gateway
            .ledger
            .membership(&app_id, &principal.user_id)
            .await?
            .is_none()
    {
        return Err(BillingError::Forbidden(format!("app {app_id}")).into());
    }
    let pool = gateway
        .ledger
        .spend_pool_balance(&app_id)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("spend pool of app {app_id}")))?;
    Ok(Json(pool))
}
