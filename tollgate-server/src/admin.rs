//! Operator commands: provisioning, credits, payouts and reconciliation.
//!
//! Each command returns a JSON document that `main` prints.

use std::time::Duration;

use rust_decimal::Decimal;
use serde_json::{Value, json};
use tollgate::BillingError;
use tollgate::credential::{ApiKeyHasher, CredentialError, Scope, TokenAuthority};
use tollgate::money::Usd;
use tollgate::pricing::{CostError, Markup};
use tollgate::timestamp::UnixTimestamp;
use tollgate_http::settlement::SettlementEngine;
use tollgate_ledger::{Ledger, LedgerError, MemberRole, NewApp, RecipientKind};

use crate::cli::ArchiveKind;

/// Errors raised by operator commands.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    /// The ledger rejected the operation.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// A token could not be minted or decoded.
    #[error(transparent)]
    Credential(#[from] CredentialError),
    /// A markup is out of range.
    #[error(transparent)]
    Cost(#[from] CostError),
    /// A settlement retry failed outright.
    #[error(transparent)]
    Billing(#[from] BillingError),
    /// The request makes no sense as given.
    #[error("{0}")]
    Invalid(String),
}

/// Input to [`create_app`].
#[derive(Debug, Clone)]
pub struct AppSpec {
    /// Display name.
    pub name: String,
    /// Owning user.
    pub owner: String,
    /// Markup multiplier.
    pub markup: Decimal,
    /// Referrer user, if any.
    pub referrer: Option<String>,
    /// Referrer share of the markup profit.
    pub referral_share: Decimal,
}

/// Creates a user.
///
/// # Errors
///
/// [`AdminError::Ledger`] on database failure.
pub async fn create_user(ledger: &Ledger, email: Option<&str>) -> Result<Value, AdminError> {
    let user = ledger.create_user(email).await?;
    Ok(json!({ "userId": user.id, "email": user.email }))
}

/// Creates an app owned by `spec.owner`.
///
/// # Errors
///
/// [`AdminError::Cost`] for an out-of-range markup and
/// [`AdminError::Ledger`] for an unknown owner or referrer.
pub async fn create_app(ledger: &Ledger, spec: AppSpec) -> Result<Value, AdminError> {
    let app = ledger
        .create_app(NewApp {
            name: spec.name,
            markup: Markup::new(spec.markup)?,
            owner_user_id: spec.owner,
            referrer_user_id: spec.referrer,
            referral_share: spec.referral_share,
        })
        .await?;
    Ok(json!({
        "appId": app.id,
        "name": app.name,
        "markup": app.markup.multiplier().to_string(),
        "referrerUserId": app.referrer_user_id,
        "referralShare": app.referral_share.to_string(),
    }))
}

/// Adds a user to an app.
///
/// # Errors
///
/// [`AdminError::Ledger`] for an unknown user or app.
pub async fn add_member(
    ledger: &Ledger,
    app_id: &str,
    user_id: &str,
    role: MemberRole,
) -> Result<Value, AdminError> {
    ledger.add_member(app_id, user_id, role).await?;
    let role = ledger.membership(app_id, user_id).await?;
    Ok(json!({ "appId": app_id, "userId": user_id, "role": role }))
}

/// Provisions an API key. The plaintext is shown once.
///
/// # Errors
///
/// [`AdminError::Ledger`] for an unknown user or app.
pub async fn create_api_key(
    ledger: &Ledger,
    hasher: &ApiKeyHasher,
    user_id: &str,
    app_id: &str,
    scope: Scope,
    name: Option<&str>,
) -> Result<Value, AdminError> {
    let (plaintext, key) = ledger
        .create_api_key(user_id, app_id, scope, name, hasher)
        .await?;
    Ok(json!({
        "keyId": key.id,
        "apiKey": plaintext,
        "userId": key.user_id,
        "appId": key.app_id,
        "scope": key.scope,
        "name": key.name,
    }))
}

/// Mints an access token for an existing user and app, adding the user to
/// the app as a customer if needed.
///
/// # Errors
///
/// [`AdminError::Ledger`] for an unknown user or app and
/// [`AdminError::Invalid`] for an archived one.
pub async fn issue_token(
    ledger: &Ledger,
    tokens: &TokenAuthority,
    user_id: &str,
    app_id: &str,
    scope: Scope,
    ttl: Duration,
) -> Result<Value, AdminError> {
    let user = ledger.user(user_id).await?;
    let app = ledger.app(app_id).await?;
    if user.archived || app.archived {
        return Err(AdminError::Invalid(format!(
            "cannot issue a token for archived {}",
            if user.archived { "user" } else { "app" }
        )));
    }
    ledger
        .add_member(app_id, user_id, MemberRole::Customer)
        .await?;
    let (token, claims) = tokens.issue(user_id, app_id, scope, ttl)?;
    Ok(json!({
        "token": token,
        "jti": claims.jti,
        "expiresAt": claims.exp,
    }))
}

/// Revokes an access token until its natural expiry.
///
/// # Errors
///
/// [`AdminError::Credential`] if the token is invalid or already expired.
pub async fn revoke_token(
    ledger: &Ledger,
    tokens: &TokenAuthority,
    token: &str,
) -> Result<Value, AdminError> {
    let claims = tokens.decode(token)?;
    ledger
        .revoke_token(&claims.jti, UnixTimestamp::from_secs(claims.exp))
        .await?;
    Ok(json!({ "revoked": claims.jti, "expiresAt": claims.exp }))
}

/// Archives a user, app or API key.
///
/// # Errors
///
/// [`AdminError::Ledger`] if the record does not exist.
pub async fn archive(ledger: &Ledger, kind: ArchiveKind, id: &str) -> Result<Value, AdminError> {
    match kind {
        ArchiveKind::User => ledger.archive_user(id).await?,
        ArchiveKind::App => ledger.archive_app(id).await?,
        ArchiveKind::ApiKey => ledger.archive_api_key(id).await?,
    }
    Ok(json!({ "archived": id }))
}

/// Credits a user's prepaid balance. Repeating `reference` is a no-op.
///
/// # Errors
///
/// [`AdminError::Ledger`] for a non-positive amount or unknown user.
pub async fn credit(
    ledger: &Ledger,
    user_id: &str,
    amount: Usd,
    reference: &str,
) -> Result<Value, AdminError> {
    let credited = ledger.credit_user(user_id, amount, reference).await?;
    let balance = ledger.user_balance(user_id).await?;
    Ok(json!({ "credited": credited, "balance": balance }))
}

/// Adds funds to an app's spend pool.
///
/// # Errors
///
/// [`AdminError::Ledger`] for a negative amount or unknown app.
pub async fn fund_pool(
    ledger: &Ledger,
    app_id: &str,
    amount: Usd,
    per_user_limit: Option<Usd>,
) -> Result<Value, AdminError> {
    let pool = ledger.fund_spend_pool(app_id, amount, per_user_limit).await?;
    Ok(json!(pool))
}

/// A user's prepaid balance.
///
/// # Errors
///
/// [`AdminError::Ledger`] for an unknown user.
pub async fn balance(ledger: &Ledger, user_id: &str) -> Result<Value, AdminError> {
    Ok(json!(ledger.user_balance(user_id).await?))
}

/// Pending payouts per recipient.
///
/// # Errors
///
/// [`AdminError::Ledger`] on database failure.
pub async fn list_payouts(ledger: &Ledger) -> Result<Value, AdminError> {
    Ok(json!(ledger.pending_payouts().await?))
}

/// Marks a recipient's pending payouts as paid.
///
/// # Errors
///
/// [`AdminError::Invalid`] when nothing is pending for the recipient.
pub async fn complete_payouts(
    ledger: &Ledger,
    kind: RecipientKind,
    recipient_id: &str,
) -> Result<Value, AdminError> {
    let batch = ledger
        .complete_payout_batch(kind, recipient_id)
        .await?
        .ok_or_else(|| {
            AdminError::Invalid(format!("no pending payouts for {kind} {recipient_id}"))
        })?;
    Ok(json!(batch))
}

/// Optionally retries pending settlements, then lists what still needs an
/// operator.
///
/// # Errors
///
/// [`AdminError::Invalid`] when a retry is asked for with x402 disabled.
pub async fn reconcile(
    ledger: &Ledger,
    engine: Option<&SettlementEngine>,
    retry: bool,
) -> Result<Value, AdminError> {
    let retried = if retry {
        let engine = engine
            .ok_or_else(|| AdminError::Invalid("x402 is not configured".into()))?;
        let report = engine.reconcile_pending().await?;
        let failed: Vec<Value> = report
            .failed
            .iter()
            .map(|(id, reason)| json!({ "transactionId": id, "reason": reason }))
            .collect();
        json!({ "completed": report.completed, "failed": failed })
    } else {
        Value::Null
    };
    let open = ledger.transactions_needing_reconciliation().await?;
    Ok(json!({ "retried": retried, "open": open }))
}

/// Marks a reconciliation item as handled.
///
/// # Errors
///
/// [`AdminError::Ledger`] for an unknown item.
pub async fn resolve(ledger: &Ledger, item_id: i64) -> Result<Value, AdminError> {
    ledger.resolve_reconciliation_item(item_id).await?;
    Ok(json!({ "resolved": item_id }))
}
