//! `POST /v1/{*path}`: the metered provider proxy.
//!
//! A call is authenticated, priced at its worst case, funded, forwarded and
//! then billed for what it actually used. Funding comes from the app's spend
//! pool, then the user's prepaid balance, then (when enabled) an x402 payment
//! the caller makes in a second request.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{self, HeaderName};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::Response;
use serde_json::Value;
use tollgate::BillingError;
use tollgate::credential::{Principal, SCOPE_INVOKE};
use tollgate::money::Usd;
use tollgate::proto::ResourceInfo;
use tollgate::proto::encoding::encode_header;
use tollgate_ledger::Funding;

use crate::auth::authenticate;
use crate::charge::{CallFunding, PendingCharge};
use crate::constants::{
    PAYMENT_RESPONSE_HEADER, TRANSACTION_HEADER, X_API_KEY_HEADER, X_GOOG_API_KEY_HEADER,
    X_PAYMENT_HEADER,
};
use crate::error::ApiError;
use crate::metering::metered_body;
use crate::providers::ObservedUsage;
use crate::state::GatewayState;

/// Request headers never forwarded upstream.
const STRIPPED_REQUEST_HEADERS: [&str; 13] = [
    "authorization",
    X_API_KEY_HEADER,
    X_GOOG_API_KEY_HEADER,
    X_PAYMENT_HEADER,
    "host",
    "content-length",
    "accept-encoding",
    "connection",
    "keep-alive",
    "proxy-authorization",
    "te",
    "transfer-encoding",
    "upgrade",
];

/// Response headers never relayed back.
const STRIPPED_RESPONSE_HEADERS: [&str; 6] = [
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
    "content-encoding",
    "upgrade",
];

/// Proxies one provider call.
///
/// # Errors
///
/// Every failure before the upstream answers is a [`BillingError`]; upstream
/// error statuses are relayed as-is with nothing billed.
#[tracing::instrument(name = "proxy", skip_all, fields(path = %uri.path()))]
pub async fn proxy(
    State(gateway): State<GatewayState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let principal = authenticate(&gateway.verifier, &headers, SCOPE_INVOKE).await?;
    let path = uri.path();
    let route = gateway
        .routes
        .resolve(path)
        .ok_or_else(|| BillingError::NotFound(format!("no provider serves {path}")))?;
    let adapter = route.adapter;
    let upstream_path = route.upstream_path;

    let mut request: Value = serde_json::from_slice(&body)
        .map_err(|err| ApiError::bad_request(format!("request body is not JSON: {err}")))?;
    let model = adapter
        .request_model(&upstream_path, &request)
        .ok_or_else(|| ApiError::bad_request("request does not name a model"))?;
    let app = gateway.ledger.app(&principal.app_id).await?;
    if app.archived {
        return Err(BillingError::Unauthorized("app is archived".to_owned()).into());
    }
    let estimate = gateway
        .costs
        .estimate(
            &model,
            body.len(),
            adapter.max_output_tokens(&upstream_path, &request),
            app.markup,
        )
        .map_err(BillingError::from)?;
    let streaming = adapter.is_streaming(&upstream_path, &request);

    let body = if adapter.prepare_body(&upstream_path, &mut request) {
        Bytes::from(serde_json::to_vec(&request).map_err(BillingError::internal)?)
    } else {
        body
    };
    let url = adapter.upstream_url(&upstream_path, uri.query())?;
    let mut outgoing = forwarded_headers(&headers);
    adapter.apply_auth(&mut outgoing)?;

    let funding = fund(&gateway, &principal, &headers, estimate.cost.total_cost, path).await?;
    tracing::debug!(
        user_id = %principal.user_id,
        provider = adapter.name(),
        %model,
        estimate = %estimate.cost.total_cost,
        streaming,
        "Forwarding call"
    );
    let charge = PendingCharge::new(
        gateway.clone(),
        principal,
        adapter.name(),
        model,
        app.markup,
        estimate.usage.input_tokens,
        funding,
    );

    let upstream = match gateway
        .http
        .post(url)
        .headers(outgoing)
        .body(body)
        .send()
        .await
    {
        Ok(upstream) => upstream,
        Err(err) => {
            charge.abandon("upstream unreachable").await;
            return Err(BillingError::UpstreamProviderError {
                status: 502,
                message: err.to_string(),
            }
            .into());
        }
    };

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    if !status.is_success() {
        let bytes = match upstream.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(%status, error = %err, "Failed to read upstream error body");
                Bytes::new()
            }
        };
        tracing::info!(%status, "Upstream rejected call; nothing billed");
        charge.abandon(&format!("upstream returned {status}")).await;
        return Ok(relay(status, &upstream_headers, Body::from(bytes)));
    }

    if streaming {
        let body = metered_body(upstream.bytes_stream(), adapter, Box::new(charge));
        return Ok(relay(status, &upstream_headers, body));
    }

    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            charge.abandon("upstream body failed").await;
            return Err(BillingError::UpstreamProviderError {
                status: 502,
                message: err.to_string(),
            }
            .into());
        }
    };
    let mut observed = ObservedUsage::default();
    if let Ok(payload) = serde_json::from_slice::<Value>(&bytes) {
        adapter.observe(&payload, &mut observed);
    }
    let usage = observed.resolve(charge.estimated_input_tokens());

    let mut response = relay(status, &upstream_headers, Body::from(bytes));
    let billed = match charge.commit(usage).await {
        Ok(billed) => billed,
        Err(err) => {
            // The caller already has the answer; the call is flagged as unbilled.
            tracing::error!(error = %err, "Failed to bill call");
            return Ok(response);
        }
    };
    tracing::info!(
        transaction_id = %billed.transaction_id,
        cost = %billed.cost.total_cost,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        "Billed call"
    );
    insert_header(&mut response, TRANSACTION_HEADER, &billed.transaction_id);

    if billed.needs_settlement {
        if let Some(engine) = &gateway.settlement {
            match engine.settle(&billed.transaction_id).await {
                Ok(receipt) => match encode_header(&receipt) {
                    Ok(encoded) => insert_header(&mut response, PAYMENT_RESPONSE_HEADER, &encoded),
                    Err(err) => tracing::error!(error = %err, "Failed to encode settle receipt"),
                },
                Err(err) => tracing::warn!(
                    transaction_id = %billed.transaction_id,
                    error = %err,
                    "Settlement deferred to reconcile"
                ),
            }
        }
    }
    Ok(response)
}

/// Secures funding for `amount`, or returns the 402 to send.
async fn fund(
    gateway: &GatewayState,
    principal: &Principal,
    headers: &HeaderMap,
    amount: Usd,
    path: &str,
) -> Result<CallFunding, ApiError> {
    if let Some(value) = headers.get(X_PAYMENT_HEADER) {
        let paygate = gateway
            .paygate
            .as_ref()
            .ok_or_else(|| ApiError::bad_request("x402 payments are not enabled"))?;
        let header = value
            .to_str()
            .map_err(|_| BillingError::payment("X-Payment header is not ASCII"))?;
        let paid = paygate.accept(principal, header).await?;
        let authorized = Usd::from_asset_units(paid.paid_units, paid.decimals);
        if authorized < amount {
            let reason = format!("payment of {authorized} does not cover this call's {amount}");
            paygate.abandon(paid, &reason).await;
            return Err(BillingError::payment(reason).into());
        }
        return Ok(CallFunding::X402(paid));
    }

    let on_demand = gateway.paygate.is_some();
    match gateway
        .ledger
        .select_funding(&principal.user_id, &principal.app_id, amount, on_demand)
        .await?
    {
        Funding::Reserved(reservation) => Ok(CallFunding::Reserved(reservation)),
        Funding::OnDemand => {
            let Some(paygate) = &gateway.paygate else {
                return Err(BillingError::InsufficientFunds { required: amount }.into());
            };
            let resource = ResourceInfo {
                url: path.to_owned(),
                description: Some("metered LLM call".to_owned()),
                mime_type: None,
            };
            Err(paygate.challenge(principal, amount, Some(resource)).await?)
        }
    }
}

fn forwarded_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut outgoing = HeaderMap::with_capacity(incoming.len());
    for (name, value) in incoming {
        if STRIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        outgoing.append(name.clone(), value.clone());
    }
    outgoing.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    outgoing
}

fn relay(status: StatusCode, upstream: &HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, value) in upstream {
        if STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    response
}

fn insert_header(response: &mut Response, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            response
                .headers_mut()
                .insert(HeaderName::from_static(name), value);
        }
        Err(err) => tracing::error!(header = name, error = %err, "Invalid response header value"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_credentials_are_not_forwarded() {
        let mut incoming = HeaderMap::new();
        incoming.insert("authorization", HeaderValue::from_static("Bearer tg_secret"));
        incoming.insert("x-api-key", HeaderValue::from_static("tg_secret"));
        incoming.insert("x-payment", HeaderValue::from_static("e30="));
        incoming.insert("anthropic-beta", HeaderValue::from_static("tools-2024"));
        incoming.insert("content-length", HeaderValue::from_static("10"));

        let outgoing = forwarded_headers(&incoming);
        assert!(outgoing.get("authorization").is_none());
        assert!(outgoing.get("x-api-key").is_none());
        assert!(outgoing.get("x-payment").is_none());
        assert!(outgoing.get("content-length").is_none());
        assert_eq!(outgoing["anthropic-beta"], "tools-2024");
        assert_eq!(outgoing["content-type"], "application/json");
    }

    #[test]
    fn relay_drops_framing_headers() {
        let mut upstream = HeaderMap::new();
        upstream.insert("content-type", HeaderValue::from_static("text/event-stream"));
        upstream.insert("content-length", HeaderValue::from_static("99"));
        upstream.insert("x-request-id", HeaderValue::from_static("req_1"));
        let response = relay(StatusCode::OK, &upstream, Body::empty());
        assert_eq!(response.headers()["content-type"], "text/event-stream");
        assert_eq!(response.headers()["x-request-id"], "req_1");
        assert!(response.headers().get("content-length").is_none());
    }
}
