//! Builds the running gateway from [`Config`].

use std::sync::Arc;
use std::time::Duration;

use alloy_signer_local::PrivateKeySigner;
use tokio_util::sync::CancellationToken;
use tollgate::credential::{ApiKeyHasher, CredentialVerifier, TokenAuthority};
use tollgate::pricing::CostModel;
use tollgate::settlement::Facilitator;
use tollgate_evm::networks::usdc;
use tollgate_evm::{Erc20RefundSender, RefundError};
use tollgate_http::facilitator_client::{FacilitatorClient, FacilitatorClientError};
use tollgate_http::paygate::{Paygate, X402Config};
use tollgate_http::providers::{ProviderEndpoint, RoutingTable};
use tollgate_http::settlement::SettlementEngine;
use tollgate_http::{Gateway, GatewayState};
use tollgate_ledger::{Ledger, LedgerError};

use crate::config::{Config, ConfigError, MaintenanceConfig, RefundConfig, X402Section};

/// Errors raised while assembling the gateway.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// Configuration is missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The ledger could not be opened.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// The facilitator client could not be built.
    #[error(transparent)]
    Facilitator(#[from] FacilitatorClientError),
    /// The refund wallet could not be set up.
    #[error(transparent)]
    Refund(#[from] RefundError),
    /// The upstream HTTP client could not be built.
    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Opens the configured ledger.
///
/// # Errors
///
/// [`LedgerError`] if the database cannot be opened or migrated.
pub async fn open_ledger(config: &Config) -> Result<Ledger, LedgerError> {
    Ledger::connect(&config.database.url, config.database.max_connections).await
}

/// The token authority for minting and decoding access tokens.
///
/// # Errors
///
/// [`ConfigError::Invalid`] if the signing secrets are unset.
pub fn token_authority(config: &Config) -> Result<TokenAuthority, ConfigError> {
    config.validate_credentials()?;
    let credentials = &config.credentials;
    Ok(TokenAuthority::new(
        credentials.jwt_secret.as_bytes(),
        credentials.audience.clone(),
        credentials.issuer.clone(),
    ))
}

/// The keyed hasher API keys are stored under.
///
/// # Errors
///
/// [`ConfigError::Invalid`] if the pepper is unset.
pub fn api_key_hasher(config: &Config) -> Result<ApiKeyHasher, ConfigError> {
    config.validate_credentials()?;
    Ok(ApiKeyHasher::new(config.credentials.api_key_pepper.as_bytes()))
}

/// Resolves payment settings, filling token details from the known USDC
/// deployment on the configured network.
///
/// # Errors
///
/// [`ConfigError::Invalid`] if the network is unknown and the token is not
/// fully specified.
pub fn x402_config(section: &X402Section) -> Result<X402Config, ConfigError> {
    let known = usdc(&section.network);
    let missing = |field: &str| {
        ConfigError::Invalid(format!(
            "x402.{field} is required for network {}",
            section.network
        ))
    };
    let asset = match (&section.asset, &known) {
        (Some(asset), _) => asset.clone(),
        (None, Some(usdc)) => usdc.address.to_string(),
        (None, None) => return Err(missing("asset")),
    };
    let decimals = section
        .decimals
        .or_else(|| known.as_ref().map(|usdc| usdc.decimals))
        .ok_or_else(|| missing("decimals"))?;
    let asset_name = section
        .asset_name
        .clone()
        .or_else(|| known.as_ref().map(|usdc| usdc.name.to_owned()))
        .ok_or_else(|| missing("asset_name"))?;
    let asset_version = section
        .asset_version
        .clone()
        .or_else(|| known.as_ref().map(|usdc| usdc.version.to_owned()))
        .ok_or_else(|| missing("asset_version"))?;

    Ok(X402Config {
        network: section.network.clone(),
        asset,
        decimals,
        pay_to: section.pay_to.clone(),
        asset_name,
        asset_version,
        max_timeout_seconds: section.max_timeout_seconds,
        challenge_ttl_secs: section.challenge_ttl_secs,
    })
}

fn facilitator_client(
    http: &reqwest::Client,
    section: &X402Section,
) -> Result<FacilitatorClient, FacilitatorClientError> {
    let mut base_url = section.facilitator_url.clone();
    if !base_url.path().ends_with('/') {
        let path = format!("{}/", base_url.path());
        base_url.set_path(&path);
    }
    Ok(FacilitatorClient::with_client(http.clone(), base_url)?
        .with_timeout(Duration::from_secs(section.facilitator_timeout_secs)))
}

fn refund_sender(refund: &RefundConfig) -> Result<Erc20RefundSender, BootstrapError> {
    let signer: PrivateKeySigner = refund
        .private_key
        .trim()
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("refund.private_key: {e}")))?;
    let mut sender = Erc20RefundSender::new(signer)
        .with_receipt_timeout(Duration::from_secs(refund.receipt_timeout_secs));
    for (network, rpc_url) in &refund.rpc_urls {
        sender = sender.with_chain(network, rpc_url.clone())?;
    }
    if refund.rpc_urls.is_empty() {
        tracing::warn!("Refund wallet configured without RPC endpoints, refunds will be flagged");
    }
    Ok(sender)
}

/// The settlement engine alone, for operator commands that retry settlements
/// without serving traffic. `None` when x402 is disabled.
///
/// # Errors
///
/// [`BootstrapError`] if the facilitator or refund wallet cannot be set up.
pub fn settlement_engine(
    config: &Config,
    ledger: &Ledger,
) -> Result<Option<SettlementEngine>, BootstrapError> {
    let Some(section) = &config.x402 else {
        return Ok(None);
    };
    let http = reqwest::Client::builder().build()?;
    let facilitator: Arc<dyn Facilitator> = Arc::new(facilitator_client(&http, section)?);
    Ok(Some(engine(config, ledger, facilitator)?))
}

fn engine(
    config: &Config,
    ledger: &Ledger,
    facilitator: Arc<dyn Facilitator>,
) -> Result<SettlementEngine, BootstrapError> {
    let mut engine = SettlementEngine::new(ledger.clone(), facilitator);
    if let Some(refund) = &config.refund {
        let sender = refund_sender(refund)?;
        tracing::info!(wallet = %sender.address(), "Overpayment refunds enabled");
        engine = engine.with_refund_sender(Arc::new(sender));
    }
    Ok(engine)
}

/// Assembles the gateway: credentials, prices, provider routes, and x402 and
/// the payment webhook when configured.
///
/// # Errors
///
/// [`BootstrapError`] for any unusable setting.
pub fn build_gateway(config: &Config, ledger: Ledger) -> Result<Gateway, BootstrapError> {
    config.validate_for_serving()?;

    let verifier = CredentialVerifier::new(
        token_authority(config)?,
        api_key_hasher(config)?,
        Arc::new(ledger.clone()),
    );
    let costs = CostModel::new(
        config.pricing.models.clone(),
        config.pricing.platform_markup,
        config.pricing.default_max_output_tokens,
    );

    let mut routes = RoutingTable::new();
    for (kind, provider) in &config.providers {
        let base_url = provider
            .base_url
            .clone()
            .unwrap_or_else(|| kind.default_base_url().to_owned());
        tracing::info!(provider = ?kind, %base_url, "Registered provider");
        routes = routes.register(
            *kind,
            ProviderEndpoint {
                base_url,
                api_key: provider.api_key.clone(),
            },
        );
    }

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.server.upstream_connect_timeout_secs))
        .build()?;

    let mut gateway = Gateway::new(ledger.clone(), verifier, costs, routes, http.clone());

    if let Some(section) = &config.x402 {
        let x402 = x402_config(section)?;
        let facilitator: Arc<dyn Facilitator> = Arc::new(facilitator_client(&http, section)?);
        tracing::info!(
            network = %x402.network,
            asset = %x402.asset,
            pay_to = %x402.pay_to,
            facilitator = %section.facilitator_url,
            "x402 payments enabled"
        );
        let settlement = engine(config, &ledger, Arc::clone(&facilitator))?;
        gateway = gateway.with_x402(Paygate::new(ledger, facilitator, x402), settlement);
    } else {
        tracing::info!("x402 disabled, unfunded calls are refused");
    }

    if let Some(webhook) = &config.webhook {
        gateway = gateway.with_webhook_secret(webhook.secret.clone());
    }

    Ok(gateway)
}

/// One maintenance pass: releases stale holds, expires challenges, purges
/// old revocations and retries pending settlements.
pub async fn sweep(gateway: &GatewayState, maintenance: &MaintenanceConfig) {
    let ledger = &gateway.ledger;
    if let Err(err) = ledger
        .release_stale_reservations(maintenance.stale_reservation_secs)
        .await
    {
        tracing::warn!(error = %err, "Stale reservation sweep failed");
    }
    match ledger
        .expire_challenges(maintenance.stale_reservation_secs)
        .await
    {
        Ok(0) => {}
        Ok(expired) => tracing::debug!(expired, "Expired x402 challenges"),
        Err(err) => tracing::warn!(error = %err, "Challenge expiry failed"),
    }
    if let Err(err) = ledger.purge_expired_revocations().await {
        tracing::warn!(error = %err, "Revocation purge failed");
    }
    if let Some(settlement) = &gateway.settlement {
        if let Err(err) = settlement.reconcile_pending().await {
            tracing::warn!(error = %err, "Settlement reconcile failed");
        }
    }
}

/// Runs [`sweep`] every `interval_secs` until `token` is cancelled.
pub async fn run_maintenance(
    gateway: GatewayState,
    maintenance: MaintenanceConfig,
    token: CancellationToken,
) {
    if maintenance.interval_secs == 0 {
        tracing::info!("Maintenance sweeps disabled");
        return;
    }
    let mut interval = tokio::time::interval(Duration::from_secs(maintenance.interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = interval.tick() => sweep(&gateway, &maintenance).await,
        }
    }
    tracing::debug!("Maintenance loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVING: &str = r#"
        [credentials]
        jwt_secret = "jwt"
        api_key_pepper = "pepper"

        [pricing.models."gpt-4o"]
        input_per_million = 2
        output_per_million = 10

        [providers.openai]
        api_key = "sk-test"
        base_url = "http://127.0.0.1:9"
    "#;

    fn section(network: &str) -> X402Section {
        let config = Config::parse(&format!(
            "[x402]\nfacilitator_url = \"http://127.0.0.1:9/\"\nnetwork = \"{network}\"\npay_to = \"0x00000000000000000000000000000000000000aa\"\n"
        ))
        .unwrap();
        config.x402.unwrap()
    }

    #[test]
    fn known_network_fills_token_details() {
        let x402 = x402_config(&section("eip155:84532")).unwrap();
        assert_eq!(
            x402.asset.to_lowercase(),
            "0x036cbd53842c5426634e7929541ec2318f3dcf7e"
        );
        assert_eq!(x402.decimals, 6);
        assert_eq!(x402.asset_name, "USDC");
        assert_eq!(x402.asset_version, "2");
    }

    #[test]
    fn facilitator_paths_nest_under_the_base_url() {
        let mut section = section("eip155:84532");
        section.facilitator_url = "https://x402.example/facilitator".parse().unwrap();
        let client = facilitator_client(&reqwest::Client::new(), &section).unwrap();
        assert_eq!(
            client.verify_url().as_str(),
            "https://x402.example/facilitator/verify"
        );
        assert_eq!(
            client.settle_url().as_str(),
            "https://x402.example/facilitator/settle"
        );
    }

    #[test]
    fn unknown_network_needs_explicit_asset() {
        let err = x402_config(&section("eip155:999999")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid configuration: x402.asset is required for network eip155:999999"
        );
    }

    #[tokio::test]
    async fn builds_a_prepaid_only_gateway() {
        let config = Config::parse(SERVING).unwrap();
        let ledger = Ledger::in_memory().await.unwrap();
        let gateway = build_gateway(&config, ledger).unwrap();
        assert!(gateway.paygate.is_none());
        assert!(gateway.webhook_secret.is_none());
        assert_eq!(gateway.routes.len(), 1);
        assert!(settlement_engine(&config, &gateway.ledger).unwrap().is_none());
    }

    #[tokio::test]
    async fn builds_an_x402_gateway_with_refunds() {
        let config = Config::parse(&format!(
            "{SERVING}
            [x402]
            facilitator_url = \"http://127.0.0.1:9/\"
            network = \"eip155:8453\"
            pay_to = \"0x00000000000000000000000000000000000000aa\"

            [refund]
            private_key = \"0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318\"
            rpc_urls = {{ \"eip155:8453\" = \"http://127.0.0.1:8545\" }}

            [webhook]
            secret = \"whsec_test\"
            "
        ))
        .unwrap();
        let ledger = Ledger::in_memory().await.unwrap();
        let gateway = build_gateway(&config, ledger).unwrap();
        let paygate = gateway.paygate.as_ref().unwrap();
        assert_eq!(paygate.config().asset_name, "USD Coin");

        assert!(gateway.settlement.is_some());
        assert_eq!(gateway.webhook_secret.as_deref(), Some("whsec_test"));
    }

    #[tokio::test]
    async fn sweep_releases_stale_holds() {
        use tollgate::money::Usd;
        use tollgate::pricing::Markup;
        use tollgate_ledger::NewApp;

        let config = Config::parse(SERVING).unwrap();
        let ledger = Ledger::in_memory().await.unwrap();
        let user = ledger.create_user(None).await.unwrap();
        let app = ledger
            .create_app(NewApp {
                name: "demo".into(),
                markup: Markup::NONE,
                owner_user_id: user.id.clone(),
                referrer_user_id: None,
                referral_share: rust_decimal::Decimal::ZERO,
            })
            .await
            .unwrap();
        ledger
            .credit_user(&user.id, Usd::parse("1").unwrap(), "seed")
            .await
            .unwrap();
        let hold = ledger
            .reserve_from_user(&user.id, &app.id, Usd::parse("0.4").unwrap())
            .await
            .unwrap()
            .unwrap();
        let gateway: GatewayState = Arc::new(build_gateway(&config, ledger).unwrap());

        let maintenance = MaintenanceConfig {
            interval_secs: 1,
            stale_reservation_secs: 900,
        };
        sweep(&gateway, &maintenance).await;
        let balance = gateway.ledger.user_balance(&user.id).await.unwrap();
        assert_eq!(balance.balance, Usd::parse("0.6").unwrap());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let maintenance = MaintenanceConfig {
            stale_reservation_secs: 0,
            ..maintenance
        };
        sweep(&gateway, &maintenance).await;
        let balance = gateway.ledger.user_balance(&user.id).await.unwrap();
        assert_eq!(balance.balance, Usd::parse("1").unwrap());
        assert!(gateway.ledger.reservation(&hold.id).await.is_ok());
    }
}
