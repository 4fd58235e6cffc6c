//! The `tollgate` binary.
//!
//! # Usage
//!
//! ```bash
//! tollgate init-db
//! tollgate create-user --email dev@example.com
//! tollgate serve
//! RUST_LOG=tollgate_http=debug tollgate --config prod.toml serve
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG`: path to the TOML configuration file (default: `tollgate.toml`)
//! - `HOST` / `PORT`: override the bind address
//! - `RUST_LOG`: log filter (default: `info`)
//!
//! A `.env` file in the working directory is loaded first.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::Value;
use tollgate::credential::Scope;
use tollgate_http::GatewayState;
use tracing_subscriber::EnvFilter;

use tollgate_server::admin::{self, AppSpec};
use tollgate_server::app::{self, api_key_hasher, build_gateway, open_ledger, token_authority};
use tollgate_server::cli::{Cli, Command, PayoutAction};
use tollgate_server::config::Config;
use tollgate_server::util::SigDown;

type BoxError = Box<dyn std::error::Error>;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        tracing::error!("tollgate failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), BoxError> {
    let config = Config::load(&cli.config)?;
    match cli.command {
        Command::Serve => serve(config).await,
        command => {
            let output = operator_command(&config, command).await?;
            print_json(&output)
        }
    }
}

async fn operator_command(config: &Config, command: Command) -> Result<Value, BoxError> {
    let ledger = open_ledger(config).await?;
    let output = match command {
        Command::Serve => return Err("serve is not an operator command".into()),
        Command::InitDb => {
            ledger.init_schema().await?;
            serde_json::json!({ "database": config.database.url, "schema": "ok" })
        }
        Command::CreateUser { email } => admin::create_user(&ledger, email.as_deref()).await?,
        Command::CreateApp {
            name,
            owner,
            markup,
            referrer,
            referral_share,
        } => {
            let spec = AppSpec {
                name,
                owner,
                markup,
                referrer,
                referral_share,
            };
            admin::create_app(&ledger, spec).await?
        }
        Command::AddMember { app, user, role } => {
            admin::add_member(&ledger, &app, &user, role.into()).await?
        }
        Command::CreateApiKey {
            user,
            app,
            scope,
            name,
        } => {
            let hasher = api_key_hasher(config)?;
            admin::create_api_key(&ledger, &hasher, &user, &app, Scope::new(scope), name.as_deref())
                .await?
        }
        Command::IssueToken {
            user,
            app,
            scope,
            ttl_secs,
        } => {
            let tokens = token_authority(config)?;
            let ttl = Duration::from_secs(ttl_secs);
            admin::issue_token(&ledger, &tokens, &user, &app, Scope::new(scope), ttl).await?
        }
        Command::RevokeToken { token } => {
            let tokens = token_authority(config)?;
            admin::revoke_token(&ledger, &tokens, &token).await?
        }
        Command::Archive { kind, id } => admin::archive(&ledger, kind, &id).await?,
        Command::Credit {
            user,
            amount,
            reference,
        } => admin::credit(&ledger, &user, amount, &reference).await?,
        Command::FundPool {
            app,
            amount,
            per_user_limit,
        } => admin::fund_pool(&ledger, &app, amount, per_user_limit).await?,
        Command::Balance { user } => admin::balance(&ledger, &user).await?,
        Command::Payouts { action } => match action {
            PayoutAction::List => admin::list_payouts(&ledger).await?,
            PayoutAction::Complete { kind, recipient } => {
                admin::complete_payouts(&ledger, kind.into(), &recipient).await?
            }
        },
        Command::Reconcile { retry, resolve } => match resolve {
            Some(item_id) => admin::resolve(&ledger, item_id).await?,
            None => {
                let engine = if retry {
                    app::settlement_engine(config, &ledger)?
                } else {
                    None
                };
                admin::reconcile(&ledger, engine.as_ref(), retry).await?
            }
        },
    };
    ledger.close().await;
    Ok(output)
}

#[allow(clippy::print_stdout)]
fn print_json(value: &Value) -> Result<(), BoxError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn serve(config: Config) -> Result<(), BoxError> {
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        providers = config.providers.len(),
        models = config.pricing.models.len(),
        x402 = config.x402.is_some(),
        "Loaded configuration"
    );

    let ledger = open_ledger(&config).await?;
    let gateway: GatewayState = Arc::new(build_gateway(&config, ledger)?);

    let sig_down = SigDown::try_new()?;
    let token = sig_down.cancellation_token();
    let maintenance = tokio::spawn(app::run_maintenance(
        Arc::clone(&gateway),
        config.maintenance.clone(),
        token.clone(),
    ));

    let router = tollgate_http::router(Arc::clone(&gateway));
    let addr = SocketAddr::new(config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("tollgate listening on http://{addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    sig_down.recv().await;
    if let Err(err) = maintenance.await {
        tracing::warn!(error = %err, "Maintenance task ended abnormally");
    }
    gateway.ledger.close().await;
    tracing::info!("tollgate shut down gracefully");
    Ok(())
}
