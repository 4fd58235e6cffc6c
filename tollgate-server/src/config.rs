//! Server configuration.
//!
//! Loaded from a TOML file with `$VAR` / `${VAR}` expansion in string values,
//! so secrets can stay in the environment.
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8402
//!
//! [database]
//! url = "sqlite://tollgate.db"
//!
//! [credentials]
//! jwt_secret = "$TOLLGATE_JWT_SECRET"
//! api_key_pepper = "$TOLLGATE_API_KEY_PEPPER"
//!
//! [pricing]
//! platform_markup = "1.1"
//!
//! [pricing.models."gpt-4o"]
//! input_per_million = "2.50"
//! output_per_million = "10"
//!
//! [providers.openai]
//! api_key = "$OPENAI_API_KEY"
//!
//! [x402]
//! facilitator_url = "https://x402.org/facilitator"
//! network = "eip155:84532"
//! pay_to = "0x..."
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG`: path to the configuration file (default: `tollgate.toml`)
//! - `HOST` / `PORT`: override the bind address
//! - anything referenced by `$VAR` in the file

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use serde::Deserialize;
use tollgate::pricing::{Markup, PriceTable};
use tollgate_http::providers::ProviderKind;
use url::Url;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but cannot be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// Config path.
        path: String,
        /// I/O failure.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listener settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Ledger database.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Token and API key secrets.
    #[serde(default)]
    pub credentials: CredentialsConfig,
    /// Model prices and the platform markup.
    #[serde(default)]
    pub pricing: PricingConfig,
    /// Upstream providers keyed by kind.
    #[serde(default)]
    pub providers: HashMap<ProviderKind, ProviderConfig>,
    /// On-demand payments. Absent disables x402.
    #[serde(default)]
    pub x402: Option<X402Section>,
    /// Overpayment refunds. Absent leaves refunds to an operator.
    #[serde(default)]
    pub refund: Option<RefundConfig>,
    /// Card payment webhook.
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
    /// Background sweeps.
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

/// Listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Port (default: `8402`).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upstream connect timeout.
    #[serde(default = "default_connect_timeout")]
    pub upstream_connect_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            upstream_connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Ledger database.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `SQLite` URL.
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// Token and API key secrets.
#[derive(Clone, Deserialize)]
pub struct CredentialsConfig {
    /// HMAC secret for access tokens.
    #[serde(default)]
    pub jwt_secret: String,
    /// Audience every token must carry.
    #[serde(default = "default_audience")]
    pub audience: String,
    /// Issuer pinned on tokens, if any.
    #[serde(default)]
    pub issuer: Option<String>,
    /// Key for hashing API keys at rest.
    #[serde(default)]
    pub api_key_pepper: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            audience: default_audience(),
            issuer: None,
            api_key_pepper: String::new(),
        }
    }
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("audience", &self.audience)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

/// Model prices and the platform markup.
#[derive(Debug, Clone, Deserialize)]
pub struct PricingConfig {
    /// Multiplier applied on top of every app markup.
    #[serde(default)]
    pub platform_markup: Markup,
    /// Output tokens assumed when a request sets no limit.
    #[serde(default = "default_max_output_tokens")]
    pub default_max_output_tokens: u64,
    /// Per-model prices.
    #[serde(default)]
    pub models: PriceTable,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            platform_markup: Markup::NONE,
            default_max_output_tokens: default_max_output_tokens(),
            models: PriceTable::new(),
        }
    }
}

/// One upstream provider.
#[derive(Clone, Deserialize)]
pub struct ProviderConfig {
    /// Provider API key.
    pub api_key: String,
    /// Overrides the provider's public endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// On-demand payment settings.
///
/// `asset`, `decimals`, `asset_name` and `asset_version` default to the USDC
/// deployment on `network` when it is known.
#[derive(Debug, Clone, Deserialize)]
pub struct X402Section {
    /// Facilitator base URL.
    pub facilitator_url: Url,
    /// CAIP-2 network.
    pub network: String,
    /// Address receiving payments.
    pub pay_to: String,
    /// Token contract.
    #[serde(default)]
    pub asset: Option<String>,
    /// Token decimals.
    #[serde(default)]
    pub decimals: Option<u8>,
    /// EIP-712 domain name of the token.
    #[serde(default)]
    pub asset_name: Option<String>,
    /// EIP-712 domain version of the token.
    #[serde(default)]
    pub asset_version: Option<String>,
    /// Validity window callers may sign for.
    #[serde(default = "default_max_timeout")]
    pub max_timeout_seconds: u64,
    /// How long a challenge stays claimable.
    #[serde(default = "default_challenge_ttl")]
    pub challenge_ttl_secs: u64,
    /// Facilitator request timeout.
    #[serde(default = "default_facilitator_timeout")]
    pub facilitator_timeout_secs: u64,
}

/// Overpayment refund wallet.
#[derive(Clone, Deserialize)]
pub struct RefundConfig {
    /// Hex private key of the refund wallet.
    pub private_key: String,
    /// RPC endpoints keyed by CAIP-2 network.
    #[serde(default)]
    pub rpc_urls: HashMap<String, Url>,
    /// How long to wait for a refund to be mined.
    #[serde(default = "default_receipt_timeout")]
    pub receipt_timeout_secs: u64,
}

impl std::fmt::Debug for RefundConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefundConfig")
            .field("rpc_urls", &self.rpc_urls.keys().collect::<Vec<_>>())
            .field("receipt_timeout_secs", &self.receipt_timeout_secs)
            .finish_non_exhaustive()
    }
}

/// Card payment webhook.
#[derive(Clone, Deserialize)]
pub struct WebhookConfig {
    /// Signing secret shared with the payment processor.
    pub secret: String,
}

impl std::fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookConfig").finish_non_exhaustive()
    }
}

/// Background sweep cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    /// Seconds between sweeps. `0` disables them.
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
    /// Open reservations older than this are released.
    #[serde(default = "default_stale_reservation")]
    pub stale_reservation_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
            stale_reservation_secs: default_stale_reservation(),
        }
    }
}

const fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_port() -> u16 {
    8402
}

const fn default_connect_timeout() -> u64 {
    10
}

fn default_database_url() -> String {
    "sqlite://tollgate.db".to_owned()
}

const fn default_max_connections() -> u32 {
    8
}

fn default_audience() -> String {
    "tollgate".to_owned()
}

const fn default_max_output_tokens() -> u64 {
    4096
}

const fn default_max_timeout() -> u64 {
    300
}

const fn default_challenge_ttl() -> u64 {
    300
}

const fn default_facilitator_timeout() -> u64 {
    30
}

const fn default_receipt_timeout() -> u64 {
    60
}

const fn default_sweep_interval() -> u64 {
    60
}

const fn default_stale_reservation() -> u64 {
    900
}

impl Config {
    /// Loads configuration from `path`. A missing file yields the defaults.
    ///
    /// `$VAR` / `${VAR}` references are expanded from the process
    /// environment before parsing, then `HOST` and `PORT` override the file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = if path.exists() {
            std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
            String::new()
        };
        Self::parse(&content)
    }

    /// Parses configuration text, applying env expansion and overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed TOML.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(content);
        let mut config: Self = toml::from_str(&expanded)?;

        if let Ok(host) = std::env::var("HOST") {
            if let Ok(addr) = host.parse() {
                config.server.host = addr;
            }
        }
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(p) = port.parse() {
                config.server.port = p;
            }
        }
        Ok(config)
    }

    /// Checks the settings `serve` cannot run without.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first problem found.
    pub fn validate_for_serving(&self) -> Result<(), ConfigError> {
        self.validate_credentials()?;
        if self.pricing.models.is_empty() {
            return Err(ConfigError::Invalid("pricing.models is empty".into()));
        }
        if self.providers.is_empty() {
            return Err(ConfigError::Invalid("no providers configured".into()));
        }
        for (kind, provider) in &self.providers {
            if unresolved(&provider.api_key) {
                return Err(ConfigError::Invalid(format!(
                    "providers.{kind:?}.api_key is not set"
                )));
            }
        }
        if let Some(refund) = &self.refund {
            if self.x402.is_none() {
                return Err(ConfigError::Invalid("[refund] requires [x402]".into()));
            }
            if unresolved(&refund.private_key) {
                return Err(ConfigError::Invalid("refund.private_key is not set".into()));
            }
        }
        Ok(())
    }

    /// Checks the secrets needed to mint or verify credentials.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a secret is empty or unresolved.
    pub fn validate_credentials(&self) -> Result<(), ConfigError> {
        if unresolved(&self.credentials.jwt_secret) {
            return Err(ConfigError::Invalid("credentials.jwt_secret is not set".into()));
        }
        if unresolved(&self.credentials.api_key_pepper) {
            return Err(ConfigError::Invalid(
                "credentials.api_key_pepper is not set".into(),
            ));
        }
        Ok(())
    }
}

fn unresolved(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value.starts_with('$')
}

/// Expands `$VAR` and `${VAR}` patterns from environment variables.
///
/// Unresolved variables are left as-is.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }
        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }

        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if braced {
                if c == '}' {
                    chars.next();
                    break;
                }
            } else if !c.is_ascii_alphanumeric() && c != '_' {
                break;
            }
            name.push(c);
            chars.next();
        }

        match std::env::var(&name) {
            Ok(value) if !name.is_empty() => result.push_str(&value),
            _ => {
                result.push('$');
                if braced {
                    result.push('{');
                }
                result.push_str(&name);
                if braced && !name.is_empty() {
                    result.push('}');
                }
            }
        }
    }

    result
}
