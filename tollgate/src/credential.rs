//! Credential verification.
//!
//! A bearer is either a signed access token (three dot-separated segments) or an
//! opaque API key. Tokens are verified statelessly apart from a revocation lookup
//! on their `jti`. API keys are never stored: the ledger only holds
//! `hex(HMAC-SHA256(secret, key))`, indexed for constant-time lookup.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::timestamp::UnixTimestamp;

type HmacSha256 = Hmac<Sha256>;

/// Clock-skew tolerance applied to token expiry, in seconds.
pub const TOKEN_LEEWAY_SECS: u64 = 5;

/// Prefix of every generated API key.
pub const API_KEY_PREFIX: &str = "tg_";

/// Scope required to invoke upstream models through the proxy.
pub const SCOPE_INVOKE: &str = "llm:invoke";

/// Scope required to read balances.
pub const SCOPE_BALANCE_READ: &str = "balance:read";

/// Scope granting everything.
pub const SCOPE_ALL: &str = "*";

/// Boxed error returned by [`CredentialStore`] implementations.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Why a credential was rejected.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// No bearer was supplied.
    #[error("missing credential")]
    Missing,
    /// Token signature, audience, issuer or shape is wrong.
    #[error("invalid access token: {0}")]
    InvalidToken(#[source] jsonwebtoken::errors::Error),
    /// Token `exp` is past the skew tolerance.
    #[error("access token expired")]
    Expired,
    /// Token `jti` was revoked.
    #[error("access token revoked")]
    Revoked,
    /// No API key matches the presented secret.
    #[error("unknown API key")]
    UnknownKey,
    /// The key, its user, or its app is archived.
    #[error("{0} is archived")]
    Archived(&'static str),
    /// Random generation failed while minting a key.
    #[error("failed to generate key material: {0}")]
    Entropy(getrandom::Error),
    /// Token could not be signed.
    #[error("failed to sign access token: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
    /// The backing store failed.
    #[error("credential store error: {0}")]
    Store(#[source] StoreError),
}

impl CredentialError {
    /// Returns `true` when the failure is the caller's fault (maps to 401).
    #[must_use]
    pub const fn is_unauthorized(&self) -> bool {
        !matches!(self, Self::Store(_) | Self::Entropy(_) | Self::Signing(_))
    }
}

/// A space-separated list of granted scopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(String);

impl Scope {
    /// Wraps a scope string.
    #[must_use]
    pub fn new(scope: impl Into<String>) -> Self {
        Self(scope.into())
    }

    /// A scope granting everything.
    #[must_use]
    pub fn all() -> Self {
        Self(SCOPE_ALL.to_owned())
    }

    /// Returns `true` if `required` (or `*`) is among the granted scopes.
    #[must_use]
    pub fn allows(&self, required: &str) -> bool {
        self.0
            .split_whitespace()
            .any(|granted| granted == SCOPE_ALL || granted == required)
    }

    /// Raw scope string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the caller authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// Signed access token.
    AccessToken,
    /// Opaque API key.
    ApiKey,
}

/// The verified identity behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Billed user.
    pub user_id: String,
    /// App the call is made through.
    pub app_id: String,
    /// Granted scopes.
    pub scope: Scope,
    /// API key id, when authenticated with a key.
    pub api_key_id: Option<String>,
    /// Credential type.
    pub kind: CredentialKind,
}

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Billed user.
    pub user_id: String,
    /// App the token was issued for.
    pub app_id: String,
    /// Granted scopes.
    pub scope: Scope,
    /// Expiry, seconds since the epoch.
    pub exp: u64,
    /// Issue time, seconds since the epoch.
    pub iat: u64,
    /// Unique token id, used for revocation.
    pub jti: String,
    /// Intended audience.
    pub aud: String,
    /// Issuer, when configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// Signs and verifies HS256 access tokens.
#[derive(Clone)]
pub struct TokenAuthority {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    audience: String,
    issuer: Option<String>,
}

impl fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthority")
            .field("audience", &self.audience)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl TokenAuthority {
    /// Creates an authority for `audience`, optionally pinning the issuer.
    #[must_use]
    pub fn new(secret: &[u8], audience: impl Into<String>, issuer: Option<String>) -> Self {
        let audience = audience.into();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = TOKEN_LEEWAY_SECS;
        validation.validate_exp = true;
        validation.set_audience(&[audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "aud"]);
        if let Some(issuer) = &issuer {
            validation.set_issuer(&[issuer.as_str()]);
        }
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            audience,
            issuer,
        }
    }

    /// Mints a token for `(user_id, app_id)` valid for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Signing`] if encoding fails.
    pub fn issue(
        &self,
        user_id: &str,
        app_id: &str,
        scope: Scope,
        ttl: Duration,
    ) -> Result<(String, AccessClaims), CredentialError> {
        let now = UnixTimestamp::now();
        self.issue_at(user_id, app_id, scope, now, now + ttl.as_secs())
    }

    /// Mints a token with explicit `iat` and `exp`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Signing`] if encoding fails.
    pub fn issue_at(
        &self,
        user_id: &str,
        app_id: &str,
        scope: Scope,
        issued_at: UnixTimestamp,
        expires_at: UnixTimestamp,
    ) -> Result<(String, AccessClaims), CredentialError> {
        let claims = AccessClaims {
            user_id: user_id.to_owned(),
            app_id: app_id.to_owned(),
            scope,
            exp: expires_at.as_secs(),
            iat: issued_at.as_secs(),
            jti: uuid::Uuid::new_v4().to_string(),
            aud: self.audience.clone(),
            iss: self.issuer.clone(),
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(CredentialError::Signing)?;
        Ok((token, claims))
    }

    /// Verifies signature, audience, issuer and expiry.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Expired`] or [`CredentialError::InvalidToken`].
    pub fn decode(&self, token: &str) -> Result<AccessClaims, CredentialError> {
        jsonwebtoken::decode::<AccessClaims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => CredentialError::Expired,
                _ => CredentialError::InvalidToken(err),
            })
    }
}

/// Deterministic keyed hash of API keys.
#[derive(Clone)]
pub struct ApiKeyHasher {
    secret: Vec<u8>,
}

impl fmt::Debug for ApiKeyHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyHasher").finish_non_exhaustive()
    }
}

impl ApiKeyHasher {
    /// Creates a hasher keyed with `secret`.
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Returns `hex(HMAC-SHA256(secret, key))`.
    #[must_use]
    pub fn hash(&self, key: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts keys of any length");
        mac.update(key.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Generates a fresh API key (`tg_` followed by 64 hex characters).
///
/// # Errors
///
/// Returns [`CredentialError::Entropy`] if the OS random source fails.
pub fn generate_api_key() -> Result<String, CredentialError> {
    let mut bytes = [0u8; 32];
    getrandom::fill(&mut bytes).map_err(CredentialError::Entropy)?;
    Ok(format!("{API_KEY_PREFIX}{}", hex::encode(bytes)))
}

/// Returns `true` if `bearer` has the three-segment shape of a signed token.
#[must_use]
pub fn looks_like_token(bearer: &str) -> bool {
    let mut segments = 0;
    for segment in bearer.split('.') {
        segments += 1;
        let base64url = segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if segment.is_empty() || !base64url {
            return false;
        }
    }
    segments == 3
}

/// An API key row joined with the archival state of its owner and app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyRecord {
    /// Key id.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Bound app.
    pub app_id: String,
    /// Granted scopes.
    pub scope: Scope,
    /// Key revoked.
    pub key_archived: bool,
    /// User archived.
    pub user_archived: bool,
    /// App archived.
    pub app_archived: bool,
}

/// Storage lookups the verifier needs.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Finds an API key by its keyed hash.
    async fn find_api_key(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, StoreError>;

    /// Returns `true` if a token id was revoked.
    async fn is_token_revoked(&self, jti: &str) -> Result<bool, StoreError>;
}

/// Resolves bearers into [`Principal`]s.
#[derive(Clone)]
pub struct CredentialVerifier {
    tokens: TokenAuthority,
    hasher: ApiKeyHasher,
    store: Arc<dyn CredentialStore>,
}

impl fmt::Debug for CredentialVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVerifier")
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}

impl CredentialVerifier {
    /// Creates a verifier.
    #[must_use]
    pub fn new(tokens: TokenAuthority, hasher: ApiKeyHasher, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            tokens,
            hasher,
            store,
        }
    }

    /// The token authority, for minting.
    #[must_use]
    pub const fn tokens(&self) -> &TokenAuthority {
        &self.tokens
    }

    /// The key hasher, for provisioning.
    #[must_use]
    pub const fn hasher(&self) -> &ApiKeyHasher {
        &self.hasher
    }

    /// Verifies a bearer string.
    ///
    /// # Errors
    ///
    /// Returns a [`CredentialError`]; every variant except
    /// [`CredentialError::Store`] means the caller is unauthorized.
    pub async fn verify(&self, bearer: &str) -> Result<Principal, CredentialError> {
        let bearer = bearer.trim();
        if bearer.is_empty() {
            return Err(CredentialError::Missing);
        }
        let result = if looks_like_token(bearer) {
            self.verify_token(bearer).await
        } else {
            self.verify_api_key(bearer).await
        };
        match &result {
            Ok(principal) => tracing::debug!(
                user_id = %principal.user_id,
                app_id = %principal.app_id,
                kind = ?principal.kind,
                "Credential verified"
            ),
            Err(err) => tracing::debug!(error = %err, "Credential rejected"),
        }
        result
    }

    async fn verify_token(&self, token: &str) -> Result<Principal, CredentialError> {
        let claims = self.tokens.decode(token)?;
        if self
            .store
            .is_token_revoked(&claims.jti)
            .await
            .map_err(CredentialError::Store)?
        {
            return Err(CredentialError::Revoked);
        }
        Ok(Principal {
            user_id: claims.user_id,
            app_id: claims.app_id,
            scope: claims.scope,
            api_key_id: None,
            kind: CredentialKind::AccessToken,
        })
    }

    async fn verify_api_key(&self, key: &str) -> Result<Principal, CredentialError> {
        let record = self
            .store
            .find_api_key(&self.hasher.hash(key))
            .await
            .map_err(CredentialError::Store)?
            .ok_or(CredentialError::UnknownKey)?;
        if record.key_archived {
            return Err(CredentialError::Archived("api key"));
        }
        if record.user_archived {
            return Err(CredentialError::Archived("user"));
        }
        if record.app_archived {
            return Err(CredentialError::Archived("app"));
        }
        Ok(Principal {
            user_id: record.user_id,
            app_id: record.app_id,
            scope: record.scope,
            api_key_id: Some(record.id),
            kind: CredentialKind::ApiKey,
        })
    }
}
