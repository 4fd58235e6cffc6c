//! Upstream provider adapters and the path-keyed routing table.
//!
//! An adapter knows four things about its provider: where to send a request,
//! how to authenticate it, how big a request can get (for the pre-flight
//! estimate) and where usage shows up in responses and stream events.
//!
//! | Path prefix | Provider |
//! |---|---|
//! | `/v1/chat/completions`, `/v1/responses`, `/v1/embeddings` | [`OpenAi`] |
//! | `/v1/messages` | [`Anthropic`] |
//! | `/v1/models/` | [`Gemini`], `/v1` stripped |
//! | `/v1/router/` | [`OpenRouter`], `/v1/router` stripped |

use std::fmt::Debug;
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use serde_json::Value;
use tollgate::BillingError;
use tollgate::pricing::{TokenUsage, tokens_from_chars};
use url::Url;

mod anthropic;
mod gemini;
mod openai;
mod openrouter;

pub use anthropic::Anthropic;
pub use gemini::Gemini;
pub use openai::OpenAi;
pub use openrouter::OpenRouter;

/// Supported upstream providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// `api.openai.com`
    OpenAi,
    /// `api.anthropic.com`
    Anthropic,
    /// Google Generative Language API.
    Gemini,
    /// `openrouter.ai`
    OpenRouter,
}

impl ProviderKind {
    /// Base URL used when none is configured.
    #[must_use]
    pub const fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com",
            Self::Anthropic => "https://api.anthropic.com",
            Self::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            Self::OpenRouter => "https://openrouter.ai/api/v1",
        }
    }

    /// `(prefix, stripped prefix)` pairs served by this provider.
    #[must_use]
    pub const fn routes(self) -> &'static [(&'static str, Option<&'static str>)] {
        match self {
            Self::OpenAi => &[
                ("/v1/chat/completions", None),
                ("/v1/responses", None),
                ("/v1/embeddings", None),
            ],
            Self::Anthropic => &[("/v1/messages", None)],
            Self::Gemini => &[("/v1/models/", Some("/v1"))],
            Self::OpenRouter => &[("/v1/router/", Some("/v1/router"))],
        }
    }

    /// Builds the adapter for this provider.
    #[must_use]
    pub fn adapter(self, endpoint: ProviderEndpoint) -> Arc<dyn ProviderAdapter> {
        match self {
            Self::OpenAi => Arc::new(OpenAi::new(endpoint)),
            Self::Anthropic => Arc::new(Anthropic::new(endpoint)),
            Self::Gemini => Arc::new(Gemini::new(endpoint)),
            Self::OpenRouter => Arc::new(OpenRouter::new(endpoint)),
        }
    }
}

/// Where a provider lives and the key the proxy uses with it.
#[derive(Clone)]
pub struct ProviderEndpoint {
    /// Base URL the routed path is appended to.
    pub base_url: String,
    /// Provider API key.
    pub api_key: String,
}

impl Debug for ProviderEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEndpoint")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl ProviderEndpoint {
    /// Joins `path` and `query` onto the base URL.
    ///
    /// # Errors
    ///
    /// [`BillingError::Internal`] if the result is not a valid URL.
    pub fn url(&self, path: &str, query: Option<&str>) -> Result<Url, BillingError> {
        let mut url = Url::parse(&format!("{}{path}", self.base_url.trim_end_matches('/')))
            .map_err(|err| BillingError::Internal(format!("invalid upstream url: {err}")))?;
        url.set_query(query.filter(|q| !q.is_empty()));
        Ok(url)
    }

    fn header(&self, name: &'static str, value: String, headers: &mut HeaderMap) -> Result<(), BillingError> {
        let value = HeaderValue::from_str(&value)
            .map_err(|_| BillingError::Internal("provider key is not a valid header value".into()))?;
        headers.insert(HeaderName::from_static(name), value);
        Ok(())
    }

    pub(crate) fn bearer(&self, headers: &mut HeaderMap) -> Result<(), BillingError> {
        self.header("authorization", format!("Bearer {}", self.api_key), headers)
    }

    pub(crate) fn named(&self, name: &'static str, headers: &mut HeaderMap) -> Result<(), BillingError> {
        self.header(name, self.api_key.clone(), headers)
    }
}

/// Usage observed in a response body or accumulated across stream events.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ObservedUsage {
    /// Prompt tokens reported by the provider, cached ones included.
    pub input_tokens: Option<u64>,
    /// Completion tokens reported by the provider.
    pub output_tokens: Option<u64>,
    /// Cache-hit prompt tokens reported by the provider.
    pub cached_input_tokens: Option<u64>,
    /// Characters of generated text seen so far.
    pub text_chars: u64,
}

impl ObservedUsage {
    /// The provider's own numbers, if it reported both sides.
    #[must_use]
    pub fn reported(&self) -> Option<TokenUsage> {
        Some(TokenUsage {
            input_tokens: self.input_tokens?,
            output_tokens: self.output_tokens?,
            cached_input_tokens: self.cached_input_tokens.unwrap_or(0).min(self.input_tokens?),
        })
    }

    /// Whether anything billable was generated.
    #[must_use]
    pub fn produced_output(&self) -> bool {
        self.text_chars > 0 || self.output_tokens.is_some_and(|tokens| tokens > 0)
    }

    /// Usage to bill: reported counts where present, otherwise the pre-flight
    /// input estimate and generated characters over four.
    #[must_use]
    pub fn resolve(&self, estimated_input_tokens: u64) -> TokenUsage {
        let input_tokens = self.input_tokens.unwrap_or(estimated_input_tokens);
        TokenUsage {
            input_tokens,
            output_tokens: self
                .output_tokens
                .unwrap_or_else(|| tokens_from_chars(self.text_chars)),
            cached_input_tokens: self.cached_input_tokens.unwrap_or(0).min(input_tokens),
        }
    }

    pub(crate) fn add_text(&mut self, text: Option<&str>) {
        if let Some(text) = text {
            self.text_chars += text.chars().count() as u64;
        }
    }
}

/// One upstream LLM provider.
pub trait ProviderAdapter: Debug + Send + Sync {
    /// Stable provider name, stored on transactions.
    fn name(&self) -> &'static str;

    /// Upstream URL for the routed path.
    ///
    /// # Errors
    ///
    /// [`BillingError::Internal`] on a malformed base URL.
    fn upstream_url(&self, path: &str, query: Option<&str>) -> Result<Url, BillingError>;

    /// Adds the provider credential to the outgoing headers.
    ///
    /// # Errors
    ///
    /// [`BillingError::Internal`] if the configured key is not a header value.
    fn apply_auth(&self, headers: &mut HeaderMap) -> Result<(), BillingError>;

    /// Model the request targets.
    fn request_model(&self, path: &str, body: &Value) -> Option<String>;

    /// Output cap the request asks for. `Some(0)` for calls that generate no text.
    fn max_output_tokens(&self, path: &str, body: &Value) -> Option<u64>;

    /// Whether the upstream will answer with an event stream.
    fn is_streaming(&self, path: &str, body: &Value) -> bool;

    /// Adjusts the request body before forwarding. Returns `true` if it changed.
    fn prepare_body(&self, _path: &str, _body: &mut Value) -> bool {
        false
    }

    /// Folds a response body or a single stream event into `usage`.
    fn observe(&self, payload: &Value, usage: &mut ObservedUsage);

    /// Usage reported in a buffered response body.
    fn parse_usage(&self, body: &Value) -> Option<TokenUsage> {
        let mut usage = ObservedUsage::default();
        self.observe(body, &mut usage);
        usage.reported()
    }
}

#[derive(Debug, Clone)]
struct Route {
    prefix: String,
    strip: Option<String>,
    adapter: Arc<dyn ProviderAdapter>,
}

/// Chooses a provider by request path.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: Vec<Route>,
}

/// A matched route.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    /// Provider serving the path.
    pub adapter: Arc<dyn ProviderAdapter>,
    /// Path to append to the provider's base URL.
    pub upstream_path: String,
}

impl RoutingTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one prefix.
    #[must_use]
    pub fn route(
        mut self,
        prefix: impl Into<String>,
        strip: Option<&str>,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> Self {
        self.routes.push(Route {
            prefix: prefix.into(),
            strip: strip.map(str::to_owned),
            adapter,
        });
        self
    }

    /// Adds every standard prefix of `kind`.
    #[must_use]
    pub fn register(mut self, kind: ProviderKind, endpoint: ProviderEndpoint) -> Self {
        let adapter = kind.adapter(endpoint);
        for (prefix, strip) in kind.routes() {
            self = self.route(*prefix, *strip, Arc::clone(&adapter));
        }
        self
    }

    /// Number of prefixes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// `true` when no provider is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Longest matching prefix. A prefix matches whole segments only, so
    /// `/v1/messages` does not match `/v1/messagesfoo`.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<ResolvedRoute> {
        self.routes
            .iter()
            .filter(|route| prefix_matches(&route.prefix, path))
            .max_by_key(|route| route.prefix.len())
            .map(|route| {
                let upstream_path = route
                    .strip
                    .as_deref()
                    .and_then(|strip| path.strip_prefix(strip))
                    .unwrap_or(path);
                ResolvedRoute {
                    adapter: Arc::clone(&route.adapter),
                    upstream_path: upstream_path.to_owned(),
                }
            })
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    path.strip_prefix(prefix).is_some_and(|rest| {
        rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/')
    })
}

/// Reads a non-negative integer field.
pub(crate) fn u64_at(value: &Value, pointer: &str) -> Option<u64> {
    value.pointer(pointer).and_then(Value::as_u64)
}

/// Reads the string `model` field.
pub(crate) fn body_model(body: &Value) -> Option<String> {
    body.get("model")
        .and_then(Value::as_str)
        .filter(|model| !model.is_empty())
        .map(str::to_owned)
}

/// `stream: true` in the body.
pub(crate) fn body_streams(body: &Value) -> bool {
    body.get("stream").and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(base: &str) -> ProviderEndpoint {
        ProviderEndpoint {
            base_url: base.into(),
            api_key: "sk-test".into(),
        }
    }

    fn table() -> RoutingTable {
        RoutingTable::new()
            .register(ProviderKind::OpenAi, endpoint("https://api.openai.com"))
            .register(ProviderKind::Anthropic, endpoint("https://api.anthropic.com"))
            .register(
                ProviderKind::Gemini,
                endpoint("https://generativelanguage.googleapis.com/v1beta"),
            )
            .register(ProviderKind::OpenRouter, endpoint("https://openrouter.ai/api/v1"))
    }

    #[test]
    fn routes_by_prefix() {
        let table = table();
        let route = table.resolve("/v1/chat/completions").unwrap();
        assert_eq!(route.adapter.name(), "openai");
        assert_eq!(route.upstream_path, "/v1/chat/completions");

        let route = table.resolve("/v1/messages").unwrap();
        assert_eq!(route.adapter.name(), "anthropic");

        let route = table
            .resolve("/v1/models/gemini-2.0-flash:generateContent")
            .unwrap();
        assert_eq!(route.adapter.name(), "gemini");
        assert_eq!(route.upstream_path, "/models/gemini-2.0-flash:generateContent");

        let route = table.resolve("/v1/router/chat/completions").unwrap();
        assert_eq!(route.adapter.name(), "openrouter");
        assert_eq!(route.upstream_path, "/chat/completions");
    }

    #[test]
    fn prefixes_match_whole_segments() {
        let table = table();
        assert!(table.resolve("/v1/messagesfoo").is_none());
        assert!(table.resolve("/v1/messages/count_tokens").is_some());
        assert!(table.resolve("/v1/unknown").is_none());
    }

    #[test]
    fn missing_usage_is_estimated_from_text() {
        let usage = ObservedUsage {
            text_chars: 41,
            ..ObservedUsage::default()
        };
        assert!(usage.reported().is_none());
        assert!(usage.produced_output());
        let resolved = usage.resolve(100);
        assert_eq!(resolved.input_tokens, 100);
        assert_eq!(resolved.output_tokens, 11);
    }

    #[test]
    fn endpoint_debug_hides_key() {
        assert!(!format!("{:?}", endpoint("https://x")).contains("sk-test"));
    }
}
