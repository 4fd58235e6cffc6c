//! OpenRouter, an OpenAI-compatible aggregator under `/v1/router/`.

use axum::http::HeaderMap;
use serde_json::Value;
use tollgate::BillingError;
use url::Url;

use super::openai::{compatible_max_output_tokens, observe_compatible, request_stream_usage};
use super::{ObservedUsage, ProviderAdapter, ProviderEndpoint, body_model, body_streams};

/// Adapter for `openrouter.ai`.
#[derive(Debug, Clone)]
pub struct OpenRouter {
    endpoint: ProviderEndpoint,
}

impl OpenRouter {
    /// Creates the adapter.
    #[must_use]
    pub const fn new(endpoint: ProviderEndpoint) -> Self {
        Self { endpoint }
    }
}

impl ProviderAdapter for OpenRouter {
    fn name(&self) -> &'static str {
        "openrouter"
    }

    fn upstream_url(&self, path: &str, query: Option<&str>) -> Result<Url, BillingError> {
        self.endpoint.url(path, query)
    }

    fn apply_auth(&self, headers: &mut HeaderMap) -> Result<(), BillingError> {
        self.endpoint.bearer(headers)
    }

    fn request_model(&self, _path: &str, body: &Value) -> Option<String> {
        body_model(body)
    }

    fn max_output_tokens(&self, _path: &str, body: &Value) -> Option<u64> {
        compatible_max_output_tokens(body)
    }

    fn is_streaming(&self, _path: &str, body: &Value) -> bool {
        body_streams(body)
    }

    fn prepare_body(&self, path: &str, body: &mut Value) -> bool {
        path.starts_with("/chat/completions") && request_stream_usage(body)
    }

    fn observe(&self, payload: &Value, usage: &mut ObservedUsage) {
        observe_compatible(payload, usage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn injects_usage_on_routed_chat_path() {
        let adapter = OpenRouter::new(ProviderEndpoint {
            base_url: "https://openrouter.ai/api/v1".into(),
            api_key: "or-test".into(),
        });
        let mut body = json!({ "model": "meta-llama/llama-3-70b", "stream": true });
        assert!(adapter.prepare_body("/chat/completions", &mut body));
        assert_eq!(
            adapter.upstream_url("/chat/completions", None).unwrap().as_str(),
            "https://openrouter.ai/api/v1/chat/completions"
        );
    }
}
