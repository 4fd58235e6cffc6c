//! Anthropic messages API.

use axum::http::{HeaderMap, HeaderValue};
use serde_json::Value;
use tollgate::BillingError;
use url::Url;

use super::{ObservedUsage, ProviderAdapter, ProviderEndpoint, body_model, body_streams, u64_at};

/// API version sent when the caller does not pick one.
pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

/// Adapter for `api.anthropic.com`.
#[derive(Debug, Clone)]
pub struct Anthropic {
    endpoint: ProviderEndpoint,
}

impl Anthropic {
    /// Creates the adapter.
    #[must_use]
    pub const fn new(endpoint: ProviderEndpoint) -> Self {
        Self { endpoint }
    }
}

impl ProviderAdapter for Anthropic {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn upstream_url(&self, path: &str, query: Option<&str>) -> Result<Url, BillingError> {
        self.endpoint.url(path, query)
    }

    fn apply_auth(&self, headers: &mut HeaderMap) -> Result<(), BillingError> {
        self.endpoint.named("x-api-key", headers)?;
        if !headers.contains_key("anthropic-version") {
            headers.insert(
                "anthropic-version",
                HeaderValue::from_static(DEFAULT_ANTHROPIC_VERSION),
            );
        }
        Ok(())
    }

    fn request_model(&self, _path: &str, body: &Value) -> Option<String> {
        body_model(body)
    }

    fn max_output_tokens(&self, path: &str, body: &Value) -> Option<u64> {
        if path.ends_with("/count_tokens") {
            return Some(0);
        }
        body.get("max_tokens").and_then(Value::as_u64)
    }

    fn is_streaming(&self, _path: &str, body: &Value) -> bool {
        body_streams(body)
    }

    fn observe(&self, payload: &Value, usage: &mut ObservedUsage) {
        match payload.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                if let Some(reported) = payload.pointer("/message/usage") {
                    read_usage(reported, usage);
                }
            }
            Some("message_delta") => {
                if let Some(reported) = payload.get("usage") {
                    read_usage(reported, usage);
                }
            }
            Some("content_block_delta") => {
                usage.add_text(payload.pointer("/delta/text").and_then(Value::as_str));
                usage.add_text(payload.pointer("/delta/thinking").and_then(Value::as_str));
            }
            _ => {
                if let Some(reported) = payload.get("usage") {
                    read_usage(reported, usage);
                }
                for block in payload
                    .get("content")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    usage.add_text(block.get("text").and_then(Value::as_str));
                }
            }
        }
    }
}

/// Anthropic reports uncached, cache-read and cache-write prompt tokens
/// separately; the cost model wants the total with the cache-read share.
fn read_usage(reported: &Value, usage: &mut ObservedUsage) {
    if let Some(uncached) = u64_at(reported, "/input_tokens") {
        let cache_read = u64_at(reported, "/cache_read_input_tokens").unwrap_or(0);
        let cache_write = u64_at(reported, "/cache_creation_input_tokens").unwrap_or(0);
        usage.input_tokens = Some(uncached + cache_read + cache_write);
        usage.cached_input_tokens = Some(cache_read);
    }
    if let Some(output) = u64_at(reported, "/output_tokens") {
        usage.output_tokens = Some(output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tollgate::pricing::TokenUsage;

    fn adapter() -> Anthropic {
        Anthropic::new(ProviderEndpoint {
            base_url: "https://api.anthropic.com".into(),
            api_key: "sk-ant".into(),
        })
    }

    #[test]
    fn stream_usage_spans_start_and_delta() {
        let a = adapter();
        let mut usage = ObservedUsage::default();
        a.observe(
            &json!({
                "type": "message_start",
                "message": { "usage": { "input_tokens": 20, "cache_read_input_tokens": 100, "output_tokens": 1 } }
            }),
            &mut usage,
        );
        a.observe(
            &json!({ "type": "content_block_delta", "delta": { "type": "text_delta", "text": "Hi!" } }),
            &mut usage,
        );
        a.observe(
            &json!({ "type": "message_delta", "usage": { "output_tokens": 42 } }),
            &mut usage,
        );
        assert_eq!(
            usage.reported(),
            Some(TokenUsage {
                input_tokens: 120,
                output_tokens: 42,
                cached_input_tokens: 100
            })
        );
        assert_eq!(usage.text_chars, 3);
    }

    #[test]
    fn buffered_message_usage() {
        let body = json!({
            "content": [{ "type": "text", "text": "Hello" }],
            "usage": { "input_tokens": 12, "output_tokens": 6 }
        });
        assert_eq!(adapter().parse_usage(&body), Some(TokenUsage::new(12, 6)));
    }

    #[test]
    fn auth_keeps_caller_version() {
        let mut headers = HeaderMap::new();
        headers.insert("anthropic-version", HeaderValue::from_static("2024-01-01"));
        adapter().apply_auth(&mut headers).unwrap();
        assert_eq!(headers["x-api-key"], "sk-ant");
        assert_eq!(headers["anthropic-version"], "2024-01-01");
    }
}
