//! Google Gemini `generateContent` and `streamGenerateContent`.
//!
//! The model is part of the path (`/models/{model}:{method}`), and streamed
//! chunks repeat cumulative `usageMetadata`, so the last one wins.

use axum::http::HeaderMap;
use serde_json::Value;
use tollgate::BillingError;
use url::Url;

use super::{ObservedUsage, ProviderAdapter, ProviderEndpoint, u64_at};

/// Adapter for the Generative Language API.
#[derive(Debug, Clone)]
pub struct Gemini {
    endpoint: ProviderEndpoint,
}

impl Gemini {
    /// Creates the adapter.
    #[must_use]
    pub const fn new(endpoint: ProviderEndpoint) -> Self {
        Self { endpoint }
    }
}

impl ProviderAdapter for Gemini {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn upstream_url(&self, path: &str, query: Option<&str>) -> Result<Url, BillingError> {
        // The SDKs may put the caller's key in `?key=`; it never goes upstream.
        let query = query.map(|query| {
            query
                .split('&')
                .filter(|pair| !pair.is_empty() && !pair.starts_with("key="))
                .collect::<Vec<_>>()
                .join("&")
        });
        self.endpoint.url(path, query.as_deref())
    }

    fn apply_auth(&self, headers: &mut HeaderMap) -> Result<(), BillingError> {
        self.endpoint.named("x-goog-api-key", headers)
    }

    fn request_model(&self, path: &str, _body: &Value) -> Option<String> {
        let rest = path.split("/models/").nth(1)?;
        let model = rest.split(':').next()?;
        (!model.is_empty()).then(|| model.to_owned())
    }

    fn max_output_tokens(&self, path: &str, body: &Value) -> Option<u64> {
        if path.ends_with(":countTokens") || path.ends_with(":embedContent") {
            return Some(0);
        }
        u64_at(body, "/generationConfig/maxOutputTokens")
    }

    fn is_streaming(&self, path: &str, _body: &Value) -> bool {
        path.ends_with(":streamGenerateContent")
    }

    fn observe(&self, payload: &Value, usage: &mut ObservedUsage) {
        if let Some(reported) = payload.get("usageMetadata") {
            if let Some(prompt) = u64_at(reported, "/promptTokenCount") {
                usage.input_tokens = Some(prompt);
            }
            let candidates = u64_at(reported, "/candidatesTokenCount");
            let thoughts = u64_at(reported, "/thoughtsTokenCount");
            if candidates.is_some() || thoughts.is_some() {
                usage.output_tokens = Some(candidates.unwrap_or(0) + thoughts.unwrap_or(0));
            } else if usage.input_tokens.is_some() {
                usage.output_tokens.get_or_insert(0);
            }
            if let Some(cached) = u64_at(reported, "/cachedContentTokenCount") {
                usage.cached_input_tokens = Some(cached);
            }
        }
        for candidate in payload
            .get("candidates")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            for part in candidate
                .pointer("/content/parts")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                usage.add_text(part.get("text").and_then(Value::as_str));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tollgate::pricing::TokenUsage;

    fn adapter() -> Gemini {
        Gemini::new(ProviderEndpoint {
            base_url: "https://generativelanguage.googleapis.com/v1beta".into(),
            api_key: "goog".into(),
        })
    }

    #[test]
    fn model_and_streaming_come_from_path() {
        let path = "/models/gemini-2.0-flash:streamGenerateContent";
        assert_eq!(
            adapter().request_model(path, &json!({})).as_deref(),
            Some("gemini-2.0-flash")
        );
        assert!(adapter().is_streaming(path, &json!({})));
        assert!(!adapter().is_streaming("/models/gemini-2.0-flash:generateContent", &json!({})));
    }

    #[test]
    fn caller_key_is_dropped_from_query() {
        let url = adapter()
            .upstream_url(
                "/models/gemini-2.0-flash:streamGenerateContent",
                Some("alt=sse&key=tg_secret"),
            )
            .unwrap();
        assert_eq!(url.query(), Some("alt=sse"));
    }

    #[test]
    fn usage_metadata_counts_thoughts_as_output() {
        let body = json!({
            "candidates": [{ "content": { "parts": [{ "text": "Hi" }] } }],
            "usageMetadata": {
                "promptTokenCount": 50,
                "candidatesTokenCount": 10,
                "thoughtsTokenCount": 5,
                "cachedContentTokenCount": 20
            }
        });
        assert_eq!(
            adapter().parse_usage(&body),
            Some(TokenUsage {
                input_tokens: 50,
                output_tokens: 15,
                cached_input_tokens: 20
            })
        );
    }
}
