//! OpenAI chat completions, responses and embeddings.

use axum::http::HeaderMap;
use serde_json::{Map, Value};
use tollgate::BillingError;
use url::Url;

use super::{ObservedUsage, ProviderAdapter, ProviderEndpoint, body_model, body_streams, u64_at};

/// Adapter for `api.openai.com`.
#[derive(Debug, Clone)]
pub struct OpenAi {
    endpoint: ProviderEndpoint,
}

impl OpenAi {
    /// Creates the adapter.
    #[must_use]
    pub const fn new(endpoint: ProviderEndpoint) -> Self {
        Self { endpoint }
    }
}

impl ProviderAdapter for OpenAi {
    fn name(&self) -> &'static str {
        "openai"
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

    fn max_output_tokens(&self, path: &str, body: &Value) -> Option<u64> {
        if path.starts_with("/v1/embeddings") {
            return Some(0);
        }
        compatible_max_output_tokens(body)
    }

    fn is_streaming(&self, _path: &str, body: &Value) -> bool {
        body_streams(body)
    }

    fn prepare_body(&self, path: &str, body: &mut Value) -> bool {
        path.starts_with("/v1/chat/completions") && request_stream_usage(body)
    }

    fn observe(&self, payload: &Value, usage: &mut ObservedUsage) {
        observe_compatible(payload, usage);
    }
}

/// `max_completion_tokens`, `max_tokens` or `max_output_tokens`, whichever is set.
pub(crate) fn compatible_max_output_tokens(body: &Value) -> Option<u64> {
    ["max_completion_tokens", "max_tokens", "max_output_tokens"]
        .iter()
        .find_map(|field| body.get(*field).and_then(Value::as_u64))
}

/// Forces `stream_options.include_usage = true` on streaming chat requests,
/// overriding a caller's `false`. Returns `true` if the body changed.
pub(crate) fn request_stream_usage(body: &mut Value) -> bool {
    if !body_streams(body) {
        return false;
    }
    let Some(object) = body.as_object_mut() else {
        return false;
    };
    let options = object
        .entry("stream_options")
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(options) = options.as_object_mut() else {
        return false;
    };
    if options.get("include_usage") == Some(&Value::Bool(true)) {
        return false;
    }
    options.insert("include_usage".to_owned(), Value::Bool(true));
    true
}

/// Usage and text for the chat-completions and responses shapes, buffered or
/// streamed.
pub(crate) fn observe_compatible(payload: &Value, usage: &mut ObservedUsage) {
    // Responses API stream: the final event nests the response object.
    if payload.get("type").and_then(Value::as_str) == Some("response.output_text.delta") {
        usage.add_text(payload.get("delta").and_then(Value::as_str));
        return;
    }
    let is_event = payload.get("response").is_some();
    let payload = payload.get("response").unwrap_or(payload);

    if let Some(reported) = payload.get("usage").filter(|u| u.is_object()) {
        if let Some(input) =
            u64_at(reported, "/prompt_tokens").or_else(|| u64_at(reported, "/input_tokens"))
        {
            usage.input_tokens = Some(input);
        }
        if let Some(output) = u64_at(reported, "/completion_tokens")
            .or_else(|| u64_at(reported, "/output_tokens"))
        {
            usage.output_tokens = Some(output);
        } else if usage.input_tokens.is_some() && reported.get("total_tokens").is_some() {
            // Embeddings report prompt and total only.
            usage.output_tokens = Some(0);
        }
        if let Some(cached) = u64_at(reported, "/prompt_tokens_details/cached_tokens")
            .or_else(|| u64_at(reported, "/input_tokens_details/cached_tokens"))
        {
            usage.cached_input_tokens = Some(cached);
        }
    }

    if let Some(choices) = payload.get("choices").and_then(Value::as_array) {
        for choice in choices {
            usage.add_text(choice.pointer("/delta/content").and_then(Value::as_str));
            usage.add_text(choice.pointer("/message/content").and_then(Value::as_str));
            usage.add_text(choice.get("text").and_then(Value::as_str));
        }
    }
    // Streamed text was already counted from the deltas.
    if is_event {
        return;
    }
    if let Some(output) = payload.get("output").and_then(Value::as_array) {
        for item in output {
            for part in item
                .get("content")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                usage.add_text(part.get("text").and_then(Value::as_str));
            }
        }
    }
}
