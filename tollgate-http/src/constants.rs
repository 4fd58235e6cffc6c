//! Header names used by the proxy and the x402 exchange.

/// Caller resubmission carrying a base64 `PaymentPayload` (client → server).
pub const X_PAYMENT_HEADER: &str = "x-payment";

/// Base64 settle receipt on buffered x402 responses (server → client).
pub const PAYMENT_RESPONSE_HEADER: &str = "payment-response";

/// Base64 copy of the 402 challenge body (server → client).
pub const PAYMENT_REQUIRED_HEADER: &str = "payment-required";

/// Ledger transaction id of a billed call.
pub const TRANSACTION_HEADER: &str = "x-tollgate-transaction";

/// Sent to the facilitator on `/settle`; carries the transaction id.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Anthropic SDK credential header.
pub const X_API_KEY_HEADER: &str = "x-api-key";

/// Gemini SDK credential header.
pub const X_GOOG_API_KEY_HEADER: &str = "x-goog-api-key";

/// Stripe-style webhook signature header.
pub const WEBHOOK_SIGNATURE_HEADER: &str = "stripe-signature";

/// Headers the browser may read off a proxied response.
pub const EXPOSED_HEADERS: [&str; 3] = [
    PAYMENT_RESPONSE_HEADER,
    PAYMENT_REQUIRED_HEADER,
    TRANSACTION_HEADER,
];
