//! Cost model: model prices, markup and cost breakdowns.
//!
//! Markup compounds additively on the raw provider cost:
//!
//! ```text
//! app_markup_profit      = round9(raw × (app_markup − 1))
//! platform_markup_profit = round9(raw × (platform_markup − 1))
//! total                  = raw + app_markup_profit + platform_markup_profit
//! ```
//!
//! Each component is rounded to the ledger scale before summing, so the three
//! persisted components always add up to the persisted total.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::money::Usd;

const TOKENS_PER_PRICE_UNIT: u64 = 1_000_000;

/// Heuristic characters-per-token ratio used when a provider reports no usage.
pub const CHARS_PER_TOKEN: u64 = 4;

/// Errors produced by the cost model.
#[derive(Debug, thiserror::Error)]
pub enum CostError {
    /// No price is configured for the model.
    #[error("no price configured for model {0:?}")]
    UnpricedModel(String),
    /// A markup multiplier outside of `[1.0, 10.0]`.
    #[error("markup {0} must be between 1.0 and 10.0")]
    MarkupOutOfRange(Decimal),
}

/// Token counts reported by a provider (or estimated) for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens, including cached ones.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
    /// Portion of `input_tokens` served from the provider's prompt cache.
    #[serde(default)]
    pub cached_input_tokens: u64,
}

impl TokenUsage {
    /// Usage with the given input and output counts and no cache hits.
    #[must_use]
    pub const fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cached_input_tokens: 0,
        }
    }

    /// Returns `true` if nothing was consumed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

/// Estimates a token count from a character or byte count.
#[must_use]
pub const fn tokens_from_chars(chars: u64) -> u64 {
    chars.div_ceil(CHARS_PER_TOKEN)
}

/// Published per-million-token prices of one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPrice {
    /// USD per million prompt tokens.
    pub input_per_million: Usd,
    /// USD per million completion tokens.
    pub output_per_million: Usd,
    /// USD per million cached prompt tokens. Falls back to the input price.
    #[serde(default)]
    pub cached_input_per_million: Option<Usd>,
}

impl ModelPrice {
    /// Exact raw provider cost of `usage`, rounded to the ledger scale.
    #[must_use]
    pub fn raw_cost(&self, usage: &TokenUsage) -> Usd {
        let cached = usage.cached_input_tokens.min(usage.input_tokens);
        let uncached = usage.input_tokens - cached;
        let cached_price = self
            .cached_input_per_million
            .unwrap_or(self.input_per_million);

        let per_million = per_token(self.input_per_million, uncached)
            + per_token(cached_price, cached)
            + per_token(self.output_per_million, usage.output_tokens);
        Usd::new(per_million / Decimal::from(TOKENS_PER_PRICE_UNIT)).round_to_ledger()
    }
}

fn per_token(price: Usd, tokens: u64) -> Decimal {
    price.as_decimal() * Decimal::from(tokens)
}

/// Model name to price lookup.
///
/// Lookup tries the exact model name, then the name with any `vendor/` prefix
/// removed (router-style ids such as `openai/gpt-4o`), then the longest
/// configured key that prefixes the model up to a `-`, `/` or `@` boundary
/// (dated snapshots such as `gpt-4o-2024-08-06` resolve to `gpt-4o`, but
/// `gpt-4o` never resolves to `gpt-4`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriceTable {
    models: HashMap<String, ModelPrice>,
}

impl PriceTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a model price.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>, price: ModelPrice) -> Self {
        self.models.insert(model.into(), price);
        self
    }

    /// Number of priced models.
    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Returns `true` if no model is priced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Resolves the price of `model`.
    ///
    /// # Errors
    ///
    /// Returns [`CostError::UnpricedModel`] when nothing matches.
    pub fn lookup(&self, model: &str) -> Result<&ModelPrice, CostError> {
        let bare = model.rsplit_once('/').map_or(model, |(_, name)| name);
        for candidate in [model, bare] {
            if let Some(price) = self.models.get(candidate) {
                return Ok(price);
            }
        }
        self.models
            .iter()
            .filter(|(key, _)| is_segment_prefix(bare, key) || is_segment_prefix(model, key))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, price)| price)
            .ok_or_else(|| CostError::UnpricedModel(model.to_owned()))
    }
}

fn is_segment_prefix(model: &str, key: &str) -> bool {
    model
        .strip_prefix(key)
        .and_then(|rest| rest.chars().next())
        .is_some_and(|next| matches!(next, '-' | '/' | '@'))
}

/// A markup multiplier in `[1.0, 10.0]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Usd", into = "Usd")]
pub struct Markup(Decimal);

impl Markup {
    /// No markup (1.0×).
    pub const NONE: Self = Self(Decimal::ONE);

    /// Lower bound, inclusive.
    pub const MIN: Decimal = Decimal::ONE;

    /// Upper bound, inclusive.
    pub const MAX: Decimal = Decimal::TEN;

    /// Validates and wraps a multiplier.
    ///
    /// # Errors
    ///
    /// Returns [`CostError::MarkupOutOfRange`] outside `[1.0, 10.0]`.
    pub fn new(multiplier: Decimal) -> Result<Self, CostError> {
        if multiplier < Self::MIN || multiplier > Self::MAX {
            return Err(CostError::MarkupOutOfRange(multiplier));
        }
        Ok(Self(multiplier))
    }

    /// Returns the multiplier.
    #[must_use]
    pub const fn multiplier(&self) -> Decimal {
        self.0
    }

    /// Profit earned on `raw` at this markup, rounded to the ledger scale.
    #[must_use]
    pub fn profit_on(&self, raw: Usd) -> Usd {
        raw.scale_by(self.0 - Decimal::ONE).round_to_ledger()
    }
}

impl Default for Markup {
    fn default() -> Self {
        Self::NONE
    }
}

impl TryFrom<Usd> for Markup {
    type Error = CostError;

    fn try_from(value: Usd) -> Result<Self, Self::Error> {
        Self::new(value.as_decimal())
    }
}

impl From<Markup> for Usd {
    fn from(value: Markup) -> Self {
        Self::new(value.0)
    }
}

/// The persisted split of one billed call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostBreakdown {
    /// What the upstream provider charges.
    pub raw_cost: Usd,
    /// Owed to the app owner (and its referrer).
    pub app_markup_profit: Usd,
    /// Kept by the platform.
    pub platform_markup_profit: Usd,
    /// Charged to the funding source.
    pub total_cost: Usd,
}

impl CostBreakdown {
    /// Applies both markups to `raw_cost`.
    #[must_use]
    pub fn compute(raw_cost: Usd, app_markup: Markup, platform_markup: Markup) -> Self {
        let raw_cost = raw_cost.round_to_ledger();
        let app_markup_profit = app_markup.profit_on(raw_cost);
        let platform_markup_profit = platform_markup.profit_on(raw_cost);
        Self {
            raw_cost,
            app_markup_profit,
            platform_markup_profit,
            total_cost: raw_cost + app_markup_profit + platform_markup_profit,
        }
    }

    /// Scales every component down so the total equals `cap`, keeping the
    /// components summing exactly. Used when only part of a charge can be
    /// collected.
    #[must_use]
    pub fn capped_at(self, cap: Usd) -> Self {
        if cap >= self.total_cost || self.total_cost.is_zero() {
            return self;
        }
        let ratio = cap.as_decimal() / self.total_cost.as_decimal();
        let app_markup_profit = self.app_markup_profit.scale_by(ratio).round_to_ledger();
        let platform_markup_profit = self
            .platform_markup_profit
            .scale_by(ratio)
            .round_to_ledger();
        let cap = cap.round_to_ledger();
        Self {
            raw_cost: cap - app_markup_profit - platform_markup_profit,
            app_markup_profit,
            platform_markup_profit,
            total_cost: cap,
        }
    }
}

/// Prices plus the platform markup.
#[derive(Debug, Clone)]
pub struct CostModel {
    prices: PriceTable,
    platform_markup: Markup,
    default_max_output_tokens: u64,
}

/// Upper-bound cost of a call computed before forwarding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreflightEstimate {
    /// Estimated usage.
    pub usage: TokenUsage,
    /// Cost of the estimated usage after markup.
    pub cost: CostBreakdown,
}

impl CostModel {
    /// Builds a cost model.
    #[must_use]
    pub const fn new(
        prices: PriceTable,
        platform_markup: Markup,
        default_max_output_tokens: u64,
    ) -> Self {
        Self {
            prices,
            platform_markup,
            default_max_output_tokens,
        }
    }

    /// The platform-wide markup.
    #[must_use]
    pub const fn platform_markup(&self) -> Markup {
        self.platform_markup
    }

    /// The configured price table.
    #[must_use]
    pub const fn prices(&self) -> &PriceTable {
        &self.prices
    }

    /// Cost of actual usage.
    ///
    /// # Errors
    ///
    /// Returns [`CostError::UnpricedModel`] when the model has no price.
    pub fn charge(
        &self,
        model: &str,
        usage: &TokenUsage,
        app_markup: Markup,
    ) -> Result<CostBreakdown, CostError> {
        let price = self.prices.lookup(model)?;
        Ok(CostBreakdown::compute(
            price.raw_cost(usage),
            app_markup,
            self.platform_markup,
        ))
    }

    /// Worst-case cost of a request: its body size approximates prompt
    /// tokens and `max_output_tokens` (or the configured default) bounds the
    /// completion.
    ///
    /// # Errors
    ///
    /// Returns [`CostError::UnpricedModel`] when the model has no price.
    pub fn estimate(
        &self,
        model: &str,
        request_bytes: usize,
        max_output_tokens: Option<u64>,
        app_markup: Markup,
    ) -> Result<PreflightEstimate, CostError> {
        let usage = TokenUsage::new(
            tokens_from_chars(request_bytes as u64),
            max_output_tokens.unwrap_or(self.default_max_output_tokens),
        );
        let cost = self.charge(model, &usage, app_markup)?;
        Ok(PreflightEstimate { usage, cost })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usd(s: &str) -> Usd {
        Usd::parse(s).unwrap()
    }

    fn markup(s: &str) -> Markup {
        Markup::new(s.parse().unwrap()).unwrap()
    }

    fn gpt4o() -> ModelPrice {
        ModelPrice {
            input_per_million: usd("2.50"),
            output_per_million: usd("10.00"),
            cached_input_per_million: Some(usd("1.25")),
        }
    }

    #[test]
    fn scenario_three_dollars_at_one_point_five_and_one_point_one() {
        let breakdown = CostBreakdown::compute(usd("3.00"), markup("1.5"), markup("1.1"));
        assert_eq!(breakdown.app_markup_profit, usd("1.50"));
        assert_eq!(breakdown.platform_markup_profit, usd("0.30"));
        assert_eq!(breakdown.total_cost, usd("4.80"));
        assert_eq!(usd("5.00") - breakdown.total_cost, usd("0.20"));
    }

    #[test]
    fn components_always_sum_to_total() {
        let raws = ["0.000000001", "0.0000037", "1.234567891", "0.333333333", "12"];
        let markups = ["1.0", "1.07", "1.333", "2.5", "10"];
        for raw in raws {
            for app in markups {
                let b = CostBreakdown::compute(usd(raw), markup(app), markup("1.13"));
                assert_eq!(
                    b.raw_cost + b.app_markup_profit + b.platform_markup_profit,
                    b.total_cost,
                    "raw={raw} app={app}"
                );
                assert!(b.total_cost.to_ledger_units().is_ok());
            }
        }
    }

    #[test]
    fn markup_bounds_are_enforced() {
        assert!(Markup::new("0.99".parse().unwrap()).is_err());
        assert!(Markup::new("10.01".parse().unwrap()).is_err());
        assert!(Markup::new("10".parse().unwrap()).is_ok());
        let parsed: Result<Markup, _> = serde_json::from_str("\"11\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn raw_cost_prices_cached_tokens_separately() {
        let usage = TokenUsage {
            input_tokens: 1_000,
            output_tokens: 500,
            cached_input_tokens: 400,
        };
        // 600 × 2.5 + 400 × 1.25 + 500 × 10, per million
        assert_eq!(gpt4o().raw_cost(&usage), usd("0.007"));
    }

    #[test]
    fn lookup_resolves_vendor_prefix_and_snapshots() {
        let table = PriceTable::new().with_model("gpt-4o", gpt4o()).with_model(
            "gpt-4o-mini",
            ModelPrice {
                input_per_million: usd("0.15"),
                output_per_million: usd("0.60"),
                cached_input_per_million: None,
            },
        );
        assert_eq!(table.lookup("openai/gpt-4o").unwrap(), &gpt4o());
        assert_eq!(table.lookup("gpt-4o-2024-08-06").unwrap(), &gpt4o());
        assert_eq!(
            table.lookup("gpt-4o-mini-2024-07-18").unwrap().input_per_million,
            usd("0.15")
        );
        assert!(matches!(
            table.lookup("claude-3-opus"),
            Err(CostError::UnpricedModel(_))
        ));
    }

    #[test]
    fn prefix_match_stops_at_name_boundaries() {
        let table = PriceTable::new().with_model("gpt-4", gpt4o());
        assert!(matches!(table.lookup("gpt-4o"), Err(CostError::UnpricedModel(_))));
        assert!(matches!(table.lookup("gpt-40"), Err(CostError::UnpricedModel(_))));
        assert_eq!(table.lookup("gpt-4-0613").unwrap(), &gpt4o());
        assert_eq!(table.lookup("gpt-4@2024").unwrap(), &gpt4o());
    }

    #[test]
    fn estimate_uses_default_output_budget() {
        let model = CostModel::new(
            PriceTable::new().with_model("gpt-4o", gpt4o()),
            Markup::NONE,
            1_000,
        );
        let estimate = model.estimate("gpt-4o", 4_000, None, Markup::NONE).unwrap();
        assert_eq!(estimate.usage, TokenUsage::new(1_000, 1_000));
        assert_eq!(estimate.cost.total_cost, usd("0.0125"));
    }

    #[test]
    fn capping_keeps_components_consistent() {
        let full = CostBreakdown::compute(usd("3.00"), markup("1.5"), markup("1.1"));
        let capped = full.capped_at(usd("2.40"));
        assert_eq!(capped.total_cost, usd("2.40"));
        assert_eq!(
            capped.raw_cost + capped.app_markup_profit + capped.platform_markup_profit,
            capped.total_cost
        );
        assert_eq!(capped.app_markup_profit, usd("0.75"));
    }
}
