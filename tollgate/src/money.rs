//! Exact USD amounts.
//!
//! Money never touches binary floating point. Amounts are [`Decimal`] in memory,
//! `i64` fixed-point at [`LEDGER_SCALE`] decimal places in the ledger, and integer
//! smallest units (e.g. 6-decimal USDC) on-chain.

use std::fmt::{self, Display, Formatter};
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Number of decimal places kept by the ledger (nano-dollars).
pub const LEDGER_SCALE: u32 = 9;

/// Errors raised while parsing or converting money values.
#[derive(Debug, thiserror::Error)]
pub enum MoneyError {
    /// Input is not a decimal number.
    #[error("invalid amount {input:?}")]
    InvalidFormat {
        /// The rejected input.
        input: String,
    },
    /// A negative amount where only non-negative amounts are meaningful.
    #[error("amount {0} must not be negative")]
    Negative(Decimal),
    /// Amount does not fit the target representation.
    #[error("amount {0} is out of range")]
    OutOfRange(Decimal),
}

/// An exact amount of US dollars.
///
/// Serialized as a normalized decimal string (`"4.8"`), parsed from either a
/// string or a JSON number. A leading `$` and thousands separators are accepted
/// when parsing text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Usd(Decimal);

impl Usd {
    /// Zero dollars.
    pub const ZERO: Self = Self(Decimal::ZERO);

    /// Wraps a decimal amount.
    #[must_use]
    pub const fn new(value: Decimal) -> Self {
        Self(value)
    }

    /// Returns the underlying decimal.
    #[must_use]
    pub const fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Returns `true` when the amount is strictly below zero.
    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    /// Returns `true` when the amount is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Rounds half away from zero to the ledger scale.
    #[must_use]
    pub fn round_to_ledger(self) -> Self {
        Self(
            self.0
                .round_dp_with_strategy(LEDGER_SCALE, RoundingStrategy::MidpointAwayFromZero),
        )
    }

    /// Builds an amount from ledger fixed-point units.
    #[must_use]
    pub fn from_ledger_units(units: i64) -> Self {
        Self(Decimal::new(units, LEDGER_SCALE))
    }

    /// Converts to ledger fixed-point units, rounding to the ledger scale first.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::OutOfRange`] if the value does not fit an `i64`.
    pub fn to_ledger_units(self) -> Result<i64, MoneyError> {
        let mut rounded = self.round_to_ledger().0;
        rounded.rescale(LEDGER_SCALE);
        i64::try_from(rounded.mantissa()).map_err(|_| MoneyError::OutOfRange(self.0))
    }

    /// Converts to the smallest unit of an asset with `decimals` places,
    /// rounding up so the payee never under-collects.
    ///
    /// # Errors
    ///
    /// Returns an error for negative amounts or values that overflow `u64`.
    pub fn to_asset_units_ceil(self, decimals: u8) -> Result<u64, MoneyError> {
        if self.is_negative() {
            return Err(MoneyError::Negative(self.0));
        }
        let factor = 10u64
            .checked_pow(u32::from(decimals))
            .ok_or(MoneyError::OutOfRange(self.0))?;
        self.0
            .checked_mul(Decimal::from(factor))
            .map(|scaled| scaled.ceil())
            .and_then(|scaled| scaled.to_u64())
            .ok_or(MoneyError::OutOfRange(self.0))
    }

    /// Builds an amount from an asset's smallest units.
    #[must_use]
    pub fn from_asset_units(units: u64, decimals: u8) -> Self {
        Self(Decimal::from_i128_with_scale(
            i128::from(units),
            u32::from(decimals),
        ))
    }

    /// Multiplies by an exact factor without rounding.
    #[must_use]
    pub fn scale_by(self, factor: Decimal) -> Self {
        Self(self.0 * factor)
    }

    /// Returns the smaller of two amounts.
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        if self <= other { self } else { other }
    }

    /// Parses human input such as `"$1,250.50"` or `"0.35"`.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::InvalidFormat`] when the input is not a decimal number.
    pub fn parse(input: &str) -> Result<Self, MoneyError> {
        let cleaned: String = input
            .trim()
            .trim_start_matches('$')
            .chars()
            .filter(|c| *c != ',' && *c != '_')
            .collect();
        Decimal::from_str_exact(&cleaned)
            .or_else(|_| Decimal::from_scientific(&cleaned))
            .map(Self)
            .map_err(|_| MoneyError::InvalidFormat {
                input: input.to_owned(),
            })
    }
}

/// Refund owed to a payer who authorized `paid_units` for a call that cost
/// `owed_units`, both in the asset's smallest unit.
#[must_use]
pub const fn refund_units(paid_units: u64, owed_units: u64) -> u64 {
    paid_units.saturating_sub(owed_units)
}

impl Add for Usd {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Usd {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Usd {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl From<Decimal> for Usd {
    fn from(value: Decimal) -> Self {
        Self(value)
    }
}

impl FromStr for Usd {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Display for Usd {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

impl Serialize for Usd {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Usd {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Integer(i64),
            Float(f64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => Self::parse(&s).map_err(serde::de::Error::custom),
            Raw::Integer(i) => Ok(Self(Decimal::from(i))),
            // TOML and JSON numbers arrive as f64; go through their shortest
            // textual form so 0.1 stays 0.1.
            Raw::Float(f) => Self::parse(&f.to_string()).map_err(serde::de::Error::custom),
        }
    }
}
