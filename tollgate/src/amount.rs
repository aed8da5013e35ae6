//! Human-readable price parsing.
//!
//! Tool prices are configured in USD as `"$0.01"`, `"0.01"` or a bare JSON
//! number, and converted per network into the asset's smallest unit.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::AmountError;

/// A non-negative USD amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(Decimal);

impl Money {
    /// Wraps a decimal value.
    ///
    /// # Errors
    ///
    /// Returns [`AmountError::Negative`] if `value` is below zero.
    pub fn new(value: Decimal) -> Result<Self, AmountError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(AmountError::Negative);
        }
        Ok(Self(value.normalize()))
    }

    /// The underlying decimal.
    #[must_use]
    pub const fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Parses a JSON string or number.
    ///
    /// # Errors
    ///
    /// Returns [`AmountError::InvalidFormat`] for any other JSON type or an
    /// unparseable value.
    pub fn from_json(value: &Value) -> Result<Self, AmountError> {
        match value {
            Value::String(s) => s.parse(),
            Value::Number(n) => n.to_string().parse(),
            other => Err(AmountError::InvalidFormat(other.to_string())),
        }
    }

    /// Converts to an atomic amount for an asset with `decimals` decimals.
    ///
    /// `Money("0.01").to_atomic(6)` is `10_000`.
    ///
    /// # Errors
    ///
    /// Returns [`AmountError::TooPrecise`] when the amount has more fractional
    /// digits than the asset, and [`AmountError::Overflow`] when the result
    /// does not fit in a `u128`.
    pub fn to_atomic(&self, decimals: u32) -> Result<u128, AmountError> {
        let normalized = self.0.normalize();
        let scale = normalized.scale();
        if scale > decimals {
            return Err(AmountError::TooPrecise {
                price: self.to_string(),
                decimals,
            });
        }
        let mantissa = u128::try_from(normalized.mantissa())
            .map_err(|_| AmountError::Negative)?;
        10u128
            .checked_pow(decimals - scale)
            .and_then(|factor| mantissa.checked_mul(factor))
            .ok_or_else(|| AmountError::Overflow(self.to_string()))
    }
}

impl FromStr for Money {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed.strip_prefix('$').unwrap_or(trimmed).trim();
        if digits.starts_with('-') {
            return Err(AmountError::Negative);
        }
        let value = Decimal::from_str(digits)
            .or_else(|_| Decimal::from_scientific(digits))
            .map_err(|_| AmountError::InvalidFormat(s.to_owned()))?;
        Self::new(value)
    }
}

impl Display for Money {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_json(&value).map_err(serde::de::Error::custom)
    }
}
