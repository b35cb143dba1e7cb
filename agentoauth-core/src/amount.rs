//! Monetary amounts
//!
//! Amounts are exact decimals; arithmetic never passes through binary
//! floating point. JSON numbers are bridged via their shortest decimal text.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An exact decimal amount with an opaque currency code kept alongside it
/// by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Amount(Decimal);

impl Amount {
    pub const ZERO: Amount = Amount(Decimal::ZERO);

    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    /// Checked addition; `None` on overflow
    pub fn checked_add(&self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    /// Saturating subtraction, clamped at zero
    pub fn saturating_sub(&self, other: Amount) -> Amount {
        let result = self.0 - other.0;
        if result.is_sign_negative() {
            Amount::ZERO
        } else {
            Amount(result)
        }
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Trim insignificant trailing zeros so "500.00" and "500" render alike
        write!(f, "{}", self.0.normalize())
    }
}

impl FromStr for Amount {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Decimal::from_str(s).map(Amount)
    }
}

impl From<i64> for Amount {
    fn from(value: i64) -> Self {
        Amount(Decimal::from(value))
    }
}

impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let normalized = self.0.normalize();
        if normalized.scale() == 0 {
            if let Some(int) = normalized.to_i64() {
                return serializer.serialize_i64(int);
            }
        }
        match normalized.to_f64() {
            Some(float) => serializer.serialize_f64(float),
            None => serializer.serialize_str(&normalized.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct AmountVisitor;

        impl serde::de::Visitor<'_> for AmountVisitor {
            type Value = Amount;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON number or decimal string")
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> std::result::Result<Amount, E> {
                Ok(Amount(Decimal::from(v)))
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> std::result::Result<Amount, E> {
                Ok(Amount(Decimal::from(v)))
            }

            fn visit_f64<E: serde::de::Error>(self, v: f64) -> std::result::Result<Amount, E> {
                if !v.is_finite() {
                    return Err(E::custom("amount must be a finite number"));
                }
                // Shortest round-trip text keeps 19.99 as 19.99 rather than
                // the full binary expansion of the f64.
                Decimal::from_str(&v.to_string())
                    .map(Amount)
                    .map_err(|e| E::custom(format!("invalid amount: {}", e)))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> std::result::Result<Amount, E> {
                Decimal::from_str(v)
                    .map(Amount)
                    .map_err(|e| E::custom(format!("invalid amount: {}", e)))
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_integer() {
        let amount: Amount = serde_json::from_str("500").unwrap();
        assert_eq!(amount, Amount::from(500));
        assert_eq!(amount.to_string(), "500");
    }

    #[test]
    fn test_deserialize_fraction_exact() {
        let amount: Amount = serde_json::from_str("19.99").unwrap();
        assert_eq!(amount.to_string(), "19.99");

        // Three additions of 0.1 stay exact (would drift as f64)
        let tenth: Amount = serde_json::from_str("0.1").unwrap();
        let sum = tenth.checked_add(tenth).unwrap().checked_add(tenth).unwrap();
        assert_eq!(sum.to_string(), "0.3");
    }

    #[test]
    fn test_serialize_integer_form() {
        let amount = Amount::from_str("1700.00").unwrap();
        assert_eq!(serde_json::to_string(&amount).unwrap(), "1700");
    }

    #[test]
    fn test_saturating_sub() {
        let limit = Amount::from(2000);
        let spent = Amount::from(300);
        assert_eq!(limit.saturating_sub(spent), Amount::from(1700));
        assert_eq!(spent.saturating_sub(limit), Amount::ZERO);
    }

    #[test]
    fn test_rejects_non_numeric_strings() {
        let result: std::result::Result<Amount, _> = serde_json::from_str("\"abc\"");
        assert!(result.is_err());
    }
}
