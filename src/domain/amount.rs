//! Money primitives
//!
//! Amounts are integer minor-currency units (cents, pence, ...). All values are
//! validated at construction time, so an invalid delta or currency code cannot
//! exist in the system.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Largest absolute delta accepted for a single transaction (10^15 minor units)
pub const MAX_ABS_DELTA: i64 = 1_000_000_000_000_000;

/// Errors that can occur when constructing money values
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("Amount delta must not be zero")]
    Zero,

    #[error("Amount delta exceeds maximum allowed magnitude ({MAX_ABS_DELTA}, got {0})")]
    Overflow(i64),

    #[error("Balance arithmetic overflowed")]
    BalanceOverflow,

    #[error("Invalid currency code: {0}")]
    InvalidCurrency(String),
}

/// Signed change to a wallet balance, in minor units.
///
/// # Invariants
/// - Never zero
/// - Magnitude at most [`MAX_ABS_DELTA`]
///
/// # Example
/// ```
/// use wallet_ledger::domain::AmountDelta;
///
/// let delta = AmountDelta::new(500).unwrap();
/// assert_eq!(delta.value(), 500);
/// assert!(AmountDelta::new(0).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct AmountDelta(i64);

impl AmountDelta {
    pub fn new(value: i64) -> Result<Self, AmountError> {
        if value == 0 {
            return Err(AmountError::Zero);
        }
        if value.checked_abs().map_or(true, |abs| abs > MAX_ABS_DELTA) {
            return Err(AmountError::Overflow(value));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    pub fn is_credit(&self) -> bool {
        self.0 > 0
    }

    /// The delta that cancels this one.
    pub fn negated(&self) -> Self {
        Self(-self.0)
    }

    /// Apply this delta to a balance with overflow checking.
    pub fn apply_to(&self, balance: i64) -> Result<i64, AmountError> {
        balance.checked_add(self.0).ok_or(AmountError::BalanceOverflow)
    }
}

impl fmt::Display for AmountDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:+}", self.0)
    }
}

impl TryFrom<i64> for AmountDelta {
    type Error = AmountError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        AmountDelta::new(value)
    }
}

impl From<AmountDelta> for i64 {
    fn from(delta: AmountDelta) -> Self {
        delta.0
    }
}

/// ISO-4217 style currency code (three upper-case ASCII letters)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyCode(String);

impl CurrencyCode {
    pub fn new(code: &str) -> Result<Self, AmountError> {
        if code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase()) {
            Ok(Self(code.to_string()))
        } else {
            Err(AmountError::InvalidCurrency(code.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CurrencyCode {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CurrencyCode::new(s)
    }
}

impl TryFrom<String> for CurrencyCode {
    type Error = AmountError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CurrencyCode::new(&value)
    }
}

impl From<CurrencyCode> for String {
    fn from(code: CurrencyCode) -> Self {
        code.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_positive_and_negative() {
        assert_eq!(AmountDelta::new(500).unwrap().value(), 500);
        assert_eq!(AmountDelta::new(-250).unwrap().value(), -250);
        assert!(AmountDelta::new(500).unwrap().is_credit());
        assert!(!AmountDelta::new(-1).unwrap().is_credit());
    }

    #[test]
    fn test_delta_zero_rejected() {
        assert_eq!(AmountDelta::new(0), Err(AmountError::Zero));
    }

    #[test]
    fn test_delta_overflow_rejected() {
        assert!(matches!(
            AmountDelta::new(MAX_ABS_DELTA + 1),
            Err(AmountError::Overflow(_))
        ));
        assert!(matches!(AmountDelta::new(i64::MIN), Err(AmountError::Overflow(_))));
        assert!(AmountDelta::new(-MAX_ABS_DELTA).is_ok());
    }

    #[test]
    fn test_apply_to_checks_overflow() {
        let delta = AmountDelta::new(10).unwrap();
        assert_eq!(delta.apply_to(90), Ok(100));
        assert_eq!(delta.apply_to(i64::MAX), Err(AmountError::BalanceOverflow));
        assert_eq!(delta.negated().apply_to(10), Ok(0));
    }

    #[test]
    fn test_delta_deserialize_validates() {
        let ok: AmountDelta = serde_json::from_str("42").unwrap();
        assert_eq!(ok.value(), 42);
        assert!(serde_json::from_str::<AmountDelta>("0").is_err());
    }

    #[test]
    fn test_currency_code() {
        assert_eq!(CurrencyCode::new("USD").unwrap().as_str(), "USD");
        assert!(CurrencyCode::new("usd").is_err());
        assert!(CurrencyCode::new("USDT").is_err());
        assert!("EU".parse::<CurrencyCode>().is_err());
    }
}
