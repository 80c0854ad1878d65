use bigdecimal::{BigDecimal, Zero};
use serde::{Deserialize, Serialize};

/// Normalize a monetary value to 2 decimal places (BigDecimal uses plain
/// truncation/zero-extension when changing scale).
pub fn normalize_scale(value: &BigDecimal) -> BigDecimal {
    value.with_scale(2)
}

/// Exact equality of two monetary values after scale normalization.
///
/// Settlement amount checks go through this so that "10", "10.0" and "10.00"
/// all compare equal while "10.01" does not.
pub fn amounts_equal(a: &BigDecimal, b: &BigDecimal) -> bool {
    normalize_scale(a) == normalize_scale(b)
}

/// Whether a value is acceptable as a price (zero or positive).
pub fn non_negative(value: &BigDecimal) -> bool {
    value >= &BigDecimal::zero()
}

/// A monetary value guaranteed to carry exactly 2 decimal places.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizedMoney(BigDecimal);

impl NormalizedMoney {
    pub fn new(raw: BigDecimal) -> Self {
        Self(normalize_scale(&raw))
    }
    pub fn inner(&self) -> &BigDecimal {
        &self.0
    }
    /// Render in the fixed "12.30" form used for gateway parameters.
    pub fn to_plain_string(&self) -> String {
        self.0.to_string()
    }
}

impl From<BigDecimal> for NormalizedMoney {
    fn from(value: BigDecimal) -> Self {
        Self::new(value)
    }
}
