//! Amount type
//!
//! Domain primitive for monetary values in minor currency units.
//! All amounts are validated at construction time, ensuring invalid values
//! cannot exist in the system.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum representable value in minor units (one trillion major units
/// at two decimal places). Keeps credit arithmetic far away from i64::MAX.
const MAX_MINOR_UNITS: i64 = 100_000_000_000_000;

/// Amount represents a validated monetary value in minor currency units.
///
/// # Invariants
/// - Value is always positive (> 0)
/// - Value never exceeds [`MAX_MINOR_UNITS`]
///
/// # Example
/// ```
/// use corebank::domain::Amount;
///
/// let amount = Amount::new(2_500).unwrap();
/// assert_eq!(amount.minor_units(), 2_500);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Amount(i64);

/// Errors that can occur when creating an Amount
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("Amount must be positive (got {0})")]
    NotPositive(i64),

    #[error("Amount exceeds maximum allowed value ({MAX_MINOR_UNITS})")]
    Overflow,
}

impl Amount {
    /// Create a new Amount with validation.
    ///
    /// # Errors
    /// - `AmountError::NotPositive` if value <= 0
    /// - `AmountError::Overflow` if value exceeds the minor-unit cap
    pub fn new(minor_units: i64) -> Result<Self, AmountError> {
        if minor_units <= 0 {
            return Err(AmountError::NotPositive(minor_units));
        }

        if minor_units > MAX_MINOR_UNITS {
            return Err(AmountError::Overflow);
        }

        Ok(Self(minor_units))
    }

    /// Get the value in minor currency units.
    pub fn minor_units(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i64> for Amount {
    type Error = AmountError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Amount::new(value)
    }
}

impl From<Amount> for i64 {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

// Note: no arithmetic operators on Amount itself; balance math goes through
// Balance so the non-negativity invariant is checked in one place.

/// Balance represents an account balance in minor units (zero or positive).
/// Unlike Amount, Balance can be zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Balance(i64);

impl Balance {
    /// Create a new balance (zero or positive)
    pub fn new(minor_units: i64) -> Result<Self, AmountError> {
        if minor_units < 0 {
            return Err(AmountError::NotPositive(minor_units));
        }

        if minor_units > MAX_MINOR_UNITS {
            return Err(AmountError::Overflow);
        }

        Ok(Self(minor_units))
    }

    /// Create a zero balance
    pub fn zero() -> Self {
        Self(0)
    }

    /// Get the value in minor units
    pub fn minor_units(&self) -> i64 {
        self.0
    }

    /// Check if balance is sufficient for a withdrawal
    pub fn is_sufficient_for(&self, amount: &Amount) -> bool {
        self.0 >= amount.minor_units()
    }

    /// Add amount to balance
    pub fn credit(&self, amount: &Amount) -> Result<Balance, AmountError> {
        let new_value = self
            .0
            .checked_add(amount.minor_units())
            .ok_or(AmountError::Overflow)?;
        Balance::new(new_value)
    }

    /// Subtract amount from balance
    pub fn debit(&self, amount: &Amount) -> Result<Balance, AmountError> {
        let new_value = self.0 - amount.minor_units();
        Balance::new(new_value)
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for Balance {
    fn default() -> Self {
        Self::zero()
    }
}
