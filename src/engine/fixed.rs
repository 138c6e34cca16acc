//! Fixed-point accumulator arithmetic.
//!
//! `Fixed` is an unsigned decimal with 18 fractional digits stored in a
//! `u128`. Every operation is checked: overflow, underflow and division by
//! zero surface as `EngineError` instead of wrapping. Conversions back to
//! integers always floor.

use bytemuck::{Pod, Zeroable};

use super::EngineError;

/// 10^18, the number of raw units in one whole unit.
pub const SCALE: u128 = 1_000_000_000_000_000_000;

#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
pub struct Fixed(u128);

impl Fixed {
    pub const ZERO: Fixed = Fixed(0);
    pub const ONE: Fixed = Fixed(SCALE);

    #[inline]
    pub const fn from_raw(raw: u128) -> Self {
        Fixed(raw)
    }

    #[inline]
    pub const fn raw(self) -> u128 {
        self.0
    }

    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn from_int(value: u128) -> Result<Self, EngineError> {
        value
            .checked_mul(SCALE)
            .map(Fixed)
            .ok_or(EngineError::Overflow)
    }

    /// `num / den` truncated to 18 decimals.
    pub fn ratio(num: u128, den: u128) -> Result<Self, EngineError> {
        if den == 0 {
            return Err(EngineError::DivisionByZero);
        }
        let scaled = num.checked_mul(SCALE).ok_or(EngineError::Overflow)?;
        Ok(Fixed(scaled / den))
    }

    pub fn checked_add(self, rhs: Fixed) -> Result<Self, EngineError> {
        self.0
            .checked_add(rhs.0)
            .map(Fixed)
            .ok_or(EngineError::Overflow)
    }

    pub fn checked_sub(self, rhs: Fixed) -> Result<Self, EngineError> {
        self.0
            .checked_sub(rhs.0)
            .map(Fixed)
            .ok_or(EngineError::Overflow)
    }

    pub fn mul_int(self, n: u128) -> Result<Self, EngineError> {
        self.0
            .checked_mul(n)
            .map(Fixed)
            .ok_or(EngineError::Overflow)
    }

    pub fn div_int(self, n: u128) -> Result<Self, EngineError> {
        if n == 0 {
            return Err(EngineError::DivisionByZero);
        }
        Ok(Fixed(self.0 / n))
    }

    /// Integer part, rounded toward zero.
    #[inline]
    pub const fn floor(self) -> u128 {
        self.0 / SCALE
    }
}
