//! 256-bit unsigned integer arithmetic.
//!
//! Wraps `ruint::aliases::U256` behind the handful of operations the hash and
//! target comparisons need, so callers never touch the underlying library.

use ruint::aliases::U256 as Ruint256;
use std::ops::Shr;

/// A 256-bit unsigned integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct U256(Ruint256);

impl U256 {
    pub const ZERO: Self = Self(Ruint256::ZERO);
    pub const ONE: Self = Self(Ruint256::from_limbs([1, 0, 0, 0]));
    pub const MAX: Self = Self(Ruint256::MAX);

    /// Number of bits in the type.
    pub const BITS: u32 = 256;

    /// Create from little-endian bytes.
    pub fn from_le_bytes(bytes: [u8; 32]) -> Self {
        Self(Ruint256::from_le_bytes(bytes))
    }

    /// Convert to little-endian bytes.
    pub fn to_le_bytes(self) -> [u8; 32] {
        self.0.to_le_bytes()
    }

    /// Create from big-endian bytes (most significant byte first).
    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self(Ruint256::from_be_bytes(bytes))
    }

    /// Convert to big-endian bytes.
    pub fn to_be_bytes(self) -> [u8; 32] {
        self.0.to_be_bytes()
    }

    /// Count of zero bits above the highest set bit; 256 for zero.
    pub fn leading_zeros(self) -> u32 {
        self.0.leading_zeros() as u32
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }

    pub fn is_zero(self) -> bool {
        self.0 == Ruint256::ZERO
    }
}

impl Shr<u32> for U256 {
    type Output = Self;

    /// Logical shift; shifting by 256 or more yields zero.
    fn shr(self, rhs: u32) -> Self::Output {
        if rhs >= Self::BITS {
            Self::ZERO
        } else {
            Self(self.0 >> rhs as usize)
        }
    }
}

impl From<u64> for U256 {
    fn from(value: u64) -> Self {
        Self(Ruint256::from(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_orders_agree() {
        let mut be = [0u8; 32];
        be[31] = 0x01;
        be[0] = 0x80;
        let value = U256::from_be_bytes(be);

        let mut le = be;
        le.reverse();
        assert_eq!(value, U256::from_le_bytes(le));
        assert_eq!(value.to_be_bytes(), be);
        assert_eq!(value.to_le_bytes(), le);
    }

    #[test]
    fn test_leading_zeros() {
        assert_eq!(U256::ZERO.leading_zeros(), 256);
        assert_eq!(U256::ONE.leading_zeros(), 255);
        assert_eq!(U256::MAX.leading_zeros(), 0);
        assert_eq!((U256::MAX >> 4).leading_zeros(), 4);
    }

    #[test]
    fn test_shift_saturates_to_zero() {
        assert_eq!(U256::MAX >> 256, U256::ZERO);
        assert_eq!(U256::MAX >> 1000, U256::ZERO);
        assert_eq!(U256::MAX >> 255, U256::ONE);
    }

    #[test]
    fn test_checked_sub() {
        assert_eq!(U256::ZERO.checked_sub(U256::ONE), None);
        assert_eq!(U256::ONE.checked_sub(U256::ONE), Some(U256::ZERO));
        assert_eq!(U256::from(10).checked_sub(U256::from(3)), Some(U256::from(7)));
    }
}
