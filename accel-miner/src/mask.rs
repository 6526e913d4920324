//! Difficulty mask derivation.
//!
//! The accelerator cannot compare a 256-bit hash against an arbitrary target.
//! Instead it is given a mask of leading one bits and accepts a hash when every
//! masked bit of the hash is zero. The mask is derived from the target so that
//! any hash meeting the target is always accepted; the converse does not hold,
//! so every reported candidate is re-checked in software.
//!
//! Mask and hash bytes are compared most significant byte first, matching the
//! big-endian target encoding.

use std::fmt;

use bitcoin::hex::DisplayHex;

use crate::types::Target;
use crate::u256::U256;

/// Number of bits covered by a mask.
pub const MASK_BITS: u32 = 256;

/// A 256-bit mask consisting of a run of leading ones followed by zeros.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DifficultyMask {
    bytes: [u8; 32],
    leading_ones: u32,
}

impl DifficultyMask {
    /// Mask that accepts every hash.
    pub const ACCEPT_ALL: Self = Self {
        bytes: [0; 32],
        leading_ones: 0,
    };

    /// Mask with the top `n` bits set. Values above 256 clamp to 256.
    pub fn from_leading_zeros(n: u32) -> Self {
        let n = n.min(MASK_BITS);
        let mut bytes = [0u8; 32];
        let full = (n / 8) as usize;
        bytes[..full].fill(0xff);

        let rem = n % 8;
        if rem != 0 {
            bytes[full] = 0xffu8 << (8 - rem);
        }

        Self {
            bytes,
            leading_ones: n,
        }
    }

    /// Derive the mask for a big-endian 256-bit target.
    ///
    /// The mask covers the leading zero bits of `target - 1`, the largest
    /// hash that meets the target. A zero target admits no hash and yields the
    /// all-ones mask.
    pub fn from_target_bytes(target: &[u8; 32]) -> Self {
        let value = U256::from_be_bytes(*target);
        match value.checked_sub(U256::ONE) {
            Some(largest) => Self::from_leading_zeros(largest.leading_zeros()),
            None => Self::from_leading_zeros(MASK_BITS),
        }
    }

    pub fn from_target(target: &Target) -> Self {
        Self::from_target_bytes(&target.to_be_bytes())
    }

    /// Number of leading one bits.
    pub fn leading_ones(&self) -> u32 {
        self.leading_ones
    }

    /// Mask bytes, most significant first.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Leading-bit count as carried by the one-byte hardware parameter.
    ///
    /// The register holds at most 255, so the all-ones mask saturates.
    pub fn zero_count(&self) -> u8 {
        self.leading_ones.min(u8::MAX as u32) as u8
    }

    /// Whether a big-endian hash value has zeros under every mask bit.
    pub fn accepts(&self, hash_be: &[u8; 32]) -> bool {
        self.bytes
            .iter()
            .zip(hash_be.iter())
            .all(|(mask, hash)| mask & hash == 0)
    }

    /// Same as [`accepts`](Self::accepts) for a raw SHA-256d digest, whose
    /// integer interpretation is little-endian.
    pub fn accepts_digest(&self, digest: &[u8; 32]) -> bool {
        self.bytes
            .iter()
            .zip(digest.iter().rev())
            .all(|(mask, hash)| mask & hash == 0)
    }
}

impl Default for DifficultyMask {
    fn default() -> Self {
        Self::ACCEPT_ALL
    }
}

impl fmt::Debug for DifficultyMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DifficultyMask")
            .field("leading_ones", &self.leading_ones)
            .finish()
    }
}

impl fmt::Display for DifficultyMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bytes[..].as_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::target_with_leading_zeros;

    fn count_leading_ones(bytes: &[u8; 32]) -> u32 {
        let mut count = 0;
        for byte in bytes {
            count += byte.leading_ones();
            if *byte != 0xff {
                break;
            }
        }
        count
    }

    #[test]
    fn test_mask_shape_for_every_width() {
        for n in 0..=MASK_BITS {
            let mask = DifficultyMask::from_leading_zeros(n);
            assert_eq!(mask.leading_ones(), n);
            assert_eq!(count_leading_ones(mask.as_bytes()), n);

            // Contiguous: nothing set after the run of ones
            let total: u32 = mask.as_bytes().iter().map(|b| b.count_ones()).sum();
            assert_eq!(total, n, "mask {} is not contiguous", n);
        }
    }

    #[test]
    fn test_mask_clamps_width() {
        assert_eq!(
            DifficultyMask::from_leading_zeros(1000),
            DifficultyMask::from_leading_zeros(256)
        );
    }

    #[test]
    fn test_msb_only_target_masks_one_bit() {
        let mut target = [0u8; 32];
        target[0] = 0x80;
        let mask = DifficultyMask::from_target_bytes(&target);
        assert_eq!(mask.leading_ones(), 1);
        assert_eq!(mask.as_bytes()[0], 0x80);
    }

    #[test]
    fn test_zero_target_masks_everything() {
        let mask = DifficultyMask::from_target_bytes(&[0u8; 32]);
        assert_eq!(mask.as_bytes(), &[0xff; 32]);
        assert_eq!(mask.zero_count(), 255);
    }

    #[test]
    fn test_max_target_masks_nothing() {
        let mask = DifficultyMask::from_target(&Target::MAX_ATTAINABLE_MAINNET);
        // 0x00000000ffff0000...: 32 leading zero bits
        assert_eq!(mask.leading_ones(), 32);

        let mask = DifficultyMask::from_target_bytes(&[0xff; 32]);
        assert_eq!(mask, DifficultyMask::ACCEPT_ALL);
    }

    #[test]
    fn test_mask_never_rejects_a_meeting_hash() {
        for zeros in [0u32, 1, 4, 7, 8, 9, 31, 32, 100, 255] {
            let target = U256::from(target_with_leading_zeros(zeros));
            let mask = DifficultyMask::from_target_bytes(&target.to_be_bytes());

            // The largest hash strictly below the target
            if let Some(largest) = target.checked_sub(U256::ONE) {
                assert!(mask.accepts(&largest.to_be_bytes()), "zeros={}", zeros);
            }
            assert!(mask.accepts(&[0u8; 32]));
        }
    }

    #[test]
    fn test_mask_is_monotonic_in_target() {
        let mut previous = u32::MAX;
        for shift in 0..=256 {
            let target = U256::MAX >> shift;
            let ones = DifficultyMask::from_target_bytes(&target.to_be_bytes()).leading_ones();
            // Smaller targets never loosen the mask
            assert!(previous == u32::MAX || ones >= previous);
            previous = ones;
        }
    }

    #[test]
    fn test_non_power_of_two_target_admits_false_positives() {
        // 0x00c0...: hashes in [0x00c0.., 0x00ff..] pass the mask but miss the target
        let mut target = [0u8; 32];
        target[1] = 0xc0;
        let mask = DifficultyMask::from_target_bytes(&target);
        assert_eq!(mask.leading_ones(), 8);

        let mut hash = [0u8; 32];
        hash[1] = 0xd0;
        assert!(mask.accepts(&hash));
        assert!(U256::from_be_bytes(hash) >= U256::from_be_bytes(target));
    }

    #[test]
    fn test_accepts_digest_reads_little_endian() {
        let mask = DifficultyMask::from_leading_zeros(8);
        let mut digest = [0xffu8; 32];
        digest[31] = 0x00;
        assert!(mask.accepts_digest(&digest));

        digest[31] = 0x01;
        assert!(!mask.accepts_digest(&digest));
    }

    #[test]
    fn test_display_is_hex() {
        let mask = DifficultyMask::from_leading_zeros(12);
        let text = mask.to_string();
        assert_eq!(text.len(), 64);
        assert!(text.starts_with("fff0"));
    }
}
