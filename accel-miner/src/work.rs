//! Work items handed to the accelerator.
//!
//! A work item is the precomputed part of an 80-byte block header: the
//! midstate over the first 64 bytes, the 12 bytes that precede the nonce, and
//! the target a result must fall below.

use bitcoin::block::Version;
use bitcoin::consensus;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, CompactTarget, TxMerkleNode};

use crate::hasher::{self, FIRST_BLOCK_LEN, PREFIX_LEN};
use crate::mask::DifficultyMask;
use crate::types::{BlockHeader, Target};
use crate::u256::U256;

/// One unit of search work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    midstate: [u8; 32],
    prefix: [u8; PREFIX_LEN],
    target: Target,
}

impl WorkItem {
    pub fn new(midstate: [u8; 32], prefix: [u8; PREFIX_LEN], target: Target) -> Self {
        Self {
            midstate,
            prefix,
            target,
        }
    }

    /// Split a serialized header into midstate and prefix. The trailing nonce
    /// bytes are ignored.
    pub fn from_header_bytes(header: &[u8; 80], target: Target) -> Self {
        let mut first = [0u8; FIRST_BLOCK_LEN];
        first.copy_from_slice(&header[..FIRST_BLOCK_LEN]);
        let mut prefix = [0u8; PREFIX_LEN];
        prefix.copy_from_slice(&header[FIRST_BLOCK_LEN..FIRST_BLOCK_LEN + PREFIX_LEN]);

        Self::new(hasher::midstate(&first), prefix, target)
    }

    pub fn from_header(header: &BlockHeader, target: Target) -> Self {
        let mut bytes = [0u8; 80];
        bytes.copy_from_slice(&consensus::serialize(header));
        Self::from_header_bytes(&bytes, target)
    }

    pub fn midstate(&self) -> &[u8; 32] {
        &self.midstate
    }

    pub fn prefix(&self) -> &[u8; PREFIX_LEN] {
        &self.prefix
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// Hardware pre-filter for this item's target.
    pub fn mask(&self) -> DifficultyMask {
        DifficultyMask::from_target(&self.target)
    }

    /// Digest of the header completed with `nonce`.
    pub fn hash_nonce(&self, nonce: u32) -> [u8; 32] {
        hasher::candidate_hash(&self.midstate, &self.prefix, nonce)
    }

    /// Whether a digest, read little-endian, is strictly below the target.
    pub fn meets_target(&self, digest: &[u8; 32]) -> bool {
        U256::from_le_bytes(*digest) < U256::from(self.target)
    }
}

/// Header of the Bitcoin mainnet genesis block.
pub fn genesis_header() -> BlockHeader {
    BlockHeader {
        version: Version::ONE,
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: TxMerkleNode::from_byte_array([
            0x3b, 0xa3, 0xed, 0xfd, 0x7a, 0x7b, 0x12, 0xb2, 0x7a, 0xc7, 0x2c, 0x3e, 0x67, 0x76,
            0x8f, 0x61, 0x7f, 0xc8, 0x1b, 0xc3, 0x88, 0x8a, 0x51, 0x32, 0x3a, 0x9f, 0xb8, 0xaa,
            0x4b, 0x1e, 0x5e, 0x4a,
        ]),
        time: 1231006505,
        bits: CompactTarget::from_consensus(0x1d00ffff),
        nonce: 2083236893,
    }
}

/// Local source of work for running without a pool.
///
/// Rolls the timestamp of a fixed header so every item is distinct. The
/// midstate stays constant; only the prefix changes.
pub struct DemoWorkSource {
    header: BlockHeader,
    target: Target,
    issued: u32,
}

impl DemoWorkSource {
    pub fn new(target: Target) -> Self {
        Self {
            header: genesis_header(),
            target,
            issued: 0,
        }
    }

    pub fn next_work(&mut self) -> WorkItem {
        let mut header = self.header;
        header.time = header.time.wrapping_add(self.issued);
        self.issued = self.issued.wrapping_add(1);
        WorkItem::from_header(&header, self.target)
    }
}
