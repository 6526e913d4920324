//! Reference SHA-256 primitives.
//!
//! The accelerator hashes `midstate ‖ prefix ‖ nonce`, where the midstate is
//! the SHA-256 state after the first 64 bytes of an 80-byte header. Software
//! needs the same computation twice: to build work (midstate) and to verify a
//! reported nonce (full double hash from the midstate).
//!
//! [`self_test`] checks the primitive against the FIPS 180-2 known answers
//! before any device is brought up.

use bitcoin::hashes::{sha256, sha256d, Hash, HashEngine};

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Bytes of header consumed by the midstate.
pub const FIRST_BLOCK_LEN: usize = 64;

/// Header bytes between the midstate and the nonce.
pub const PREFIX_LEN: usize = 12;

/// SHA-256 state after compressing the first 64-byte block.
pub fn midstate(first_block: &[u8; FIRST_BLOCK_LEN]) -> [u8; 32] {
    let mut engine = sha256::Hash::engine();
    engine.input(first_block);
    engine.midstate().to_byte_array()
}

/// Double SHA-256 of the 80-byte header described by `midstate`, `prefix` and
/// `nonce`. The nonce is appended little-endian as in a block header.
///
/// Returns the raw digest; read it as a little-endian integer to compare
/// against a target.
pub fn candidate_hash(midstate: &[u8; 32], prefix: &[u8; PREFIX_LEN], nonce: u32) -> [u8; 32] {
    let mut engine = sha256::HashEngine::from_midstate(
        sha256::Midstate::from_byte_array(*midstate),
        FIRST_BLOCK_LEN,
    );
    engine.input(prefix);
    engine.input(&nonce.to_le_bytes());
    sha256d::Hash::from_engine(engine).to_byte_array()
}

/// Double SHA-256 of a complete header, for cross-checking.
pub fn header_hash(header: &[u8; 80]) -> [u8; 32] {
    sha256d::Hash::hash(header).to_byte_array()
}

struct KnownAnswer {
    name: &'static str,
    message: fn() -> Vec<u8>,
    digest: &'static str,
}

const KNOWN_ANSWERS: &[KnownAnswer] = &[
    KnownAnswer {
        name: "abc",
        message: || b"abc".to_vec(),
        digest: "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
    },
    KnownAnswer {
        name: "448-bit",
        message: || b"abcdbcdecdefdefgefghfghighijhijkijkljklmklmnlmnomnopnopq".to_vec(),
        digest: "248d6a61d20638b8e5c026930c3e6039a33ce45964ff2167f6ecedd419db06c1",
    },
    KnownAnswer {
        name: "million-a",
        message: || vec![b'a'; 1_000_000],
        digest: "cdc76e5c9914fb9281a1c7e284d73e67f1809a48a497200e046d39ccc7112cd0",
    },
];

/// Verify SHA-256 against the FIPS 180-2 test vectors.
pub fn self_test() -> Result<()> {
    for vector in KNOWN_ANSWERS {
        let expected: sha256::Hash = vector
            .digest
            .parse()
            .map_err(|e| Error::SelfTest(format!("{}: bad vector: {}", vector.name, e)))?;

        let mut engine = sha256::Hash::engine();
        // Feed in chunks so the multi-block path is exercised
        for chunk in (vector.message)().chunks(1000) {
            engine.input(chunk);
        }
        let actual = sha256::Hash::from_engine(engine);

        if actual != expected {
            return Err(Error::SelfTest(format!(
                "{}: expected {}, got {}",
                vector.name, expected, actual
            )));
        }
        trace!(vector = vector.name, "SHA-256 known answer ok");
    }

    debug!("SHA-256 self-test passed");
    Ok(())
}
