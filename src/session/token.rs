//! Session token generation and constant-time fingerprint comparison.

use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;

/// Bytes of randomness per token. 16 bytes = 128 bits, the spec's minimum.
const TOKEN_BYTES: usize = 32;

/// Mint a fresh, unguessable session token.
///
/// Generated with the OS RNG on every join; never derived or reused.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Constant-time equality over raw bytes.
///
/// Fingerprints are compared this way, never hash-then-compare, so that
/// mismatched-length or mismatched-content fingerprints leak no timing
/// signal beyond "not equal".
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
