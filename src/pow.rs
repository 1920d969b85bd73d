//! Proof-of-work admission puzzle.
//!
//! The relay hands each connecting client a random 32-byte nonce and a
//! difficulty; the client must find a 64-bit solution such that
//! `SHA-256(nonce ‖ solution_be)` starts with at least `difficulty` zero
//! bits. Verification is a single hash, so the cost asymmetry keeps
//! handshake flooding expensive for the client and cheap for the relay.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Size of the challenge nonce sent in CHALLENGE frames.
pub const CHALLENGE_NONCE_LEN: usize = 32;

/// Generate a cryptographically random challenge nonce.
pub fn generate_challenge() -> [u8; CHALLENGE_NONCE_LEN] {
    let mut nonce = [0u8; CHALLENGE_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Check that `SHA-256(nonce ‖ solution)` has at least `difficulty` leading
/// zero bits. The solution is hashed in big-endian form, matching the 8-byte
/// SOLUTION frame payload.
pub fn verify_pow(nonce: &[u8; CHALLENGE_NONCE_LEN], solution: u64, difficulty: u8) -> bool {
    leading_zero_bits(&pow_hash(nonce, solution)) >= u32::from(difficulty)
}

/// Brute-force the smallest solution for a nonce. Used by tests and test
/// clients; the relay itself only verifies. Returns `None` if the entire
/// 64-bit space is exhausted, which no realistic difficulty reaches.
pub fn solve_pow(nonce: &[u8; CHALLENGE_NONCE_LEN], difficulty: u8) -> Option<u64> {
    for solution in 0..=u64::MAX {
        if verify_pow(nonce, solution, difficulty) {
            return Some(solution);
        }
    }
    None
}

fn pow_hash(nonce: &[u8; CHALLENGE_NONCE_LEN], solution: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.update(solution.to_be_bytes());
    hasher.finalize().into()
}

/// Count leading zero bits, starting at the most-significant bit of byte 0.
fn leading_zero_bits(hash: &[u8; 32]) -> u32 {
    let mut zeros = 0u32;
    for byte in hash {
        if *byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros();
            break;
        }
    }
    zeros
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn difficulty_zero_accepts_anything() {
        let nonce = [0u8; 32];
        assert!(verify_pow(&nonce, 0, 0));
        assert!(verify_pow(&nonce, u64::MAX, 0));
    }

    #[test]
    fn solve_then_verify_roundtrip() {
        let nonce = generate_challenge();
        let solution = solve_pow(&nonce, 8).expect("difficulty 8 must be solvable");
        assert!(verify_pow(&nonce, solution, 8));
        // A valid solution at difficulty d also satisfies every d' < d.
        assert!(verify_pow(&nonce, solution, 4));
    }

    #[test]
    fn smallest_solution_neighbors_fail() {
        let nonce = [0u8; 32];
        let solution = solve_pow(&nonce, 8).unwrap();
        // solve_pow scans upward, so everything below the answer fails.
        if solution > 0 {
            assert!(!verify_pow(&nonce, solution - 1, 8));
        }
    }

    #[test]
    fn challenges_are_distinct() {
        assert_ne!(generate_challenge(), generate_challenge());
    }

    #[test]
    fn leading_zero_bit_counting() {
        assert_eq!(leading_zero_bits(&[0x00; 32]), 256);
        assert_eq!(leading_zero_bits(&[0xFF; 32]), 0);

        let mut hash = [0u8; 32];
        hash[1] = 0x80;
        assert_eq!(leading_zero_bits(&hash), 8);

        let mut hash = [0u8; 32];
        hash[2] = 0x01;
        assert_eq!(leading_zero_bits(&hash), 23);

        let mut hash = [0u8; 32];
        hash[0] = 0x10;
        assert_eq!(leading_zero_bits(&hash), 3);
    }

    #[test]
    fn solution_is_hashed_big_endian() {
        // Same numeric solution must verify identically whether it came from
        // the wire (8 BE bytes) or a local u64; a little-endian hash would
        // diverge for any asymmetric value.
        let nonce = [0x42u8; 32];
        let solution = solve_pow(&nonce, 8).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&nonce);
        buf.extend_from_slice(&solution.to_be_bytes());
        let hash: [u8; 32] = Sha256::digest(&buf).into();
        assert!(leading_zero_bits(&hash) >= 8);
    }
}
