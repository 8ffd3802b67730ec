//! The pseudo-random function used to derive secure channel keys from the client/server
//! nonce pair, per Part 6 6.7.5: `PRF(secret, seed, length, offset)` built from repeated
//! HMAC application (P_SHA256), grounded on the key table in
//! `async_opcua_core::comms::secure_channel::SecureChannel::derive_keys`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// `P_SHA256(secret, seed)`, truncated/offset to produce `length` bytes starting at `offset`
/// bytes into the pseudo-random sequence.
pub fn p_sha256(secret: &[u8], seed: &[u8], length: usize, offset: usize) -> Vec<u8> {
    let total = offset + length;
    let mut output = Vec::with_capacity(total + 32);

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(seed);
    let mut a = mac.finalize_reset().into_bytes().to_vec();

    while output.len() < total {
        let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
        mac.update(&a);
        mac.update(seed);
        output.extend_from_slice(&mac.finalize_reset().into_bytes());

        let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
        mac.update(&a);
        a = mac.finalize_reset().into_bytes().to_vec();
    }

    output.truncate(total);
    output.split_off(offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_length_matches_request() {
        let out = p_sha256(b"secret-nonce", b"seed-nonce", 48, 0);
        assert_eq!(out.len(), 48);
    }

    #[test]
    fn offset_slices_consistently_with_a_zero_offset_prefix() {
        let whole = p_sha256(b"secret", b"seed", 64, 0);
        let tail = p_sha256(b"secret", b"seed", 32, 32);
        assert_eq!(&whole[32..], &tail[..]);
    }

    #[test]
    fn is_deterministic_for_the_same_inputs() {
        let a = p_sha256(b"secret", b"seed", 32, 0);
        let b = p_sha256(b"secret", b"seed", 32, 0);
        assert_eq!(a, b);
    }
}
