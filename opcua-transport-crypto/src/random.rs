//! Cryptographically strong random byte generation, used for nonces and padding bytes.

/// Fill `bytes` with cryptographically strong pseudo-random data.
pub fn bytes(bytes: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(bytes);
}

/// Allocate `len` cryptographically strong pseudo-random bytes.
pub fn byte_vec(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    bytes(&mut data);
    data
}
