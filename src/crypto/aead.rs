use rand::{rngs::OsRng, RngCore};

// Constants for GCM mode
const GCM_BLOCK_SIZE: usize = 16; // AES block size
/// Size of a GCM nonce in bytes
pub const GCM_NONCE_SIZE: usize = 12;
/// Size of a GCM authentication tag in bytes
pub const GCM_TAG_SIZE: usize = 16;

// Maximum message size supported by GCM
// ((1 << 32) - 2) * GCM_BLOCK_SIZE
pub(crate) const GCM_MAX_DATA_SIZE: usize = ((1 << 32) - 2) * GCM_BLOCK_SIZE;

/// Fills a buffer with random bytes using a cryptographically secure RNG
pub fn fill_random(buffer: &mut [u8]) {
    OsRng.fill_bytes(buffer);
}

/// Generates a fresh random GCM nonce
pub fn new_nonce() -> [u8; GCM_NONCE_SIZE] {
    let mut nonce = [0_u8; GCM_NONCE_SIZE];
    fill_random(&mut nonce);
    nonce
}
