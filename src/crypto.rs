//! Key material handling and keypair derivation
//!
//! Seeds and private keys never live in `String`s. They are drawn straight
//! into [`SecretBuffer`]s, handed around by move, and wiped in place once
//! they are no longer needed.

use crate::{Error, Result};
use blake2::{Blake2s256, Digest};
use ed25519_dalek::SigningKey;
use rand::{Rng, RngCore};
use std::fmt;
use std::sync::atomic::{compiler_fence, Ordering};

/// Number of characters in a generation seed
pub const SEED_LENGTH: usize = 55;

/// Alphabet seeds are drawn from
pub const SEED_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

/// Symbols a base32 public identifier is made of
pub const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

const WIPE_PASSES: usize = 3;

/// Overwrite `bytes` with random passes and then zeros.
///
/// Best effort: the fence and `black_box` keep the stores from being elided,
/// but copies made by other code are out of reach.
pub fn wipe_bytes(bytes: &mut [u8]) {
    if bytes.is_empty() {
        return;
    }

    let mut rng = rand::rng();
    for _ in 0..WIPE_PASSES {
        rng.fill_bytes(bytes);
        std::hint::black_box(&mut *bytes);
    }
    bytes.fill(0);
    std::hint::black_box(&mut *bytes);
    compiler_fence(Ordering::SeqCst);
}

/// Owned, wipe-on-drop storage for seed and key material
#[derive(Default)]
pub struct SecretBuffer {
    bytes: Vec<u8>,
}

impl SecretBuffer {
    /// Create a zero-filled buffer of `len` bytes
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: vec![0u8; len],
        }
    }

    /// Take ownership of existing bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Borrow the contents as text, for display at the very edge of the program
    pub fn expose_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.bytes)
            .map_err(|e| Error::crypto(format!("secret is not valid UTF-8: {}", e)))
    }

    /// Overwrite the contents in place. Length is kept so scratch buffers can
    /// be reused without reallocating.
    pub fn wipe(&mut self) {
        wipe_bytes(&mut self.bytes);
    }

    /// True when every byte is zero (an empty buffer counts)
    pub fn is_zeroed(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }

    /// Move the contents out, leaving this buffer empty. No bytes are copied.
    pub fn take(&mut self) -> SecretBuffer {
        SecretBuffer {
            bytes: std::mem::take(&mut self.bytes),
        }
    }
}

impl Drop for SecretBuffer {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBuffer([REDACTED; {} bytes])", self.bytes.len())
    }
}

/// Fill `seed` in place with characters drawn uniformly from [`SEED_ALPHABET`]
pub fn fill_seed<R: Rng + ?Sized>(rng: &mut R, seed: &mut SecretBuffer) {
    for byte in seed.as_mut_bytes() {
        *byte = SEED_ALPHABET[rng.random_range(0..SEED_ALPHABET.len())];
    }
}

/// Output of one derivation
#[derive(Debug)]
pub struct DerivedKeypair {
    pub public_id: String,
    pub private_key: SecretBuffer,
}

/// Turns a seed into a keypair.
///
/// Implementations run on worker threads and must be callable concurrently.
/// Any error they return is treated as a transient failure of that attempt.
pub trait KeyGenerator: Send + Sync {
    /// Derive the keypair for `seed`
    fn derive(&self, seed: &SecretBuffer) -> Result<DerivedKeypair>;

    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Number of distinct symbols per public identifier position
    fn alphabet_size(&self) -> u32 {
        BASE32_ALPHABET.len() as u32
    }
}

/// Ed25519 keys stretched from the seed with Blake2s.
///
/// The public identifier is the base32 encoding of the verifying key; the
/// private key is the hex encoding of the 32-byte signing secret.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519KeyGenerator;

impl Ed25519KeyGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl KeyGenerator for Ed25519KeyGenerator {
    fn derive(&self, seed: &SecretBuffer) -> Result<DerivedKeypair> {
        if seed.is_empty() {
            return Err(Error::transient_generation("empty seed"));
        }

        let mut hasher = Blake2s256::new();
        hasher.update(seed.as_bytes());
        let mut digest = hasher.finalize();

        let mut secret = [0u8; 32];
        secret.copy_from_slice(&digest);
        wipe_bytes(digest.as_mut_slice());

        let signing_key = SigningKey::from_bytes(&secret);
        let public_id = base32_encode(signing_key.verifying_key().as_bytes());

        let mut private_key = SecretBuffer::zeroed(secret.len() * 2);
        let encoded = hex::encode_to_slice(&secret, private_key.as_mut_bytes());
        wipe_bytes(&mut secret);
        encoded.map_err(|e| Error::crypto(format!("failed to encode private key: {}", e)))?;

        Ok(DerivedKeypair {
            public_id,
            private_key,
        })
    }

    fn name(&self) -> &'static str {
        "ed25519-blake2s"
    }
}

/// RFC 4648 base32, uppercase, without padding
pub fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8).div_ceil(5));
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;

    for &byte in data {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            let index = (buffer >> (bits - 5)) & 0x1f;
            out.push(BASE32_ALPHABET[index as usize] as char);
            bits -= 5;
        }
        buffer &= (1 << bits) - 1;
    }

    if bits > 0 {
        let index = (buffer << (5 - bits)) & 0x1f;
        out.push(BASE32_ALPHABET[index as usize] as char);
    }

    out
}
