//! Cryptographic primitives for the PQDROP engine
//!
//! Symmetric AEAD with counter-based nonce discipline, content hashing,
//! and password-based key derivation for password-protected transfers.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// AEAD nonce length in bytes (96 bits)
pub const NONCE_LEN: usize = 12;

/// AEAD authentication tag length in bytes
pub const AEAD_TAG_LEN: usize = 16;

/// Content hash length in bytes (256 bits)
pub const HASH_LEN: usize = 32;

/// Argon2 salt length for password-protected transfers
pub const PASSWORD_SALT_LEN: usize = 16;

/// Supported AEAD algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AeadAlgorithm {
    /// ChaCha20-Poly1305 (recommended)
    ChaCha20Poly1305,
    /// AES-256-GCM (hardware accelerated)
    Aes256Gcm,
}

/// Supported hash algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    /// BLAKE3 (fast, recommended)
    Blake3,
    /// SHA3-256 (NIST standard)
    Sha3_256,
}

/// Cryptographic suite configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoSuite {
    /// AEAD algorithm for chunk encryption
    pub aead: AeadAlgorithm,
    /// Hash algorithm for chunk and file content hashes
    pub hash: HashAlgorithm,
}

impl Default for CryptoSuite {
    fn default() -> Self {
        Self {
            aead: AeadAlgorithm::ChaCha20Poly1305,
            hash: HashAlgorithm::Blake3,
        }
    }
}

/// Hash data with the suite's content hash algorithm
pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> [u8; HASH_LEN] {
    match algorithm {
        HashAlgorithm::Blake3 => *blake3::hash(data).as_bytes(),
        HashAlgorithm::Sha3_256 => {
            use sha3::{Digest, Sha3_256};
            let mut hasher = Sha3_256::new();
            hasher.update(data);
            hasher.finalize().into()
        }
    }
}

/// Constant-time comparison of two content hashes
pub fn hashes_equal(a: &[u8; HASH_LEN], b: &[u8; HASH_LEN]) -> bool {
    bool::from(a.ct_eq(b))
}

/// Derived-key expansion with a fixed context string (BLAKE3 KDF mode)
pub(crate) fn derive_okm(context: &str, ikm: &[u8], okm: &mut [u8]) {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(ikm);
    hasher.finalize_xof().fill(okm);
}

/// Derive a 32-byte pre-shared key from a password (Argon2id, memory-hard)
///
/// The salt travels in the clear alongside the handshake; the derived key is
/// mixed into the session key schedule so a wrong password yields divergent
/// keys rather than an explicit protocol error.
pub fn derive_password_key(password: &str, salt: &[u8; PASSWORD_SALT_LEN]) -> Result<[u8; 32]> {
    let mut out = [0u8; 32];
    argon2::Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut out)
        .map_err(|e| Error::Crypto(format!("Argon2 derivation failed: {}", e)))?;
    Ok(out)
}

/// Generate a random Argon2 salt
pub fn generate_password_salt() -> [u8; PASSWORD_SALT_LEN] {
    use rand::RngCore;
    let mut salt = [0u8; PASSWORD_SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Direction of an encrypted stream within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Initiator-to-responder stream
    InitiatorToResponder,
    /// Responder-to-initiator stream
    ResponderToInitiator,
}

impl Direction {
    fn bit(self) -> u8 {
        match self {
            Direction::InitiatorToResponder => 0x00,
            Direction::ResponderToInitiator => 0x80,
        }
    }
}

/// Counter-based nonce source bound to exactly one (key, generation) pair
///
/// Deliberately neither `Clone` nor `Copy`: a counter exists once per key and
/// only the key schedule and key rotation construct fresh ones. The nonce is
/// the 64-bit counter big-endian in bytes 0..8 and the 4-byte schedule basis
/// (direction bit folded into byte 8) in bytes 8..12.
pub struct NonceCounter {
    counter: u64,
    basis: [u8; 4],
    direction: Direction,
}

impl NonceCounter {
    pub(crate) fn new(basis: [u8; 4], direction: Direction) -> Self {
        Self {
            counter: 0,
            basis,
            direction,
        }
    }

    /// Produce the next nonce, advancing the counter
    fn next(&mut self) -> Result<[u8; NONCE_LEN]> {
        if self.counter == u64::MAX {
            // A key must rotate long before 2^64 encryptions
            return Err(Error::Crypto("nonce counter exhausted".into()));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..8].copy_from_slice(&self.counter.to_be_bytes());
        nonce[8] = self.basis[0] ^ self.direction.bit();
        nonce[9] = self.basis[1];
        nonce[10] = self.basis[2];
        nonce[11] = self.basis[3];
        self.counter += 1;
        Ok(nonce)
    }

    /// Number of nonces issued so far
    pub fn counter(&self) -> u64 {
        self.counter
    }
}

impl Zeroize for NonceCounter {
    fn zeroize(&mut self) {
        self.counter.zeroize();
        self.basis.zeroize();
    }
}

impl Drop for NonceCounter {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl std::fmt::Debug for NonceCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceCounter")
            .field("counter", &self.counter)
            .field("basis", &"<REDACTED>")
            .field("direction", &self.direction)
            .finish()
    }
}

enum CipherInner {
    ChaCha(chacha20poly1305::ChaCha20Poly1305),
    Aes(aes_gcm::Aes256Gcm),
}

impl CipherInner {
    fn new(algorithm: AeadAlgorithm, key: &[u8; 32]) -> Self {
        match algorithm {
            AeadAlgorithm::ChaCha20Poly1305 => {
                use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit};
                CipherInner::ChaCha(ChaCha20Poly1305::new(Key::from_slice(key)))
            }
            AeadAlgorithm::Aes256Gcm => {
                use aes_gcm::{Aes256Gcm, Key, KeyInit};
                CipherInner::Aes(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)))
            }
        }
    }

    fn encrypt(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(plaintext.len() + AEAD_TAG_LEN);
        buffer.extend_from_slice(plaintext);
        match self {
            CipherInner::ChaCha(cipher) => {
                use chacha20poly1305::{AeadInPlace, Nonce};
                cipher
                    .encrypt_in_place(Nonce::from_slice(nonce), aad, &mut buffer)
                    .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;
            }
            CipherInner::Aes(cipher) => {
                use aes_gcm::{AeadInPlace, Nonce};
                cipher
                    .encrypt_in_place(Nonce::from_slice(nonce), aad, &mut buffer)
                    .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;
            }
        }
        Ok(buffer)
    }

    fn decrypt(&self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let mut buffer = ciphertext.to_vec();
        match self {
            CipherInner::ChaCha(cipher) => {
                use chacha20poly1305::{AeadInPlace, Nonce};
                cipher
                    .decrypt_in_place(Nonce::from_slice(nonce), aad, &mut buffer)
                    .map_err(|e| Error::Crypto(format!("Decryption failed: {}", e)))?;
            }
            CipherInner::Aes(cipher) => {
                use aes_gcm::{AeadInPlace, Nonce};
                cipher
                    .decrypt_in_place(Nonce::from_slice(nonce), aad, &mut buffer)
                    .map_err(|e| Error::Crypto(format!("Decryption failed: {}", e)))?;
            }
        }
        Ok(buffer)
    }
}

/// Sending half of a directional AEAD key
///
/// Owns its nonce counter; every encryption advances it. Constructed only by
/// the key schedule, so a counter can never be shared between keys.
pub struct SendCipher {
    inner: CipherInner,
    key: [u8; 32],
    nonce: NonceCounter,
}

impl SendCipher {
    pub(crate) fn new(
        algorithm: AeadAlgorithm,
        key: [u8; 32],
        basis: [u8; 4],
        direction: Direction,
    ) -> Self {
        Self {
            inner: CipherInner::new(algorithm, &key),
            key,
            nonce: NonceCounter::new(basis, direction),
        }
    }

    /// Encrypt, returning the nonce used alongside the ciphertext
    pub fn encrypt(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>)> {
        let nonce = self.nonce.next()?;
        let ciphertext = self.inner.encrypt(&nonce, plaintext, aad)?;
        Ok((nonce, ciphertext))
    }

    /// Number of encryptions performed under this key
    pub fn counter(&self) -> u64 {
        self.nonce.counter()
    }
}

impl Drop for SendCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for SendCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendCipher")
            .field("counter", &self.nonce.counter())
            .finish_non_exhaustive()
    }
}

/// Receiving half of a directional AEAD key
///
/// Decryption takes the peer's explicit nonce; no counter is owned here.
pub struct RecvCipher {
    inner: CipherInner,
    key: [u8; 32],
}

impl RecvCipher {
    pub(crate) fn new(algorithm: AeadAlgorithm, key: [u8; 32]) -> Self {
        Self {
            inner: CipherInner::new(algorithm, &key),
            key,
        }
    }

    /// Decrypt and authenticate a ciphertext
    pub fn decrypt(
        &self,
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>> {
        self.inner.decrypt(nonce, ciphertext, aad)
    }
}

impl Drop for RecvCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for RecvCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecvCipher").finish_non_exhaustive()
    }
}
