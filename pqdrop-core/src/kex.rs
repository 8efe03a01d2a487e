//! Hybrid post-quantum key exchange
//!
//! ML-KEM-768 encapsulation combined with X25519 Diffie-Hellman. The two
//! public keys travel concatenated in one message; the derived secrets are
//! concatenated and fed through a fixed-context KDF to produce two
//! directional AEAD keys plus the nonce basis. Security holds as long as
//! either primitive remains unbroken.

use crate::crypto::{self, CryptoSuite, Direction, RecvCipher, SendCipher};
use crate::error::{Error, Result};
use crate::protocol::Message;
use crate::transport::Transport;
use pqcrypto_mlkem::mlkem768;
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SharedSecret as _};
use std::time::Duration;
use uuid::Uuid;
use zeroize::Zeroize;

/// ML-KEM-768 public key length
pub const MLKEM_PUBLIC_KEY_LEN: usize = 1184;

/// ML-KEM-768 ciphertext length
pub const MLKEM_CIPHERTEXT_LEN: usize = 1088;

/// X25519 public key length
pub const X25519_PUBLIC_KEY_LEN: usize = 32;

/// Combined handshake public key length (ML-KEM || X25519)
pub const COMBINED_PUBLIC_KEY_LEN: usize = MLKEM_PUBLIC_KEY_LEN + X25519_PUBLIC_KEY_LEN;

/// Combined encapsulation ciphertext length (ML-KEM ct || ephemeral X25519)
pub const COMBINED_CIPHERTEXT_LEN: usize = MLKEM_CIPHERTEXT_LEN + X25519_PUBLIC_KEY_LEN;

const CONTEXT_HYBRID_COMBINE: &str = "pqdrop v1 hybrid secret combine";
const CONTEXT_SESSION_KEYS: &str = "pqdrop v1 session key schedule";
const CONTEXT_KEY_ROTATION: &str = "pqdrop v1 key rotation";

/// Role of this side in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Role {
    /// Sends the combined public key, receives the encapsulation
    Initiator,
    /// Encapsulates against the received public key
    Responder,
}

/// Shared secret produced by the hybrid exchange
///
/// Also the root of the rotation chain: generation `n`'s secret is derived
/// from generation `n-1`'s.
pub struct SharedSecret(pub(crate) [u8; 32]);

impl SharedSecret {
    /// Raw secret bytes (persisted by the resume manager)
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Rebuild a secret from persisted resume material
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(<REDACTED>)")
    }
}

/// Negotiated directional session keys for one generation
pub struct SessionKeys {
    /// Rotation generation these keys belong to
    pub generation: u32,
    /// Cipher for the outgoing stream (owns the nonce counter)
    pub send: SendCipher,
    /// Cipher for the incoming stream
    pub recv: RecvCipher,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Hybrid handshake keypair (post-quantum + classical)
pub struct HybridKeyPair {
    mlkem_public: mlkem768::PublicKey,
    mlkem_secret: mlkem768::SecretKey,
    x25519_secret: x25519_dalek::StaticSecret,
    x25519_public: x25519_dalek::PublicKey,
}

impl HybridKeyPair {
    /// Generate a fresh keypair for one handshake
    pub fn generate() -> Self {
        let (mlkem_public, mlkem_secret) = mlkem768::keypair();
        let x25519_secret = x25519_dalek::StaticSecret::random_from_rng(rand_core::OsRng);
        let x25519_public = x25519_dalek::PublicKey::from(&x25519_secret);
        Self {
            mlkem_public,
            mlkem_secret,
            x25519_secret,
            x25519_public,
        }
    }

    /// The combined public key message: ML-KEM bytes followed by X25519 bytes
    pub fn combined_public(&self) -> Vec<u8> {
        let mut combined = Vec::with_capacity(COMBINED_PUBLIC_KEY_LEN);
        combined.extend_from_slice(self.mlkem_public.as_bytes());
        combined.extend_from_slice(self.x25519_public.as_bytes());
        combined
    }
}

impl std::fmt::Debug for HybridKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridKeyPair").finish_non_exhaustive()
    }
}

fn combine_secrets(
    mlkem_ss: &[u8],
    x25519_ss: &[u8; 32],
    password_key: Option<&[u8; 32]>,
) -> SharedSecret {
    let mut ikm = Vec::with_capacity(96);
    ikm.extend_from_slice(mlkem_ss);
    ikm.extend_from_slice(x25519_ss);
    if let Some(psk) = password_key {
        ikm.extend_from_slice(psk);
    }
    let mut combined = [0u8; 32];
    crypto::derive_okm(CONTEXT_HYBRID_COMBINE, &ikm, &mut combined);
    ikm.zeroize();
    SharedSecret(combined)
}

/// Encapsulate against a peer's combined public key (responder side)
///
/// Returns the combined ciphertext to send back and the shared secret.
pub fn encapsulate(
    combined_public: &[u8],
    password_key: Option<&[u8; 32]>,
) -> Result<(Vec<u8>, SharedSecret)> {
    if combined_public.len() != COMBINED_PUBLIC_KEY_LEN {
        return Err(Error::KeyExchangeFailed(format!(
            "combined public key has {} bytes, expected {}",
            combined_public.len(),
            COMBINED_PUBLIC_KEY_LEN
        )));
    }
    let mlkem_public = mlkem768::PublicKey::from_bytes(&combined_public[..MLKEM_PUBLIC_KEY_LEN])
        .map_err(|e| Error::KeyExchangeFailed(format!("malformed ML-KEM public key: {}", e)))?;
    let x25519_bytes: [u8; 32] = combined_public[MLKEM_PUBLIC_KEY_LEN..]
        .try_into()
        .map_err(|_| Error::KeyExchangeFailed("malformed X25519 public key".into()))?;
    let their_x25519 = x25519_dalek::PublicKey::from(x25519_bytes);

    let (mlkem_ss, mlkem_ct) = mlkem768::encapsulate(&mlkem_public);

    let ephemeral = x25519_dalek::StaticSecret::random_from_rng(rand_core::OsRng);
    let ephemeral_public = x25519_dalek::PublicKey::from(&ephemeral);
    let x25519_ss = ephemeral.diffie_hellman(&their_x25519);

    let secret = combine_secrets(mlkem_ss.as_bytes(), x25519_ss.as_bytes(), password_key);

    let mut combined_ct = Vec::with_capacity(COMBINED_CIPHERTEXT_LEN);
    combined_ct.extend_from_slice(mlkem_ct.as_bytes());
    combined_ct.extend_from_slice(ephemeral_public.as_bytes());
    Ok((combined_ct, secret))
}

/// Decapsulate a combined ciphertext with our keypair (initiator side)
pub fn decapsulate(
    keypair: &HybridKeyPair,
    combined_ciphertext: &[u8],
    password_key: Option<&[u8; 32]>,
) -> Result<SharedSecret> {
    if combined_ciphertext.len() != COMBINED_CIPHERTEXT_LEN {
        return Err(Error::KeyExchangeFailed(format!(
            "combined ciphertext has {} bytes, expected {}",
            combined_ciphertext.len(),
            COMBINED_CIPHERTEXT_LEN
        )));
    }
    let mlkem_ct = mlkem768::Ciphertext::from_bytes(&combined_ciphertext[..MLKEM_CIPHERTEXT_LEN])
        .map_err(|e| Error::KeyExchangeFailed(format!("malformed ML-KEM ciphertext: {}", e)))?;
    let x25519_bytes: [u8; 32] = combined_ciphertext[MLKEM_CIPHERTEXT_LEN..]
        .try_into()
        .map_err(|_| Error::KeyExchangeFailed("malformed ephemeral X25519 key".into()))?;
    let their_ephemeral = x25519_dalek::PublicKey::from(x25519_bytes);

    let mlkem_ss = mlkem768::decapsulate(&mlkem_ct, &keypair.mlkem_secret);
    let x25519_ss = keypair.x25519_secret.diffie_hellman(&their_ephemeral);

    Ok(combine_secrets(
        mlkem_ss.as_bytes(),
        x25519_ss.as_bytes(),
        password_key,
    ))
}

/// Derive the directional session keys for one generation
///
/// The schedule yields `key_i2r || key_r2i || basis`; each role picks its
/// send/recv halves so both sides agree without further negotiation. Fresh
/// nonce counters start at zero for every generation.
pub fn derive_session_keys(secret: &SharedSecret, generation: u32, role: Role) -> SessionKeys {
    derive_session_keys_with(secret, generation, role, CryptoSuite::default())
}

/// `derive_session_keys` with an explicit crypto suite
pub fn derive_session_keys_with(
    secret: &SharedSecret,
    generation: u32,
    role: Role,
    suite: CryptoSuite,
) -> SessionKeys {
    let mut ikm = [0u8; 36];
    ikm[..32].copy_from_slice(&secret.0);
    ikm[32..].copy_from_slice(&generation.to_be_bytes());

    let mut okm = [0u8; 68];
    crypto::derive_okm(CONTEXT_SESSION_KEYS, &ikm, &mut okm);
    ikm.zeroize();

    let mut key_i2r = [0u8; 32];
    let mut key_r2i = [0u8; 32];
    let mut basis = [0u8; 4];
    key_i2r.copy_from_slice(&okm[..32]);
    key_r2i.copy_from_slice(&okm[32..64]);
    basis.copy_from_slice(&okm[64..]);
    okm.zeroize();

    let keys = match role {
        Role::Initiator => SessionKeys {
            generation,
            send: SendCipher::new(suite.aead, key_i2r, basis, Direction::InitiatorToResponder),
            recv: RecvCipher::new(suite.aead, key_r2i),
        },
        Role::Responder => SessionKeys {
            generation,
            send: SendCipher::new(suite.aead, key_r2i, basis, Direction::ResponderToInitiator),
            recv: RecvCipher::new(suite.aead, key_i2r),
        },
    };
    key_i2r.zeroize();
    key_r2i.zeroize();
    keys
}

/// Derive the next generation's secret from the current one
///
/// Rotation never touches the wire beyond the generation announcement: both
/// sides walk the same chain.
pub fn rotate_secret(previous: &SharedSecret, next_generation: u32) -> SharedSecret {
    let mut ikm = [0u8; 36];
    ikm[..32].copy_from_slice(&previous.0);
    ikm[32..].copy_from_slice(&next_generation.to_be_bytes());
    let mut next = [0u8; 32];
    crypto::derive_okm(CONTEXT_KEY_ROTATION, &ikm, &mut next);
    ikm.zeroize();
    SharedSecret(next)
}

/// Handshake driver parameters
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Total attempts before the session fails permanently
    pub attempts: u32,
    /// Base delay for exponential backoff between attempts
    pub backoff: Duration,
    /// Optional transfer password
    pub password: Option<String>,
    /// Crypto suite for the derived keys
    pub suite: CryptoSuite,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::HANDSHAKE_TIMEOUT_SECS),
            attempts: crate::HANDSHAKE_MAX_ATTEMPTS,
            backoff: Duration::from_secs(1),
            password: None,
            suite: CryptoSuite::default(),
        }
    }
}

async fn recv_or_timeout(
    transport: &mut (dyn Transport + '_),
    timeout: Duration,
) -> Result<Option<Message>> {
    match tokio::time::timeout(timeout, transport.recv()).await {
        Ok(result) => result,
        Err(_) => Err(Error::KeyExchangeFailed("handshake timed out".into())),
    }
}

/// Run the initiator side of the handshake
///
/// Sends the combined public key and waits for the encapsulation, retrying
/// on timeout with exponential backoff.
pub async fn run_initiator(
    transport: &mut (dyn Transport + '_),
    session_id: Uuid,
    config: &HandshakeConfig,
) -> Result<(SharedSecret, SessionKeys)> {
    let keypair = HybridKeyPair::generate();
    let password_salt = config
        .password
        .as_deref()
        .map(|_| crypto::generate_password_salt());
    let password_key = match (&config.password, &password_salt) {
        (Some(password), Some(salt)) => Some(crypto::derive_password_key(password, salt)?),
        _ => None,
    };

    let mut last_error = Error::KeyExchangeFailed("handshake timed out".into());
    for attempt in 0..config.attempts {
        if attempt > 0 {
            tokio::time::sleep(config.backoff * 2u32.pow(attempt - 1)).await;
            tracing::debug!(session_id = %session_id, attempt, "retrying handshake");
        }
        transport
            .send(Message::PublicKey {
                session_id,
                public_key: keypair.combined_public(),
                password_salt,
            })
            .await?;

        match recv_or_timeout(transport, config.timeout).await {
            Ok(Some(Message::KeyExchange {
                session_id: echoed,
                ciphertext,
            })) => {
                if echoed != session_id {
                    return Err(Error::KeyExchangeFailed(
                        "key exchange for unknown session".into(),
                    ));
                }
                let secret = decapsulate(&keypair, &ciphertext, password_key.as_ref())?;
                let keys = derive_session_keys_with(&secret, 0, Role::Initiator, config.suite);
                tracing::info!(session_id = %session_id, "hybrid handshake complete");
                return Ok((secret, keys));
            }
            Ok(Some(Message::Error { reason })) => {
                return Err(Error::KeyExchangeFailed(reason));
            }
            Ok(Some(other)) => {
                return Err(Error::KeyExchangeFailed(format!(
                    "unexpected {} during handshake",
                    other.kind()
                )));
            }
            Ok(None) => {
                return Err(Error::KeyExchangeFailed(
                    "transport closed during handshake".into(),
                ));
            }
            Err(err @ Error::KeyExchangeFailed(_)) => {
                last_error = err;
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_error)
}

/// Run the responder side of the handshake
///
/// Waits for the peer's combined public key, encapsulates, and replies.
pub async fn run_responder(
    transport: &mut (dyn Transport + '_),
    config: &HandshakeConfig,
) -> Result<(Uuid, SharedSecret, SessionKeys)> {
    let mut last_error = Error::KeyExchangeFailed("handshake timed out".into());
    for _attempt in 0..config.attempts {
        match recv_or_timeout(transport, config.timeout).await {
            Ok(Some(Message::PublicKey {
                session_id,
                public_key,
                password_salt,
            })) => {
                let password_key = match (&config.password, &password_salt) {
                    (Some(password), Some(salt)) => {
                        Some(crypto::derive_password_key(password, salt)?)
                    }
                    _ => None,
                };
                let (ciphertext, secret) = encapsulate(&public_key, password_key.as_ref())?;
                transport
                    .send(Message::KeyExchange {
                        session_id,
                        ciphertext,
                    })
                    .await?;
                let keys = derive_session_keys_with(&secret, 0, Role::Responder, config.suite);
                tracing::info!(session_id = %session_id, "hybrid handshake complete");
                return Ok((session_id, secret, keys));
            }
            Ok(Some(Message::Error { reason })) => {
                return Err(Error::KeyExchangeFailed(reason));
            }
            Ok(Some(other)) => {
                return Err(Error::KeyExchangeFailed(format!(
                    "unexpected {} during handshake",
                    other.kind()
                )));
            }
            Ok(None) => {
                return Err(Error::KeyExchangeFailed(
                    "transport closed during handshake".into(),
                ));
            }
            Err(err @ Error::KeyExchangeFailed(_)) => {
                last_error = err;
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory_pair;

    #[test]
    fn test_hybrid_roundtrip() {
        let keypair = HybridKeyPair::generate();
        let (ciphertext, ss_responder) = encapsulate(&keypair.combined_public(), None).unwrap();
        let ss_initiator = decapsulate(&keypair, &ciphertext, None).unwrap();
        assert_eq!(ss_initiator.as_bytes(), ss_responder.as_bytes());
    }

    #[test]
    fn test_malformed_public_key_rejected() {
        let result = encapsulate(&[0u8; 17], None);
        assert!(matches!(result, Err(Error::KeyExchangeFailed(_))));
    }

    #[test]
    fn test_malformed_ciphertext_rejected() {
        let keypair = HybridKeyPair::generate();
        let result = decapsulate(&keypair, &[0u8; 17], None);
        assert!(matches!(result, Err(Error::KeyExchangeFailed(_))));
    }

    #[test]
    fn test_password_mixing_diverges() {
        let keypair = HybridKeyPair::generate();
        let psk_a = [1u8; 32];
        let psk_b = [2u8; 32];
        let (ciphertext, ss_with_a) =
            encapsulate(&keypair.combined_public(), Some(&psk_a)).unwrap();
        let ss_with_b = decapsulate(&keypair, &ciphertext, Some(&psk_b)).unwrap();
        assert_ne!(ss_with_a.as_bytes(), ss_with_b.as_bytes());
    }

    #[test]
    fn test_directional_keys_mirror() {
        let secret = SharedSecret([42u8; 32]);
        let mut initiator = derive_session_keys(&secret, 0, Role::Initiator);
        let responder = derive_session_keys(&secret, 0, Role::Responder);

        let (nonce, ciphertext) = initiator.send.encrypt(b"hello", b"aad").unwrap();
        let plaintext = responder.recv.decrypt(&nonce, &ciphertext, b"aad").unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn test_rotation_chain_agreement_and_counter_reset() {
        let secret = SharedSecret([7u8; 32]);
        let mut gen0 = derive_session_keys(&secret, 0, Role::Initiator);
        let (nonce0, _) = gen0.send.encrypt(b"x", b"").unwrap();
        assert_eq!(gen0.send.counter(), 1);

        let rotated = rotate_secret(&secret, 1);
        let rotated_again = rotate_secret(&secret, 1);
        assert_eq!(rotated.as_bytes(), rotated_again.as_bytes());
        assert_ne!(rotated.as_bytes(), secret.as_bytes());

        let mut gen1 = derive_session_keys(&rotated, 1, Role::Initiator);
        assert_eq!(gen1.send.counter(), 0);
        let (nonce1, _) = gen1.send.encrypt(b"x", b"").unwrap();
        // Fresh counter restarts at zero under the new key only
        assert_eq!(&nonce0[..8], &nonce1[..8]);
    }

    #[tokio::test]
    async fn test_handshake_over_memory_transport() {
        let (mut left, mut right) = memory_pair(16);
        let session_id = Uuid::new_v4();
        let config = HandshakeConfig {
            timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let responder_config = config.clone();

        let responder = tokio::spawn(async move {
            run_responder(&mut right, &responder_config).await.unwrap()
        });
        let (secret_i, mut keys_i) = run_initiator(&mut left, session_id, &config)
            .await
            .unwrap();
        let (echoed, secret_r, keys_r) = responder.await.unwrap();

        assert_eq!(echoed, session_id);
        assert_eq!(secret_i.as_bytes(), secret_r.as_bytes());

        let (nonce, ciphertext) = keys_i.send.encrypt(b"chunk", b"").unwrap();
        assert_eq!(keys_r.recv.decrypt(&nonce, &ciphertext, b"").unwrap(), b"chunk");
    }

    #[tokio::test]
    async fn test_handshake_timeout_fails_permanently() {
        let (mut left, _right) = memory_pair(16);
        let config = HandshakeConfig {
            timeout: Duration::from_millis(20),
            attempts: 2,
            backoff: Duration::from_millis(1),
            ..Default::default()
        };
        let result = run_initiator(&mut left, Uuid::new_v4(), &config).await;
        assert!(matches!(result, Err(Error::KeyExchangeFailed(_))));
    }
}
