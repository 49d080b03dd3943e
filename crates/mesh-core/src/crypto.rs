//! End-to-end and forum encryption
//!
//! Direct messages use a key agreed with ECDH on secp256k1: the shared point
//! is compressed and hashed with SHA-256 before use. Forum messages use
//! `SHA256("forum:" + channel)`, which anyone knowing the channel name can
//! derive, so forums are hidden from outsiders but members are not
//! authenticated to each other. Both paths encrypt with AES-256-GCM under a
//! fresh random 12-byte nonce per call.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::debug;
use zeroize::Zeroize;

use crate::error::{MeshError, MeshResult};

/// Version tag written into every [`EncryptedPayload`]
pub const ENCRYPTION_VERSION: u8 = 1;

/// AES-GCM nonce length in bytes
pub const NONCE_LEN: usize = 12;

/// 256-bit symmetric key, wiped from memory on drop
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Long-lived secp256k1 key pair of this node
pub struct NodeIdentity {
    secret: SecretKey,
}

impl NodeIdentity {
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut OsRng),
        }
    }

    /// Load a 32-byte secret key written as hex
    pub fn from_hex(secret_hex: &str) -> MeshResult<Self> {
        let mut bytes = hex::decode(secret_hex.trim())
            .map_err(|e| MeshError::InvalidKey(format!("secret key is not hex: {}", e)))?;
        let secret = SecretKey::from_slice(&bytes)
            .map_err(|_| MeshError::InvalidKey("secret key is not a valid secp256k1 scalar".into()));
        bytes.zeroize();
        Ok(Self { secret: secret? })
    }

    /// Compressed SEC1 public key (33 bytes)
    pub fn public_key_bytes(&self) -> [u8; 33] {
        let encoded = self.secret.public_key().to_encoded_point(true);
        let mut out = [0u8; 33];
        out.copy_from_slice(encoded.as_bytes());
        out
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Ciphertext envelope carried inside mesh messages
///
/// `ciphertext` includes the 16-byte GCM tag. Both fields are base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub v: u8,
    pub nonce: String,
    pub ciphertext: String,
}

/// Stateless encryption operations
pub struct CryptoEngine;

impl CryptoEngine {
    /// ECDH on secp256k1; the compressed shared point is hashed with SHA-256
    ///
    /// Symmetric: `derive(a, pub_b) == derive(b, pub_a)`.
    pub fn derive_shared_secret(
        my_identity: &NodeIdentity,
        their_public_key_hex: &str,
    ) -> MeshResult<SymmetricKey> {
        let their_bytes = hex::decode(their_public_key_hex.trim())
            .map_err(|e| MeshError::InvalidKey(format!("public key is not hex: {}", e)))?;
        let their_key = PublicKey::from_sec1_bytes(&their_bytes)
            .map_err(|_| MeshError::InvalidKey("public key is not a secp256k1 point".into()))?;

        let shared_point =
            (their_key.to_projective() * *my_identity.secret.to_nonzero_scalar()).to_affine();
        let compressed = shared_point.to_encoded_point(true);

        let digest = Sha256::digest(compressed.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Ok(SymmetricKey(key))
    }

    /// Reject bytes that are not a SEC1-encoded secp256k1 point
    pub fn validate_public_key(sec1_bytes: &[u8]) -> MeshResult<()> {
        PublicKey::from_sec1_bytes(sec1_bytes)
            .map(|_| ())
            .map_err(|_| MeshError::InvalidKey("public key is not a secp256k1 point".into()))
    }

    /// `SHA256("forum:" + channel_name)`
    pub fn derive_forum_key(channel_name: &str) -> SymmetricKey {
        let mut hasher = Sha256::new();
        hasher.update(b"forum:");
        hasher.update(channel_name.as_bytes());
        let digest = hasher.finalize();

        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        SymmetricKey(key)
    }

    pub fn encrypt_bytes(plaintext: &[u8], key: &SymmetricKey) -> MeshResult<EncryptedPayload> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| MeshError::InvalidKey(format!("AES-256 key rejected: {}", e)))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| MeshError::InvalidPayload(format!("AES-GCM encryption failed: {}", e)))?;

        Ok(EncryptedPayload {
            v: ENCRYPTION_VERSION,
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    /// Fails with [`MeshError::AuthenticationFailure`] when the tag does not
    /// verify; malformed envelopes fail with [`MeshError::InvalidPayload`].
    pub fn decrypt_bytes(payload: &EncryptedPayload, key: &SymmetricKey) -> MeshResult<Vec<u8>> {
        if payload.v != ENCRYPTION_VERSION {
            return Err(MeshError::InvalidPayload(format!(
                "unsupported encryption version {}",
                payload.v
            )));
        }

        let nonce_bytes = BASE64
            .decode(&payload.nonce)
            .map_err(|e| MeshError::InvalidPayload(format!("nonce is not base64: {}", e)))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(MeshError::InvalidPayload(format!(
                "nonce must be {} bytes, got {}",
                NONCE_LEN,
                nonce_bytes.len()
            )));
        }
        let ciphertext = BASE64
            .decode(&payload.ciphertext)
            .map_err(|e| MeshError::InvalidPayload(format!("ciphertext is not base64: {}", e)))?;

        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| MeshError::InvalidKey(format!("AES-256 key rejected: {}", e)))?;

        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
            .map_err(|_| {
                debug!("GCM tag verification failed");
                MeshError::AuthenticationFailure
            })
    }

    pub fn encrypt_message(plaintext: &str, key: &SymmetricKey) -> MeshResult<EncryptedPayload> {
        Self::encrypt_bytes(plaintext.as_bytes(), key)
    }

    pub fn decrypt_message(payload: &EncryptedPayload, key: &SymmetricKey) -> MeshResult<String> {
        let bytes = Self::decrypt_bytes(payload, key)?;
        String::from_utf8(bytes)
            .map_err(|e| MeshError::InvalidPayload(format!("plaintext is not UTF-8: {}", e)))
    }

    pub fn encrypt_dm(
        plaintext: &str,
        my_identity: &NodeIdentity,
        their_public_key_hex: &str,
    ) -> MeshResult<EncryptedPayload> {
        let key = Self::derive_shared_secret(my_identity, their_public_key_hex)?;
        Self::encrypt_message(plaintext, &key)
    }

    pub fn decrypt_dm(
        payload: &EncryptedPayload,
        my_identity: &NodeIdentity,
        their_public_key_hex: &str,
    ) -> MeshResult<String> {
        let key = Self::derive_shared_secret(my_identity, their_public_key_hex)?;
        Self::decrypt_message(payload, &key)
    }

    pub fn encrypt_forum(plaintext: &str, channel_name: &str) -> MeshResult<EncryptedPayload> {
        Self::encrypt_message(plaintext, &Self::derive_forum_key(channel_name))
    }

    pub fn decrypt_forum(payload: &EncryptedPayload, channel_name: &str) -> MeshResult<String> {
        Self::decrypt_message(payload, &Self::derive_forum_key(channel_name))
    }
}
