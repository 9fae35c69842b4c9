//! # Value Transformers
//!
//! The record store persists and compares opaque bytes. Anything that changes
//! the byte representation of a value (framing, compression, encryption) sits
//! above it as a [`ValueTransformer`], applied by the façade:
//!
//! ```text
//!   caller value ──to_storage──▶ stored bytes ──from_storage──▶ caller value
//! ```
//!
//! Both directions receive the (un-prefixed) key so an implementation can
//! bind a stored value to the key it was written under.
//!
//! ## Built-ins
//!
//! - [`IdentityTransformer`]: bytes pass through unchanged (the default)
//! - [`PrefixTransformer`]: tags stored values and rejects untagged ones
//! - [`EncryptingTransformer`]: Zstd + AES-256-GCM with per-value HKDF keys
//!
//! ## Key Management
//!
//! Encryption keys come from a [`KeyProvider`]. [`EnvKeyProvider`] reads a
//! 32-byte hex master key from `KVSQL_MASTER_KEY`.

use std::env;
use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use sha2::Sha256;

use crate::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// AES-256 key size in bytes.
pub const AES256_KEY_SIZE: usize = 32;

/// AES-GCM nonce size in bytes (96 bits).
pub const AES_GCM_NONCE_SIZE: usize = 12;

/// Zstd compression level (1 = fastest).
const ZSTD_COMPRESSION_LEVEL: i32 = 1;

/// Environment variable name for the master encryption key.
pub const MASTER_KEY_ENV_VAR: &str = "KVSQL_MASTER_KEY";

// =============================================================================
// Transformer Trait
// =============================================================================

/// A reversible transformation applied to values at the façade boundary.
///
/// `from_storage(key, to_storage(key, v)) == v` must hold for every key and
/// value. A failure in either direction surfaces as [`Error::Transform`].
pub trait ValueTransformer: Send + Sync {
    /// Converts a caller value into the bytes that get persisted.
    fn to_storage(&self, key: &str, value: &[u8]) -> Result<Vec<u8>>;

    /// Converts persisted bytes back into the caller value.
    fn from_storage(&self, key: &str, stored: &[u8]) -> Result<Vec<u8>>;
}

/// Leaves values untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransformer;

impl ValueTransformer for IdentityTransformer {
    fn to_storage(&self, _key: &str, value: &[u8]) -> Result<Vec<u8>> {
        Ok(value.to_vec())
    }

    fn from_storage(&self, _key: &str, stored: &[u8]) -> Result<Vec<u8>> {
        Ok(stored.to_vec())
    }
}

// =============================================================================
// Prefix Transformer
// =============================================================================

/// Prepends a fixed tag to stored values and strips it on the way out.
///
/// Wraps another transformer, so a tag can mark which encoding produced the
/// bytes (e.g. `b"enc:v1:"` in front of an [`EncryptingTransformer`]).
/// Stored values without the tag are rejected rather than passed through.
pub struct PrefixTransformer {
    tag: Vec<u8>,
    inner: Arc<dyn ValueTransformer>,
}

impl PrefixTransformer {
    /// Creates a transformer tagging the output of `inner`.
    pub fn new(tag: impl Into<Vec<u8>>, inner: Arc<dyn ValueTransformer>) -> Self {
        Self {
            tag: tag.into(),
            inner,
        }
    }

    /// Tags untransformed values.
    pub fn tag_only(tag: impl Into<Vec<u8>>) -> Self {
        Self::new(tag, Arc::new(IdentityTransformer))
    }
}

impl ValueTransformer for PrefixTransformer {
    fn to_storage(&self, key: &str, value: &[u8]) -> Result<Vec<u8>> {
        let body = self.inner.to_storage(key, value)?;
        let mut out = Vec::with_capacity(self.tag.len() + body.len());
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn from_storage(&self, key: &str, stored: &[u8]) -> Result<Vec<u8>> {
        match stored.strip_prefix(self.tag.as_slice()) {
            Some(body) => self.inner.from_storage(key, body),
            None => Err(Error::Transform(format!(
                "value for key '{key}' is missing the expected prefix"
            ))),
        }
    }
}

// =============================================================================
// Key Provider Trait
// =============================================================================

/// Source of the master encryption key.
///
/// Swappable so keys can come from the environment today and from an
/// external key service later.
pub trait KeyProvider: Send + Sync {
    /// Returns the master key bytes.
    fn get_master_key(&self) -> Result<[u8; AES256_KEY_SIZE]>;

    /// Derives the key for one stored value.
    ///
    /// HKDF-SHA256 over the master key with `info = key || nonce`, so every
    /// write gets its own key even under a nonce collision.
    fn derive_value_key(
        &self,
        key: &str,
        nonce: &[u8; AES_GCM_NONCE_SIZE],
    ) -> Result<[u8; AES256_KEY_SIZE]> {
        let master = self.get_master_key()?;
        let salt = &master[..16];

        let mut info = Vec::with_capacity(key.len() + AES_GCM_NONCE_SIZE);
        info.extend_from_slice(key.as_bytes());
        info.extend_from_slice(nonce);

        let hk = Hkdf::<Sha256>::new(Some(salt), &master);
        let mut output = [0u8; AES256_KEY_SIZE];
        hk.expand(&info, &mut output)
            .map_err(|_| Error::Transform("HKDF expand failed".into()))?;

        Ok(output)
    }
}

/// Key provider holding a master key read from `KVSQL_MASTER_KEY`.
///
/// ```bash
/// export KVSQL_MASTER_KEY="0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
/// ```
pub struct EnvKeyProvider {
    master_key: [u8; AES256_KEY_SIZE],
}

impl EnvKeyProvider {
    /// Reads and decodes `KVSQL_MASTER_KEY`.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the variable is unset, not hex, or not 32 bytes.
    pub fn from_env() -> Result<Self> {
        let hex_key = env::var(MASTER_KEY_ENV_VAR)
            .map_err(|_| Error::Config(format!("{MASTER_KEY_ENV_VAR} environment variable not set")))?;

        let key_bytes = hex_decode(&hex_key)
            .map_err(|e| Error::Config(format!("invalid hex in {MASTER_KEY_ENV_VAR}: {e}")))?;

        if key_bytes.len() != AES256_KEY_SIZE {
            return Err(Error::Config(format!(
                "{} must be {} hex characters (got {})",
                MASTER_KEY_ENV_VAR,
                AES256_KEY_SIZE * 2,
                hex_key.len()
            )));
        }

        let mut master_key = [0u8; AES256_KEY_SIZE];
        master_key.copy_from_slice(&key_bytes);

        Ok(Self { master_key })
    }

    /// Creates a provider with a specific key.
    pub fn from_key(key: [u8; AES256_KEY_SIZE]) -> Self {
        Self { master_key: key }
    }
}

impl KeyProvider for EnvKeyProvider {
    fn get_master_key(&self) -> Result<[u8; AES256_KEY_SIZE]> {
        Ok(self.master_key)
    }
}

// =============================================================================
// Encrypting Transformer
// =============================================================================

/// Compresses and encrypts values.
///
/// Stored layout: `nonce (12 bytes) || AES-256-GCM(zstd(value))`. The key is
/// passed as associated data, so a stored value copied under another key
/// fails to decrypt.
///
/// # Design Decision: Always Both
///
/// Compression and encryption are not separately switchable; there is no way
/// to configure this transformer into writing plaintext.
pub struct EncryptingTransformer {
    key_provider: Box<dyn KeyProvider>,
}

impl EncryptingTransformer {
    /// Creates a transformer with the given key provider.
    pub fn new(key_provider: impl KeyProvider + 'static) -> Self {
        Self {
            key_provider: Box::new(key_provider),
        }
    }

    /// Creates a transformer keyed from `KVSQL_MASTER_KEY`.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(EnvKeyProvider::from_env()?))
    }

    fn cipher(&self, key: &str, nonce: &[u8; AES_GCM_NONCE_SIZE]) -> Result<Aes256Gcm> {
        let value_key = self.key_provider.derive_value_key(key, nonce)?;
        Aes256Gcm::new_from_slice(&value_key)
            .map_err(|e| Error::Transform(format!("failed to create cipher: {e}")))
    }
}

impl ValueTransformer for EncryptingTransformer {
    fn to_storage(&self, key: &str, value: &[u8]) -> Result<Vec<u8>> {
        let compressed = zstd::encode_all(value, ZSTD_COMPRESSION_LEVEL)
            .map_err(|e| Error::Transform(format!("compression failed: {e}")))?;

        let nonce = generate_nonce();
        let cipher = self.cipher(key, &nonce)?;

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &compressed,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|e| Error::Transform(format!("encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(AES_GCM_NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn from_storage(&self, key: &str, stored: &[u8]) -> Result<Vec<u8>> {
        if stored.len() < AES_GCM_NONCE_SIZE {
            return Err(Error::Transform(format!(
                "stored value for key '{key}' is too short to hold a nonce"
            )));
        }

        let (nonce_bytes, ciphertext) = stored.split_at(AES_GCM_NONCE_SIZE);
        let mut nonce = [0u8; AES_GCM_NONCE_SIZE];
        nonce.copy_from_slice(nonce_bytes);

        let cipher = self.cipher(key, &nonce)?;
        let compressed = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|e| Error::Transform(format!("decryption failed for key '{key}': {e}")))?;

        zstd::decode_all(compressed.as_slice())
            .map_err(|e| Error::Transform(format!("decompression failed: {e}")))
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Generates a cryptographically secure random nonce.
fn generate_nonce() -> [u8; AES_GCM_NONCE_SIZE] {
    let mut rng = StdRng::from_entropy();
    let mut nonce = [0u8; AES_GCM_NONCE_SIZE];
    rng.fill_bytes(&mut nonce);
    nonce
}

fn hex_decode(hex: &str) -> std::result::Result<Vec<u8>, String> {
    if hex.len() % 2 != 0 {
        return Err("hex string must have even length".into());
    }

    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .ok_or_else(|| format!("invalid hex at position {i}"))
                .and_then(|pair| {
                    u8::from_str_radix(pair, 16).map_err(|e| format!("invalid hex at position {i}: {e}"))
                })
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        key
    }

    fn cryptor() -> EncryptingTransformer {
        EncryptingTransformer::new(EnvKeyProvider::from_key(test_key()))
    }

    #[test]
    fn test_identity_passes_bytes_through() {
        let t = IdentityTransformer;
        let stored = t.to_storage("k", b"abc").unwrap();
        assert_eq!(stored, b"abc");
        assert_eq!(t.from_storage("k", &stored).unwrap(), b"abc");
    }

    #[test]
    fn test_prefix_tags_and_rejects_untagged() {
        let t = PrefixTransformer::tag_only(b"v1:".to_vec());

        let stored = t.to_storage("k", b"payload").unwrap();
        assert_eq!(stored, b"v1:payload");
        assert_eq!(t.from_storage("k", &stored).unwrap(), b"payload");

        let err = t.from_storage("k", b"payload").unwrap_err();
        assert!(matches!(err, Error::Transform(_)));
    }

    #[test]
    fn test_encrypt_roundtrip() {
        let t = cryptor();
        let plaintext = b"{\"kind\":\"ConfigMap\",\"data\":{\"a\":\"b\"}}";

        let stored = t.to_storage("/registry/configmaps/default/a", plaintext).unwrap();
        assert_ne!(&stored[AES_GCM_NONCE_SIZE..], plaintext.as_slice());

        let opened = t.from_storage("/registry/configmaps/default/a", &stored).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_encrypt_empty_value() {
        let t = cryptor();
        let stored = t.to_storage("k", b"").unwrap();
        assert_eq!(t.from_storage("k", &stored).unwrap(), b"");
    }

    #[test]
    fn test_same_value_encrypts_differently() {
        let t = cryptor();
        let a = t.to_storage("k", b"same data").unwrap();
        let b = t.to_storage("k", b"same data").unwrap();
        assert_ne!(a, b, "random nonces must give distinct ciphertexts");
    }

    #[test]
    fn test_value_bound_to_key() {
        let t = cryptor();
        let stored = t.to_storage("a/1", b"secret").unwrap();

        let err = t.from_storage("a/2", &stored).unwrap_err();
        assert!(matches!(err, Error::Transform(_)));
    }

    #[test]
    fn test_wrong_master_key_fails() {
        let stored = cryptor().to_storage("k", b"secret").unwrap();

        let other = EncryptingTransformer::new(EnvKeyProvider::from_key([0xAA; 32]));
        assert!(other.from_storage("k", &stored).is_err());
    }

    #[test]
    fn test_truncated_value_rejected() {
        let err = cryptor().from_storage("k", &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, Error::Transform(_)));
    }

    #[test]
    fn test_tagged_encryption_stack() {
        let t = PrefixTransformer::new(b"enc:v1:".to_vec(), Arc::new(cryptor()));
        let stored = t.to_storage("k", b"hello").unwrap();
        assert!(stored.starts_with(b"enc:v1:"));
        assert_eq!(t.from_storage("k", &stored).unwrap(), b"hello");
    }

    #[test]
    fn test_hex_decode() {
        assert_eq!(hex_decode("00ff10").unwrap(), vec![0x00, 0xff, 0x10]);
        assert!(hex_decode("abc").is_err());
        assert!(hex_decode("zz").is_err());
    }

    #[test]
    fn test_env_key_provider() {
        let hex: String = (0..32).map(|i| format!("{i:02x}")).collect();
        temp_env::with_var(MASTER_KEY_ENV_VAR, Some(hex), || {
            let provider = EnvKeyProvider::from_env().unwrap();
            assert_eq!(provider.get_master_key().unwrap(), test_key());
        });

        temp_env::with_var(MASTER_KEY_ENV_VAR, Some("abcd"), || {
            assert!(matches!(EnvKeyProvider::from_env(), Err(Error::Config(_))));
        });
    }
}
