//! Metadata encryption primitives
//!
//! Metadata (file records, folder names, link keys) is sealed client-side
//! with AES-256-GCM. The wire format is versioned:
//!
//! - `002` (current): `"002" + 12-char ASCII IV + base64(ciphertext||tag)`
//! - `001` (legacy, decrypt only): `001|base64(iv)|base64(ciphertext||tag)`
//!
//! Keys are stretched with PBKDF2-SHA512 (salt = key, 1 iteration, 32 bytes)
//! before use, matching the service's SDK. The engine consumes this module
//! through the [`MetadataCipher`] trait so tests can substitute counters or
//! failing ciphers.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::Sha1;
use sha2::{Digest, Sha512};

use crate::types::SyncError;

/// Contract the engine has with the crypto layer.
///
/// `seal_for_recipient` covers the share fan-out path, where metadata is
/// re-encrypted under each recipient's published key material.
pub trait MetadataCipher: Send + Sync {
    /// Encrypt plaintext metadata under the given key.
    fn encrypt(&self, plain: &str, key: &str) -> Result<String, SyncError>;

    /// Attempt decryption with one key. `None` means this key does not open
    /// this ciphertext — never an error, callers try the next key.
    fn try_decrypt(&self, ciphertext: &str, key: &str) -> Option<String>;

    /// Seal metadata for a share recipient keyed by their published key
    /// material.
    fn seal_for_recipient(&self, plain: &str, recipient_key: &str) -> Result<String, SyncError>;
}

/// Production cipher: AES-256-GCM sealed envelopes in the `002`/`001`
/// formats.
#[derive(Debug, Default, Clone, Copy)]
pub struct SealedCipher;

impl SealedCipher {
    pub fn new() -> Self {
        Self
    }

    /// Stretch a metadata key to a 32-byte AES key:
    /// PBKDF2-SHA512(password=key, salt=key, iterations=1, keylen=32).
    fn derive_aes_key(key: &str) -> [u8; 32] {
        let mut derived = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha512>(key.as_bytes(), key.as_bytes(), 1, &mut derived);
        derived
    }

    /// One random ASCII alphanumeric char, rejection-sampled by `gen_range`.
    fn random_alphanumeric_char() -> char {
        use rand::Rng;
        const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
        let idx = rand::thread_rng().gen_range(0..CHARSET.len());
        CHARSET[idx] as char
    }

    fn seal(plain: &str, key: &str) -> Result<String, SyncError> {
        let aes_key = Self::derive_aes_key(key);
        let cipher = Aes256Gcm::new_from_slice(&aes_key)
            .map_err(|e| SyncError::Crypto(format!("cipher init: {}", e)))?;

        let iv_chars: String = (0..12).map(|_| Self::random_alphanumeric_char()).collect();
        let nonce = Nonce::from_slice(iv_chars.as_bytes());

        let ciphertext = cipher
            .encrypt(nonce, plain.as_bytes())
            .map_err(|e| SyncError::Crypto(format!("encrypt: {}", e)))?;

        Ok(format!("002{}{}", iv_chars, BASE64.encode(ciphertext)))
    }

    fn open(ciphertext: &str, key: &str) -> Option<String> {
        if ciphertext.len() < 16 {
            return None;
        }

        let version = &ciphertext[..3];
        let (nonce_bytes, body) = match version {
            "002" => {
                // 002{12-char-IV}{base64(ciphertext+tag)} — no separators
                let iv_str = ciphertext.get(3..15)?;
                let data_b64 = ciphertext.get(15..)?;
                let ct = BASE64.decode(data_b64).ok()?;
                (iv_str.as_bytes().to_vec(), ct)
            }
            "001" => {
                // 001|iv|ciphertext+tag (pipe-separated, base64)
                let parts: Vec<&str> = ciphertext.splitn(3, '|').collect();
                if parts.len() != 3 {
                    return None;
                }
                let iv = BASE64.decode(parts[1]).ok()?;
                let ct = BASE64.decode(parts[2]).ok()?;
                (iv, ct)
            }
            _ => return None,
        };

        if nonce_bytes.len() != 12 {
            return None;
        }

        let aes_key = Self::derive_aes_key(key);
        let cipher = Aes256Gcm::new_from_slice(&aes_key).ok()?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = cipher.decrypt(nonce, body.as_ref()).ok()?;
        String::from_utf8(plaintext).ok()
    }
}

impl MetadataCipher for SealedCipher {
    fn encrypt(&self, plain: &str, key: &str) -> Result<String, SyncError> {
        Self::seal(plain, key)
    }

    fn try_decrypt(&self, ciphertext: &str, key: &str) -> Option<String> {
        Self::open(ciphertext, key)
    }

    fn seal_for_recipient(&self, plain: &str, recipient_key: &str) -> Result<String, SyncError> {
        Self::seal(plain, recipient_key)
    }
}

/// Hash a file/folder name for the gateway:
/// `SHA-1(hex(SHA-512(name.toLowerCase())))`, hex-encoded.
pub fn hash_name(name: &str) -> String {
    let sha512_hex = hex::encode(Sha512::digest(name.to_lowercase().as_bytes()));
    hex::encode(Sha1::digest(sha512_hex.as_bytes()))
}

/// SHA-512 hex digest of raw content. Used for camera-upload dedup.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha512::digest(data))
}
