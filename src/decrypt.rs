//! Metadata decryption pipeline
//!
//! A user's master-key list grows over time (key rotation), so older items
//! may be sealed under retired keys. Every candidate key is tried in the
//! given order and the first one that yields parseable, well-typed JSON
//! wins. A failure to decrypt one item excludes that item from the listing —
//! it never aborts the listing of the whole folder.

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::debug;

use crate::crypto::MetadataCipher;
use crate::types::FileMetadata;

/// Run a ciphertext through every key, returning the first plaintext that
/// satisfies `accept`.
fn first_success<T>(
    cipher: &dyn MetadataCipher,
    keys: &[SecretString],
    ciphertext: &str,
    accept: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    for key in keys {
        if let Some(plain) = cipher.try_decrypt(ciphertext, key.expose_secret()) {
            if let Some(value) = accept(&plain) {
                return Some(value);
            }
        }
    }
    None
}

/// Decrypt a file's metadata blob into a typed record.
///
/// Returns `None` when no key opens the blob or the plaintext is not the
/// expected record shape; the caller skips the item.
pub fn decrypt_file_metadata(
    cipher: &dyn MetadataCipher,
    keys: &[SecretString],
    ciphertext: &str,
    uuid: &str,
) -> Option<FileMetadata> {
    let result = first_success(cipher, keys, ciphertext, |plain| {
        let meta: FileMetadata = serde_json::from_str(plain).ok()?;
        if meta.name.is_empty() {
            return None;
        }
        Some(meta)
    });

    if result.is_none() {
        debug!(
            "FAILED decrypt file metadata: uuid={}, encrypted_len={}",
            uuid,
            ciphertext.len()
        );
    }
    result
}

/// Decrypt a folder name.
///
/// Handles both the JSON `{"name":"..."}` wrapping and the legacy raw-string
/// format.
pub fn decrypt_folder_name(
    cipher: &dyn MetadataCipher,
    keys: &[SecretString],
    ciphertext: &str,
    uuid: &str,
) -> Option<String> {
    let result = first_success(cipher, keys, ciphertext, |plain| {
        if let Ok(v) = serde_json::from_str::<Value>(plain) {
            if let Some(name) = v.get("name").and_then(|n| n.as_str()) {
                if name.is_empty() {
                    return None;
                }
                return Some(name.to_string());
            }
        }
        if plain.is_empty() {
            return None;
        }
        Some(plain.to_string())
    });

    if result.is_none() {
        debug!(
            "FAILED decrypt folder name: uuid={}, encrypted_len={}",
            uuid,
            ciphertext.len()
        );
    }
    result
}

/// Decrypt a public link's symmetric key from its master-key-sealed form.
pub fn decrypt_link_key(
    cipher: &dyn MetadataCipher,
    keys: &[SecretString],
    ciphertext: &str,
) -> Option<String> {
    first_success(cipher, keys, ciphertext, |plain| {
        if plain.is_empty() {
            None
        } else {
            Some(plain.to_string())
        }
    })
}
