//! Credential vault: AES-256-GCM over individual secret fields.
//!
//! Every call to [`Vault::encrypt`] draws a fresh 96-bit nonce from the OS
//! random source. Bundles carry nonce, ciphertext and tag separately so the
//! tag can be checked before any plaintext is released.

pub mod keys;

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Key, Nonce, Tag,
};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use keys::{generate_master_key, MasterKey};

pub const SCHEME_VERSION: u32 = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    #[error("authentication tag did not verify")]
    Integrity,
    #[error("malformed bundle: {0}")]
    MalformedBundle(String),
    #[error("unsupported scheme version {0}")]
    UnsupportedVersion(u32),
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("plaintext is not valid UTF-8")]
    Encoding,
}

/// Persisted form of one encrypted field. Opaque outside the vault.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CredentialBundle {
    pub nonce: String,
    pub ciphertext: String,
    pub tag: String,
    pub version: u32,
}

pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    pub fn new(key: &MasterKey) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        Vault { cipher }
    }

    pub fn from_config_key(raw: &str) -> Self {
        Self::new(&MasterKey::from_config(raw))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<CredentialBundle, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut buffer = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(nonce, b"", &mut buffer)
            .map_err(|_| VaultError::EncryptionFailed)?;

        Ok(CredentialBundle {
            nonce: URL_SAFE.encode(nonce_bytes),
            ciphertext: URL_SAFE.encode(&buffer),
            tag: URL_SAFE.encode(tag),
            version: SCHEME_VERSION,
        })
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<CredentialBundle, VaultError> {
        self.encrypt(plaintext.as_bytes())
    }

    /// Fails with [`VaultError::Integrity`] when the tag does not verify; no
    /// partial plaintext is ever returned.
    pub fn decrypt(&self, bundle: &CredentialBundle) -> Result<Vec<u8>, VaultError> {
        if bundle.version != SCHEME_VERSION {
            return Err(VaultError::UnsupportedVersion(bundle.version));
        }
        let nonce_bytes = decode_field("nonce", &bundle.nonce)?;
        let tag_bytes = decode_field("tag", &bundle.tag)?;
        let mut buffer = decode_field("ciphertext", &bundle.ciphertext)?;

        if nonce_bytes.len() != NONCE_LEN {
            return Err(VaultError::MalformedBundle(format!(
                "nonce must be {} bytes, got {}",
                NONCE_LEN,
                nonce_bytes.len()
            )));
        }
        if tag_bytes.len() != TAG_LEN {
            return Err(VaultError::MalformedBundle(format!(
                "tag must be {} bytes, got {}",
                TAG_LEN,
                tag_bytes.len()
            )));
        }

        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&nonce_bytes),
                b"",
                &mut buffer,
                Tag::from_slice(&tag_bytes),
            )
            .map_err(|_| VaultError::Integrity)?;
        Ok(buffer)
    }

    pub fn decrypt_string(&self, bundle: &CredentialBundle) -> Result<String, VaultError> {
        String::from_utf8(self.decrypt(bundle)?).map_err(|_| VaultError::Encoding)
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, VaultError> {
    URL_SAFE
        .decode(value)
        .map_err(|e| VaultError::MalformedBundle(format!("{}: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> Vault {
        Vault::from_config_key("unit-test-master-key")
    }

    #[test]
    fn test_roundtrip() {
        let vault = vault();
        let cases: [&[u8]; 4] = [b"", b"a", b"session-blob \x00\xff binary", &[42u8; 4096]];
        for plaintext in cases {
            let bundle = vault.encrypt(plaintext).unwrap();
            assert_eq!(vault.decrypt(&bundle).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let vault = vault();
        let a = vault.encrypt(b"same").unwrap();
        let b = vault.encrypt(b"same").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_flipped_tag_byte_is_integrity_error() {
        let vault = vault();
        let mut bundle = vault.encrypt(b"api-hash-value").unwrap();
        let mut tag = URL_SAFE.decode(&bundle.tag).unwrap();
        for i in 0..tag.len() {
            tag[i] ^= 0x01;
            bundle.tag = URL_SAFE.encode(&tag);
            assert_eq!(vault.decrypt(&bundle), Err(VaultError::Integrity));
            tag[i] ^= 0x01;
        }
        bundle.tag = URL_SAFE.encode(&tag);
        assert_eq!(vault.decrypt(&bundle).unwrap(), b"api-hash-value");
    }

    #[test]
    fn test_tampered_ciphertext_is_integrity_error() {
        let vault = vault();
        let mut bundle = vault.encrypt(b"recovery@example.com").unwrap();
        let mut ct = URL_SAFE.decode(&bundle.ciphertext).unwrap();
        ct[0] ^= 0x80;
        bundle.ciphertext = URL_SAFE.encode(&ct);
        assert_eq!(vault.decrypt(&bundle), Err(VaultError::Integrity));
    }

    #[test]
    fn test_wrong_key_is_integrity_error() {
        let bundle = vault().encrypt(b"secret").unwrap();
        let other = Vault::from_config_key("another-key");
        assert_eq!(other.decrypt(&bundle), Err(VaultError::Integrity));
    }

    #[test]
    fn test_malformed_and_versioned_bundles() {
        let vault = vault();
        let mut bundle = vault.encrypt(b"x").unwrap();
        bundle.version = 2;
        assert_eq!(vault.decrypt(&bundle), Err(VaultError::UnsupportedVersion(2)));

        let mut bundle = vault.encrypt(b"x").unwrap();
        bundle.nonce = URL_SAFE.encode([0u8; 8]);
        assert!(matches!(vault.decrypt(&bundle), Err(VaultError::MalformedBundle(_))));

        let mut bundle = vault.encrypt(b"x").unwrap();
        bundle.tag = "***".to_string();
        assert!(matches!(vault.decrypt(&bundle), Err(VaultError::MalformedBundle(_))));
    }
}
