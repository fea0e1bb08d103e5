use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// 256-bit AES key derived from the configured master key.
///
/// A configured key of exactly 32 bytes is used as-is; any other length is
/// normalized through SHA-256. The bytes never leave the vault module.
pub struct MasterKey {
    bytes: [u8; 32],
}

impl MasterKey {
    pub fn from_config(raw: &str) -> Self {
        Self::from_bytes(raw.as_bytes())
    }

    pub fn from_bytes(raw: &[u8]) -> Self {
        let mut bytes = [0u8; 32];
        if raw.len() == 32 {
            bytes.copy_from_slice(raw);
        } else {
            bytes.copy_from_slice(&Sha256::digest(raw));
        }
        MasterKey { bytes }
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Generate a fresh master key: 32 random bytes, URL-safe base64.
pub fn generate_master_key() -> String {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    URL_SAFE.encode(key)
}
