//! Per-file key material
//!
//! Every stored blob gets its own random 256-bit key and 128-bit IV. The
//! material lives in the file record as hex and is only materialized here
//! for the duration of a single cipher operation.

use crate::crypto::{IV_SIZE, KEY_SIZE};
use crate::error::{Error, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Symmetric key and IV for one encrypted blob
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    key: [u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
}

impl KeyMaterial {
    /// Generate fresh key material from the OS CSPRNG
    pub fn generate() -> Result<Self> {
        let mut material = KeyMaterial {
            key: [0u8; KEY_SIZE],
            iv: [0u8; IV_SIZE],
        };

        OsRng
            .try_fill_bytes(&mut material.key)
            .map_err(|e| Error::Entropy(e.to_string()))?;
        OsRng
            .try_fill_bytes(&mut material.iv)
            .map_err(|e| Error::Entropy(e.to_string()))?;

        Ok(material)
    }

    /// Parse key material stored as hex in a file record
    pub fn from_hex(key_hex: &str, iv_hex: &str) -> Result<Self> {
        let mut material = KeyMaterial {
            key: [0u8; KEY_SIZE],
            iv: [0u8; IV_SIZE],
        };
        decode_into(key_hex, &mut material.key, "encryption key")?;
        decode_into(iv_hex, &mut material.iv, "iv")?;
        Ok(material)
    }

    /// Get the raw key bytes
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Get the raw IV bytes
    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    pub fn key_hex(&self) -> String {
        hex::encode(self.key)
    }

    pub fn iv_hex(&self) -> String {
        hex::encode(self.iv)
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key", &"<redacted>")
            .field("iv", &"<redacted>")
            .finish()
    }
}

fn decode_into(input: &str, out: &mut [u8], what: &str) -> Result<()> {
    let mut bytes = hex::decode(input.trim())
        .map_err(|e| Error::Validation(format!("malformed {} hex: {}", what, e)))?;

    if bytes.len() != out.len() {
        let got = bytes.len();
        bytes.zeroize();
        return Err(Error::Validation(format!(
            "invalid {} length: expected {} bytes, got {}",
            what,
            out.len(),
            got
        )));
    }

    out.copy_from_slice(&bytes);
    bytes.zeroize();
    Ok(())
}
