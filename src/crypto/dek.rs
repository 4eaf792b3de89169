use std::fmt::{Debug, Formatter};

use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Length of a data key in bytes.
pub const DEK_LEN: usize = 32;

/// Version byte of the serialized key format.
const FORMAT_VERSION: u8 = 1;

/// Algorithm byte for ChaCha20-Poly1305.
const ALG_CHACHA20_POLY1305: u8 = 1;

/// A per-ballot data encryption key. Wiped from memory when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DataKey([u8; DEK_LEN]);

impl DataKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; DEK_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; DEK_LEN] {
        &self.0
    }

    /// Serialize into the tagged `[version, algorithm, key...]` format.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DEK_LEN + 2);
        out.push(FORMAT_VERSION);
        out.push(ALG_CHACHA20_POLY1305);
        out.extend_from_slice(&self.0);
        out
    }

    /// Parse the tagged format produced by [`DataKey::serialize`].
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        match bytes {
            [FORMAT_VERSION, ALG_CHACHA20_POLY1305, key @ ..] if key.len() == DEK_LEN => {
                let mut out = [0u8; DEK_LEN];
                out.copy_from_slice(key);
                Ok(Self(out))
            }
            [version, alg, ..] => Err(Error::authentication(format!(
                "Unsupported data key format (version {version}, algorithm {alg}, {} bytes)",
                bytes.len()
            ))),
            _ => Err(Error::authentication("Truncated data key")),
        }
    }
}

// Never print key material.
impl Debug for DataKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("DataKey(..)")
    }
}
