use data_encoding::BASE64;
use zeroize::Zeroizing;

use crate::crypto::{aead, dek::DataKey};
use crate::error::{Error, Result};
use crate::model::common::BallotId;

/// Leading byte of a data key wrapped by [`LocalMasterKeyProvider`].
pub const FORMAT_LOCAL: u8 = 0x01;

/// Leading byte of a data key wrapped by the remote KMS provider.
pub const FORMAT_KMS: u8 = 0x02;

/// Key ID reported by the local provider.
pub const LOCAL_KEY_ID: &str = "local";

/// Wraps and unwraps per-ballot data keys under a single master key.
///
/// The wrapped form is bound to the ballot ID, so a wrapped key copied onto
/// another ballot fails to unwrap with [`Error::Authentication`].
#[rocket::async_trait]
pub trait MasterKeyProvider: Send + Sync {
    /// Identifier of the master key, stored alongside every wrapped data key.
    fn key_id(&self) -> &str;

    /// Wrap `dek` for the given ballot.
    async fn encrypt_dek(&self, dek: &DataKey, ballot_id: &BallotId) -> Result<String>;

    /// Unwrap a data key previously produced by [`MasterKeyProvider::encrypt_dek`].
    async fn decrypt_dek(&self, wrapped: &str, ballot_id: &BallotId) -> Result<DataKey>;
}

/// Decode a wrapped key and strip its format tag, checking that it matches.
pub(crate) fn untag(wrapped: &str, expected: u8) -> Result<Vec<u8>> {
    let mut bytes = BASE64
        .decode(wrapped.as_bytes())
        .map_err(|_| Error::authentication("Wrapped data key is not valid base64"))?;
    match bytes.first() {
        Some(tag) if *tag == expected => {
            bytes.remove(0);
            Ok(bytes)
        }
        Some(tag) => Err(Error::authentication(format!(
            "Unexpected wrapped key format {tag:#04x}"
        ))),
        None => Err(Error::authentication("Empty wrapped data key")),
    }
}

/// Prefix `payload` with a format tag and encode it.
pub(crate) fn tag(format: u8, payload: &[u8]) -> String {
    let mut bytes = Vec::with_capacity(payload.len() + 1);
    bytes.push(format);
    bytes.extend_from_slice(payload);
    BASE64.encode(&bytes)
}

/// Master key held in process memory.
pub struct LocalMasterKeyProvider {
    kek: Zeroizing<[u8; 32]>,
}

impl LocalMasterKeyProvider {
    pub fn new(kek: [u8; 32]) -> Self {
        Self {
            kek: Zeroizing::new(kek),
        }
    }

    /// Load a master key from its base64 encoding.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            BASE64
                .decode(encoded.trim().as_bytes())
                .map_err(|e| Error::BadRequest(format!("Master key is not valid base64: {e}")))?,
        );
        let kek: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            Error::BadRequest(format!("Master key must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self::new(kek))
    }

    /// Generate a throwaway master key. Anything wrapped by it is lost on restart.
    pub fn generate() -> Self {
        Self::new(*DataKey::generate().as_bytes())
    }
}

#[rocket::async_trait]
impl MasterKeyProvider for LocalMasterKeyProvider {
    fn key_id(&self) -> &str {
        LOCAL_KEY_ID
    }

    async fn encrypt_dek(&self, dek: &DataKey, ballot_id: &BallotId) -> Result<String> {
        let plaintext = Zeroizing::new(dek.serialize());
        let sealed = aead::seal(&self.kek, &plaintext, ballot_id.as_str().as_bytes())?;
        Ok(tag(FORMAT_LOCAL, &sealed))
    }

    async fn decrypt_dek(&self, wrapped: &str, ballot_id: &BallotId) -> Result<DataKey> {
        let sealed = untag(wrapped, FORMAT_LOCAL)?;
        let plaintext = Zeroizing::new(aead::open(
            &self.kek,
            &sealed,
            ballot_id.as_str().as_bytes(),
        )?);
        DataKey::deserialize(&plaintext)
    }
}
