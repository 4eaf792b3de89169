//! Envelope encryption for ballot content.
//!
//! Every ballot gets its own data key (DEK). User content is encrypted under
//! the DEK, and the DEK is stored wrapped by the master key. Unwrapped DEKs
//! are cached in two tiers: per process, and in the shared store.

use std::sync::Arc;

use data_encoding::BASE64;

use crate::error::{Error, Result};
use crate::model::common::BallotId;
use crate::shared::SharedStore;

mod aead;
mod cache;
mod dek;
#[cfg(feature = "kms")]
mod kms;
mod pool;
mod provider;

pub use cache::{LocalKeyCache, SharedKeyCache, LOCAL_TTL, SHARED_TTL};
pub use dek::DataKey;
#[cfg(feature = "kms")]
pub use kms::KmsMasterKeyProvider;
pub use pool::CryptoPool;
pub use provider::{LocalMasterKeyProvider, MasterKeyProvider, LOCAL_KEY_ID};

/// Associated data for encrypted measure text.
pub const MEASURE_CONTEXT: &str = "measure";

/// Associated data for encrypted option text.
pub const OPTION_CONTEXT: &str = "option";

pub struct CryptoService {
    provider: Arc<dyn MasterKeyProvider>,
    local: LocalKeyCache,
    shared: Option<SharedKeyCache>,
    pool: CryptoPool,
}

impl CryptoService {
    /// Create a crypto service. Without a shared store only the in-process tier is used.
    pub fn new(
        provider: Arc<dyn MasterKeyProvider>,
        shared: Option<Arc<dyn SharedStore>>,
        pool: CryptoPool,
    ) -> Self {
        Self {
            provider,
            local: LocalKeyCache::default(),
            shared: shared.map(SharedKeyCache::new),
            pool,
        }
    }

    /// ID of the master key new ballots are wrapped with.
    pub fn key_id(&self) -> &str {
        self.provider.key_id()
    }

    /// Generate a fresh DEK for a new ballot. Nothing is cached.
    pub fn generate_ballot_keyset(&self) -> DataKey {
        DataKey::generate()
    }

    pub async fn encrypt_ballot_keyset(
        &self,
        dek: &DataKey,
        ballot_id: &BallotId,
    ) -> Result<String> {
        self.provider.encrypt_dek(dek, ballot_id).await
    }

    pub async fn decrypt_ballot_keyset(
        &self,
        wrapped: &str,
        ballot_id: &BallotId,
    ) -> Result<DataKey> {
        self.provider.decrypt_dek(wrapped, ballot_id).await
    }

    /// Get the unwrapped DEK for a ballot, going to the master key only when
    /// neither cache tier has it.
    ///
    /// `encrypted_dek` is needed only on a full cache miss; without it a miss
    /// is [`Error::NotFound`].
    pub async fn get_ballot_keyset(
        &self,
        ballot_id: &BallotId,
        encrypted_dek: Option<&str>,
    ) -> Result<Arc<DataKey>> {
        if let Some(dek) = self.local.get(ballot_id) {
            trace!("Data key for ballot {ballot_id} found in local cache");
            return Ok(dek);
        }

        if let Some(shared) = &self.shared {
            match shared.get(ballot_id).await {
                Ok(Some(dek)) => {
                    trace!("Data key for ballot {ballot_id} found in shared cache");
                    let dek = Arc::new(dek);
                    self.local.put(ballot_id, dek.clone());
                    return Ok(dek);
                }
                Ok(None) => {}
                Err(e) => warn!("Shared key cache unavailable for ballot {ballot_id}: {e}"),
            }
        }

        let wrapped = encrypted_dek
            .ok_or_else(|| Error::not_found(format!("Data key for ballot {ballot_id}")))?;
        debug!("Unwrapping data key for ballot {ballot_id}");
        let dek = Arc::new(self.provider.decrypt_dek(wrapped, ballot_id).await?);

        self.local.put(ballot_id, dek.clone());
        if let Some(shared) = &self.shared {
            if let Err(e) = shared.put(ballot_id, &dek).await {
                warn!("Failed to share data key for ballot {ballot_id}: {e}");
            }
        }
        Ok(dek)
    }

    /// Drop a ballot's DEK from both cache tiers.
    pub async fn evict(&self, ballot_id: &BallotId) {
        self.local.evict(ballot_id);
        if let Some(shared) = &self.shared {
            if let Err(e) = shared.evict(ballot_id).await {
                warn!("Failed to evict shared data key for ballot {ballot_id}: {e}");
            }
        }
    }

    /// Forget every key cached in this process.
    pub fn reset(&self) {
        self.local.clear();
    }

    pub fn encrypt_string(plaintext: &str, dek: &DataKey, context: &str) -> Result<String> {
        let sealed = aead::seal(dek.as_bytes(), plaintext.as_bytes(), context.as_bytes())?;
        Ok(BASE64.encode(&sealed))
    }

    /// Decrypt a field. A context other than the one it was encrypted with
    /// is an authentication failure.
    pub fn decrypt_string(ciphertext: &str, dek: &DataKey, context: &str) -> Result<String> {
        let sealed = BASE64
            .decode(ciphertext.as_bytes())
            .map_err(|_| Error::authentication("Ciphertext is not valid base64"))?;
        let plaintext = aead::open(dek.as_bytes(), &sealed, context.as_bytes())?;
        String::from_utf8(plaintext)
            .map_err(|_| Error::authentication("Decrypted text is not valid UTF-8"))
    }

    /// Encrypt many fields on the crypto pool.
    pub async fn encrypt_strings(
        &self,
        plaintexts: Vec<String>,
        dek: Arc<DataKey>,
        context: &'static str,
    ) -> Result<Vec<String>> {
        self.pool
            .run(move || {
                plaintexts
                    .iter()
                    .map(|p| Self::encrypt_string(p, &dek, context))
                    .collect()
            })
            .await
    }

    /// Decrypt many fields on the crypto pool.
    pub async fn decrypt_strings(
        &self,
        ciphertexts: Vec<String>,
        dek: Arc<DataKey>,
        context: &'static str,
    ) -> Result<Vec<String>> {
        self.pool
            .run(move || {
                ciphertexts
                    .iter()
                    .map(|c| Self::decrypt_string(c, &dek, context))
                    .collect()
            })
            .await
    }
}
