use aws_sdk_kms::{
    error::{DisplayErrorContext, SdkError},
    primitives::Blob,
    Client as KmsClient,
};
use zeroize::Zeroizing;

use crate::crypto::{
    dek::DataKey,
    provider::{tag, untag, MasterKeyProvider, FORMAT_KMS},
};
use crate::error::{Error, Result};
use crate::model::common::BallotId;

/// Name of the encryption context entry binding a wrapped key to its ballot.
const BALLOT_CONTEXT_KEY: &str = "ballot_id";

/// Master key held by AWS KMS. Key material never leaves the service.
pub struct KmsMasterKeyProvider {
    client: KmsClient,
    key_id: String,
}

impl KmsMasterKeyProvider {
    pub fn new(client: KmsClient, key_id: impl Into<String>) -> Self {
        Self {
            client,
            key_id: key_id.into(),
        }
    }
}

/// Classify a KMS failure: a ciphertext the service refuses is an integrity
/// failure, anything else means KMS could not be used right now.
fn kms_error<E, R>(err: SdkError<E, R>, is_rejection: impl FnOnce(&E) -> bool) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    match err.as_service_error() {
        Some(service_err) if is_rejection(service_err) => {
            Error::authentication(format!("KMS rejected ciphertext: {service_err}"))
        }
        _ => Error::ServiceUnavailable(format!("KMS: {}", DisplayErrorContext(&err))),
    }
}

#[rocket::async_trait]
impl MasterKeyProvider for KmsMasterKeyProvider {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    async fn encrypt_dek(&self, dek: &DataKey, ballot_id: &BallotId) -> Result<String> {
        let output = self
            .client
            .encrypt()
            .key_id(&self.key_id)
            .plaintext(Blob::new(dek.serialize()))
            .encryption_context(BALLOT_CONTEXT_KEY, ballot_id.as_str())
            .send()
            .await
            .map_err(|e| kms_error(e, |_| false))?;
        let blob = output
            .ciphertext_blob()
            .ok_or_else(|| Error::ServiceUnavailable("KMS returned no ciphertext".to_string()))?;
        Ok(tag(FORMAT_KMS, blob.as_ref()))
    }

    async fn decrypt_dek(&self, wrapped: &str, ballot_id: &BallotId) -> Result<DataKey> {
        let blob = untag(wrapped, FORMAT_KMS)?;
        if blob.is_empty() {
            return Err(Error::authentication("Truncated KMS ciphertext"));
        }
        let output = self
            .client
            .decrypt()
            .key_id(&self.key_id)
            .ciphertext_blob(Blob::new(blob))
            .encryption_context(BALLOT_CONTEXT_KEY, ballot_id.as_str())
            .send()
            .await
            .map_err(|e| {
                kms_error(e, |e| {
                    e.is_invalid_ciphertext_exception() || e.is_incorrect_key_exception()
                })
            })?;
        let plaintext = output
            .plaintext
            .map(|blob| Zeroizing::new(blob.into_inner()))
            .ok_or_else(|| Error::ServiceUnavailable("KMS returned no plaintext".to_string()))?;
        DataKey::deserialize(&plaintext)
    }
}

#[cfg(test)]
mod tests {
    use aws_sdk_kms::{config::http::HttpResponse, operation::decrypt::DecryptError};

    use super::*;

    type DecryptSdkError = SdkError<DecryptError, HttpResponse>;

    #[test]
    fn unreachable_kms_is_unavailable() {
        let failures: [DecryptSdkError; 2] = [
            SdkError::construction_failure("request could not be built"),
            SdkError::timeout_error("request timed out"),
        ];
        for failure in failures {
            // Only a service response can reject a ciphertext.
            let err = kms_error(failure, |_| true);
            assert!(matches!(err, Error::ServiceUnavailable(_)), "{err}");
        }
    }
}
