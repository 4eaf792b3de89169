//! Types shared between the persistence layer, the core services and the API.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use data_encoding::BASE64URL_NOPAD;
use rand::RngCore;
use rocket::request::FromParam;
use serde::{Deserialize, Serialize};

/// Number of random bytes in a freshly generated ballot ID.
const BALLOT_ID_BYTES: usize = 16;

/// Longest ballot ID we will accept from the outside world.
const MAX_BALLOT_ID_LEN: usize = 64;

/// Integer identifier of a ballot option, unique across the whole store.
pub type OptionId = u64;

/// Opaque random token identifying a ballot.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, UriDisplayPath,
)]
#[serde(transparent)]
pub struct BallotId(String);

impl BallotId {
    /// Generate a fresh random ID.
    pub fn generate() -> Self {
        let mut bytes = [0u8; BALLOT_ID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(BASE64URL_NOPAD.encode(&bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of the distributed lock guarding this ballot's vote path.
    pub fn lock_key(&self) -> String {
        format!("lock:ballot:{}", self.0)
    }

    /// Pub/sub channel carrying this ballot's tally updates.
    pub fn updates_channel(&self) -> String {
        format!("ballot:{}:updates", self.0)
    }

    /// Shared-cache key holding this ballot's decrypted data key.
    pub fn dek_cache_key(&self) -> String {
        format!("dek:ballot:{}", self.0)
    }
}

impl Display for BallotId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BallotId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl<'a> FromParam<'a> for BallotId {
    type Error = &'a str;

    fn from_param(param: &'a str) -> Result<Self, Self::Error> {
        let valid = !param.is_empty()
            && param.len() <= MAX_BALLOT_ID_LEN
            && param
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if valid {
            Ok(Self(param.to_string()))
        } else {
            Err(param)
        }
    }
}

/// A ballot as held by the persistence layer: all user content is encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BallotRecord {
    pub id: BallotId,
    pub owner_id: Option<String>,
    /// Measure text, encrypted under the ballot's data key.
    pub encrypted_measure: String,
    /// The ballot's data key, wrapped by the master key.
    pub encrypted_dek: String,
    /// Identifier of the master key that wrapped `encrypted_dek`.
    pub kms_key_id: String,
    pub allow_write_in: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Options in ascending ID order.
    pub options: Vec<OptionRecord>,
}

impl BallotRecord {
    pub fn option(&self, option_id: OptionId) -> Option<&OptionRecord> {
        self.options.iter().find(|option| option.id == option_id)
    }
}

/// A single option on a ballot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionRecord {
    pub id: OptionId,
    pub ballot_id: BallotId,
    /// Option text, encrypted under the ballot's data key.
    pub encrypted_text: String,
    pub is_write_in: bool,
}

/// Everything needed to persist a new ballot.
#[derive(Debug, Clone)]
pub struct NewBallotRecord {
    pub id: BallotId,
    pub owner_id: Option<String>,
    pub encrypted_measure: String,
    pub encrypted_dek: String,
    pub kms_key_id: String,
    /// Encrypted texts of the predefined options, in display order.
    pub encrypted_options: Vec<String>,
    pub allow_write_in: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_url_safe_and_unique() {
        let a = BallotId::generate();
        let b = BallotId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 22);
        assert!(BallotId::from_param(a.as_str()).is_ok());
    }

    #[test]
    fn from_param_rejects_junk() {
        assert!(BallotId::from_param("").is_err());
        assert!(BallotId::from_param("../etc").is_err());
        assert!(BallotId::from_param(&"a".repeat(65)).is_err());
        assert!(BallotId::from_param("abc-DEF_123").is_ok());
    }

    #[test]
    fn derived_keys() {
        let id = BallotId::from("xyz");
        assert_eq!(id.lock_key(), "lock:ballot:xyz");
        assert_eq!(id.updates_channel(), "ballot:xyz:updates");
        assert_eq!(id.dek_cache_key(), "dek:ballot:xyz");
    }
}
