//! DB-compatible (e.g. de/serialisable) types.
//!
//! The types in this module are serialised in an DB-friendly way, e.g.:
//!
//! - datetimes are serialised in MongoDB's own format.
//! - each table of the logical layout is its own collection.

use mongodb::bson::DateTime as BsonDateTime;
use serde::{Deserialize, Serialize};

use crate::model::common::{BallotId, BallotRecord, NewBallotRecord, OptionId, OptionRecord};

/// A ballot, as stored in the `ballots` collection. Options live in their own collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BallotDoc {
    #[serde(rename = "_id")]
    pub id: BallotId,
    pub owner_id: Option<String>,
    pub encrypted_measure: String,
    pub encrypted_dek: String,
    pub kms_key_id: String,
    pub allow_write_in: bool,
    pub start_time: Option<BsonDateTime>,
    pub end_time: Option<BsonDateTime>,
}

impl BallotDoc {
    /// Combine with the ballot's options into a full record.
    pub fn into_record(self, options: Vec<OptionDoc>) -> BallotRecord {
        BallotRecord {
            id: self.id,
            owner_id: self.owner_id,
            encrypted_measure: self.encrypted_measure,
            encrypted_dek: self.encrypted_dek,
            kms_key_id: self.kms_key_id,
            allow_write_in: self.allow_write_in,
            start_time: self.start_time.map(BsonDateTime::to_chrono),
            end_time: self.end_time.map(BsonDateTime::to_chrono),
            options: options.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<&NewBallotRecord> for BallotDoc {
    fn from(new: &NewBallotRecord) -> Self {
        Self {
            id: new.id.clone(),
            owner_id: new.owner_id.clone(),
            encrypted_measure: new.encrypted_measure.clone(),
            encrypted_dek: new.encrypted_dek.clone(),
            kms_key_id: new.kms_key_id.clone(),
            allow_write_in: new.allow_write_in,
            start_time: new.start_time.map(BsonDateTime::from_chrono),
            end_time: new.end_time.map(BsonDateTime::from_chrono),
        }
    }
}

/// An option, as stored in the `options` collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionDoc {
    #[serde(rename = "_id")]
    pub id: OptionId,
    pub ballot_id: BallotId,
    pub encrypted_text: String,
    pub is_write_in: bool,
}

impl From<OptionDoc> for OptionRecord {
    fn from(doc: OptionDoc) -> Self {
        Self {
            id: doc.id,
            ballot_id: doc.ballot_id,
            encrypted_text: doc.encrypted_text,
            is_write_in: doc.is_write_in,
        }
    }
}

/// A single cast vote, as stored in the append-only `votes` collection.
/// The document ID is assigned by the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteDoc {
    pub ballot_id: BallotId,
    pub option_id: OptionId,
}

/// One row of the per-option vote count aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TallyRow {
    #[serde(rename = "_id")]
    pub option_id: OptionId,
    pub count: u64,
}
