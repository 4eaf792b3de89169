use mongodb::{
    bson::doc,
    error::Error as DbError,
    options::{FindOneAndUpdateOptions, ReturnDocument, UpdateOptions},
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::mongodb::Coll;

/// ID of the counter that hands out option IDs.
pub const OPTION_ID_COUNTER_ID: &str = "option_id";

/// A counter object used to implement auto-increment fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Counter {
    #[serde(rename = "_id")]
    pub id: String,
    pub next: u64,
}

impl Counter {
    /// Atomically retrieve the next value of the counter with the given ID.
    pub async fn next(counters: &Coll<Counter>, id: &str) -> Result<u64> {
        let update = doc! {
            "$inc": { "next": 1 }
        };
        let options: FindOneAndUpdateOptions = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::Before)
            .build();
        let counter = counters
            .find_one_and_update(doc! { "_id": id }, update, options)
            .await?
            .ok_or_else(|| Error::Internal(format!("Failed to find counter with ID {id}")))?;
        Ok(counter.next)
    }
}

/// Ensure the option ID counter exists, without resetting it if it does.
///
/// This operation is idempotent.
pub async fn ensure_option_id_counter_exists(
    counters: &Coll<Counter>,
) -> std::result::Result<(), DbError> {
    let filter = doc! { "_id": OPTION_ID_COUNTER_ID };
    let update = doc! { "$setOnInsert": { "next": 1_i64 } };
    let options = UpdateOptions::builder().upsert(true).build();
    counters.update_one(filter, update, options).await?;
    Ok(())
}
