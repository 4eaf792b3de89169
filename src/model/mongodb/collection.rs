use std::ops::Deref;

use mongodb::{
    bson::doc, error::Error as DbError, options::IndexOptions, Collection, Database, IndexModel,
};

use crate::model::db::{BallotDoc, OptionDoc, VoteDoc};

use super::counter::Counter;

/// A type that can be directly inserted/read to/from the database.
pub trait MongoCollection {
    /// The name of the collection.
    const NAME: &'static str;
}

/// A database collection of the given type.
pub struct Coll<T>(Collection<T>);

impl<T> Coll<T>
where
    T: MongoCollection,
{
    /// Get a handle on this collection in the given database.
    pub fn from_db(db: &Database) -> Self {
        Self(db.collection(T::NAME))
    }
}

// `Derive(Clone)` would only derive if `T: Clone`, but we don't need that bound.
impl<T> Clone for Coll<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Deref for Coll<T> {
    type Target = Collection<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl MongoCollection for BallotDoc {
    const NAME: &'static str = "ballots";
}

impl MongoCollection for OptionDoc {
    const NAME: &'static str = "options";
}

impl MongoCollection for VoteDoc {
    const NAME: &'static str = "votes";
}

impl MongoCollection for Counter {
    const NAME: &'static str = "counters";
}

/// Ensure that all the required indexes exist on the given database.
///
/// This operation is idempotent.
pub async fn ensure_indexes_exist(db: &Database) -> Result<(), DbError> {
    debug!("Ensuring collection indexes exist");

    // Options are always loaded per ballot, in ID order.
    let option_index = IndexModel::builder()
        .keys(doc! {"ballot_id": 1, "_id": 1})
        .options(IndexOptions::builder().build())
        .build();
    Coll::<OptionDoc>::from_db(db)
        .create_index(option_index, None)
        .await?;

    // Votes are aggregated per ballot and option.
    let vote_index = IndexModel::builder()
        .keys(doc! {"ballot_id": 1, "option_id": 1})
        .options(IndexOptions::builder().build())
        .build();
    Coll::<VoteDoc>::from_db(db)
        .create_index(vote_index, None)
        .await?;

    Ok(())
}
