//! Ballot persistence. Everything passed through this layer is already encrypted.

use crate::error::Result;
use crate::model::common::{BallotId, BallotRecord, NewBallotRecord, OptionId};

mod memory;
mod mongo;

pub use memory::InMemoryBallotRepository;
pub use mongo::MongoBallotRepository;

/// Storage for ballots, their options, and the votes cast on them.
#[rocket::async_trait]
pub trait BallotRepository: Send + Sync {
    /// Retrieve all ballots.
    async fn list_all(&self) -> Result<Vec<BallotRecord>>;

    /// Retrieve a single ballot with its options, if it exists.
    async fn get_by_id(&self, ballot_id: &BallotId) -> Result<Option<BallotRecord>>;

    /// Persist a new ballot and its predefined options, returning the stored record.
    async fn create_ballot_record(&self, ballot: NewBallotRecord) -> Result<BallotRecord>;

    /// Append one vote for the given option.
    async fn add_vote(&self, ballot_id: &BallotId, option_id: OptionId) -> Result<()>;

    /// Persist a new write-in option, returning its freshly assigned ID.
    async fn add_write_in_option(&self, ballot_id: &BallotId, encrypted_text: String)
        -> Result<OptionId>;

    /// Count votes per option. Options without votes may be omitted.
    async fn get_tallies(&self, ballot_id: &BallotId) -> Result<Vec<(OptionId, u64)>>;

    /// Delete a ballot along with its options and votes.
    /// Returns false if there was no such ballot.
    async fn delete_ballot(&self, ballot_id: &BallotId) -> Result<bool>;
}
