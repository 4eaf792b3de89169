use std::collections::HashMap;

use mongodb::{
    bson::{self, doc},
    options::FindOptions,
    Client, Database,
};
use rocket::futures::TryStreamExt;

use crate::error::{Error, Result};
use crate::model::{
    common::{BallotId, BallotRecord, NewBallotRecord, OptionId},
    db::{BallotDoc, OptionDoc, TallyRow, VoteDoc},
    mongodb::{Coll, Counter, OPTION_ID_COUNTER_ID},
};

use super::BallotRepository;

/// Durable ballot storage in MongoDB.
///
/// Ballot creation runs in a transaction, so the deployment must be a replica set.
#[derive(Clone)]
pub struct MongoBallotRepository {
    client: Client,
    ballots: Coll<BallotDoc>,
    options: Coll<OptionDoc>,
    votes: Coll<VoteDoc>,
    counters: Coll<Counter>,
}

impl MongoBallotRepository {
    pub fn new(client: Client, db: &Database) -> Self {
        Self {
            client,
            ballots: Coll::from_db(db),
            options: Coll::from_db(db),
            votes: Coll::from_db(db),
            counters: Coll::from_db(db),
        }
    }

    fn options_in_order() -> FindOptions {
        FindOptions::builder().sort(doc! {"_id": 1}).build()
    }

    async fn options_for(&self, ballot_id: &BallotId) -> Result<Vec<OptionDoc>> {
        let filter = doc! { "ballot_id": ballot_id.as_str() };
        Ok(self
            .options
            .find(filter, Self::options_in_order())
            .await?
            .try_collect()
            .await?)
    }
}

#[rocket::async_trait]
impl BallotRepository for MongoBallotRepository {
    async fn list_all(&self) -> Result<Vec<BallotRecord>> {
        let ballots: Vec<BallotDoc> = self.ballots.find(None, None).await?.try_collect().await?;

        // Fetch all options in one go and group them by ballot.
        let all_options: Vec<OptionDoc> = self
            .options
            .find(None, Self::options_in_order())
            .await?
            .try_collect()
            .await?;
        let mut options_by_ballot: HashMap<BallotId, Vec<OptionDoc>> = HashMap::new();
        for option in all_options {
            options_by_ballot
                .entry(option.ballot_id.clone())
                .or_default()
                .push(option);
        }

        Ok(ballots
            .into_iter()
            .map(|ballot| {
                let options = options_by_ballot.remove(&ballot.id).unwrap_or_default();
                ballot.into_record(options)
            })
            .collect())
    }

    async fn get_by_id(&self, ballot_id: &BallotId) -> Result<Option<BallotRecord>> {
        let ballot = self
            .ballots
            .find_one(doc! { "_id": ballot_id.as_str() }, None)
            .await?;
        match ballot {
            Some(ballot) => {
                let options = self.options_for(ballot_id).await?;
                Ok(Some(ballot.into_record(options)))
            }
            None => Ok(None),
        }
    }

    async fn create_ballot_record(&self, ballot: NewBallotRecord) -> Result<BallotRecord> {
        // Allocate option IDs up front; gaps from a failed transaction are harmless.
        let mut options = Vec::with_capacity(ballot.encrypted_options.len());
        for encrypted_text in &ballot.encrypted_options {
            options.push(OptionDoc {
                id: Counter::next(&self.counters, OPTION_ID_COUNTER_ID).await?,
                ballot_id: ballot.id.clone(),
                encrypted_text: encrypted_text.clone(),
                is_write_in: false,
            });
        }
        let ballot_doc = BallotDoc::from(&ballot);

        {
            let mut session = self.client.start_session(None).await?;
            session.start_transaction(None).await?;
            self.ballots
                .insert_one_with_session(&ballot_doc, None, &mut session)
                .await?;
            if !options.is_empty() {
                self.options
                    .insert_many_with_session(&options, None, &mut session)
                    .await?;
            }
            session.commit_transaction().await?;
        }

        Ok(ballot_doc.into_record(options))
    }

    async fn add_vote(&self, ballot_id: &BallotId, option_id: OptionId) -> Result<()> {
        let vote = VoteDoc {
            ballot_id: ballot_id.clone(),
            option_id,
        };
        self.votes.insert_one(vote, None).await?;
        Ok(())
    }

    async fn add_write_in_option(
        &self,
        ballot_id: &BallotId,
        encrypted_text: String,
    ) -> Result<OptionId> {
        let option = OptionDoc {
            id: Counter::next(&self.counters, OPTION_ID_COUNTER_ID).await?,
            ballot_id: ballot_id.clone(),
            encrypted_text,
            is_write_in: true,
        };
        self.options.insert_one(&option, None).await?;
        Ok(option.id)
    }

    async fn get_tallies(&self, ballot_id: &BallotId) -> Result<Vec<(OptionId, u64)>> {
        let pipeline = vec![
            doc! { "$match": { "ballot_id": ballot_id.as_str() } },
            doc! { "$group": { "_id": "$option_id", "count": { "$sum": 1_i64 } } },
            doc! { "$sort": { "_id": 1 } },
        ];
        let rows: Vec<bson::Document> = self
            .votes
            .aggregate(pipeline, None)
            .await?
            .try_collect()
            .await?;
        rows.into_iter()
            .map(|row| {
                bson::from_document::<TallyRow>(row)
                    .map(|row| (row.option_id, row.count))
                    .map_err(|e| Error::Internal(format!("Malformed tally row: {e}")))
            })
            .collect()
    }

    async fn delete_ballot(&self, ballot_id: &BallotId) -> Result<bool> {
        let filter = doc! { "ballot_id": ballot_id.as_str() };
        let deleted = self
            .ballots
            .delete_one(doc! { "_id": ballot_id.as_str() }, None)
            .await?
            .deleted_count;
        // Children go even if the parent had already vanished.
        self.options.delete_many(filter.clone(), None).await?;
        self.votes.delete_many(filter, None).await?;
        Ok(deleted == 1)
    }
}
