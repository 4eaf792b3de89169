use std::collections::{BTreeMap, HashMap};

use rocket::tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::common::{BallotId, BallotRecord, NewBallotRecord, OptionId, OptionRecord};

use super::BallotRepository;

/// Process-local ballot storage, used when no database is configured.
#[derive(Default)]
pub struct InMemoryBallotRepository {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    ballots: HashMap<BallotId, BallotRecord>,
    /// Ballot IDs in creation order.
    order: Vec<BallotId>,
    /// Append-only vote rows per ballot.
    votes: HashMap<BallotId, Vec<OptionId>>,
    last_option_id: OptionId,
}

impl Inner {
    fn next_option_id(&mut self) -> OptionId {
        self.last_option_id += 1;
        self.last_option_id
    }
}

impl InMemoryBallotRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[rocket::async_trait]
impl BallotRepository for InMemoryBallotRepository {
    async fn list_all(&self) -> Result<Vec<BallotRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.ballots.get(id).cloned())
            .collect())
    }

    async fn get_by_id(&self, ballot_id: &BallotId) -> Result<Option<BallotRecord>> {
        Ok(self.inner.lock().await.ballots.get(ballot_id).cloned())
    }

    async fn create_ballot_record(&self, ballot: NewBallotRecord) -> Result<BallotRecord> {
        let mut inner = self.inner.lock().await;
        if inner.ballots.contains_key(&ballot.id) {
            return Err(Error::Internal(format!("Duplicate ballot ID {}", ballot.id)));
        }

        let mut options = Vec::with_capacity(ballot.encrypted_options.len());
        for encrypted_text in ballot.encrypted_options {
            options.push(OptionRecord {
                id: inner.next_option_id(),
                ballot_id: ballot.id.clone(),
                encrypted_text,
                is_write_in: false,
            });
        }
        let record = BallotRecord {
            id: ballot.id,
            owner_id: ballot.owner_id,
            encrypted_measure: ballot.encrypted_measure,
            encrypted_dek: ballot.encrypted_dek,
            kms_key_id: ballot.kms_key_id,
            allow_write_in: ballot.allow_write_in,
            start_time: ballot.start_time,
            end_time: ballot.end_time,
            options,
        };

        inner.order.push(record.id.clone());
        inner.votes.insert(record.id.clone(), Vec::new());
        inner.ballots.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn add_vote(&self, ballot_id: &BallotId, option_id: OptionId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let known_option = inner
            .ballots
            .get(ballot_id)
            .ok_or_else(|| Error::not_found(format!("Ballot {ballot_id}")))?
            .option(option_id)
            .is_some();
        if !known_option {
            return Err(Error::not_found(format!(
                "Option {option_id} on ballot {ballot_id}"
            )));
        }
        inner
            .votes
            .entry(ballot_id.clone())
            .or_default()
            .push(option_id);
        Ok(())
    }

    async fn add_write_in_option(
        &self,
        ballot_id: &BallotId,
        encrypted_text: String,
    ) -> Result<OptionId> {
        let mut inner = self.inner.lock().await;
        if !inner.ballots.contains_key(ballot_id) {
            return Err(Error::not_found(format!("Ballot {ballot_id}")));
        }
        let option_id = inner.next_option_id();
        let option = OptionRecord {
            id: option_id,
            ballot_id: ballot_id.clone(),
            encrypted_text,
            is_write_in: true,
        };
        if let Some(ballot) = inner.ballots.get_mut(ballot_id) {
            ballot.options.push(option);
        }
        Ok(option_id)
    }

    async fn get_tallies(&self, ballot_id: &BallotId) -> Result<Vec<(OptionId, u64)>> {
        let inner = self.inner.lock().await;
        let mut counts = BTreeMap::new();
        for option_id in inner.votes.get(ballot_id).into_iter().flatten() {
            *counts.entry(*option_id).or_insert(0) += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn delete_ballot(&self, ballot_id: &BallotId) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.votes.remove(ballot_id);
        inner.order.retain(|id| id != ballot_id);
        Ok(inner.ballots.remove(ballot_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_record(options: &[&str]) -> NewBallotRecord {
        NewBallotRecord {
            id: BallotId::generate(),
            owner_id: None,
            encrypted_measure: "measure".to_string(),
            encrypted_dek: "dek".to_string(),
            kms_key_id: "local".to_string(),
            encrypted_options: options.iter().map(|o| o.to_string()).collect(),
            allow_write_in: true,
            start_time: None,
            end_time: None,
        }
    }

    #[rocket::async_test]
    async fn option_ids_are_unique_across_ballots() {
        let repo = InMemoryBallotRepository::new();
        let first = repo.create_ballot_record(new_record(&["a", "b"])).await.unwrap();
        let second = repo.create_ballot_record(new_record(&["c"])).await.unwrap();
        let write_in = repo
            .add_write_in_option(&first.id, "d".to_string())
            .await
            .unwrap();

        let mut ids: Vec<_> = first
            .options
            .iter()
            .chain(second.options.iter())
            .map(|o| o.id)
            .collect();
        ids.push(write_in);
        assert_eq!(ids, vec![1, 2, 3, 4]);

        let reloaded = repo.get_by_id(&first.id).await.unwrap().unwrap();
        assert_eq!(reloaded.options.len(), 3);
        assert!(reloaded.option(write_in).unwrap().is_write_in);
    }

    #[rocket::async_test]
    async fn tallies_aggregate_vote_rows() {
        let repo = InMemoryBallotRepository::new();
        let ballot = repo.create_ballot_record(new_record(&["a", "b"])).await.unwrap();
        let (a, b) = (ballot.options[0].id, ballot.options[1].id);
        for option in [a, b, a, a] {
            repo.add_vote(&ballot.id, option).await.unwrap();
        }
        assert_eq!(repo.get_tallies(&ballot.id).await.unwrap(), vec![(a, 3), (b, 1)]);
    }

    #[rocket::async_test]
    async fn votes_need_a_real_option() {
        let repo = InMemoryBallotRepository::new();
        let ballot = repo.create_ballot_record(new_record(&["a"])).await.unwrap();
        let result = repo.add_vote(&ballot.id, 999).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        let result = repo.add_vote(&BallotId::from("missing"), 1).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[rocket::async_test]
    async fn delete_and_list() {
        let repo = InMemoryBallotRepository::new();
        let first = repo.create_ballot_record(new_record(&["a"])).await.unwrap();
        let second = repo.create_ballot_record(new_record(&["b"])).await.unwrap();

        let listed: Vec<_> = repo.list_all().await.unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(listed, vec![first.id.clone(), second.id.clone()]);

        assert!(repo.delete_ballot(&first.id).await.unwrap());
        assert!(!repo.delete_ballot(&first.id).await.unwrap());
        assert!(repo.get_by_id(&first.id).await.unwrap().is_none());
        assert_eq!(repo.list_all().await.unwrap().len(), 1);
    }
}
