//! The ballot service: everything the API does goes through here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rocket::{futures::StreamExt, serde::json::serde_json, tokio};

use crate::crypto::{CryptoService, MEASURE_CONTEXT, OPTION_CONTEXT};
use crate::error::{Error, Result};
use crate::lock::{BallotLocks, DistributedLocks, LocalLocks};
use crate::model::{
    api::{Ballot, BallotOption, BallotSpec, BallotStatus, Tally, Vote, MAX_OPTION_LEN},
    common::{BallotId, BallotRecord, NewBallotRecord, OptionId},
};
use crate::repository::BallotRepository;
use crate::shared::{SharedStore, Subscription};
use crate::state::{BallotStateManager, SubscriberId, TallyReceiver};

/// Creates ballots, records votes, and fans out live results.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct BallotService {
    repo: Arc<dyn BallotRepository>,
    crypto: Arc<CryptoService>,
    state: Arc<BallotStateManager>,
    locks: Arc<dyn BallotLocks>,
    store: Option<Arc<dyn SharedStore>>,
}

impl BallotService {
    /// Assemble the service. With a shared store, ballot locks and live
    /// results span every worker using that store; without one they are
    /// local to this process.
    pub fn new(
        repo: Arc<dyn BallotRepository>,
        crypto: Arc<CryptoService>,
        store: Option<Arc<dyn SharedStore>>,
        lock_lease: Duration,
        lock_wait: Duration,
    ) -> Self {
        let state = Arc::new(BallotStateManager::new());
        let locks: Arc<dyn BallotLocks> = match &store {
            Some(store) => Arc::new(DistributedLocks::new(store.clone(), lock_lease, lock_wait)),
            None => Arc::new(LocalLocks::new(state.clone())),
        };
        Self {
            repo,
            crypto,
            state,
            locks,
            store,
        }
    }

    pub fn state(&self) -> &BallotStateManager {
        &self.state
    }

    pub fn crypto(&self) -> &CryptoService {
        &self.crypto
    }

    /// Whether locks and live results span every worker sharing the store.
    pub fn is_distributed(&self) -> bool {
        self.store.is_some()
    }

    /// Validate and persist a new ballot, with all its text encrypted under a fresh data key.
    pub async fn create_ballot(
        &self,
        spec: BallotSpec,
        owner_id: Option<String>,
    ) -> Result<Ballot> {
        let spec = spec.validated()?;
        let ballot_id = BallotId::generate();

        let dek = Arc::new(self.crypto.generate_ballot_keyset());
        let encrypted_dek = self.crypto.encrypt_ballot_keyset(&dek, &ballot_id).await?;
        let encrypted_measure =
            CryptoService::encrypt_string(&spec.measure, &dek, MEASURE_CONTEXT)?;
        let encrypted_options = self
            .crypto
            .encrypt_strings(spec.options, dek, OPTION_CONTEXT)
            .await?;

        let record = self
            .repo
            .create_ballot_record(NewBallotRecord {
                id: ballot_id,
                owner_id,
                encrypted_measure,
                encrypted_dek,
                kms_key_id: self.crypto.key_id().to_string(),
                encrypted_options,
                allow_write_in: spec.allow_write_in,
                start_time: spec.start_time,
                end_time: spec.end_time,
            })
            .await?;
        info!("Created ballot {}", record.id);
        self.open(&record).await
    }

    pub async fn list_ballots(&self) -> Result<Vec<Ballot>> {
        let records = self.repo.list_all().await?;
        let mut ballots = Vec::with_capacity(records.len());
        for record in &records {
            ballots.push(self.open(record).await?);
        }
        Ok(ballots)
    }

    pub async fn get_ballot(&self, ballot_id: &BallotId) -> Result<Ballot> {
        let record = self.fetch(ballot_id).await?;
        self.open(&record).await
    }

    /// Current counts for every option of the ballot, in option order.
    pub async fn get_vote_counts(&self, ballot_id: &BallotId) -> Result<Vec<Tally>> {
        let ballot = self.get_ballot(ballot_id).await?;
        self.tally(&ballot).await
    }

    /// Record one vote and broadcast the new counts, returning them.
    ///
    /// Runs entirely under the ballot's lock. Failures are logged and
    /// returned once the lock is released; nothing is retried.
    pub async fn record_vote(&self, ballot_id: &BallotId, vote: Vote) -> Result<Vec<Tally>> {
        let guard = match self.locks.acquire(ballot_id).await {
            Ok(guard) => guard,
            Err(e) => {
                error!("Could not lock ballot {ballot_id} to record a vote: {e}");
                return Err(e);
            }
        };
        let result = self.record_vote_locked(ballot_id, vote).await;
        if let Err(e) = guard.release().await {
            warn!("Failed to release lock on ballot {ballot_id}: {e}");
        }

        match result {
            Ok(tallies) => Ok(tallies),
            Err(e) => {
                if e.is_domain_error() {
                    debug!("Rejected vote on ballot {ballot_id}: {e}");
                } else {
                    error!("Failed to record vote on ballot {ballot_id}: {e}");
                }
                Err(e)
            }
        }
    }

    async fn record_vote_locked(&self, ballot_id: &BallotId, vote: Vote) -> Result<Vec<Tally>> {
        let record = self.fetch(ballot_id).await?;
        let mut ballot = self.open(&record).await?;

        match ballot.status() {
            BallotStatus::Pending => {
                return Err(Error::VotingNotOpen("voting has not started".to_string()))
            }
            BallotStatus::Ended => return Err(Error::VotingNotOpen("voting has ended".to_string())),
            BallotStatus::Active => {}
        }

        let option_id = match vote {
            Vote::Option(option_id) => {
                if ballot.options.iter().all(|option| option.id != option_id) {
                    return Err(Error::InvalidOption(format!("no option with ID {option_id}")));
                }
                option_id
            }
            Vote::WriteIn(text) => self.write_in(&record, &mut ballot, text.trim()).await?,
        };

        self.repo.add_vote(ballot_id, option_id).await?;
        let tallies = self.tally(&ballot).await?;
        self.broadcast(ballot_id, &tallies).await;
        Ok(tallies)
    }

    /// Resolve a write-in to an option, creating the option if the text is new.
    async fn write_in(
        &self,
        record: &BallotRecord,
        ballot: &mut Ballot,
        text: &str,
    ) -> Result<OptionId> {
        if !ballot.allow_write_in {
            return Err(Error::InvalidOption(
                "write-in votes are not allowed on this ballot".to_string(),
            ));
        }
        if text.is_empty() || text.chars().count() > MAX_OPTION_LEN {
            return Err(Error::InvalidOption(format!(
                "write-in must be between 1 and {MAX_OPTION_LEN} characters"
            )));
        }
        if let Some(existing) = ballot.option_by_text(text) {
            return Ok(existing.id);
        }

        let dek = self
            .crypto
            .get_ballot_keyset(&record.id, Some(&record.encrypted_dek))
            .await?;
        let encrypted_text = CryptoService::encrypt_string(text, &dek, OPTION_CONTEXT)?;
        let option_id = self
            .repo
            .add_write_in_option(&record.id, encrypted_text)
            .await?;
        debug!("Added write-in option {option_id} to ballot {}", record.id);
        ballot.options.push(BallotOption {
            id: option_id,
            text: text.to_string(),
            is_write_in: true,
        });
        Ok(option_id)
    }

    /// Publish new counts to other workers, then push them to local subscribers.
    /// The vote is already persisted, so failures here are only logged.
    async fn broadcast(&self, ballot_id: &BallotId, tallies: &[Tally]) {
        if let Some(store) = &self.store {
            match serde_json::to_string(tallies) {
                Ok(payload) => {
                    if let Err(e) = store.publish(&ballot_id.updates_channel(), &payload).await {
                        warn!("Failed to publish update for ballot {ballot_id}: {e}");
                    }
                }
                Err(e) => error!("Failed to encode update for ballot {ballot_id}: {e}"),
            }
        }
        self.state.deliver(ballot_id, tallies);
    }

    /// Subscribe to live results for a ballot. The first item is the current
    /// count; later items arrive as votes are recorded on any worker.
    pub async fn register_sse_client(&self, ballot_id: &BallotId) -> Result<LiveResults> {
        let ballot = self.get_ballot(ballot_id).await?;

        let registration = self.state.add_subscriber(ballot_id);
        // From here on, dropping `live` unregisters.
        let mut live = LiveResults {
            service: self.clone(),
            ballot_id: ballot_id.clone(),
            subscriber_id: registration.id,
            initial: None,
            last_total: None,
            receiver: registration.receiver,
        };

        if registration.needs_listener {
            // Lets a later subscriber retry if this one fails or is cancelled.
            let _claim = ListenerClaim {
                state: &self.state,
                ballot_id,
            };
            if let Some(store) = &self.store {
                match store.subscribe(&ballot_id.updates_channel()).await {
                    Ok(subscription) => {
                        let listener = tokio::spawn(forward_updates(
                            self.state.clone(),
                            ballot_id.clone(),
                            subscription,
                        ));
                        self.state.set_listener(ballot_id, listener);
                    }
                    Err(e) => warn!(
                        "Live results for ballot {ballot_id} limited to this worker, \
could not subscribe: {e}"
                    ),
                }
            }
        }

        live.initial = Some(self.tally(&ballot).await?);
        debug!(
            "Registered live-results subscriber {} on ballot {ballot_id}",
            live.subscriber_id
        );
        Ok(live)
    }

    /// Remove a live-results subscriber. Safe to call more than once.
    pub fn unregister_sse_client(&self, ballot_id: &BallotId, subscriber_id: SubscriberId) {
        self.state.remove_subscriber(ballot_id, subscriber_id);
    }

    /// Delete a ballot with all its options and votes.
    pub async fn delete_ballot(&self, ballot_id: &BallotId) -> Result<()> {
        let guard = self.locks.acquire(ballot_id).await?;
        let deleted = self.repo.delete_ballot(ballot_id).await;
        if let Err(e) = guard.release().await {
            warn!("Failed to release lock on ballot {ballot_id}: {e}");
        }
        if !deleted? {
            return Err(Error::not_found(format!("Ballot {ballot_id}")));
        }

        self.crypto.evict(ballot_id).await;
        self.state.remove(ballot_id);
        info!("Deleted ballot {ballot_id}");
        Ok(())
    }

    /// Drop process-local state for ballots that no longer need it: deleted
    /// ballots, and ended ballots nobody is watching. Returns how many
    /// ballots were cleaned up.
    pub async fn cleanup_stale_metadata(&self) -> usize {
        let mut removed = 0;
        for ballot_id in self.state.tracked_ids() {
            match self.repo.get_by_id(&ballot_id).await {
                Ok(None) => {
                    self.state.remove(&ballot_id);
                    self.crypto.evict(&ballot_id).await;
                    removed += 1;
                }
                Ok(Some(record)) => {
                    let status = BallotStatus::at(record.start_time, record.end_time, Utc::now());
                    if status == BallotStatus::Ended && self.state.remove_if_idle(&ballot_id) {
                        removed += 1;
                    }
                }
                Err(e) => error!("Failed to check ballot {ballot_id} for stale metadata: {e}"),
            }
        }
        if removed > 0 {
            debug!("Cleaned up metadata for {removed} ballots");
        }
        removed
    }

    /// Forget all process-local state.
    pub fn reset(&self) {
        self.state.clear();
        self.crypto.reset();
    }

    async fn fetch(&self, ballot_id: &BallotId) -> Result<BallotRecord> {
        self.repo
            .get_by_id(ballot_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Ballot {ballot_id}")))
    }

    /// Decrypt a stored ballot.
    async fn open(&self, record: &BallotRecord) -> Result<Ballot> {
        if record.kms_key_id != self.crypto.key_id() {
            return Err(Error::authentication(format!(
                "ballot {} is wrapped by key {}, not {}",
                record.id,
                record.kms_key_id,
                self.crypto.key_id()
            )));
        }
        let dek = self
            .crypto
            .get_ballot_keyset(&record.id, Some(&record.encrypted_dek))
            .await?;
        let measure =
            CryptoService::decrypt_string(&record.encrypted_measure, &dek, MEASURE_CONTEXT)?;
        let texts = self
            .crypto
            .decrypt_strings(
                record.options.iter().map(|o| o.encrypted_text.clone()).collect(),
                dek,
                OPTION_CONTEXT,
            )
            .await?;
        let options = record
            .options
            .iter()
            .zip(texts)
            .map(|(option, text)| BallotOption {
                id: option.id,
                text,
                is_write_in: option.is_write_in,
            })
            .collect();

        Ok(Ballot {
            id: record.id.clone(),
            owner_id: record.owner_id.clone(),
            measure,
            allow_write_in: record.allow_write_in,
            start_time: record.start_time,
            end_time: record.end_time,
            options,
        })
    }

    /// Counts for every option, zero included.
    async fn tally(&self, ballot: &Ballot) -> Result<Vec<Tally>> {
        let counts: HashMap<OptionId, u64> =
            self.repo.get_tallies(&ballot.id).await?.into_iter().collect();
        Ok(ballot
            .options
            .iter()
            .map(|option| {
                let count = counts.get(&option.id).copied().unwrap_or(0);
                Tally::new(option.text.clone(), count)
            })
            .collect())
    }
}

/// Forward tally snapshots from the shared channel to local subscribers,
/// until the subscription ends or the task is aborted.
async fn forward_updates(
    state: Arc<BallotStateManager>,
    ballot_id: BallotId,
    mut subscription: Subscription,
) {
    while let Some(payload) = subscription.next().await {
        match serde_json::from_str::<Vec<Tally>>(&payload) {
            Ok(tallies) => {
                state.deliver(&ballot_id, &tallies);
            }
            Err(e) => warn!("Ignoring malformed update for ballot {ballot_id}: {e}"),
        }
    }
    debug!("Update channel for ballot {ballot_id} closed");
}

/// A live-results subscription. Unregisters itself when dropped.
pub struct LiveResults {
    service: BallotService,
    ballot_id: BallotId,
    subscriber_id: SubscriberId,
    initial: Option<Vec<Tally>>,
    /// Total of the last snapshot handed out; older ones are skipped.
    last_total: Option<u64>,
    receiver: TallyReceiver,
}

impl LiveResults {
    pub fn subscriber_id(&self) -> SubscriberId {
        self.subscriber_id
    }

    /// The next snapshot of counts. Returns `None` once the ballot is gone.
    pub async fn next(&mut self) -> Option<Vec<Tally>> {
        if let Some(initial) = self.initial.take() {
            self.last_total = Some(Tally::total(&initial));
            return Some(initial);
        }
        loop {
            let tallies = self.receiver.recv().await?;
            let total = Tally::total(&tallies);
            // Queued before the initial snapshot was counted, or delayed in transit.
            if self.last_total.map_or(false, |last| total <= last) {
                continue;
            }
            self.last_total = Some(total);
            return Some(tallies);
        }
    }
}

/// An unfinished attempt to start a ballot's listener, given up on drop.
struct ListenerClaim<'a> {
    state: &'a BallotStateManager,
    ballot_id: &'a BallotId,
}

impl Drop for ListenerClaim<'_> {
    fn drop(&mut self) {
        self.state.abandon_listener(self.ballot_id);
    }
}

impl Drop for LiveResults {
    fn drop(&mut self) {
        self.service
            .unregister_sse_client(&self.ballot_id, self.subscriber_id);
    }
}
