//! Process-local per-ballot state: vote-path mutexes and live-result subscribers.

use std::collections::{BTreeSet, HashMap};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex as StdMutex, MutexGuard,
};

use rocket::tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};

use crate::model::{api::Tally, common::BallotId};

/// Identifies one live-results subscriber within this process.
pub type SubscriberId = u64;

/// The receiving end of a subscriber's queue.
pub type TallyReceiver = mpsc::UnboundedReceiver<Vec<Tally>>;

/// Local subscribers of one ballot.
#[derive(Default)]
struct Subscribers {
    queues: Vec<(SubscriberId, mpsc::UnboundedSender<Vec<Tally>>)>,
    /// Task forwarding updates from the shared channel, if any.
    listener: Option<JoinHandle<()>>,
    /// A subscriber is currently trying to start the listener.
    subscribing: bool,
    /// Total vote count of the last snapshot delivered.
    last_total: Option<u64>,
}

impl Drop for Subscribers {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

/// Result of registering a subscriber.
pub struct Registration {
    pub id: SubscriberId,
    pub receiver: TallyReceiver,
    /// Whether this subscriber should start the ballot's listener task. If
    /// so, it must finish with [`BallotStateManager::set_listener`] or
    /// [`BallotStateManager::abandon_listener`].
    pub needs_listener: bool,
}

/// Owns the per-ballot locks and subscriber queues of this process.
#[derive(Default)]
pub struct BallotStateManager {
    locks: StdMutex<HashMap<BallotId, Arc<Mutex<()>>>>,
    subscribers: StdMutex<HashMap<BallotId, Subscribers>>,
    next_subscriber: AtomicU64,
}

fn guard<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    // Critical sections never panic, but don't cascade if one did.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BallotStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mutex serializing votes on this ballot. Always the same object for
    /// the same ballot until the ballot's state is removed.
    pub fn get_lock(&self, ballot_id: &BallotId) -> Arc<Mutex<()>> {
        guard(&self.locks)
            .entry(ballot_id.clone())
            .or_default()
            .clone()
    }

    /// Add a subscriber queue for the ballot.
    pub fn add_subscriber(&self, ballot_id: &BallotId) -> Registration {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut subscribers = guard(&self.subscribers);
        let entry = subscribers.entry(ballot_id.clone()).or_default();
        entry.queues.push((id, sender));
        // Retried by every new subscriber until a listener is running.
        let needs_listener = entry.listener.is_none() && !entry.subscribing;
        entry.subscribing |= needs_listener;
        Registration {
            id,
            receiver,
            needs_listener,
        }
    }

    /// Install the listener task for a ballot. If the subscribers have all
    /// left in the meantime, or another listener won the race, the task is
    /// aborted instead.
    pub fn set_listener(&self, ballot_id: &BallotId, listener: JoinHandle<()>) {
        let mut subscribers = guard(&self.subscribers);
        match subscribers.get_mut(ballot_id) {
            Some(entry) if !entry.queues.is_empty() && entry.listener.is_none() => {
                entry.listener = Some(listener);
                entry.subscribing = false;
            }
            _ => listener.abort(),
        }
    }

    /// Give up starting a listener, letting the next subscriber try again.
    /// Does nothing once a listener is installed.
    pub fn abandon_listener(&self, ballot_id: &BallotId) {
        if let Some(entry) = guard(&self.subscribers).get_mut(ballot_id) {
            entry.subscribing = false;
        }
    }

    /// Remove a subscriber. Unknown IDs are ignored. When the last subscriber
    /// leaves, the ballot's listener is stopped.
    pub fn remove_subscriber(&self, ballot_id: &BallotId, subscriber: SubscriberId) {
        let mut subscribers = guard(&self.subscribers);
        let now_empty = match subscribers.get_mut(ballot_id) {
            Some(entry) => {
                entry.queues.retain(|(id, _)| *id != subscriber);
                entry.queues.is_empty()
            }
            None => false,
        };
        if now_empty {
            // Dropping the entry aborts the listener.
            subscribers.remove(ballot_id);
            trace!("Last live-results subscriber left ballot {ballot_id}");
        }
    }

    pub fn subscriber_count(&self, ballot_id: &BallotId) -> usize {
        guard(&self.subscribers)
            .get(ballot_id)
            .map_or(0, |entry| entry.queues.len())
    }

    /// Push a tally snapshot to every local subscriber of the ballot.
    ///
    /// Snapshots no newer than the last one delivered are skipped, so an
    /// update that arrives both directly and over the shared channel is only
    /// seen once. Returns the number of queues the snapshot was pushed to.
    pub fn deliver(&self, ballot_id: &BallotId, tallies: &[Tally]) -> usize {
        let total = Tally::total(tallies);
        let mut subscribers = guard(&self.subscribers);
        let Some(entry) = subscribers.get_mut(ballot_id) else {
            return 0;
        };
        if entry.last_total.map_or(false, |last| total <= last) {
            return 0;
        }
        entry.last_total = Some(total);
        // A closed queue belongs to a subscriber that is about to unregister.
        entry
            .queues
            .iter()
            .filter(|(_, queue)| queue.send(tallies.to_vec()).is_ok())
            .count()
    }

    /// Every ballot with a lock or subscriber entry in this process.
    pub fn tracked_ids(&self) -> Vec<BallotId> {
        let mut ids: BTreeSet<BallotId> = guard(&self.locks).keys().cloned().collect();
        ids.extend(guard(&self.subscribers).keys().cloned());
        ids.into_iter().collect()
    }

    /// Remove a ballot's state if nobody is subscribed to it and its lock is
    /// neither held nor awaited. The check and the removal are atomic with
    /// respect to new subscriptions. Returns whether the state was removed.
    pub fn remove_if_idle(&self, ballot_id: &BallotId) -> bool {
        let mut subscribers = guard(&self.subscribers);
        if subscribers
            .get(ballot_id)
            .map_or(false, |entry| !entry.queues.is_empty())
        {
            return false;
        }
        let mut locks = guard(&self.locks);
        if let Some(lock) = locks.get(ballot_id) {
            // Anyone holding or waiting for the lock has a clone of it.
            if Arc::strong_count(lock) > 1 || lock.try_lock().is_err() {
                return false;
            }
        }
        locks.remove(ballot_id);
        subscribers.remove(ballot_id);
        true
    }

    /// Remove all of a ballot's state unconditionally.
    pub fn remove(&self, ballot_id: &BallotId) {
        guard(&self.subscribers).remove(ballot_id);
        guard(&self.locks).remove(ballot_id);
    }

    /// Drop all state, stopping every listener.
    pub fn clear(&self) {
        guard(&self.subscribers).clear();
        guard(&self.locks).clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rocket::tokio::{sync::oneshot, time::timeout};

    use super::*;

    fn snapshot(yes: u64, no: u64) -> Vec<Tally> {
        vec![Tally::new("Yes", yes), Tally::new("No", no)]
    }

    #[test]
    fn same_lock_for_same_ballot() {
        let state = BallotStateManager::new();
        let (a, b) = (BallotId::from("a"), BallotId::from("b"));
        assert!(Arc::ptr_eq(&state.get_lock(&a), &state.get_lock(&a)));
        assert!(!Arc::ptr_eq(&state.get_lock(&a), &state.get_lock(&b)));
    }

    #[test]
    fn only_first_subscriber_needs_listener() {
        let state = BallotStateManager::new();
        let ballot = BallotId::from("a");
        let first = state.add_subscriber(&ballot);
        let second = state.add_subscriber(&ballot);
        assert!(first.needs_listener);
        assert!(!second.needs_listener);
        assert_ne!(first.id, second.id);
        assert_eq!(state.subscriber_count(&ballot), 2);
    }

    #[test]
    fn delivery_reaches_all_queues_once() {
        let state = BallotStateManager::new();
        let ballot = BallotId::from("a");
        let mut first = state.add_subscriber(&ballot);
        let mut second = state.add_subscriber(&ballot);

        assert_eq!(state.deliver(&ballot, &snapshot(1, 0)), 2);
        // The same snapshot arriving again, or a stale one, is dropped.
        assert_eq!(state.deliver(&ballot, &snapshot(1, 0)), 0);
        assert_eq!(state.deliver(&ballot, &snapshot(2, 1)), 2);
        assert_eq!(state.deliver(&ballot, &snapshot(1, 1)), 0);

        for registration in [&mut first, &mut second] {
            assert_eq!(registration.receiver.try_recv().unwrap(), snapshot(1, 0));
            assert_eq!(registration.receiver.try_recv().unwrap(), snapshot(2, 1));
            assert!(registration.receiver.try_recv().is_err());
        }
    }

    #[test]
    fn unregister_is_idempotent() {
        let state = BallotStateManager::new();
        let ballot = BallotId::from("a");
        let first = state.add_subscriber(&ballot);
        let second = state.add_subscriber(&ballot);

        state.remove_subscriber(&ballot, first.id);
        state.remove_subscriber(&ballot, first.id);
        assert_eq!(state.subscriber_count(&ballot), 1);
        state.remove_subscriber(&ballot, second.id);
        state.remove_subscriber(&ballot, second.id);
        state.remove_subscriber(&BallotId::from("unknown"), 42);
        assert_eq!(state.subscriber_count(&ballot), 0);

        // The next subscriber starts a fresh listener.
        assert!(state.add_subscriber(&ballot).needs_listener);
    }

    #[rocket::async_test]
    async fn abandoned_listener_is_retried() {
        let state = BallotStateManager::new();
        let ballot = BallotId::from("a");
        let first = state.add_subscriber(&ballot);
        assert!(first.needs_listener);
        state.abandon_listener(&ballot);

        let second = state.add_subscriber(&ballot);
        assert!(second.needs_listener);
        let (listener, _aborted) = pending_listener();
        state.set_listener(&ballot, listener);
        state.abandon_listener(&ballot);

        assert!(!state.add_subscriber(&ballot).needs_listener);
        assert_eq!(state.subscriber_count(&ballot), 3);
    }

    /// A listener that never finishes, and a receiver that errors once it is aborted.
    fn pending_listener() -> (JoinHandle<()>, oneshot::Receiver<()>) {
        let (alive, aborted) = oneshot::channel();
        let listener = rocket::tokio::spawn(async move {
            let _alive = alive;
            std::future::pending::<()>().await
        });
        (listener, aborted)
    }

    #[rocket::async_test]
    async fn last_unregister_stops_listener() {
        let state = BallotStateManager::new();
        let ballot = BallotId::from("a");
        let registration = state.add_subscriber(&ballot);
        let (listener, mut aborted) = pending_listener();
        state.set_listener(&ballot, listener);
        assert!(aborted.try_recv().is_err());

        state.remove_subscriber(&ballot, registration.id);
        let result = timeout(Duration::from_secs(1), aborted).await.unwrap();
        assert!(result.is_err());
    }

    #[rocket::async_test]
    async fn late_listener_is_aborted() {
        let state = BallotStateManager::new();
        let ballot = BallotId::from("a");
        let registration = state.add_subscriber(&ballot);
        state.remove_subscriber(&ballot, registration.id);

        let (listener, aborted) = pending_listener();
        state.set_listener(&ballot, listener);
        let result = timeout(Duration::from_secs(1), aborted).await.unwrap();
        assert!(result.is_err());
    }

    #[rocket::async_test]
    async fn busy_ballots_are_not_idle() {
        let state = BallotStateManager::new();
        let ballot = BallotId::from("a");

        let lock = state.get_lock(&ballot);
        let held = lock.lock().await;
        assert!(!state.remove_if_idle(&ballot));
        drop(held);
        drop(lock);

        let registration = state.add_subscriber(&ballot);
        assert!(!state.remove_if_idle(&ballot));
        state.remove_subscriber(&ballot, registration.id);

        assert_eq!(state.tracked_ids(), vec![ballot.clone()]);
        assert!(state.remove_if_idle(&ballot));
        assert!(state.tracked_ids().is_empty());
    }

    #[test]
    fn remove_and_clear() {
        let state = BallotStateManager::new();
        let (a, b) = (BallotId::from("a"), BallotId::from("b"));
        state.get_lock(&a);
        let _sub = state.add_subscriber(&b);
        state.remove(&a);
        assert_eq!(state.tracked_ids(), vec![b.clone()]);
        state.clear();
        assert!(state.tracked_ids().is_empty());
        assert_eq!(state.subscriber_count(&b), 0);
    }
}
