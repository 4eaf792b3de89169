//! Per-ballot mutual exclusion for the vote path.
//!
//! With a shared store the lock is distributed across every worker; without
//! one it only covers this process.

use std::sync::Arc;
use std::time::Duration;

use data_encoding::BASE64URL_NOPAD;
use rand::{Rng, RngCore};
use rocket::tokio::{
    runtime::Handle,
    sync::OwnedMutexGuard,
    time::{sleep, Instant},
};

use crate::error::{Error, Result};
use crate::model::common::BallotId;
use crate::shared::SharedStore;
use crate::state::BallotStateManager;

/// Default lease on a distributed lock.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(10);

/// Default time to wait for a distributed lock before giving up.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(30);

const MIN_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// Hands out exclusive access to a ballot.
#[rocket::async_trait]
pub trait BallotLocks: Send + Sync {
    /// Wait until the ballot's lock is ours.
    async fn acquire(&self, ballot_id: &BallotId) -> Result<LockGuard>;
}

/// Proof of holding a ballot's lock.
///
/// Prefer [`LockGuard::release`]. If the guard is dropped instead, e.g.
/// because the holding future was cancelled, release happens in the background.
pub struct LockGuard {
    held: Option<Held>,
}

enum Held {
    /// Held for its drop, which unlocks the ballot's mutex.
    Local { _guard: OwnedMutexGuard<()> },
    Distributed {
        store: Arc<dyn SharedStore>,
        name: String,
        token: String,
    },
}

impl LockGuard {
    pub async fn release(mut self) -> Result<()> {
        match self.held.take() {
            Some(Held::Distributed { store, name, token }) => {
                if !store.unlock(&name, &token).await? {
                    warn!("Lease on {name} lapsed before release");
                }
                Ok(())
            }
            Some(Held::Local { .. }) | None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(Held::Distributed { store, name, token }) = self.held.take() {
            match Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = store.unlock(&name, &token).await {
                            warn!("Background release of {name} failed: {e}");
                        }
                    });
                }
                Err(_) => warn!("No runtime to release {name}; it will lapse with its lease"),
            }
        }
    }
}

/// Locks local to this process, backed by the state manager's mutexes.
pub struct LocalLocks {
    state: Arc<BallotStateManager>,
}

impl LocalLocks {
    pub fn new(state: Arc<BallotStateManager>) -> Self {
        Self { state }
    }
}

#[rocket::async_trait]
impl BallotLocks for LocalLocks {
    async fn acquire(&self, ballot_id: &BallotId) -> Result<LockGuard> {
        let guard = self.state.get_lock(ballot_id).lock_owned().await;
        Ok(LockGuard {
            held: Some(Held::Local { _guard: guard }),
        })
    }
}

/// Leased locks in the shared store, exclusive across every worker.
pub struct DistributedLocks {
    store: Arc<dyn SharedStore>,
    lease: Duration,
    wait: Duration,
}

impl DistributedLocks {
    pub fn new(store: Arc<dyn SharedStore>, lease: Duration, wait: Duration) -> Self {
        Self { store, lease, wait }
    }
}

#[rocket::async_trait]
impl BallotLocks for DistributedLocks {
    async fn acquire(&self, ballot_id: &BallotId) -> Result<LockGuard> {
        let name = ballot_id.lock_key();
        let token = {
            let mut bytes = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut bytes);
            BASE64URL_NOPAD.encode(&bytes)
        };
        let deadline = Instant::now() + self.wait;
        let mut backoff = MIN_BACKOFF;

        loop {
            if self.store.try_lock(&name, &token, self.lease).await? {
                trace!("Acquired {name}");
                return Ok(LockGuard {
                    held: Some(Held::Distributed {
                        store: self.store.clone(),
                        name,
                        token,
                    }),
                });
            }
            if Instant::now() >= deadline {
                return Err(Error::ServiceUnavailable(format!(
                    "Timed out waiting for the lock on ballot {ballot_id}"
                )));
            }
            let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64);
            sleep(backoff + Duration::from_millis(jitter)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}
