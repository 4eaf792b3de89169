#[macro_use]
extern crate rocket;

#[cfg(test)]
#[macro_use]
extern crate backend_test;

use rocket::{Build, Rocket};

use crate::config::{
    BallotServiceFairing, ConfigFairing, DatabaseFairing, MasterKeyFairing, SharedStoreFairing,
};
use crate::logging::LoggerFairing;
use crate::reaper::ReaperFairing;

pub mod api;
pub mod config;
pub mod crypto;
pub mod error;
pub mod lock;
pub mod logging;
pub mod model;
pub mod reaper;
pub mod repository;
pub mod service;
pub mod shared;
pub mod state;

/// Build the server. Fairings run in attachment order, so each one finds the
/// state it depends on already managed.
pub fn build() -> Rocket<Build> {
    rocket::build()
        .mount("/", api::routes())
        .attach(ConfigFairing)
        .attach(DatabaseFairing)
        .attach(SharedStoreFairing)
        .attach(MasterKeyFairing)
        .attach(BallotServiceFairing)
        .attach(ReaperFairing::default())
        .attach(LoggerFairing)
}

/// An in-memory server for tests, returning handles on its internals.
///
/// With `shared`, the service uses the returned store for locks, caching and
/// live results; otherwise it runs standalone and the store is unused.
#[cfg(test)]
pub(crate) fn rocket_for_tests(
    shared: bool,
) -> (Rocket<Build>, service::BallotService, shared::MemoryStore) {
    use std::sync::Arc;

    use crate::crypto::{CryptoPool, CryptoService, LocalMasterKeyProvider};
    use crate::lock::{DEFAULT_LEASE, DEFAULT_WAIT};
    use crate::repository::InMemoryBallotRepository;
    use crate::shared::{MemoryStore, SharedStore};

    log4rs_test_utils::test_logging::init_logging_once_for(["oponn_backend"], None, None);

    let store = MemoryStore::new();
    let shared_store = shared.then(|| Arc::new(store.clone()) as Arc<dyn SharedStore>);
    let crypto = CryptoService::new(
        Arc::new(LocalMasterKeyProvider::generate()),
        shared_store.clone(),
        CryptoPool::new(2),
    );
    let service = service::BallotService::new(
        Arc::new(InMemoryBallotRepository::new()),
        Arc::new(crypto),
        shared_store,
        DEFAULT_LEASE,
        DEFAULT_WAIT,
    );

    let rocket = rocket::build()
        .mount("/", api::routes())
        .manage(service.clone())
        .attach(LoggerFairing);
    (rocket, service, store)
}
