use std::sync::Arc;
use std::time::Duration;

use mongodb::Client as MongoClient;
use rocket::{
    fairing::{Fairing, Info, Kind},
    Build, Rocket,
};
use serde::Deserialize;

use crate::crypto::{CryptoPool, CryptoService, LocalMasterKeyProvider, MasterKeyProvider};
use crate::lock::{DEFAULT_LEASE, DEFAULT_WAIT};
use crate::model::mongodb::{ensure_indexes_exist, ensure_option_id_counter_exists, Coll};
use crate::repository::{BallotRepository, InMemoryBallotRepository, MongoBallotRepository};
use crate::service::BallotService;
use crate::shared::{RedisStore, SharedStore};

/// Name of the MongoDB database holding ballots.
const DATABASE: &str = "oponn";

/// Application configuration, derived from `Rocket.toml` and `ROCKET_*`
/// environment variables. This struct becomes managed state and can be
/// inspected by any endpoint.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_lock_lease_secs")]
    lock_lease_secs: u64,
    #[serde(default = "default_lock_wait_secs")]
    lock_wait_secs: u64,
    #[serde(default = "default_reaper_interval_secs")]
    reaper_interval_secs: u64,
    #[serde(default = "default_crypto_workers")]
    crypto_workers: usize,
}

fn default_lock_lease_secs() -> u64 {
    DEFAULT_LEASE.as_secs()
}

fn default_lock_wait_secs() -> u64 {
    DEFAULT_WAIT.as_secs()
}

fn default_reaper_interval_secs() -> u64 {
    60
}

fn default_crypto_workers() -> usize {
    4
}

impl Config {
    /// Lease on a distributed ballot lock.
    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    /// How long a vote waits for a distributed ballot lock before failing.
    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    /// Time between sweeps of stale ballot metadata.
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    /// Number of threads available for bulk encryption.
    pub fn crypto_workers(&self) -> usize {
        self.crypto_workers
    }
}

/// A fairing that loads the application config and puts it in managed state.
pub struct ConfigFairing;

#[rocket::async_trait]
impl Fairing for ConfigFairing {
    fn info(&self) -> Info {
        Info {
            name: "Config",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<Config>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load application config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };

        // Manage the state.
        rocket = rocket.manage(config);
        Ok(rocket)
    }
}

/// Configuration for the database.
#[derive(Deserialize)]
struct DbConfig {
    // secrets
    db_uri: Option<String>,
}

/// A fairing that loads the MongoDB config, connects to the database,
/// performs any setup necessary, and places an `Arc<dyn BallotRepository>`
/// into managed state. Without a `db_uri`, ballots are kept in memory.
pub struct DatabaseFairing;

#[rocket::async_trait]
impl Fairing for DatabaseFairing {
    fn info(&self) -> Info {
        Info {
            name: "MongoDB",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<DbConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load database config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        let Some(db_uri) = config.db_uri else {
            warn!("No `db_uri` configured, ballots will be lost on restart");
            let repo: Arc<dyn BallotRepository> = Arc::new(InMemoryBallotRepository::new());
            return Ok(rocket.manage(repo));
        };
        info!("Loaded database config, connecting...");

        // Construct the connection.
        let client = match MongoClient::with_uri_str(db_uri).await {
            Ok(client) => client,
            Err(e) => {
                error!("Failed to connect to database: {e}");
                return Err(rocket);
            }
        };
        let db = client.database(DATABASE);

        // Ensure the required indexes and the option ID counter exist.
        if let Err(e) = ensure_indexes_exist(&db).await {
            error!("Failed to connect to database: {e}");
            return Err(rocket);
        }
        if let Err(e) = ensure_option_id_counter_exists(&Coll::from_db(&db)).await {
            error!("Failed to connect to database: {e}");
            return Err(rocket);
        }
        info!("...database connection online!");

        // Manage the state.
        let repo: Arc<dyn BallotRepository> = Arc::new(MongoBallotRepository::new(client, &db));
        rocket = rocket.manage(repo);
        Ok(rocket)
    }
}

/// The shared store, if one is configured.
pub struct SharedStoreState(pub Option<Arc<dyn SharedStore>>);

/// Configuration for the shared store.
#[derive(Deserialize)]
struct SharedStoreConfig {
    // secrets
    redis_url: Option<String>,
}

/// A fairing that connects to Redis and places a [`SharedStoreState`] into
/// managed state. Without a `redis_url`, this worker runs standalone.
pub struct SharedStoreFairing;

#[rocket::async_trait]
impl Fairing for SharedStoreFairing {
    fn info(&self) -> Info {
        Info {
            name: "Redis",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let config = match rocket.figment().extract::<SharedStoreConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load shared store config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        let Some(redis_url) = config.redis_url else {
            warn!("No `redis_url` configured, locks and live results are local to this worker");
            return Ok(rocket.manage(SharedStoreState(None)));
        };

        info!("Loaded shared store config, connecting...");
        let store = match RedisStore::connect(&redis_url).await {
            Ok(store) => store,
            Err(e) => {
                error!("Failed to connect to shared store: {e}");
                return Err(rocket);
            }
        };
        info!("...shared store online!");
        Ok(rocket.manage(SharedStoreState(Some(Arc::new(store)))))
    }
}

/// Configuration for the master key.
#[derive(Deserialize)]
#[cfg_attr(not(feature = "kms"), allow(dead_code))]
struct MasterKeyConfig {
    // secrets
    master_key: Option<String>,
    // KMS
    kms_key_id: Option<String>,
    aws_region: Option<String>,
    aws_access_key_id: Option<String>,
    aws_secret_access_key: Option<String>,
    aws_endpoint: Option<String>,
}

/// A fairing that sets up the master key provider and places an
/// `Arc<dyn MasterKeyProvider>` into managed state.
///
/// With a `kms_key_id` the key lives in AWS KMS; otherwise `master_key` is
/// used, or a throwaway key is generated.
pub struct MasterKeyFairing;

#[rocket::async_trait]
impl Fairing for MasterKeyFairing {
    fn info(&self) -> Info {
        Info {
            name: "Master key",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let config = match rocket.figment().extract::<MasterKeyConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load master key config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };

        let provider: Arc<dyn MasterKeyProvider> = match config.kms_key_id.clone() {
            Some(kms_key_id) => match kms_provider(kms_key_id, config) {
                Some(provider) => provider,
                None => return Err(rocket),
            },
            None => match config.master_key {
                Some(master_key) => match LocalMasterKeyProvider::from_base64(&master_key) {
                    Ok(provider) => Arc::new(provider),
                    Err(e) => {
                        error!("Invalid `master_key`: {e}");
                        return Err(rocket);
                    }
                },
                None => {
                    warn!("No master key configured, generated a throwaway one");
                    Arc::new(LocalMasterKeyProvider::generate())
                }
            },
        };
        info!("Using master key {}", provider.key_id());
        Ok(rocket.manage(provider))
    }
}

/// Build the AWS KMS provider, in the same way as every other AWS client.
#[cfg(feature = "kms")]
fn kms_provider(
    kms_key_id: String,
    config: MasterKeyConfig,
) -> Option<Arc<dyn MasterKeyProvider>> {
    use aws_config::{BehaviorVersion, SdkConfig};
    use aws_credential_types::provider::SharedCredentialsProvider;
    use aws_sdk_kms::{
        config::{Credentials, Region},
        Client as KmsClient,
    };

    use crate::crypto::KmsMasterKeyProvider;

    let (Some(region), Some(access_key_id), Some(secret_access_key)) = (
        config.aws_region,
        config.aws_access_key_id,
        config.aws_secret_access_key,
    ) else {
        error!(
            "`kms_key_id` requires `aws_region`, `aws_access_key_id` and `aws_secret_access_key`"
        );
        return None;
    };

    // Construct the connection.
    let mut builder = SdkConfig::builder()
        .region(Region::new(region))
        .credentials_provider(SharedCredentialsProvider::new(Credentials::new(
            access_key_id,
            secret_access_key,
            None,
            None,
            "rocket config",
        )))
        .behavior_version(BehaviorVersion::latest());
    if let Some(endpoint) = config.aws_endpoint {
        builder = builder.endpoint_url(endpoint);
    }
    let client = KmsClient::new(&builder.build());
    info!("Loaded AWS KMS config");
    Some(Arc::new(KmsMasterKeyProvider::new(client, kms_key_id)))
}

#[cfg(not(feature = "kms"))]
fn kms_provider(
    _kms_key_id: String,
    _config: MasterKeyConfig,
) -> Option<Arc<dyn MasterKeyProvider>> {
    error!("`kms_key_id` is set, but this build does not include KMS support");
    None
}

/// A fairing that assembles the [`BallotService`] from the repository,
/// shared store and master key in managed state, and manages it. It must be
/// attached after the fairings responsible for those.
pub struct BallotServiceFairing;

#[rocket::async_trait]
impl Fairing for BallotServiceFairing {
    fn info(&self) -> Info {
        Info {
            name: "Ballot service",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let parts = (
            rocket.state::<Config>(),
            rocket.state::<Arc<dyn BallotRepository>>(),
            rocket.state::<SharedStoreState>(),
            rocket.state::<Arc<dyn MasterKeyProvider>>(),
        );
        let (config, repo, store, provider) = match parts {
            (Some(config), Some(repo), Some(store), Some(provider)) => {
                (config, repo.clone(), store.0.clone(), provider.clone())
            }
            _ => {
                error!("Ballot service dependencies were not available");
                return Err(rocket);
            }
        };

        let crypto = CryptoService::new(
            provider,
            store.clone(),
            CryptoPool::new(config.crypto_workers()),
        );
        let service = BallotService::new(
            repo,
            Arc::new(crypto),
            store,
            config.lock_lease(),
            config.lock_wait(),
        );
        Ok(rocket.manage(service))
    }
}

#[cfg(test)]
mod tests {
    use rocket::{error::ErrorKind, figment::Figment};

    use super::*;

    #[test]
    fn defaults_apply() {
        let config: Config = Figment::new().extract().unwrap();
        assert_eq!(config.lock_lease(), Duration::from_secs(10));
        assert_eq!(config.lock_wait(), Duration::from_secs(30));
        assert_eq!(config.reaper_interval(), Duration::from_secs(60));
        assert_eq!(config.crypto_workers(), 4);
    }

    #[rocket::async_test]
    async fn standalone_ignition() {
        let figment = rocket::Config::figment()
            .merge(("master_key", "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="))
            .merge(("crypto_workers", 2));
        let rocket = rocket::custom(figment)
            .attach(ConfigFairing)
            .attach(DatabaseFairing)
            .attach(SharedStoreFairing)
            .attach(MasterKeyFairing)
            .attach(BallotServiceFairing)
            .ignite()
            .await
            .unwrap();

        let store = rocket.state::<SharedStoreState>().unwrap();
        assert!(store.0.is_none());
        let service = rocket.state::<BallotService>().unwrap();
        assert_eq!(service.crypto().key_id(), "local");
    }

    #[rocket::async_test]
    async fn bad_master_key_aborts_ignition() {
        let figment = rocket::Config::figment().merge(("master_key", "c2hvcnQ="));
        let result = rocket::custom(figment)
            .attach(ConfigFairing)
            .attach(MasterKeyFairing)
            .ignite()
            .await;
        // Inspecting the kind marks the error as handled.
        let err = result.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::FailedFairings(_)));
    }
}
