use mongodb::Client as MongoClient;
use rocket::{
    fairing::{Fairing, Info, Kind},
    tokio::time::Duration,
    Build, Orbit, Rocket,
};
use serde::Deserialize;

use crate::model::mongodb::ensure_indexes_exist;
use crate::pipeline::Aggregator;
use crate::storage::{MemoryStore, MongoStore, Storage};

/// Application configuration, derived from `Rocket.toml` and `ROCKET_*`
/// environment variables. This struct becomes managed state and can be
/// inspected by any endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_aggregation_delay_ms")]
    aggregation_delay_ms: u64,
    #[serde(default = "default_participant_ttl_days")]
    participant_ttl_days: u32,
}

fn default_aggregation_delay_ms() -> u64 {
    500
}

fn default_participant_ttl_days() -> u32 {
    365
}

impl Config {
    pub fn new(aggregation_delay: Duration, participant_ttl_days: u32) -> Self {
        Self {
            aggregation_delay_ms: u64::try_from(aggregation_delay.as_millis()).unwrap_or(u64::MAX),
            participant_ttl_days,
        }
    }

    /// Delay between the first vote of a burst and the flush of its counters.
    pub fn aggregation_delay(&self) -> Duration {
        Duration::from_millis(self.aggregation_delay_ms)
    }

    /// Lifetime of the participant identity cookie.
    pub fn participant_ttl(&self) -> time::Duration {
        time::Duration::days(self.participant_ttl_days.into())
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
        info!(
            "Aggregating votes every {}ms",
            config.aggregation_delay().as_millis()
        );

        // Manage the state.
        rocket = rocket.manage(config);
        Ok(rocket)
    }
}

/// Which storage backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Backend {
    #[default]
    Mongodb,
    Memory,
}

/// Configuration for the storage backend.
#[derive(Deserialize)]
struct StorageConfig {
    #[serde(default)]
    storage: Backend,
    // secrets
    #[serde(default)]
    db_uri: Option<String>,
    #[serde(default = "default_db_name")]
    db_name: String,
}

fn default_db_name() -> String {
    "polling".to_string()
}

/// A fairing that loads the storage config, connects to the database if
/// needed, performs any setup necessary, and places the [`Storage`] into
/// managed state.
pub struct StorageFairing;

#[rocket::async_trait]
impl Fairing for StorageFairing {
    fn info(&self) -> Info {
        Info {
            name: "Storage",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<StorageConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load storage config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };

        let db_uri = match (config.storage, config.db_uri) {
            (Backend::Memory, _) => {
                warn!("Using in-memory storage: nothing will survive a restart");
                return Ok(rocket.manage(Storage::memory(MemoryStore::new())));
            }
            (Backend::Mongodb, Some(uri)) => uri,
            (Backend::Mongodb, None) => {
                error!("`db_uri` must be set when using MongoDB storage");
                return Err(rocket);
            }
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
        let db = client.database(&config.db_name);

        // Ensure the required indexes exist.
        if let Err(e) = ensure_indexes_exist(&db).await {
            error!("Failed to connect to database: {e}");
            return Err(rocket);
        }
        info!("...database connection online!");

        // Manage the state.
        Ok(rocket.manage(Storage::mongo(MongoStore::new(&db))))
    }
}

/// A fairing that owns the vote aggregator's lifecycle: it is created on
/// ignite, and flushed and stopped on shutdown.
///
/// Must be attached after the config and storage are managed.
pub struct AggregatorFairing;

#[rocket::async_trait]
impl Fairing for AggregatorFairing {
    fn info(&self) -> Info {
        Info {
            name: "Vote aggregator",
            kind: Kind::Ignite | Kind::Shutdown,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let aggregator = match (rocket.state::<Config>(), rocket.state::<Storage>()) {
            (Some(config), Some(storage)) => {
                Aggregator::new(storage.sessions.clone(), config.aggregation_delay())
            }
            _ => {
                error!("Vote aggregator needs the config and storage to be loaded first");
                return Err(rocket);
            }
        };
        Ok(rocket.manage(aggregator))
    }

    async fn on_shutdown(&self, rocket: &Rocket<Orbit>) {
        if let Some(aggregator) = rocket.state::<Aggregator>() {
            let report = aggregator.shutdown().await;
            if report.groups_dropped > 0 {
                warn!(
                    "{} vote groups were dropped during the final flush",
                    report.groups_dropped
                );
            }
        }
    }
}

#[cfg(test)]
impl Config {
    /// Config for tests: a short aggregation delay.
    pub fn example() -> Self {
        Self::new(Duration::from_millis(20), 365)
    }
}
