#[macro_use]
extern crate rocket;
#[macro_use]
extern crate log;

#[cfg(test)]
#[macro_use]
extern crate backend_test;

#[cfg(test)]
#[macro_use]
extern crate db_test;

use rocket::{Build, Rocket};

pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod scheduled_task;
pub mod storage;

pub use config::Config;

use config::{AggregatorFairing, ConfigFairing, StorageFairing};
use logging::LoggerFairing;
use storage::Storage;

/// The server as configured by `Rocket.toml` and the environment.
///
/// Storage is connected during ignition, so a bad configuration surfaces
/// as an ignite error rather than a panic.
pub fn build() -> Rocket<Build> {
    // Fairings run in attach order: the aggregator needs config and storage.
    rocket::build()
        .attach(LoggerFairing)
        .attach(ConfigFairing)
        .attach(StorageFairing)
        .attach(AggregatorFairing)
        .mount("/api", api::routes())
}

/// A server over the given storage and config, skipping configuration
/// loading. Used by tests and embedders.
pub fn rocket_for_storage(storage: Storage, config: Config) -> Rocket<Build> {
    rocket::build()
        .manage(storage)
        .manage(config)
        .attach(LoggerFairing)
        .attach(AggregatorFairing)
        .mount("/api", api::routes())
}
