//! Subcommand implementations.

pub mod characterize;
pub mod clear_node;
pub mod combine;
pub mod deploy_model;
pub mod profile_session;
pub mod register;
pub mod run;
pub mod slots;
pub mod topology;

use pairsched_core::store::MongoStore;
use pairsched_core::{Config, Result};

/// Load the environment configuration, reporting failures operator-style.
pub fn load_config() -> Option<Config> {
    match Config::from_env() {
        Ok(cfg) => Some(cfg),
        Err(err) => {
            eprintln!("Error: {err}");
            None
        }
    }
}

/// Connect the node's measurement store from the configuration.
pub fn connect_store(cfg: &Config) -> Result<MongoStore> {
    MongoStore::connect(&cfg.store_url, &cfg.node_name)
}
