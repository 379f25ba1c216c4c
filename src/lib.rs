//! Vault lifecycle monitor.
//!
//! Watches a vault factory for new vaults, tracks each vault's cap, supply and
//! maturity, and notifies on creation, cap raises, and fill transitions.
//! Shared by the `vaultwatch` daemon and the `live_vaults` one-shot query.

pub mod api;
pub mod chain;
pub mod config;
pub mod notify;
pub mod query;
pub mod store;
pub mod tracker;
pub mod vault;

use crate::config::LoggingConfig;

/// Install the global tracing subscriber. `RUST_LOG` wins over `level`.
pub fn init_tracing(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }
}
