//! Multi-tenant identity and API gateway.
//!
//! Authenticates callers with signed bearer tokens, tracks sessions across
//! devices, enforces sliding-window rate limits and password/IP policy, and
//! reverse-proxies authenticated traffic to downstream services.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod credential;
pub mod crypto;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod model;
pub mod orchestrator;
pub mod policy;
pub mod ratelimit;
pub mod session;
pub mod store;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global `tracing` subscriber from a log level and optional
/// format override (`"json"` or text).
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
