//! Registry-driven protocol orchestration for a distributed RPC framework.
//!
//! # Modules
//!
//! - [`extension`]: the SPI-style plug-in registry every other layer
//!   resolves implementations through (adaptive proxies, activation sets,
//!   descriptor-file discovery).
//! - [`registry`]: the Registry Facade over a pluggable naming-service
//!   client, with idempotent register/subscribe and failback retry.
//! - [`provider`]: the Provider Export Pipeline — local export, dynamic
//!   configuration application, and registration.
//! - [`consumer`]: the Consumer Refer Pipeline — directory, router chain,
//!   cluster strategy, load balancing.
//! - [`configurator`] / [`config_listener`] / [`config_reload`]: the
//!   dynamic-configuration stack that feeds overrides back into both
//!   pipelines.
//! - [`filter`]: the provider/consumer filter chain builder.
//! - [`protocol`]: the transport-level export/refer seam.
//! - [`service_key`]: the `group/interface:version` identity used for
//!   per-service configuration and cache keys.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod config_listener;
pub mod config_reload;
pub mod configurator;
pub mod consumer;
pub mod error;
pub mod extension;
pub mod filter;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod service_key;

pub use error::{Error, Result};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Setup tracing/logging
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
