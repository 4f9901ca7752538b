//! ClaraVerse companion bridge library
//!
//! Connects a user's machine to the ClaraVerse cloud over one persistent
//! WebSocket, supervises local tool-provider subprocesses speaking
//! line-delimited JSON over their standard streams, merges their tools into
//! a single catalogue, and executes remote tool invocations against the
//! right provider. A local control socket lets UI clients observe and
//! steer the bridge.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod account;
pub mod auth;
pub mod bridge;
pub mod catalog;
pub mod cli;
pub mod cloud;
pub mod commands;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod provider;
pub mod service;
pub mod tools;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

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
