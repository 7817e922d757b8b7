//! # Bus Telemetry
//!
//! Logging for services embedding the event bus. Every component of the
//! bus logs through `tracing` with structured fields (`topic`,
//! `aggregate_id`, `worker`, ...); this crate installs the subscriber that
//! renders them.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bus_telemetry::{init_logging, TelemetryConfig};
//!
//! let config = TelemetryConfig::from_env().with_service_name("orders");
//! init_logging(&config)?;
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `BUS_SERVICE_NAME` | `event-bus` | Service name in the startup line |
//! | `BUS_LOG_LEVEL` / `RUST_LOG` | `info` | Filter directive |
//! | `BUS_CONSOLE_OUTPUT` | `true` | Write to stdout |
//! | `BUS_JSON_LOGS` | `true` in containers | JSON lines |

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod config;
mod logging;

pub use config::TelemetryConfig;
pub use logging::{build_filter, init_logging};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter '{directive}': {reason}")]
    Filter { directive: String, reason: String },

    #[error("Failed to install subscriber: {0}")]
    Init(String),
}
