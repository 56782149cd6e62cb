//! Warden Daemon - runtime wiring for the recovery and audit daemons
//!
//! Provides:
//! - [`Runtime`]: every collaborator built from one [`warden_core::WardenConfig`]
//! - Log subscriber setup honouring `RUST_LOG`
//!
//! The `warden` binary is a thin clap front end over this crate.

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod runtime;
pub mod telemetry;

pub use runtime::{connect_bus, exit_code, Runtime, MEMORY_BUS_SCHEME, NATS_BUS_SCHEMES};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
