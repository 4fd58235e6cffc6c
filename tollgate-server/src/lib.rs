//! The tollgate server: configuration, gateway assembly and operator
//! commands behind the `tollgate` binary.
//!
//! # Modules
//!
//! - [`config`] - TOML configuration with environment variable expansion
//! - [`app`] - Builds the gateway and runs maintenance sweeps
//! - [`admin`] - Provisioning, credits, payouts and reconciliation commands
//! - [`cli`] - Command line definition
//! - [`util`] - Graceful shutdown

pub mod admin;
pub mod app;
pub mod cli;
pub mod config;
pub mod util;
