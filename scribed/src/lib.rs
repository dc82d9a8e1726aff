//! Scribed, the Scribe index daemon.
//!
//! This crate is thin glue around [`scribe_state`]: it parses the TOML
//! configuration, wires OS signals into the engine's interrupt, and
//! dispatches the operational entry points (repair, rollback, backfill,
//! UTXO fix, statistics) or the continuous sync loop.
//!
//! Per-coin daemons embed [`daemon::run_with_source`] with their own
//! [`scribe_state::ChainSource`] and [`scribe_state::ChainParser`]
//! implementations; the stock binary only performs operations that need
//! no chain connection.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod daemon;
pub mod error;

pub use config::{Cli, ScribedConfig};
pub use error::ScribedError;
