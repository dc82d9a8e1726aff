//! Configuration types shared across Scribe services.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;

pub use config::{
    CacheConfig, DatabaseConfig, DatabaseSize, ServiceConfig, StorageConfig, SyncConfig,
};
