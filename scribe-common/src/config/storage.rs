//! Storage configuration types shared across Scribe services.

use std::path::PathBuf;

/// Cache configuration for the in-memory transaction cache.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct CacheConfig {
    /// Capacity of the map used for caching.
    pub capacity: usize,
    /// Power of 2 for number of shards (e.g., 4 means 16 shards).
    ///
    /// The actual shard count will be 2^shard_power.
    pub shard_power: u8,
}

impl CacheConfig {
    /// Get the actual number of shards (2^shard_power).
    pub fn shard_count(&self) -> usize {
        2usize.pow(self.shard_power.into())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            shard_power: 4,
        }
    }
}

/// Database size limit configuration.
///
/// This enum provides a clean TOML interface and easy extensibility for different units.
#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseSize {
    /// Limited to a specific size in GB.
    Gb(usize),
}

impl Default for DatabaseSize {
    fn default() -> Self {
        DatabaseSize::Gb(256)
    }
}

impl PartialEq for DatabaseSize {
    fn eq(&self, other: &Self) -> bool {
        self.to_byte_count() == other.to_byte_count()
    }
}

impl DatabaseSize {
    /// Convert to bytes.
    pub fn to_byte_count(&self) -> usize {
        match self {
            DatabaseSize::Gb(gb) => gb * 1024 * 1024 * 1024,
        }
    }
}

/// Database configuration.
///
/// Configures the file path and size limits for the persistent index.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct DatabaseConfig {
    /// Database directory path.
    pub path: PathBuf,
    /// Database size limit. Defaults to 256 GB.
    #[serde(default)]
    pub size: DatabaseSize,
    /// Maximum number of concurrent environment readers.
    ///
    /// 0 selects an automatic value derived from the CPU count.
    #[serde(default)]
    pub max_readers: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./scribe_index"),
            size: DatabaseSize::default(),
            max_readers: 0,
        }
    }
}

/// Storage configuration combining cache and database settings.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize, Default)]
pub struct StorageConfig {
    /// Cache configuration. Uses defaults if not specified in TOML.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Database configuration.
    pub database: DatabaseConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_count_is_a_power_of_two() {
        let config = CacheConfig {
            capacity: 1,
            shard_power: 6,
        };
        assert_eq!(config.shard_count(), 64);
    }

    #[test]
    fn database_size_round_trips_and_compares_by_bytes() {
        let size: DatabaseSize = serde_json::from_str(r#"{"gb":64}"#).unwrap();
        assert_eq!(size.to_byte_count(), 64 * 1024 * 1024 * 1024);
        assert_eq!(serde_json::to_string(&size).unwrap(), r#"{"gb":64}"#);
        assert_eq!(size, DatabaseSize::Gb(64));
    }

    #[test]
    fn storage_config_deserializes_with_defaults() {
        let config: StorageConfig =
            serde_json::from_str(r#"{"database":{"path":"/tmp/idx"}}"#).unwrap();
        assert_eq!(config.database.path, PathBuf::from("/tmp/idx"));
        assert_eq!(config.database.size, DatabaseSize::default());
        assert_eq!(config.cache.capacity, CacheConfig::default().capacity);
    }
}
