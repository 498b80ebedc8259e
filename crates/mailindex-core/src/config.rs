//! Configuration management for the block store
//!
//! Provides cache presets for the two phases an index goes through (bulk
//! indexing and steady-state reading) and a validator for custom values.

/// Default number of resident blocks per store
pub const DEFAULT_BLOCK_CACHE_LIMIT: usize = 256;

/// Default number of simultaneously open file descriptors per registry
pub const DEFAULT_MAX_OPEN_FILES: usize = 10;

/// Block store configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Resident blocks kept in the LRU cache before unreferenced ones are evicted
    pub block_cache_limit: usize,
    /// Open descriptors allowed across all files sharing one registry
    pub max_open_files: usize,
}

impl Config {
    /// Bulk indexing: a large block cache so split-heavy workloads stay in RAM
    pub fn indexing() -> Self {
        Self {
            block_cache_limit: 1024,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
        }
    }

    /// Reading after a sync: lookups touch few blocks
    pub fn reading() -> Self {
        Self {
            block_cache_limit: 128,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.block_cache_limit == 0 {
            return Err("block_cache_limit must be > 0".into());
        }
        if self.block_cache_limit > 1 << 20 {
            return Err("block_cache_limit must be <= 1048576".into());
        }
        if self.max_open_files < 2 {
            return Err("max_open_files must be >= 2 (a store and its log)".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_cache_limit: DEFAULT_BLOCK_CACHE_LIMIT,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_presets_valid() {
        assert!(Config::default().validate().is_ok());
        assert!(Config::indexing().validate().is_ok());
        assert!(Config::reading().validate().is_ok());
    }

    #[test]
    fn test_preset_ordering() {
        assert!(Config::indexing().block_cache_limit > Config::default().block_cache_limit);
        assert!(Config::default().block_cache_limit > Config::reading().block_cache_limit);
    }

    #[test]
    fn test_rejects_empty_cache() {
        let mut config = Config::default();
        config.block_cache_limit = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.max_open_files = 1;
        assert!(config.validate().is_err());
    }
}
