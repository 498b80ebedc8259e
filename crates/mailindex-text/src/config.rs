//! Text index configuration
//!
//! Wraps the block store [`Config`] with the knobs of the inverted index:
//! the write-back word cache, the cache tuning applied while indexing and
//! after a sync, the compaction triggers and batch sizes, and the word
//! normalizer.

use std::fmt;
use std::sync::Arc;

use mailindex_core::format::{MAX_KEY_SIZE, MAX_LOG_RECORDS};
use mailindex_core::{Config, FileRegistry};

/// Default number of words with pending postings kept in memory
pub const DEFAULT_WORD_CACHE_LIMIT: usize = 4096;

/// Posting ids buffered per word before they are appended to the log
pub const DEFAULT_POSTING_BATCH: usize = 32;

/// Posting ids per log entry when an index is rebuilt
pub const DEFAULT_COMPACTION_BATCH: usize = 256;

/// Longest word (in bytes) the buffer segmenter indexes
pub const DEFAULT_MAX_WORD_LEN: usize = 36;

/// Maps a raw word to the form that is hashed and stored
pub type Normalizer = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Block and word cache sizes applied together
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTuning {
    pub block_cache_limit: usize,
    pub word_cache_limit: usize,
}

/// Inverted text index configuration
#[derive(Clone)]
pub struct IndexConfig {
    /// Block store settings used when the index files are opened
    pub store: Config,
    /// Descriptor registry shared with other indexes; `None` uses the
    /// process-wide registry
    pub registry: Option<Arc<FileRegistry>>,
    /// Word cache size until the first name is added
    pub word_cache_limit: usize,
    /// Applied by `add_name`
    pub indexing_cache: CacheTuning,
    /// Applied by `sync`
    pub reading_cache: CacheTuning,
    /// Compact when (chunks - words) / words exceeds this
    pub word_fragmentation_threshold: f64,
    /// Compact when deleted names / names exceeds this
    pub name_fragmentation_threshold: f64,
    pub posting_batch: usize,
    pub compaction_batch: usize,
    pub max_word_len: usize,
    pub normalizer: Normalizer,
}

impl IndexConfig {
    /// Use `registry` for descriptor accounting
    pub fn with_registry(mut self, registry: Arc<FileRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace the default lower-casing normalizer
    pub fn with_normalizer<F>(mut self, normalizer: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.normalizer = Arc::new(normalizer);
        self
    }

    /// Small caches and eager flushing, for tests and tiny folders
    pub fn compact() -> Self {
        Self {
            store: Config {
                block_cache_limit: 64,
                ..Config::default()
            },
            word_cache_limit: 256,
            indexing_cache: CacheTuning {
                block_cache_limit: 128,
                word_cache_limit: 512,
            },
            reading_cache: CacheTuning {
                block_cache_limit: 32,
                word_cache_limit: 128,
            },
            ..Self::default()
        }
    }

    pub(crate) fn registry(&self) -> Arc<FileRegistry> {
        self.registry.clone().unwrap_or_else(FileRegistry::shared)
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        self.store.validate()?;
        for (what, tuning) in [("indexing_cache", &self.indexing_cache), ("reading_cache", &self.reading_cache)] {
            let store = Config {
                block_cache_limit: tuning.block_cache_limit,
                ..self.store.clone()
            };
            store.validate().map_err(|e| format!("{}: {}", what, e))?;
            if tuning.word_cache_limit == 0 {
                return Err(format!("{}.word_cache_limit must be > 0", what));
            }
        }
        if self.word_cache_limit == 0 {
            return Err("word_cache_limit must be > 0".into());
        }
        for (what, value) in [
            ("word_fragmentation_threshold", self.word_fragmentation_threshold),
            ("name_fragmentation_threshold", self.name_fragmentation_threshold),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("{} must be a non-negative number", what));
            }
        }
        for (what, value) in [("posting_batch", self.posting_batch), ("compaction_batch", self.compaction_batch)] {
            if value == 0 || value > MAX_LOG_RECORDS as usize {
                return Err(format!("{} must be in 1..={}", what, MAX_LOG_RECORDS));
            }
        }
        if self.max_word_len == 0 || self.max_word_len > MAX_KEY_SIZE {
            return Err(format!("max_word_len must be in 1..={}", MAX_KEY_SIZE));
        }
        Ok(())
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            store: Config::default(),
            registry: None,
            word_cache_limit: DEFAULT_WORD_CACHE_LIMIT,
            indexing_cache: CacheTuning {
                block_cache_limit: Config::indexing().block_cache_limit,
                word_cache_limit: 8192,
            },
            reading_cache: CacheTuning {
                block_cache_limit: Config::reading().block_cache_limit,
                word_cache_limit: 1024,
            },
            word_fragmentation_threshold: 0.30,
            name_fragmentation_threshold: 0.20,
            posting_batch: DEFAULT_POSTING_BATCH,
            compaction_batch: DEFAULT_COMPACTION_BATCH,
            max_word_len: DEFAULT_MAX_WORD_LEN,
            normalizer: Arc::new(|word: &str| word.to_lowercase()),
        }
    }
}

impl fmt::Debug for IndexConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexConfig")
            .field("store", &self.store)
            .field("registry", &self.registry)
            .field("word_cache_limit", &self.word_cache_limit)
            .field("indexing_cache", &self.indexing_cache)
            .field("reading_cache", &self.reading_cache)
            .field("word_fragmentation_threshold", &self.word_fragmentation_threshold)
            .field("name_fragmentation_threshold", &self.name_fragmentation_threshold)
            .field("posting_batch", &self.posting_batch)
            .field("compaction_batch", &self.compaction_batch)
            .field("max_word_len", &self.max_word_len)
            .finish_non_exhaustive()
    }
}
