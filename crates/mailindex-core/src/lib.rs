//! Mailindex Core — paged storage primitives for mail indexing
//!
//! Everything an on-disk mail index is built from, with no knowledge of
//! words or documents:
//!
//! - **BlockFile**: 1024-byte blocks, LRU block cache, free list, and a root
//!   block whose sync flag marks the file clean
//! - **KeyFile**: append-only log of u32 record arrays linked into chains
//! - **PartitionTable**: hash-partitioned map from string keys to ids
//! - **KeyTable**: append-only table of (key, data, flags) entries
//! - **FileRegistry**: caps open descriptors across all of the above
//!
//! The text index in `mailindex-text` combines these into an inverted index.

pub mod block_file;
pub mod config;
pub mod error;
pub mod format;
pub mod key_file;
pub mod key_table;
pub mod partition;
pub mod platform_durability;
pub mod registry;

// Re-export key types for convenience
pub use block_file::{Block, BlockFile, OpenMode};
pub use config::Config;
pub use error::{IndexError, IndexResult};
pub use key_file::KeyFile;
pub use key_table::{KeyRecord, KeyTable};
pub use partition::{hash_key, PartitionTable};
pub use registry::{FileRegistry, ManagedFile};
