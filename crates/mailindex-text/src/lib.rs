//! Mailindex Text — inverted full-text index for mail folders
//!
//! Maps words to the names of the documents (messages) containing them,
//! stored in a block file and a posting log from `mailindex-core`.
//!
//! # Example
//!
//! ```no_run
//! use mailindex_core::OpenMode;
//! use mailindex_text::TextIndex;
//!
//! let index = TextIndex::open("/tmp/inbox", OpenMode::Create)?;
//!
//! let mut message = index.add_name("1042")?;
//! message.add_buffer(b"Lunch on Friday? The usual place.");
//! index.write_name(message)?;
//! index.sync()?;
//!
//! for name in index.find("friday")? {
//!     println!("found in {}", name?);
//! }
//! # Ok::<(), mailindex_core::IndexError>(())
//! ```

pub mod compaction;
pub mod config;
pub mod cursor;
pub mod index;
pub mod name;
pub mod root;
pub mod validate;
mod word_cache;

pub use compaction::CompactionResult;
pub use config::{CacheTuning, IndexConfig, Normalizer};
pub use cursor::{KeyCursor, PostingCursor};
pub use index::TextIndex;
pub use name::IndexName;
pub use validate::{IndexInfo, ValidationIssue, ValidationReport};
