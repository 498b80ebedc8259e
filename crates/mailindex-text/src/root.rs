//! Text index root fields and file naming
//!
//! The store's root block carries, after the common header, the block ids
//! of the four tables and the index counters:
//!
//! ```text
//! 24  word key table root      40  words
//! 28  word partition root      44  names
//! 32  name key table root      48  deleted names
//! 36  name partition root      52  posting chunks written
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use mailindex_core::format::{read_u32, write_u32, ROOT_HEADER_SIZE, VERSION_SIZE};

/// Version tag of the index store (`P.index`)
pub const TEXT_VERSION: &[u8; VERSION_SIZE] = b"TEXT.000";

/// Version tag of the posting log (`P.index.data`)
pub const POSTING_VERSION: &[u8; VERSION_SIZE] = b"KEYS.000";

/// Size of the text fields following the common root header
pub const TEXT_ROOT_SIZE: usize = 32;

/// Text index fields of the root block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextRoot {
    pub word_index_root: u32,
    pub word_hash_root: u32,
    pub name_index_root: u32,
    pub name_hash_root: u32,
    pub words: u32,
    pub names: u32,
    pub deleted: u32,
    /// Posting chunks appended to the log
    pub keys: u32,
}

impl TextRoot {
    pub fn decode(buf: &[u8]) -> Self {
        let at = |i: usize| read_u32(buf, ROOT_HEADER_SIZE + i * 4);
        Self {
            word_index_root: at(0),
            word_hash_root: at(1),
            name_index_root: at(2),
            name_hash_root: at(3),
            words: at(4),
            names: at(5),
            deleted: at(6),
            keys: at(7),
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        let fields = [
            self.word_index_root,
            self.word_hash_root,
            self.name_index_root,
            self.name_hash_root,
            self.words,
            self.names,
            self.deleted,
            self.keys,
        ];
        for (i, value) in fields.into_iter().enumerate() {
            write_u32(buf, ROOT_HEADER_SIZE + i * 4, value);
        }
    }

    /// Extra posting chunks per word, `(keys - words) / words`
    pub fn word_fragmentation(&self) -> f64 {
        if self.words == 0 {
            return 0.0;
        }
        (self.keys as f64 - self.words as f64) / self.words as f64
    }

    /// Deleted names per name
    pub fn name_fragmentation(&self) -> f64 {
        if self.names == 0 {
            return 0.0;
        }
        self.deleted as f64 / self.names as f64
    }

    pub(crate) fn has_tables(&self) -> bool {
        self.word_index_root != 0
            && self.word_hash_root != 0
            && self.name_index_root != 0
            && self.name_hash_root != 0
    }
}

/// `P.index`
pub fn store_path(path: &Path) -> PathBuf {
    with_suffix(path, ".index")
}

/// `P.index.data`
pub fn log_path(path: &Path) -> PathBuf {
    with_suffix(path, ".index.data")
}

/// Scratch path a rebuild of `P` is written to: `.#P` beside it
pub(crate) fn rebuild_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(".#");
    name.push(path.file_name().unwrap_or_default());
    path.with_file_name(name)
}

/// Where the files of `P` are parked while a rebuild replaces them: `P~`
pub(crate) fn backup_path(path: &Path) -> PathBuf {
    with_suffix(path, "~")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
