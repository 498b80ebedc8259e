//! Open-descriptor registry shared by block stores and record logs
//!
//! Every store or log registers a weak handle here. Before a file opens its
//! descriptor it asks the registry for room; when more than `limit`
//! descriptors are open the least recently used *other* files are asked to
//! close. A file that is busy (any of its locks held) refuses and is skipped,
//! so eviction never blocks on another file.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::{Config, DEFAULT_MAX_OPEN_FILES};

/// Identifier handed out by [`FileRegistry::register`]
pub type FileId = u64;

/// A file whose descriptor can be closed on demand and reopened lazily.
pub trait ManagedFile: Send + Sync {
    /// Close the descriptor if every lock can be taken without waiting.
    /// Returns true when the descriptor is closed afterwards.
    fn try_close(&self) -> bool;

    /// Path for diagnostics
    fn display_name(&self) -> String;
}

struct Entry {
    id: FileId,
    file: Weak<dyn ManagedFile>,
    open: bool,
}

/// LRU of registered files, least recently used first
pub struct FileRegistry {
    entries: Mutex<Vec<Entry>>,
    limit: usize,
    next_id: AtomicU64,
}

impl FileRegistry {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            limit: limit.max(1),
            next_id: AtomicU64::new(1),
        })
    }

    /// Registry sized by `config.max_open_files`
    pub fn with_config(config: &Config) -> Arc<Self> {
        Self::new(config.max_open_files)
    }

    /// Process-wide registry with the default descriptor limit
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<FileRegistry>> = OnceLock::new();
        SHARED.get_or_init(|| FileRegistry::new(DEFAULT_MAX_OPEN_FILES)).clone()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Register a file. It starts out closed.
    pub fn register(&self, file: Weak<dyn ManagedFile>) -> FileId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push(Entry { id, file, open: false });
        id
    }

    pub fn unregister(&self, id: FileId) {
        self.entries.lock().retain(|e| e.id != id);
    }

    /// Close least recently used files until one more descriptor fits.
    /// `except` is the caller, which is never asked to close itself.
    pub fn make_room(&self, except: Option<FileId>) {
        // Candidates are upgraded under the registry lock but closed after it
        // is released: try_close and a final drop both re-enter the registry.
        let candidates: Vec<(FileId, Arc<dyn ManagedFile>)>;
        let mut excess;
        {
            let entries = self.entries.lock();
            let open = entries.iter().filter(|e| e.open).count();
            if open < self.limit {
                return;
            }
            excess = open + 1 - self.limit;
            candidates = entries
                .iter()
                .filter(|e| e.open && Some(e.id) != except)
                .filter_map(|e| e.file.upgrade().map(|f| (e.id, f)))
                .collect();
        }

        for (id, file) in &candidates {
            if excess == 0 {
                break;
            }
            if file.try_close() {
                debug!(file = %file.display_name(), "closed idle descriptor");
                self.mark(*id, false);
                excess -= 1;
            }
        }
    }

    /// Record that `id` opened its descriptor and move it to the MRU end
    pub fn opened(&self, id: FileId) {
        self.mark(id, true);
    }

    /// Record that `id` closed its descriptor
    pub fn closed(&self, id: FileId) {
        self.mark(id, false);
    }

    /// Move `id` to the most recently used end
    pub fn used(&self, id: FileId) {
        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().position(|e| e.id == id) {
            if pos + 1 != entries.len() {
                let entry = entries.remove(pos);
                entries.push(entry);
            }
        }
    }

    /// Number of registered files with an open descriptor
    pub fn open_count(&self) -> usize {
        self.entries.lock().iter().filter(|e| e.open).count()
    }

    fn mark(&self, id: FileId, open: bool) {
        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().position(|e| e.id == id) {
            let mut entry = entries.remove(pos);
            entry.open = open;
            if open {
                entries.push(entry);
            } else {
                entries.insert(pos, entry);
            }
        }
    }
}

impl std::fmt::Debug for FileRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRegistry")
            .field("limit", &self.limit)
            .field("open", &self.open_count())
            .finish()
    }
}
