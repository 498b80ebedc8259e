//! Inverted text index
//!
//! A text index at `P` keeps its tables in the block store `P.index` and
//! its posting chunks in the log `P.index.data`. Words and document names
//! each get a key table (id -> string, data, flags) and a partition table
//! (string -> id). A word's `data` is the log offset of its newest posting
//! chunk; each chunk links to the previous one.
//!
//! Postings are buffered per word in a write-back cache and appended to the
//! log when a word collects a full batch, when it is evicted, or on sync.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mailindex_core::{
    BlockFile, Config, FileRegistry, IndexError, IndexResult, KeyFile, KeyTable, OpenMode, PartitionTable,
};
use mailindex_core::platform_durability::sync_log_then_store;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::compaction::CompactionResult;
use crate::config::IndexConfig;
use crate::cursor::{KeyCursor, KeyKind, PostingCursor, NAME_DELETED};
use crate::name::IndexName;
use crate::root::{log_path, store_path, TextRoot, POSTING_VERSION, TEXT_VERSION};
use crate::validate::IndexInfo;
use crate::word_cache::{PendingWord, WordCache};

/// Open files and tables of one index. Replaced as a whole by a rebuild.
pub(crate) struct IndexParts {
    pub word_index: KeyTable,
    pub word_hash: PartitionTable,
    pub name_index: KeyTable,
    pub name_hash: PartitionTable,
    pub links: Arc<KeyFile>,
    pub blocks: Arc<BlockFile>,
}

impl IndexParts {
    /// Open the store and log of `path`, creating the tables when the root
    /// has none yet.
    pub fn open(
        path: &Path,
        mode: OpenMode,
        config: &IndexConfig,
        registry: Arc<FileRegistry>,
    ) -> IndexResult<(Self, TextRoot)> {
        let blocks = BlockFile::open(store_path(path), mode, TEXT_VERSION, &config.store, registry.clone())?;
        let links = KeyFile::open(log_path(path), mode, POSTING_VERSION, registry)?;

        let root_block = blocks.root_block();
        let mut root = TextRoot::decode(&root_block.read()[..]);
        if !root.has_tables() {
            if !mode.is_writable() {
                return Err(IndexError::corrupt(blocks.path(), 0, "text index tables missing"));
            }
            for slot in [
                &mut root.word_index_root,
                &mut root.word_hash_root,
                &mut root.name_index_root,
                &mut root.name_hash_root,
            ] {
                if *slot == 0 {
                    *slot = blocks.new_block()?.id();
                }
            }
            root.encode(&mut root_block.write()[..]);
            blocks.touch_block(&root_block)?;
        }

        let parts = Self {
            word_index: KeyTable::open(blocks.clone(), root.word_index_root)?,
            word_hash: PartitionTable::open(blocks.clone(), root.word_hash_root)?,
            name_index: KeyTable::open(blocks.clone(), root.name_index_root)?,
            name_hash: PartitionTable::open(blocks.clone(), root.name_hash_root)?,
            links,
            blocks,
        };
        Ok((parts, root))
    }

    /// Copy the counters into the root block
    pub fn write_root(&self, root: &TextRoot) -> IndexResult<()> {
        let block = self.blocks.root_block();
        root.encode(&mut block.write()[..]);
        self.blocks.touch_block(&block)
    }

    pub fn sync_tables(&self) -> IndexResult<()> {
        self.word_index.sync()?;
        self.word_hash.sync()?;
        self.name_index.sync()?;
        self.name_hash.sync()
    }

    /// The log goes first so the store is never marked clean ahead of
    /// the postings its words point at.
    pub fn sync_files(&self) -> IndexResult<()> {
        sync_log_then_store(&self.links, &self.blocks)
    }

    /// Move both files to the companions of `path`. A failed log rename
    /// moves the store back.
    pub fn rename(&self, path: &Path) -> IndexResult<()> {
        let old_store = self.blocks.path();
        self.blocks.rename(store_path(path))?;
        if let Err(err) = self.links.rename(log_path(path)) {
            if let Err(undo) = self.blocks.rename(&old_store) {
                warn!(path = %old_store.display(), error = %undo, "failed to restore index store name");
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn delete(&self) -> IndexResult<()> {
        let store = self.blocks.delete();
        let log = self.links.delete();
        store.and(log)
    }
}

pub(crate) struct IndexState {
    /// Logical path `P`
    pub path: PathBuf,
    pub parts: Arc<IndexParts>,
    pub root: TextRoot,
    pub cache: WordCache,
    pub word_cache_limit: usize,
}

/// Inverted index from words to document names
pub struct TextIndex {
    pub(crate) config: IndexConfig,
    pub(crate) registry: Arc<FileRegistry>,
    mode: OpenMode,
    state: Mutex<IndexState>,
}

impl TextIndex {
    /// Open the index at `path` with the default configuration
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> IndexResult<Self> {
        Self::open_with_config(path, mode, IndexConfig::default())
    }

    pub fn open_with_config(path: impl AsRef<Path>, mode: OpenMode, config: IndexConfig) -> IndexResult<Self> {
        config.validate().map_err(IndexError::InvalidArgument)?;
        let path = path.as_ref().to_path_buf();
        let registry = config.registry();
        let (parts, root) = IndexParts::open(&path, mode, &config, registry.clone())?;

        debug!(
            path = %path.display(),
            words = root.words,
            names = root.names,
            deleted = root.deleted,
            chunks = root.keys,
            "opened text index"
        );

        let word_cache_limit = config.word_cache_limit;
        Ok(Self {
            config,
            registry,
            mode,
            state: Mutex::new(IndexState {
                path,
                parts: Arc::new(parts),
                root,
                cache: WordCache::new(),
                word_cache_limit,
            }),
        })
    }

    /// Succeeds when the index at `path` exists, was synced and has its
    /// tables. Opens nothing for writing.
    pub fn check(path: impl AsRef<Path>) -> IndexResult<()> {
        let path = path.as_ref();
        let registry = FileRegistry::shared();
        let blocks = BlockFile::open(store_path(path), OpenMode::ReadOnly, TEXT_VERSION, &Config::reading(), registry.clone())?;
        KeyFile::open(log_path(path), OpenMode::ReadOnly, POSTING_VERSION, registry)?;
        if !TextRoot::decode(&blocks.root_block().read()[..]).has_tables() {
            return Err(IndexError::corrupt(blocks.path(), 0, "text index tables missing"));
        }
        Ok(())
    }

    /// Rename the files of a closed index. Missing files are skipped; if
    /// the log cannot be renamed the store is moved back.
    pub fn rename_files(old: impl AsRef<Path>, new: impl AsRef<Path>) -> IndexResult<()> {
        let (old, new) = (old.as_ref(), new.as_ref());
        let (old_store, new_store) = (store_path(old), store_path(new));
        let store_moved = match std::fs::rename(&old_store, &new_store) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(IndexError::io(&old_store, e, "Failed to rename index store")),
        };

        let old_log = log_path(old);
        match std::fs::rename(&old_log, log_path(new)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                if store_moved {
                    if let Err(undo) = std::fs::rename(&new_store, &old_store) {
                        warn!(path = %new_store.display(), error = %undo, "failed to restore index store name");
                    }
                }
                Err(IndexError::io(&old_log, e, "Failed to rename index log"))
            }
        }
    }

    /// Unlink the files of a closed index, ignoring missing ones
    pub fn remove_files(path: impl AsRef<Path>) -> IndexResult<()> {
        let path = path.as_ref();
        let mut result = Ok(());
        for file in [store_path(path), log_path(path)] {
            match std::fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    if result.is_ok() {
                        result = Err(IndexError::io(&file, e, "Failed to remove index file"));
                    }
                }
            }
        }
        result
    }

    pub fn path(&self) -> PathBuf {
        self.state.lock().path.clone()
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Whether a live document is stored under `name`
    pub fn has_name(&self, name: &str) -> IndexResult<bool> {
        let parts = self.parts();
        Ok(parts.name_hash.lookup(name)? != 0)
    }

    /// Start a document. An existing document of the same name is
    /// superseded: its entry is flagged deleted and its postings are
    /// hidden from then on.
    pub fn add_name(&self, name: &str) -> IndexResult<IndexName> {
        self.check_writable()?;
        let mut state = self.lock();
        let parts = state.parts.clone();

        let tuning = self.config.indexing_cache;
        parts.blocks.set_cache_limit(tuning.block_cache_limit);
        state.word_cache_limit = tuning.word_cache_limit;

        let old = parts.name_hash.lookup(name)?;
        if old != 0 {
            parts.name_index.set_flags(old, NAME_DELETED, NAME_DELETED)?;
            parts.name_hash.remove(name)?;
            state.root.deleted += 1;
            trace!(document = name, old, "superseding document");
        }

        let name_id = parts.name_index.add(name, 0, 0)?;
        parts.name_hash.add(name, name_id)?;
        state.root.names += 1;
        parts.write_root(&state.root)?;

        Ok(IndexName::new(
            name.to_string(),
            name_id,
            self.config.normalizer.clone(),
            self.config.max_word_len,
        ))
    }

    /// Hide a document. Deleting a missing name does nothing.
    pub fn delete_name(&self, name: &str) -> IndexResult<()> {
        self.check_writable()?;
        let mut state = self.lock();
        let parts = state.parts.clone();

        let id = parts.name_hash.lookup(name)?;
        if id == 0 {
            return Ok(());
        }
        parts.name_index.set_flags(id, NAME_DELETED, NAME_DELETED)?;
        parts.name_hash.remove(name)?;
        state.root.deleted += 1;
        parts.write_root(&state.root)
    }

    /// Finish a document: its trailing partial word is indexed and the
    /// document is posted under every word it collected. A failure stops
    /// at the word that failed; postings already buffered stay buffered.
    pub fn write_name(&self, mut name: IndexName) -> IndexResult<()> {
        name.finish();
        let words = name.take_words();
        if words.is_empty() {
            return Ok(());
        }
        self.check_writable()?;

        let mut state = self.lock();
        for word in &words {
            self.add_posting(&mut state, word, name.name_id())?;
        }
        Ok(())
    }

    /// Documents containing `word`, newest postings first
    pub fn find(&self, word: &str) -> IndexResult<PostingCursor> {
        let word = (self.config.normalizer)(word);
        let state = self.lock();
        let parts = state.parts.clone();

        // ids still pending in the cache are not visible until flushed
        let head = match state.cache.get(&word) {
            Some(pending) => pending.data,
            None => {
                let id = parts.word_hash.lookup(&word)?;
                if id == 0 {
                    return Ok(PostingCursor::empty(parts));
                }
                parts.word_index.lookup(id)?.data
            }
        };
        drop(state);
        Ok(PostingCursor::new(parts, head))
    }

    /// Every indexed word
    pub fn words(&self) -> IndexResult<KeyCursor> {
        Ok(KeyCursor::new(self.parts(), KeyKind::Words))
    }

    /// Every live document name
    pub fn names(&self) -> IndexResult<KeyCursor> {
        Ok(KeyCursor::new(self.parts(), KeyKind::Names))
    }

    /// Flush buffered postings and write everything out. Rebuilds the
    /// index afterwards when it has become too fragmented.
    pub fn sync(&self) -> IndexResult<()> {
        let mut state = self.lock();
        self.sync_locked(&mut state, true)
    }

    /// Sync, then rebuild regardless of fragmentation
    pub fn compress(&self) -> IndexResult<CompactionResult> {
        self.check_writable()?;
        let mut state = self.lock();
        self.sync_locked(&mut state, false)?;
        self.compact_locked(&mut state)
    }

    /// Rename the open index to `path`
    pub fn rename(&self, path: impl AsRef<Path>) -> IndexResult<()> {
        let path = path.as_ref().to_path_buf();
        let mut state = self.lock();
        state.parts.rename(&path)?;
        debug!(from = %state.path.display(), to = %path.display(), "renamed text index");
        state.path = path;
        Ok(())
    }

    /// Unlink the index files. Buffered postings are discarded and every
    /// later operation fails with `Deleted`.
    pub fn delete(&self) -> IndexResult<()> {
        let mut state = self.lock();
        state.cache.clear();
        debug!(path = %state.path.display(), "deleting text index");
        state.parts.delete()
    }

    /// Counters and cache occupancy
    pub fn info(&self) -> IndexInfo {
        let state = self.lock();
        IndexInfo {
            path: state.path.clone(),
            words: state.root.words,
            names: state.root.names,
            deleted_names: state.root.deleted,
            chunks: state.root.keys,
            word_fragmentation: state.root.word_fragmentation(),
            name_fragmentation: state.root.name_fragmentation(),
            blocks: state.parts.blocks.block_count(),
            log_bytes: state.parts.links.last() as u64,
            cached_words: state.cache.len(),
            pending_postings: state.cache.pending_ids(),
            cached_blocks: state.parts.blocks.cached_blocks(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock()
    }

    fn parts(&self) -> Arc<IndexParts> {
        self.lock().parts.clone()
    }

    fn check_writable(&self) -> IndexResult<()> {
        if !self.mode.is_writable() {
            return Err(IndexError::ReadOnly { path: store_path(&self.path()) });
        }
        Ok(())
    }

    /// Buffer `name_id` under `word`, registering the word when new
    fn add_posting(&self, state: &mut IndexState, word: &str, name_id: u32) -> IndexResult<()> {
        let parts = state.parts.clone();

        let created = if state.cache.get_mut(word).is_some() {
            false
        } else {
            let pending = self.load_word(state, &parts, word)?;
            state.cache.insert(word.to_string(), pending);
            true
        };

        if let Some(pending) = state.cache.peek_mut(word) {
            pending.ids.push(name_id);
            if pending.ids.len() >= self.config.posting_batch {
                flush_pending(&parts, &mut state.root, pending)?;
                parts.write_root(&state.root)?;
            }
        }

        if created && state.cache.len() > state.word_cache_limit {
            self.evict_words(state, &parts, word)?;
        }
        Ok(())
    }

    /// Cache entry for a word not in the cache: its id and chain head,
    /// adding it to the word tables when it is new
    fn load_word(&self, state: &mut IndexState, parts: &IndexParts, word: &str) -> IndexResult<PendingWord> {
        let word_id = parts.word_hash.lookup(word)?;
        if word_id != 0 {
            let record = parts.word_index.lookup(word_id)?;
            return Ok(PendingWord {
                word_id,
                data: record.data,
                ids: Vec::new(),
            });
        }

        let word_id = parts.word_index.add(word, 0, 0)?;
        parts.word_hash.add(word, word_id)?;
        state.root.words += 1;
        parts.write_root(&state.root)?;
        Ok(PendingWord {
            word_id,
            data: 0,
            ids: Vec::new(),
        })
    }

    /// Flush least recently used words until the cache fits its limit.
    /// Words whose flush fails stay cached; the first failure is returned.
    fn evict_words(&self, state: &mut IndexState, parts: &IndexParts, keep: &str) -> IndexResult<()> {
        let excess = state.cache.len().saturating_sub(state.word_cache_limit);
        let mut first_err = None;
        for word in state.cache.oldest(excess + 1) {
            if state.cache.len() <= state.word_cache_limit {
                break;
            }
            if word == keep {
                continue;
            }
            let Some(pending) = state.cache.peek_mut(&word) else { continue };
            match flush_pending(parts, &mut state.root, pending) {
                Ok(()) => {
                    state.cache.remove(&word);
                }
                Err(err) => {
                    warn!(word = %word, error = %err, "failed to flush evicted word");
                    first_err.get_or_insert(err);
                }
            }
        }
        parts.write_root(&state.root)?;
        first_err.map_or(Ok(()), Err)
    }

    /// Flush every cached word, oldest first. Flushed words leave the cache.
    fn flush_cache(&self, state: &mut IndexState, parts: &IndexParts) -> IndexResult<()> {
        let mut first_err = None;
        let mut flushed = 0usize;
        for word in state.cache.words_by_age() {
            let Some(pending) = state.cache.peek_mut(&word) else { continue };
            if !pending.ids.is_empty() {
                if let Err(err) = flush_pending(parts, &mut state.root, pending) {
                    warn!(word = %word, error = %err, "failed to flush word postings");
                    first_err.get_or_insert(err);
                    continue;
                }
                flushed += 1;
            }
            state.cache.remove(&word);
        }
        if flushed > 0 {
            trace!(words = flushed, "flushed word cache");
        }
        first_err.map_or(Ok(()), Err)
    }

    pub(crate) fn sync_locked(&self, state: &mut IndexState, allow_compaction: bool) -> IndexResult<()> {
        if !self.mode.is_writable() {
            return Ok(());
        }
        let parts = state.parts.clone();
        if parts.blocks.is_deleted() {
            return Err(IndexError::Deleted { path: parts.blocks.path() });
        }

        let tuning = self.config.reading_cache;
        parts.blocks.set_cache_limit(tuning.block_cache_limit);
        state.word_cache_limit = tuning.word_cache_limit;

        let mut result = self.flush_cache(state, &parts);
        for step in [parts.write_root(&state.root), parts.sync_tables()] {
            if let Err(err) = step {
                result = result.and(Err(err));
            }
        }

        if result.is_ok() && allow_compaction {
            let word_frag = state.root.word_fragmentation();
            let name_frag = state.root.name_fragmentation();
            if word_frag > self.config.word_fragmentation_threshold
                || name_frag > self.config.name_fragmentation_threshold
            {
                debug!(
                    path = %state.path.display(),
                    word_frag,
                    name_frag,
                    "text index fragmented, compacting"
                );
                if let Err(err) = self.compact_locked(state) {
                    warn!(path = %state.path.display(), error = %err, "compaction failed, keeping current index");
                }
            }
        }

        let parts = state.parts.clone();
        result.and(parts.sync_files())
    }
}

/// Append a word's pending ids as one chunk and point the word at it. On
/// failure to append, the ids stay pending.
fn flush_pending(parts: &IndexParts, root: &mut TextRoot, pending: &mut PendingWord) -> IndexResult<()> {
    if pending.ids.is_empty() {
        return Ok(());
    }
    let mut data = pending.data;
    parts.links.write(&mut data, &pending.ids)?;
    pending.data = data;
    pending.ids.clear();
    root.keys += 1;
    parts.word_index.set_data(pending.word_id, data)
}

impl Drop for TextIndex {
    fn drop(&mut self) {
        if !self.mode.is_writable() {
            return;
        }
        let mut state = self.state.lock();
        if state.parts.blocks.is_deleted() {
            return;
        }
        if let Err(err) = self.sync_locked(&mut state, false) {
            warn!(path = %state.path.display(), error = %err, "failed to sync text index on close");
        }
    }
}

impl std::fmt::Debug for TextIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TextIndex")
            .field("path", &state.path)
            .field("mode", &self.mode)
            .field("root", &state.root)
            .field("cached_words", &state.cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config() -> IndexConfig {
        IndexConfig::compact().with_registry(FileRegistry::new(10))
    }

    #[test]
    fn test_fresh_index_allocates_tables() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("folder");
        let index = TextIndex::open_with_config(&path, OpenMode::Create, config()).unwrap();

        let state = index.lock();
        assert!(state.root.has_tables());
        let roots = [
            state.root.word_index_root,
            state.root.word_hash_root,
            state.root.name_index_root,
            state.root.name_hash_root,
        ];
        let distinct: std::collections::HashSet<u32> = roots.iter().copied().collect();
        assert_eq!(distinct.len(), 4);
        drop(state);
        drop(index);

        // the same roots come back on reopen
        let index = TextIndex::open_with_config(&path, OpenMode::ReadWrite, config()).unwrap();
        let state = index.lock();
        assert_eq!(state.root.word_index_root, roots[0]);
        assert_eq!(state.root.name_hash_root, roots[3]);
    }

    #[test]
    fn test_read_only_requires_tables() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("folder");
        let registry = FileRegistry::new(10);
        {
            let blocks = BlockFile::open(store_path(&path), OpenMode::Create, TEXT_VERSION, &Config::default(), registry.clone()).unwrap();
            KeyFile::open(log_path(&path), OpenMode::Create, POSTING_VERSION, registry.clone()).unwrap();
            blocks.sync().unwrap();
        }
        let result = TextIndex::open_with_config(&path, OpenMode::ReadOnly, config());
        assert!(matches!(result, Err(IndexError::Corrupt { .. })));
    }

    #[test]
    fn test_document_without_words() {
        let dir = TempDir::new().unwrap();
        let index = TextIndex::open_with_config(dir.path().join("folder"), OpenMode::Create, config()).unwrap();

        let doc = index.add_name("empty").unwrap();
        index.write_name(doc).unwrap();
        let info = index.info();
        assert_eq!(info.names, 1);
        assert_eq!(info.words, 0);
        assert!(index.has_name("empty").unwrap());
    }

    #[test]
    fn test_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let mut bad = config();
        bad.posting_batch = 0;
        let result = TextIndex::open_with_config(dir.path().join("folder"), OpenMode::Create, bad);
        assert!(matches!(result, Err(IndexError::InvalidArgument(_))));
    }

    #[test]
    fn test_batch_flush_advances_word_data() {
        let dir = TempDir::new().unwrap();
        let mut config = config();
        config.posting_batch = 4;
        let index = TextIndex::open_with_config(dir.path().join("folder"), OpenMode::Create, config).unwrap();

        for i in 0..9 {
            let mut doc = index.add_name(&format!("msg-{}", i)).unwrap();
            doc.add_word("common");
            index.write_name(doc).unwrap();
        }

        let state = index.lock();
        let pending = state.cache.get("common").unwrap();
        assert_eq!(pending.ids.len(), 1);
        assert_eq!(state.root.keys, 2);
        let stored = state.parts.word_index.lookup(pending.word_id).unwrap();
        assert_eq!(stored.data, pending.data);
        assert_ne!(stored.data, 0);
    }
}
