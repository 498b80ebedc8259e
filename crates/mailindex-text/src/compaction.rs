//! Compaction: rebuild an index without its dead entries
//!
//! Deleted and superseded names keep their postings until the index is
//! rebuilt, and a word indexed a few documents at a time accumulates many
//! small chunks. A rebuild writes a fresh index next to the live one:
//!
//! 1. Copy every live name into the new index, remembering old id -> new id
//! 2. Replay each word's chain through that map, dropping ids of dead
//!    names, and append the survivors in dense chunks
//! 3. Register only words that kept at least one posting
//! 4. Sync the new files
//! 5. Park the old files at `P~`, move the new ones to `P` and swap the
//!    live index over to them
//! 6. Delete the parked files
//!
//! Until step 5 the live index is untouched, and a failure in step 5 puts
//! the old files back. The scratch files are removed on any failure.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use mailindex_core::platform_durability::sync_parent;
use mailindex_core::{IndexError, IndexResult, OpenMode};
use tracing::{debug, warn};

use crate::cursor::NAME_DELETED;
use crate::index::{IndexParts, IndexState, TextIndex};
use crate::root::{backup_path, rebuild_path, TextRoot};

/// Result of a compaction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactionResult {
    /// Live names copied into the new index
    pub names_kept: u32,
    /// Deleted or superseded names left behind
    pub names_dropped: u32,
    /// Words with at least one surviving posting
    pub words_kept: u32,
    /// Words whose postings all belonged to dead names
    pub words_dropped: u32,
    /// Postings copied
    pub postings_kept: u64,
    /// Postings of dead names
    pub postings_dropped: u64,
    /// Chunks written to the new log
    pub chunks_written: u32,
    /// Store blocks before and after
    pub original_blocks: u32,
    pub compacted_blocks: u32,
    /// Log sizes before and after
    pub original_log_bytes: u64,
    pub compacted_log_bytes: u64,
}

impl CompactionResult {
    /// Share of postings that referenced dead names
    pub fn dead_posting_ratio(&self) -> f64 {
        let total = self.postings_kept + self.postings_dropped;
        if total == 0 {
            return 0.0;
        }
        self.postings_dropped as f64 / total as f64
    }

    /// Bytes reclaimed across the store and the log
    pub fn bytes_saved(&self) -> u64 {
        let block = mailindex_core::format::BLOCK_SIZE as u64;
        let before = self.original_blocks as u64 * block + self.original_log_bytes;
        let after = self.compacted_blocks as u64 * block + self.compacted_log_bytes;
        before.saturating_sub(after)
    }
}

impl TextIndex {
    /// Rebuild the index under the state lock. Pending postings must have
    /// been flushed.
    pub(crate) fn compact_locked(&self, state: &mut IndexState) -> IndexResult<CompactionResult> {
        if state.cache.pending_ids() > 0 {
            return Err(IndexError::InvalidArgument(
                "cannot compact with unflushed postings".to_string(),
            ));
        }

        let started = Instant::now();
        let path = state.path.clone();
        let scratch = rebuild_path(&path);
        let parked = backup_path(&path);
        let old = state.parts.clone();
        debug!(path = %path.display(), scratch = %scratch.display(), "compacting text index");

        TextIndex::remove_files(&scratch)?;
        let built = IndexParts::open(&scratch, OpenMode::Create, &self.config, self.registry.clone())
            .and_then(|(new, mut root)| {
                root.words = 0;
                root.names = 0;
                root.deleted = 0;
                root.keys = 0;
                let mut result = CompactionResult {
                    original_blocks: old.blocks.block_count(),
                    original_log_bytes: old.links.last() as u64,
                    ..CompactionResult::default()
                };
                self.copy_live(&old, &new, &mut root, &mut result)?;
                new.write_root(&root)?;
                new.sync_tables()?;
                new.sync_files()?;
                result.compacted_blocks = new.blocks.block_count();
                result.compacted_log_bytes = new.links.last() as u64;
                Ok((new, root, result))
            });

        let (new, root, result) = match built {
            Ok(built) => built,
            Err(err) => {
                discard_scratch(&scratch);
                return Err(err);
            }
        };

        if let Err(err) = swap_files(&old, &new, &path, &parked) {
            drop(new);
            discard_scratch(&scratch);
            return Err(err);
        }
        if let Err(err) = sync_parent(&path) {
            warn!(path = %path.display(), error = %err, "failed to sync index directory");
        }

        new.blocks.set_cache_limit(old.blocks.cache_limit());
        state.parts = Arc::new(new);
        state.root = root;
        state.cache.clear();

        if let Err(err) = old.delete() {
            warn!(path = %parked.display(), error = %err, "failed to delete replaced index files");
        }

        debug!(
            path = %path.display(),
            names_kept = result.names_kept,
            names_dropped = result.names_dropped,
            words_kept = result.words_kept,
            words_dropped = result.words_dropped,
            chunks = result.chunks_written,
            bytes_saved = result.bytes_saved(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compacted text index"
        );
        Ok(result)
    }

    fn copy_live(
        &self,
        old: &IndexParts,
        new: &IndexParts,
        root: &mut TextRoot,
        result: &mut CompactionResult,
    ) -> IndexResult<()> {
        let mut remap: HashMap<u32, u32> = HashMap::new();
        let mut last = 0;
        while let Some(record) = old.name_index.next(last)? {
            last = record.id;
            if record.flags & NAME_DELETED != 0 {
                result.names_dropped += 1;
                continue;
            }
            let id = new.name_index.add(&record.key, record.data, record.flags)?;
            new.name_hash.add(&record.key, id)?;
            root.names += 1;
            result.names_kept += 1;
            remap.insert(record.id, id);
        }

        let batch_size = self.config.compaction_batch;
        let mut batch = Vec::with_capacity(batch_size);
        let mut last = 0;
        while let Some(record) = old.word_index.next(last)? {
            last = record.id;
            let mut next = record.data;
            let mut head = 0u32;
            let mut chunks = 0u32;
            while next != 0 {
                for id in old.links.read(&mut next)? {
                    let Some(&new_id) = remap.get(&id) else {
                        result.postings_dropped += 1;
                        continue;
                    };
                    result.postings_kept += 1;
                    batch.push(new_id);
                    if batch.len() == batch_size {
                        new.links.write(&mut head, &batch)?;
                        chunks += 1;
                        batch.clear();
                    }
                }
            }
            if !batch.is_empty() {
                new.links.write(&mut head, &batch)?;
                chunks += 1;
                batch.clear();
            }

            if head == 0 {
                result.words_dropped += 1;
                continue;
            }
            let id = new.word_index.add(&record.key, head, 0)?;
            new.word_hash.add(&record.key, id)?;
            root.words += 1;
            root.keys += chunks;
            result.words_kept += 1;
            result.chunks_written += chunks;
        }
        Ok(())
    }
}

/// Park `old` at `parked` and move `new` to `path`, undoing the first
/// step when the second fails
fn swap_files(old: &IndexParts, new: &IndexParts, path: &Path, parked: &Path) -> IndexResult<()> {
    old.rename(parked)?;
    if let Err(err) = new.rename(path) {
        if let Err(undo) = old.rename(path) {
            warn!(path = %path.display(), error = %undo, "failed to restore index files after compaction");
        }
        return Err(err);
    }
    Ok(())
}

fn discard_scratch(scratch: &Path) {
    if let Err(err) = TextIndex::remove_files(scratch) {
        warn!(path = %scratch.display(), error = %err, "failed to remove compaction scratch files");
    }
}
