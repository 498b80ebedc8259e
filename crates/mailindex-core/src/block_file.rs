//! Paged block store
//!
//! A store file is an array of 1024-byte blocks addressed by byte offset.
//! Block 0 is the root: a version tag, a sync flag, the free-list head and
//! the end-of-file pointer, followed by fields owned by whatever format is
//! layered on top.
//!
//! Blocks are shared through [`Block`] handles. The cache keeps one handle to
//! every resident block; a block can only be evicted when the cache's handle
//! is the last one, so a caller never sees two copies of the same block.
//!
//! Crash consistency rests on the root's sync flag: the first modification
//! after a sync clears the flag on disk before any other block is written,
//! and `sync` sets it again once everything is flushed. A store found with
//! the flag clear is reinitialized on open.
//!
//! Lock order: root -> cache -> io -> block data.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::{IndexError, IndexResult};
use crate::format::{
    read_u32, version_string, write_u32, RootHeader, BLOCK_MASK, BLOCK_SIZE, ROOT_FLAG_SYNC,
    VERSION_SIZE,
};
use crate::platform_durability::durable_sync;
use crate::registry::{FileId, FileRegistry, ManagedFile};

/// How a store or log file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
    /// Read-write, creating the file when missing
    Create,
}

impl OpenMode {
    pub fn is_writable(self) -> bool {
        !matches!(self, OpenMode::ReadOnly)
    }

    pub(crate) fn options(self) -> OpenOptions {
        let mut options = OpenOptions::new();
        options.read(true);
        match self {
            OpenMode::ReadOnly => {}
            OpenMode::ReadWrite => {
                options.write(true);
            }
            OpenMode::Create => {
                options.write(true).create(true);
            }
        }
        options
    }

    /// Options for reopening a descriptor closed by the registry. Never
    /// creates: a file that vanished underneath us is an error.
    pub(crate) fn reopen_options(self) -> OpenOptions {
        let mut options = OpenOptions::new();
        options.read(true).write(self.is_writable());
        options
    }
}

struct BlockInner {
    id: u32,
    data: RwLock<[u8; BLOCK_SIZE]>,
    dirty: AtomicBool,
    detached: AtomicBool,
}

/// Shared handle to one cached block
#[derive(Clone)]
pub struct Block(Arc<BlockInner>);

impl Block {
    fn new(id: u32, data: [u8; BLOCK_SIZE]) -> Self {
        Block(Arc::new(BlockInner {
            id,
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        }))
    }

    /// Byte offset of the block in its file
    pub fn id(&self) -> u32 {
        self.0.id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, [u8; BLOCK_SIZE]> {
        self.0.data.read()
    }

    /// Mutable payload. Changes are only persisted after
    /// [`BlockFile::touch_block`]; do not hold the guard across store calls.
    pub fn write(&self) -> RwLockWriteGuard<'_, [u8; BLOCK_SIZE]> {
        self.0.data.write()
    }

    pub fn is_dirty(&self) -> bool {
        self.0.dirty.load(Ordering::Acquire)
    }

    pub fn is_detached(&self) -> bool {
        self.0.detached.load(Ordering::Acquire)
    }

    /// True when both handles refer to the same resident block
    pub fn ptr_eq(&self, other: &Block) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn mark_dirty(&self) {
        self.0.dirty.store(true, Ordering::Release);
    }

    fn holders(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("id", &format_args!("{:#x}", self.id()))
            .field("dirty", &self.is_dirty())
            .field("detached", &self.is_detached())
            .finish()
    }
}

struct CacheEntry {
    block: Block,
    tick: u64,
}

/// Resident blocks plus their recency order
struct BlockCache {
    blocks: HashMap<u32, CacheEntry>,
    lru: BTreeMap<u64, u32>,
    tick: u64,
    limit: usize,
}

impl BlockCache {
    fn new(limit: usize) -> Self {
        Self {
            blocks: HashMap::new(),
            lru: BTreeMap::new(),
            tick: 0,
            limit,
        }
    }

    fn get(&mut self, id: u32) -> Option<Block> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.blocks.get_mut(&id)?;
        self.lru.remove(&entry.tick);
        entry.tick = tick;
        self.lru.insert(tick, id);
        Some(entry.block.clone())
    }

    fn insert(&mut self, block: Block) {
        self.tick += 1;
        let id = block.id();
        self.lru.insert(self.tick, id);
        if let Some(old) = self.blocks.insert(id, CacheEntry { block, tick: self.tick }) {
            self.lru.remove(&old.tick);
        }
    }

    fn remove(&mut self, id: u32) -> Option<Block> {
        let entry = self.blocks.remove(&id)?;
        self.lru.remove(&entry.tick);
        Some(entry.block)
    }

    fn dirty_blocks(&self) -> Vec<Block> {
        let mut dirty: Vec<Block> = self
            .blocks
            .values()
            .filter(|e| e.block.is_dirty())
            .map(|e| e.block.clone())
            .collect();
        dirty.sort_by_key(|b| b.id());
        dirty
    }
}

/// Paged block store with an LRU block cache
pub struct BlockFile {
    path: RwLock<PathBuf>,
    version: [u8; VERSION_SIZE],
    mode: OpenMode,
    root_block: Block,
    root: Mutex<RootHeader>,
    cache: Mutex<BlockCache>,
    io: Mutex<Option<File>>,
    deleted: AtomicBool,
    registry: Arc<FileRegistry>,
    registry_id: FileId,
}

impl BlockFile {
    /// Open or create a store. A fresh, empty or unclean file gets a new
    /// root; a clean file must carry `version` and a consistent root.
    pub fn open(
        path: impl AsRef<Path>,
        mode: OpenMode,
        version: &[u8; VERSION_SIZE],
        config: &Config,
        registry: Arc<FileRegistry>,
    ) -> IndexResult<Arc<Self>> {
        config.validate().map_err(IndexError::InvalidArgument)?;
        let path = path.as_ref().to_path_buf();

        registry.make_room(None);
        let mut file = mode
            .options()
            .open(&path)
            .map_err(|e| IndexError::io(&path, e, "Failed to open block file"))?;
        let (header, root_data) = load_root(&mut file, &path, mode, version)?;

        let root_block = Block::new(0, root_data);
        root_block.0.detached.store(true, Ordering::Release);

        let store = Arc::new_cyclic(|weak: &Weak<BlockFile>| {
            let handle: Weak<dyn ManagedFile> = weak.clone();
            let registry_id = registry.register(handle);
            BlockFile {
                path: RwLock::new(path),
                version: *version,
                mode,
                root_block,
                root: Mutex::new(header),
                cache: Mutex::new(BlockCache::new(config.block_cache_limit)),
                io: Mutex::new(Some(file)),
                deleted: AtomicBool::new(false),
                registry,
                registry_id,
            }
        });
        store.registry.opened(store.registry_id);

        debug!(
            path = %store.path().display(),
            last = header.last,
            free = header.free,
            "opened block file"
        );
        Ok(store)
    }

    pub fn path(&self) -> PathBuf {
        self.path.read().clone()
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn version(&self) -> &[u8; VERSION_SIZE] {
        &self.version
    }

    /// The root block. Bytes past the common header belong to the caller;
    /// changes are persisted with `touch_block` and `sync`.
    pub fn root_block(&self) -> Block {
        self.root_block.clone()
    }

    /// Next unallocated offset
    pub fn last(&self) -> u32 {
        self.root.lock().last
    }

    /// Head of the free list
    pub fn free_head(&self) -> u32 {
        self.root.lock().free
    }

    /// Number of blocks in the file, root included
    pub fn block_count(&self) -> u32 {
        self.last() / BLOCK_SIZE as u32
    }

    /// Whether the root's sync flag is currently set
    pub fn is_synced(&self) -> bool {
        self.root.lock().is_synced()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Whether the file descriptor is currently open
    pub fn is_online(&self) -> bool {
        self.io.lock().is_some()
    }

    pub fn cached_blocks(&self) -> usize {
        self.cache.lock().blocks.len()
    }

    pub fn cache_limit(&self) -> usize {
        self.cache.lock().limit
    }

    /// Change the cache limit, evicting unreferenced blocks down to it
    pub fn set_cache_limit(&self, limit: usize) {
        let mut cache = self.cache.lock();
        cache.limit = limit.max(1);
        self.evict(&mut cache);
    }

    /// Fetch a block, from the cache or from disk
    pub fn get_block(&self, id: u32) -> IndexResult<Block> {
        self.check_live()?;
        let last = self.root.lock().last;
        self.fetch(id, last)
    }

    /// Allocate a zeroed block, reusing the free list before growing the file
    pub fn new_block(&self) -> IndexResult<Block> {
        self.check_writable()?;
        let mut root = self.root.lock();

        let block = if root.free != 0 {
            let block = self.fetch(root.free, root.last)?;
            let next = read_u32(&block.read()[..], 0);
            if next != 0 && (next & BLOCK_MASK != 0 || next >= root.last) {
                warn!(path = %self.path().display(), id = block.id(), next, "free list corrupt");
                return Err(IndexError::corrupt(
                    self.path(),
                    block.id() as u64,
                    format!("free list link {:#x} outside the file", next),
                ));
            }
            root.free = next;
            block.write().fill(0);
            block
        } else {
            let id = root.last;
            root.last = id.checked_add(BLOCK_SIZE as u32).ok_or_else(|| {
                IndexError::ResourceExhausted {
                    what: "block file offsets".to_string(),
                    limit: u32::MAX as u64,
                }
            })?;
            let block = Block::new(id, [0u8; BLOCK_SIZE]);
            let mut cache = self.cache.lock();
            cache.insert(block.clone());
            self.evict(&mut cache);
            block
        };

        self.root_block.mark_dirty();
        self.touch_locked(&mut root, &block)?;
        trace!(id = block.id(), "allocated block");
        Ok(block)
    }

    /// Return a block to the free list
    pub fn free_block(&self, id: u32) -> IndexResult<()> {
        self.check_writable()?;
        let mut root = self.root.lock();
        let block = self.fetch(id, root.last)?;
        write_u32(&mut block.write()[..], 0, root.free);
        root.free = id;
        self.root_block.mark_dirty();
        self.touch_locked(&mut root, &block)?;
        trace!(id, "freed block");
        Ok(())
    }

    /// Take a block out of the cache. The holder owns it until it is
    /// attached again; it is never evicted or written behind its back.
    pub fn detach_block(&self, block: &Block) {
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.blocks.get(&block.id()) {
            if entry.block.ptr_eq(block) {
                cache.remove(block.id());
            }
        }
        block.0.detached.store(true, Ordering::Release);
    }

    /// Put a detached block back under cache management
    pub fn attach_block(&self, block: &Block) {
        let mut cache = self.cache.lock();
        block.0.detached.store(false, Ordering::Release);
        if !cache.blocks.contains_key(&block.id()) {
            cache.insert(block.clone());
        }
        self.evict(&mut cache);
    }

    /// Mark a block modified. The first modification after a sync clears
    /// the root's sync flag on disk immediately; root changes never do.
    pub fn touch_block(&self, block: &Block) -> IndexResult<()> {
        self.check_writable()?;
        if block.id() == 0 {
            block.mark_dirty();
            return Ok(());
        }
        let mut root = self.root.lock();
        self.touch_locked(&mut root, block)
    }

    /// Write one block if it is dirty
    pub fn sync_block(&self, block: &Block) -> IndexResult<()> {
        self.check_live()?;
        if !self.mode.is_writable() || !block.is_dirty() {
            return Ok(());
        }
        if block.id() == 0 {
            let root = self.root.lock();
            return self.write_root(&root);
        }
        self.write_block_data(block)
    }

    /// Flush every cached dirty block, then set the sync flag
    pub fn sync(&self) -> IndexResult<()> {
        self.check_live()?;
        if !self.mode.is_writable() {
            return Ok(());
        }

        let mut root = self.root.lock();
        let cache = self.cache.lock();
        let dirty = cache.dirty_blocks();
        for block in &dirty {
            self.write_block_data(block)?;
        }

        if dirty.is_empty() && root.is_synced() && !self.root_block.is_dirty() {
            return Ok(());
        }

        {
            let mut io = self.io.lock();
            let path = self.path();
            let file = self.file(&mut io)?;
            let len = file
                .metadata()
                .map_err(|e| IndexError::io(&path, e, "Failed to stat block file"))?
                .len();
            if len < root.last as u64 {
                file.set_len(root.last as u64)
                    .map_err(|e| IndexError::io(&path, e, "Failed to extend block file"))?;
            }
            durable_sync(file).map_err(|e| IndexError::io(&path, e, "Failed to sync block file"))?;
        }

        root.flags |= ROOT_FLAG_SYNC;
        self.write_root(&root)?;

        let mut io = self.io.lock();
        let path = self.path();
        let file = self.file(&mut io)?;
        durable_sync(file).map_err(|e| IndexError::io(&path, e, "Failed to sync block file"))?;

        trace!(path = %path.display(), blocks = dirty.len(), "synced block file");
        Ok(())
    }

    /// Rename the file on disk; the store stays usable under the new name
    pub fn rename(&self, new_path: impl AsRef<Path>) -> IndexResult<()> {
        self.check_live()?;
        let new_path = new_path.as_ref().to_path_buf();
        let mut io = self.io.lock();
        if io.take().is_some() {
            self.registry.closed(self.registry_id);
        }
        let old_path = self.path();
        std::fs::rename(&old_path, &new_path)
            .map_err(|e| IndexError::io(&old_path, e, "Failed to rename block file"))?;
        *self.path.write() = new_path;
        Ok(())
    }

    /// Unlink the file. Every later operation fails with `Deleted`.
    pub fn delete(&self) -> IndexResult<()> {
        let mut io = self.io.lock();
        if io.take().is_some() {
            self.registry.closed(self.registry_id);
        }
        if self.deleted.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let path = self.path();
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IndexError::io(&path, e, "Failed to delete block file")),
        }
    }

    fn check_live(&self) -> IndexResult<()> {
        if self.is_deleted() {
            return Err(IndexError::Deleted { path: self.path() });
        }
        Ok(())
    }

    fn check_writable(&self) -> IndexResult<()> {
        self.check_live()?;
        if !self.mode.is_writable() {
            return Err(IndexError::ReadOnly { path: self.path() });
        }
        Ok(())
    }

    fn fetch(&self, id: u32, last: u32) -> IndexResult<Block> {
        if id == 0 || id & BLOCK_MASK != 0 || id >= last {
            return Err(IndexError::InvalidBlockId { id, last });
        }
        let mut cache = self.cache.lock();
        if let Some(block) = cache.get(id) {
            return Ok(block);
        }
        let data = self.read_block_data(id)?;
        let block = Block::new(id, data);
        cache.insert(block.clone());
        self.evict(&mut cache);
        Ok(block)
    }

    /// Drop least recently used blocks nobody else holds until the cache
    /// fits its limit. Dirty blocks are written first.
    fn evict(&self, cache: &mut BlockCache) {
        if cache.blocks.len() <= cache.limit {
            return;
        }
        let order: Vec<u32> = cache.lru.values().copied().collect();
        for id in order {
            if cache.blocks.len() <= cache.limit {
                break;
            }
            let block = match cache.blocks.get(&id) {
                Some(entry) if entry.block.holders() == 1 => entry.block.clone(),
                _ => continue,
            };
            if block.is_dirty() {
                if let Err(err) = self.write_block_data(&block) {
                    warn!(id, error = %err, "failed to write evicted block, keeping it cached");
                    break;
                }
            }
            cache.remove(id);
        }
    }

    fn touch_locked(&self, root: &mut RootHeader, block: &Block) -> IndexResult<()> {
        block.mark_dirty();
        if root.is_synced() {
            root.flags &= !ROOT_FLAG_SYNC;
            self.write_root(root)?;
        }
        Ok(())
    }

    fn write_root(&self, root: &RootHeader) -> IndexResult<()> {
        root.encode(&mut self.root_block.write()[..]);
        self.write_block_data(&self.root_block)
    }

    /// Open descriptor for I/O, reopening it lazily after the registry closed it
    fn file<'a>(&self, io: &'a mut Option<File>) -> IndexResult<&'a mut File> {
        self.check_live()?;
        let file = match io.take() {
            Some(file) => {
                self.registry.used(self.registry_id);
                file
            }
            None => {
                self.registry.make_room(Some(self.registry_id));
                let path = self.path();
                let file = self
                    .mode
                    .reopen_options()
                    .open(&path)
                    .map_err(|e| IndexError::io(&path, e, "Failed to reopen block file"))?;
                self.registry.opened(self.registry_id);
                file
            }
        };
        Ok(io.insert(file))
    }

    fn read_block_data(&self, id: u32) -> IndexResult<[u8; BLOCK_SIZE]> {
        let mut io = self.io.lock();
        let path = self.path();
        let file = self.file(&mut io)?;
        let mut data = [0u8; BLOCK_SIZE];
        file.seek(SeekFrom::Start(id as u64))
            .and_then(|_| file.read_exact(&mut data))
            .map_err(|e| IndexError::io(&path, e, &format!("Failed to read block {:#x}", id)))?;
        Ok(data)
    }

    fn write_block_data(&self, block: &Block) -> IndexResult<()> {
        let mut io = self.io.lock();
        let path = self.path();
        let file = self.file(&mut io)?;
        let data = block.read();
        write_at(file, block.id(), &data[..])
            .map_err(|e| IndexError::io(&path, e, &format!("Failed to write block {:#x}", block.id())))?;
        block.0.dirty.store(false, Ordering::Release);
        Ok(())
    }
}

impl ManagedFile for BlockFile {
    fn try_close(&self) -> bool {
        let Some(_root) = self.root.try_lock() else { return false };
        let Some(cache) = self.cache.try_lock() else { return false };
        let Some(mut io) = self.io.try_lock() else { return false };
        let Some(file) = io.as_mut() else { return true };

        for block in cache.dirty_blocks() {
            let Some(data) = block.0.data.try_read() else { return false };
            if write_at(file, block.id(), &data[..]).is_err() {
                return false;
            }
            block.0.dirty.store(false, Ordering::Release);
        }
        *io = None;
        true
    }

    fn display_name(&self) -> String {
        self.path().display().to_string()
    }
}

impl Drop for BlockFile {
    fn drop(&mut self) {
        if !self.is_deleted() && self.mode.is_writable() {
            if let Err(err) = self.sync() {
                warn!(path = %self.path().display(), error = %err, "failed to sync block file on close");
            }
        }
        self.registry.unregister(self.registry_id);
    }
}

impl std::fmt::Debug for BlockFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockFile")
            .field("path", &self.path())
            .field("mode", &self.mode)
            .field("version", &version_string(&self.version))
            .finish()
    }
}

fn write_at(file: &mut File, offset: u32, data: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset as u64))?;
    file.write_all(data)
}

/// Read and validate block 0, or write a fresh root when the file is new
/// or was not closed cleanly.
fn load_root(
    file: &mut File,
    path: &Path,
    mode: OpenMode,
    version: &[u8; VERSION_SIZE],
) -> IndexResult<(RootHeader, [u8; BLOCK_SIZE])> {
    let len = file
        .metadata()
        .map_err(|e| IndexError::io(path, e, "Failed to stat block file"))?
        .len();

    if len >= BLOCK_SIZE as u64 {
        let mut data = [0u8; BLOCK_SIZE];
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_exact(&mut data))
            .map_err(|e| IndexError::io(path, e, "Failed to read root block"))?;
        let header = RootHeader::decode(&data);
        if header.is_synced() {
            validate_root(&header, len, path, version)?;
            return Ok((header, data));
        }
        if !mode.is_writable() {
            return Err(IndexError::corrupt(path, 0, "block file was not synced"));
        }
        warn!(path = %path.display(), "block file was not synced, reinitializing");
    } else if len > 0 {
        if !mode.is_writable() {
            return Err(IndexError::corrupt(path, 0, "block file shorter than its root block"));
        }
        warn!(path = %path.display(), len, "truncated block file, reinitializing");
    } else if !mode.is_writable() {
        return Err(IndexError::corrupt(path, 0, "empty block file"));
    }

    let header = RootHeader::new(*version);
    let mut data = [0u8; BLOCK_SIZE];
    header.encode(&mut data);
    write_at(file, 0, &data)
        .and_then(|_| file.set_len(BLOCK_SIZE as u64))
        .and_then(|_| durable_sync(file))
        .map_err(|e| IndexError::io(path, e, "Failed to initialize root block"))?;
    Ok((header, data))
}

fn validate_root(header: &RootHeader, len: u64, path: &Path, version: &[u8; VERSION_SIZE]) -> IndexResult<()> {
    if &header.version != version {
        return Err(IndexError::BadVersion {
            path: path.to_path_buf(),
            expected: version_string(version),
            found: version_string(&header.version),
        });
    }
    let reason = if header.block_size != BLOCK_SIZE as u32 {
        Some(format!("block size {} (expected {})", header.block_size, BLOCK_SIZE))
    } else if header.last < BLOCK_SIZE as u32 || header.last & BLOCK_MASK != 0 {
        Some(format!("end pointer {:#x} not block aligned", header.last))
    } else if header.free != 0 && (header.free & BLOCK_MASK != 0 || header.free >= header.last) {
        Some(format!("free list head {:#x} outside the file", header.free))
    } else if len != header.last as u64 {
        Some(format!("file size {} does not match end pointer {}", len, header.last))
    } else {
        None
    };
    match reason {
        Some(reason) => {
            warn!(path = %path.display(), %reason, "block file root rejected");
            Err(IndexError::corrupt(path, 0, reason))
        }
        None => Ok(()),
    }
}
