//! Append-only key table
//!
//! Stores (key, data, flags) triples in chained key blocks. A key id is the
//! id of its block or'ed with its index inside the block, so lookups cost
//! one block fetch. Entries are never removed; callers flag them instead.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::block_file::{Block, BlockFile};
use crate::error::{IndexError, IndexResult};
use crate::format::{
    KeyBlockView, KeyBlockViewMut, KeyRoot, BLOCK_MASK, KEY_BLOCK_CAPACITY, MAX_KEY_FLAGS, MAX_KEY_SIZE,
};

/// One key table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub id: u32,
    pub key: String,
    pub data: u32,
    pub flags: u32,
}

struct TableRoot {
    block: Block,
    root: KeyRoot,
}

/// Key table rooted at one detached block
pub struct KeyTable {
    store: Arc<BlockFile>,
    root_id: u32,
    state: Mutex<TableRoot>,
}

impl KeyTable {
    pub fn open(store: Arc<BlockFile>, root_id: u32) -> IndexResult<Self> {
        let block = store.get_block(root_id)?;
        store.detach_block(&block);
        let root = KeyRoot::decode(&block.read()[..]);

        let last = store.last();
        for (which, id) in [("first", root.first), ("last", root.last)] {
            if id != 0 && (id & BLOCK_MASK != 0 || id >= last) {
                warn!(path = %store.path().display(), root_id, which, id, "key table root points outside the file");
                return Err(IndexError::corrupt(
                    store.path(),
                    root_id as u64,
                    format!("key table {} block {:#x} outside the file", which, id),
                ));
            }
        }

        Ok(Self {
            store,
            root_id,
            state: Mutex::new(TableRoot { block, root }),
        })
    }

    pub fn root_id(&self) -> u32 {
        self.root_id
    }

    /// Append a key; returns its id
    pub fn add(&self, key: &str, data: u32, flags: u32) -> IndexResult<u32> {
        if key.len() > MAX_KEY_SIZE {
            return Err(IndexError::OversizedKey { len: key.len(), max: MAX_KEY_SIZE });
        }
        let mut state = self.state.lock();

        let mut block = if state.root.last == 0 {
            let block = self.store.new_block()?;
            state.root.first = block.id();
            state.root.last = block.id();
            block
        } else {
            self.store.get_block(state.root.last)?
        };

        let pushed = KeyBlockViewMut::new(&mut block.write()[..]).push(key.as_bytes(), data, flags);
        let index = match pushed {
            Some(index) => index,
            None => {
                let next = self.store.new_block()?;
                KeyBlockViewMut::new(&mut block.write()[..]).set_next(next.id());
                self.store.touch_block(&block)?;
                state.root.last = next.id();
                block = next;
                let pushed = KeyBlockViewMut::new(&mut block.write()[..]).push(key.as_bytes(), data, flags);
                pushed.ok_or_else(|| {
                    IndexError::corrupt(self.store.path(), block.id() as u64, "fresh key block cannot hold key")
                })?
            }
        };

        self.store.touch_block(&block)?;
        self.write_root(&state)?;
        Ok(block.id() | index as u32)
    }

    /// Entry stored under `id`
    pub fn lookup(&self, id: u32) -> IndexResult<KeyRecord> {
        let (block, index) = self.locate(id)?;
        let data = block.read();
        let view = KeyBlockView::new(&data[..]);
        let desc = view.descriptor(index);
        let key = view.key(index).map_err(|reason| self.corrupt(block.id(), reason))?;
        Ok(KeyRecord {
            id,
            key: String::from_utf8_lossy(key).into_owned(),
            data: desc.data,
            flags: desc.flags,
        })
    }

    /// Replace the data pointer of `id`; unchanged values are not rewritten
    pub fn set_data(&self, id: u32, data: u32) -> IndexResult<()> {
        let (block, index) = self.locate(id)?;
        {
            let mut buf = block.write();
            let mut view = KeyBlockViewMut::new(&mut buf[..]);
            let mut desc = view.view().descriptor(index);
            if desc.data == data {
                return Ok(());
            }
            desc.data = data;
            view.set_descriptor(index, &desc);
        }
        self.store.touch_block(&block)
    }

    /// Replace the bits of `id`'s flags selected by `mask`
    pub fn set_flags(&self, id: u32, flags: u32, mask: u32) -> IndexResult<()> {
        let (block, index) = self.locate(id)?;
        {
            let mut buf = block.write();
            let mut view = KeyBlockViewMut::new(&mut buf[..]);
            let mut desc = view.view().descriptor(index);
            let updated = ((desc.flags & !mask) | (flags & mask)) & MAX_KEY_FLAGS;
            if desc.flags == updated {
                return Ok(());
            }
            desc.flags = updated;
            view.set_descriptor(index, &desc);
        }
        self.store.touch_block(&block)
    }

    /// Entry following `prev` in creation order (`prev == 0` starts over).
    /// Offsets that do not fit the block stop enumeration with `Corrupt`.
    pub fn next(&self, prev: u32) -> IndexResult<Option<KeyRecord>> {
        let (mut block_id, mut index) = if prev == 0 {
            (self.state.lock().root.first, 0usize)
        } else {
            (prev & !BLOCK_MASK, (prev & BLOCK_MASK) as usize + 1)
        };

        let limit = self.store.block_count();
        let mut hops = 0u32;
        while block_id != 0 {
            hops += 1;
            if hops > limit {
                return Err(self.corrupt(block_id, "key block chain loops".to_string()));
            }
            let block = self.store.get_block(block_id)?;
            let data = block.read();
            let view = KeyBlockView::new(&data[..]);
            let used = view.used();
            if used > KEY_BLOCK_CAPACITY {
                return Err(self.corrupt(block_id, format!("key block claims {} entries", used)));
            }
            if index < used {
                let desc = view.descriptor(index);
                let key = view.key(index).map_err(|reason| self.corrupt(block_id, reason))?;
                return Ok(Some(KeyRecord {
                    id: block_id | index as u32,
                    key: String::from_utf8_lossy(key).into_owned(),
                    data: desc.data,
                    flags: desc.flags,
                }));
            }
            block_id = view.next();
            index = 0;
        }
        Ok(None)
    }

    /// Write the table root
    pub fn sync(&self) -> IndexResult<()> {
        let state = self.state.lock();
        self.store.sync_block(&state.block)
    }

    fn locate(&self, id: u32) -> IndexResult<(Block, usize)> {
        let index = (id & BLOCK_MASK) as usize;
        let block = self.store.get_block(id & !BLOCK_MASK)?;
        let used = KeyBlockView::new(&block.read()[..]).used();
        if index >= used.min(KEY_BLOCK_CAPACITY) {
            return Err(IndexError::InvalidArgument(format!(
                "key id {:#x} beyond {} entries of its block",
                id, used
            )));
        }
        Ok((block, index))
    }

    fn write_root(&self, state: &TableRoot) -> IndexResult<()> {
        state.root.encode(&mut state.block.write()[..]);
        self.store.touch_block(&state.block)
    }

    fn corrupt(&self, block_id: u32, reason: String) -> IndexError {
        warn!(path = %self.store.path().display(), block_id, %reason, "corrupt key block");
        IndexError::corrupt(self.store.path(), block_id as u64, reason)
    }
}

impl Drop for KeyTable {
    fn drop(&mut self) {
        if self.store.is_deleted() || !self.store.mode().is_writable() {
            return;
        }
        if let Err(err) = self.sync() {
            warn!(path = %self.store.path().display(), error = %err, "failed to sync key table on close");
        }
    }
}

impl std::fmt::Debug for KeyTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("KeyTable")
            .field("root", &self.root_id)
            .field("first", &state.root.first)
            .field("last", &state.root.last)
            .finish()
    }
}
