//! Hash-partitioned key index
//!
//! Keys are hashed to 32 bits and bucketed by hash range. The resident list
//! of map blocks holds sorted (boundary, key block) pairs; every hash above
//! the previous boundary and at most equal to a partition's boundary lives
//! in that partition's key block as an unsorted (hash, id) pair.
//!
//! Only hashes are compared. Two keys with the same hash are
//! indistinguishable here; callers that care verify the key themselves.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::block_file::{Block, BlockFile};
use crate::error::{IndexError, IndexResult};
use crate::format::{MapBlock, PartitionKey, PartitionKeyBlock, PartitionMap, MAP_CAPACITY, PARTITION_KEY_CAPACITY};

/// Hash used to place keys into partitions. Bytes are taken as signed.
pub fn hash_key(key: &[u8]) -> u32 {
    key.iter().fold(0xABAD_F00D_u32, |hash, &b| {
        let c = b as i8 as i32 as u32;
        hash.wrapping_mul(c) ^ c
    })
}

struct MapEntry {
    block: Block,
    map: MapBlock,
}

/// Hash-partitioned index mapping keys to ids
pub struct PartitionTable {
    store: Arc<BlockFile>,
    root: u32,
    maps: Mutex<Vec<MapEntry>>,
}

impl PartitionTable {
    /// Load the map chain starting at block `root`. A chain consisting of
    /// one empty map block is primed with a single partition covering
    /// every hash.
    pub fn open(store: Arc<BlockFile>, root: u32) -> IndexResult<Self> {
        let mut maps: Vec<MapEntry> = Vec::new();
        let limit = store.block_count() as usize;
        let mut id = root;
        loop {
            if maps.len() >= limit {
                return Err(IndexError::corrupt(store.path(), root as u64, "partition map chain loops"));
            }
            let block = store.get_block(id)?;
            store.detach_block(&block);
            let map = MapBlock::decode(&block.read()[..]).map_err(|reason| {
                warn!(path = %store.path().display(), id, %reason, "bad partition map block");
                IndexError::corrupt(store.path(), id as u64, reason)
            })?;
            id = map.next;
            maps.push(MapEntry { block, map });
            if id == 0 {
                break;
            }
        }

        let table = Self { store, root, maps: Mutex::new(maps) };
        {
            let mut maps = table.maps.lock();
            let empty = maps.len() == 1 && maps[0].map.partitions.is_empty();
            if empty && table.store.mode().is_writable() {
                let keys = table.store.new_block()?;
                maps[0].map.partitions.push(PartitionMap { hash: u32::MAX, block: keys.id() });
                table.write_map(&maps[0])?;
            }
        }
        Ok(table)
    }

    /// First map block
    pub fn root(&self) -> u32 {
        self.root
    }

    /// Id stored for `key`, or 0 when absent
    pub fn lookup(&self, key: &str) -> IndexResult<u32> {
        let hash = hash_key(key.as_bytes());
        let maps = self.maps.lock();
        let Some((m, p)) = self.find_partition(&maps, hash)? else { return Ok(0) };
        let (_, keys) = self.load_keys(maps[m].map.partitions[p].block)?;
        Ok(keys.keys.iter().find(|k| k.hash == hash).map_or(0, |k| k.key))
    }

    /// Map `key` to `id`. A full partition is balanced with a neighbour or
    /// split into a fresh key block.
    pub fn add(&self, key: &str, id: u32) -> IndexResult<()> {
        let hash = hash_key(key.as_bytes());
        let entry = PartitionKey { hash, key: id };
        let mut maps = self.maps.lock();
        let Some((mut m, mut p)) = self.find_partition(&maps, hash)? else {
            return Err(IndexError::corrupt(self.store.path(), self.root as u64, "partition table has no partitions"));
        };

        let (block, mut keys) = self.load_keys(maps[m].map.partitions[p].block)?;
        if !keys.is_full() {
            keys.keys.push(entry);
            return self.store_keys(&block, &keys);
        }

        // Neighbour in the same map block with the most room
        let parts = &maps[m].map.partitions;
        let mut neighbour: Option<(usize, Block, PartitionKeyBlock)> = None;
        if p > 0 {
            let (b, k) = self.load_keys(parts[p - 1].block)?;
            if k.room() > 0 {
                neighbour = Some((p - 1, b, k));
            }
        }
        if p + 1 < parts.len() {
            let (b, k) = self.load_keys(parts[p + 1].block)?;
            let better = neighbour.as_ref().map_or(true, |(_, _, n)| k.room() > n.room());
            if k.room() > 0 && better {
                neighbour = Some((p + 1, b, k));
            }
        }

        if let Some((n, nblock, nkeys)) = neighbour {
            let (lower, lower_block, upper_block, mut entries) = if n < p {
                (n, nblock, block, [nkeys.keys, keys.keys].concat())
            } else {
                (p, block, nblock, [keys.keys, nkeys.keys].concat())
            };
            entries.push(entry);
            entries.sort_by_key(|k| k.hash);
            let mid = self.split_point(&entries)?;
            trace!(map = m, lower, "balancing partition with neighbour");
            return self.apply_split(&mut maps, m, lower, &lower_block, &upper_block, &entries, mid);
        }

        let mut entries = keys.keys;
        entries.push(entry);
        entries.sort_by_key(|k| k.hash);
        let mid = self.split_point(&entries)?;

        if maps[m].map.partitions.len() >= MAP_CAPACITY {
            let half = self.split_map(&mut maps, m)?;
            if p >= half {
                m += 1;
                p -= half;
            }
        }

        let fresh = self.store.new_block()?;
        let placeholder = entries[mid - 1].hash;
        maps[m].map.partitions.insert(p, PartitionMap { hash: placeholder, block: fresh.id() });
        trace!(map = m, partition = p, block = fresh.id(), "split partition into new key block");
        self.apply_split(&mut maps, m, p, &fresh, &block, &entries, mid)
    }

    /// Remove the first entry whose hash matches `key`. Partitions are never merged.
    pub fn remove(&self, key: &str) -> IndexResult<()> {
        let hash = hash_key(key.as_bytes());
        let maps = self.maps.lock();
        let Some((m, p)) = self.find_partition(&maps, hash)? else { return Ok(()) };
        let (block, mut keys) = self.load_keys(maps[m].map.partitions[p].block)?;
        if let Some(pos) = keys.keys.iter().position(|k| k.hash == hash) {
            keys.keys.remove(pos);
            self.store_keys(&block, &keys)?;
        }
        Ok(())
    }

    /// Write out every resident map block
    pub fn sync(&self) -> IndexResult<()> {
        let maps = self.maps.lock();
        for entry in maps.iter() {
            self.store.sync_block(&entry.block)?;
        }
        Ok(())
    }

    /// Number of partitions across all map blocks
    pub fn partition_count(&self) -> usize {
        self.maps.lock().iter().map(|e| e.map.partitions.len()).sum()
    }

    /// Check boundary ordering and that every stored hash sits in the
    /// partition covering it. Returns a description of each violation.
    pub fn verify(&self) -> IndexResult<Vec<String>> {
        let maps = self.maps.lock();
        let mut problems = Vec::new();
        let mut previous: Option<u32> = None;
        for (m, entry) in maps.iter().enumerate() {
            for (p, part) in entry.map.partitions.iter().enumerate() {
                if let Some(prev) = previous {
                    if part.hash <= prev {
                        problems.push(format!("map {} partition {}: boundary {:#x} not above {:#x}", m, p, part.hash, prev));
                    }
                }
                let (_, keys) = self.load_keys(part.block)?;
                for k in &keys.keys {
                    let above = previous.map_or(true, |prev| k.hash > prev);
                    if !above || k.hash > part.hash {
                        problems.push(format!(
                            "map {} partition {}: hash {:#x} outside ({:?}, {:#x}]",
                            m, p, k.hash, previous, part.hash
                        ));
                    }
                }
                previous = Some(part.hash);
            }
        }
        if previous.is_some() && previous != Some(u32::MAX) {
            problems.push(format!("last boundary {:?} does not cover every hash", previous));
        }
        Ok(problems)
    }

    fn find_partition(&self, maps: &[MapEntry], hash: u32) -> IndexResult<Option<(usize, usize)>> {
        let m = maps.partition_point(|e| e.map.upper_bound().map_or(true, |bound| bound < hash));
        if m == maps.len() {
            if maps.iter().all(|e| e.map.partitions.is_empty()) {
                return Ok(None);
            }
            warn!(path = %self.store.path().display(), hash, "no partition covers hash");
            return Err(IndexError::corrupt(self.store.path(), self.root as u64, format!("no partition covers hash {:#x}", hash)));
        }
        let p = maps[m].map.partitions.partition_point(|part| part.hash < hash);
        Ok(Some((m, p)))
    }

    /// Midpoint for redistributing sorted entries over two key blocks,
    /// moved off runs of equal hashes so a hash never spans partitions
    fn split_point(&self, entries: &[PartitionKey]) -> IndexResult<usize> {
        let len = entries.len();
        let half = len / 2;
        let boundary = |mid: usize| mid > 0 && mid < len && entries[mid - 1].hash != entries[mid].hash;
        let fits = |mid: usize| mid <= PARTITION_KEY_CAPACITY && len - mid <= PARTITION_KEY_CAPACITY;

        let down = (1..=half).rev().find(|&mid| boundary(mid));
        let up = (half.max(1)..len).find(|&mid| boundary(mid));
        [down, up]
            .into_iter()
            .flatten()
            .find(|&mid| fits(mid))
            .ok_or_else(|| IndexError::ResourceExhausted {
                what: "partition key block (too many equal hashes)".to_string(),
                limit: PARTITION_KEY_CAPACITY as u64,
            })
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_split(
        &self,
        maps: &mut [MapEntry],
        m: usize,
        lower: usize,
        lower_block: &Block,
        upper_block: &Block,
        entries: &[PartitionKey],
        mid: usize,
    ) -> IndexResult<()> {
        let (lo, hi) = entries.split_at(mid);
        self.store_keys(lower_block, &PartitionKeyBlock { keys: lo.to_vec() })?;
        self.store_keys(upper_block, &PartitionKeyBlock { keys: hi.to_vec() })?;
        maps[m].map.partitions[lower].hash = lo[lo.len() - 1].hash;
        self.write_map(&maps[m])
    }

    /// Move the upper half of a full map block into a new linked block.
    /// Returns how many partitions stayed behind.
    fn split_map(&self, maps: &mut Vec<MapEntry>, m: usize) -> IndexResult<usize> {
        let block = self.store.new_block()?;
        self.store.detach_block(&block);

        let half = maps[m].map.partitions.len() / 2;
        let upper = maps[m].map.partitions.split_off(half);
        let map = MapBlock { next: maps[m].map.next, partitions: upper };
        maps[m].map.next = block.id();

        let entry = MapEntry { block, map };
        self.write_map(&maps[m])?;
        self.write_map(&entry)?;
        trace!(map = m, block = entry.block.id(), "split partition map block");
        maps.insert(m + 1, entry);
        Ok(half)
    }

    fn load_keys(&self, id: u32) -> IndexResult<(Block, PartitionKeyBlock)> {
        let block = self.store.get_block(id)?;
        let keys = PartitionKeyBlock::decode(&block.read()[..]).map_err(|reason| {
            warn!(path = %self.store.path().display(), id, %reason, "bad partition key block");
            IndexError::corrupt(self.store.path(), id as u64, reason)
        })?;
        Ok((block, keys))
    }

    fn store_keys(&self, block: &Block, keys: &PartitionKeyBlock) -> IndexResult<()> {
        keys.encode(&mut block.write()[..]);
        self.store.touch_block(block)
    }

    fn write_map(&self, entry: &MapEntry) -> IndexResult<()> {
        entry.map.encode(&mut entry.block.write()[..]);
        self.store.touch_block(&entry.block)
    }
}

impl Drop for PartitionTable {
    fn drop(&mut self) {
        if self.store.is_deleted() || !self.store.mode().is_writable() {
            return;
        }
        if let Err(err) = self.sync() {
            warn!(path = %self.store.path().display(), error = %err, "failed to sync partition table on close");
        }
    }
}

impl std::fmt::Debug for PartitionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionTable")
            .field("root", &self.root)
            .field("partitions", &self.partition_count())
            .finish()
    }
}
