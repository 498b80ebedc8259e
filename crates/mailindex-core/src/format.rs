//! Binary format definitions for block store files and record logs
//!
//! Every on-disk structure is a fixed layout inside one 1024-byte block,
//! little-endian, decoded and encoded explicitly. Nothing here aliases raw
//! memory as a struct; all field access is bounds-checked against the block.
//!
//! Root block (block 0):
//!   [0..8]   version:    [u8;8] - format tag, e.g. "TEXT.000"
//!   [8..12]  flags:      u32    - bit 0 = synced/clean
//!   [12..16] block_size: u32    - always 1024
//!   [16..20] free:       u32    - head of the free list (0 = empty)
//!   [20..24] last:       u32    - next unallocated offset (file length)
//!   [24..]   format-specific fields
//!
//! Record log entry:
//!   [0..4]   parent: u32 - offset of the previous entry in the chain (0 = end)
//!   [4..8]   count:  u32
//!   [8..]    count x u32 records

/// Size of every block in a store file
pub const BLOCK_SIZE: usize = 1024;

/// Block ids are byte offsets; the low bits are always zero
pub const BLOCK_SIZE_BITS: u32 = 10;

/// Mask selecting the within-block part of an offset or key id
pub const BLOCK_MASK: u32 = (BLOCK_SIZE as u32) - 1;

/// Length of the version tag at the start of store and log files
pub const VERSION_SIZE: usize = 8;

/// Size of the common root header; format-specific fields start here
pub const ROOT_HEADER_SIZE: usize = 24;

/// Root flag: set while every block on disk is consistent with the root
pub const ROOT_FLAG_SYNC: u32 = 0x01;

/// Record log entry header: parent pointer + count
pub const LOG_ENTRY_HEADER_SIZE: usize = 8;

/// Largest record count a single log entry may claim
pub const MAX_LOG_RECORDS: u32 = 1024 * 64;

/// Partitions per map block: (1024 - next - used) / (hash + block)
pub const MAP_CAPACITY: usize = (BLOCK_SIZE - 8) / 8;

/// Entries per partition key block: (1024 - used) / (hash + key)
pub const PARTITION_KEY_CAPACITY: usize = (BLOCK_SIZE - 4) / 8;

/// Header of a key table data block: next + used
pub const KEY_BLOCK_HEADER_SIZE: usize = 8;

/// Bytes shared by key descriptors (growing up) and key strings (growing down)
pub const KEY_DATA_SIZE: usize = BLOCK_SIZE - KEY_BLOCK_HEADER_SIZE;

/// Size of one key descriptor: data pointer + packed offset/flags
pub const KEY_DESCRIPTOR_SIZE: usize = 8;

/// Descriptors per key block
pub const KEY_BLOCK_CAPACITY: usize = KEY_DATA_SIZE / KEY_DESCRIPTOR_SIZE;

/// Longest key a key table accepts
pub const MAX_KEY_SIZE: usize = 128;

/// Bits of the packed descriptor word holding the string offset
const KEY_OFFSET_BITS: u32 = 10;

/// Largest flags value a key descriptor can hold (22 bits)
pub const MAX_KEY_FLAGS: u32 = (1 << (32 - KEY_OFFSET_BITS)) - 1;

/// Read a little-endian u32 at `off`. Panics only on a programming error
/// (offset outside the buffer), never on file contents.
#[inline]
pub fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Write a little-endian u32 at `off`.
#[inline]
pub fn write_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

/// Render a version tag for error messages
pub fn version_string(version: &[u8; VERSION_SIZE]) -> String {
    String::from_utf8_lossy(version).into_owned()
}

// ---------------------------------------------------------------------------
// Root block
// ---------------------------------------------------------------------------

/// Common header of block 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootHeader {
    pub version: [u8; VERSION_SIZE],
    pub flags: u32,
    pub block_size: u32,
    pub free: u32,
    pub last: u32,
}

impl RootHeader {
    /// Fresh header for an empty store: only the root block exists
    pub fn new(version: [u8; VERSION_SIZE]) -> Self {
        Self {
            version,
            flags: ROOT_FLAG_SYNC,
            block_size: BLOCK_SIZE as u32,
            free: 0,
            last: BLOCK_SIZE as u32,
        }
    }

    pub fn decode(buf: &[u8]) -> Self {
        let mut version = [0u8; VERSION_SIZE];
        version.copy_from_slice(&buf[0..VERSION_SIZE]);
        Self {
            version,
            flags: read_u32(buf, 8),
            block_size: read_u32(buf, 12),
            free: read_u32(buf, 16),
            last: read_u32(buf, 20),
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..VERSION_SIZE].copy_from_slice(&self.version);
        write_u32(buf, 8, self.flags);
        write_u32(buf, 12, self.block_size);
        write_u32(buf, 16, self.free);
        write_u32(buf, 20, self.last);
    }

    pub fn is_synced(&self) -> bool {
        self.flags & ROOT_FLAG_SYNC != 0
    }
}

// ---------------------------------------------------------------------------
// Partition map block
// ---------------------------------------------------------------------------

/// One partition: every hash <= `hash` (and above the previous boundary)
/// lives in key block `block`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionMap {
    pub hash: u32,
    pub block: u32,
}

/// Layout:
///   [0..4] next: u32 - next map block (0 = last)
///   [4..8] used: u32
///   [8..]  used x (hash: u32, block: u32), sorted by hash
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapBlock {
    pub next: u32,
    pub partitions: Vec<PartitionMap>,
}

impl MapBlock {
    pub fn decode(buf: &[u8]) -> Result<Self, String> {
        let used = read_u32(buf, 4) as usize;
        if used > MAP_CAPACITY {
            return Err(format!("map block claims {} partitions, capacity {}", used, MAP_CAPACITY));
        }
        let partitions = (0..used)
            .map(|i| PartitionMap {
                hash: read_u32(buf, 8 + i * 8),
                block: read_u32(buf, 12 + i * 8),
            })
            .collect();
        Ok(Self { next: read_u32(buf, 0), partitions })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(self.partitions.len() <= MAP_CAPACITY);
        buf.fill(0);
        write_u32(buf, 0, self.next);
        write_u32(buf, 4, self.partitions.len() as u32);
        for (i, p) in self.partitions.iter().enumerate() {
            write_u32(buf, 8 + i * 8, p.hash);
            write_u32(buf, 12 + i * 8, p.block);
        }
    }

    /// Highest boundary in this block, if it holds any partition
    pub fn upper_bound(&self) -> Option<u32> {
        self.partitions.last().map(|p| p.hash)
    }
}

// ---------------------------------------------------------------------------
// Partition key block
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionKey {
    pub hash: u32,
    pub key: u32,
}

/// Layout:
///   [0..4] used: u32
///   [4..]  used x (hash: u32, key: u32), unsorted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionKeyBlock {
    pub keys: Vec<PartitionKey>,
}

impl PartitionKeyBlock {
    pub fn decode(buf: &[u8]) -> Result<Self, String> {
        let used = read_u32(buf, 0) as usize;
        if used > PARTITION_KEY_CAPACITY {
            return Err(format!(
                "partition key block claims {} keys, capacity {}",
                used, PARTITION_KEY_CAPACITY
            ));
        }
        let keys = (0..used)
            .map(|i| PartitionKey {
                hash: read_u32(buf, 4 + i * 8),
                key: read_u32(buf, 8 + i * 8),
            })
            .collect();
        Ok(Self { keys })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(self.keys.len() <= PARTITION_KEY_CAPACITY);
        buf.fill(0);
        write_u32(buf, 0, self.keys.len() as u32);
        for (i, k) in self.keys.iter().enumerate() {
            write_u32(buf, 4 + i * 8, k.hash);
            write_u32(buf, 8 + i * 8, k.key);
        }
    }

    pub fn is_full(&self) -> bool {
        self.keys.len() >= PARTITION_KEY_CAPACITY
    }

    pub fn room(&self) -> usize {
        PARTITION_KEY_CAPACITY.saturating_sub(self.keys.len())
    }
}

// ---------------------------------------------------------------------------
// Key table root
// ---------------------------------------------------------------------------

/// Layout:
///   [0..4]  first: u32 - first data block (0 = empty table)
///   [4..8]  last:  u32 - tail data block receiving appends
///   [8..12] free:  u32 - free key list (reserved, never populated)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyRoot {
    pub first: u32,
    pub last: u32,
    pub free: u32,
}

impl KeyRoot {
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            first: read_u32(buf, 0),
            last: read_u32(buf, 4),
            free: read_u32(buf, 8),
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        write_u32(buf, 0, self.first);
        write_u32(buf, 4, self.last);
        write_u32(buf, 8, self.free);
    }
}

// ---------------------------------------------------------------------------
// Key table data block
// ---------------------------------------------------------------------------

/// Decoded key descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDescriptor {
    /// Caller-owned pointer (a record log offset for the text index)
    pub data: u32,
    /// Start of the key string inside the key data area
    pub offset: u32,
    /// 22-bit flag field; bit 0 marks a deleted entry
    pub flags: u32,
}

impl KeyDescriptor {
    fn unpack(data: u32, packed: u32) -> Self {
        Self {
            data,
            offset: packed & ((1 << KEY_OFFSET_BITS) - 1),
            flags: packed >> KEY_OFFSET_BITS,
        }
    }

    fn pack(&self) -> u32 {
        (self.offset & ((1 << KEY_OFFSET_BITS) - 1)) | (self.flags << KEY_OFFSET_BITS)
    }
}

/// Read-only view over a key table data block.
///
/// Layout:
///   [0..4] next: u32
///   [4..8] used: u32
///   [8..]  key data area: `used` descriptors from the front, key strings
///          packed from the back. String `i` spans from its descriptor's
///          offset to the previous string's offset (or the end of the area).
pub struct KeyBlockView<'a> {
    buf: &'a [u8],
}

impl<'a> KeyBlockView<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        debug_assert_eq!(buf.len(), BLOCK_SIZE);
        Self { buf }
    }

    pub fn next(&self) -> u32 {
        read_u32(self.buf, 0)
    }

    pub fn used(&self) -> usize {
        read_u32(self.buf, 4) as usize
    }

    /// Descriptor `index`; the caller checks `index < used()`
    pub fn descriptor(&self, index: usize) -> KeyDescriptor {
        let off = KEY_BLOCK_HEADER_SIZE + index * KEY_DESCRIPTOR_SIZE;
        KeyDescriptor::unpack(read_u32(self.buf, off), read_u32(self.buf, off + 4))
    }

    /// Key bytes of entry `index`, validating the offsets around it
    pub fn key(&self, index: usize) -> Result<&'a [u8], String> {
        let used = self.used();
        if used > KEY_BLOCK_CAPACITY {
            return Err(format!("key block claims {} entries, capacity {}", used, KEY_BLOCK_CAPACITY));
        }
        if index >= used {
            return Err(format!("key index {} beyond {} entries", index, used));
        }
        let start = self.descriptor(index).offset as usize;
        let end = if index == 0 {
            KEY_DATA_SIZE
        } else {
            self.descriptor(index - 1).offset as usize
        };
        let descriptors_end = used * KEY_DESCRIPTOR_SIZE;
        // an empty key leaves start == end, at KEY_DATA_SIZE when it comes first
        if end > KEY_DATA_SIZE || start > end || start < descriptors_end {
            return Err(format!("key {} spans invalid range {}..{}", index, start, end));
        }
        let base = KEY_BLOCK_HEADER_SIZE;
        Ok(&self.buf[base + start..base + end])
    }

    /// Bytes available for one more key string, after reserving its descriptor
    pub fn room(&self) -> usize {
        let used = self.used();
        if used >= KEY_BLOCK_CAPACITY {
            return 0;
        }
        let strings_start = if used == 0 {
            KEY_DATA_SIZE
        } else {
            self.descriptor(used - 1).offset as usize
        };
        strings_start.saturating_sub((used + 1) * KEY_DESCRIPTOR_SIZE)
    }
}

/// Mutable view over a key table data block
pub struct KeyBlockViewMut<'a> {
    buf: &'a mut [u8],
}

impl<'a> KeyBlockViewMut<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        debug_assert_eq!(buf.len(), BLOCK_SIZE);
        Self { buf }
    }

    pub fn view(&self) -> KeyBlockView<'_> {
        KeyBlockView::new(self.buf)
    }

    pub fn set_next(&mut self, next: u32) {
        write_u32(self.buf, 0, next);
    }

    pub fn set_descriptor(&mut self, index: usize, desc: &KeyDescriptor) {
        let off = KEY_BLOCK_HEADER_SIZE + index * KEY_DESCRIPTOR_SIZE;
        write_u32(self.buf, off, desc.data);
        write_u32(self.buf, off + 4, desc.pack());
    }

    /// Append a key if it fits; returns its index within the block
    pub fn push(&mut self, key: &[u8], data: u32, flags: u32) -> Option<usize> {
        let view = self.view();
        if view.room() < key.len() {
            return None;
        }
        let used = view.used();
        let strings_start = if used == 0 {
            KEY_DATA_SIZE
        } else {
            view.descriptor(used - 1).offset as usize
        };
        let offset = strings_start - key.len();
        let base = KEY_BLOCK_HEADER_SIZE;
        self.buf[base + offset..base + strings_start].copy_from_slice(key);
        self.set_descriptor(
            used,
            &KeyDescriptor {
                data,
                offset: offset as u32,
                flags: flags & MAX_KEY_FLAGS,
            },
        );
        write_u32(self.buf, 4, (used + 1) as u32);
        Some(used)
    }
}
