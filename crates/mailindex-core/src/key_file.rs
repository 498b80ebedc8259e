//! Append-only record log
//!
//! The log stores arrays of u32 records. Each append writes one entry
//! (parent, count, records) at the end of the file and hands back its
//! offset; passing that offset as the parent of the next append links the
//! entries into a chain that is read back newest first.
//!
//! Write ordering:
//! 1. Serialize the whole entry into one buffer
//! 2. Write it at the current end of the log
//! 3. Only then publish the new offset to the caller and advance the end
//!
//! A failed write truncates back to the old end, so the visible log never
//! contains a partial entry.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::block_file::OpenMode;
use crate::error::{IndexError, IndexResult};
use crate::format::{read_u32, version_string, LOG_ENTRY_HEADER_SIZE, MAX_LOG_RECORDS, VERSION_SIZE};
use crate::platform_durability::durable_sync;
use crate::registry::{FileId, FileRegistry, ManagedFile};

struct LogState {
    file: Option<File>,
    /// Current end of the log; the next entry is written here
    last: u32,
}

/// Append-only log of record arrays
pub struct KeyFile {
    path: RwLock<PathBuf>,
    version: [u8; VERSION_SIZE],
    mode: OpenMode,
    state: Mutex<LogState>,
    deleted: AtomicBool,
    registry: Arc<FileRegistry>,
    registry_id: FileId,
}

impl KeyFile {
    pub fn open(
        path: impl AsRef<Path>,
        mode: OpenMode,
        version: &[u8; VERSION_SIZE],
        registry: Arc<FileRegistry>,
    ) -> IndexResult<Arc<Self>> {
        let path = path.as_ref().to_path_buf();

        registry.make_room(None);
        let mut file = mode
            .options()
            .open(&path)
            .map_err(|e| IndexError::io(&path, e, "Failed to open key file"))?;
        let last = load_header(&mut file, &path, mode, version)?;

        let log = Arc::new_cyclic(|weak: &Weak<KeyFile>| {
            let handle: Weak<dyn ManagedFile> = weak.clone();
            let registry_id = registry.register(handle);
            KeyFile {
                path: RwLock::new(path),
                version: *version,
                mode,
                state: Mutex::new(LogState { file: Some(file), last }),
                deleted: AtomicBool::new(false),
                registry,
                registry_id,
            }
        });
        log.registry.opened(log.registry_id);

        debug!(path = %log.path().display(), last, "opened key file");
        Ok(log)
    }

    pub fn path(&self) -> PathBuf {
        self.path.read().clone()
    }

    pub fn version(&self) -> &[u8; VERSION_SIZE] {
        &self.version
    }

    /// Offset one past the last entry
    pub fn last(&self) -> u32 {
        self.state.lock().last
    }

    pub fn is_online(&self) -> bool {
        self.state.lock().file.is_some()
    }

    /// Append `records` with `*parent` as the entry's parent. On success
    /// `*parent` becomes the new entry's offset; on failure it is unchanged.
    pub fn write(&self, parent: &mut u32, records: &[u32]) -> IndexResult<()> {
        self.check_writable()?;
        if records.len() > MAX_LOG_RECORDS as usize {
            return Err(IndexError::InvalidArgument(format!(
                "{} records in one entry, limit {}",
                records.len(),
                MAX_LOG_RECORDS
            )));
        }

        let mut buf = Vec::with_capacity(LOG_ENTRY_HEADER_SIZE + records.len() * 4);
        buf.extend_from_slice(&parent.to_le_bytes());
        buf.extend_from_slice(&(records.len() as u32).to_le_bytes());
        for record in records {
            buf.extend_from_slice(&record.to_le_bytes());
        }

        let mut state = self.state.lock();
        let offset = state.last;
        let end = u32::try_from(offset as u64 + buf.len() as u64).map_err(|_| IndexError::ResourceExhausted {
            what: "key file offsets".to_string(),
            limit: u32::MAX as u64,
        })?;

        let path = self.path();
        let file = self.file(&mut state.file)?;
        let result = file
            .seek(SeekFrom::Start(offset as u64))
            .and_then(|_| file.write_all(&buf));
        if let Err(e) = result {
            if let Err(trunc) = file.set_len(offset as u64) {
                warn!(path = %path.display(), error = %trunc, "failed to truncate partial key file entry");
            }
            return Err(IndexError::io(&path, e, "Key file append failed"));
        }

        state.last = end;
        *parent = offset;
        Ok(())
    }

    /// Read the entry at `*parent` and replace `*parent` with the entry's
    /// own parent, so repeated calls walk the chain back to 0.
    pub fn read(&self, parent: &mut u32) -> IndexResult<Vec<u32>> {
        self.check_live()?;
        let offset = *parent;
        let path = self.path();
        if offset == 0 {
            return Err(IndexError::InvalidArgument("null key file offset".to_string()));
        }

        let mut state = self.state.lock();
        let last = state.last;
        if (offset as usize) < VERSION_SIZE || offset as u64 + LOG_ENTRY_HEADER_SIZE as u64 > last as u64 {
            return Err(IndexError::corrupt(&path, offset as u64, "entry offset outside the key file"));
        }

        let file = self.file(&mut state.file)?;
        let mut header = [0u8; LOG_ENTRY_HEADER_SIZE];
        file.seek(SeekFrom::Start(offset as u64))
            .and_then(|_| file.read_exact(&mut header))
            .map_err(|e| IndexError::io(&path, e, "Failed to read key file entry"))?;

        let next = read_u32(&header, 0);
        let count = read_u32(&header, 4);
        if count > MAX_LOG_RECORDS {
            warn!(path = %path.display(), offset, count, "implausible key file record count");
            return Err(IndexError::corrupt(&path, offset as u64, format!("record count {} too large", count)));
        }
        let end = offset as u64 + LOG_ENTRY_HEADER_SIZE as u64 + count as u64 * 4;
        if end > last as u64 {
            return Err(IndexError::corrupt(&path, offset as u64, "entry extends past the end of the key file"));
        }
        if next >= offset {
            return Err(IndexError::corrupt(&path, offset as u64, format!("parent {:#x} does not precede entry", next)));
        }

        let mut raw = vec![0u8; count as usize * 4];
        file.read_exact(&mut raw)
            .map_err(|e| IndexError::io(&path, e, "Failed to read key file records"))?;
        let records = raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        *parent = next;
        Ok(records)
    }

    pub fn sync(&self) -> IndexResult<()> {
        self.check_live()?;
        if !self.mode.is_writable() {
            return Ok(());
        }
        let mut state = self.state.lock();
        let path = self.path();
        let file = self.file(&mut state.file)?;
        durable_sync(file).map_err(|e| IndexError::io(&path, e, "Key file durable_sync failed"))
    }

    pub fn rename(&self, new_path: impl AsRef<Path>) -> IndexResult<()> {
        self.check_live()?;
        let new_path = new_path.as_ref().to_path_buf();
        let mut state = self.state.lock();
        if state.file.take().is_some() {
            self.registry.closed(self.registry_id);
        }
        let old_path = self.path();
        std::fs::rename(&old_path, &new_path)
            .map_err(|e| IndexError::io(&old_path, e, "Failed to rename key file"))?;
        *self.path.write() = new_path;
        Ok(())
    }

    pub fn delete(&self) -> IndexResult<()> {
        let mut state = self.state.lock();
        if state.file.take().is_some() {
            self.registry.closed(self.registry_id);
        }
        if self.deleted.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let path = self.path();
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IndexError::io(&path, e, "Failed to delete key file")),
        }
    }

    fn check_live(&self) -> IndexResult<()> {
        if self.deleted.load(Ordering::Acquire) {
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

    fn file<'a>(&self, slot: &'a mut Option<File>) -> IndexResult<&'a mut File> {
        let file = match slot.take() {
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
                    .map_err(|e| IndexError::io(&path, e, "Failed to reopen key file"))?;
                self.registry.opened(self.registry_id);
                file
            }
        };
        Ok(slot.insert(file))
    }
}

impl ManagedFile for KeyFile {
    fn try_close(&self) -> bool {
        let Some(mut state) = self.state.try_lock() else { return false };
        state.file = None;
        true
    }

    fn display_name(&self) -> String {
        self.path().display().to_string()
    }
}

impl Drop for KeyFile {
    fn drop(&mut self) {
        self.registry.unregister(self.registry_id);
    }
}

impl std::fmt::Debug for KeyFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFile")
            .field("path", &self.path())
            .field("version", &version_string(&self.version))
            .field("last", &self.last())
            .finish()
    }
}

/// Check or write the version header; returns the end of the log
fn load_header(file: &mut File, path: &Path, mode: OpenMode, version: &[u8; VERSION_SIZE]) -> IndexResult<u32> {
    let len = file
        .metadata()
        .map_err(|e| IndexError::io(path, e, "Failed to stat key file"))?
        .len();

    if len == 0 {
        if !mode.is_writable() {
            return Err(IndexError::corrupt(path, 0, "empty key file"));
        }
        file.write_all(version)
            .map_err(|e| IndexError::io(path, e, "Failed to write key file header"))?;
        return Ok(VERSION_SIZE as u32);
    }
    if len < VERSION_SIZE as u64 {
        return Err(IndexError::corrupt(path, 0, "key file shorter than its header"));
    }
    if len > u32::MAX as u64 {
        return Err(IndexError::corrupt(path, 0, format!("key file of {} bytes exceeds 32-bit offsets", len)));
    }

    let mut found = [0u8; VERSION_SIZE];
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_exact(&mut found))
        .map_err(|e| IndexError::io(path, e, "Failed to read key file header"))?;
    if &found != version {
        return Err(IndexError::BadVersion {
            path: path.to_path_buf(),
            expected: version_string(version),
            found: version_string(&found),
        });
    }
    Ok(len as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const VERSION: &[u8; VERSION_SIZE] = b"KEYS.000";

    fn test_log() -> (Arc<KeyFile>, TempDir) {
        let dir = TempDir::new().unwrap();
        let log = KeyFile::open(dir.path().join("test.data"), OpenMode::Create, VERSION, FileRegistry::new(10)).unwrap();
        (log, dir)
    }

    #[test]
    fn test_fresh_log_has_header() {
        let (log, _dir) = test_log();
        assert_eq!(log.last(), VERSION_SIZE as u32);
        assert_eq!(std::fs::read(log.path()).unwrap(), VERSION.to_vec());
    }

    #[test]
    fn test_chain_reads_newest_first() {
        let (log, _dir) = test_log();
        let mut head = 0;
        log.write(&mut head, &[1, 2, 3]).unwrap();
        let first = head;
        log.write(&mut head, &[4]).unwrap();
        log.write(&mut head, &[]).unwrap();
        assert!(head > first);

        let mut cursor = head;
        assert_eq!(log.read(&mut cursor).unwrap(), Vec::<u32>::new());
        assert_eq!(log.read(&mut cursor).unwrap(), vec![4]);
        assert_eq!(cursor, first);
        assert_eq!(log.read(&mut cursor).unwrap(), vec![1, 2, 3]);
        assert_eq!(cursor, 0);
    }

    #[test]
    fn test_entry_layout() {
        let (log, _dir) = test_log();
        let mut head = 0;
        log.write(&mut head, &[0xAABBCCDD]).unwrap();
        assert_eq!(head, VERSION_SIZE as u32);
        assert_eq!(log.last(), VERSION_SIZE as u32 + 12);

        let bytes = std::fs::read(log.path()).unwrap();
        assert_eq!(read_u32(&bytes, 8), 0);
        assert_eq!(read_u32(&bytes, 12), 1);
        assert_eq!(read_u32(&bytes, 16), 0xAABBCCDD);
    }

    #[test]
    fn test_reopen_appends_at_end() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reopen.data");
        let mut head = 0;
        {
            let log = KeyFile::open(&path, OpenMode::Create, VERSION, FileRegistry::new(10)).unwrap();
            log.write(&mut head, &[7, 8]).unwrap();
            log.sync().unwrap();
        }

        let log = KeyFile::open(&path, OpenMode::ReadWrite, VERSION, FileRegistry::new(10)).unwrap();
        log.write(&mut head, &[9]).unwrap();
        assert_eq!(log.read(&mut head).unwrap(), vec![9]);
        assert_eq!(log.read(&mut head).unwrap(), vec![7, 8]);
    }

    #[test]
    fn test_bad_offsets_are_corrupt() {
        let (log, _dir) = test_log();
        let mut head = 0;
        log.write(&mut head, &[1]).unwrap();

        assert!(matches!(log.read(&mut 0), Err(IndexError::InvalidArgument(_))));
        assert!(log.read(&mut 4).unwrap_err().is_corruption());
        assert!(log.read(&mut (log.last() + 100)).unwrap_err().is_corruption());
        // an offset into the middle of an entry claims a huge count
        let mut inside = head + 4;
        assert!(log.read(&mut inside).is_err());
    }

    #[test]
    fn test_read_only_leaves_parent_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ro.data");
        drop(KeyFile::open(&path, OpenMode::Create, VERSION, FileRegistry::new(10)).unwrap());

        let log = KeyFile::open(&path, OpenMode::ReadOnly, VERSION, FileRegistry::new(10)).unwrap();
        let mut head = 0;
        assert!(matches!(log.write(&mut head, &[1]), Err(IndexError::ReadOnly { .. })));
        assert_eq!(head, 0);
        assert_eq!(log.last(), VERSION_SIZE as u32);
    }

    #[test]
    fn test_version_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v.data");
        std::fs::write(&path, b"OTHER.00").unwrap();
        let result = KeyFile::open(&path, OpenMode::ReadWrite, VERSION, FileRegistry::new(10));
        assert!(matches!(result, Err(IndexError::BadVersion { .. })));
    }

    #[test]
    fn test_too_many_records_rejected() {
        let (log, _dir) = test_log();
        let records = vec![0u32; MAX_LOG_RECORDS as usize + 1];
        let mut head = 0;
        assert!(matches!(log.write(&mut head, &records), Err(IndexError::InvalidArgument(_))));
        assert_eq!(head, 0);
    }

    #[test]
    fn test_reopens_after_descriptor_eviction() {
        let dir = TempDir::new().unwrap();
        let registry = FileRegistry::new(2);
        let logs: Vec<Arc<KeyFile>> = (0..3)
            .map(|i| KeyFile::open(dir.path().join(format!("{}.data", i)), OpenMode::Create, VERSION, registry.clone()).unwrap())
            .collect();
        assert!(!logs[0].is_online());

        let mut head = 0;
        logs[0].write(&mut head, &[42]).unwrap();
        assert!(logs[0].is_online());
        assert_eq!(logs[0].read(&mut head).unwrap(), vec![42]);
    }

    #[test]
    fn test_delete() {
        let (log, _dir) = test_log();
        let path = log.path();
        log.delete().unwrap();
        assert!(!path.exists());
        assert!(matches!(log.write(&mut 0, &[1]), Err(IndexError::Deleted { .. })));
    }
}
