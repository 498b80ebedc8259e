//! Durable flushes for block stores, record logs and their directories
//!
//! `durable_sync` picks the strongest data flush each platform offers.
//! On top of it sit the two ordering rules an index depends on:
//!
//! - A record log is flushed before the block store whose entries point
//!   into it ([`sync_log_then_store`]). The store's root is marked clean as
//!   part of its own flush, so a crash in between leaves the store flagged
//!   unsynced rather than clean with dangling log offsets.
//! - A rename is only durable once the directory holding it is flushed
//!   ([`sync_parent`]), which compaction needs after swapping files.

use std::fs::File;
use std::io;
use std::path::Path;

use crate::block_file::BlockFile;
use crate::error::IndexResult;
use crate::key_file::KeyFile;

/// Flush file data to stable storage.
///
/// - Linux: fdatasync(), data only (sizes are covered, timestamps are not)
/// - macOS/iOS: fcntl(F_FULLFSYNC), pushes through the drive's write cache
/// - Windows: FlushFileBuffers()
/// - Other: `File::sync_data`
///
/// Blocks for as long as the device needs. Callers hold only the file's own
/// I/O lock while this runs.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor comes from a live `File` borrowed for the call.
        let result = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor comes from a live `File` borrowed for the call.
        let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
        if result != -1 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        // SAFETY: the handle comes from a live `File` borrowed for the call.
        let result = unsafe { FlushFileBuffers(file.as_raw_handle() as *mut _) };
        if result != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
    {
        file.sync_data()
    }
}

/// Make directory entry changes (rename, unlink, create) durable.
///
/// No-op on Windows, where directories cannot be opened for flushing.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };
        File::open(dir)?.sync_all()
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

/// Flush `log`, then `store`, whose records hold offsets into `log`.
pub fn sync_log_then_store(log: &KeyFile, store: &BlockFile) -> IndexResult<()> {
    log.sync()?;
    store.sync()
}

/// Flush the directory containing `path`. A bare file name means the
/// current directory.
pub fn sync_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) => sync_dir(dir),
        None => sync_dir(Path::new(".")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_file::OpenMode;
    use crate::config::Config;
    use crate::registry::FileRegistry;
    use std::io::Write;

    #[test]
    fn test_durable_sync_on_written_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0xAB; 1024]).unwrap();

        let result = durable_sync(file.as_file());
        assert!(result.is_ok(), "durable_sync failed: {:?}", result.err());
    }

    #[test]
    fn test_sync_dir_after_rename() {
        let dir = tempfile::TempDir::new().unwrap();
        let from = dir.path().join("folder.index");
        let to = dir.path().join("folder.index~");
        std::fs::write(&from, b"x").unwrap();
        std::fs::rename(&from, &to).unwrap();

        assert!(sync_dir(dir.path()).is_ok());
        assert!(to.exists());
    }

    #[test]
    fn test_sync_parent_of_bare_name() {
        assert!(sync_parent(Path::new("inbox.index")).is_ok());
        let dir = tempfile::TempDir::new().unwrap();
        assert!(sync_parent(&dir.path().join("inbox.index")).is_ok());
    }

    #[test]
    fn test_store_marked_clean_after_log() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = FileRegistry::new(10);
        let store = BlockFile::open(
            dir.path().join("inbox.index"),
            OpenMode::Create,
            b"TEST.000",
            &Config::default(),
            registry.clone(),
        )
        .unwrap();
        let log = KeyFile::open(dir.path().join("inbox.index.data"), OpenMode::Create, b"LOGS.000", registry).unwrap();

        let mut head = 0;
        log.write(&mut head, &[1, 2, 3]).unwrap();
        let block = store.new_block().unwrap();
        block.write()[..4].copy_from_slice(&head.to_le_bytes());
        store.touch_block(&block).unwrap();
        assert!(!store.is_synced());

        sync_log_then_store(&log, &store).unwrap();
        assert!(store.is_synced());
        assert!(std::fs::metadata(log.path()).unwrap().len() >= log.last() as u64);
    }
}
