//! Integration tests: the text index end to end.
//!
//! These tests drive the public API the way a mail client does: documents
//! are added and superseded, the index is synced, reopened, rebuilt and
//! moved around on disk.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use mailindex_core::{FileRegistry, IndexError, OpenMode};
use mailindex_text::{IndexConfig, TextIndex};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Default tuning with a private descriptor registry, so parallel tests
/// do not evict each other's files
fn test_config() -> IndexConfig {
    IndexConfig::default().with_registry(FileRegistry::new(10))
}

fn index_path(dir: &TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

fn open_index(path: &Path) -> TextIndex {
    init_tracing();
    TextIndex::open_with_config(path, OpenMode::Create, test_config()).unwrap()
}

fn add_doc(index: &TextIndex, name: &str, words: &[&str]) {
    let mut doc = index.add_name(name).unwrap();
    for word in words {
        doc.add_word(word);
    }
    index.write_name(doc).unwrap();
}

fn found(index: &TextIndex, word: &str) -> BTreeSet<String> {
    index.find(word).unwrap().map(|name| name.unwrap()).collect()
}

fn set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Basic Operations
// ---------------------------------------------------------------------------

#[test]
fn test_round_trip_after_reopen() {
    let dir = TempDir::new().unwrap();
    let path = index_path(&dir, "inbox");

    {
        let index = open_index(&path);
        add_doc(&index, "msg-1", &["apple", "banana"]);
        add_doc(&index, "msg-2", &["banana", "cherry"]);
        index.sync().unwrap();
    }

    assert!(path.with_extension("index").exists());
    assert!(dir.path().join("inbox.index.data").exists());

    let index = open_index(&path);
    assert_eq!(found(&index, "apple"), set(&["msg-1"]));
    assert_eq!(found(&index, "banana"), set(&["msg-1", "msg-2"]));
    assert_eq!(found(&index, "cherry"), set(&["msg-2"]));
    assert!(found(&index, "durian").is_empty());

    assert!(index.has_name("msg-1").unwrap());
    assert!(!index.has_name("msg-3").unwrap());

    let names: Vec<String> = index.names().unwrap().map(|n| n.unwrap()).collect();
    assert_eq!(names, ["msg-1", "msg-2"]);
    let words: BTreeSet<String> = index.words().unwrap().map(|w| w.unwrap()).collect();
    assert_eq!(words, set(&["apple", "banana", "cherry"]));

    let info = index.info();
    assert_eq!(info.words, 3);
    assert_eq!(info.names, 2);
    assert_eq!(info.deleted_names, 0);
}

#[test]
fn test_find_normalizes_words() {
    let dir = TempDir::new().unwrap();
    let index = open_index(&index_path(&dir, "inbox"));

    add_doc(&index, "msg-1", &["Lunch", "FRIDAY"]);
    index.sync().unwrap();

    assert_eq!(found(&index, "lunch"), set(&["msg-1"]));
    assert_eq!(found(&index, "Friday"), set(&["msg-1"]));
}

#[test]
fn test_buffer_segmentation() {
    let dir = TempDir::new().unwrap();
    let index = open_index(&index_path(&dir, "inbox"));

    let mut doc = index.add_name("msg-1").unwrap();
    doc.add_buffer(b"Lunch on Fri");
    doc.add_buffer(b"day? The usual place.");
    index.write_name(doc).unwrap();

    let mut doc = index.add_name("msg-2").unwrap();
    doc.add_buffer("Grüße, the usual".as_bytes());
    // trailing partial word is flushed by write_name
    doc.add_buffer(b" plac");
    index.write_name(doc).unwrap();
    index.sync().unwrap();

    assert_eq!(found(&index, "friday"), set(&["msg-1"]));
    assert_eq!(found(&index, "usual"), set(&["msg-1", "msg-2"]));
    assert_eq!(found(&index, "place"), set(&["msg-1"]));
    assert_eq!(found(&index, "plac"), set(&["msg-2"]));
    assert_eq!(found(&index, "grüße"), set(&["msg-2"]));
    assert!(found(&index, "fri").is_empty());
}

#[test]
fn test_pending_postings_invisible_until_flushed() {
    let dir = TempDir::new().unwrap();
    let index = open_index(&index_path(&dir, "inbox"));

    for i in 0..40 {
        add_doc(&index, &format!("msg-{}", i), &["common"]);
    }

    // one full batch of 32 went to the log, 8 are still buffered
    let info = index.info();
    assert_eq!(info.chunks, 1);
    assert_eq!(info.pending_postings, 8);
    assert_eq!(found(&index, "common").len(), 32);

    index.sync().unwrap();
    assert_eq!(found(&index, "common").len(), 40);
    assert_eq!(index.info().pending_postings, 0);
}

#[test]
fn test_cursor_reset() {
    let dir = TempDir::new().unwrap();
    let index = open_index(&index_path(&dir, "inbox"));
    for i in 0..50 {
        add_doc(&index, &format!("msg-{}", i), &["word0"]);
    }
    index.sync().unwrap();

    let mut cursor = index.find("word0").unwrap();
    let first: Vec<String> = cursor.by_ref().take(10).map(|n| n.unwrap()).collect();
    cursor.reset();
    let again: Vec<String> = cursor.by_ref().take(10).map(|n| n.unwrap()).collect();
    assert_eq!(first, again);

    let mut names = index.names().unwrap();
    assert_eq!(names.by_ref().count(), 50);
    names.reset();
    assert_eq!(names.next().unwrap().unwrap(), "msg-0");
}

// ---------------------------------------------------------------------------
// Deletion and Superseding
// ---------------------------------------------------------------------------

#[test]
fn test_superseded_name_hides_old_postings() {
    let dir = TempDir::new().unwrap();
    let index = open_index(&index_path(&dir, "inbox"));

    add_doc(&index, "msg-1", &["apple"]);
    add_doc(&index, "msg-2", &["apple", "cherry"]);
    add_doc(&index, "msg-1", &["banana"]);
    index.sync().unwrap();

    assert_eq!(found(&index, "apple"), set(&["msg-2"]));
    assert_eq!(found(&index, "banana"), set(&["msg-1"]));
    assert!(index.has_name("msg-1").unwrap());

    let names: Vec<String> = index.names().unwrap().map(|n| n.unwrap()).collect();
    assert_eq!(names, ["msg-2", "msg-1"]);
}

#[test]
fn test_idempotent_delete() {
    let dir = TempDir::new().unwrap();
    let index = open_index(&index_path(&dir, "inbox"));

    for i in 0..10 {
        add_doc(&index, &format!("msg-{}", i), &["apple"]);
    }

    index.delete_name("msg-3").unwrap();
    assert!(!index.has_name("msg-3").unwrap());
    assert_eq!(index.info().deleted_names, 1);

    index.delete_name("msg-3").unwrap();
    assert!(!index.has_name("msg-3").unwrap());
    assert_eq!(index.info().deleted_names, 1);

    index.delete_name("never-added").unwrap();
    assert_eq!(index.info().deleted_names, 1);

    index.sync().unwrap();
    let names = found(&index, "apple");
    assert_eq!(names.len(), 9);
    assert!(!names.contains("msg-3"));
}

#[test]
fn test_empty_name() {
    let dir = TempDir::new().unwrap();
    let index = open_index(&index_path(&dir, "inbox"));

    add_doc(&index, "", &["hello"]);
    add_doc(&index, "b", &["hello"]);
    index.sync().unwrap();

    let names: BTreeSet<String> = index.names().unwrap().map(|n| n.unwrap()).collect();
    assert_eq!(names, set(&["", "b"]));
    assert_eq!(found(&index, "hello"), set(&["", "b"]));
    assert!(index.has_name("").unwrap());

    index.compress().unwrap();
    assert_eq!(found(&index, "hello"), set(&["", "b"]));
    assert!(index.validate().unwrap().is_clean());
}

// ---------------------------------------------------------------------------
// Compaction
// ---------------------------------------------------------------------------

#[test]
fn test_compaction_preserves_live_data() {
    let dir = TempDir::new().unwrap();
    let path = index_path(&dir, "inbox");
    let index = open_index(&path);

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let vocabulary: Vec<String> = (0..300).map(|i| format!("word{}", i)).collect();
    let mut docs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for i in 0..200 {
        let name = format!("msg-{}", i);
        let count = rng.gen_range(5..20);
        let words: BTreeSet<String> = vocabulary.choose_multiple(&mut rng, count).cloned().collect();
        let mut doc = index.add_name(&name).unwrap();
        for word in &words {
            doc.add_word(word);
        }
        index.write_name(doc).unwrap();
        docs.insert(name, words);
    }

    let mut names: Vec<String> = docs.keys().cloned().collect();
    names.shuffle(&mut rng);
    for name in names.iter().take(70) {
        index.delete_name(name).unwrap();
        docs.remove(name);
    }

    let result = index.compress().unwrap();
    assert_eq!(result.names_kept, 130);
    assert_eq!(result.names_dropped, 70);
    assert!(result.postings_dropped > 0);

    let mut expected: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    for (name, words) in &docs {
        for word in words {
            expected.entry(word.as_str()).or_default().insert(name.clone());
        }
    }

    let check = |index: &TextIndex| {
        for word in &vocabulary {
            let want = expected.get(word.as_str()).cloned().unwrap_or_default();
            assert_eq!(found(index, word), want, "postings of {}", word);
        }
        let info = index.info();
        assert_eq!(info.names, 130);
        assert_eq!(info.deleted_names, 0);
        assert_eq!(info.words as usize, expected.len());
        assert_eq!(info.chunks as usize, expected.len());
        let report = index.validate().unwrap();
        assert!(report.is_clean(), "{:?}", report.issues);
    };

    check(&index);
    assert_eq!(result.words_kept as usize, expected.len());

    drop(index);
    let reopened = open_index(&path);
    check(&reopened);
    assert!(!dir.path().join(".#inbox.index").exists());
    assert!(!dir.path().join("inbox~.index").exists());
}

#[test]
fn test_compaction_drops_dead_words() {
    let dir = TempDir::new().unwrap();
    let index = open_index(&index_path(&dir, "inbox"));

    add_doc(&index, "msg-1", &["apple", "banana"]);
    add_doc(&index, "msg-2", &["banana"]);
    index.delete_name("msg-1").unwrap();

    let result = index.compress().unwrap();
    assert_eq!(result.words_kept, 1);
    assert_eq!(result.words_dropped, 1);

    let words: Vec<String> = index.words().unwrap().map(|w| w.unwrap()).collect();
    assert_eq!(words, ["banana"]);
    assert!(found(&index, "apple").is_empty());
    assert_eq!(found(&index, "banana"), set(&["msg-2"]));
}

#[test]
fn test_sync_compacts_fragmented_words() {
    let dir = TempDir::new().unwrap();
    let index = open_index(&index_path(&dir, "inbox"));

    // 100 postings of one word: three full batches plus the sync flush
    for i in 0..100 {
        add_doc(&index, &format!("msg-{}", i), &["common"]);
    }
    assert_eq!(index.info().chunks, 3);

    index.sync().unwrap();
    let info = index.info();
    assert_eq!(info.words, 1);
    assert_eq!(info.chunks, 1);
    assert_eq!(found(&index, "common").len(), 100);
}

#[test]
fn test_sync_compacts_deleted_names() {
    let dir = TempDir::new().unwrap();
    let index = open_index(&index_path(&dir, "inbox"));

    for i in 0..10 {
        add_doc(&index, &format!("msg-{}", i), &["apple"]);
    }
    index.sync().unwrap();
    assert_eq!(index.info().names, 10);

    for i in 0..3 {
        index.delete_name(&format!("msg-{}", i)).unwrap();
    }
    index.sync().unwrap();

    let info = index.info();
    assert_eq!(info.names, 7);
    assert_eq!(info.deleted_names, 0);
    assert_eq!(found(&index, "apple").len(), 7);
}

#[test]
fn test_cursor_outlives_compaction() {
    let dir = TempDir::new().unwrap();
    let index = open_index(&index_path(&dir, "inbox"));
    add_doc(&index, "msg-1", &["apple"]);
    add_doc(&index, "msg-2", &["apple"]);
    index.sync().unwrap();

    let mut stale = index.find("apple").unwrap();
    index.compress().unwrap();

    match stale.next() {
        Some(Err(IndexError::Deleted { .. })) => {}
        other => panic!("expected Deleted from a replaced index, got {:?}", other),
    }
    assert_eq!(found(&index, "apple"), set(&["msg-1", "msg-2"]));
}

/// Live contents a failed rebuild must leave alone
fn snapshot(index: &TextIndex) -> (BTreeSet<String>, BTreeSet<String>, u32, u32, u32, u32) {
    let names = index.names().unwrap().map(|n| n.unwrap()).collect();
    let info = index.info();
    (found(index, "apple"), names, info.words, info.names, info.deleted_names, info.chunks)
}

fn fragmented_index(path: &Path) -> TextIndex {
    let index = open_index(path);
    add_doc(&index, "msg-1", &["apple", "pear"]);
    add_doc(&index, "msg-2", &["apple"]);
    add_doc(&index, "msg-3", &["apple", "plum"]);
    index.sync().unwrap();
    index.delete_name("msg-2").unwrap();
    index
}

#[test]
fn test_failed_compaction_before_rebuild() {
    let dir = TempDir::new().unwrap();
    let path = index_path(&dir, "inbox");
    let index = fragmented_index(&path);
    let before = snapshot(&index);

    // a directory where the scratch log goes cannot be cleared away
    let blocker = dir.path().join(".#inbox.index.data");
    std::fs::create_dir(&blocker).unwrap();
    std::fs::write(blocker.join("keep"), b"x").unwrap();

    assert!(index.compress().is_err());
    assert_eq!(snapshot(&index), before);
    assert_eq!(before.0, set(&["msg-1", "msg-3"]));
    assert!(index.validate().unwrap().is_clean());
    assert!(!dir.path().join("inbox~.index").exists());
    assert!(!dir.path().join("inbox~.index.data").exists());

    std::fs::remove_dir_all(&blocker).unwrap();
    let result = index.compress().unwrap();
    assert_eq!(result.names_dropped, 1);
    assert_eq!(found(&index, "apple"), set(&["msg-1", "msg-3"]));
}

#[test]
fn test_failed_compaction_swap_discards_rebuild() {
    let dir = TempDir::new().unwrap();
    let path = index_path(&dir, "inbox");
    let index = fragmented_index(&path);
    let before = snapshot(&index);

    // the old log cannot be parked over a directory, so the swap is undone
    let blocker = dir.path().join("inbox~.index.data");
    std::fs::create_dir(&blocker).unwrap();
    std::fs::write(blocker.join("keep"), b"x").unwrap();

    assert!(index.compress().is_err());
    assert_eq!(snapshot(&index), before);
    assert!(index.validate().unwrap().is_clean());
    assert!(dir.path().join("inbox.index").is_file());
    assert!(dir.path().join("inbox.index.data").is_file());
    assert!(!dir.path().join("inbox~.index").exists());
    assert!(!dir.path().join(".#inbox.index").exists());
    assert!(!dir.path().join(".#inbox.index.data").exists());

    // the live files still take writes and survive a reopen
    add_doc(&index, "msg-4", &["apple"]);
    index.sync().unwrap();
    drop(index);
    std::fs::remove_dir_all(&blocker).unwrap();
    let reopened = open_index(&path);
    assert_eq!(found(&reopened, "apple"), set(&["msg-1", "msg-3", "msg-4"]));
    assert!(reopened.validate().unwrap().is_clean());
}

// ---------------------------------------------------------------------------
// Word Cache
// ---------------------------------------------------------------------------

#[test]
fn test_word_cache_eviction() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config();
    config.indexing_cache.word_cache_limit = 16;
    init_tracing();
    let index = TextIndex::open_with_config(index_path(&dir, "inbox"), OpenMode::Create, config).unwrap();

    for i in 0..20 {
        let words: Vec<String> = (0..10).map(|j| format!("word{}", i * 10 + j)).collect();
        let refs: Vec<&str> = words.iter().map(|w| w.as_str()).collect();
        add_doc(&index, &format!("msg-{}", i), &refs);
        assert!(index.info().cached_words <= 16);
    }
    // evicted words are already in the log
    assert!(index.info().chunks >= 180);
    assert_eq!(found(&index, "word0"), set(&["msg-0"]));

    index.sync().unwrap();
    assert_eq!(index.info().words, 200);
    assert_eq!(found(&index, "word199"), set(&["msg-19"]));
}

// ---------------------------------------------------------------------------
// File Management
// ---------------------------------------------------------------------------

#[test]
fn test_check() {
    let dir = TempDir::new().unwrap();
    let path = index_path(&dir, "inbox");

    assert!(TextIndex::check(&path).is_err());

    {
        let index = open_index(&path);
        add_doc(&index, "msg-1", &["apple"]);
        index.sync().unwrap();
    }
    TextIndex::check(&path).unwrap();

    // left unsynced, as after a crash
    let index = open_index(&path);
    add_doc(&index, "msg-2", &["banana"]);
    index.sync().unwrap();
    add_doc(&index, "msg-3", &["cherry"]);
    std::mem::forget(index);
    assert!(TextIndex::check(&path).is_err());
}

#[test]
fn test_rename_and_remove_files() {
    let dir = TempDir::new().unwrap();
    let old = index_path(&dir, "inbox");
    let new = index_path(&dir, "archive");

    {
        let index = open_index(&old);
        add_doc(&index, "msg-1", &["apple"]);
    }

    TextIndex::rename_files(&old, &new).unwrap();
    assert!(TextIndex::check(&old).is_err());
    TextIndex::check(&new).unwrap();

    let index = open_index(&new);
    assert_eq!(found(&index, "apple"), set(&["msg-1"]));
    drop(index);

    TextIndex::remove_files(&new).unwrap();
    assert!(!dir.path().join("archive.index").exists());
    assert!(!dir.path().join("archive.index.data").exists());
    TextIndex::remove_files(&new).unwrap();
    TextIndex::rename_files(&new, &old).unwrap();
}

#[test]
fn test_rename_open_index() {
    let dir = TempDir::new().unwrap();
    let old = index_path(&dir, "inbox");
    let new = index_path(&dir, "archive");

    let index = open_index(&old);
    add_doc(&index, "msg-1", &["apple"]);
    index.rename(&new).unwrap();
    assert_eq!(index.path(), new);

    add_doc(&index, "msg-2", &["apple"]);
    index.sync().unwrap();
    drop(index);

    assert!(!dir.path().join("inbox.index").exists());
    let index = open_index(&new);
    assert_eq!(found(&index, "apple"), set(&["msg-1", "msg-2"]));
}

#[test]
fn test_delete_open_index() {
    let dir = TempDir::new().unwrap();
    let path = index_path(&dir, "inbox");

    let index = open_index(&path);
    add_doc(&index, "msg-1", &["apple"]);
    index.delete().unwrap();

    assert!(!dir.path().join("inbox.index").exists());
    assert!(!dir.path().join("inbox.index.data").exists());
    assert!(matches!(index.sync(), Err(IndexError::Deleted { .. })));
    assert!(matches!(index.has_name("msg-1"), Err(IndexError::Deleted { .. })));
}

#[test]
fn test_read_only() {
    let dir = TempDir::new().unwrap();
    let path = index_path(&dir, "inbox");
    {
        let index = open_index(&path);
        add_doc(&index, "msg-1", &["apple"]);
    }

    let index = TextIndex::open_with_config(&path, OpenMode::ReadOnly, test_config()).unwrap();
    assert_eq!(found(&index, "apple"), set(&["msg-1"]));
    assert!(matches!(index.add_name("msg-2"), Err(IndexError::ReadOnly { .. })));
    assert!(matches!(index.delete_name("msg-1"), Err(IndexError::ReadOnly { .. })));
    index.sync().unwrap();
}

#[test]
fn test_missing_index_read_only() {
    let dir = TempDir::new().unwrap();
    let result = TextIndex::open_with_config(index_path(&dir, "absent"), OpenMode::ReadOnly, test_config());
    match result {
        Err(err) => assert_eq!(err.raw_os_error(), Some(2)),
        Ok(_) => panic!("opened an index that does not exist"),
    }
}

// ---------------------------------------------------------------------------
// Hash-only key comparison
// ---------------------------------------------------------------------------

#[test]
fn test_colliding_names_share_lookup() {
    let dir = TempDir::new().unwrap();
    let index = open_index(&index_path(&dir, "inbox"));

    // both hash to 0x41041040; lookups compare hashes only
    add_doc(&index, "x@@@@@@", &["apple"]);
    assert!(index.has_name("y@@@@@@").unwrap());
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn test_concurrent_writers() {
    let dir = TempDir::new().unwrap();
    let index = Arc::new(open_index(&index_path(&dir, "inbox")));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                for j in 0..200 {
                    let own = format!("t{}w{}", t, j % 100);
                    add_doc(&index, &format!("thread{}-msg{}", t, j), &["shared", own.as_str()]);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    index.sync().unwrap();
    assert_eq!(found(&index, "shared").len(), 1600);
    assert_eq!(found(&index, "t3w7"), set(&["thread3-msg7", "thread3-msg107"]));
    assert_eq!(index.info().names, 1600);
    assert!(index.validate().unwrap().is_clean());
}

// ---------------------------------------------------------------------------
// Performance
// ---------------------------------------------------------------------------

#[test]
fn test_bulk_indexing_throughput() {
    let dir = TempDir::new().unwrap();
    let index = open_index(&index_path(&dir, "inbox"));

    let start = Instant::now();
    for i in 0..2000 {
        let mut doc = index.add_name(&format!("msg-{}", i)).unwrap();
        for j in 0..30 {
            doc.add_word(&format!("word{}", (i * 7 + j * 13) % 5000));
        }
        index.write_name(doc).unwrap();
    }
    index.sync().unwrap();
    let elapsed = start.elapsed();

    println!("indexed 2000 documents in {:?}", elapsed);
    assert_eq!(index.info().names, 2000);
    assert!(!found(&index, "word13").is_empty());
}
