//! Write-back cache of pending postings
//!
//! Each word being indexed has an entry holding its key id, the log offset
//! of its newest posting chunk and the document ids not yet appended to the
//! log. Entries are ordered by last use so the least recently used ones are
//! flushed first when the cache outgrows its limit.

use std::collections::BTreeMap;

use hashbrown::HashMap;

/// Postings of one word waiting to be appended to the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingWord {
    /// Id of the word in the word key table
    pub word_id: u32,
    /// Log offset of the word's newest chunk, 0 when it has none
    pub data: u32,
    pub ids: Vec<u32>,
}

struct Slot {
    pending: PendingWord,
    tick: u64,
}

#[derive(Default)]
pub(crate) struct WordCache {
    entries: HashMap<String, Slot>,
    lru: BTreeMap<u64, String>,
    tick: u64,
}

impl WordCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry for `word`, promoted to most recently used
    pub fn get_mut(&mut self, word: &str) -> Option<&mut PendingWord> {
        self.tick += 1;
        let tick = self.tick;
        let slot = self.entries.get_mut(word)?;
        if let Some(key) = self.lru.remove(&slot.tick) {
            self.lru.insert(tick, key);
        }
        slot.tick = tick;
        Some(&mut slot.pending)
    }

    pub fn get(&self, word: &str) -> Option<&PendingWord> {
        self.entries.get(word).map(|slot| &slot.pending)
    }

    pub fn peek_mut(&mut self, word: &str) -> Option<&mut PendingWord> {
        self.entries.get_mut(word).map(|slot| &mut slot.pending)
    }

    pub fn insert(&mut self, word: String, pending: PendingWord) {
        self.tick += 1;
        let tick = self.tick;
        self.lru.insert(tick, word.clone());
        if let Some(old) = self.entries.insert(word, Slot { pending, tick }) {
            self.lru.remove(&old.tick);
        }
    }

    pub fn remove(&mut self, word: &str) -> Option<PendingWord> {
        let slot = self.entries.remove(word)?;
        self.lru.remove(&slot.tick);
        Some(slot.pending)
    }

    /// Words from least to most recently used
    pub fn words_by_age(&self) -> Vec<String> {
        self.lru.values().cloned().collect()
    }

    /// Up to `n` least recently used words
    pub fn oldest(&self, n: usize) -> Vec<String> {
        self.lru.values().take(n).cloned().collect()
    }

    /// Pending ids across all entries
    pub fn pending_ids(&self) -> usize {
        self.entries.values().map(|slot| slot.pending.ids.len()).sum()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.lru.clear();
    }
}
