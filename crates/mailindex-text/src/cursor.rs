//! Cursors over an index
//!
//! Cursors hold their own reference to the storage they were created on and
//! read it without taking the index lock. A cursor created before a rebuild
//! keeps reading the replaced files and fails with `Deleted` once they are
//! gone.

use std::sync::Arc;

use mailindex_core::{IndexResult, KeyTable};

use crate::index::IndexParts;

/// Key table flag marking a superseded or deleted name
pub const NAME_DELETED: u32 = 1;

/// Names of the documents containing one word, newest postings first
pub struct PostingCursor {
    parts: Arc<IndexParts>,
    head: u32,
    next: u32,
    records: Vec<u32>,
    pos: usize,
}

impl PostingCursor {
    pub(crate) fn new(parts: Arc<IndexParts>, head: u32) -> Self {
        Self {
            parts,
            head,
            next: head,
            records: Vec::new(),
            pos: 0,
        }
    }

    /// Cursor that yields nothing, for words that are not indexed
    pub(crate) fn empty(parts: Arc<IndexParts>) -> Self {
        Self::new(parts, 0)
    }

    /// Start over from the newest chunk
    pub fn reset(&mut self) {
        self.next = self.head;
        self.records.clear();
        self.pos = 0;
    }
}

impl Iterator for PostingCursor {
    type Item = IndexResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            while self.pos >= self.records.len() {
                if self.next == 0 {
                    return None;
                }
                self.pos = 0;
                match self.parts.links.read(&mut self.next) {
                    Ok(records) => self.records = records,
                    Err(err) => {
                        self.next = 0;
                        self.records.clear();
                        return Some(Err(err));
                    }
                }
            }

            let name_id = self.records[self.pos];
            self.pos += 1;
            match self.parts.name_index.lookup(name_id) {
                Ok(record) if record.flags & NAME_DELETED == 0 => return Some(Ok(record.key)),
                Ok(_) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

impl std::fmt::Debug for PostingCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostingCursor")
            .field("head", &self.head)
            .field("next", &self.next)
            .field("buffered", &(self.records.len() - self.pos.min(self.records.len())))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyKind {
    Words,
    Names,
}

/// Live words or names in the order they were first added
pub struct KeyCursor {
    parts: Arc<IndexParts>,
    kind: KeyKind,
    last: u32,
    done: bool,
}

impl KeyCursor {
    pub(crate) fn new(parts: Arc<IndexParts>, kind: KeyKind) -> Self {
        Self {
            parts,
            kind,
            last: 0,
            done: false,
        }
    }

    pub fn reset(&mut self) {
        self.last = 0;
        self.done = false;
    }

    fn table(&self) -> &KeyTable {
        match self.kind {
            KeyKind::Words => &self.parts.word_index,
            KeyKind::Names => &self.parts.name_index,
        }
    }
}

impl Iterator for KeyCursor {
    type Item = IndexResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.table().next(self.last) {
                Ok(Some(record)) => {
                    self.last = record.id;
                    if record.flags & NAME_DELETED == 0 {
                        return Some(Ok(record.key));
                    }
                }
                Ok(None) => self.done = true,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

impl std::fmt::Debug for KeyCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCursor")
            .field("kind", &self.kind)
            .field("last", &self.last)
            .field("done", &self.done)
            .finish()
    }
}
