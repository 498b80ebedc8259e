//! Index statistics and consistency checking

use std::fmt;
use std::path::PathBuf;

use hashbrown::{HashMap, HashSet};
use mailindex_core::IndexResult;

use crate::cursor::NAME_DELETED;
use crate::index::TextIndex;

/// Snapshot of an index's counters
#[derive(Debug, Clone, PartialEq)]
pub struct IndexInfo {
    pub path: PathBuf,
    pub words: u32,
    pub names: u32,
    pub deleted_names: u32,
    /// Posting chunks appended to the log
    pub chunks: u32,
    pub word_fragmentation: f64,
    pub name_fragmentation: f64,
    pub blocks: u32,
    pub log_bytes: u64,
    /// Words in the write-back cache
    pub cached_words: usize,
    /// Posting ids not yet in the log
    pub pending_postings: usize,
    pub cached_blocks: usize,
}

impl fmt::Display for IndexInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Index: {}", self.path.display())?;
        writeln!(f, "  words: {}  chunks: {}  fragmentation: {:.0}%", self.words, self.chunks, self.word_fragmentation * 100.0)?;
        writeln!(
            f,
            "  names: {}  deleted: {}  fragmentation: {:.0}%",
            self.names,
            self.deleted_names,
            self.name_fragmentation * 100.0
        )?;
        write!(f, "  blocks: {}  log bytes: {}", self.blocks, self.log_bytes)
    }
}

/// One inconsistency found by [`TextIndex::validate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    /// Two name entries share an id
    DuplicateNameId { id: u32, name: String, previous: String },
    /// A word entry with no posting chain
    WordWithoutPostings { word: String },
    /// Two words point at the same chain
    SharedPostings { word: String, other: String, data: u32 },
    /// The same word is stored twice
    DuplicateWord { word: String },
    /// A posting references an id that is not a name
    UnknownName { word: String, name_id: u32 },
    /// A word lists the same live name more than once
    RepeatedName { word: String, name: String },
    /// A chunk of a word's chain could not be read
    UnreadableChain { word: String, offset: u32, error: String },
    /// The partition table maps a live key to another id
    LookupMismatch { table: &'static str, key: String, id: u32, found: u32 },
    /// A partition table failed its structural check
    Partition { table: &'static str, problem: String },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateNameId { id, name, previous } => {
                write!(f, "name '{}' duplicates key {:#x} with name '{}'", name, id, previous)
            }
            Self::WordWithoutPostings { word } => write!(f, "word '{}' has no postings", word),
            Self::SharedPostings { word, other, data } => {
                write!(f, "word '{}' shares postings at {:#x} with '{}'", word, data, other)
            }
            Self::DuplicateWord { word } => write!(f, "word '{}' occurs more than once", word),
            Self::UnknownName { word, name_id } => {
                write!(f, "word '{}' references unknown name {:#x}", word, name_id)
            }
            Self::RepeatedName { word, name } => write!(f, "word '{}' lists name '{}' more than once", word, name),
            Self::UnreadableChain { word, offset, error } => {
                write!(f, "postings of word '{}' unreadable at {:#x}: {}", word, offset, error)
            }
            Self::LookupMismatch { table, key, id, found } => {
                write!(f, "{} lookup of '{}' gives {:#x}, entry is {:#x}", table, key, found, id)
            }
            Self::Partition { table, problem } => write!(f, "{}: {}", table, problem),
        }
    }
}

/// Outcome of [`TextIndex::validate`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub names: u32,
    pub deleted_names: u32,
    pub words: u32,
    pub postings: u64,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

impl TextIndex {
    /// Walk every table and chain and report inconsistencies. Words that
    /// only have unflushed postings are reported as having none.
    pub fn validate(&self) -> IndexResult<ValidationReport> {
        let state = self.lock();
        let parts = state.parts.clone();
        let mut report = ValidationReport::default();

        for (table, partitions) in [("word partitions", &parts.word_hash), ("name partitions", &parts.name_hash)] {
            for problem in partitions.verify()? {
                report.issues.push(ValidationIssue::Partition { table, problem });
            }
        }

        // id -> (name, live)
        let mut names: HashMap<u32, (String, bool)> = HashMap::new();
        let mut last = 0;
        while let Some(record) = parts.name_index.next(last)? {
            last = record.id;
            let live = record.flags & NAME_DELETED == 0;
            if let Some((previous, _)) = names.get(&record.id) {
                report.issues.push(ValidationIssue::DuplicateNameId {
                    id: record.id,
                    name: record.key,
                    previous: previous.clone(),
                });
                continue;
            }
            if live {
                report.names += 1;
                let found = parts.name_hash.lookup(&record.key)?;
                if found != record.id {
                    report.issues.push(ValidationIssue::LookupMismatch {
                        table: "names",
                        key: record.key.clone(),
                        id: record.id,
                        found,
                    });
                }
            } else {
                report.deleted_names += 1;
            }
            names.insert(record.id, (record.key, live));
        }

        let mut heads: HashMap<u32, String> = HashMap::new();
        let mut seen_words: HashSet<String> = HashSet::new();
        let mut last = 0;
        while let Some(record) = parts.word_index.next(last)? {
            last = record.id;
            let word = record.key;
            report.words += 1;

            if !seen_words.insert(word.clone()) {
                report.issues.push(ValidationIssue::DuplicateWord { word: word.clone() });
            }
            let found = parts.word_hash.lookup(&word)?;
            if found != record.id {
                report.issues.push(ValidationIssue::LookupMismatch {
                    table: "words",
                    key: word.clone(),
                    id: record.id,
                    found,
                });
            }

            let pending = state.cache.get(&word).map(|p| p.data);
            let data = pending.unwrap_or(record.data);
            if data == 0 {
                report.issues.push(ValidationIssue::WordWithoutPostings { word });
                continue;
            }
            match heads.get(&data) {
                Some(other) => report.issues.push(ValidationIssue::SharedPostings {
                    word: word.clone(),
                    other: other.clone(),
                    data,
                }),
                None => {
                    heads.insert(data, word.clone());
                }
            }

            let mut used: HashSet<u32> = HashSet::new();
            let mut next = data;
            while next != 0 {
                let offset = next;
                let ids = match parts.links.read(&mut next) {
                    Ok(ids) => ids,
                    Err(err) => {
                        report.issues.push(ValidationIssue::UnreadableChain {
                            word: word.clone(),
                            offset,
                            error: err.to_string(),
                        });
                        break;
                    }
                };
                for name_id in ids {
                    report.postings += 1;
                    match names.get(&name_id) {
                        None => report.issues.push(ValidationIssue::UnknownName {
                            word: word.clone(),
                            name_id,
                        }),
                        Some((name, true)) if !used.insert(name_id) => {
                            report.issues.push(ValidationIssue::RepeatedName {
                                word: word.clone(),
                                name: name.clone(),
                            });
                        }
                        Some(_) => {}
                    }
                }
            }
        }

        Ok(report)
    }
}
