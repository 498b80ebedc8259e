//! Document handles
//!
//! An [`IndexName`] collects the words of one document before
//! [`TextIndex::write_name`](crate::TextIndex::write_name) appends the
//! document's id to each word's postings. Text can be fed word by word or
//! as raw bytes that are segmented here.

use hashbrown::HashSet;

use crate::config::Normalizer;

/// Words gathered for one document
pub struct IndexName {
    name: String,
    name_id: u32,
    words: HashSet<String>,
    /// Partial word at the end of the last buffer
    buffer: String,
    /// Incomplete UTF-8 sequence at the end of the last buffer
    carry: Vec<u8>,
    normalizer: Normalizer,
    max_word_len: usize,
}

impl IndexName {
    pub(crate) fn new(name: String, name_id: u32, normalizer: Normalizer, max_word_len: usize) -> Self {
        Self {
            name,
            name_id,
            words: HashSet::new(),
            buffer: String::new(),
            carry: Vec::new(),
            normalizer,
            max_word_len,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the document in the name key table
    pub fn name_id(&self) -> u32 {
        self.name_id
    }

    /// Distinct words collected so far
    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    pub fn contains_word(&self, word: &str) -> bool {
        self.words.contains(&(self.normalizer)(word))
    }

    /// Add one word. Empty words and words longer than the configured
    /// maximum after normalization are ignored.
    pub fn add_word(&mut self, word: &str) {
        let word = (self.normalizer)(word);
        if word.is_empty() || word.len() > self.max_word_len {
            return;
        }
        self.words.insert(word);
    }

    /// Segment raw text into lower-cased alphanumeric words.
    ///
    /// Invalid UTF-8 is skipped. A sequence cut off at the end of `bytes`
    /// is completed by the next call, and a word cut off at the end is
    /// continued by it, so a document may be fed in arbitrary pieces.
    /// Returns the number of bytes consumed, always `bytes.len()`.
    pub fn add_buffer(&mut self, bytes: &[u8]) -> usize {
        let mut input = std::mem::take(&mut self.carry);
        input.extend_from_slice(bytes);

        let mut rest = &input[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.push_text(text);
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    if let Ok(text) = std::str::from_utf8(valid) {
                        self.push_text(text);
                    }
                    match err.error_len() {
                        Some(bad) => rest = &after[bad..],
                        None => {
                            self.carry = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        bytes.len()
    }

    /// Index the trailing partial word and drop any dangling sequence
    pub(crate) fn finish(&mut self) {
        self.carry.clear();
        self.end_word();
    }

    pub(crate) fn take_words(&mut self) -> Vec<String> {
        self.words.drain().collect()
    }

    fn push_text(&mut self, text: &str) {
        for c in text.chars() {
            if c.is_alphanumeric() {
                self.buffer.extend(c.to_lowercase());
            } else {
                self.end_word();
            }
        }
    }

    fn end_word(&mut self) {
        if !self.buffer.is_empty() && self.buffer.len() <= self.max_word_len {
            let word = std::mem::take(&mut self.buffer);
            self.add_word(&word);
        }
        self.buffer.clear();
    }
}

impl std::fmt::Debug for IndexName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexName")
            .field("name", &self.name)
            .field("name_id", &self.name_id)
            .field("words", &self.words.len())
            .finish()
    }
}
