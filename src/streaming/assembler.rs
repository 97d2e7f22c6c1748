//! Ordered transcript assembly for streaming sessions.
//!
//! Chunk results arrive in completion order; assembly emits them in index
//! order, deduplicates words repeated across overlapped boundaries, and
//! stands a gap marker in for chunks that permanently failed.

use std::collections::BTreeMap;

use crate::defaults::{DEDUP_MAX_WORDS, GAP_MARKER};
use crate::protocol::ChunkRecord;

enum Slot {
    Text {
        text: String,
        timing_ms: u64,
        attempts: u32,
    },
    Gap {
        error: String,
        attempts: u32,
    },
}

pub struct TranscriptAssembler {
    slots: BTreeMap<u64, Slot>,
    dedup_boundaries: bool,
}

impl TranscriptAssembler {
    pub fn new(dedup_boundaries: bool) -> Self {
        Self {
            slots: BTreeMap::new(),
            dedup_boundaries,
        }
    }

    pub fn add_success(&mut self, index: u64, text: String, timing_ms: u64, attempts: u32) {
        self.slots.insert(
            index,
            Slot::Text {
                text,
                timing_ms,
                attempts,
            },
        );
    }

    pub fn add_gap(&mut self, index: u64, error: String, attempts: u32) {
        self.slots.insert(index, Slot::Gap { error, attempts });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Join everything collected so far in index order.
    pub fn assemble(&self) -> (String, Vec<ChunkRecord>) {
        let mut pieces: Vec<String> = Vec::with_capacity(self.slots.len());
        let mut records = Vec::with_capacity(self.slots.len());
        // Text of the previous successful chunk; a gap resets it so dedup
        // never bridges missing audio.
        let mut prev_text: Option<&str> = None;

        for (&index, slot) in &self.slots {
            match slot {
                Slot::Text {
                    text,
                    timing_ms,
                    attempts,
                } => {
                    let emitted = match prev_text {
                        Some(prev) if self.dedup_boundaries => {
                            strip_boundary_overlap(prev, text, DEDUP_MAX_WORDS)
                        }
                        _ => text.trim().to_string(),
                    };
                    if !emitted.is_empty() {
                        pieces.push(emitted);
                    }
                    prev_text = Some(text);
                    records.push(ChunkRecord {
                        index,
                        text: Some(text.clone()),
                        error: None,
                        timing_ms: *timing_ms,
                        attempts: *attempts,
                    });
                }
                Slot::Gap { error, attempts } => {
                    pieces.push(GAP_MARKER.to_string());
                    prev_text = None;
                    records.push(ChunkRecord {
                        index,
                        text: None,
                        error: Some(error.clone()),
                        timing_ms: 0,
                        attempts: *attempts,
                    });
                }
            }
        }

        (pieces.join(" "), records)
    }
}

/// Drop the longest run of words (up to `max_words`) that ends `prev` and
/// also starts `next`. Comparison ignores case and surrounding punctuation;
/// the surviving words keep their original form.
fn strip_boundary_overlap(prev: &str, next: &str, max_words: usize) -> String {
    let prev_words: Vec<&str> = prev.split_whitespace().collect();
    let next_words: Vec<&str> = next.split_whitespace().collect();
    let limit = max_words.min(prev_words.len()).min(next_words.len());

    let mut overlap = 0;
    for run in (1..=limit).rev() {
        let tail = &prev_words[prev_words.len() - run..];
        let head = &next_words[..run];
        if tail
            .iter()
            .zip(head)
            .all(|(a, b)| normalize(a) == normalize(b))
        {
            overlap = run;
            break;
        }
    }

    next_words[overlap..].join(" ")
}

fn normalize(word: &str) -> String {
    word.trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}
