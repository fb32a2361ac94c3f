//! Rule-based text chunker and the [`Chunker`] seam.
//!
//! Every chunker reports the [`Tier`] that produced its chunks, so callers
//! can tell model output from the rule fallback.
//!
//! [`rule_chunk`] is deterministic and needs nothing external. Text is
//! first merged into paragraphs (trimmed non-empty lines joined by `\n`),
//! then cut greedily at `chunk_size` characters. A cut backs up to the last
//! newline in the window when that keeps more than `min_chunk_size`
//! characters. The next window starts `chunk_overlap` characters before the
//! cut but never less than `min_chunk_size` past the previous start.
//!
//! Offsets are character offsets into the merged text.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::ChunkingConfig;
use crate::error::{Error, Result};

/// A chunk produced by a chunker, before it is stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkDraft {
    pub content: String,
    pub tags: Vec<String>,
    pub start_char: Option<usize>,
    pub end_char: Option<usize>,
    pub page: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_size: usize,
}

impl ChunkParams {
    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
            min_chunk_size: config.min_chunk_size,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidArgument("chunk_size must be > 0".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(Error::InvalidArgument(
                "chunk_overlap must be smaller than chunk_size".into(),
            ));
        }
        if self.min_chunk_size > self.chunk_size {
            return Err(Error::InvalidArgument(
                "min_chunk_size must not exceed chunk_size".into(),
            ));
        }
        Ok(())
    }
}

/// Which reading produced a set of chunks, from most to least faithful to
/// the model's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// The whole reply parsed as a chunk array.
    Strict,
    /// A bracketed array cut out of a chattier reply.
    Bracketed,
    /// [`rule_chunk`] on the text itself.
    Rule,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Strict => "strict",
            Tier::Bracketed => "bracketed",
            Tier::Rule => "rule",
        })
    }
}

/// Splits text into chunks.
#[async_trait]
pub trait Chunker: Send + Sync {
    fn name(&self) -> &'static str;

    async fn chunk(&self, text: &str, params: &ChunkParams) -> (Vec<ChunkDraft>, Tier);
}

pub struct RuleChunker;

#[async_trait]
impl Chunker for RuleChunker {
    fn name(&self) -> &'static str {
        "rule"
    }

    async fn chunk(&self, text: &str, params: &ChunkParams) -> (Vec<ChunkDraft>, Tier) {
        (rule_chunk(text, params), Tier::Rule)
    }
}

/// Which chunker an auto-chunk request uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkerKind {
    Semantic,
    Rule,
}

impl ChunkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkerKind::Semantic => "semantic",
            ChunkerKind::Rule => "rule",
        }
    }
}

impl FromStr for ChunkerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "semantic" | "llm" => Ok(ChunkerKind::Semantic),
            "rule" => Ok(ChunkerKind::Rule),
            other => Err(Error::InvalidArgument(format!(
                "Unknown chunker: '{}'. Must be semantic or rule.",
                other
            ))),
        }
    }
}

/// Trimmed non-empty lines joined with `\n`.
pub fn merge_paragraphs(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn rule_chunk(text: &str, params: &ChunkParams) -> Vec<ChunkDraft> {
    let merged: Vec<char> = merge_paragraphs(text).chars().collect();
    let length = merged.len();
    let size = params.chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < length {
        let mut end = (start + size).min(length);

        let floor = start + params.min_chunk_size;
        if let Some(boundary) = (floor + 1..end).rev().find(|&i| merged[i] == '\n') {
            end = boundary;
        }

        let content: String = merged[start..end].iter().collect();
        let content = content.trim();
        if !content.is_empty() {
            chunks.push(ChunkDraft {
                content: content.to_string(),
                tags: Vec::new(),
                start_char: Some(start),
                end_char: Some(end),
                page: None,
            });
        }

        if end >= length {
            break;
        }
        let next = end.saturating_sub(params.chunk_overlap).max(floor);
        start = next.max(start + 1);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(size: usize, overlap: usize, min: usize) -> ChunkParams {
        ChunkParams {
            chunk_size: size,
            chunk_overlap: overlap,
            min_chunk_size: min,
        }
    }

    #[test]
    fn empty_text_has_no_chunks() {
        assert!(rule_chunk("", &params(500, 50, 100)).is_empty());
        assert!(rule_chunk(" \n\n \t", &params(500, 50, 100)).is_empty());
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = rule_chunk("  Alpha  \n\n\n Beta", &params(100, 10, 20));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "Alpha\nBeta");
        assert_eq!(chunks[0].start_char, Some(0));
        assert_eq!(chunks[0].end_char, Some(10));
    }

    #[test]
    fn cuts_back_to_newline_past_minimum() {
        let text = format!("{}\n{}", "a".repeat(150), "b".repeat(400));
        let chunks = rule_chunk(&text, &params(200, 50, 100));
        assert_eq!(chunks[0].content, "a".repeat(150));
        assert_eq!(chunks[0].end_char, Some(150));
        // next window starts overlap chars before the cut
        assert_eq!(chunks[1].start_char, Some(100));
    }

    #[test]
    fn ignores_newline_before_minimum() {
        let text = format!("{}\n{}", "a".repeat(50), "b".repeat(400));
        let chunks = rule_chunk(&text, &params(200, 50, 100));
        assert_eq!(chunks[0].end_char, Some(200));
    }

    #[test]
    fn chunks_cover_text_and_respect_minimum() {
        let text: String = (0..120)
            .map(|i| {
                let sep = if i % 5 == 4 { "\n" } else { " " };
                format!("Sentence number {} of the sample body.{}", i, sep)
            })
            .collect();
        let p = params(500, 50, 100);
        let chunks = rule_chunk(&text, &p);
        assert!(chunks.len() > 1);

        let merged: Vec<char> = merge_paragraphs(&text).chars().collect();
        assert_eq!(chunks[0].start_char, Some(0));
        assert_eq!(chunks.last().unwrap().end_char, Some(merged.len()));
        for pair in chunks.windows(2) {
            // consecutive windows overlap or touch, so nothing is skipped
            assert!(pair[1].start_char.unwrap() <= pair[0].end_char.unwrap());
            assert!(pair[1].start_char > pair[0].start_char);
        }
        for c in &chunks[..chunks.len() - 1] {
            assert!(c.content.chars().count() >= p.min_chunk_size);
            assert!(c.content.chars().count() <= p.chunk_size);
        }
    }

    #[test]
    fn content_is_trimmed_slice_of_merged_text() {
        let text: String = (0..60)
            .map(|i| format!("  Line {} of the quarterly report.  \n\n", i))
            .collect();
        let merged: Vec<char> = merge_paragraphs(&text).chars().collect();
        for p in [params(80, 0, 10), params(80, 25, 30), params(200, 50, 100)] {
            let chunks = rule_chunk(&text, &p);
            assert!(chunks.len() > 1);
            for c in &chunks {
                let slice: String = merged[c.start_char.unwrap()..c.end_char.unwrap()]
                    .iter()
                    .collect();
                assert_eq!(c.content, slice.trim());
            }
        }
    }

    #[test]
    fn chunks_without_overlap_rebuild_merged_text() {
        let text: String = (0..60)
            .map(|i| format!("Line {} of the quarterly report.\n", i))
            .collect();
        let merged = merge_paragraphs(&text);
        let chars: Vec<char> = merged.chars().collect();
        let chunks = rule_chunk(&text, &params(80, 0, 10));
        assert!(chunks.len() > 1);

        let tiled: String = chunks
            .iter()
            .map(|c| chars[c.start_char.unwrap()..c.end_char.unwrap()].iter().collect::<String>())
            .collect();
        assert_eq!(tiled, merged);

        // every cut lands on a line break, so the contents rejoin on one
        let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents.join("\n"), merged);
    }

    #[test]
    fn single_short_paragraph_is_kept_whole() {
        let chunks = rule_chunk("   One short paragraph.   ", &params(500, 50, 100));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "One short paragraph.");
        assert_eq!(chunks[0].start_char, Some(0));
        assert_eq!(chunks[0].end_char, Some(20));
        assert_eq!(chunks[0].page, None);
    }

    #[tokio::test]
    async fn rule_chunker_reports_rule_tier() {
        let (drafts, tier) = RuleChunker.chunk("", &params(500, 50, 100)).await;
        assert!(drafts.is_empty());
        assert_eq!(tier, Tier::Rule);
        assert!(Tier::Strict < Tier::Bracketed && Tier::Bracketed < Tier::Rule);
        assert_eq!(serde_json::to_value(Tier::Bracketed).unwrap(), "bracketed");
    }

    #[test]
    fn offsets_count_characters_not_bytes() {
        let text = "知识".repeat(30);
        let chunks = rule_chunk(&text, &params(40, 0, 10));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].end_char, Some(40));
        assert_eq!(chunks[1].content.chars().count(), 20);
    }

    #[test]
    fn zero_minimum_still_advances() {
        let chunks = rule_chunk("abcdef", &params(2, 1, 0));
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[0].content, "ab");
        assert_eq!(chunks[4].content, "ef");
    }

    #[test]
    fn deterministic() {
        let text = "Alpha\nBeta\nGamma\nDelta ".repeat(40);
        let p = params(60, 10, 20);
        assert_eq!(rule_chunk(&text, &p), rule_chunk(&text, &p));
    }

    #[test]
    fn params_validation() {
        assert!(params(500, 50, 100).validate().is_ok());
        assert!(params(0, 0, 0).validate().is_err());
        assert!(params(100, 100, 10).validate().is_err());
        assert!(params(100, 10, 101).validate().is_err());
    }

    #[test]
    fn chunker_kind_parses() {
        assert_eq!("rule".parse::<ChunkerKind>().unwrap(), ChunkerKind::Rule);
        assert_eq!("semantic".parse::<ChunkerKind>().unwrap(), ChunkerKind::Semantic);
        assert!("fancy".parse::<ChunkerKind>().is_err());
    }
}
