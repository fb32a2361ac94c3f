//! Semantic chunking through a text completion service.
//!
//! The text is sanitized and sent with instructions to split it into
//! self-contained knowledge fragments, returned as a JSON array of
//! `{"content", "tags"}`. The reply is read in tiers, and the tier that
//! produced the result is logged and returned:
//!
//! | Tier | Input |
//! |------|-------|
//! | `strict`    | the whole reply (minus a code fence) parses as an array |
//! | `bracketed` | the text from the first `[` to the last `]` parses |
//! | `rule`      | anything else: the service failed or nothing usable came back |
//!
//! The rule tier is [`rule_chunk`] on the original text.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::chunk::{rule_chunk, ChunkDraft, ChunkParams, Chunker, Tier};
use crate::completion::TextCompletion;

const TRUNCATION_NOTE: &str = "\n...(content truncated)";

const SYSTEM_PROMPT: &str = "You are a knowledge engineering assistant. \
Organize document content into knowledge chunks suitable for knowledge-base retrieval. \
Each chunk covers one clear point or scenario, is complete, and can be understood on its own. \
Reply with a JSON array only, without any explanation.";

static CONTROL_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F-\x9F]").unwrap());
static HORIZONTAL_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+").unwrap());
static MANY_NEWLINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

const ZERO_WIDTH: [char; 6] = [
    '\u{200B}', '\u{200C}', '\u{200D}', '\u{200E}', '\u{200F}', '\u{FEFF}',
];

/// Strips control (except `\n` and `\t`) and zero-width characters,
/// collapses horizontal whitespace and blank-line runs, trims every line,
/// and caps the result at `max_chars` characters.
pub fn sanitize_for_llm(text: &str, max_chars: usize) -> String {
    if text.is_empty() {
        return String::new();
    }
    let mut t = CONTROL_CHARS.replace_all(text, "").into_owned();
    t.retain(|c| !ZERO_WIDTH.contains(&c));
    t = HORIZONTAL_SPACE.replace_all(&t, " ").into_owned();
    t = MANY_NEWLINES.replace_all(&t, "\n\n").into_owned();
    t = t.split('\n').map(str::trim).collect::<Vec<_>>().join("\n");

    if t.chars().count() > max_chars {
        t = t.chars().take(max_chars).collect();
        t.push_str(TRUNCATION_NOTE);
    }
    t.trim().to_string()
}

pub fn user_prompt(text: &str, chunk_size: usize) -> String {
    format!(
        "Split the document below into knowledge chunks.\n\
         \n\
         Requirements:\n\
         1. Each chunk describes one reasonably complete point and may include the context it needs.\n\
         2. Keep the key information of the original. Do not embellish or invent content.\n\
         3. Keep each chunk within about {} characters; slightly longer is acceptable when necessary.\n\
         4. Write concisely.\n\
         5. Return a JSON array whose elements look like:\n\
         {{\n  \"content\": \"chunk text, keeping paragraph breaks\",\n  \"tags\": [\"optional tag 1\", \"optional tag 2\"]\n}}\n\
         \n\
         Notes:\n\
         - Return strict JSON. Do not wrap it in a ```json code block.\n\
         - If no tags apply, use an empty array.\n\
         \n\
         Document:\n\
         --------------------\n\
         {}\n\
         --------------------\n",
        chunk_size, text
    )
}

fn strip_code_fence(reply: &str) -> &str {
    let t = reply.trim();
    if !t.starts_with("```") {
        return t;
    }
    let body = match t.find('\n') {
        Some(i) => &t[i + 1..],
        None => t.trim_start_matches('`').trim_start_matches("json"),
    };
    body.trim_end().trim_end_matches("```").trim()
}

fn drafts_from_value(value: serde_json::Value) -> Vec<ChunkDraft> {
    let serde_json::Value::Array(items) = value else {
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let content = obj.get("content")?.as_str()?.trim();
            if content.is_empty() {
                return None;
            }
            let tags = match obj.get("tags") {
                Some(serde_json::Value::String(s)) => vec![s.trim().to_string()],
                Some(serde_json::Value::Array(list)) => list
                    .iter()
                    .map(|t| match t {
                        serde_json::Value::String(s) => s.trim().to_string(),
                        other => other.to_string(),
                    })
                    .collect(),
                _ => Vec::new(),
            };
            Some(ChunkDraft {
                content: content.to_string(),
                tags: tags.into_iter().filter(|t| !t.is_empty()).collect(),
                ..Default::default()
            })
        })
        .collect()
}

/// Reads a completion reply. `None` when neither the strict nor the
/// bracketed reading yields at least one usable chunk.
pub fn parse_llm_output(reply: &str) -> Option<(Vec<ChunkDraft>, Tier)> {
    let body = strip_code_fence(reply);
    if body.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let drafts = drafts_from_value(value);
        if !drafts.is_empty() {
            return Some((drafts, Tier::Strict));
        }
    }

    let (start, end) = (body.find('[')?, body.rfind(']')?);
    if end <= start {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(&body[start..=end]) {
        Ok(value) => {
            let drafts = drafts_from_value(value);
            (!drafts.is_empty()).then_some((drafts, Tier::Bracketed))
        }
        Err(e) => {
            tracing::debug!(error = %e, "bracketed chunk array did not parse");
            None
        }
    }
}

pub struct SemanticChunker {
    completion: Arc<dyn TextCompletion>,
    max_input_chars: usize,
}

impl SemanticChunker {
    pub fn new(completion: Arc<dyn TextCompletion>, max_input_chars: usize) -> Self {
        Self {
            completion,
            max_input_chars,
        }
    }

    pub async fn chunk_with_tier(&self, text: &str, params: &ChunkParams) -> (Vec<ChunkDraft>, Tier) {
        if text.trim().is_empty() {
            return (Vec::new(), Tier::Rule);
        }
        let fallback = |reason: &str| {
            tracing::info!(tier = %Tier::Rule, reason, "semantic chunking fell back");
            (rule_chunk(text, params), Tier::Rule)
        };

        let cleaned = sanitize_for_llm(text, self.max_input_chars);
        if cleaned.is_empty() {
            return fallback("sanitized text is empty");
        }

        let reply = match self
            .completion
            .complete(SYSTEM_PROMPT, &user_prompt(&cleaned, params.chunk_size))
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, "semantic chunking request failed");
                return fallback("completion failed");
            }
        };

        match parse_llm_output(&reply) {
            Some((drafts, tier)) => {
                tracing::info!(%tier, chunks = drafts.len(), "semantic chunking succeeded");
                (drafts, tier)
            }
            None => {
                let preview: String = reply.chars().take(200).collect();
                tracing::warn!(reply = %preview, "unusable semantic chunking reply");
                fallback("no usable chunks in reply")
            }
        }
    }
}

#[async_trait]
impl Chunker for SemanticChunker {
    fn name(&self) -> &'static str {
        "semantic"
    }

    async fn chunk(&self, text: &str, params: &ChunkParams) -> (Vec<ChunkDraft>, Tier) {
        self.chunk_with_tier(text, params).await
    }
}
