//! Cleanup of model-transcribed page text.
//!
//! Vision models wrap their Markdown in fences, leak fragments of their own
//! JSON envelope, emit LaTeX for anything that looks like math, and repeat
//! lines when a stream restarts. [`clean_transcript`] strips all of that and
//! is idempotent; [`dedup_lines`] is the final per-page pass before storage.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

static MD_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?im)^markdown[ \t]*\n?").unwrap());
static FENCE_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^```[A-Za-z0-9_+-]*[ \t]*\n?").unwrap());
static FENCE_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)```[ \t]*$").unwrap());

static TEXT_OBJ_QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\{['"]?text['"]?\s*:\s*['"]([^'"]*)['"]\s*\}"#).unwrap());
static TEXT_OBJ: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\{['"]?text['"]?\s*:\s*([^}]*?)\s*\}"#).unwrap());
static TEXT_JOIN: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\}\s*\{['"]?text['"]?\s*:\s*['"]?"#).unwrap());
static OBJ_JOIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\}\s*\{").unwrap());
static KEY_RESIDUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"['"](?:text|content|message)['"]\s*:\s*['"]?"#).unwrap());

static LEADING_JSON: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^\s*[{}'"\[\]]+\s*"#).unwrap());
static TRAILING_JSON: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\s*[{}'"\[\]]+\s*$"#).unwrap());
static ISOLATED_JSON: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[ \t]+[{}'"\[\]][ \t]+"#).unwrap());

static BLOCK_MATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\$[^$]*\$\$").unwrap());
static INLINE_MATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$[^$\n]*\$").unwrap());
static SUPERSCRIPT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\^\{[^}]*\}").unwrap());
static ESCAPED_NEWLINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\n([^A-Za-z]|$)").unwrap());
static LATEX_COMMAND: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\[A-Za-z]+\*?").unwrap());
static ESCAPED_BRACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\[{}]").unwrap());

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>\n]+>").unwrap());
static MD_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").unwrap());
static INNER_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]{2,}").unwrap());
static MANY_NEWLINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Strips transcription artifacts, keeping Markdown structure and
/// indentation.
pub fn clean_transcript(text: &str) -> String {
    if text.trim().is_empty() {
        return String::new();
    }

    // fences and labels
    let mut t = MD_LABEL.replace_all(text, "").into_owned();
    t = FENCE_OPEN.replace_all(&t, "").into_owned();
    t = FENCE_CLOSE.replace_all(&t, "").into_owned();

    // envelope fragments
    t = TEXT_OBJ_QUOTED.replace_all(&t, "$1").into_owned();
    t = TEXT_OBJ.replace_all(&t, "$1").into_owned();
    t = TEXT_JOIN.replace_all(&t, "").into_owned();
    t = OBJ_JOIN.replace_all(&t, "").into_owned();
    t = KEY_RESIDUE.replace_all(&t, "").into_owned();
    t = LEADING_JSON.replace(&t, "").into_owned();
    t = TRAILING_JSON.replace(&t, "").into_owned();
    t = ISOLATED_JSON.replace_all(&t, " ").into_owned();

    // math and escapes
    t = BLOCK_MATH.replace_all(&t, "").into_owned();
    t = INLINE_MATH.replace_all(&t, "").into_owned();
    t = SUPERSCRIPT.replace_all(&t, "").into_owned();
    t = ESCAPED_NEWLINE.replace_all(&t, "\n$1").into_owned();
    t = LATEX_COMMAND.replace_all(&t, "").into_owned();
    t = ESCAPED_BRACE.replace_all(&t, "").into_owned();

    // markup
    t = HTML_TAG.replace_all(&t, "").into_owned();
    t = MD_LINK.replace_all(&t, "$1").into_owned();

    // whitespace
    t = t.replace("\r\n", "\n").replace('\r', "\n");
    t = t
        .split('\n')
        .map(collapse_inner_spaces)
        .collect::<Vec<_>>()
        .join("\n");
    t = MANY_NEWLINES.replace_all(&t, "\n\n").into_owned();

    let collapsed = collapse_repeated_lines(&t);
    strip_json_edges(&collapsed)
}

fn collapse_inner_spaces(line: &str) -> String {
    let body = line.trim_start();
    let indent = &line[..line.len() - body.len()];
    format!("{}{}", indent, INNER_SPACES.replace_all(body, " "))
}

/// Drops a line that repeats the previous one, or that is a prefix of it
/// (or a suffix within a few characters). A line that extends the previous
/// one replaces it. Keeps at most one blank line between paragraphs.
fn collapse_repeated_lines(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut prev: Option<usize> = None;

    for line in text.split('\n') {
        let key = line.trim();
        if key.is_empty() {
            if out.last().is_some_and(|l| !l.is_empty()) {
                out.push(String::new());
            }
            continue;
        }

        if let Some(i) = prev {
            let p = out[i].trim().to_string();
            if key == p {
                continue;
            }
            if p.len() > key.len()
                && (p.starts_with(key) || (p.ends_with(key) && p.len() - key.len() < 5))
            {
                continue;
            }
            if key.len() > p.len() && key.starts_with(p.as_str()) && i + 1 == out.len() {
                out[i] = line.to_string();
                continue;
            }
        }

        out.push(line.to_string());
        prev = Some(out.len() - 1);
    }

    out.join("\n")
}

fn strip_json_edges(text: &str) -> String {
    let mut t = text.trim();
    loop {
        let before = t.len();
        t = t
            .trim_start_matches(['{', '[', '"', '\''])
            .trim_start()
            .trim_end_matches(['}', ']', '"', '\''])
            .trim_end();
        if t.len() == before {
            break;
        }
    }
    t.to_string()
}

fn is_rule_line(line: &str) -> bool {
    line.chars()
        .all(|c| matches!(c, '|' | '-' | ':' | '*' | '=' | '_' | ' ' | '\t'))
}

/// Final per-page pass: drops any non-blank line already seen on the page
/// (table rules and separators excepted), collapses blank runs, trims.
pub fn dedup_lines(text: &str) -> String {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut out: Vec<&str> = Vec::new();

    for line in text.split('\n') {
        let key = line.trim();
        if key.is_empty() {
            if out.last().is_some_and(|l| !l.trim().is_empty()) {
                out.push("");
            }
            continue;
        }
        if is_rule_line(key) || seen.insert(key) {
            out.push(line);
        }
    }

    out.join("\n").trim().to_string()
}
