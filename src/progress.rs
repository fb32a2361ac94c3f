//! Parse progress reporting.
//!
//! Reports per-page progress while a document is parsed so `pagemill upload`
//! and `pagemill reparse` can show how far transcription has come. Progress
//! goes to **stderr** so stdout stays parseable for scripts. Page events
//! arrive in completion order, not page order.

use std::io::Write;

use crate::models::DocumentStatus;

/// A single progress event for one document parse.
#[derive(Clone, Debug, PartialEq)]
pub enum ParseProgressEvent {
    /// Waiting for page images before transcription starts.
    WaitingForPages { document_id: String },
    /// `done` of `total` pages finished; `page` is the one that just did.
    Page {
        document_id: String,
        page: u32,
        done: u64,
        total: u64,
    },
    /// No page images appeared within `waited_secs`; transcription was
    /// abandoned and the parsing task failed.
    PagesTimedOut { document_id: String, waited_secs: u64 },
    /// Parse finished with the document in `status`.
    Finished {
        document_id: String,
        status: DocumentStatus,
    },
}

/// Reports parse progress. Implementations write to stderr (human or JSON).
pub trait ParseProgressReporter: Send + Sync {
    fn report(&self, event: ParseProgressEvent);
}

/// Human-friendly progress on stderr: "parse 3f2a…  page 4  2 / 10 pages".
pub struct StderrProgress;

impl ParseProgressReporter for StderrProgress {
    fn report(&self, event: ParseProgressEvent) {
        let line = match &event {
            ParseProgressEvent::WaitingForPages { document_id } => {
                format!("parse {}  waiting for page images...\n", short_id(document_id))
            }
            ParseProgressEvent::Page {
                document_id,
                page,
                done,
                total,
            } => format!(
                "parse {}  page {}  {} / {} pages\n",
                short_id(document_id),
                page,
                format_number(*done),
                format_number(*total)
            ),
            ParseProgressEvent::PagesTimedOut {
                document_id,
                waited_secs,
            } => format!(
                "parse {}  no page images after {}s, giving up\n",
                short_id(document_id),
                waited_secs
            ),
            ParseProgressEvent::Finished {
                document_id,
                status,
            } => format!("parse {}  {}\n", short_id(document_id), status),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ParseProgressReporter for JsonProgress {
    fn report(&self, event: ParseProgressEvent) {
        if let Ok(line) = serde_json::to_string(&event_json(&event)) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

fn event_json(event: &ParseProgressEvent) -> serde_json::Value {
    match event {
        ParseProgressEvent::WaitingForPages { document_id } => serde_json::json!({
            "event": "progress",
            "document_id": document_id,
            "phase": "waiting"
        }),
        ParseProgressEvent::Page {
            document_id,
            page,
            done,
            total,
        } => serde_json::json!({
            "event": "progress",
            "document_id": document_id,
            "phase": "transcribing",
            "page": page,
            "n": done,
            "total": total
        }),
        ParseProgressEvent::PagesTimedOut {
            document_id,
            waited_secs,
        } => serde_json::json!({
            "event": "timeout",
            "document_id": document_id,
            "phase": "waiting",
            "waited_secs": waited_secs
        }),
        ParseProgressEvent::Finished {
            document_id,
            status,
        } => serde_json::json!({
            "event": "finished",
            "document_id": document_id,
            "status": status
        }),
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ParseProgressReporter for NoProgress {
    fn report(&self, _event: ParseProgressEvent) {}
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "off" | "none" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> Box<dyn ParseProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
