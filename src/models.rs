//! Core data models used throughout the pipeline.
//!
//! Status columns are stored as lowercase TEXT and parsed back into the closed
//! enums below; an unknown value is a decode error, never passed through.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Lifecycle of an uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Archived,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Archived => "archived",
            DocumentStatus::Failed => "failed",
        }
    }

    /// Forward-only transitions. Re-triggering a parse goes through
    /// [`DocumentStatus::can_reparse`] instead.
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Completed, Archived)
                | (Failed, Archived)
        )
    }

    pub fn can_reparse(&self) -> bool {
        matches!(self, DocumentStatus::Completed | DocumentStatus::Failed)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(DocumentStatus::Pending),
            "processing" => Ok(DocumentStatus::Processing),
            "completed" => Ok(DocumentStatus::Completed),
            "archived" => Ok(DocumentStatus::Archived),
            "failed" => Ok(DocumentStatus::Failed),
            other => Err(format!("unknown document status: '{}'", other)),
        }
    }
}

/// Lifecycle of a chunk. Both non-pending states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Confirmed,
    Archived,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Confirmed => "confirmed",
            ChunkStatus::Archived => "archived",
        }
    }

    pub fn can_transition_to(&self, next: ChunkStatus) -> bool {
        matches!(
            (self, next),
            (ChunkStatus::Pending, ChunkStatus::Confirmed)
                | (ChunkStatus::Pending, ChunkStatus::Archived)
        )
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(ChunkStatus::Pending),
            "confirmed" => Ok(ChunkStatus::Confirmed),
            "archived" => Ok(ChunkStatus::Archived),
            other => Err(format!("unknown chunk status: '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: '{}'", other)),
        }
    }
}

/// Input formats the pipeline knows how to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Pdf,
    Docx,
    Xlsx,
    Txt,
    Md,
    Json,
}

impl FileFormat {
    pub const ALL: [FileFormat; 6] = [
        FileFormat::Pdf,
        FileFormat::Docx,
        FileFormat::Xlsx,
        FileFormat::Txt,
        FileFormat::Md,
        FileFormat::Json,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Pdf => "pdf",
            FileFormat::Docx => "docx",
            FileFormat::Xlsx => "xlsx",
            FileFormat::Txt => "txt",
            FileFormat::Md => "md",
            FileFormat::Json => "json",
        }
    }

    /// Format from a file name's extension, case-insensitive.
    pub fn from_filename(name: &str) -> Option<FileFormat> {
        let ext = std::path::Path::new(name).extension()?.to_str()?;
        ext.parse().ok()
    }

    /// Native page count. Everything else is paginated by simulated pages
    /// and transcribed in a single pass.
    pub fn is_paginated(&self) -> bool {
        matches!(self, FileFormat::Pdf)
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pdf" => Ok(FileFormat::Pdf),
            "docx" => Ok(FileFormat::Docx),
            "xlsx" => Ok(FileFormat::Xlsx),
            "txt" => Ok(FileFormat::Txt),
            "md" | "markdown" => Ok(FileFormat::Md),
            "json" => Ok(FileFormat::Json),
            other => Err(format!("unknown file format: '{}'", other)),
        }
    }
}

/// One uploaded source file and its processing state.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub name: String,
    pub file_path: String,
    pub file_type: FileFormat,
    pub file_size: i64,
    pub status: DocumentStatus,
    pub total_pages: i64,
    pub chunks_count: i64,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: i64,
    pub updated_at: i64,
    pub parsed_at: Option<i64>,
}

/// One rendered page image.
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub id: String,
    pub document_id: String,
    pub page_number: i64,
    pub image_path: String,
    pub width: i64,
    pub height: i64,
    pub format: String,
    pub created_at: i64,
}

/// Extracted text. `page_number` of `None` is whole-document text.
#[derive(Debug, Clone, Serialize)]
pub struct ParsedText {
    pub id: String,
    pub document_id: String,
    pub page_number: Option<i64>,
    pub content: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub content: String,
    pub source_page: i64,
    pub start_char: Option<i64>,
    pub end_char: Option<i64>,
    pub tags: Vec<String>,
    pub status: ChunkStatus,
    /// Stored opaquely; never computed here.
    pub embedding: Option<Vec<f32>>,
    pub created_at: i64,
    pub updated_at: i64,
    pub confirmed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParsingTask {
    pub id: String,
    pub document_id: String,
    pub status: TaskStatus,
    /// Fraction of work done, 0.0 to 1.0.
    pub progress: f64,
    pub error: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

/// Fields for a manually created chunk.
#[derive(Debug, Clone, Default)]
pub struct NewChunk {
    pub content: String,
    pub source_page: i64,
    pub start_char: Option<i64>,
    pub end_char: Option<i64>,
    pub tags: Vec<String>,
}

/// Partial chunk update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct ChunkUpdate {
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub source_page: Option<i64>,
    pub embedding: Option<Vec<f32>>,
}

/// One page of a listing plus the unpaginated total.
#[derive(Debug, Clone, Serialize)]
pub struct Listing<T> {
    pub items: Vec<T>,
    pub total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_status_round_trip_and_rejects_unknown() {
        for status in [
            DocumentStatus::Pending,
            DocumentStatus::Processing,
            DocumentStatus::Completed,
            DocumentStatus::Archived,
            DocumentStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<DocumentStatus>().unwrap(), status);
        }
        assert!("done".parse::<DocumentStatus>().is_err());
    }

    #[test]
    fn document_transitions_are_forward_only() {
        use DocumentStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Completed.can_transition_to(Archived));
        assert!(Failed.can_transition_to(Archived));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Archived.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn chunk_terminal_states() {
        use ChunkStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Archived));
        assert!(!Confirmed.can_transition_to(Archived));
        assert!(!Archived.can_transition_to(Confirmed));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn format_from_filename() {
        assert_eq!(FileFormat::from_filename("a/b/Report.PDF"), Some(FileFormat::Pdf));
        assert_eq!(FileFormat::from_filename("notes.md"), Some(FileFormat::Md));
        assert_eq!(FileFormat::from_filename("virus.exe"), None);
        assert_eq!(FileFormat::from_filename("README"), None);
        assert!(FileFormat::Pdf.is_paginated());
        assert!(!FileFormat::Docx.is_paginated());
    }
}
