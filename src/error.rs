//! Error types for the document pipeline.
//!
//! [`Error`] is what the services return to callers. Parsers report through
//! [`ParserError`] and the completion clients through [`CompletionError`];
//! both convert into [`Error`] where a service surfaces them.

use thiserror::Error;

/// Main error type for the document, parsing and chunk services.
#[derive(Error, Debug)]
pub enum Error {
    /// Upload rejected: extension outside the allow-list.
    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    /// Upload rejected: more bytes than the configured ceiling.
    #[error("File too large: exceeds {limit} bytes")]
    FileTooLarge { limit: u64 },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Auto-chunking requested before any text was parsed. Recoverable.
    #[error("Document {0} has no parsed text yet")]
    NoParsedText(String),

    #[error("Invalid status transition for {kind} {id}: {from} -> {to}")]
    InvalidTransition {
        kind: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Parser error: {0}")]
    Parser(#[from] ParserError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// True for input rejections that create no state.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedFormat(_) | Error::FileTooLarge { .. }
        )
    }
}

/// Convenient Result type using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by format parsers.
#[derive(Error, Debug)]
pub enum ParserError {
    /// The source file could not be read at all. Propagates unchanged.
    #[error("Cannot read {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The file was readable but its contents could not be handled.
    #[error("Invalid {format} file: {reason}")]
    Invalid { format: &'static str, reason: String },
}

impl ParserError {
    pub fn invalid(format: &'static str, reason: impl ToString) -> Self {
        ParserError::Invalid {
            format,
            reason: reason.to_string(),
        }
    }

    pub fn unreadable(path: &std::path::Path, source: std::io::Error) -> Self {
        ParserError::Unreadable {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Failures from the external completion services.
#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("Completion service is not configured")]
    NotConfigured,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Completion service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed completion response: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::UnsupportedFormat("exe".to_string());
        assert!(err.to_string().contains("Unsupported file format"));
        assert!(err.is_rejection());
        assert!(!Error::NoParsedText("d".into()).is_rejection());
    }

    #[test]
    fn parser_error_converts() {
        let err: Error = ParserError::invalid("pdf", "no pages").into();
        assert!(matches!(err, Error::Parser(_)));
        assert!(err.to_string().contains("no pages"));
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
