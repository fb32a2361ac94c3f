//! Format parsers.
//!
//! One [`DocumentParser`] per input format. Each turns a source file into
//! page text (`parse`) and page images (`convert_to_images`), and both
//! agree on the page count reported by `total_pages`:
//!
//! | Format | Pagination |
//! |--------|------------|
//! | pdf    | native pages, rasterized by a [`PageRenderer`] |
//! | docx   | simulated A4 pages of wrapped paragraph text |
//! | xlsx   | one simulated page per sheet |
//! | txt / md / json | simulated A4 pages of wrapped lines |
//!
//! Parsers are synchronous; services call them from `spawn_blocking`.

mod docx;
pub mod layout;
pub mod ooxml;
mod pdf;
pub mod text;
mod xlsx;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::ParserError;
use crate::models::FileFormat;

pub use docx::DocxParser;
pub use pdf::{PageRenderer, PdfParser, Pdftoppm};
pub use text::TextParser;
pub use xlsx::XlsxParser;

/// Text of one page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageText {
    pub page_number: u32,
    pub text: String,
}

/// Result of [`DocumentParser::parse`].
#[derive(Debug, Clone, Default)]
pub struct ParsedDocument {
    pub text: String,
    pub pages: Vec<PageText>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// One generated page image on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct PageImage {
    pub page_number: u32,
    pub image_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub format: String,
}

pub trait DocumentParser: Send + Sync {
    fn format(&self) -> FileFormat;

    fn parse(&self, file: &Path) -> Result<ParsedDocument, ParserError>;

    /// Writes one image per page into `out_dir` (created if missing), named
    /// `page_0001.<ext>` and up.
    fn convert_to_images(&self, file: &Path, out_dir: &Path) -> Result<Vec<PageImage>, ParserError>;

    fn total_pages(&self, file: &Path) -> Result<u32, ParserError>;
}

/// Fails with [`ParserError::Unreadable`] unless `file` is an existing
/// regular file.
pub fn ensure_readable(file: &Path) -> Result<(), ParserError> {
    let meta = std::fs::metadata(file).map_err(|e| ParserError::unreadable(file, e))?;
    if !meta.is_file() {
        return Err(ParserError::unreadable(
            file,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
        ));
    }
    Ok(())
}

pub fn read_source(file: &Path) -> Result<Vec<u8>, ParserError> {
    ensure_readable(file)?;
    std::fs::read(file).map_err(|e| ParserError::unreadable(file, e))
}

pub fn page_file_name(page_number: u32, extension: &str) -> String {
    format!("page_{:04}.{}", page_number, extension)
}

/// Image encoding for generated pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn from_config(value: &str) -> ImageFormat {
        match value {
            "jpg" | "jpeg" => ImageFormat::Jpeg,
            _ => ImageFormat::Png,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
        }
    }
}

/// Builds parsers that share the rendering settings.
#[derive(Clone)]
pub struct ParserRegistry {
    dpi: u32,
    image_format: ImageFormat,
    renderer: Arc<dyn PageRenderer>,
}

impl ParserRegistry {
    pub fn new(dpi: u32, image_format: ImageFormat, renderer: Arc<dyn PageRenderer>) -> Self {
        Self {
            dpi,
            image_format,
            renderer,
        }
    }

    pub fn dpi(&self) -> u32 {
        self.dpi
    }

    pub fn renderer(&self) -> Arc<dyn PageRenderer> {
        self.renderer.clone()
    }

    pub fn parser_for(&self, format: FileFormat) -> Box<dyn DocumentParser> {
        match format {
            FileFormat::Pdf => Box::new(PdfParser::new(
                self.renderer.clone(),
                self.dpi,
                self.image_format,
            )),
            FileFormat::Docx => Box::new(DocxParser::new(self.dpi, self.image_format)),
            FileFormat::Xlsx => Box::new(XlsxParser::new(self.dpi, self.image_format)),
            FileFormat::Txt | FileFormat::Md | FileFormat::Json => {
                Box::new(TextParser::new(format, self.dpi, self.image_format))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_names_are_zero_padded() {
        assert_eq!(page_file_name(1, "png"), "page_0001.png");
        assert_eq!(page_file_name(123, "jpg"), "page_0123.jpg");
    }

    #[test]
    fn missing_file_is_unreadable() {
        let err = ensure_readable(Path::new("/definitely/not/here.pdf")).unwrap_err();
        assert!(matches!(err, ParserError::Unreadable { .. }));
    }

    #[test]
    fn directory_is_unreadable() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = ensure_readable(dir.path()).unwrap_err();
        assert!(matches!(err, ParserError::Unreadable { .. }));
    }
}
