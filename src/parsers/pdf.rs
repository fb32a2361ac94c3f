//! PDF pages: counted with `lopdf`, embedded text via `pdf-extract`, and
//! rasterized by a [`PageRenderer`] (poppler's `pdftoppm` by default).

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use super::{page_file_name, read_source, DocumentParser, ImageFormat, PageImage, PageText, ParsedDocument};
use crate::error::ParserError;
use crate::models::FileFormat;

/// Rasterizes one PDF page to an image file.
pub trait PageRenderer: Send + Sync {
    /// Writes page `page_number` (1-based) of `file` to `dest`. The image
    /// encoding follows `dest`'s extension.
    fn render_page(&self, file: &Path, page_number: u32, dpi: u32, dest: &Path)
        -> Result<(), ParserError>;
}

/// Renders through the poppler `pdftoppm` binary.
pub struct Pdftoppm {
    program: PathBuf,
}

impl Pdftoppm {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl PageRenderer for Pdftoppm {
    fn render_page(
        &self,
        file: &Path,
        page_number: u32,
        dpi: u32,
        dest: &Path,
    ) -> Result<(), ParserError> {
        let encoding = match dest.extension().and_then(|e| e.to_str()) {
            Some("jpg") | Some("jpeg") => "-jpeg",
            _ => "-png",
        };
        // -singlefile writes <prefix>.<ext> without a page suffix
        let prefix = dest.with_extension("");
        let page = page_number.to_string();
        let output = Command::new(&self.program)
            .args([encoding, "-r", &dpi.to_string(), "-f", &page, "-l", &page, "-singlefile"])
            .arg(file)
            .arg(&prefix)
            .output();

        match output {
            Ok(out) if out.status.success() => Ok(()),
            Ok(out) => Err(ParserError::invalid(
                "pdf",
                format!(
                    "pdftoppm failed to convert page {}: {}",
                    page_number,
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ParserError::invalid(
                "pdf",
                format!("{} not found (install poppler-utils)", self.program.display()),
            )),
            Err(e) => Err(ParserError::unreadable(file, e)),
        }
    }
}

pub struct PdfParser {
    renderer: Arc<dyn PageRenderer>,
    dpi: u32,
    image_format: ImageFormat,
}

impl PdfParser {
    pub fn new(renderer: Arc<dyn PageRenderer>, dpi: u32, image_format: ImageFormat) -> Self {
        Self {
            renderer,
            dpi,
            image_format,
        }
    }

    fn load(&self, bytes: &[u8]) -> Result<lopdf::Document, ParserError> {
        let doc = lopdf::Document::load_mem(bytes).map_err(|e| ParserError::invalid("pdf", e))?;
        if doc.get_pages().is_empty() {
            return Err(ParserError::invalid("pdf", "document has no pages"));
        }
        Ok(doc)
    }
}

impl DocumentParser for PdfParser {
    fn format(&self) -> FileFormat {
        FileFormat::Pdf
    }

    fn parse(&self, file: &Path) -> Result<ParsedDocument, ParserError> {
        let bytes = read_source(file)?;
        let doc = self.load(&bytes)?;

        let pages: Vec<PageText> = doc
            .get_pages()
            .keys()
            .map(|&n| PageText {
                page_number: n,
                text: doc.extract_text(&[n]).unwrap_or_default(),
            })
            .collect();
        let text = match pdf_extract::extract_text_from_mem(&bytes) {
            Ok(text) => text,
            Err(e) => {
                tracing::debug!(error = %e, "pdf-extract failed, joining per-page text");
                pages
                    .iter()
                    .map(|p| p.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        };

        let mut metadata = serde_json::Map::new();
        metadata.insert("pdf_version".into(), doc.version.clone().into());
        Ok(ParsedDocument {
            text,
            pages,
            metadata,
        })
    }

    fn convert_to_images(&self, file: &Path, out_dir: &Path) -> Result<Vec<PageImage>, ParserError> {
        let total = self.total_pages(file)?;
        std::fs::create_dir_all(out_dir).map_err(|e| ParserError::unreadable(out_dir, e))?;

        let mut images = Vec::with_capacity(total as usize);
        for page_number in 1..=total {
            let dest = out_dir.join(page_file_name(page_number, self.image_format.extension()));
            self.renderer
                .render_page(file, page_number, self.dpi, &dest)?;
            let (width, height) =
                image::image_dimensions(&dest).map_err(|e| ParserError::invalid("pdf", e))?;
            images.push(PageImage {
                page_number,
                image_path: dest,
                width,
                height,
                format: self.image_format.extension().to_string(),
            });
        }
        Ok(images)
    }

    fn total_pages(&self, file: &Path) -> Result<u32, ParserError> {
        let bytes = read_source(file)?;
        Ok(self.load(&bytes)?.get_pages().len() as u32)
    }
}
