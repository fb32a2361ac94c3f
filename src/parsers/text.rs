//! Plain and structured text (txt, md, json).

use std::path::Path;

use super::layout::{self, PageLayout};
use super::{page_file_name, read_source, DocumentParser, ImageFormat, PageImage, PageText, ParsedDocument};
use crate::error::ParserError;
use crate::models::FileFormat;

/// Decodes text bytes, honoring a UTF-8 or UTF-16 byte-order mark.
/// Returns the text and the encoding label recorded in metadata.
pub fn decode_text(bytes: &[u8]) -> (String, &'static str) {
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return (String::from_utf8_lossy(rest).into_owned(), "utf-8-sig");
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect();
        return (String::from_utf16_lossy(&units), "utf-16le");
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .collect();
        return (String::from_utf16_lossy(&units), "utf-16be");
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => (s.to_string(), "utf-8"),
        Err(_) => (String::from_utf8_lossy(bytes).into_owned(), "utf-8-lossy"),
    }
}

/// Renders laid-out pages as `page_NNNN.<ext>` files under `out_dir`.
pub(super) fn write_text_pages(
    pages: &[Vec<String>],
    page_layout: &PageLayout,
    out_dir: &Path,
    image_format: ImageFormat,
) -> Result<Vec<PageImage>, ParserError> {
    std::fs::create_dir_all(out_dir).map_err(|e| ParserError::unreadable(out_dir, e))?;
    let mut images = Vec::with_capacity(pages.len());
    for (i, lines) in pages.iter().enumerate() {
        let page_number = i as u32 + 1;
        let path = out_dir.join(page_file_name(page_number, image_format.extension()));
        let (width, height) = layout::render_text_page(lines, page_layout, &path)?;
        images.push(PageImage {
            page_number,
            image_path: path,
            width,
            height,
            format: image_format.extension().to_string(),
        });
    }
    Ok(images)
}

pub(super) fn page_texts(pages: &[Vec<String>]) -> Vec<PageText> {
    pages
        .iter()
        .enumerate()
        .map(|(i, lines)| PageText {
            page_number: i as u32 + 1,
            text: lines.join("\n"),
        })
        .collect()
}

pub struct TextParser {
    format: FileFormat,
    layout: PageLayout,
    image_format: ImageFormat,
}

impl TextParser {
    pub fn new(format: FileFormat, dpi: u32, image_format: ImageFormat) -> Self {
        Self {
            format,
            layout: PageLayout::a4(dpi),
            image_format,
        }
    }

    fn read(&self, file: &Path) -> Result<(String, &'static str), ParserError> {
        let bytes = read_source(file)?;
        Ok(decode_text(&bytes))
    }
}

impl DocumentParser for TextParser {
    fn format(&self) -> FileFormat {
        self.format
    }

    fn parse(&self, file: &Path) -> Result<ParsedDocument, ParserError> {
        let (text, encoding) = self.read(file)?;
        if self.format == FileFormat::Json {
            serde_json::from_str::<serde_json::Value>(&text)
                .map_err(|e| ParserError::invalid("json", e))?;
        }
        let pages = layout::layout_text(&text, &self.layout);

        let mut metadata = serde_json::Map::new();
        metadata.insert("encoding".into(), encoding.into());
        metadata.insert("lines".into(), text.lines().count().into());

        Ok(ParsedDocument {
            pages: page_texts(&pages),
            text,
            metadata,
        })
    }

    fn convert_to_images(&self, file: &Path, out_dir: &Path) -> Result<Vec<PageImage>, ParserError> {
        let (text, _) = self.read(file)?;
        let pages = layout::layout_text(&text, &self.layout);
        write_text_pages(&pages, &self.layout, out_dir, self.image_format)
    }

    fn total_pages(&self, file: &Path) -> Result<u32, ParserError> {
        let (text, _) = self.read(file)?;
        Ok(layout::layout_text(&text, &self.layout).len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_boms() {
        assert_eq!(decode_text(b"\xEF\xBB\xBFhi"), ("hi".to_string(), "utf-8-sig"));
        assert_eq!(decode_text(b"\xFF\xFEh\x00i\x00"), ("hi".to_string(), "utf-16le"));
        assert_eq!(decode_text(b"plain").1, "utf-8");
        assert_eq!(decode_text(b"\xFFbad").1, "utf-8-lossy");
    }

    #[test]
    fn long_text_spans_pages_consistently() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("long.txt");
        let body: String = (0..120).map(|i| format!("line {}\n", i)).collect();
        std::fs::write(&file, body).unwrap();

        let parser = TextParser::new(FileFormat::Txt, 150, ImageFormat::Png);
        let parsed = parser.parse(&file).unwrap();
        let images = parser.convert_to_images(&file, &dir.path().join("pages")).unwrap();
        let total = parser.total_pages(&file).unwrap();

        assert_eq!(parsed.pages.len(), 3);
        assert_eq!(images.len() as u32, total);
        assert_eq!(parsed.pages.len() as u32, total);
        assert!(images[0].image_path.ends_with("page_0001.png"));
    }

    #[test]
    fn invalid_json_is_a_parse_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("bad.json");
        std::fs::write(&file, "{not json").unwrap();
        let parser = TextParser::new(FileFormat::Json, 150, ImageFormat::Png);
        assert!(matches!(
            parser.parse(&file).unwrap_err(),
            ParserError::Invalid { format: "json", .. }
        ));
    }
}
