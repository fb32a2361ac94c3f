use std::path::Path;

use super::layout::{self, PageLayout};
use super::ooxml::{self, Block};
use super::text::{page_texts, write_text_pages};
use super::{read_source, DocumentParser, ImageFormat, PageImage, ParsedDocument};
use crate::error::ParserError;
use crate::models::FileFormat;

/// Word-processor documents, paginated as simulated pages of paragraph text.
pub struct DocxParser {
    layout: PageLayout,
    image_format: ImageFormat,
}

impl DocxParser {
    pub fn new(dpi: u32, image_format: ImageFormat) -> Self {
        Self {
            layout: PageLayout::a4(dpi),
            image_format,
        }
    }

    fn read(&self, file: &Path) -> Result<Vec<Block>, ParserError> {
        let bytes = read_source(file)?;
        ooxml::read_docx(&bytes)
    }
}

/// Flattens blocks into plain lines: one per paragraph, table rows joined
/// with ` | `.
pub fn blocks_to_text(blocks: &[Block]) -> String {
    let mut lines = Vec::new();
    for block in blocks {
        match block {
            Block::Paragraph(p) => lines.push(p.text()),
            Block::Table(rows) => {
                for row in rows {
                    lines.push(row.join(" | ").replace('\n', " "));
                }
            }
        }
    }
    lines.join("\n")
}

impl DocumentParser for DocxParser {
    fn format(&self) -> FileFormat {
        FileFormat::Docx
    }

    fn parse(&self, file: &Path) -> Result<ParsedDocument, ParserError> {
        let blocks = self.read(file)?;
        let text = blocks_to_text(&blocks);
        let pages = layout::layout_text(&text, &self.layout);

        let paragraphs = blocks
            .iter()
            .filter(|b| matches!(b, Block::Paragraph(_)))
            .count();
        let mut metadata = serde_json::Map::new();
        metadata.insert("paragraphs".into(), paragraphs.into());
        metadata.insert("tables".into(), (blocks.len() - paragraphs).into());

        Ok(ParsedDocument {
            pages: page_texts(&pages),
            text,
            metadata,
        })
    }

    fn convert_to_images(&self, file: &Path, out_dir: &Path) -> Result<Vec<PageImage>, ParserError> {
        let text = blocks_to_text(&self.read(file)?);
        let pages = layout::layout_text(&text, &self.layout);
        write_text_pages(&pages, &self.layout, out_dir, self.image_format)
    }

    fn total_pages(&self, file: &Path) -> Result<u32, ParserError> {
        let text = blocks_to_text(&self.read(file)?);
        Ok(layout::layout_text(&text, &self.layout).len() as u32)
    }
}
