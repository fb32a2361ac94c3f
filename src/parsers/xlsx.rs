use std::path::Path;

use super::layout::{self, SheetLayout};
use super::ooxml::{self, Sheet};
use super::{page_file_name, read_source, DocumentParser, ImageFormat, PageImage, PageText, ParsedDocument};
use crate::error::ParserError;
use crate::models::FileFormat;

/// Spreadsheets: one simulated page per sheet.
pub struct XlsxParser {
    layout: SheetLayout,
    image_format: ImageFormat,
}

impl XlsxParser {
    pub fn new(dpi: u32, image_format: ImageFormat) -> Self {
        Self {
            layout: SheetLayout::a4(dpi),
            image_format,
        }
    }

    fn read(&self, file: &Path) -> Result<Vec<Sheet>, ParserError> {
        let bytes = read_source(file)?;
        ooxml::read_xlsx(&bytes)
    }
}

fn sheet_text(sheet: &Sheet) -> String {
    sheet
        .rows
        .iter()
        .filter(|row| row.iter().any(|c| !c.trim().is_empty()))
        .map(|row| row.join("\t"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl DocumentParser for XlsxParser {
    fn format(&self) -> FileFormat {
        FileFormat::Xlsx
    }

    fn parse(&self, file: &Path) -> Result<ParsedDocument, ParserError> {
        let sheets = self.read(file)?;
        let pages: Vec<PageText> = sheets
            .iter()
            .enumerate()
            .map(|(i, sheet)| PageText {
                page_number: i as u32 + 1,
                text: sheet_text(sheet),
            })
            .collect();
        let text = sheets
            .iter()
            .zip(&pages)
            .map(|(sheet, page)| format!("{}\n{}", sheet.name, page.text))
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut metadata = serde_json::Map::new();
        metadata.insert(
            "sheets".into(),
            sheets.iter().map(|s| s.name.clone()).collect::<Vec<_>>().into(),
        );

        Ok(ParsedDocument {
            text,
            pages,
            metadata,
        })
    }

    fn convert_to_images(&self, file: &Path, out_dir: &Path) -> Result<Vec<PageImage>, ParserError> {
        let sheets = self.read(file)?;
        std::fs::create_dir_all(out_dir).map_err(|e| ParserError::unreadable(out_dir, e))?;

        let mut images = Vec::with_capacity(sheets.len());
        for (i, sheet) in sheets.iter().enumerate() {
            let page_number = i as u32 + 1;
            let path = out_dir.join(page_file_name(page_number, self.image_format.extension()));
            if sheet.rows.len() > self.layout.rows_per_page() {
                tracing::debug!(
                    sheet = %sheet.name,
                    rows = sheet.rows.len(),
                    "sheet preview truncated to one page"
                );
            }
            let (width, height) = layout::render_sheet_page(&sheet.rows, &self.layout, &path)?;
            images.push(PageImage {
                page_number,
                image_path: path,
                width,
                height,
                format: self.image_format.extension().to_string(),
            });
        }
        Ok(images)
    }

    fn total_pages(&self, file: &Path) -> Result<u32, ParserError> {
        Ok(self.read(file)?.len() as u32)
    }
}
