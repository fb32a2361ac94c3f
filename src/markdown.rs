//! Direct Markdown conversion for non-paginated formats.
//!
//! No external service is involved: word-processor structure maps to
//! headings, emphasis and pipe tables; spreadsheets become one table per
//! sheet; JSON is pretty-printed in a fence; plain text that looks like
//! source code is fenced; Markdown passes through.

use std::path::Path;

use crate::error::ParserError;
use crate::models::FileFormat;
use crate::parsers::ooxml::{self, Block, Paragraph, Sheet};
use crate::parsers::read_source;
use crate::parsers::text::decode_text;

const CODE_MARKERS: [&str; 6] = ["def ", "function", "import ", "class ", "<?php", "<html"];

pub fn to_markdown(file: &Path, format: FileFormat) -> Result<String, ParserError> {
    let bytes = read_source(file)?;
    match format {
        FileFormat::Docx => Ok(docx_to_markdown(&ooxml::read_docx(&bytes)?)),
        FileFormat::Xlsx => Ok(sheets_to_markdown(&ooxml::read_xlsx(&bytes)?)),
        FileFormat::Txt => Ok(text_to_markdown(&decode_text(&bytes).0)),
        FileFormat::Json => json_to_markdown(&decode_text(&bytes).0),
        FileFormat::Md => Ok(decode_text(&bytes).0),
        FileFormat::Pdf => Err(ParserError::invalid(
            "pdf",
            "PDF text is transcribed per page, not normalized",
        )),
    }
}

fn escape_cell(cell: &str) -> String {
    cell.trim().replace('\n', " ").replace('|', "\\|")
}

fn push_table(out: &mut Vec<String>, rows: &[Vec<String>]) {
    for (i, row) in rows.iter().enumerate() {
        let cells: Vec<String> = row.iter().map(|c| escape_cell(c)).collect();
        out.push(format!("| {} |", cells.join(" | ")));
        if i == 0 {
            out.push(format!("| {} |", vec!["---"; cells.len()].join(" | ")));
        }
    }
}

fn paragraph_to_markdown(p: &Paragraph) -> String {
    let plain = p.text();
    let text = plain.trim();
    if text.is_empty() {
        return String::new();
    }
    if let Some(level) = p.heading_level() {
        return format!("{} {}", "#".repeat(level.min(3)), text);
    }

    let mut formatted = String::new();
    for run in &p.runs {
        if run.text.trim().is_empty() {
            formatted.push_str(&run.text);
            continue;
        }
        let mut piece = run.text.clone();
        if run.bold {
            piece = format!("**{}**", piece);
        }
        if run.italic {
            piece = format!("*{}*", piece);
        }
        formatted.push_str(&piece);
    }
    let formatted = formatted.trim().to_string();
    if formatted.is_empty() {
        text.to_string()
    } else {
        formatted
    }
}

pub fn docx_to_markdown(blocks: &[Block]) -> String {
    let mut out = Vec::new();
    for block in blocks {
        match block {
            Block::Paragraph(p) => out.push(paragraph_to_markdown(p)),
            Block::Table(rows) => {
                out.push(String::new());
                push_table(&mut out, rows);
                out.push(String::new());
            }
        }
    }
    out.join("\n")
}

pub fn sheets_to_markdown(sheets: &[Sheet]) -> String {
    let mut out = Vec::new();
    for sheet in sheets {
        out.push(format!("## Sheet: {}", sheet.name));
        out.push(String::new());

        let rows: Vec<Vec<String>> = sheet
            .rows
            .iter()
            .filter(|row| row.iter().any(|c| !c.trim().is_empty()))
            .cloned()
            .collect();
        if !rows.is_empty() {
            let width = rows.iter().map(|r| r.len()).max().unwrap_or(0);
            let padded: Vec<Vec<String>> = rows
                .into_iter()
                .map(|mut r| {
                    r.resize(width, String::new());
                    r
                })
                .collect();
            push_table(&mut out, &padded);
            out.push(String::new());
        }
    }
    out.join("\n")
}

pub fn looks_like_code(text: &str) -> bool {
    let lower = text.to_lowercase();
    CODE_MARKERS.iter().any(|m| lower.contains(m))
}

pub fn text_to_markdown(text: &str) -> String {
    if looks_like_code(text) {
        format!("```\n{}\n```", text)
    } else {
        text.to_string()
    }
}

pub fn json_to_markdown(text: &str) -> Result<String, ParserError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ParserError::invalid("json", e))?;
    let pretty = serde_json::to_string_pretty(&value).map_err(|e| ParserError::invalid("json", e))?;
    Ok(format!("```json\n{}\n```", pretty))
}
