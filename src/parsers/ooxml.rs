//! OOXML readers for word-processor and spreadsheet packages.
//!
//! Both formats are ZIP archives of XML parts. Entries are read with a size
//! cap (zip-bomb protection) and streamed through `quick-xml`.

use quick_xml::events::{BytesStart, Event};
use std::collections::HashMap;
use std::io::{Cursor, Read};

use crate::error::ParserError;

/// Maximum sheets to read from a workbook.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to read per sheet (avoids unbounded memory).
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

fn open_archive<'a>(bytes: &'a [u8], format: &'static str) -> Result<Archive<'a>, ParserError> {
    zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| ParserError::invalid(format, e))
}

fn read_zip_entry_bounded(
    archive: &mut Archive<'_>,
    name: &str,
    format: &'static str,
) -> Result<Option<Vec<u8>>, ParserError> {
    let entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(ParserError::invalid(format, e)),
    };
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ParserError::invalid(format, e))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ParserError::invalid(
            format,
            format!("ZIP entry {} exceeds size limit ({} bytes)", name, MAX_XML_ENTRY_BYTES),
        ));
    }
    Ok(Some(out))
}

fn attr(e: &BytesStart<'_>, local: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == local)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// `<w:b/>` is on unless its value says otherwise.
fn toggle_on(e: &BytesStart<'_>) -> bool {
    !matches!(attr(e, b"val").as_deref(), Some("0") | Some("false") | Some("none"))
}

// ── word processor ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Run {
    pub text: String,
    pub bold: bool,
    pub italic: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Paragraph {
    /// Style id from `w:pStyle`, e.g. `Heading1`.
    pub style: Option<String>,
    pub runs: Vec<Run>,
}

impl Paragraph {
    pub fn text(&self) -> String {
        self.runs.iter().map(|r| r.text.as_str()).collect()
    }

    /// Heading level from the style id: `Title` is 1, `HeadingN` is N.
    pub fn heading_level(&self) -> Option<usize> {
        let style = self.style.as_deref()?.to_ascii_lowercase();
        if style == "title" {
            return Some(1);
        }
        let n = style.strip_prefix("heading")?.trim().parse::<usize>().ok()?;
        (1..=6).contains(&n).then_some(n)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Paragraph(Paragraph),
    Table(Vec<Vec<String>>),
}

/// Body blocks of `word/document.xml` in document order.
pub fn read_docx(bytes: &[u8]) -> Result<Vec<Block>, ParserError> {
    let mut archive = open_archive(bytes, "docx")?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", "docx")?
        .ok_or_else(|| ParserError::invalid("docx", "word/document.xml not found"))?;
    parse_document_xml(&xml)
}

fn parse_document_xml(xml: &[u8]) -> Result<Vec<Block>, ParserError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();

    let mut blocks = Vec::new();
    let mut paragraph = Paragraph::default();
    let mut run = Run::default();
    let mut in_text = false;
    let mut in_run_props = false;

    let mut table_depth = 0usize;
    let mut table: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell = String::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| ParserError::invalid("docx", e))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                match e.local_name().as_ref() {
                    b"p" if !is_empty => paragraph = Paragraph::default(),
                    b"pStyle" => paragraph.style = attr(e, b"val"),
                    b"r" if !is_empty => run = Run::default(),
                    b"rPr" if !is_empty => in_run_props = true,
                    b"b" if in_run_props => run.bold = toggle_on(e),
                    b"i" if in_run_props => run.italic = toggle_on(e),
                    b"t" if !is_empty => in_text = true,
                    b"tab" => run.text.push('\t'),
                    b"br" | b"cr" => run.text.push('\n'),
                    b"tbl" if !is_empty => {
                        table_depth += 1;
                        if table_depth == 1 {
                            table = Vec::new();
                        }
                    }
                    b"tr" if !is_empty && table_depth == 1 => row = Vec::new(),
                    b"tc" if !is_empty && table_depth == 1 => cell = String::new(),
                    _ => {}
                }
            }
            Event::Text(te) if in_text => {
                let text = te.unescape().map_err(|e| ParserError::invalid("docx", e))?;
                run.text.push_str(&text);
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"rPr" => in_run_props = false,
                b"r" => paragraph.runs.push(std::mem::take(&mut run)),
                b"p" => {
                    let done = std::mem::take(&mut paragraph);
                    if table_depth > 0 {
                        let text = done.text();
                        if !text.trim().is_empty() {
                            if !cell.is_empty() {
                                cell.push('\n');
                            }
                            cell.push_str(text.trim());
                        }
                    } else {
                        blocks.push(Block::Paragraph(done));
                    }
                }
                b"tc" if table_depth == 1 => row.push(std::mem::take(&mut cell)),
                b"tr" if table_depth == 1 => table.push(std::mem::take(&mut row)),
                b"tbl" => {
                    table_depth = table_depth.saturating_sub(1);
                    if table_depth == 0 {
                        blocks.push(Block::Table(std::mem::take(&mut table)));
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(blocks)
}

// ── spreadsheet ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sheet {
    pub name: String,
    /// Rows as read; trailing empty cells removed, gaps filled with "".
    pub rows: Vec<Vec<String>>,
}

/// Sheets in workbook order with resolved cell values.
pub fn read_xlsx(bytes: &[u8]) -> Result<Vec<Sheet>, ParserError> {
    let mut archive = open_archive(bytes, "xlsx")?;
    let shared_strings = match read_zip_entry_bounded(&mut archive, "xl/sharedStrings.xml", "xlsx")? {
        Some(xml) => parse_shared_strings(&xml)?,
        None => Vec::new(),
    };

    let mut entries = workbook_sheets(&mut archive)?;
    if entries.is_empty() {
        entries = list_worksheet_parts(&archive)
            .into_iter()
            .enumerate()
            .map(|(i, part)| (format!("Sheet{}", i + 1), part))
            .collect();
    }
    if entries.is_empty() {
        return Err(ParserError::invalid("xlsx", "workbook has no worksheets"));
    }

    let mut sheets = Vec::new();
    for (name, part) in entries.into_iter().take(XLSX_MAX_SHEETS) {
        let Some(xml) = read_zip_entry_bounded(&mut archive, &part, "xlsx")? else {
            continue;
        };
        let rows = parse_sheet_xml(&xml, &shared_strings)?;
        sheets.push(Sheet { name, rows });
    }
    Ok(sheets)
}

/// `(sheet name, part path)` pairs from `xl/workbook.xml` and its rels.
fn workbook_sheets(archive: &mut Archive<'_>) -> Result<Vec<(String, String)>, ParserError> {
    let Some(workbook) = read_zip_entry_bounded(archive, "xl/workbook.xml", "xlsx")? else {
        return Ok(Vec::new());
    };
    let Some(rels) = read_zip_entry_bounded(archive, "xl/_rels/workbook.xml.rels", "xlsx")? else {
        return Ok(Vec::new());
    };

    let mut targets = HashMap::new();
    let mut reader = quick_xml::Reader::from_reader(rels.as_slice());
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e))
                if e.local_name().as_ref() == b"Relationship" =>
            {
                if let (Some(id), Some(target)) = (attr(e, b"Id"), attr(e, b"Target")) {
                    let part = match target.strip_prefix('/') {
                        Some(absolute) => absolute.to_string(),
                        None => format!("xl/{}", target),
                    };
                    targets.insert(id, part);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParserError::invalid("xlsx", e)),
            _ => {}
        }
        buf.clear();
    }

    let mut sheets = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(workbook.as_slice());
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e))
                if e.local_name().as_ref() == b"sheet" =>
            {
                let name = attr(e, b"name").unwrap_or_default();
                // r:id; local name is "id"
                if let Some(part) = attr(e, b"id").and_then(|id| targets.get(&id).cloned()) {
                    sheets.push((name, part));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParserError::invalid("xlsx", e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(sheets)
}

fn list_worksheet_parts(archive: &Archive<'_>) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Each `<si>` may hold several rich-text runs; they are concatenated.
fn parse_shared_strings(xml: &[u8]) -> Result<Vec<String>, ParserError> {
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    let mut in_phonetic = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                b"rPh" => in_phonetic = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Ok(Event::Text(te)) if in_t && !in_phonetic => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&te.unescape().map_err(|e| ParserError::invalid("xlsx", e))?);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.push(current.take().unwrap_or_default()),
                b"t" => in_t = false,
                b"rPh" => in_phonetic = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParserError::invalid("xlsx", e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Zero-based column index from a cell reference such as `AB12`.
pub fn column_index(cell_ref: &str) -> Option<usize> {
    let letters: String = cell_ref
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    if letters.is_empty() {
        return None;
    }
    let mut index = 0usize;
    for c in letters.chars() {
        index = index * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1);
    }
    Some(index - 1)
}

fn parse_sheet_xml(xml: &[u8], shared_strings: &[String]) -> Result<Vec<Vec<String>>, ParserError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell_col: Option<usize> = None;
    let mut cell_type: Option<String> = None;
    let mut value = String::new();
    let mut capturing = false;
    let mut cell_count = 0usize;

    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => row = Vec::new(),
                b"c" => {
                    cell_col = attr(&e, b"r").and_then(|r| column_index(&r));
                    cell_type = attr(&e, b"t");
                    value.clear();
                }
                b"v" | b"t" => capturing = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"row" => rows.push(Vec::new()),
            Ok(Event::Text(te)) if capturing => {
                value.push_str(&te.unescape().map_err(|e| ParserError::invalid("xlsx", e))?);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => capturing = false,
                b"c" => {
                    let resolved = resolve_cell(cell_type.as_deref(), value.trim_end(), shared_strings);
                    let col = cell_col.unwrap_or(row.len());
                    if col >= row.len() {
                        row.resize(col + 1, String::new());
                    }
                    row[col] = resolved;
                    cell_count += 1;
                    cell_col = None;
                    cell_type = None;
                }
                b"row" => {
                    while row.last().is_some_and(|c| c.is_empty()) {
                        row.pop();
                    }
                    rows.push(std::mem::take(&mut row));
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParserError::invalid("xlsx", e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(rows)
}

fn resolve_cell(cell_type: Option<&str>, raw: &str, shared_strings: &[String]) -> String {
    match cell_type {
        Some("s") => raw
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|i| shared_strings.get(i).cloned())
            .unwrap_or_default(),
        Some("b") => match raw.trim() {
            "1" => "TRUE".to_string(),
            "0" => "FALSE".to_string(),
            other => other.to_string(),
        },
        _ => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_refs() {
        assert_eq!(column_index("A1"), Some(0));
        assert_eq!(column_index("Z9"), Some(25));
        assert_eq!(column_index("AA10"), Some(26));
        assert_eq!(column_index("12"), None);
    }

    #[test]
    fn document_blocks_in_order() {
        let xml = br#"<w:document xmlns:w="w"><w:body>
            <w:p><w:pPr><w:pStyle w:val="Heading1"/></w:pPr><w:r><w:t>Intro</w:t></w:r></w:p>
            <w:p><w:r><w:rPr><w:b/></w:rPr><w:t xml:space="preserve">Bold </w:t></w:r><w:r><w:t>plain</w:t></w:r></w:p>
            <w:tbl><w:tr><w:tc><w:p><w:r><w:t>a</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>b</w:t></w:r></w:p></w:tc></w:tr></w:tbl>
            </w:body></w:document>"#;
        let blocks = parse_document_xml(xml).unwrap();
        assert_eq!(blocks.len(), 3);
        let Block::Paragraph(heading) = &blocks[0] else { panic!("expected paragraph") };
        assert_eq!(heading.heading_level(), Some(1));
        let Block::Paragraph(body) = &blocks[1] else { panic!("expected paragraph") };
        assert_eq!(body.text(), "Bold plain");
        assert!(body.runs[0].bold);
        assert!(!body.runs[1].bold);
        assert_eq!(blocks[2], Block::Table(vec![vec!["a".into(), "b".into()]]));
    }

    #[test]
    fn sheet_cells_resolve_types_and_gaps() {
        let xml = br#"<worksheet><sheetData>
            <row r="1"><c r="A1" t="s"><v>1</v></c><c r="C1"><v>42</v></c></row>
            <row r="2"><c r="B2" t="inlineStr"><is><t>inline</t></is></c><c r="C2" t="b"><v>1</v></c></row>
            </sheetData></worksheet>"#;
        let shared = vec!["zero".to_string(), "one".to_string()];
        let rows = parse_sheet_xml(xml, &shared).unwrap();
        assert_eq!(rows[0], vec!["one", "", "42"]);
        assert_eq!(rows[1], vec!["", "inline", "TRUE"]);
    }

    #[test]
    fn rich_shared_strings_are_joined() {
        let xml = br#"<sst><si><r><t>Hel</t></r><r><t>lo</t></r></si><si><t>x</t></si></sst>"#;
        assert_eq!(parse_shared_strings(xml).unwrap(), vec!["Hello", "x"]);
    }

    #[test]
    fn not_a_zip_is_invalid() {
        let err = read_docx(b"not a zip").unwrap_err();
        assert!(matches!(err, ParserError::Invalid { format: "docx", .. }));
    }
}
