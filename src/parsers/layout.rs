//! Simulated page layout for formats without native pages.
//!
//! Text is wrapped character by character against a fixed A4 page at the
//! configured DPI, so scripts without spaces wrap the same way as Latin
//! text. Glyphs use a fixed advance (half an em for ASCII, a full em
//! otherwise). Rendering draws each glyph as a filled cell: the images
//! are layout previews, not typeset text.

use image::{Rgb, RgbImage};
use std::path::Path;

use crate::error::ParserError;

const TAB_WIDTH: usize = 4;
const PAPER: Rgb<u8> = Rgb([255, 255, 255]);
const INK: Rgb<u8> = Rgb([64, 64, 64]);
const GRID: Rgb<u8> = Rgb([190, 190, 190]);

/// Geometry of one simulated A4 page, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLayout {
    pub width: u32,
    pub height: u32,
    pub margin: u32,
    pub line_height: u32,
    pub font_size: u32,
}

impl PageLayout {
    pub fn a4(dpi: u32) -> Self {
        let dpi = dpi as f64;
        Self {
            width: (8.27 * dpi) as u32,
            height: (11.69 * dpi) as u32,
            margin: (0.5 * dpi) as u32,
            line_height: ((0.2 * dpi) as u32).max(1),
            font_size: ((0.12 * dpi) as u32).max(2),
        }
    }

    pub fn text_width(&self) -> u32 {
        self.width.saturating_sub(2 * self.margin)
    }

    pub fn lines_per_page(&self) -> usize {
        (self.height.saturating_sub(2 * self.margin) / self.line_height).max(1) as usize
    }
}

/// Cell geometry for spreadsheet pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SheetLayout {
    pub page: PageLayout,
    pub cell_height: u32,
    pub cell_padding: u32,
    pub font_size: u32,
}

impl SheetLayout {
    pub fn a4(dpi: u32) -> Self {
        let f = dpi as f64;
        Self {
            page: PageLayout::a4(dpi),
            cell_height: ((0.25 * f) as u32).max(1),
            cell_padding: (0.05 * f) as u32,
            font_size: ((0.1 * f) as u32).max(2),
        }
    }

    pub fn rows_per_page(&self) -> usize {
        (self.page.height.saturating_sub(2 * self.page.margin) / self.cell_height).max(1) as usize
    }
}

pub fn char_advance(c: char, font_size: u32) -> u32 {
    if c.is_ascii() {
        (font_size / 2).max(1)
    } else {
        font_size
    }
}

pub fn text_advance(text: &str, font_size: u32) -> u32 {
    text.chars().map(|c| char_advance(c, font_size)).sum()
}

/// Splits one logical line into display lines no wider than `max_width`.
/// Always returns at least one (possibly empty) line.
pub fn wrap_line(line: &str, max_width: u32, font_size: u32) -> Vec<String> {
    let line = line.replace('\t', &" ".repeat(TAB_WIDTH));
    let mut out = Vec::new();
    let mut current = String::new();
    let mut width = 0u32;

    for c in line.chars() {
        let advance = char_advance(c, font_size);
        if width + advance > max_width && !current.is_empty() {
            out.push(std::mem::take(&mut current));
            width = 0;
        }
        current.push(c);
        width += advance;
    }
    out.push(current);
    out
}

pub fn wrap_text(text: &str, layout: &PageLayout) -> Vec<String> {
    text.lines()
        .flat_map(|line| wrap_line(line, layout.text_width(), layout.font_size))
        .collect()
}

/// Groups display lines into pages. An empty input still yields one page.
pub fn paginate(lines: Vec<String>, lines_per_page: usize) -> Vec<Vec<String>> {
    if lines.is_empty() {
        return vec![Vec::new()];
    }
    lines
        .chunks(lines_per_page.max(1))
        .map(|c| c.to_vec())
        .collect()
}

pub fn layout_text(text: &str, layout: &PageLayout) -> Vec<Vec<String>> {
    paginate(wrap_text(text, layout), layout.lines_per_page())
}

/// Truncates `text` with `...` so it renders within `max_width`.
pub fn fit_cell_text(text: &str, max_width: u32, font_size: u32) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c == '\n' || c == '\r' || c == '\t' { ' ' } else { c })
        .collect();
    if text_advance(&flat, font_size) <= max_width {
        return flat;
    }

    let ellipsis = "...";
    let budget = max_width.saturating_sub(text_advance(ellipsis, font_size));
    let mut out = String::new();
    let mut width = 0u32;
    for c in flat.chars() {
        let advance = char_advance(c, font_size);
        if width + advance > budget {
            break;
        }
        out.push(c);
        width += advance;
    }
    out.push_str(ellipsis);
    out
}

fn draw_glyphs(img: &mut RgbImage, text: &str, x: u32, y: u32, font_size: u32, max_x: u32) {
    let mut cursor = x;
    let top = y + font_size / 5;
    let bottom = (y + font_size).min(img.height());
    for c in text.chars() {
        let advance = char_advance(c, font_size);
        if cursor + advance > max_x {
            break;
        }
        if !c.is_whitespace() {
            let right = (cursor + advance.saturating_sub(1)).min(img.width());
            for py in top..bottom {
                for px in (cursor + 1).min(right)..right {
                    img.put_pixel(px, py, INK);
                }
            }
        }
        cursor += advance;
    }
}

fn hline(img: &mut RgbImage, x0: u32, x1: u32, y: u32) {
    if y >= img.height() {
        return;
    }
    for x in x0..x1.min(img.width()) {
        img.put_pixel(x, y, GRID);
    }
}

fn vline(img: &mut RgbImage, x: u32, y0: u32, y1: u32) {
    if x >= img.width() {
        return;
    }
    for y in y0..y1.min(img.height()) {
        img.put_pixel(x, y, GRID);
    }
}

pub fn save_image(img: &RgbImage, path: &Path) -> Result<(), ParserError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ParserError::unreadable(parent, e))?;
    }
    img.save(path).map_err(|e| match e {
        image::ImageError::IoError(io) => ParserError::unreadable(path, io),
        other => ParserError::invalid("image", other),
    })
}

/// Renders one page of already wrapped lines. Returns the image size.
pub fn render_text_page(
    lines: &[String],
    layout: &PageLayout,
    path: &Path,
) -> Result<(u32, u32), ParserError> {
    let mut img = RgbImage::from_pixel(layout.width, layout.height, PAPER);
    let max_x = layout.width.saturating_sub(layout.margin);
    for (i, line) in lines.iter().enumerate() {
        let y = layout.margin + i as u32 * layout.line_height;
        draw_glyphs(&mut img, line, layout.margin, y, layout.font_size, max_x);
    }
    save_image(&img, path)?;
    Ok((layout.width, layout.height))
}

/// Renders one sheet as a grid. Rows beyond one page are dropped; cell text
/// is truncated to its column.
pub fn render_sheet_page(
    rows: &[Vec<String>],
    layout: &SheetLayout,
    path: &Path,
) -> Result<(u32, u32), ParserError> {
    let page = layout.page;
    let mut img = RgbImage::from_pixel(page.width, page.height, PAPER);

    let max_cols = rows.iter().map(|r| r.len()).max().unwrap_or(0).max(1) as u32;
    let col_width = (page.text_width() / max_cols).max(1);
    let text_width = col_width.saturating_sub(2 * layout.cell_padding);
    let right = page.margin + col_width * max_cols;

    for (r, row) in rows.iter().take(layout.rows_per_page()).enumerate() {
        let y = page.margin + r as u32 * layout.cell_height;
        hline(&mut img, page.margin, right, y);
        hline(&mut img, page.margin, right, y + layout.cell_height);
        for c in 0..=max_cols {
            vline(&mut img, page.margin + c * col_width, y, y + layout.cell_height);
        }
        for (c, cell) in row.iter().enumerate() {
            let x = page.margin + c as u32 * col_width;
            let text = fit_cell_text(cell, text_width, layout.font_size);
            draw_glyphs(
                &mut img,
                &text,
                x + layout.cell_padding,
                y + layout.cell_padding,
                layout.font_size,
                x + col_width,
            );
        }
    }

    save_image(&img, path)?;
    Ok((page.width, page.height))
}
