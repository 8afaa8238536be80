//! Workbook bytes <-> `DocumentGrid`.
//!
//! Values (and formulas) come from calamine. Calamine does not expose cell styles, so for
//! xlsx input the zip is opened a second time and `xl/styles.xml` plus each worksheet
//! part are scanned with quick-xml to attach fill/font colors to cells. Non-zip formats
//! (xls, ods) load without styles.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader as XmlReader;
use rust_xlsxwriter::{Color, Format, Workbook};
use zip::read::ZipArchive;

use crate::error::{EngineError, Result};
use crate::grid::{normalize_color, parse_cell_ref, CellStyle, CellValue, DocumentGrid, Sheet};

/// Parse workbook bytes into a grid. A read failure is reported as transient so the
/// task queue can retry; a readable but sheet-less workbook is malformed.
pub fn read_grid(bytes: &[u8], what: &str) -> Result<DocumentGrid> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
        .map_err(|e| EngineError::transient(what, format!("could not open workbook: {}", e)))?;
    let styles = match read_style_overlay(bytes) {
        Ok(styles) => styles,
        Err(e) => {
            tracing::debug!("{}: no style information ({})", what, e);
            HashMap::new()
        }
    };

    let mut grid = DocumentGrid::new();
    for name in workbook.sheet_names().to_vec() {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|e| EngineError::transient(what, format!("sheet '{}': {}", name, e)))?;
        let mut sheet = Sheet::new(name.clone());
        if let Some((row0, col0)) = range.start() {
            for (r, c, data) in range.used_cells() {
                let value = data_to_value(data);
                if value.is_empty() {
                    continue;
                }
                sheet.set(row0 + r as u32, col0 + c as u32, value);
            }
        }
        // Formulas ride alongside their cached values.
        match workbook.worksheet_formula(&name) {
            Ok(formulas) => {
                if let Some((row0, col0)) = formulas.start() {
                    for (r, c, formula) in formulas.used_cells() {
                        if formula.trim().is_empty() {
                            continue;
                        }
                        sheet.set_formula(
                            row0 + r as u32,
                            col0 + c as u32,
                            format!("={}", formula.trim().trim_start_matches('=')),
                        );
                    }
                }
            }
            Err(e) => tracing::debug!("{}: sheet '{}' formulas unavailable: {}", what, name, e),
        }
        if let Some(cell_styles) = styles.get(&name) {
            for ((row, col), style) in cell_styles {
                sheet.set_style(*row, *col, style.clone());
            }
        }
        grid.add_sheet(sheet)?;
    }
    if grid.is_empty() {
        return Err(EngineError::Malformed(format!("{} has no worksheets", what)));
    }
    Ok(grid)
}

fn data_to_value(data: &Data) -> CellValue {
    match data {
        Data::Empty => CellValue::Empty,
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Float(f) => CellValue::Number(*f),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::String(s) => CellValue::Text(s.clone()),
        other => CellValue::Text(other.to_string()),
    }
}

#[derive(Debug, Default, Clone)]
struct FontEntry {
    color: Option<String>,
    bold: bool,
}

#[derive(Debug, Default)]
struct StyleTable {
    fonts: Vec<FontEntry>,
    fills: Vec<Option<String>>,
    /// cellXfs entries as (fontId, fillId).
    xfs: Vec<(usize, usize)>,
}

impl StyleTable {
    fn resolve(&self, xf: usize) -> Option<CellStyle> {
        let (font_id, fill_id) = *self.xfs.get(xf)?;
        let font = self.fonts.get(font_id).cloned().unwrap_or_default();
        let style = CellStyle {
            fill_color: self.fills.get(fill_id).cloned().flatten(),
            font_color: font.color,
            bold: font.bold,
            number_format: None,
        };
        if style.is_plain() {
            None
        } else {
            Some(style)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    None,
    Fonts,
    Fills,
    CellXfs,
    Ignored,
}

type StyleOverlay = HashMap<String, HashMap<(u32, u32), CellStyle>>;

/// Sheet name -> styled cells, read straight from the xlsx parts.
fn read_style_overlay(bytes: &[u8]) -> Result<StyleOverlay> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| EngineError::Malformed(format!("not an xlsx package: {}", e)))?;
    let styles_xml = read_part(&mut archive, "xl/styles.xml").unwrap_or_default();
    let table = parse_styles(&styles_xml)?;
    let workbook_xml = read_part(&mut archive, "xl/workbook.xml")
        .ok_or_else(|| EngineError::Malformed("missing xl/workbook.xml".to_string()))?;
    let rels_xml = read_part(&mut archive, "xl/_rels/workbook.xml.rels").unwrap_or_default();
    let targets = parse_relationships(&rels_xml)?;

    let mut overlay = HashMap::new();
    for (sheet_name, rel_id) in parse_workbook_sheets(&workbook_xml)? {
        let Some(target) = targets.get(&rel_id) else {
            continue;
        };
        let path = resolve_part_path(target);
        let Some(sheet_xml) = read_part(&mut archive, &path) else {
            tracing::debug!("worksheet part '{}' for '{}' missing", path, sheet_name);
            continue;
        };
        let mut cells = HashMap::new();
        for (row, col, xf) in parse_cell_style_ids(&sheet_xml)? {
            if let Some(style) = table.resolve(xf) {
                cells.insert((row, col), style);
            }
        }
        overlay.insert(sheet_name, cells);
    }
    Ok(overlay)
}

fn read_part(archive: &mut ZipArchive<Cursor<&[u8]>>, name: &str) -> Option<String> {
    let mut entry = archive.by_name(name).ok()?;
    let mut text = String::new();
    entry.read_to_string(&mut text).ok()?;
    Some(text)
}

fn resolve_part_path(target: &str) -> String {
    match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("xl/{}", target),
    }
}

fn attr(e: &BytesStart, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn xml_error(part: &str, e: quick_xml::Error) -> EngineError {
    EngineError::Malformed(format!("{}: {}", part, e))
}

fn parse_styles(xml: &str) -> Result<StyleTable> {
    let mut table = StyleTable::default();
    if xml.is_empty() {
        return Ok(table);
    }
    let mut reader = XmlReader::from_str(xml);
    let mut section = Section::None;
    loop {
        let (e, is_start) = match reader.read_event() {
            Ok(Event::Start(e)) => (e, true),
            Ok(Event::Empty(e)) => (e, false),
            Ok(Event::End(e)) => {
                if matches!(
                    e.local_name().as_ref(),
                    b"fonts" | b"fills" | b"cellXfs" | b"cellStyleXfs" | b"dxfs"
                ) {
                    section = Section::None;
                }
                continue;
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error("xl/styles.xml", e)),
            _ => continue,
        };
        match (section, e.local_name().as_ref()) {
            (_, b"fonts") if is_start => section = Section::Fonts,
            (_, b"fills") if is_start => section = Section::Fills,
            (_, b"cellXfs") if is_start => section = Section::CellXfs,
            (_, b"cellStyleXfs" | b"dxfs") if is_start => section = Section::Ignored,
            (Section::Fonts, b"font") => table.fonts.push(FontEntry::default()),
            (Section::Fonts, b"color") => {
                if let Some(font) = table.fonts.last_mut() {
                    font.color = attr(&e, b"rgb").and_then(|c| normalize_color(&c));
                }
            }
            (Section::Fonts, b"b") => {
                if let Some(font) = table.fonts.last_mut() {
                    font.bold = !matches!(attr(&e, b"val").as_deref(), Some("0") | Some("false"));
                }
            }
            (Section::Fills, b"fill") => table.fills.push(None),
            (Section::Fills, b"fgColor") => {
                if let Some(fill) = table.fills.last_mut() {
                    *fill = attr(&e, b"rgb").and_then(|c| normalize_color(&c));
                }
            }
            (Section::CellXfs, b"xf") => {
                let font_id = attr(&e, b"fontId").and_then(|v| v.parse().ok()).unwrap_or(0);
                let fill_id = attr(&e, b"fillId").and_then(|v| v.parse().ok()).unwrap_or(0);
                table.xfs.push((font_id, fill_id));
            }
            _ => {}
        }
    }
    Ok(table)
}

/// (sheet name, relationship id) in workbook order.
fn parse_workbook_sheets(xml: &str) -> Result<Vec<(String, String)>> {
    let mut reader = XmlReader::from_str(xml);
    let mut sheets = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"sheet" => {
                if let (Some(name), Some(id)) = (attr(&e, b"name"), attr(&e, b"id")) {
                    sheets.push((name, id));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error("xl/workbook.xml", e)),
            _ => {}
        }
    }
    Ok(sheets)
}

fn parse_relationships(xml: &str) -> Result<HashMap<String, String>> {
    let mut targets = HashMap::new();
    if xml.is_empty() {
        return Ok(targets);
    }
    let mut reader = XmlReader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e))
                if e.local_name().as_ref() == b"Relationship" =>
            {
                if let (Some(id), Some(target)) = (attr(&e, b"Id"), attr(&e, b"Target")) {
                    targets.insert(id, target);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error("xl/_rels/workbook.xml.rels", e)),
            _ => {}
        }
    }
    Ok(targets)
}

/// (row, col, style index) for every `<c>` carrying an `s` attribute.
fn parse_cell_style_ids(xml: &str) -> Result<Vec<(u32, u32, usize)>> {
    let mut reader = XmlReader::from_str(xml);
    let mut out = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"c" => {
                let position = attr(&e, b"r").and_then(|r| parse_cell_ref(&r));
                let xf = attr(&e, b"s").and_then(|s| s.parse::<usize>().ok());
                if let (Some((row, col)), Some(xf)) = (position, xf) {
                    out.push((row, col, xf));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error("worksheet", e)),
            _ => {}
        }
    }
    Ok(out)
}

/// Remove characters that corrupt the sheet XML (control chars except tab/newline/CR).
fn sanitize_cell(s: &str) -> String {
    s.chars()
        .filter(|&c| {
            let u = c as u32;
            c == '\t'
                || c == '\n'
                || c == '\r'
                || !(u < 0x20 || u == 0x7F || u == 0xFFFE || u == 0xFFFF)
        })
        .collect()
}

fn hex_to_color(hex: &str) -> Option<Color> {
    let normalized = normalize_color(hex)?;
    u32::from_str_radix(&normalized[1..], 16).ok().map(Color::RGB)
}

fn style_to_format(style: &CellStyle) -> Format {
    let mut format = Format::new();
    if let Some(color) = style.fill_color.as_deref().and_then(hex_to_color) {
        format = format.set_background_color(color);
    }
    if let Some(color) = style.font_color.as_deref().and_then(hex_to_color) {
        format = format.set_font_color(color);
    }
    if style.bold {
        format = format.set_bold();
    }
    if let Some(num_format) = &style.number_format {
        format = format.set_num_format(num_format);
    }
    format
}

/// Serialize a grid to xlsx bytes. Formula cells are written as formulas, never as values.
pub fn write_grid(grid: &DocumentGrid) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let plain = Format::new();
    for sheet in grid.sheets() {
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(sheet.name())?;
        for (col, width) in sheet.column_widths() {
            worksheet.set_column_width(to_col(col)?, width)?;
        }
        for ((row, col), cell) in sheet.cells() {
            let col = to_col(col)?;
            let styled = cell.style.as_ref().map(style_to_format);
            let format = styled.as_ref().unwrap_or(&plain);
            if let Some(formula) = &cell.formula {
                worksheet.write_formula_with_format(row, col, formula.as_str(), format)?;
                continue;
            }
            match &cell.value {
                CellValue::Empty => {
                    if styled.is_some() {
                        worksheet.write_blank(row, col, format)?;
                    }
                }
                CellValue::Text(text) => {
                    worksheet.write_string_with_format(row, col, sanitize_cell(text), format)?;
                }
                CellValue::Number(n) => {
                    worksheet.write_number_with_format(row, col, *n, format)?;
                }
                CellValue::Bool(b) => {
                    worksheet.write_boolean_with_format(row, col, *b, format)?;
                }
                CellValue::Formula(formula) => {
                    worksheet.write_formula_with_format(row, col, formula.as_str(), format)?;
                }
            }
        }
        if let Some(rows) = sheet.freeze_rows() {
            worksheet.set_freeze_panes(rows, 0)?;
        }
    }
    Ok(workbook.save_to_buffer()?)
}

fn to_col(col: u32) -> Result<u16> {
    u16::try_from(col).map_err(|_| EngineError::Output(format!("column {} out of range", col)))
}
