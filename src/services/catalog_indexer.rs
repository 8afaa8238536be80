//! Catalog item blocks, found by the heading-row style convention of the rate book.

use indexmap::IndexMap;

use crate::config::CatalogConfig;
use crate::error::{EngineError, Result, Warning, WarningKind};
use crate::grid::{normalize_color, CellStyle, DocumentGrid, Sheet};
use crate::models::ItemBlock;

/// Decides whether a cell style marks a block heading.
pub trait StylePredicate {
    fn matches(&self, style: &CellStyle) -> bool;
}

impl<F> StylePredicate for F
where
    F: Fn(&CellStyle) -> bool,
{
    fn matches(&self, style: &CellStyle) -> bool {
        self(style)
    }
}

/// Fill color AND font color must both match.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadingStyle {
    fill: Option<String>,
    font: Option<String>,
}

impl HeadingStyle {
    pub fn new(fill: &str, font: &str) -> Self {
        Self {
            fill: normalize_color(fill),
            font: normalize_color(font),
        }
    }
}

impl From<&CatalogConfig> for HeadingStyle {
    fn from(config: &CatalogConfig) -> Self {
        HeadingStyle::new(&config.heading_fill, &config.heading_font)
    }
}

impl StylePredicate for HeadingStyle {
    fn matches(&self, style: &CellStyle) -> bool {
        self.fill.is_some()
            && self.font.is_some()
            && style.fill_color == self.fill
            && style.font_color == self.font
    }
}

/// Rate/unit column offsets from the sheet's leftmost data column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CatalogLayout {
    pub rate_offset: u32,
    pub unit_offset: u32,
}

impl Default for CatalogLayout {
    fn default() -> Self {
        CatalogLayout::from(&CatalogConfig::default())
    }
}

impl From<&CatalogConfig> for CatalogLayout {
    fn from(config: &CatalogConfig) -> Self {
        Self {
            rate_offset: config.rate_offset,
            unit_offset: config.unit_offset,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogIndex {
    sheet_name: String,
    blocks: IndexMap<String, ItemBlock>,
    duplicates: Vec<String>,
}

fn lookup_key(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl CatalogIndex {
    pub fn sheet_name(&self) -> &str {
        &self.sheet_name
    }

    /// Case- and whitespace-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&ItemBlock> {
        self.blocks.get(&lookup_key(name))
    }

    pub fn blocks(&self) -> impl Iterator<Item = &ItemBlock> + '_ {
        self.blocks.values()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Heading names that appeared more than once (the last occurrence was kept).
    pub fn duplicates(&self) -> &[String] {
        &self.duplicates
    }

    /// Data-quality warnings for the caller to surface.
    pub fn warnings(&self) -> Vec<Warning> {
        self.duplicates
            .iter()
            .map(|name| {
                Warning::new(
                    WarningKind::DuplicateCatalogBlock,
                    format!(
                        "catalog sheet '{}' defines '{}' more than once; the last block is used",
                        self.sheet_name, name
                    ),
                )
            })
            .collect()
    }
}

/// Heading name of a row, if any cell in it carries the heading style.
fn heading_name(sheet: &Sheet, row: u32, predicate: &dyn StylePredicate) -> Option<String> {
    let mut styled = false;
    let mut styled_text = None;
    let mut any_text = None;
    for (_, cell) in sheet.row_cells(row) {
        let text = cell.value.as_text();
        let is_heading = cell.style.as_ref().map_or(false, |s| predicate.matches(s));
        styled |= is_heading;
        if text.is_empty() {
            continue;
        }
        if is_heading && styled_text.is_none() {
            styled_text = Some(text.clone());
        }
        if any_text.is_none() {
            any_text = Some(text);
        }
    }
    if !styled {
        return None;
    }
    styled_text.or(any_text)
}

/// Scan rows `end..=start` backwards for the first cell that yields a value.
fn scan_back<T>(
    sheet: &Sheet,
    start: u32,
    end: u32,
    col: u32,
    read: impl Fn(&Sheet, u32, u32) -> Option<T>,
) -> Option<T> {
    (start..=end).rev().find_map(|row| read(sheet, row, col))
}

/// Index every heading-delimited block of `sheet`. A block spans from its heading row to
/// the row before the next heading (or the last row). Duplicate names: last one wins.
pub fn index(sheet: &Sheet, predicate: &dyn StylePredicate, layout: CatalogLayout) -> CatalogIndex {
    let mut catalog = CatalogIndex {
        sheet_name: sheet.name().to_string(),
        ..CatalogIndex::default()
    };
    let Some(last_row) = sheet.max_row() else {
        return catalog;
    };

    let mut headings: Vec<(u32, String)> = Vec::new();
    let mut previous_row = None;
    for ((row, _), _) in sheet.cells() {
        if previous_row == Some(row) {
            continue;
        }
        previous_row = Some(row);
        if let Some(name) = heading_name(sheet, row, predicate) {
            headings.push((row, name));
        }
    }

    let base_col = sheet.min_data_col().unwrap_or(0);
    let rate_col = base_col + layout.rate_offset;
    let unit_col = base_col + layout.unit_offset;

    for (i, (start_row, name)) in headings.iter().enumerate() {
        let end_row = headings
            .get(i + 1)
            .map(|(next, _)| next - 1)
            .unwrap_or(last_row);
        let rate = scan_back(sheet, *start_row, end_row, rate_col, |s, r, c| s.number(r, c));
        let unit = scan_back(sheet, *start_row, end_row, unit_col, |s, r, c| {
            let text = s.text(r, c);
            (!text.is_empty()).then_some(text)
        });
        let block = ItemBlock {
            name: name.clone(),
            start_row: *start_row,
            end_row,
            rate,
            unit,
        };
        if catalog.blocks.insert(lookup_key(name), block).is_some() {
            catalog.duplicates.push(name.clone());
        }
    }

    tracing::debug!(
        "catalog '{}': {} block(s), {} duplicate name(s)",
        sheet.name(),
        catalog.len(),
        catalog.duplicates.len()
    );
    catalog
}

/// The configured catalog sheet, or the first sheet when none is configured.
pub fn select_catalog_sheet<'a>(
    grid: &'a DocumentGrid,
    sheet_name: Option<&str>,
) -> Result<&'a Sheet> {
    match sheet_name {
        Some(name) => grid.sheet(name).ok_or_else(|| {
            EngineError::NotFound(format!("catalog has no sheet named '{}'", name))
        }),
        None => grid
            .sheet_at(0)
            .ok_or_else(|| EngineError::NotFound("catalog has no sheets".to_string())),
    }
}

/// Select the sheet and index it with the configured heading style and layout.
pub fn index_catalog(grid: &DocumentGrid, config: &CatalogConfig) -> Result<CatalogIndex> {
    let sheet = select_catalog_sheet(grid, config.sheet_name.as_deref())?;
    let heading = HeadingStyle::from(config);
    let catalog = index(sheet, &heading, CatalogLayout::from(config));
    for warning in catalog.warnings() {
        tracing::warn!("{}", warning.message);
    }
    Ok(catalog)
}
