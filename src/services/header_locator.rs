//! Header row discovery by fuzzy keyword matching over the top rows of each sheet.

use indexmap::IndexMap;

use crate::config::HeaderConfig;
use crate::grid::{CellValue, DocumentGrid, Sheet};
use crate::models::{ColumnKey, HeaderMatch};

/// A canonical column and the header texts it is recognised by.
#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub key: ColumnKey,
    pub aliases: &'static [&'static str],
}

const SERIAL: ColumnSpec = ColumnSpec {
    key: ColumnKey::Serial,
    aliases: &["sl no", "slno", "s no", "sno", "serial", "item no"],
};
const DESCRIPTION: ColumnSpec = ColumnSpec {
    key: ColumnKey::Description,
    aliases: &["description", "particulars", "name of work", "item of work", "details"],
};
const UNIT: ColumnSpec = ColumnSpec {
    key: ColumnKey::Unit,
    aliases: &["unit", "uom"],
};
const QUANTITY: ColumnSpec = ColumnSpec {
    key: ColumnKey::Quantity,
    aliases: &["quantity", "qty"],
};
const RATE: ColumnSpec = ColumnSpec {
    key: ColumnKey::Rate,
    aliases: &["rate", "unit rate"],
};
const AMOUNT: ColumnSpec = ColumnSpec {
    key: ColumnKey::Amount,
    aliases: &["amount", "cost"],
};
const EXECUTED: ColumnSpec = ColumnSpec {
    key: ColumnKey::ExecutedQuantity,
    aliases: &["executed", "exec", "up to date", "this bill", "measured"],
};

/// Columns of an estimate sheet.
pub const ESTIMATE_COLUMNS: &[ColumnSpec] = &[SERIAL, DESCRIPTION, UNIT, QUANTITY, RATE, AMOUNT];

/// Columns of a per-period bill sheet.
pub const BILL_COLUMNS: &[ColumnSpec] =
    &[SERIAL, DESCRIPTION, UNIT, QUANTITY, RATE, AMOUNT, EXECUTED];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocateOptions {
    pub search_window: u32,
    pub min_matches: usize,
}

impl Default for LocateOptions {
    fn default() -> Self {
        LocateOptions::from(&HeaderConfig::default())
    }
}

impl From<&HeaderConfig> for LocateOptions {
    fn from(config: &HeaderConfig) -> Self {
        Self {
            search_window: config.search_window,
            min_matches: config.min_matches,
        }
    }
}

/// Lowercase, drop `.`/`:`/brackets, collapse whitespace.
pub fn normalize_header(text: &str) -> String {
    let lowered: String = text
        .to_lowercase()
        .chars()
        .map(|c| match c {
            '.' | ':' => ' ',
            '(' | ')' | '[' | ']' => ' ',
            other => other,
        })
        .collect();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Which spec a header cell belongs to: the one with the longest alias contained in the
/// text, earlier specs winning ties.
fn classify(text: &str, columns: &[ColumnSpec]) -> Option<ColumnKey> {
    let normalized = normalize_header(text);
    if normalized.is_empty() {
        return None;
    }
    let compact = normalized.replace(' ', "");
    let mut best: Option<(usize, ColumnKey)> = None;
    for spec in columns {
        for alias in spec.aliases {
            let hit = normalized.contains(alias) || compact.contains(&alias.replace(' ', ""));
            if hit && best.map_or(true, |(len, _)| alias.len() > len) {
                best = Some((alias.len(), spec.key));
            }
        }
    }
    best.map(|(_, key)| key)
}

/// Match one row against the vocabulary. Each key is taken by the first cell that matches it.
fn match_row(sheet: &Sheet, row: u32, columns: &[ColumnSpec]) -> IndexMap<ColumnKey, u32> {
    let mut found = IndexMap::new();
    for (col, cell) in sheet.row_cells(row) {
        let CellValue::Text(text) = &cell.value else {
            continue;
        };
        if let Some(key) = classify(text, columns) {
            found.entry(key).or_insert(col);
        }
    }
    found
}

/// Scan one sheet's first `search_window` rows; first qualifying row wins.
pub fn locate_in_sheet(
    sheet: &Sheet,
    sheet_index: usize,
    columns: &[ColumnSpec],
    options: &LocateOptions,
) -> Option<HeaderMatch> {
    let threshold = options.min_matches.min(columns.len()).max(1);
    let last = sheet.max_row()?;
    for row in 0..options.search_window.min(last + 1) {
        let found = match_row(sheet, row, columns);
        if found.len() >= threshold {
            tracing::debug!(
                "header found on '{}' row {} ({} of {} columns)",
                sheet.name(),
                row + 1,
                found.len(),
                columns.len()
            );
            return Some(HeaderMatch {
                sheet_index,
                sheet_name: sheet.name().to_string(),
                row,
                columns: found,
            });
        }
    }
    None
}

/// Looser pass for sheets that have no full header: the first row in the window naming a
/// description column plus a quantity or rate column.
pub fn locate_minimal_in_sheet(
    sheet: &Sheet,
    sheet_index: usize,
    columns: &[ColumnSpec],
    search_window: u32,
) -> Option<HeaderMatch> {
    let last = sheet.max_row()?;
    (0..search_window.min(last + 1)).find_map(|row| {
        let found = match_row(sheet, row, columns);
        let usable = found.contains_key(&ColumnKey::Description)
            && (found.contains_key(&ColumnKey::Quantity) || found.contains_key(&ColumnKey::Rate));
        usable.then(|| {
            tracing::debug!("minimal header on '{}' row {}", sheet.name(), row + 1);
            HeaderMatch {
                sheet_index,
                sheet_name: sheet.name().to_string(),
                row,
                columns: found,
            }
        })
    })
}

/// First sheet+row in document order whose cells match at least `min_matches` of the
/// expected columns. `None` when no sheet qualifies; callers own any further fallback.
pub fn locate(
    grid: &DocumentGrid,
    columns: &[ColumnSpec],
    options: &LocateOptions,
) -> Option<HeaderMatch> {
    grid.sheets()
        .iter()
        .enumerate()
        .find_map(|(index, sheet)| locate_in_sheet(sheet, index, columns, options))
}

/// [`locate`], then the minimal header pass over every sheet in document order.
pub fn locate_with_fallback(
    grid: &DocumentGrid,
    columns: &[ColumnSpec],
    options: &LocateOptions,
) -> Option<HeaderMatch> {
    locate(grid, columns, options).or_else(|| {
        grid.sheets().iter().enumerate().find_map(|(index, sheet)| {
            locate_minimal_in_sheet(sheet, index, columns, options.search_window)
        })
    })
}
