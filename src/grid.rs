//! In-memory multi-sheet document: sparse cells with values and the few style attributes
//! the engine cares about (fill color, font color, bold, number format). 0-based rows/cols.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Default)]
pub enum CellValue {
    #[default]
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    /// Formula text including the leading `=`.
    Formula(String),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Display text: numbers without a trailing `.0`, formulas as written.
    pub fn as_text(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Text(s) => s.trim().to_string(),
            CellValue::Number(n) => format_number(*n),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Formula(f) => f.clone(),
        }
    }

    /// Numeric value; text cells are parsed leniently ("1,250.50", "Rs. 40").
    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            CellValue::Text(s) => parse_number(s),
            _ => None,
        }
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::Text(s)
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CellStyle {
    /// `#RRGGBB`, uppercase.
    pub fill_color: Option<String>,
    pub font_color: Option<String>,
    pub bold: bool,
    pub number_format: Option<String>,
}

impl CellStyle {
    pub fn is_plain(&self) -> bool {
        self.fill_color.is_none()
            && self.font_color.is_none()
            && !self.bold
            && self.number_format.is_none()
    }

    pub fn fill(mut self, color: &str) -> Self {
        self.fill_color = normalize_color(color);
        self
    }

    pub fn font(mut self, color: &str) -> Self {
        self.font_color = normalize_color(color);
        self
    }

    pub fn bold(mut self) -> Self {
        self.bold = true;
        self
    }

    pub fn number_format(mut self, format: &str) -> Self {
        self.number_format = Some(format.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Cell {
    pub value: CellValue,
    /// Formula of a cell read from a workbook (with `=`); `value` holds its cached result.
    pub formula: Option<String>,
    pub style: Option<CellStyle>,
}

static EMPTY_VALUE: CellValue = CellValue::Empty;

#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    name: String,
    cells: BTreeMap<(u32, u32), Cell>,
    column_widths: BTreeMap<u32, f64>,
    freeze_rows: Option<u32>,
}

impl Sheet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cells: BTreeMap::new(),
            column_widths: BTreeMap::new(),
            freeze_rows: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&mut self, row: u32, col: u32, value: impl Into<CellValue>) {
        let cell = self.cells.entry((row, col)).or_default();
        cell.value = value.into();
    }

    pub fn set_styled(
        &mut self,
        row: u32,
        col: u32,
        value: impl Into<CellValue>,
        style: CellStyle,
    ) {
        let cell = self.cells.entry((row, col)).or_default();
        cell.value = value.into();
        cell.style = if style.is_plain() { None } else { Some(style) };
    }

    /// Attach a style without touching the value (style-only cells are common in catalogs).
    pub fn set_style(&mut self, row: u32, col: u32, style: CellStyle) {
        if style.is_plain() {
            return;
        }
        self.cells.entry((row, col)).or_default().style = Some(style);
    }

    pub fn set_column_width(&mut self, col: u32, width: f64) {
        self.column_widths.insert(col, width);
    }

    pub fn column_widths(&self) -> impl Iterator<Item = (u32, f64)> + '_ {
        self.column_widths.iter().map(|(c, w)| (*c, *w))
    }

    pub fn set_freeze_rows(&mut self, rows: u32) {
        self.freeze_rows = Some(rows);
    }

    pub fn freeze_rows(&self) -> Option<u32> {
        self.freeze_rows
    }

    pub fn cell(&self, row: u32, col: u32) -> Option<&Cell> {
        self.cells.get(&(row, col))
    }

    pub fn value(&self, row: u32, col: u32) -> &CellValue {
        self.cells
            .get(&(row, col))
            .map(|c| &c.value)
            .unwrap_or(&EMPTY_VALUE)
    }

    pub fn text(&self, row: u32, col: u32) -> String {
        self.value(row, col).as_text()
    }

    pub fn number(&self, row: u32, col: u32) -> Option<f64> {
        self.value(row, col).as_number()
    }

    pub fn set_formula(&mut self, row: u32, col: u32, formula: impl Into<String>) {
        self.cells.entry((row, col)).or_default().formula = Some(formula.into());
    }

    /// Formula text of a cell, whether read from a workbook or written as a formula value.
    pub fn formula(&self, row: u32, col: u32) -> Option<&str> {
        let cell = self.cells.get(&(row, col))?;
        match (&cell.formula, &cell.value) {
            (Some(f), _) | (None, CellValue::Formula(f)) => Some(f.as_str()),
            _ => None,
        }
    }

    pub fn style(&self, row: u32, col: u32) -> Option<&CellStyle> {
        self.cells.get(&(row, col)).and_then(|c| c.style.as_ref())
    }

    /// All stored cells of one row, in column order.
    pub fn row_cells(&self, row: u32) -> impl Iterator<Item = (u32, &Cell)> + '_ {
        self.cells
            .range((row, 0)..=(row, u32::MAX))
            .map(|((_, c), cell)| (*c, cell))
    }

    pub fn cells(&self) -> impl Iterator<Item = ((u32, u32), &Cell)> + '_ {
        self.cells.iter().map(|(k, v)| (*k, v))
    }

    pub fn is_row_blank(&self, row: u32) -> bool {
        self.row_cells(row).all(|(_, c)| c.value.is_empty())
    }

    /// Last row holding a value or a style; `None` for an empty sheet.
    pub fn max_row(&self) -> Option<u32> {
        self.cells.keys().next_back().map(|(r, _)| *r)
    }

    /// Leftmost column holding a non-empty value.
    pub fn min_data_col(&self) -> Option<u32> {
        self.cells
            .iter()
            .filter(|(_, c)| !c.value.is_empty())
            .map(|((_, col), _)| *col)
            .min()
    }

    pub fn populated_row_count(&self) -> usize {
        let mut count = 0;
        let mut last = None;
        for ((row, _), cell) in &self.cells {
            if cell.value.is_empty() || last == Some(*row) {
                continue;
            }
            last = Some(*row);
            count += 1;
        }
        count
    }
}

/// Ordered, name-unique collection of sheets. Sheets are immutable once added.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentGrid {
    sheets: Vec<Sheet>,
}

impl DocumentGrid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sheet(&mut self, sheet: Sheet) -> Result<()> {
        if self.sheet_index(sheet.name()).is_some() {
            return Err(EngineError::Malformed(format!(
                "duplicate sheet name '{}'",
                sheet.name()
            )));
        }
        self.sheets.push(sheet);
        Ok(())
    }

    pub fn sheets(&self) -> &[Sheet] {
        &self.sheets
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|s| s.name()).collect()
    }

    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheet_index(name).map(|i| &self.sheets[i])
    }

    pub fn sheet_at(&self, index: usize) -> Option<&Sheet> {
        self.sheets.get(index)
    }

    pub fn sheet_index(&self, name: &str) -> Option<usize> {
        self.sheets
            .iter()
            .position(|s| s.name().eq_ignore_ascii_case(name))
    }

    pub fn is_empty(&self) -> bool {
        self.sheets.is_empty()
    }
}

/// Column index (0-based) to Excel letter (0→A, 1→B, 26→AA).
pub fn column_letter(index: u32) -> String {
    let mut n = index;
    let mut s = String::new();
    loop {
        let r = (n % 26) as u8;
        s.insert(0, (b'A' + r) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    s
}

/// A1 reference for 0-based row/col.
pub fn cell_ref(row: u32, col: u32) -> String {
    format!("{}{}", column_letter(col), row + 1)
}

/// Parse "B12" into 0-based (row, col).
pub fn parse_cell_ref(reference: &str) -> Option<(u32, u32)> {
    let reference = reference.trim().trim_start_matches('$');
    let split = reference.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = reference.split_at(split);
    if letters.is_empty() {
        return None;
    }
    let mut col: u32 = 0;
    for c in letters.trim_end_matches('$').chars() {
        if !c.is_ascii_alphabetic() {
            return None;
        }
        col = col * 26 + (c.to_ascii_uppercase() as u32 - 'A' as u32 + 1);
    }
    let row: u32 = digits.parse().ok()?;
    if row == 0 || col == 0 {
        return None;
    }
    Some((row - 1, col - 1))
}

/// "ff2563eb", "2563EB" or "#2563eb" → "#2563EB". Anything else is rejected.
pub fn normalize_color(raw: &str) -> Option<String> {
    let hex = raw.trim().trim_start_matches('#');
    if !hex.is_ascii() {
        return None;
    }
    let hex = match hex.len() {
        8 => &hex[2..],
        6 => hex,
        _ => return None,
    };
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("#{}", hex.to_ascii_uppercase()))
}

/// Lenient number parsing for text cells: thousands separators, spaces and a currency
/// prefix are ignored.
pub fn parse_number(text: &str) -> Option<f64> {
    static NOISE: OnceLock<Regex> = OnceLock::new();
    let noise = NOISE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(rs\.?|inr|\x{20B9})\s*|/-\s*$|[,\s]").expect("number noise regex")
    });
    let cleaned = noise.replace_all(text, "");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|n| n.is_finite())
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}
