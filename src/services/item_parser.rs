//! Extract ordered item records below a located header.

use crate::error::{EngineError, Result, Warning, WarningKind};
use crate::grid::Sheet;
use crate::models::{ColumnKey, EstimateItem, HeaderMatch};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedItems {
    pub items: Vec<EstimateItem>,
    /// Row that ended the table (blank or total-labeled); `None` when the sheet ran out.
    pub terminator_row: Option<u32>,
    pub warnings: Vec<Warning>,
}

/// "Sub Total", "TOTAL", "Grand total" ... never items, always the end of the table.
pub fn is_total_label(text: &str) -> bool {
    text.to_lowercase().contains("total")
}

/// Read items from the row after `header.row` until a blank row or a total row.
/// Blank rows directly under the header are skipped; section headings (text without
/// quantity or rate) are skipped silently; unusable rows are skipped with a warning.
pub fn parse_items(sheet: &Sheet, header: &HeaderMatch) -> Result<ParsedItems> {
    let desc_col = header.column(ColumnKey::Description).ok_or_else(|| {
        EngineError::NotFound(format!(
            "header on sheet '{}' row {} has no description column",
            sheet.name(),
            header.row + 1
        ))
    })?;
    let serial_col = header.column(ColumnKey::Serial);
    let unit_col = header.column(ColumnKey::Unit);
    let qty_col = header.column(ColumnKey::Quantity);
    let rate_col = header.column(ColumnKey::Rate);
    let amount_col = header.column(ColumnKey::Amount);
    let executed_col = header.column(ColumnKey::ExecutedQuantity);
    let mapped: Vec<u32> = header.columns.values().copied().collect();

    let mut parsed = ParsedItems::default();
    let Some(last_row) = sheet.max_row() else {
        return Ok(parsed);
    };
    let text_at = |row: u32, col: Option<u32>| col.map(|c| sheet.text(row, c)).unwrap_or_default();
    let number_at = |row: u32, col: Option<u32>| col.and_then(|c| sheet.number(row, c));

    for row in (header.row + 1)..=last_row {
        let blank = mapped.iter().all(|&c| sheet.value(row, c).is_empty());
        if blank {
            if parsed.items.is_empty() {
                continue;
            }
            parsed.terminator_row = Some(row);
            break;
        }

        let description = sheet.text(row, desc_col);
        let serial = text_at(row, serial_col);
        if is_total_label(&description) || is_total_label(&serial) {
            parsed.terminator_row = Some(row);
            break;
        }

        let quantity = number_at(row, qty_col);
        let rate = number_at(row, rate_col);
        let executed = number_at(row, executed_col);
        if description.is_empty() {
            parsed.warnings.push(Warning::new(
                WarningKind::SkippedRow,
                format!("'{}' row {}: values without a description", sheet.name(), row + 1),
            ));
            continue;
        }
        if quantity.is_none() && rate.is_none() && executed.is_none() {
            tracing::debug!(
                "'{}' row {}: section heading '{}'",
                sheet.name(),
                row + 1,
                description
            );
            continue;
        }

        let quantity = quantity.unwrap_or(0.0);
        let rate = rate.unwrap_or(0.0);
        if quantity < 0.0 || rate < 0.0 || executed.map_or(false, |e| e < 0.0) {
            parsed.warnings.push(Warning::new(
                WarningKind::SkippedRow,
                format!(
                    "'{}' row {}: negative quantity or rate for '{}'",
                    sheet.name(),
                    row + 1,
                    description
                ),
            ));
            continue;
        }
        let amount = number_at(row, amount_col).unwrap_or(quantity * rate);

        parsed.items.push(EstimateItem {
            serial,
            description,
            unit: text_at(row, unit_col),
            quantity,
            rate,
            amount,
            executed_quantity: executed_col.map(|_| executed.unwrap_or(0.0)),
            source_row: row,
        });
    }

    tracing::debug!(
        "'{}': {} item(s), {} skipped",
        sheet.name(),
        parsed.items.len(),
        parsed.warnings.len()
    );
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{CellValue, DocumentGrid};
    use crate::services::header_locator::{
        locate, ColumnSpec, LocateOptions, BILL_COLUMNS, ESTIMATE_COLUMNS,
    };

    fn estimate_sheet() -> Sheet {
        let mut s = Sheet::new("Estimate");
        s.set(0, 0, "Estimate for road works");
        for (c, h) in ["Sl.No", "Description", "Unit", "Quantity", "Rate", "Amount"]
            .iter()
            .enumerate()
        {
            s.set(2, c as u32, *h);
        }
        s.set(4, 1, "Earth work");
        s.set(5, 0, "1");
        s.set(5, 1, "Excavation");
        s.set(5, 2, "cum");
        s.set(5, 3, 100.0);
        s.set(5, 4, 50.0);
        s.set(6, 0, "2");
        s.set(6, 1, "Concrete");
        s.set(6, 2, "cum");
        s.set(6, 3, "50");
        s.set(6, 4, "200");
        s.set(6, 5, 9999.0);
        s.set(7, 1, "Sub Total");
        s.set(7, 5, 14999.0);
        s.set(8, 1, "Not an item");
        s.set(8, 3, 1.0);
        s
    }

    fn header_for(sheet: Sheet, columns: &[ColumnSpec]) -> (Sheet, HeaderMatch) {
        let mut grid = DocumentGrid::new();
        grid.add_sheet(sheet.clone()).unwrap();
        let header = locate(&grid, columns, &LocateOptions::default()).unwrap();
        (sheet, header)
    }

    #[test]
    fn stops_at_total_and_skips_headings() {
        let (sheet, header) = header_for(estimate_sheet(), ESTIMATE_COLUMNS);
        let parsed = parse_items(&sheet, &header).unwrap();
        assert_eq!(parsed.items.len(), 2);
        assert_eq!(parsed.terminator_row, Some(7));
        let excavation = &parsed.items[0];
        assert_eq!(excavation.description, "Excavation");
        assert_eq!(excavation.amount, 5000.0);
        assert_eq!(excavation.executed_quantity, None);
        let concrete = &parsed.items[1];
        assert_eq!(concrete.quantity, 50.0);
        assert_eq!(concrete.rate, 200.0);
        // explicit amount wins over qty x rate
        assert_eq!(concrete.amount, 9999.0);
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn blank_row_after_items_terminates() {
        let mut sheet = estimate_sheet();
        sheet.set(7, 1, "");
        sheet.set(7, 5, CellValue::Empty);
        let (sheet, header) = header_for(sheet, ESTIMATE_COLUMNS);
        let parsed = parse_items(&sheet, &header).unwrap();
        assert_eq!(parsed.items.len(), 2);
        assert_eq!(parsed.terminator_row, Some(7));
    }

    #[test]
    fn negative_and_orphan_rows_become_warnings() {
        let mut sheet = estimate_sheet();
        sheet.set(6, 3, -5.0);
        sheet.set(7, 1, "");
        sheet.set(7, 5, 12.0);
        sheet.set(8, 1, "Total");
        let (sheet, header) = header_for(sheet, ESTIMATE_COLUMNS);
        let parsed = parse_items(&sheet, &header).unwrap();
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(parsed.warnings.len(), 2);
        assert!(parsed.warnings.iter().all(|w| w.kind == WarningKind::SkippedRow));
        assert_eq!(parsed.terminator_row, Some(8));
    }

    #[test]
    fn executed_column_is_read_when_present() {
        let mut s = Sheet::new("Bill-1");
        for (c, h) in ["Sl No", "Description", "Unit", "Qty", "Rate", "Executed"]
            .iter()
            .enumerate()
        {
            s.set(0, c as u32, *h);
        }
        s.set(1, 1, "Excavation");
        s.set(1, 3, 100.0);
        s.set(1, 4, 50.0);
        s.set(1, 5, 120.0);
        s.set(2, 1, "Plaster");
        s.set(2, 3, 10.0);
        s.set(2, 4, 5.0);
        let (sheet, header) = header_for(s, BILL_COLUMNS);
        let parsed = parse_items(&sheet, &header).unwrap();
        assert_eq!(parsed.items[0].executed_quantity, Some(120.0));
        assert_eq!(parsed.items[1].executed_quantity, Some(0.0));
        assert_eq!(parsed.terminator_row, None);
    }
}
