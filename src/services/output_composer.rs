//! Build deliverable grids: workslip, per-period bills and the estimate. Every amount,
//! adjustment and total is written as a formula over literal quantities and rates.

use crate::config::OutputConfig;
use crate::error::{EngineError, Result};
use crate::grid::{cell_ref, CellStyle, CellValue, DocumentGrid, Sheet};
use crate::models::{BillSheetDescriptor, PreviewRow, RowType, TenderPremium};
use crate::services::reconciler::{split_rows, LineKind, RenderedLine};

pub const WORKSLIP_HEADERS: [&str; 12] = [
    "Sl.No",
    "Description",
    "Unit",
    "Qty (Est)",
    "Rate (Est)",
    "Amount (Est)",
    "Qty (Exec)",
    "Rate (Exec)",
    "Amount (Exec)",
    "More",
    "Less",
    "Remarks",
];

pub const BILL_HEADERS: [&str; 7] =
    ["Sl.No", "Description", "Unit", "Qty", "Rate", "Amount", "Remarks"];

const AMOUNT_FORMAT: &str = "#,##0.00";
const AMOUNT_WIDTH: f64 = 14.0;
const HEADER_FILL: &str = "#2563EB";
const HEADER_FONT: &str = "#FFFFFF";
const TITLE_ROW: u32 = 0;
const HEADER_ROW: u32 = 2;
const FIRST_DATA_ROW: u32 = 3;

// workslip columns
const W_SERIAL: u32 = 0;
const W_DESC: u32 = 1;
const W_UNIT: u32 = 2;
const W_EST_QTY: u32 = 3;
const W_EST_RATE: u32 = 4;
const W_EST_AMOUNT: u32 = 5;
const W_EXEC_QTY: u32 = 6;
const W_EXEC_RATE: u32 = 7;
const W_EXEC_AMOUNT: u32 = 8;
const W_MORE: u32 = 9;
const W_LESS: u32 = 10;
const W_REMARKS: u32 = 11;

// bill/estimate columns
const B_SERIAL: u32 = 0;
const B_DESC: u32 = 1;
const B_UNIT: u32 = 2;
const B_QTY: u32 = 3;
const B_RATE: u32 = 4;
const B_AMOUNT: u32 = 5;
const B_REMARKS: u32 = 6;

fn amount_style() -> CellStyle {
    CellStyle::default().number_format(AMOUNT_FORMAT)
}

fn header_style() -> CellStyle {
    CellStyle::default().bold().fill(HEADER_FILL).font(HEADER_FONT)
}

fn estimate_text_width(text: &str) -> f64 {
    let w = text.chars().count() as f64 * 1.2;
    w.clamp(10.0, 50.0)
}

/// Widest text per column (header included); amount columns fixed.
fn apply_column_widths(sheet: &mut Sheet, headers: &[&str], amount_cols: &[u32]) {
    let mut widths: Vec<f64> = headers.iter().map(|h| estimate_text_width(h)).collect();
    for ((row, col), cell) in sheet.cells() {
        if row <= HEADER_ROW {
            continue;
        }
        if let (Some(w), CellValue::Text(text)) = (widths.get_mut(col as usize), &cell.value) {
            *w = w.max(estimate_text_width(text));
        }
    }
    for (col, width) in widths.into_iter().enumerate() {
        let col = col as u32;
        let width = if amount_cols.contains(&col) { AMOUNT_WIDTH } else { width };
        sheet.set_column_width(col, width);
    }
}

fn write_title_and_header(sheet: &mut Sheet, title: &str, headers: &[&str]) {
    sheet.set_styled(TITLE_ROW, 0, title, CellStyle::default().bold());
    for (col, header) in headers.iter().enumerate() {
        sheet.set_styled(HEADER_ROW, col as u32, *header, header_style());
    }
    sheet.set_freeze_rows(FIRST_DATA_ROW);
}

fn formula(text: String) -> CellValue {
    CellValue::Formula(text)
}

/// `=SUM(F4:F9)`, or `=0` over an empty data region.
fn sum_formula(col: u32, first_row: u32, last_row: Option<u32>) -> CellValue {
    match last_row {
        Some(last) => formula(format!(
            "=SUM({}:{})",
            cell_ref(first_row, col),
            cell_ref(last, col)
        )),
        None => formula("=0".to_string()),
    }
}

/// Sub Total, tender premium and Grand Total rows starting at `row`, summing `sum_cols`
/// over the data rows; the premium and grand total apply to `total_cols`.
/// Returns the row after the footer.
fn write_footer(
    sheet: &mut Sheet,
    row: u32,
    label_col: u32,
    data_rows: Option<u32>,
    sum_cols: &[u32],
    total_cols: &[u32],
    premium: &TenderPremium,
) -> u32 {
    let subtotal_row = row;
    let premium_row = row + 1;
    let grand_row = row + 2;
    let bold = CellStyle::default().bold();
    let bold_amount = amount_style().bold();

    sheet.set_styled(subtotal_row, label_col, "Sub Total", bold.clone());
    for &col in sum_cols {
        sheet.set_styled(
            subtotal_row,
            col,
            sum_formula(col, FIRST_DATA_ROW, data_rows),
            bold_amount.clone(),
        );
    }

    sheet.set_styled(premium_row, label_col, premium.label(), bold.clone());
    sheet.set_styled(grand_row, label_col, "Grand Total", bold);
    let percent = crate::models::trim_float(premium.percent);
    let op = if premium.sign() < 0.0 { '-' } else { '+' };
    for &col in total_cols {
        let subtotal = cell_ref(subtotal_row, col);
        let adjustment = cell_ref(premium_row, col);
        sheet.set_styled(
            premium_row,
            col,
            formula(format!("={}*{}/100", subtotal, percent)),
            amount_style(),
        );
        sheet.set_styled(
            grand_row,
            col,
            formula(format!("={}{}{}", subtotal, op, adjustment)),
            bold_amount.clone(),
        );
    }
    grand_row + 1
}

fn last_data_row(next_row: u32) -> Option<u32> {
    (next_row > FIRST_DATA_ROW).then(|| next_row - 1)
}

fn remark_for(line: &RenderedLine) -> &'static str {
    match line.kind {
        LineKind::Excess => "Excess over estimate",
        LineKind::Supplemental => "Supplemental item",
        _ if line.less.is_some() => "Less than estimate",
        _ => "",
    }
}

fn write_workslip_line(sheet: &mut Sheet, row: u32, line: &RenderedLine) {
    let r = |col: u32| cell_ref(row, col);
    if line.kind == LineKind::Heading {
        sheet.set_styled(row, W_DESC, line.description.as_str(), CellStyle::default().bold());
        return;
    }
    sheet.set(row, W_SERIAL, line.label.as_str());
    sheet.set(row, W_DESC, line.description.as_str());
    sheet.set(row, W_UNIT, line.unit.as_str());
    if let Some(qty) = line.estimated_qty {
        sheet.set(row, W_EST_QTY, qty);
        sheet.set_styled(row, W_EST_RATE, line.rate, amount_style());
        sheet.set_styled(
            row,
            W_EST_AMOUNT,
            formula(format!("={}*{}", r(W_EST_QTY), r(W_EST_RATE))),
            amount_style(),
        );
    }
    if let Some(qty) = line.executed_qty {
        sheet.set(row, W_EXEC_QTY, qty);
        sheet.set_styled(row, W_EXEC_RATE, line.rate, amount_style());
        sheet.set_styled(
            row,
            W_EXEC_AMOUNT,
            formula(format!("={}*{}", r(W_EXEC_QTY), r(W_EXEC_RATE))),
            amount_style(),
        );
    }
    if line.more.is_some() {
        sheet.set_styled(row, W_MORE, formula(format!("={}", r(W_EXEC_AMOUNT))), amount_style());
    }
    if line.less.is_some() {
        sheet.set_styled(
            row,
            W_LESS,
            formula(format!("={}-{}", r(W_EST_AMOUNT), r(W_EXEC_AMOUNT))),
            amount_style(),
        );
    }
    let remark = remark_for(line);
    if !remark.is_empty() {
        sheet.set(row, W_REMARKS, remark);
    }
}

/// Single-sheet workslip: the 12 fixed columns, lines from the row-splitting policy, and
/// the formula footer right below the last line.
pub fn compose_workslip(
    rows: &[PreviewRow],
    premium: &TenderPremium,
    config: &OutputConfig,
) -> Result<DocumentGrid> {
    let lines = split_rows(rows, &config.excess_prefix, config.unmeasured);
    let mut sheet = Sheet::new(config.workslip_title.as_str());
    write_title_and_header(&mut sheet, &config.workslip_title, &WORKSLIP_HEADERS);

    let mut row = FIRST_DATA_ROW;
    for line in &lines {
        write_workslip_line(&mut sheet, row, line);
        row += 1;
    }
    write_footer(
        &mut sheet,
        row,
        W_DESC,
        last_data_row(row),
        &[W_EST_AMOUNT, W_EXEC_AMOUNT, W_MORE, W_LESS],
        &[W_EST_AMOUNT, W_EXEC_AMOUNT],
        premium,
    );
    apply_column_widths(
        &mut sheet,
        &WORKSLIP_HEADERS,
        &[W_EST_AMOUNT, W_EXEC_AMOUNT, W_MORE, W_LESS],
    );
    tracing::debug!("workslip: {} line(s) from {} row(s)", lines.len(), rows.len());

    let mut grid = DocumentGrid::new();
    grid.add_sheet(sheet)?;
    Ok(grid)
}

/// A bill-layout line; `qty: None` renders the row as a heading.
struct SimpleLine<'a> {
    label: String,
    row: &'a PreviewRow,
    qty: Option<f64>,
}

fn write_simple_sheet(
    name: &str,
    title: &str,
    subtitle: Option<&str>,
    lines: &[SimpleLine],
    premium: &TenderPremium,
) -> Sheet {
    let mut sheet = Sheet::new(name);
    write_title_and_header(&mut sheet, title, &BILL_HEADERS);
    if let Some(subtitle) = subtitle {
        sheet.set(TITLE_ROW + 1, 0, subtitle);
    }
    let mut row = FIRST_DATA_ROW;
    for line in lines {
        match line.qty {
            None => {
                let bold = CellStyle::default().bold();
                sheet.set_styled(row, B_DESC, line.row.description.as_str(), bold);
            }
            Some(qty) => {
                sheet.set(row, B_SERIAL, line.label.as_str());
                sheet.set(row, B_DESC, line.row.description.as_str());
                sheet.set(row, B_UNIT, line.row.unit.as_str());
                sheet.set(row, B_QTY, qty);
                sheet.set_styled(row, B_RATE, line.row.rate, amount_style());
                sheet.set_styled(
                    row,
                    B_AMOUNT,
                    formula(format!("={}*{}", cell_ref(row, B_QTY), cell_ref(row, B_RATE))),
                    amount_style(),
                );
                if line.row.row_type == RowType::Supplemental {
                    sheet.set(row, B_REMARKS, "Supplemental item");
                }
            }
        }
        row += 1;
    }
    write_footer(&mut sheet, row, B_DESC, last_data_row(row), &[B_AMOUNT], &[B_AMOUNT], premium);
    apply_column_widths(&mut sheet, &BILL_HEADERS, &[B_AMOUNT]);
    sheet
}

fn bill_title(config: &OutputConfig, ordinal: usize) -> String {
    if ordinal > 1 {
        format!("{} ({})", config.bill_title, ordinal)
    } else {
        config.bill_title.clone()
    }
}

/// One `Bill-<n>` sheet per descriptor, in descriptor order.
pub fn compose_bills(
    descriptors: &[BillSheetDescriptor],
    premium: &TenderPremium,
    config: &OutputConfig,
) -> Result<DocumentGrid> {
    if descriptors.is_empty() {
        return Err(EngineError::NotFound("no bill sheets to compose".to_string()));
    }
    let mut grid = DocumentGrid::new();
    for descriptor in descriptors {
        let lines: Vec<SimpleLine> = descriptor
            .rows
            .iter()
            .map(|row| SimpleLine {
                label: row.serial.map(|s| s.to_string()).unwrap_or_default(),
                row,
                qty: (row.row_type != RowType::Heading)
                    .then(|| config.unmeasured.executed_qty(row)),
            })
            .collect();
        let subtitle = format!("Source sheet: {}", descriptor.original_name);
        let sheet = write_simple_sheet(
            &descriptor.output_sheet_name(),
            &bill_title(config, descriptor.ordinal),
            Some(&subtitle),
            &lines,
            premium,
        );
        grid.add_sheet(sheet)?;
    }
    Ok(grid)
}

/// Estimate deliverable: base rows at their estimated quantities.
pub fn compose_estimate(
    rows: &[PreviewRow],
    premium: &TenderPremium,
    config: &OutputConfig,
) -> Result<DocumentGrid> {
    let lines: Vec<SimpleLine> = rows
        .iter()
        .filter(|r| r.row_type == RowType::Base)
        .map(|row| SimpleLine {
            label: row.serial.map(|s| s.to_string()).unwrap_or_default(),
            row,
            qty: Some(row.estimated_qty),
        })
        .collect();
    let title = &config.estimate_title;
    let sheet = write_simple_sheet(title, title, None, &lines, premium);
    let mut grid = DocumentGrid::new();
    grid.add_sheet(sheet)?;
    Ok(grid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{base_key, PremiumKind, UnmeasuredPolicy};

    fn base(n: usize, description: &str, est: f64, exec: Option<f64>, rate: f64) -> PreviewRow {
        PreviewRow {
            row_type: RowType::Base,
            key: base_key(n),
            serial: Some(n as u32),
            description: description.to_string(),
            unit: "cum".to_string(),
            estimated_qty: est,
            executed_qty: exec.unwrap_or(0.0),
            executed_entered: exec.is_some(),
            rate,
        }
    }

    fn formula_at(sheet: &Sheet, row: u32, col: u32) -> String {
        match sheet.value(row, col) {
            CellValue::Formula(f) => f.clone(),
            other => panic!("expected formula at {}, got {:?}", cell_ref(row, col), other),
        }
    }

    #[test]
    fn workslip_layout_and_footer_formulas() {
        let rows = vec![
            base(1, "Excavation", 100.0, Some(80.0), 50.0),
            base(2, "Concrete", 50.0, None, 200.0),
            base(3, "Plaster", 10.0, Some(12.0), 5.0),
        ];
        let premium = TenderPremium {
            percent: 10.0,
            kind: PremiumKind::Less,
        };
        let grid = compose_workslip(&rows, &premium, &OutputConfig::default()).unwrap();
        let sheet = grid.sheet_at(0).unwrap();
        assert_eq!(sheet.name(), "Workslip");
        for (col, header) in WORKSLIP_HEADERS.iter().enumerate() {
            assert_eq!(sheet.text(HEADER_ROW, col as u32), *header);
        }
        assert!(sheet.style(HEADER_ROW, 0).unwrap().bold);

        // Excel rows 4..=7: Excavation, Concrete, Plaster, AE1
        assert_eq!(formula_at(sheet, 3, W_LESS), "=F4-I4");
        assert_eq!(sheet.number(3, W_EXEC_QTY), Some(80.0));
        assert_eq!(sheet.number(4, W_EXEC_QTY), Some(50.0));
        assert!(sheet.value(4, W_LESS).is_empty());
        assert_eq!(sheet.number(5, W_EXEC_QTY), Some(10.0));
        assert_eq!(sheet.text(6, W_SERIAL), "AE1");
        assert!(sheet.value(6, W_EST_QTY).is_empty());
        assert_eq!(sheet.number(6, W_EXEC_QTY), Some(2.0));
        assert_eq!(formula_at(sheet, 6, W_MORE), "=I7");

        assert_eq!(sheet.text(7, W_DESC), "Sub Total");
        assert_eq!(formula_at(sheet, 7, W_EXEC_AMOUNT), "=SUM(I4:I7)");
        assert_eq!(formula_at(sheet, 7, W_LESS), "=SUM(K4:K7)");
        assert_eq!(sheet.text(8, W_DESC), "Tender Premium @ 10% Less");
        assert_eq!(formula_at(sheet, 8, W_EXEC_AMOUNT), "=I8*10/100");
        assert_eq!(sheet.text(9, W_DESC), "Grand Total");
        assert_eq!(formula_at(sheet, 9, W_EXEC_AMOUNT), "=I8-I9");
        assert_eq!(formula_at(sheet, 9, W_EST_AMOUNT), "=F8-F9");
        assert_eq!(sheet.max_row(), Some(9));
    }

    #[test]
    fn zero_policy_puts_unmeasured_items_in_less() {
        let rows = vec![base(1, "Concrete", 50.0, None, 200.0)];
        let config = OutputConfig {
            unmeasured: UnmeasuredPolicy::Zero,
            ..OutputConfig::default()
        };
        let grid = compose_workslip(&rows, &TenderPremium::default(), &config).unwrap();
        let sheet = grid.sheet_at(0).unwrap();
        assert_eq!(sheet.number(3, W_EXEC_QTY), Some(0.0));
        assert_eq!(formula_at(sheet, 3, W_LESS), "=F4-I4");
    }

    #[test]
    fn empty_workslip_still_has_a_footer() {
        let grid =
            compose_workslip(&[], &TenderPremium::default(), &OutputConfig::default()).unwrap();
        let sheet = grid.sheet_at(0).unwrap();
        assert_eq!(sheet.text(FIRST_DATA_ROW, W_DESC), "Sub Total");
        assert_eq!(formula_at(sheet, FIRST_DATA_ROW, W_EXEC_AMOUNT), "=0");
    }

    #[test]
    fn bills_get_one_sheet_each_with_numbered_titles() {
        let descriptor = |ordinal: usize, name: &str, qty: f64| BillSheetDescriptor {
            original_name: name.to_string(),
            ordinal,
            header_row: 2,
            items: Vec::new(),
            rows: vec![base(1, "Excavation", 100.0, Some(qty), 50.0)],
        };
        let descriptors = vec![descriptor(1, "Bill Jan", 40.0), descriptor(2, "Bill Feb", 35.0)];
        let grid = compose_bills(&descriptors, &TenderPremium::default(), &OutputConfig::default())
            .unwrap();
        assert_eq!(grid.sheet_names(), vec!["Bill-1", "Bill-2"]);
        let first = grid.sheet("Bill-1").unwrap();
        let second = grid.sheet("Bill-2").unwrap();
        assert_eq!(first.text(TITLE_ROW, 0), "Running Account Bill");
        assert_eq!(second.text(TITLE_ROW, 0), "Running Account Bill (2)");
        assert_eq!(second.text(TITLE_ROW + 1, 0), "Source sheet: Bill Feb");
        assert_eq!(first.number(3, B_QTY), Some(40.0));
        assert_eq!(second.number(3, B_QTY), Some(35.0));
        assert_eq!(formula_at(second, 3, B_AMOUNT), "=D4*E4");
        assert_eq!(formula_at(second, 4, B_AMOUNT), "=SUM(F4:F4)");
        assert_eq!(formula_at(second, 6, B_AMOUNT), "=F5+F6");

        assert!(compose_bills(&[], &TenderPremium::default(), &OutputConfig::default()).is_err());
    }

    #[test]
    fn estimate_uses_estimated_quantities_only() {
        let mut rows = vec![base(1, "Excavation", 100.0, Some(80.0), 50.0)];
        rows.push(PreviewRow::heading("heading:supplemental", "Supplemental Items"));
        let grid =
            compose_estimate(&rows, &TenderPremium::default(), &OutputConfig::default()).unwrap();
        let sheet = grid.sheet("Estimate").unwrap();
        assert_eq!(sheet.number(3, B_QTY), Some(100.0));
        assert_eq!(sheet.text(4, B_DESC), "Sub Total");
    }

    #[test]
    fn amount_columns_have_fixed_width() {
        let long = "A very long description of earthwork in all kinds of soil";
        let rows = vec![base(1, long, 1.0, None, 1.0)];
        let grid =
            compose_workslip(&rows, &TenderPremium::default(), &OutputConfig::default()).unwrap();
        let widths: Vec<(u32, f64)> = grid.sheet_at(0).unwrap().column_widths().collect();
        assert!(widths.contains(&(W_EST_AMOUNT, AMOUNT_WIDTH)));
        let desc = widths.iter().find(|(c, _)| *c == W_DESC).unwrap().1;
        assert!(desc > 50.0 * 0.9);
    }
}
