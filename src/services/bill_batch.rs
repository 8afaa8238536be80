//! Multi-period bill processing: every detected sheet becomes its own bill.

use serde::Serialize;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result, Warning, WarningKind};
use crate::grid::{DocumentGrid, Sheet};
use crate::models::{base_key, BillSheetDescriptor, ExecutionMap, SheetFailure, TenderPremium};
use crate::services::catalog_indexer::CatalogIndex;
use crate::services::header_locator::{
    locate_in_sheet, locate_minimal_in_sheet, LocateOptions, BILL_COLUMNS,
};
use crate::services::item_parser::parse_items;
use crate::services::reconciler::{reconcile, ReconcileInput, ReconcileSession};

pub struct BatchContext<'a> {
    pub config: &'a EngineConfig,
    /// Polled between sheets; `true` aborts the batch.
    pub cancel: Option<&'a dyn Fn() -> bool>,
}

impl<'a> BatchContext<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config, cancel: None }
    }

    pub fn with_cancel(mut self, check: &'a dyn Fn() -> bool) -> Self {
        self.cancel = Some(check);
        self
    }

    fn canceled(&self) -> bool {
        self.cancel.map_or(false, |check| check())
    }

    fn locate_options(&self) -> LocateOptions {
        LocateOptions::from(&self.config.header)
    }
}

/// A sheet-detection rule: sheet indices it selects, in document order.
pub struct DetectionRule {
    pub name: &'static str,
    pub detect: fn(&DocumentGrid, &BatchContext) -> Vec<usize>,
}

fn by_name_prefix(grid: &DocumentGrid, ctx: &BatchContext) -> Vec<usize> {
    let prefix = ctx.config.bills.sheet_prefix.trim().to_lowercase();
    if prefix.is_empty() {
        return Vec::new();
    }
    grid.sheets()
        .iter()
        .enumerate()
        .filter(|(_, s)| s.name().trim().to_lowercase().starts_with(&prefix))
        .map(|(i, _)| i)
        .collect()
}

fn by_bill_header(grid: &DocumentGrid, ctx: &BatchContext) -> Vec<usize> {
    let options = ctx.locate_options();
    grid.sheets()
        .iter()
        .enumerate()
        .filter(|(i, s)| locate_in_sheet(s, *i, BILL_COLUMNS, &options).is_some())
        .map(|(i, _)| i)
        .collect()
}

fn by_populated_rows(grid: &DocumentGrid, _ctx: &BatchContext) -> Vec<usize> {
    grid.sheets()
        .iter()
        .enumerate()
        .filter(|(_, s)| s.populated_row_count() > 1)
        .map(|(i, _)| i)
        .collect()
}

fn first_sheet(grid: &DocumentGrid, _ctx: &BatchContext) -> Vec<usize> {
    if grid.is_empty() {
        Vec::new()
    } else {
        vec![0]
    }
}

/// Tried in order; the first rule that selects at least one sheet decides.
pub const DETECTION_RULES: &[DetectionRule] = &[
    DetectionRule {
        name: "sheet name prefix",
        detect: by_name_prefix,
    },
    DetectionRule {
        name: "bill header",
        detect: by_bill_header,
    },
    DetectionRule {
        name: "populated rows",
        detect: by_populated_rows,
    },
    DetectionRule {
        name: "first sheet",
        detect: first_sheet,
    },
];

/// The winning rule and the sheets it selected.
pub fn detect_sheets(
    grid: &DocumentGrid,
    ctx: &BatchContext,
) -> Option<(&'static str, Vec<usize>)> {
    DETECTION_RULES.iter().find_map(|rule| {
        let found = (rule.detect)(grid, ctx);
        (!found.is_empty()).then_some((rule.name, found))
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub rule: &'static str,
    pub descriptors: Vec<BillSheetDescriptor>,
    pub failures: Vec<SheetFailure>,
    pub warnings: Vec<Warning>,
}

fn failure(sheet: &Sheet, step: &str, error: &EngineError) -> SheetFailure {
    SheetFailure {
        sheet_name: sheet.name().to_string(),
        step: step.to_string(),
        reason: error.to_string(),
    }
}

/// Parse and reconcile one bill sheet with a fresh session. Sheets without a full bill
/// header fall back to a description plus quantity/rate header. Executed quantities come
/// from the sheet's own executed column, or its quantity column when it has none.
pub fn process_sheet(
    sheet: &Sheet,
    sheet_index: usize,
    ordinal: usize,
    ctx: &BatchContext,
) -> std::result::Result<(BillSheetDescriptor, Vec<Warning>), SheetFailure> {
    let options = ctx.locate_options();
    let header = locate_in_sheet(sheet, sheet_index, BILL_COLUMNS, &options)
        .or_else(|| {
            let minimal =
                locate_minimal_in_sheet(sheet, sheet_index, BILL_COLUMNS, options.search_window)?;
            tracing::info!(
                "'{}': no full bill header, using row {} ({} column(s))",
                sheet.name(),
                minimal.row + 1,
                minimal.columns.len()
            );
            Some(minimal)
        })
        .ok_or_else(|| {
            let e = EngineError::NotFound(format!(
                "no bill header in the first {} rows",
                options.search_window
            ));
            failure(sheet, "Locating header", &e)
        })?;
    let parsed = parse_items(sheet, &header).map_err(|e| failure(sheet, "Parsing items", &e))?;
    if parsed.items.is_empty() {
        let e = EngineError::NotFound("no items below the header".to_string());
        return Err(failure(sheet, "Parsing items", &e));
    }

    let execution: ExecutionMap = parsed
        .items
        .iter()
        .enumerate()
        .map(|(i, item)| (base_key(i + 1), item.executed_quantity.unwrap_or(item.quantity)))
        .collect();
    let mut session = ReconcileSession::new();
    let input = ReconcileInput {
        base_items: &parsed.items,
        execution: &execution,
        supplemental: &[],
        premium: TenderPremium::default(),
    };
    let outcome = reconcile(&mut session, &input, &CatalogIndex::default())
        .map_err(|e| failure(sheet, "Reconciling quantities", &e))?;

    let mut warnings = parsed.warnings;
    warnings.extend(outcome.warnings);
    Ok((
        BillSheetDescriptor {
            original_name: sheet.name().to_string(),
            ordinal,
            header_row: header.row,
            items: parsed.items,
            rows: outcome.rows,
        },
        warnings,
    ))
}

/// Every detected sheet in document order. Sheets that fail are reported and skipped;
/// ordinals count successful sheets only. Fails when nothing usable remains.
pub fn process_all(grid: &DocumentGrid, ctx: &BatchContext) -> Result<BatchOutcome> {
    let (rule, indices) = detect_sheets(grid, ctx)
        .ok_or_else(|| EngineError::NotFound("document has no sheets".to_string()))?;
    tracing::info!("bill sheets selected by {}: {} sheet(s)", rule, indices.len());

    let mut outcome = BatchOutcome {
        rule,
        descriptors: Vec::new(),
        failures: Vec::new(),
        warnings: Vec::new(),
    };
    for index in indices {
        if ctx.canceled() {
            return Err(EngineError::Canceled);
        }
        let Some(sheet) = grid.sheet_at(index) else {
            continue;
        };
        let ordinal = outcome.descriptors.len() + 1;
        match process_sheet(sheet, index, ordinal, ctx) {
            Ok((descriptor, warnings)) => {
                tracing::debug!("'{}' -> {}", sheet.name(), descriptor.output_sheet_name());
                outcome.descriptors.push(descriptor);
                outcome.warnings.extend(warnings);
            }
            Err(f) => {
                tracing::warn!("skipping sheet '{}' at {}: {}", f.sheet_name, f.step, f.reason);
                outcome.warnings.push(Warning::new(
                    WarningKind::SkippedSheet,
                    format!("sheet '{}' skipped ({}): {}", f.sheet_name, f.step, f.reason),
                ));
                outcome.failures.push(f);
            }
        }
    }

    if outcome.descriptors.is_empty() {
        let reasons: Vec<String> = outcome
            .failures
            .iter()
            .map(|f| format!("'{}': {}", f.sheet_name, f.reason))
            .collect();
        return Err(EngineError::NotFound(format!(
            "no usable bill sheet ({})",
            reasons.join("; ")
        )));
    }
    Ok(outcome)
}
