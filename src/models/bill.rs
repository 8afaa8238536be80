use serde::{Deserialize, Serialize};

use super::{EstimateItem, PreviewRow};

/// One detected bill period and its reconciled content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillSheetDescriptor {
    pub original_name: String,
    /// 1-based; the output sheet is `Bill-<ordinal>`.
    pub ordinal: usize,
    pub header_row: u32,
    pub items: Vec<EstimateItem>,
    pub rows: Vec<PreviewRow>,
}

impl BillSheetDescriptor {
    pub fn output_sheet_name(&self) -> String {
        format!("Bill-{}", self.ordinal)
    }
}

/// A sheet dropped from a batch, with the step it failed at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetFailure {
    pub sheet_name: String,
    pub step: String,
    pub reason: String,
}
