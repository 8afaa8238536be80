use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Canonical columns a header row can be matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ColumnKey {
    Serial,
    Description,
    Unit,
    Quantity,
    Rate,
    Amount,
    ExecutedQuantity,
}

/// Where the header was found and which sheet column holds each canonical column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderMatch {
    pub sheet_index: usize,
    pub sheet_name: String,
    /// 0-based.
    pub row: u32,
    pub columns: IndexMap<ColumnKey, u32>,
}

impl HeaderMatch {
    pub fn column(&self, key: ColumnKey) -> Option<u32> {
        self.columns.get(&key).copied()
    }
}

/// One line of an estimate or bill sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimateItem {
    pub serial: String,
    pub description: String,
    pub unit: String,
    pub quantity: f64,
    pub rate: f64,
    pub amount: f64,
    /// Only set when the sheet carries its own executed-quantity column.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_quantity: Option<f64>,
    /// 0-based row in the source sheet.
    pub source_row: u32,
}

/// A visually delimited catalog item with its resolved rate and unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemBlock {
    pub name: String,
    pub start_row: u32,
    pub end_row: u32,
    pub rate: Option<f64>,
    pub unit: Option<String>,
}
