use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RowType {
    Base,
    Supplemental,
    Heading,
}

pub const SUPPLEMENTAL_HEADING_KEY: &str = "heading:supplemental";
pub const SUPPLEMENTAL_HEADING_TEXT: &str = "Supplemental Items";

pub fn base_key(position: usize) -> String {
    format!("base:row{}", position)
}

const SUPPLEMENTAL_PREFIX: &str = "supp:";

/// `supp:<name>` with the name lowercased and its whitespace collapsed, so every
/// spelling of one catalog item maps to the same row.
pub fn supplemental_key(name: &str) -> String {
    let name: Vec<&str> = name.split_whitespace().collect();
    format!("{}{}", SUPPLEMENTAL_PREFIX, name.join(" ").to_lowercase())
}

/// Canonical form of a caller-supplied row key.
pub fn normalize_row_key(key: &str) -> String {
    let key = key.trim();
    match key.get(..SUPPLEMENTAL_PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(SUPPLEMENTAL_PREFIX) => {
            supplemental_key(&key[SUPPLEMENTAL_PREFIX.len()..])
        }
        _ => key.to_string(),
    }
}

/// A reconciled workslip line before rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRow {
    pub row_type: RowType,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<u32>,
    pub description: String,
    pub unit: String,
    pub estimated_qty: f64,
    pub executed_qty: f64,
    /// Whether `executed_qty` came from a stored entry rather than the default.
    #[serde(default)]
    pub executed_entered: bool,
    pub rate: f64,
}

impl PreviewRow {
    pub fn heading(key: &str, text: &str) -> Self {
        Self {
            row_type: RowType::Heading,
            key: key.to_string(),
            serial: None,
            description: text.to_string(),
            unit: String::new(),
            estimated_qty: 0.0,
            executed_qty: 0.0,
            executed_entered: false,
            rate: 0.0,
        }
    }
}

/// Preview row key -> executed quantity, in insertion order. Keys are stored in
/// [`normalize_row_key`] form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "IndexMap<String, f64>", into = "IndexMap<String, f64>")]
pub struct ExecutionMap(IndexMap<String, f64>);

impl ExecutionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(&normalize_row_key(key)).copied()
    }

    pub fn insert(&mut self, key: impl AsRef<str>, qty: f64) {
        self.0.insert(normalize_row_key(key.as_ref()), qty);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(&normalize_row_key(key))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Union where entries already stored win; incoming values only fill gaps.
    /// Returns the number of keys added.
    pub fn merge_preferring_existing(&mut self, incoming: &ExecutionMap) -> usize {
        let mut added = 0;
        for (key, qty) in incoming.iter() {
            if !self.0.contains_key(key) {
                self.0.insert(key.to_string(), qty);
                added += 1;
            }
        }
        added
    }
}

impl FromIterator<(String, f64)> for ExecutionMap {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (normalize_row_key(&k), v)).collect())
    }
}

impl From<IndexMap<String, f64>> for ExecutionMap {
    fn from(raw: IndexMap<String, f64>) -> Self {
        raw.into_iter().collect()
    }
}

impl From<ExecutionMap> for IndexMap<String, f64> {
    fn from(map: ExecutionMap) -> Self {
        map.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PremiumKind {
    Excess,
    Less,
}

/// Tender premium applied once to the subtotal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenderPremium {
    pub percent: f64,
    pub kind: PremiumKind,
}

impl Default for TenderPremium {
    fn default() -> Self {
        Self {
            percent: 0.0,
            kind: PremiumKind::Excess,
        }
    }
}

impl TenderPremium {
    pub fn sign(&self) -> f64 {
        match self.kind {
            PremiumKind::Excess => 1.0,
            PremiumKind::Less => -1.0,
        }
    }

    pub fn signed_adjustment(&self, subtotal: f64) -> f64 {
        self.sign() * subtotal * self.percent / 100.0
    }

    pub fn grand_total(&self, subtotal: f64) -> f64 {
        subtotal + self.signed_adjustment(subtotal)
    }

    /// "Tender Premium @ 10% Excess"
    pub fn label(&self) -> String {
        let kind = match self.kind {
            PremiumKind::Excess => "Excess",
            PremiumKind::Less => "Less",
        };
        format!("Tender Premium @ {}% {}", trim_float(self.percent), kind)
    }
}

/// How base rows without an entered executed quantity are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnmeasuredPolicy {
    /// Executed as 0; the item shows entirely in "Less".
    Zero,
    /// Executed as estimated; no adjustment.
    #[default]
    AsEstimated,
}

impl UnmeasuredPolicy {
    pub fn executed_qty(&self, row: &PreviewRow) -> f64 {
        match (self, row.row_type, row.executed_entered) {
            (UnmeasuredPolicy::AsEstimated, RowType::Base, false) => row.estimated_qty,
            _ => row.executed_qty,
        }
    }
}

/// Literal totals for previews; the workbook itself carries formulas.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub estimated_subtotal: f64,
    pub executed_subtotal: f64,
    pub premium_adjustment: f64,
    pub grand_total: f64,
}

pub(crate) fn trim_float(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}
