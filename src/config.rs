use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::models::UnmeasuredPolicy;

/// Engine configuration. Every field has a default matching the catalog/bill conventions
/// seen in practice; deployments override through `WORKSLIP_*` env vars or a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub header: HeaderConfig,
    pub catalog: CatalogConfig,
    pub bills: BillConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeaderConfig {
    /// Rows scanned from the top of each sheet.
    pub search_window: u32,
    /// Distinct expected columns a row must match to count as the header.
    pub min_matches: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CatalogConfig {
    /// Sheet holding the item blocks; first sheet when unset or missing.
    pub sheet_name: Option<String>,
    pub heading_fill: String,
    pub heading_font: String,
    /// Offsets from the leftmost data column of the catalog sheet.
    pub rate_offset: u32,
    pub unit_offset: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BillConfig {
    pub sheet_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputConfig {
    pub workslip_title: String,
    pub bill_title: String,
    pub estimate_title: String,
    /// Label prefix of excess lines: AE1, AE2, ...
    pub excess_prefix: String,
    /// Rendering of base items nobody entered an executed quantity for.
    pub unmeasured: UnmeasuredPolicy,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            search_window: 15,
            min_matches: 4,
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            sheet_name: None,
            heading_fill: "#FFFF00".to_string(),
            heading_font: "#FF0000".to_string(),
            rate_offset: 10,
            unit_offset: 3,
        }
    }
}

impl Default for BillConfig {
    fn default() -> Self {
        Self {
            sheet_prefix: "Bill".to_string(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            workslip_title: "Workslip".to_string(),
            bill_title: "Running Account Bill".to_string(),
            estimate_title: "Estimate".to_string(),
            excess_prefix: "AE".to_string(),
            unmeasured: UnmeasuredPolicy::AsEstimated,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            header: HeaderConfig::default(),
            catalog: CatalogConfig::default(),
            bills: BillConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl EngineConfig {
    /// Load `.env` (if present) and overlay `WORKSLIP_*` variables on the defaults.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        if let Some(v) = env_parse("WORKSLIP_HEADER_SEARCH_WINDOW") {
            config.header.search_window = v;
        }
        if let Some(v) = env_parse("WORKSLIP_HEADER_MIN_MATCHES") {
            config.header.min_matches = v;
        }
        if let Some(v) = env_string("WORKSLIP_CATALOG_SHEET") {
            config.catalog.sheet_name = Some(v);
        }
        if let Some(v) = env_string("WORKSLIP_CATALOG_HEADING_FILL") {
            config.catalog.heading_fill = v;
        }
        if let Some(v) = env_string("WORKSLIP_CATALOG_HEADING_FONT") {
            config.catalog.heading_font = v;
        }
        if let Some(v) = env_parse("WORKSLIP_CATALOG_RATE_OFFSET") {
            config.catalog.rate_offset = v;
        }
        if let Some(v) = env_parse("WORKSLIP_CATALOG_UNIT_OFFSET") {
            config.catalog.unit_offset = v;
        }
        if let Some(v) = env_string("WORKSLIP_BILL_SHEET_PREFIX") {
            config.bills.sheet_prefix = v;
        }
        match env_string("WORKSLIP_UNMEASURED").as_deref() {
            Some("zero") => config.output.unmeasured = UnmeasuredPolicy::Zero,
            Some("asEstimated") => config.output.unmeasured = UnmeasuredPolicy::AsEstimated,
            Some(other) => tracing::warn!("ignoring WORKSLIP_UNMEASURED={}", other),
            None => {}
        }
        config
    }

    /// Parse a JSON config; missing fields fall back to defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| EngineError::validation("config", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(
            r##"{"catalog": {"headingFill": "#00FF00"}, "header": {"minMatches": 3}}"##,
        )
        .unwrap();
        assert_eq!(config.catalog.heading_fill, "#00FF00");
        assert_eq!(config.catalog.heading_font, "#FF0000");
        assert_eq!(config.catalog.rate_offset, 10);
        assert_eq!(config.header.min_matches, 3);
        assert_eq!(config.header.search_window, 15);
        assert_eq!(config.bills.sheet_prefix, "Bill");
        assert_eq!(config.output.unmeasured, UnmeasuredPolicy::AsEstimated);
    }

    #[test]
    fn unmeasured_policy_is_camel_case() {
        let config = EngineConfig::from_json(r#"{"output": {"unmeasured": "zero"}}"#).unwrap();
        assert_eq!(config.output.unmeasured, UnmeasuredPolicy::Zero);
        assert_eq!(config.output.excess_prefix, "AE");
    }

    #[test]
    fn bad_json_is_a_validation_error() {
        let err = EngineConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }
}
