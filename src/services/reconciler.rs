//! Merge estimated items, executed quantities and supplemental catalog items into the
//! canonical preview, and split preview rows into output lines at render time.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result, Warning, WarningKind};
use crate::models::{
    base_key, normalize_row_key, supplemental_key, EstimateItem, ExecutionMap, PreviewRow,
    RowType, TenderPremium, Totals, UnmeasuredPolicy, SUPPLEMENTAL_HEADING_KEY,
    SUPPLEMENTAL_HEADING_TEXT,
};
use crate::services::catalog_indexer::CatalogIndex;

const QTY_EPSILON: f64 = 1e-9;

/// Caller-owned state carried between reconciliation requests for one estimate.
/// The caller persists it; the engine keeps nothing between calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSession {
    rows: Vec<PreviewRow>,
    executed: ExecutionMap,
    premium: TenderPremium,
}

impl ReconcileSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[PreviewRow] {
        &self.rows
    }

    pub fn executed(&self) -> &ExecutionMap {
        &self.executed
    }

    pub fn premium(&self) -> TenderPremium {
        self.premium
    }

    /// Explicit correction of an already stored quantity. Unlike merging, this replaces.
    pub fn override_executed(&mut self, key: &str, qty: f64) -> Result<()> {
        let field = format!("executed[{}]", key);
        validate_qty(&field, qty)?;
        let key = normalize_row_key(key);
        let row = self
            .rows
            .iter_mut()
            .find(|r| r.key == key && r.row_type != RowType::Heading)
            .ok_or_else(|| EngineError::validation(field, "unknown row key"))?;
        row.executed_qty = qty;
        row.executed_entered = true;
        self.executed.insert(&key, qty);
        Ok(())
    }
}

/// One reconciliation request.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileInput<'a> {
    pub base_items: &'a [EstimateItem],
    pub execution: &'a ExecutionMap,
    pub supplemental: &'a [String],
    pub premium: TenderPremium,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    pub rows: Vec<PreviewRow>,
    pub totals: Totals,
    pub warnings: Vec<Warning>,
}

fn validate_qty(field: &str, qty: f64) -> Result<()> {
    if !qty.is_finite() {
        return Err(EngineError::validation(field, "must be a finite number"));
    }
    if qty < 0.0 {
        return Err(EngineError::validation(field, "must be >= 0"));
    }
    Ok(())
}

/// Range/type checks on everything the caller supplied. Runs before any state changes.
pub fn validate(input: &ReconcileInput) -> Result<()> {
    for (key, qty) in input.execution.iter() {
        validate_qty(&format!("executed[{}]", key), qty)?;
    }
    for (i, item) in input.base_items.iter().enumerate() {
        validate_qty(&format!("items[{}].quantity", i + 1), item.quantity)?;
        validate_qty(&format!("items[{}].rate", i + 1), item.rate)?;
    }
    for name in input.supplemental {
        if name.trim().is_empty() {
            return Err(EngineError::validation("supplemental", "item name is empty"));
        }
    }
    let percent = input.premium.percent;
    if !percent.is_finite() || percent < 0.0 {
        return Err(EngineError::validation("tenderPremium.percent", "must be a number >= 0"));
    }
    Ok(())
}

/// Rebuild the preview for `input`, merging into `session`.
///
/// Executed quantities already stored in the session are never reset by a later call;
/// incoming values only fill keys the session has not seen. Supplemental items already
/// present keep their catalog rate/unit from when they were first added.
pub fn reconcile(
    session: &mut ReconcileSession,
    input: &ReconcileInput,
    catalog: &CatalogIndex,
) -> Result<ReconcileOutcome> {
    validate(input)?;
    let mut warnings = Vec::new();

    let added = session.executed.merge_preferring_existing(input.execution);
    tracing::debug!("merged {} new executed quantity entr(ies)", added);

    let mut rows: Vec<PreviewRow> = Vec::with_capacity(input.base_items.len() + 1);
    for (i, item) in input.base_items.iter().enumerate() {
        let key = base_key(i + 1);
        let stored = session.executed.get(&key);
        rows.push(PreviewRow {
            row_type: RowType::Base,
            key,
            serial: Some(i as u32 + 1),
            description: item.description.clone(),
            unit: item.unit.clone(),
            estimated_qty: item.quantity,
            executed_qty: stored.unwrap_or(0.0),
            executed_entered: stored.is_some(),
            rate: item.rate,
        });
    }

    let mut supplemental: Vec<PreviewRow> = session
        .rows
        .iter()
        .filter(|r| r.row_type == RowType::Supplemental)
        .cloned()
        .collect();
    for row in &mut supplemental {
        row.key = normalize_row_key(&row.key);
    }
    let mut seen: HashSet<String> = supplemental.iter().map(|r| r.key.clone()).collect();
    for name in input.supplemental {
        let key = supplemental_key(name);
        if !seen.insert(key.clone()) {
            continue;
        }
        let block = catalog.get(name);
        let rate = block.and_then(|b| b.rate);
        if rate.is_none() {
            let reason = if block.is_some() { "has no rate" } else { "is not in the catalog" };
            tracing::warn!("supplemental item '{}' {}; using rate 0", name.trim(), reason);
            warnings.push(Warning::new(
                WarningKind::MissingCatalogRate,
                format!("supplemental item '{}' {}; rate set to 0", name.trim(), reason),
            ));
        }
        supplemental.push(PreviewRow {
            row_type: RowType::Supplemental,
            key,
            serial: None,
            description: block.map(|b| b.name.clone()).unwrap_or_else(|| name.trim().to_string()),
            unit: block.and_then(|b| b.unit.clone()).unwrap_or_default(),
            estimated_qty: 0.0,
            executed_qty: 0.0,
            executed_entered: false,
            rate: rate.unwrap_or(0.0),
        });
    }

    if !supplemental.is_empty() {
        rows.push(PreviewRow::heading(SUPPLEMENTAL_HEADING_KEY, SUPPLEMENTAL_HEADING_TEXT));
        let mut serial = input.base_items.len() as u32;
        for mut row in supplemental {
            serial += 1;
            row.serial = Some(serial);
            let stored = session.executed.get(&row.key);
            row.executed_qty = stored.unwrap_or(0.0);
            row.executed_entered = stored.is_some();
            rows.push(row);
        }
    }

    session.rows = rows;
    session.premium = input.premium;
    let totals = totals(&session.rows, &session.premium, UnmeasuredPolicy::Zero);
    Ok(ReconcileOutcome {
        rows: session.rows.clone(),
        totals,
        warnings,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LineKind {
    Item,
    Excess,
    Supplemental,
    Heading,
}

/// A workslip output line. Quantities are `None` where the column stays blank.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedLine {
    pub kind: LineKind,
    pub key: String,
    pub label: String,
    pub description: String,
    pub unit: String,
    pub estimated_qty: Option<f64>,
    pub executed_qty: Option<f64>,
    pub rate: f64,
    pub more: Option<f64>,
    pub less: Option<f64>,
}

impl RenderedLine {
    pub fn estimated_amount(&self) -> f64 {
        self.estimated_qty.unwrap_or(0.0) * self.rate
    }

    pub fn executed_amount(&self) -> f64 {
        self.executed_qty.unwrap_or(0.0) * self.rate
    }
}

/// Row-splitting policy. Excess over the estimate gets its own line labeled
/// `<prefix><k>`, k counting across the whole document; shortfall shows in "Less".
pub fn split_rows(
    rows: &[PreviewRow],
    excess_prefix: &str,
    policy: UnmeasuredPolicy,
) -> Vec<RenderedLine> {
    let mut lines = Vec::with_capacity(rows.len());
    let mut excess_seq = 0;
    for row in rows {
        let label = row.serial.map(|s| s.to_string()).unwrap_or_default();
        let base = RenderedLine {
            kind: LineKind::Item,
            key: row.key.clone(),
            label,
            description: row.description.clone(),
            unit: row.unit.clone(),
            estimated_qty: None,
            executed_qty: None,
            rate: row.rate,
            more: None,
            less: None,
        };
        match row.row_type {
            RowType::Heading => lines.push(RenderedLine {
                kind: LineKind::Heading,
                rate: 0.0,
                ..base
            }),
            RowType::Supplemental => {
                let executed = row.executed_qty;
                lines.push(RenderedLine {
                    kind: LineKind::Supplemental,
                    executed_qty: Some(executed),
                    more: Some(executed * row.rate),
                    ..base
                });
            }
            RowType::Base => {
                let estimated = row.estimated_qty;
                let executed = policy.executed_qty(row);
                let diff = executed - estimated;
                if diff > QTY_EPSILON {
                    excess_seq += 1;
                    lines.push(RenderedLine {
                        estimated_qty: Some(estimated),
                        executed_qty: Some(estimated),
                        ..base.clone()
                    });
                    lines.push(RenderedLine {
                        kind: LineKind::Excess,
                        key: format!("{}:excess", row.key),
                        label: format!("{}{}", excess_prefix, excess_seq),
                        executed_qty: Some(diff),
                        more: Some(diff * row.rate),
                        ..base
                    });
                } else if diff < -QTY_EPSILON {
                    lines.push(RenderedLine {
                        estimated_qty: Some(estimated),
                        executed_qty: Some(executed),
                        less: Some(-diff * row.rate),
                        ..base
                    });
                } else {
                    lines.push(RenderedLine {
                        estimated_qty: Some(estimated),
                        executed_qty: Some(executed),
                        ..base
                    });
                }
            }
        }
    }
    lines
}

/// Literal totals matching the formulas the composer writes.
pub fn totals(rows: &[PreviewRow], premium: &TenderPremium, policy: UnmeasuredPolicy) -> Totals {
    let lines = split_rows(rows, "", policy);
    let estimated_subtotal: f64 = lines.iter().map(RenderedLine::estimated_amount).sum();
    let executed_subtotal: f64 = lines.iter().map(RenderedLine::executed_amount).sum();
    Totals {
        estimated_subtotal,
        executed_subtotal,
        premium_adjustment: premium.signed_adjustment(executed_subtotal),
        grand_total: premium.grand_total(executed_subtotal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{CellStyle, Sheet};
    use crate::models::PremiumKind;
    use crate::services::catalog_indexer::{index, CatalogLayout, HeadingStyle};

    fn item(description: &str, quantity: f64, rate: f64) -> EstimateItem {
        EstimateItem {
            serial: String::new(),
            description: description.to_string(),
            unit: "cum".to_string(),
            quantity,
            rate,
            amount: quantity * rate,
            executed_quantity: None,
            source_row: 0,
        }
    }

    fn two_items() -> Vec<EstimateItem> {
        vec![item("Excavation", 100.0, 50.0), item("Concrete", 50.0, 200.0)]
    }

    fn catalog() -> CatalogIndex {
        let heading = CellStyle::default().fill("#FFFF00").font("#FF0000");
        let mut s = Sheet::new("SOR");
        s.set_styled(0, 0, "Steel reinforcement", heading.clone());
        s.set(1, 3, "kg");
        s.set(1, 10, 85.0);
        s.set_styled(2, 0, "Shuttering", heading);
        s.set(3, 3, "sqm");
        index(&s, &HeadingStyle::new("#FFFF00", "#FF0000"), CatalogLayout::default())
    }

    fn map(entries: &[(&str, f64)]) -> ExecutionMap {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn input<'a>(
        items: &'a [EstimateItem],
        execution: &'a ExecutionMap,
        supplemental: &'a [String],
    ) -> ReconcileInput<'a> {
        ReconcileInput {
            base_items: items,
            execution,
            supplemental,
            premium: TenderPremium::default(),
        }
    }

    #[test]
    fn preview_then_execution_shows_less() {
        let items = two_items();
        let mut session = ReconcileSession::new();
        let empty = ExecutionMap::new();
        let first = reconcile(&mut session, &input(&items, &empty, &[]), &catalog()).unwrap();
        assert_eq!(first.rows.len(), 2);
        assert!(first.rows.iter().all(|r| r.row_type == RowType::Base && r.executed_qty == 0.0));
        assert_eq!(first.rows[0].key, "base:row1");
        assert_eq!(first.rows[1].key, "base:row2");

        let measured = map(&[("base:row1", 80.0)]);
        let second = reconcile(&mut session, &input(&items, &measured, &[]), &catalog()).unwrap();
        assert_eq!(second.rows[0].executed_qty, 80.0);

        let lines = split_rows(session.rows(), "AE", UnmeasuredPolicy::AsEstimated);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].less, Some(1000.0));
        assert_eq!(lines[1].less, None);
        let totals =
            totals(session.rows(), &TenderPremium::default(), UnmeasuredPolicy::AsEstimated);
        assert_eq!(totals.executed_subtotal, 14000.0);
        assert_eq!(totals.estimated_subtotal, 15000.0);
    }

    #[test]
    fn merge_is_idempotent_and_never_resets() {
        let items = two_items();
        let mut session = ReconcileSession::new();
        let measured = map(&[("base:row1", 80.0), ("base:row2", 55.0)]);
        reconcile(&mut session, &input(&items, &measured, &[]), &catalog()).unwrap();
        let again = reconcile(&mut session, &input(&items, &measured, &[]), &catalog()).unwrap();
        assert_eq!(again.rows[0].executed_qty, 80.0);
        assert_eq!(again.rows[1].executed_qty, 55.0);

        // a later request adding supplemental items with a stale/zero map keeps quantities
        let stale = map(&[("base:row1", 0.0)]);
        let names = vec!["Steel reinforcement".to_string()];
        let later = reconcile(&mut session, &input(&items, &stale, &names), &catalog()).unwrap();
        assert_eq!(later.rows[0].executed_qty, 80.0);
        assert_eq!(later.rows[1].executed_qty, 55.0);
        assert_eq!(session.executed().len(), 2);
    }

    #[test]
    fn supplemental_rows_get_one_heading_and_catalog_rates() {
        let items = two_items();
        let mut session = ReconcileSession::new();
        let empty = ExecutionMap::new();
        let first_names = vec!["steel REINFORCEMENT".to_string()];
        reconcile(&mut session, &input(&items, &empty, &first_names), &catalog()).unwrap();
        let with_qty = map(&[("supp:steel REINFORCEMENT", 120.0)]);
        let more_names = vec![
            "Shuttering".to_string(),
            "Steel Reinforcement".to_string(),
            "Scaffolding".to_string(),
        ];
        let outcome =
            reconcile(&mut session, &input(&items, &with_qty, &more_names), &catalog()).unwrap();

        let kinds: Vec<RowType> = outcome.rows.iter().map(|r| r.row_type).collect();
        assert_eq!(
            kinds,
            vec![
                RowType::Base,
                RowType::Base,
                RowType::Heading,
                RowType::Supplemental,
                RowType::Supplemental,
                RowType::Supplemental
            ]
        );
        let steel = &outcome.rows[3];
        assert_eq!(steel.key, "supp:steel reinforcement");
        assert_eq!(steel.description, "Steel reinforcement");
        assert_eq!((steel.rate, steel.unit.as_str()), (85.0, "kg"));
        assert_eq!(steel.executed_qty, 120.0);
        assert_eq!(steel.serial, Some(3));
        assert_eq!(outcome.rows[5].serial, Some(5));

        // Shuttering has a block but no rate; Scaffolding has no block at all.
        assert_eq!(outcome.warnings.len(), 2);
        assert!(outcome.warnings.iter().all(|w| w.kind == WarningKind::MissingCatalogRate));
        assert_eq!(outcome.rows[4].unit, "sqm");
        assert_eq!(outcome.rows[5].rate, 0.0);

        let lines = split_rows(&outcome.rows, "AE", UnmeasuredPolicy::Zero);
        assert_eq!(lines[2].kind, LineKind::Heading);
        assert_eq!(lines[3].more, Some(120.0 * 85.0));
    }

    #[test]
    fn supplemental_quantities_match_any_spelling_of_the_name() {
        let items = two_items();
        let mut session = ReconcileSession::new();
        let empty = ExecutionMap::new();
        let first = vec!["steel reinforcement".to_string()];
        reconcile(&mut session, &input(&items, &empty, &first), &catalog()).unwrap();

        let respelled = vec!["Steel  Reinforcement".to_string()];
        let measured = map(&[("supp:Steel Reinforcement", 12.0)]);
        let outcome =
            reconcile(&mut session, &input(&items, &measured, &respelled), &catalog()).unwrap();
        let supplemental: Vec<&PreviewRow> = outcome
            .rows
            .iter()
            .filter(|r| r.row_type == RowType::Supplemental)
            .collect();
        assert_eq!(supplemental.len(), 1);
        assert_eq!(supplemental[0].executed_qty, 12.0);
        assert!(supplemental[0].executed_entered);

        session.override_executed("SUPP:steel reinforcement", 15.0).unwrap();
        assert_eq!(session.executed().get("supp:steel reinforcement"), Some(15.0));
        assert_eq!(session.rows()[3].executed_qty, 15.0);
    }

    #[test]
    fn invalid_input_leaves_session_untouched() {
        let items = two_items();
        let mut session = ReconcileSession::new();
        let good = map(&[("base:row1", 80.0)]);
        reconcile(&mut session, &input(&items, &good, &[]), &catalog()).unwrap();
        let before = session.clone();

        let negative = map(&[("base:row2", -1.0)]);
        let err = reconcile(&mut session, &input(&items, &negative, &[]), &catalog()).unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));

        let mut bad_premium = input(&items, &good, &[]);
        bad_premium.premium = TenderPremium {
            percent: f64::NAN,
            kind: PremiumKind::Less,
        };
        assert!(reconcile(&mut session, &bad_premium, &catalog()).is_err());
        assert_eq!(session, before);
    }

    #[test]
    fn override_replaces_stored_quantity() {
        let items = two_items();
        let mut session = ReconcileSession::new();
        let measured = map(&[("base:row1", 80.0)]);
        reconcile(&mut session, &input(&items, &measured, &[]), &catalog()).unwrap();
        session.override_executed("base:row1", 90.0).unwrap();
        assert_eq!(session.rows()[0].executed_qty, 90.0);
        let rerun = reconcile(&mut session, &input(&items, &measured, &[]), &catalog()).unwrap();
        assert_eq!(rerun.rows[0].executed_qty, 90.0);
        assert!(session.override_executed("base:row9", 1.0).is_err());
        assert!(session.override_executed(SUPPLEMENTAL_HEADING_KEY, 1.0).is_err());
        assert!(session.override_executed("base:row2", -3.0).is_err());
    }

    #[test]
    fn split_completeness_and_document_wide_excess_labels() {
        let items = vec![
            item("A", 10.0, 2.0),
            item("B", 5.0, 3.0),
            item("C", 8.0, 1.5),
            item("D", 4.0, 10.0),
        ];
        let measured = map(&[
            ("base:row1", 12.5),
            ("base:row2", 5.0),
            ("base:row3", 3.0),
            ("base:row4", 9.0),
        ]);
        let mut session = ReconcileSession::new();
        let outcome = reconcile(&mut session, &input(&items, &measured, &[]), &catalog()).unwrap();
        let lines = split_rows(&outcome.rows, "AE", UnmeasuredPolicy::Zero);

        for row in &outcome.rows {
            let billed: f64 = lines
                .iter()
                .filter(|l| l.key == row.key || l.key == format!("{}:excess", row.key))
                .map(|l| l.executed_qty.unwrap_or(0.0))
                .sum();
            assert!((billed - row.executed_qty).abs() < 1e-9, "{}", row.key);
            let less: f64 = lines.iter().filter(|l| l.key == row.key).filter_map(|l| l.less).sum();
            let shortfall = (row.estimated_qty - row.executed_qty).max(0.0);
            assert!((less - shortfall * row.rate).abs() < 1e-9);
        }

        let labels: Vec<&str> = lines.iter().map(|l| l.label.as_str()).collect();
        assert_eq!(labels, vec!["1", "AE1", "2", "3", "4", "AE2"]);
        assert_eq!(lines[1].more, Some(2.5 * 2.0));
        assert_eq!(lines[5].more, Some(5.0 * 10.0));
        assert_eq!(lines[3].less, Some(5.0 * 1.5));
    }

    #[test]
    fn unmeasured_policy_only_affects_base_rows_without_entries() {
        let items = two_items();
        let mut session = ReconcileSession::new();
        let empty = ExecutionMap::new();
        let names = vec!["Steel reinforcement".to_string()];
        reconcile(&mut session, &input(&items, &empty, &names), &catalog()).unwrap();
        let as_estimated =
            totals(session.rows(), &TenderPremium::default(), UnmeasuredPolicy::AsEstimated);
        assert_eq!(as_estimated.executed_subtotal, 15000.0);
        let zero = totals(session.rows(), &TenderPremium::default(), UnmeasuredPolicy::Zero);
        assert_eq!(zero.executed_subtotal, 0.0);
    }
}
