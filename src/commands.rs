use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorKind, Result, Warning};
use crate::grid::parse_number;
use crate::job::{JobKind, JobRegistry, JobStatusView, NoProgress};
use crate::models::{
    CatalogRef, ExecutionMap, ItemBlock, PremiumKind, PreviewRow, TenderPremium, Totals,
};
use crate::pipeline::{spawn_job, CatalogSource, MemoryArtifactStore, Pipeline, WorkslipRequest};
use crate::services::reconciler::ReconcileSession;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

/// Error shape returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl From<EngineError> for ErrorPayload {
    fn from(e: EngineError) -> Self {
        ErrorPayload {
            kind: e.kind(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

type CommandResult<T> = std::result::Result<T, ErrorPayload>;

#[derive(Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenderPremiumPayload {
    pub percent: Value,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkslipPayload {
    pub file_base64: String,
    #[serde(default)]
    pub catalog: Option<CatalogRef>,
    /// Row key -> executed quantity; numbers or numeric strings.
    #[serde(default)]
    pub execution_map: IndexMap<String, Value>,
    #[serde(default)]
    pub supplemental_items: Vec<String>,
    #[serde(default)]
    pub tender_premium: Option<TenderPremiumPayload>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillBatchPayload {
    pub file_base64: String,
    #[serde(default)]
    pub tender_premium: Option<TenderPremiumPayload>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverridePayload {
    pub key: String,
    pub quantity: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResponse {
    pub rows: Vec<PreviewRow>,
    pub totals: Totals,
    pub warnings: Vec<Warning>,
    /// Hand back on the next request.
    pub session: ReconcileSession,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStarted {
    pub job_id: Uuid,
}

/// Shared engine state behind the command surface.
pub struct EngineState {
    pub pipeline: Pipeline,
    pub registry: Arc<JobRegistry>,
    pub artifacts: Arc<MemoryArtifactStore>,
}

impl EngineState {
    pub fn new(config: EngineConfig, catalogs: Arc<dyn CatalogSource>) -> Self {
        let artifacts = Arc::new(MemoryArtifactStore::new());
        EngineState {
            pipeline: Pipeline::new(config, catalogs, artifacts.clone()),
            registry: Arc::new(JobRegistry::new()),
            artifacts,
        }
    }
}

fn decode_file(field: &str, content: &str) -> Result<Vec<u8>> {
    let bytes = BASE64
        .decode(content.trim())
        .map_err(|e| EngineError::validation(field, format!("invalid base64: {}", e)))?;
    if bytes.is_empty() {
        return Err(EngineError::validation(field, "file is empty"));
    }
    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(EngineError::validation(field, "file too large (max 100MB)"));
    }
    Ok(bytes)
}

fn quantity_from(field: &str, value: &Value) -> Result<f64> {
    let qty = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_number(s),
        Value::Null => Some(0.0),
        _ => None,
    }
    .ok_or_else(|| EngineError::validation(field, "must be a number"))?;
    if !qty.is_finite() || qty < 0.0 {
        return Err(EngineError::validation(field, "must be >= 0"));
    }
    Ok(qty)
}

pub fn execution_map_from(raw: &IndexMap<String, Value>) -> Result<ExecutionMap> {
    let mut map = ExecutionMap::new();
    for (key, value) in raw {
        let key = key.trim();
        if key.is_empty() {
            return Err(EngineError::validation("executionMap", "empty row key"));
        }
        map.insert(key, quantity_from(&format!("executionMap[{}]", key), value)?);
    }
    Ok(map)
}

pub fn tender_premium_from(raw: Option<&TenderPremiumPayload>) -> Result<TenderPremium> {
    let Some(raw) = raw else {
        return Ok(TenderPremium::default());
    };
    let percent = quantity_from("tenderPremium.percent", &raw.percent)?;
    let kind = match raw.kind.as_deref().map(|k| k.trim().to_lowercase()) {
        None => PremiumKind::Excess,
        Some(k) if k == "excess" || k.is_empty() => PremiumKind::Excess,
        Some(k) if k == "less" => PremiumKind::Less,
        Some(other) => {
            return Err(EngineError::validation(
                "tenderPremium.type",
                format!("expected 'Excess' or 'Less', got '{}'", other),
            ))
        }
    };
    Ok(TenderPremium { percent, kind })
}

/// Validate the whole payload before any work starts.
pub fn workslip_request_from(payload: &WorkslipPayload) -> Result<WorkslipRequest> {
    let supplemental: Vec<String> = payload
        .supplemental_items
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if !supplemental.is_empty() && payload.catalog.is_none() {
        return Err(EngineError::validation(
            "catalog",
            "required when supplemental items are given",
        ));
    }
    Ok(WorkslipRequest {
        source: decode_file("fileBase64", &payload.file_base64)?,
        catalog: payload.catalog.clone(),
        execution: execution_map_from(&payload.execution_map)?,
        supplemental,
        premium: tender_premium_from(payload.tender_premium.as_ref())?,
    })
}

fn parse_job_id(job_id: &str) -> Result<Uuid> {
    Uuid::parse_str(job_id.trim()).map_err(|e| EngineError::validation("jobId", e.to_string()))
}

/// Quick upload check: size and xlsx (zip) signature.
pub fn validate_workbook(file_base64: String) -> ValidationResult {
    match decode_file("fileBase64", &file_base64) {
        Err(e) => ValidationResult {
            valid: false,
            error: Some(e.to_string()),
        },
        Ok(bytes) if !bytes.starts_with(&[0x50, 0x4B, 0x03, 0x04]) => ValidationResult {
            valid: false,
            error: Some("Not a valid Excel file (.xlsx).".to_string()),
        },
        Ok(_) => ValidationResult {
            valid: true,
            error: None,
        },
    }
}

/// Synchronous preview of the reconciled rows. `session` is whatever the previous call
/// returned (or a fresh default).
pub fn preview_workslip(
    state: &EngineState,
    payload: WorkslipPayload,
    mut session: ReconcileSession,
) -> CommandResult<PreviewResponse> {
    let request = workslip_request_from(&payload)?;
    let outcome = state.pipeline.preview(&request, &mut session, &NoProgress)?;
    Ok(PreviewResponse {
        rows: outcome.rows,
        totals: outcome.totals,
        warnings: outcome.warnings,
        session,
    })
}

/// Replace one stored executed quantity.
pub fn override_executed(
    mut session: ReconcileSession,
    payload: OverridePayload,
) -> CommandResult<ReconcileSession> {
    let field = format!("executed[{}]", payload.key);
    let qty = quantity_from(&field, &payload.quantity)?;
    session.override_executed(payload.key.trim(), qty)?;
    Ok(session)
}

pub fn start_workslip_job(
    state: &EngineState,
    payload: WorkslipPayload,
    session: ReconcileSession,
) -> CommandResult<JobStarted> {
    let request = workslip_request_from(&payload)?;
    let pipeline = state.pipeline.clone();
    let (job, _worker) = spawn_job(&state.registry, JobKind::Workslip, move |sink| {
        let mut session = session;
        pipeline.run_workslip(&request, &mut session, sink)
    });
    Ok(JobStarted { job_id: job.id() })
}

pub fn start_bill_batch_job(
    state: &EngineState,
    payload: BillBatchPayload,
) -> CommandResult<JobStarted> {
    let source = decode_file("fileBase64", &payload.file_base64)?;
    let premium = tender_premium_from(payload.tender_premium.as_ref())?;
    let pipeline = state.pipeline.clone();
    let (job, _worker) = spawn_job(&state.registry, JobKind::BillBatch, move |sink| {
        pipeline.run_bill_batch(&source, &premium, sink)
    });
    Ok(JobStarted { job_id: job.id() })
}

pub fn start_estimate_job(
    state: &EngineState,
    payload: BillBatchPayload,
) -> CommandResult<JobStarted> {
    let source = decode_file("fileBase64", &payload.file_base64)?;
    let premium = tender_premium_from(payload.tender_premium.as_ref())?;
    let pipeline = state.pipeline.clone();
    let (job, _worker) = spawn_job(&state.registry, JobKind::Estimate, move |sink| {
        pipeline.run_estimate(&source, &premium, sink)
    });
    Ok(JobStarted { job_id: job.id() })
}

pub fn get_job_status(state: &EngineState, job_id: String) -> CommandResult<JobStatusView> {
    let id = parse_job_id(&job_id)?;
    state
        .registry
        .get_status(&id)
        .ok_or_else(|| EngineError::NotFound(format!("job {}", id)).into())
}

pub fn cancel_job(state: &EngineState, job_id: String) -> CommandResult<()> {
    let id = parse_job_id(&job_id)?;
    state.registry.cancel(&id)?;
    Ok(())
}

/// Finished workbook as base64.
pub fn read_artifact_base64(state: &EngineState, artifact_id: String) -> CommandResult<String> {
    let bytes = state
        .artifacts
        .get(artifact_id.trim())
        .ok_or_else(|| EngineError::NotFound(format!("artifact {}", artifact_id)))?;
    Ok(BASE64.encode(&bytes))
}

/// Catalog blocks for the supplemental-item picker.
pub fn list_catalog_items(
    state: &EngineState,
    catalog: CatalogRef,
) -> CommandResult<Vec<ItemBlock>> {
    let index = state.pipeline.load_catalog(&catalog)?;
    Ok(index.blocks().cloned().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn execution_map_accepts_numbers_and_numeric_strings() {
        let payload: WorkslipPayload = serde_json::from_value(json!({
            "fileBase64": BASE64.encode(b"PK\x03\x04rest"),
            "executionMap": {"base:row1": 80, "base:row2": "1,250.5", "supp:Steel": null},
            "tenderPremium": {"percent": 10, "type": "Less"}
        }))
        .unwrap();
        let request = workslip_request_from(&payload).unwrap();
        assert_eq!(request.execution.get("base:row1"), Some(80.0));
        assert_eq!(request.execution.get("base:row2"), Some(1250.5));
        assert_eq!(request.execution.get("supp:Steel"), Some(0.0));
        assert_eq!(request.premium.kind, PremiumKind::Less);
        assert_eq!(request.premium.percent, 10.0);
    }

    #[test]
    fn bad_values_are_validation_errors_naming_the_field() {
        let raw: IndexMap<String, Value> =
            serde_json::from_value(json!({"base:row3": -2})).unwrap();
        let err = execution_map_from(&raw).unwrap_err();
        assert_eq!(err.to_string(), "invalid executionMap[base:row3]: must be >= 0");

        let raw: IndexMap<String, Value> =
            serde_json::from_value(json!({"base:row1": "lots"})).unwrap();
        assert!(execution_map_from(&raw).is_err());

        let premium = TenderPremiumPayload {
            percent: json!(5),
            kind: Some("Bonus".to_string()),
        };
        let err = tender_premium_from(Some(&premium)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation { ref field, .. } if field == "tenderPremium.type"
        ));
        assert_eq!(tender_premium_from(None).unwrap(), TenderPremium::default());
    }

    #[test]
    fn supplemental_items_need_a_catalog() {
        let payload: WorkslipPayload = serde_json::from_value(json!({
            "fileBase64": BASE64.encode(b"PK\x03\x04"),
            "supplementalItems": ["Steel"]
        }))
        .unwrap();
        let err: ErrorPayload = workslip_request_from(&payload).unwrap_err().into();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(!err.retryable);
    }

    #[test]
    fn upload_validation() {
        assert!(validate_workbook(BASE64.encode(b"PK\x03\x04data")).valid);
        let not_zip = validate_workbook(BASE64.encode(b"%PDF-1.7"));
        assert!(!not_zip.valid);
        assert!(!validate_workbook("***".to_string()).valid);
        assert!(!validate_workbook(String::new()).valid);
    }

    #[test]
    fn override_rejects_unknown_keys() {
        let session = ReconcileSession::new();
        let payload = OverridePayload {
            key: "base:row1".to_string(),
            quantity: json!(3),
        };
        let err = override_executed(session, payload).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn unknown_jobs_are_not_found() {
        let state = EngineState::new(
            EngineConfig::default(),
            Arc::new(crate::pipeline::MemoryCatalogSource::new()),
        );
        let err = get_job_status(&state, Uuid::new_v4().to_string()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        let err = cancel_job(&state, "not-a-uuid".to_string()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }
}
