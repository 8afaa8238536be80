//! Stage driver: bytes in, reconciled workbook out, reporting each stage to a
//! [`ProgressSink`] and checking for cancellation in between.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use uuid::Uuid;

use crate::cache::catalog_cache::CatalogCache;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result, Warning};
use crate::excel::{read_grid, write_grid};
use crate::grid::DocumentGrid;
use crate::job::{ArtifactRef, JobHandle, JobKind, JobRegistry, ProgressSink};
use crate::models::{CatalogRef, EstimateItem, ExecutionMap, TenderPremium};
use crate::services::bill_batch::{process_all, BatchContext};
use crate::services::catalog_indexer::{index_catalog, CatalogIndex};
use crate::services::header_locator::{locate_with_fallback, LocateOptions, ESTIMATE_COLUMNS};
use crate::services::item_parser::parse_items;
use crate::services::output_composer::{compose_bills, compose_estimate, compose_workslip};
use crate::services::reconciler::{reconcile, ReconcileInput, ReconcileOutcome, ReconcileSession};

pub const STAGE_LOAD_SOURCE: &str = "Loading source document";
pub const STAGE_LOAD_CATALOG: &str = "Loading catalog";
pub const STAGE_LOCATE_HEADER: &str = "Locating header";
pub const STAGE_PARSE_ITEMS: &str = "Parsing items";
pub const STAGE_RECONCILE: &str = "Reconciling quantities";
pub const STAGE_COMPOSE: &str = "Composing output";
pub const STAGE_STORE: &str = "Storing output";

/// Catalog workbook bytes and the version they belong to, read together.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogBytes {
    pub version: String,
    pub bytes: Vec<u8>,
}

/// Resolves a catalog reference to workbook bytes. `version` must change whenever the
/// bytes do; it keys the snapshot cache.
pub trait CatalogSource: Send + Sync {
    fn version(&self, catalog: &CatalogRef) -> Result<String>;
    fn fetch(&self, catalog: &CatalogRef) -> Result<CatalogBytes>;
}

/// Receives finished output. Only called once the whole workbook exists.
pub trait ArtifactSink: Send + Sync {
    fn store(&self, file_name: &str, bytes: Vec<u8>) -> Result<ArtifactRef>;
}

#[derive(Debug, Default)]
pub struct MemoryCatalogSource {
    catalogs: RwLock<HashMap<CatalogRef, (String, Vec<u8>)>>,
    revision: AtomicU64,
}

impl MemoryCatalogSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, catalog: CatalogRef, bytes: Vec<u8>) {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut catalogs) = self.catalogs.write() {
            catalogs.insert(catalog, (format!("r{}", revision), bytes));
        }
    }

    fn with_entry<T>(
        &self,
        catalog: &CatalogRef,
        f: impl FnOnce(&(String, Vec<u8>)) -> T,
    ) -> Result<T> {
        let catalogs = self
            .catalogs
            .read()
            .map_err(|e| EngineError::transient(format!("catalog {}", catalog), e))?;
        catalogs
            .get(catalog)
            .map(f)
            .ok_or_else(|| EngineError::NotFound(format!("catalog {} is not available", catalog)))
    }
}

impl CatalogSource for MemoryCatalogSource {
    fn version(&self, catalog: &CatalogRef) -> Result<String> {
        self.with_entry(catalog, |(version, _)| version.clone())
    }

    fn fetch(&self, catalog: &CatalogRef) -> Result<CatalogBytes> {
        self.with_entry(catalog, |(version, bytes)| CatalogBytes {
            version: version.clone(),
            bytes: bytes.clone(),
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    artifacts: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Vec<u8>> {
        self.artifacts.read().ok()?.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.artifacts.read().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactSink for MemoryArtifactStore {
    fn store(&self, file_name: &str, bytes: Vec<u8>) -> Result<ArtifactRef> {
        let artifact = ArtifactRef {
            id: Uuid::new_v4().to_string(),
            file_name: file_name.to_string(),
            size: bytes.len(),
        };
        let mut artifacts = self
            .artifacts
            .write()
            .map_err(|e| EngineError::transient("artifact store", e))?;
        artifacts.insert(artifact.id.clone(), bytes);
        Ok(artifact)
    }
}

/// Everything a workslip run needs besides the caller's session.
#[derive(Debug, Clone, Default)]
pub struct WorkslipRequest {
    pub source: Vec<u8>,
    pub catalog: Option<CatalogRef>,
    pub execution: ExecutionMap,
    pub supplemental: Vec<String>,
    pub premium: TenderPremium,
}

#[derive(Debug, Clone)]
pub struct EstimateSnapshot {
    pub grid: DocumentGrid,
    pub items: Vec<EstimateItem>,
    pub warnings: Vec<Warning>,
}

#[derive(Clone)]
pub struct Pipeline {
    config: Arc<EngineConfig>,
    catalogs: Arc<dyn CatalogSource>,
    artifacts: Arc<dyn ArtifactSink>,
    cache: CatalogCache,
}

impl Pipeline {
    pub fn new(
        config: EngineConfig,
        catalogs: Arc<dyn CatalogSource>,
        artifacts: Arc<dyn ArtifactSink>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            catalogs,
            artifacts,
            cache: CatalogCache::new(),
        }
    }

    /// Share a cache (e.g. [`CatalogCache::global`]) between pipelines with the same
    /// catalog settings.
    pub fn with_cache(mut self, cache: CatalogCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Indexed catalog snapshot; rebuilt only when the source reports a new version.
    /// The index is cached under the version fetched with its bytes.
    pub fn load_catalog(&self, catalog: &CatalogRef) -> Result<Arc<CatalogIndex>> {
        let version = self.catalogs.version(catalog)?;
        if let Some(hit) = self.cache.get(catalog, &version) {
            tracing::debug!("catalog {} ({}) served from cache", catalog, version);
            return Ok(hit);
        }
        let fetched = self.catalogs.fetch(catalog)?;
        if fetched.version != version {
            tracing::debug!(
                "catalog {} moved from {} to {} while loading",
                catalog,
                version,
                fetched.version
            );
            if let Some(hit) = self.cache.get(catalog, &fetched.version) {
                return Ok(hit);
            }
        }
        let grid = read_grid(&fetched.bytes, &format!("catalog {}", catalog))?;
        let index = index_catalog(&grid, &self.config.catalog)?;
        tracing::info!(
            "catalog {} ({}): {} block(s) indexed",
            catalog,
            fetched.version,
            index.len()
        );
        Ok(self.cache.insert(catalog.clone(), &fetched.version, index))
    }

    fn load_optional_catalog(
        &self,
        catalog: Option<&CatalogRef>,
    ) -> Result<(Arc<CatalogIndex>, Vec<Warning>)> {
        match catalog {
            Some(catalog) => {
                let index = self.load_catalog(catalog)?;
                let warnings = index.warnings();
                Ok((index, warnings))
            }
            None => Ok((Arc::new(CatalogIndex::default()), Vec::new())),
        }
    }

    /// Read an estimate workbook, locate its header and parse its items.
    pub fn load_estimate(
        &self,
        source: &[u8],
        sink: &dyn ProgressSink,
    ) -> Result<EstimateSnapshot> {
        sink.stage(STAGE_LOAD_SOURCE, 5);
        let grid = read_grid(source, "source document")?;
        sink.checkpoint()?;

        sink.stage(STAGE_LOCATE_HEADER, 35);
        let options = LocateOptions::from(&self.config.header);
        let header = locate_with_fallback(&grid, ESTIMATE_COLUMNS, &options).ok_or_else(|| {
            EngineError::NotFound(format!(
                "no header row with a description and quantity or rate column \
                 in the first {} rows of any sheet",
                options.search_window
            ))
        })?;
        sink.checkpoint()?;

        sink.stage(STAGE_PARSE_ITEMS, 50);
        let sheet = grid
            .sheet_at(header.sheet_index)
            .ok_or_else(|| {
                EngineError::Malformed(format!("sheet '{}' disappeared", header.sheet_name))
            })?;
        let parsed = parse_items(sheet, &header)?;
        if parsed.items.is_empty() {
            return Err(EngineError::NotFound(format!(
                "no items below the header on sheet '{}' row {}",
                header.sheet_name,
                header.row + 1
            )));
        }
        tracing::info!("'{}': {} item(s) parsed", header.sheet_name, parsed.items.len());
        sink.checkpoint()?;
        Ok(EstimateSnapshot {
            grid,
            items: parsed.items,
            warnings: parsed.warnings,
        })
    }

    /// Reconcile without producing output; drives the preview screen.
    pub fn preview(
        &self,
        request: &WorkslipRequest,
        session: &mut ReconcileSession,
        sink: &dyn ProgressSink,
    ) -> Result<ReconcileOutcome> {
        let estimate = self.load_estimate(&request.source, sink)?;
        sink.stage(STAGE_LOAD_CATALOG, 55);
        let (catalog, catalog_warnings) = self.load_optional_catalog(request.catalog.as_ref())?;
        sink.checkpoint()?;

        sink.stage(STAGE_RECONCILE, 65);
        let input = ReconcileInput {
            base_items: &estimate.items,
            execution: &request.execution,
            supplemental: &request.supplemental,
            premium: request.premium,
        };
        let mut outcome = reconcile(session, &input, &catalog)?;
        let mut warnings = estimate.warnings;
        warnings.extend(catalog_warnings);
        warnings.append(&mut outcome.warnings);
        outcome.warnings = warnings;
        Ok(outcome)
    }

    fn store(
        &self,
        sink: &dyn ProgressSink,
        file_name: &str,
        grid: &DocumentGrid,
    ) -> Result<ArtifactRef> {
        let bytes = write_grid(grid)?;
        sink.checkpoint()?;
        sink.stage(STAGE_STORE, 95);
        let artifact = self.artifacts.store(file_name, bytes)?;
        tracing::info!(
            "stored {} ({} bytes) as {}",
            artifact.file_name,
            artifact.size,
            artifact.id
        );
        Ok(artifact)
    }

    /// Full workslip run: preview stages, then compose and store the workbook.
    pub fn run_workslip(
        &self,
        request: &WorkslipRequest,
        session: &mut ReconcileSession,
        sink: &dyn ProgressSink,
    ) -> Result<(ArtifactRef, Vec<Warning>)> {
        let outcome = self.preview(request, session, sink)?;
        sink.checkpoint()?;
        sink.stage(STAGE_COMPOSE, 80);
        let grid = compose_workslip(session.rows(), &session.premium(), &self.config.output)?;
        let artifact = self.store(sink, "workslip.xlsx", &grid)?;
        Ok((artifact, outcome.warnings))
    }

    /// Multi-period bills: one output sheet per detected input sheet.
    pub fn run_bill_batch(
        &self,
        source: &[u8],
        premium: &TenderPremium,
        sink: &dyn ProgressSink,
    ) -> Result<(ArtifactRef, Vec<Warning>)> {
        if !premium.percent.is_finite() || premium.percent < 0.0 {
            return Err(EngineError::validation("tenderPremium.percent", "must be a number >= 0"));
        }
        sink.stage(STAGE_LOAD_SOURCE, 5);
        let grid = read_grid(source, "source document")?;
        sink.checkpoint()?;

        sink.stage(STAGE_LOCATE_HEADER, 35);
        let canceled = || sink.is_canceled();
        let ctx = BatchContext::new(&self.config).with_cancel(&canceled);
        let batch = process_all(&grid, &ctx)?;
        sink.stage(STAGE_RECONCILE, 65);
        sink.checkpoint()?;

        sink.stage(STAGE_COMPOSE, 80);
        let output = compose_bills(&batch.descriptors, premium, &self.config.output)?;
        let artifact = self.store(sink, "bills.xlsx", &output)?;
        Ok((artifact, batch.warnings))
    }

    /// The estimate deliverable, rebuilt from the parsed estimate.
    pub fn run_estimate(
        &self,
        source: &[u8],
        premium: &TenderPremium,
        sink: &dyn ProgressSink,
    ) -> Result<(ArtifactRef, Vec<Warning>)> {
        let request = WorkslipRequest {
            source: source.to_vec(),
            premium: *premium,
            ..WorkslipRequest::default()
        };
        let mut session = ReconcileSession::new();
        let outcome = self.preview(&request, &mut session, sink)?;
        sink.stage(STAGE_COMPOSE, 80);
        let grid = compose_estimate(session.rows(), premium, &self.config.output)?;
        let artifact = self.store(sink, "estimate.xlsx", &grid)?;
        Ok((artifact, outcome.warnings))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Enqueue a job and run `work` on its own worker thread. A panicking worker still
/// leaves the job in a terminal state.
pub fn spawn_job<F>(
    registry: &JobRegistry,
    kind: JobKind,
    work: F,
) -> (Arc<JobHandle>, thread::JoinHandle<Result<ArtifactRef>>)
where
    F: FnOnce(&dyn ProgressSink) -> Result<(ArtifactRef, Vec<Warning>)> + Send + 'static,
{
    let job = registry.enqueue(kind);
    let worker = Arc::clone(&job);
    let handle = thread::spawn(move || {
        match panic::catch_unwind(AssertUnwindSafe(|| worker.run(work))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!("job {} worker panicked: {}", worker.id(), message);
                let error = EngineError::Internal(format!("worker panicked: {}", message));
                if let Err(e) = worker.fail(&error) {
                    tracing::warn!("job {}: {}", worker.id(), e);
                }
                Err(error)
            }
        }
    });
    (job, handle)
}
