//! Background job lifecycle: Queued -> Running -> Completed | Failed, with monotonic
//! progress, the current stage name and cooperative cancellation.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, ErrorKind, Result, Warning};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Forward-only transitions. A queued job may fail without running (canceled).
    pub fn can_move_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobKind {
    Workslip,
    BillBatch,
    Estimate,
}

/// Where the finished workbook was stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    pub id: String,
    pub file_name: String,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDetail {
    /// Stage the job was in; `None` when it never started.
    pub step: Option<String>,
    pub cause: String,
    pub kind: ErrorKind,
    pub retryable: bool,
}

/// Receives stage updates from the pipeline and answers cancellation checks.
pub trait ProgressSink: Send + Sync {
    fn stage(&self, step: &str, percent: u8);
    fn is_canceled(&self) -> bool;

    /// `Err(Canceled)` once cancellation was requested; called between stages.
    fn checkpoint(&self) -> Result<()> {
        if self.is_canceled() {
            Err(EngineError::Canceled)
        } else {
            Ok(())
        }
    }
}

/// Sink for synchronous callers that do not track progress.
#[derive(Debug, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn stage(&self, _step: &str, _percent: u8) {}

    fn is_canceled(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
struct JobState {
    status: JobStatus,
    progress: u8,
    step: Option<String>,
    result: Option<ArtifactRef>,
    failure: Option<FailureDetail>,
    warnings: Vec<Warning>,
    updated_at: DateTime<Utc>,
}

/// Serializable status for queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress: u8,
    pub current_step: Option<String>,
    pub result: Option<ArtifactRef>,
    pub error: Option<FailureDetail>,
    pub warnings: Vec<Warning>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct JobHandle {
    id: Uuid,
    kind: JobKind,
    created_at: DateTime<Utc>,
    state: Mutex<JobState>,
    cancel: AtomicBool,
}

impl JobHandle {
    pub fn new(kind: JobKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            created_at: now,
            state: Mutex::new(JobState {
                status: JobStatus::Queued,
                progress: 0,
                step: None,
                result: None,
                failure: None,
                warnings: Vec::new(),
                updated_at: now,
            }),
            cancel: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(state: &mut JobState, next: JobStatus) -> Result<()> {
        if !state.status.can_move_to(next) {
            return Err(EngineError::InvalidTransition {
                from: state.status.to_string(),
                to: next.to_string(),
            });
        }
        state.status = next;
        state.updated_at = Utc::now();
        Ok(())
    }

    pub fn status(&self) -> JobStatus {
        self.lock().status
    }

    pub fn start(&self) -> Result<()> {
        let mut state = self.lock();
        Self::transition(&mut state, JobStatus::Running)?;
        tracing::info!("job {} ({:?}) running", self.id, self.kind);
        Ok(())
    }

    pub fn complete(&self, artifact: ArtifactRef, warnings: Vec<Warning>) -> Result<()> {
        let mut state = self.lock();
        Self::transition(&mut state, JobStatus::Completed)?;
        state.progress = 100;
        state.result = Some(artifact);
        state.warnings = warnings;
        tracing::info!("job {} completed with {} warning(s)", self.id, state.warnings.len());
        Ok(())
    }

    /// Record a failure at the current step. The result stays empty.
    pub fn fail(&self, error: &EngineError) -> Result<()> {
        let mut state = self.lock();
        self.fail_locked(&mut state, error)
    }

    fn fail_locked(&self, state: &mut JobState, error: &EngineError) -> Result<()> {
        Self::transition(state, JobStatus::Failed)?;
        let detail = FailureDetail {
            step: state.step.clone(),
            cause: error.to_string(),
            kind: error.kind(),
            retryable: error.is_retryable(),
        };
        tracing::warn!(
            "job {} failed at {}: {} (retryable: {})",
            self.id,
            detail.step.as_deref().unwrap_or("start"),
            detail.cause,
            detail.retryable
        );
        state.failure = Some(detail);
        Ok(())
    }

    /// Request cancellation. A queued job fails immediately; a running one stops at its
    /// next checkpoint. Status check and transition happen under one lock.
    pub fn cancel(&self) -> Result<()> {
        let mut state = self.lock();
        if state.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                from: state.status.to_string(),
                to: "canceled".to_string(),
            });
        }
        self.cancel.store(true, Ordering::SeqCst);
        if state.status == JobStatus::Queued {
            self.fail_locked(&mut state, &EngineError::Canceled)?;
        }
        Ok(())
    }

    /// Drive `work` through the lifecycle: start, run, then complete or fail.
    pub fn run<F>(&self, work: F) -> Result<ArtifactRef>
    where
        F: FnOnce(&dyn ProgressSink) -> Result<(ArtifactRef, Vec<Warning>)>,
    {
        if let Err(e) = self.start() {
            // canceled while still queued
            return Err(if self.is_canceled() { EngineError::Canceled } else { e });
        }
        let outcome = work(self).and_then(|done| {
            // a cancel that arrived during the last stage still wins
            self.checkpoint()?;
            Ok(done)
        });
        match outcome {
            Ok((artifact, warnings)) => {
                self.complete(artifact.clone(), warnings)?;
                Ok(artifact)
            }
            Err(e) => {
                self.fail(&e)?;
                Err(e)
            }
        }
    }

    pub fn view(&self) -> JobStatusView {
        let state = self.lock().clone();
        JobStatusView {
            id: self.id,
            kind: self.kind,
            status: state.status,
            progress: state.progress,
            current_step: state.step,
            result: state.result,
            error: state.failure,
            warnings: state.warnings,
            created_at: self.created_at,
            updated_at: state.updated_at,
        }
    }
}

impl ProgressSink for JobHandle {
    fn stage(&self, step: &str, percent: u8) {
        let mut state = self.lock();
        if state.status != JobStatus::Running {
            tracing::debug!("job {}: ignoring stage '{}' while {}", self.id, step, state.status);
            return;
        }
        state.progress = state.progress.max(percent.min(100));
        state.step = Some(step.to_string());
        state.updated_at = Utc::now();
        tracing::info!("job {} [{}%] {}", self.id, state.progress, step);
    }

    fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// In-process job table. Scheduling and retries belong to the external queue.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<Uuid, Arc<JobHandle>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, kind: JobKind) -> Arc<JobHandle> {
        let job = Arc::new(JobHandle::new(kind));
        if let Ok(mut jobs) = self.jobs.write() {
            jobs.insert(job.id(), Arc::clone(&job));
        }
        tracing::debug!("job {} ({:?}) queued", job.id(), kind);
        job
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<JobHandle>> {
        self.jobs.read().ok()?.get(id).cloned()
    }

    pub fn get_status(&self, id: &Uuid) -> Option<JobStatusView> {
        self.get(id).map(|job| job.view())
    }

    pub fn cancel(&self, id: &Uuid) -> Result<()> {
        self.get(id)
            .ok_or_else(|| EngineError::NotFound(format!("job {}", id)))?
            .cancel()
    }

    /// Drop finished jobs; returns how many were removed.
    pub fn prune_finished(&self) -> usize {
        let Ok(mut jobs) = self.jobs.write() else {
            return 0;
        };
        let before = jobs.len();
        jobs.retain(|_, job| !job.status().is_terminal());
        before - jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|j| j.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
