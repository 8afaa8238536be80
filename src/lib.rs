//! Spreadsheet engine for construction estimates: finds item tables in loosely laid-out
//! workbooks, reconciles estimated against executed quantities with catalog rates, and
//! writes formula-driven workslip, bill and estimate workbooks from background jobs.

pub mod cache;
pub mod commands;
pub mod config;
pub mod error;
pub mod excel;
pub mod grid;
pub mod job;
pub mod models;
pub mod pipeline;
pub mod services;

pub use config::EngineConfig;
pub use error::{EngineError, Result, Warning, WarningKind};
pub use job::{JobRegistry, JobStatus, JobStatusView};
pub use pipeline::{ArtifactSink, CatalogBytes, CatalogSource, Pipeline};
