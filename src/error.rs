use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every failure the engine can report. `Display` is the human-readable cause shown to users.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// Header, sheet or catalog sheet could not be discovered after all fallbacks.
    #[error("{0}")]
    NotFound(String),

    /// Caller-supplied parameter rejected before anything was touched.
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    /// Source or catalog could not be read; the external queue may retry.
    #[error("could not read {what}: {reason}")]
    TransientIo { what: String, reason: String },

    /// The document was readable but is not a usable workbook.
    #[error("malformed document: {0}")]
    Malformed(String),

    /// Writing the output workbook failed.
    #[error("could not write output: {0}")]
    Output(String),

    #[error("canceled")]
    Canceled,

    #[error("job cannot move from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// A worker died without reporting an outcome.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn transient(what: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        EngineError::TransientIo {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    /// Only I/O failures are worth another attempt; everything else fails the same way twice.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransientIo { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Validation { .. } => ErrorKind::Validation,
            EngineError::TransientIo { .. } => ErrorKind::TransientIo,
            EngineError::Malformed(_) => ErrorKind::Malformed,
            EngineError::Output(_) => ErrorKind::Output,
            EngineError::Canceled => ErrorKind::Canceled,
            EngineError::InvalidTransition { .. } | EngineError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<rust_xlsxwriter::XlsxError> for EngineError {
    fn from(e: rust_xlsxwriter::XlsxError) -> Self {
        EngineError::Output(e.to_string())
    }
}

/// Serializable error category for status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    NotFound,
    Validation,
    TransientIo,
    Malformed,
    Output,
    Canceled,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WarningKind {
    DuplicateCatalogBlock,
    MissingCatalogRate,
    SkippedRow,
    SkippedSheet,
}

/// Non-fatal data-quality finding, surfaced next to successful output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
