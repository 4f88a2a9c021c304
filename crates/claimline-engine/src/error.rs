//! Error taxonomy for the pipeline engine

use std::path::PathBuf;

use claimline_ledger::LedgerError;
use claimline_types::ItemId;
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Typed outcome of a failed engine call.
///
/// Callers use [`PipelineError::is_retryable`] to tell "try again" apart
/// from "stop and escalate to a human".
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Content changed after it was committed. The item is `Failed`.
    #[error("integrity violation on {item_id} at stage {stage}: {detail}")]
    IntegrityViolation {
        item_id: ItemId,
        stage: String,
        detail: String,
    },

    /// Terminal until an administrative override.
    #[error("{item_id} blocked at stage {stage}: {reason}")]
    PolicyBlocked {
        item_id: ItemId,
        stage: String,
        reason: String,
    },

    /// Retry later; the failure counter was not touched.
    #[error("{item_id} deferred at stage {stage}: {reason}")]
    PolicyDeferred {
        item_id: ItemId,
        stage: String,
        reason: String,
    },

    #[error("stage {stage} failed for {item_id} (attempt {attempt} of {allowed}): {message}")]
    TransformationError {
        item_id: ItemId,
        stage: String,
        attempt: u32,
        allowed: u32,
        message: String,
    },

    /// The item used up its retries on a stage and is now `Failed`.
    #[error("{item_id} exhausted {attempts} attempts at stage {stage}")]
    RetriesExhausted {
        item_id: ItemId,
        stage: String,
        attempts: u32,
    },

    #[error("engine frozen: {reason}")]
    EngineFrozen { reason: String },

    #[error("item not found: {0}")]
    ItemNotFound(ItemId),

    #[error("item {0} is already being advanced")]
    ItemBusy(ItemId),

    #[error("{item_id} has failed: {reason}")]
    ItemFailed { item_id: ItemId, reason: String },

    #[error("cannot override {item_id}: {reason}")]
    InvalidOverride { item_id: ItemId, reason: String },

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    /// Whether the same call may succeed if simply repeated later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PolicyDeferred { .. } | Self::TransformationError { .. } | Self::ItemBusy(_)
        )
    }

    /// Whether a human has to act before the item can move again.
    pub fn needs_escalation(&self) -> bool {
        matches!(
            self,
            Self::IntegrityViolation { .. }
                | Self::PolicyBlocked { .. }
                | Self::RetriesExhausted { .. }
                | Self::EngineFrozen { .. }
                | Self::ItemFailed { .. }
        )
    }
}

/// Errors from item and control persistence
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors from administrative supervisor operations
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("engine is not frozen")]
    NotFrozen,

    #[error("{0} must not be empty")]
    EmptyText(&'static str),

    #[error("failed to persist control state: {0}")]
    Store(#[from] StoreError),
}
