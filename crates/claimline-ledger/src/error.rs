//! Error types for the integrity ledger

use claimline_types::{Checkpoint, Fingerprint, FingerprintError, ItemId};
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    /// A different fingerprint was already committed for this slot.
    #[error(
        "fingerprint mismatch for {item_id} stage {stage_index} ({checkpoint}): \
         committed {expected}, got {actual}"
    )]
    Mismatch {
        item_id: ItemId,
        stage_index: usize,
        checkpoint: Checkpoint,
        expected: Fingerprint,
        actual: Fingerprint,
    },

    #[error("audit chain broken at sequence {sequence}: {reason}")]
    ChainBroken { sequence: u64, reason: String },

    #[error("fingerprint error: {0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    /// Whether this error signals tampering rather than an operational fault.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, Self::Mismatch { .. } | Self::ChainBroken { .. })
    }
}
