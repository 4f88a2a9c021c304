//! Audit entry types

use chrono::{DateTime, Utc};
use claimline_types::{Checkpoint, Fingerprint, ItemId};
use serde::{Deserialize, Serialize};

/// What happened when a fingerprint was offered to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The fingerprint was committed to an empty slot.
    Recorded,
    /// The slot already held `expected`; the offered fingerprint was refused.
    Mismatch { expected: Fingerprint },
}

impl AuditOutcome {
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Self::Mismatch { .. })
    }
}

/// One entry in the tamper-evident audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the log, starting at 0
    pub sequence: u64,

    pub item_id: ItemId,
    pub stage_index: usize,
    pub checkpoint: Checkpoint,

    /// Fingerprint offered for the slot
    pub hash: Fingerprint,

    pub outcome: AuditOutcome,
    pub recorded_at: DateTime<Utc>,

    /// Hash of the previous entry (for chain integrity)
    pub previous_hash: Option<String>,

    /// Hash of this entry
    pub entry_hash: String,
}

impl AuditEntry {
    /// Build an entry and seal it onto the chain.
    pub fn seal(
        sequence: u64,
        item_id: ItemId,
        stage_index: usize,
        checkpoint: Checkpoint,
        hash: Fingerprint,
        outcome: AuditOutcome,
        previous_hash: Option<String>,
    ) -> Self {
        let mut entry = Self {
            sequence,
            item_id,
            stage_index,
            checkpoint,
            hash,
            outcome,
            recorded_at: Utc::now(),
            previous_hash,
            entry_hash: String::new(),
        };
        entry.entry_hash = entry.compute_hash();
        entry
    }

    /// Recompute the hash over every field except `entry_hash`.
    pub fn compute_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.sequence.to_le_bytes());
        hasher.update(self.item_id.0.as_bytes());
        hasher.update(&(self.stage_index as u64).to_le_bytes());
        hasher.update(self.checkpoint.to_string().as_bytes());
        hasher.update(self.hash.as_bytes());
        match &self.outcome {
            AuditOutcome::Recorded => {
                hasher.update(b"recorded");
            }
            AuditOutcome::Mismatch { expected } => {
                hasher.update(b"mismatch");
                hasher.update(expected.as_bytes());
            }
        }
        hasher.update(self.recorded_at.to_rfc3339().as_bytes());
        hasher.update(self.previous_hash.as_deref().unwrap_or("").as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    pub fn is_sealed(&self) -> bool {
        self.compute_hash() == self.entry_hash
    }
}
