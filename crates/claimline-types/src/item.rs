use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fingerprint::{Fingerprint, FingerprintRecord};
use crate::ids::ItemId;

/// Lifecycle position of an item.
///
/// `Pending -> InStage -> .. -> Published` on the happy path. `Blocked` and
/// `Failed` are terminal until an administrative override re-enters the item
/// at its current stage index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InStage,
    Blocked,
    Published,
    Failed,
}

impl ItemStatus {
    /// Whether `advance` can make progress without external intervention.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Blocked | ItemStatus::Published | ItemStatus::Failed
        )
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InStage => "in_stage",
            ItemStatus::Blocked => "blocked",
            ItemStatus::Published => "published",
            ItemStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Ways a fingerprint chain can disagree with its item.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainDefect {
    #[error("chain length {fingerprints} does not match stage index {stage_index}")]
    LengthMismatch {
        stage_index: usize,
        fingerprints: usize,
    },

    #[error("chain position {position} records stage {found}")]
    OutOfSequence { position: usize, found: usize },
}

/// Administrative re-entry of a blocked or failed item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideRecord {
    pub stage_index: usize,
    pub previous_status: ItemStatus,
    pub justification: String,
    pub overridden_at: DateTime<Utc>,
}

/// The unit of work moving through the pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    /// Producer-defined content. The pipeline only serializes it.
    pub payload: serde_json::Value,
    /// Next stage to run; equal to the stage count once published.
    pub stage_index: usize,
    /// Output fingerprint per completed stage, append-only.
    pub fingerprints: Vec<FingerprintRecord>,
    pub status: ItemStatus,
    /// Counted failures keyed by stage index.
    #[serde(default)]
    pub failure_counts: BTreeMap<usize, u32>,
    #[serde(default)]
    pub status_reason: Option<String>,
    #[serde(default)]
    pub overrides: Vec<OverrideRecord>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    pub fn new(payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: ItemId::new(),
            payload,
            stage_index: 0,
            fingerprints: Vec::new(),
            status: ItemStatus::Pending,
            failure_counts: BTreeMap::new(),
            status_reason: None,
            overrides: Vec::new(),
            submitted_at: now,
            updated_at: now,
        }
    }

    /// Check the chain invariant: one record per completed stage, in order.
    pub fn check_chain(&self) -> Result<(), ChainDefect> {
        if self.fingerprints.len() != self.stage_index {
            return Err(ChainDefect::LengthMismatch {
                stage_index: self.stage_index,
                fingerprints: self.fingerprints.len(),
            });
        }
        for (position, record) in self.fingerprints.iter().enumerate() {
            if record.stage_index != position {
                return Err(ChainDefect::OutOfSequence {
                    position,
                    found: record.stage_index,
                });
            }
        }
        Ok(())
    }

    /// Output fingerprint of the most recently completed stage.
    pub fn last_fingerprint(&self) -> Option<Fingerprint> {
        self.fingerprints.last().map(|r| r.hash)
    }

    pub fn failure_count(&self, stage_index: usize) -> u32 {
        self.failure_counts.get(&stage_index).copied().unwrap_or(0)
    }

    /// Increment and return the failure count for a stage.
    pub fn record_failure(&mut self, stage_index: usize) -> u32 {
        let count = self.failure_counts.entry(stage_index).or_insert(0);
        *count += 1;
        *count
    }

    pub fn set_status(&mut self, status: ItemStatus, reason: Option<String>) {
        self.status = status;
        self.status_reason = reason;
        self.updated_at = Utc::now();
    }
}
