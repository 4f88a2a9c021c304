//! Chain state and verification for the audit log

use serde::Serialize;

use crate::entry::AuditEntry;

/// Head of the audit chain: the hash the next entry must link to.
#[derive(Debug, Default)]
pub struct IntegrityChain {
    last_hash: Option<String>,
    entry_count: u64,
}

impl IntegrityChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn previous_hash(&self) -> Option<String> {
        self.last_hash.clone()
    }

    /// Sequence number for the next entry
    pub fn next_sequence(&self) -> u64 {
        self.entry_count
    }

    pub fn update(&mut self, entry: &AuditEntry) {
        self.last_hash = Some(entry.entry_hash.clone());
        self.entry_count += 1;
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn head_hash(&self) -> Option<&String> {
        self.last_hash.as_ref()
    }
}

/// Result of walking a chain of entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub total_entries: usize,
    pub verified_entries: usize,
    /// Index of the first entry that failed verification
    pub first_invalid_index: Option<usize>,
    pub error_message: Option<String>,
}

/// Verify seals, sequence numbers and links of an ordered log.
///
/// Stops at the first broken entry.
pub fn verify_chain(entries: &[AuditEntry]) -> ChainVerification {
    let mut result = ChainVerification {
        valid: true,
        total_entries: entries.len(),
        verified_entries: 0,
        first_invalid_index: None,
        error_message: None,
    };

    for (i, entry) in entries.iter().enumerate() {
        let problem = if entry.sequence != i as u64 {
            Some(format!(
                "entry at position {} carries sequence {}",
                i, entry.sequence
            ))
        } else if !entry.is_sealed() {
            Some(format!("entry {} has invalid hash", entry.sequence))
        } else {
            let expected_prev = if i == 0 {
                None
            } else {
                Some(&entries[i - 1].entry_hash)
            };
            if entry.previous_hash.as_ref() != expected_prev {
                Some(format!(
                    "entry {} has broken chain link (expected prev: {:?}, got: {:?})",
                    entry.sequence, expected_prev, entry.previous_hash
                ))
            } else {
                None
            }
        };

        if let Some(message) = problem {
            result.valid = false;
            result.first_invalid_index = Some(i);
            result.error_message = Some(message);
            return result;
        }
        result.verified_entries = i + 1;
    }

    result
}
