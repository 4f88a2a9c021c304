//! The integrity ledger

use std::collections::HashMap;
use std::sync::Arc;

use claimline_types::{Checkpoint, Fingerprint, ItemId};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::entry::{AuditEntry, AuditOutcome};
use crate::error::{LedgerError, Result};
use crate::integrity::{verify_chain, ChainVerification, IntegrityChain};
use crate::journal::AuditJournal;

type Slot = (ItemId, usize, Checkpoint);

/// Result of a successful `record`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The slot was empty and now holds the fingerprint.
    Recorded,
    /// The slot already held this exact fingerprint.
    AlreadyRecorded,
}

#[derive(Default)]
struct LedgerState {
    slots: HashMap<Slot, Fingerprint>,
    entries: Vec<AuditEntry>,
    chain: IntegrityChain,
}

impl LedgerState {
    fn seal(
        &self,
        item_id: ItemId,
        stage_index: usize,
        checkpoint: Checkpoint,
        hash: Fingerprint,
        outcome: AuditOutcome,
    ) -> AuditEntry {
        AuditEntry::seal(
            self.chain.next_sequence(),
            item_id,
            stage_index,
            checkpoint,
            hash,
            outcome,
            self.chain.previous_hash(),
        )
    }

    fn push(&mut self, entry: AuditEntry) {
        self.chain.update(&entry);
        self.entries.push(entry);
    }
}

/// Per-slot fingerprint store with an append-only audit log.
///
/// All state sits behind one short-held mutex. Journal writes happen under
/// it, so the on-disk log only falls behind the in-memory chain when a
/// mismatch entry cannot be journaled.
pub struct IntegrityLedger {
    state: Mutex<LedgerState>,
    journal: Option<Arc<dyn AuditJournal>>,
}

impl IntegrityLedger {
    /// A ledger with no durable journal.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            journal: None,
        }
    }

    /// Open a ledger over a journal, replaying and verifying its entries.
    pub fn open(journal: Arc<dyn AuditJournal>) -> Result<Self> {
        let entries = journal.load()?;
        let verification = verify_chain(&entries);
        if !verification.valid {
            let index = verification.first_invalid_index.unwrap_or(0);
            return Err(LedgerError::ChainBroken {
                sequence: index as u64,
                reason: verification
                    .error_message
                    .unwrap_or_else(|| "unknown defect".to_string()),
            });
        }

        let mut state = LedgerState::default();
        for entry in entries {
            if entry.outcome == AuditOutcome::Recorded {
                state.slots.insert(
                    (entry.item_id, entry.stage_index, entry.checkpoint),
                    entry.hash,
                );
            }
            state.push(entry);
        }
        info!(
            entries = state.entries.len(),
            slots = state.slots.len(),
            "Integrity ledger replayed from journal"
        );

        Ok(Self {
            state: Mutex::new(state),
            journal: Some(journal),
        })
    }

    /// Deterministic fingerprint of a payload.
    pub fn fingerprint(&self, content: &serde_json::Value) -> Result<Fingerprint> {
        Ok(Fingerprint::of_payload(content)?)
    }

    /// Commit a fingerprint to a slot.
    ///
    /// Identical re-records are no-ops and leave no audit entry. A different
    /// fingerprint for an occupied slot is logged as a mismatch and returned
    /// as [`LedgerError::Mismatch`].
    pub fn record(
        &self,
        item_id: ItemId,
        stage_index: usize,
        checkpoint: Checkpoint,
        hash: Fingerprint,
    ) -> Result<RecordOutcome> {
        let mut state = self.state.lock();
        let slot = (item_id, stage_index, checkpoint);

        match state.slots.get(&slot).copied() {
            Some(existing) if existing == hash => Ok(RecordOutcome::AlreadyRecorded),
            Some(expected) => {
                let entry = state.seal(
                    item_id,
                    stage_index,
                    checkpoint,
                    hash,
                    AuditOutcome::Mismatch { expected },
                );
                // Kept in memory even when the journal refuses it. The
                // on-disk chain then has a gap, which the next `open` rejects.
                if let Err(e) = self.append_to_journal(&entry) {
                    error!(
                        item_id = %item_id,
                        sequence = entry.sequence,
                        error = %e,
                        "Failed to journal fingerprint mismatch"
                    );
                }
                state.push(entry);
                warn!(
                    item_id = %item_id,
                    stage_index,
                    checkpoint = %checkpoint,
                    expected = %expected.short(),
                    actual = %hash.short(),
                    "Fingerprint mismatch"
                );
                Err(LedgerError::Mismatch {
                    item_id,
                    stage_index,
                    checkpoint,
                    expected,
                    actual: hash,
                })
            }
            None => {
                let entry = state.seal(
                    item_id,
                    stage_index,
                    checkpoint,
                    hash,
                    AuditOutcome::Recorded,
                );
                self.append_to_journal(&entry)?;
                state.push(entry);
                state.slots.insert(slot, hash);
                debug!(
                    item_id = %item_id,
                    stage_index,
                    checkpoint = %checkpoint,
                    hash = %hash.short(),
                    "Fingerprint recorded"
                );
                Ok(RecordOutcome::Recorded)
            }
        }
    }

    /// Whether the slot holds exactly `hash`. Never mutates.
    pub fn verify(
        &self,
        item_id: ItemId,
        stage_index: usize,
        checkpoint: Checkpoint,
        hash: Fingerprint,
    ) -> bool {
        self.committed(item_id, stage_index, checkpoint) == Some(hash)
    }

    /// Fingerprint committed to a slot, if any.
    pub fn committed(
        &self,
        item_id: ItemId,
        stage_index: usize,
        checkpoint: Checkpoint,
    ) -> Option<Fingerprint> {
        self.state
            .lock()
            .slots
            .get(&(item_id, stage_index, checkpoint))
            .copied()
    }

    /// Snapshot of the whole audit log.
    pub fn audit_log(&self) -> AuditLog {
        AuditLog {
            entries: self.state.lock().entries.clone(),
        }
    }

    /// Audit entries touching one item, in log order.
    pub fn audit_log_for(&self, item_id: ItemId) -> Vec<AuditEntry> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| e.item_id == item_id)
            .cloned()
            .collect()
    }

    /// Re-verify the in-memory audit chain.
    pub fn verify_audit_chain(&self) -> ChainVerification {
        verify_chain(&self.state.lock().entries)
    }

    pub fn entry_count(&self) -> u64 {
        self.state.lock().chain.entry_count()
    }

    fn append_to_journal(&self, entry: &AuditEntry) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.append(entry),
            None => Ok(()),
        }
    }
}

impl Default for IntegrityLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the audit log.
///
/// Iterating it does not consume it, so a reader can walk the same
/// snapshot as many times as it likes.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    entries: Vec<AuditEntry>,
}

impl AuditLog {
    pub fn iter(&self) -> std::slice::Iter<'_, AuditEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries with a sequence number at or after `sequence`.
    pub fn since(&self, sequence: u64) -> &[AuditEntry] {
        let start = self.entries.partition_point(|e| e.sequence < sequence);
        &self.entries[start..]
    }

    pub fn verify(&self) -> ChainVerification {
        verify_chain(&self.entries)
    }

    pub fn into_entries(self) -> Vec<AuditEntry> {
        self.entries
    }
}

impl<'a> IntoIterator for &'a AuditLog {
    type Item = &'a AuditEntry;
    type IntoIter = std::slice::Iter<'a, AuditEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{FileJournal, MemoryJournal};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Journal whose appends start failing once `broken` is set.
    #[derive(Default)]
    struct FlakyJournal {
        inner: MemoryJournal,
        broken: AtomicBool,
    }

    impl AuditJournal for FlakyJournal {
        fn append(&self, entry: &AuditEntry) -> Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into());
            }
            self.inner.append(entry)
        }

        fn load(&self) -> Result<Vec<AuditEntry>> {
            self.inner.load()
        }
    }

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::hash(s.as_bytes())
    }

    #[test]
    fn record_is_idempotent() {
        let ledger = IntegrityLedger::new();
        let item = ItemId::new();
        assert_eq!(
            ledger.record(item, 0, Checkpoint::Input, fp("a")).unwrap(),
            RecordOutcome::Recorded
        );
        assert_eq!(
            ledger.record(item, 0, Checkpoint::Input, fp("a")).unwrap(),
            RecordOutcome::AlreadyRecorded
        );
        assert_eq!(ledger.audit_log().len(), 1);
    }

    #[test]
    fn different_hash_for_same_slot_is_a_mismatch() {
        let ledger = IntegrityLedger::new();
        let item = ItemId::new();
        ledger.record(item, 1, Checkpoint::Output, fp("a")).unwrap();

        let err = ledger
            .record(item, 1, Checkpoint::Output, fp("b"))
            .unwrap_err();
        assert!(err.is_integrity_violation());
        assert!(matches!(err, LedgerError::Mismatch { expected, .. } if expected == fp("a")));

        // The committed value is untouched and the mismatch is on the log.
        assert!(ledger.verify(item, 1, Checkpoint::Output, fp("a")));
        assert!(!ledger.verify(item, 1, Checkpoint::Output, fp("b")));
        let log = ledger.audit_log();
        assert_eq!(log.len(), 2);
        assert!(log.iter().nth(1).unwrap().outcome.is_mismatch());
        assert!(log.verify().valid);
    }

    #[test]
    fn mismatch_stays_on_log_when_journal_fails() {
        let journal = Arc::new(FlakyJournal::default());
        let ledger = IntegrityLedger::open(journal.clone()).unwrap();
        let item = ItemId::new();
        ledger.record(item, 0, Checkpoint::Output, fp("a")).unwrap();

        journal.broken.store(true, Ordering::SeqCst);
        let err = ledger
            .record(item, 0, Checkpoint::Output, fp("b"))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Mismatch { .. }));

        let log = ledger.audit_log();
        assert_eq!(log.len(), 2);
        assert!(log.iter().last().unwrap().outcome.is_mismatch());
        assert!(log.verify().valid);
        assert_eq!(journal.inner.load().unwrap().len(), 1);

        // Later journaled entries link past the missing one, so a reopen
        // refuses the journal instead of silently losing the mismatch.
        journal.broken.store(false, Ordering::SeqCst);
        ledger.record(item, 1, Checkpoint::Input, fp("a")).unwrap();
        assert!(matches!(
            IntegrityLedger::open(journal),
            Err(LedgerError::ChainBroken { .. })
        ));
    }

    #[test]
    fn checkpoints_are_separate_slots() {
        let ledger = IntegrityLedger::new();
        let item = ItemId::new();
        ledger.record(item, 0, Checkpoint::Input, fp("in")).unwrap();
        ledger.record(item, 0, Checkpoint::Output, fp("out")).unwrap();
        assert_eq!(ledger.committed(item, 0, Checkpoint::Input), Some(fp("in")));
        assert_eq!(ledger.committed(item, 0, Checkpoint::Output), Some(fp("out")));
        assert_eq!(ledger.committed(item, 1, Checkpoint::Input), None);
    }

    #[test]
    fn verify_does_not_mutate() {
        let ledger = IntegrityLedger::new();
        let item = ItemId::new();
        assert!(!ledger.verify(item, 0, Checkpoint::Input, fp("a")));
        assert_eq!(ledger.committed(item, 0, Checkpoint::Input), None);
        assert!(ledger.audit_log().is_empty());
    }

    #[test]
    fn audit_log_is_restartable_and_filterable() {
        let ledger = IntegrityLedger::new();
        let a = ItemId::new();
        let b = ItemId::new();
        ledger.record(a, 0, Checkpoint::Input, fp("a0")).unwrap();
        ledger.record(b, 0, Checkpoint::Input, fp("b0")).unwrap();
        ledger.record(a, 0, Checkpoint::Output, fp("a1")).unwrap();

        let log = ledger.audit_log();
        let first: Vec<u64> = log.iter().map(|e| e.sequence).collect();
        let second: Vec<u64> = (&log).into_iter().map(|e| e.sequence).collect();
        assert_eq!(first, vec![0, 1, 2]);
        assert_eq!(first, second);
        assert_eq!(log.since(1).len(), 2);

        let for_a = ledger.audit_log_for(a);
        assert_eq!(for_a.len(), 2);
        assert!(for_a.iter().all(|e| e.item_id == a));
    }

    #[test]
    fn fingerprint_matches_payload_hash() {
        let ledger = IntegrityLedger::new();
        let payload = json!({"headline": "x"});
        assert_eq!(
            ledger.fingerprint(&payload).unwrap(),
            Fingerprint::of_payload(&payload).unwrap()
        );
    }

    #[test]
    fn reopen_replays_slots_and_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let item = ItemId::new();

        {
            let journal = Arc::new(FileJournal::open(&path).unwrap());
            let ledger = IntegrityLedger::open(journal).unwrap();
            ledger.record(item, 0, Checkpoint::Input, fp("a")).unwrap();
            ledger.record(item, 0, Checkpoint::Output, fp("b")).unwrap();
            let _ = ledger.record(item, 0, Checkpoint::Output, fp("c"));
        }

        let journal = Arc::new(FileJournal::open(&path).unwrap());
        let ledger = IntegrityLedger::open(journal).unwrap();
        assert_eq!(ledger.entry_count(), 3);
        assert!(ledger.verify(item, 0, Checkpoint::Output, fp("b")));
        assert!(ledger.verify_audit_chain().valid);

        // New entries continue the replayed chain.
        ledger.record(item, 1, Checkpoint::Input, fp("b")).unwrap();
        let log = ledger.audit_log();
        assert_eq!(log.iter().last().unwrap().sequence, 3);
        assert!(log.verify().valid);
    }

    #[test]
    fn open_rejects_tampered_journal() {
        let journal = Arc::new(MemoryJournal::new());
        {
            let ledger = IntegrityLedger::open(journal.clone()).unwrap();
            let item = ItemId::new();
            ledger.record(item, 0, Checkpoint::Input, fp("a")).unwrap();
            ledger.record(item, 0, Checkpoint::Output, fp("b")).unwrap();
        }
        journal.tamper(|entries| entries[1].hash = fp("forged"));

        let err = IntegrityLedger::open(journal).err().unwrap();
        assert!(matches!(err, LedgerError::ChainBroken { sequence: 1, .. }));
    }
}
