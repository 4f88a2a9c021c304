//! Content-integrity ledger for the Claimline pipeline.
//!
//! The ledger stores one fingerprint per `(item, stage, checkpoint)` slot.
//! Recording the same fingerprint twice is a no-op. Recording a different
//! one is a hard error: the content changed after it was committed.
//!
//! Every record and every mismatch is appended to a hash-chained audit log.
//! Each entry carries the hash of its predecessor, so deleting, reordering or
//! editing entries breaks the chain and is caught by [`verify_chain`].
//!
//! ```
//! use claimline_ledger::IntegrityLedger;
//! use claimline_types::{Checkpoint, ItemId};
//!
//! let ledger = IntegrityLedger::new();
//! let item = ItemId::new();
//! let hash = ledger.fingerprint(&serde_json::json!({"claim": "x"})).unwrap();
//!
//! ledger.record(item, 0, Checkpoint::Input, hash).unwrap();
//! assert!(ledger.verify(item, 0, Checkpoint::Input, hash));
//! assert_eq!(ledger.audit_log().len(), 1);
//! ```

pub mod entry;
pub mod error;
pub mod integrity;
pub mod journal;
pub mod ledger;

pub use entry::{AuditEntry, AuditOutcome};
pub use error::{LedgerError, Result};
pub use integrity::{verify_chain, ChainVerification, IntegrityChain};
pub use journal::{AuditJournal, FileJournal, MemoryJournal};
pub use ledger::{AuditLog, IntegrityLedger, RecordOutcome};
