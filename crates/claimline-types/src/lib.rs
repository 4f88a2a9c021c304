//! Core type definitions for the Claimline verification pipeline.
//!
//! This crate provides the shared data model. No business logic, just types
//! and the invariants that belong to them. Every Claimline crate depends on it.
//!
//! ## Item invariant
//!
//! For any item that is not `Failed`, `fingerprints.len() == stage_index` and
//! the recorded stage indices run `0, 1, .., stage_index - 1` without gaps.
//! A persisted item violating this was forged or corrupted and must be
//! treated as `Failed` when loaded.

pub mod fingerprint;
pub mod ids;
pub mod item;
pub mod verdict;

pub use fingerprint::{Checkpoint, Fingerprint, FingerprintError, FingerprintRecord};
pub use ids::ItemId;
pub use item::{ChainDefect, Item, ItemStatus, OverrideRecord};
pub use verdict::PolicyVerdict;
