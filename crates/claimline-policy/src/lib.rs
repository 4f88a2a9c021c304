//! Policy gate for the Claimline pipeline.
//!
//! A [`PolicyGate`] evaluates an item's content against an ordered list of
//! pure [`PolicyRule`]s: gate-wide rules first, then the rules attached to the
//! stage being run. The first rule that does not return `Allow` decides.
//!
//! Rules see only `(item, content)`. They must not perform I/O or depend on
//! anything but their inputs, so the same evaluation always yields the same
//! verdict.

pub mod error;
pub mod gate;
pub mod rule;
pub mod rules;

pub use error::PolicyError;
pub use gate::{PolicyDecision, PolicyGate, StagePolicy, DEFAULT_DECISION_LOG_CAPACITY};
pub use rule::PolicyRule;
pub use rules::{AwaitConfirmation, FnRule, ForbidMarkers, MinScore, RequireSources};
