use claimline_types::{Item, PolicyVerdict};
use serde_json::Value;

/// A pure predicate over an item and the content being judged.
///
/// `content` is the payload the stage produced, which may differ from
/// `item.payload` while the stage is still uncommitted.
pub trait PolicyRule: Send + Sync {
    /// Rule name, recorded in the decision log.
    fn name(&self) -> &str;

    fn evaluate(&self, item: &Item, content: &Value) -> PolicyVerdict;
}
