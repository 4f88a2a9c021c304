use serde::{Deserialize, Serialize};

/// Opaque identifier assigned to an item at submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub uuid::Uuid);

impl ItemId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Parse either the bare UUID or the `item:`-prefixed display form.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let raw = s.strip_prefix("item:").unwrap_or(s);
        uuid::Uuid::parse_str(raw).map(Self)
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "item:{}", self.0)
    }
}
