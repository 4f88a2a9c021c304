use serde::{Deserialize, Serialize};

/// Gate decision for an item at a stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum PolicyVerdict {
    Allow,
    /// Fatal for this stage attempt.
    Block(String),
    /// Retry later, without penalty.
    Defer(String),
}

impl PolicyVerdict {
    pub fn block(reason: impl Into<String>) -> Self {
        PolicyVerdict::Block(reason.into())
    }

    pub fn defer(reason: impl Into<String>) -> Self {
        PolicyVerdict::Defer(reason.into())
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, PolicyVerdict::Allow)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            PolicyVerdict::Allow => None,
            PolicyVerdict::Block(r) | PolicyVerdict::Defer(r) => Some(r),
        }
    }
}

impl std::fmt::Display for PolicyVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyVerdict::Allow => write!(f, "allow"),
            PolicyVerdict::Block(r) => write!(f, "block: {}", r),
            PolicyVerdict::Defer(r) => write!(f, "defer: {}", r),
        }
    }
}
