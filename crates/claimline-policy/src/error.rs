use thiserror::Error;

/// Errors raised while configuring policy rules
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("invalid rule {rule}: {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("decision log capacity must be at least 1")]
    ZeroCapacity,
}

impl PolicyError {
    pub(crate) fn invalid(rule: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRule {
            rule: rule.to_string(),
            reason: reason.into(),
        }
    }
}
