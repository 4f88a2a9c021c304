//! Built-in content rules.
//!
//! Field names may be dotted paths (`bias_analysis.bias_score`) into nested
//! objects.

use std::sync::Arc;

use claimline_types::{Item, PolicyVerdict};
use serde_json::Value;

use crate::error::PolicyError;
use crate::rule::PolicyRule;

fn lookup<'a>(content: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(content, |value, segment| value.get(segment))
}

fn require_field(rule: &str, field: &str) -> Result<(), PolicyError> {
    if field.trim().is_empty() || field.split('.').any(str::is_empty) {
        return Err(PolicyError::invalid(rule, "field path must not be empty"));
    }
    Ok(())
}

/// Blocks content that cites fewer than `min` sources.
///
/// The field may hold an array of sources or a plain count.
#[derive(Debug, Clone)]
pub struct RequireSources {
    field: String,
    min: usize,
}

impl RequireSources {
    pub fn new(field: impl Into<String>, min: usize) -> Result<Self, PolicyError> {
        let field = field.into();
        require_field("require_sources", &field)?;
        if min == 0 {
            return Err(PolicyError::invalid(
                "require_sources",
                "minimum source count must be at least 1",
            ));
        }
        Ok(Self { field, min })
    }
}

impl PolicyRule for RequireSources {
    fn name(&self) -> &str {
        "require_sources"
    }

    fn evaluate(&self, _item: &Item, content: &Value) -> PolicyVerdict {
        let count = match lookup(content, &self.field) {
            Some(Value::Array(sources)) => sources.len(),
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0) as usize,
            _ => return PolicyVerdict::block(format!("no sources in `{}`", self.field)),
        };
        if count < self.min {
            PolicyVerdict::block(format!(
                "{} source(s) cited in `{}`, {} required",
                count, self.field, self.min
            ))
        } else {
            PolicyVerdict::Allow
        }
    }
}

/// Blocks content containing any manipulation marker in any string value.
/// Matching is case-insensitive.
#[derive(Debug, Clone)]
pub struct ForbidMarkers {
    markers: Vec<String>,
}

impl ForbidMarkers {
    pub fn new<I, S>(markers: I) -> Result<Self, PolicyError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let markers: Vec<String> = markers
            .into_iter()
            .map(|m| {
                let marker: String = m.into();
                marker.to_lowercase()
            })
            .filter(|m| !m.trim().is_empty())
            .collect();
        if markers.is_empty() {
            return Err(PolicyError::invalid(
                "forbid_markers",
                "at least one non-empty marker is required",
            ));
        }
        Ok(Self { markers })
    }

    fn find_marker(&self, value: &Value) -> Option<&str> {
        match value {
            Value::String(s) => {
                let lower = s.to_lowercase();
                self.markers
                    .iter()
                    .find(|m| lower.contains(m.as_str()))
                    .map(String::as_str)
            }
            Value::Array(items) => items.iter().find_map(|v| self.find_marker(v)),
            Value::Object(map) => map.values().find_map(|v| self.find_marker(v)),
            _ => None,
        }
    }
}

impl PolicyRule for ForbidMarkers {
    fn name(&self) -> &str {
        "forbid_markers"
    }

    fn evaluate(&self, _item: &Item, content: &Value) -> PolicyVerdict {
        match self.find_marker(content) {
            Some(marker) => PolicyVerdict::block(format!("manipulation marker `{}`", marker)),
            None => PolicyVerdict::Allow,
        }
    }
}

/// Defers while a boolean flag such as `awaiting_confirmation` is `true`.
#[derive(Debug, Clone)]
pub struct AwaitConfirmation {
    field: String,
}

impl AwaitConfirmation {
    pub fn new(field: impl Into<String>) -> Result<Self, PolicyError> {
        let field = field.into();
        require_field("await_confirmation", &field)?;
        Ok(Self { field })
    }
}

impl PolicyRule for AwaitConfirmation {
    fn name(&self) -> &str {
        "await_confirmation"
    }

    fn evaluate(&self, _item: &Item, content: &Value) -> PolicyVerdict {
        match lookup(content, &self.field) {
            Some(Value::Bool(true)) => {
                PolicyVerdict::defer(format!("`{}` pending external confirmation", self.field))
            }
            _ => PolicyVerdict::Allow,
        }
    }
}

/// Blocks when a numeric score is missing or below `min`.
#[derive(Debug, Clone)]
pub struct MinScore {
    field: String,
    min: f64,
}

impl MinScore {
    pub fn new(field: impl Into<String>, min: f64) -> Result<Self, PolicyError> {
        let field = field.into();
        require_field("min_score", &field)?;
        if !min.is_finite() {
            return Err(PolicyError::invalid("min_score", "threshold must be finite"));
        }
        Ok(Self { field, min })
    }
}

impl PolicyRule for MinScore {
    fn name(&self) -> &str {
        "min_score"
    }

    fn evaluate(&self, _item: &Item, content: &Value) -> PolicyVerdict {
        match lookup(content, &self.field).and_then(Value::as_f64) {
            Some(score) if score >= self.min => PolicyVerdict::Allow,
            Some(score) => PolicyVerdict::block(format!(
                "`{}` is {:.2}, below {:.2}",
                self.field, score, self.min
            )),
            None => PolicyVerdict::block(format!("`{}` missing or not numeric", self.field)),
        }
    }
}

type RuleFn = dyn Fn(&Item, &Value) -> PolicyVerdict + Send + Sync;

/// Closure-backed rule for predicates the built-ins don't cover.
#[derive(Clone)]
pub struct FnRule {
    name: String,
    f: Arc<RuleFn>,
}

impl FnRule {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Item, &Value) -> PolicyVerdict + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }

    /// A rule that returns the same verdict for everything.
    pub fn always(name: impl Into<String>, verdict: PolicyVerdict) -> Self {
        Self::new(name, move |_, _| verdict.clone())
    }
}

impl std::fmt::Debug for FnRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnRule").field("name", &self.name).finish()
    }
}

impl PolicyRule for FnRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, item: &Item, content: &Value) -> PolicyVerdict {
        (self.f)(item, content)
    }
}
