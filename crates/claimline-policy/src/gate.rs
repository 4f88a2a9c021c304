//! The policy gate and its decision log

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use claimline_types::{Item, ItemId, PolicyVerdict};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::PolicyError;
use crate::rule::PolicyRule;

pub const DEFAULT_DECISION_LOG_CAPACITY: usize = 1024;

/// Rules attached to one stage, in evaluation order.
#[derive(Clone, Default)]
pub struct StagePolicy {
    pub stage_name: String,
    rules: Vec<Arc<dyn PolicyRule>>,
}

impl StagePolicy {
    pub fn new(stage_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: impl PolicyRule + 'static) -> Self {
        self.rules.push(Arc::new(rule));
        self
    }

    pub fn with_shared_rule(mut self, rule: Arc<dyn PolicyRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl std::fmt::Debug for StagePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagePolicy")
            .field("stage_name", &self.stage_name)
            .field("rules", &self.rule_names())
            .finish()
    }
}

/// One evaluation, as kept in the decision log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyDecision {
    pub item_id: ItemId,
    pub stage_index: usize,
    pub stage_name: String,
    pub verdict: PolicyVerdict,
    /// Rule that produced a non-`Allow` verdict
    pub rule: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Applies gate-wide rules, then stage rules. First non-`Allow` wins.
pub struct PolicyGate {
    global_rules: Vec<Arc<dyn PolicyRule>>,
    decisions: Mutex<VecDeque<PolicyDecision>>,
    capacity: usize,
}

impl PolicyGate {
    pub fn new() -> Self {
        Self {
            global_rules: Vec::new(),
            decisions: Mutex::new(VecDeque::new()),
            capacity: DEFAULT_DECISION_LOG_CAPACITY,
        }
    }

    /// A gate whose decision log keeps at most `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Result<Self, PolicyError> {
        if capacity == 0 {
            return Err(PolicyError::ZeroCapacity);
        }
        Ok(Self {
            capacity,
            ..Self::new()
        })
    }

    /// Add a rule applied at every stage, ahead of stage rules.
    pub fn with_rule(mut self, rule: impl PolicyRule + 'static) -> Self {
        self.global_rules.push(Arc::new(rule));
        self
    }

    pub fn global_rule_names(&self) -> Vec<String> {
        self.global_rules
            .iter()
            .map(|r| r.name().to_string())
            .collect()
    }

    /// Judge `content` for `item` at `stage`.
    pub fn evaluate(&self, item: &Item, stage: &StagePolicy, content: &Value) -> PolicyVerdict {
        let mut deciding_rule = None;
        let mut verdict = PolicyVerdict::Allow;

        for rule in self.global_rules.iter().chain(stage.rules.iter()) {
            let v = rule.evaluate(item, content);
            if !v.is_allow() {
                deciding_rule = Some(rule.name().to_string());
                verdict = v;
                break;
            }
        }

        match &verdict {
            PolicyVerdict::Allow => debug!(
                item_id = %item.id,
                stage = %stage.stage_name,
                "Policy allowed"
            ),
            PolicyVerdict::Block(reason) => warn!(
                item_id = %item.id,
                stage = %stage.stage_name,
                rule = deciding_rule.as_deref().unwrap_or(""),
                reason = %reason,
                "Policy blocked"
            ),
            PolicyVerdict::Defer(reason) => debug!(
                item_id = %item.id,
                stage = %stage.stage_name,
                rule = deciding_rule.as_deref().unwrap_or(""),
                reason = %reason,
                "Policy deferred"
            ),
        }

        self.log(PolicyDecision {
            item_id: item.id,
            stage_index: item.stage_index,
            stage_name: stage.stage_name.clone(),
            verdict: verdict.clone(),
            rule: deciding_rule,
            decided_at: Utc::now(),
        });

        verdict
    }

    fn log(&self, decision: PolicyDecision) {
        let mut decisions = self.decisions.lock();
        if decisions.len() == self.capacity {
            decisions.pop_front();
        }
        decisions.push_back(decision);
    }

    /// Logged decisions, oldest first.
    pub fn decisions(&self) -> Vec<PolicyDecision> {
        self.decisions.lock().iter().cloned().collect()
    }

    pub fn decisions_for(&self, item_id: ItemId) -> Vec<PolicyDecision> {
        self.decisions
            .lock()
            .iter()
            .filter(|d| d.item_id == item_id)
            .cloned()
            .collect()
    }
}

impl Default for PolicyGate {
    fn default() -> Self {
        Self::new()
    }
}
