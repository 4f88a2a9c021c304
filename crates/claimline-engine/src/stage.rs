//! Static stage definitions

use std::sync::Arc;
use std::time::Duration;

use claimline_policy::{PolicyRule, StagePolicy};

use crate::config::EngineConfig;
use crate::error::{PipelineError, Result};
use crate::transform::Transform;

/// One ordered step of the pipeline: a transformation plus the policy rules
/// judged against its output. Immutable once the engine is built.
#[derive(Clone)]
pub struct StageDefinition {
    name: String,
    transform: Arc<dyn Transform>,
    policy: StagePolicy,
    max_retry: Option<u32>,
    timeout: Option<Duration>,
}

impl StageDefinition {
    pub fn builder(name: impl Into<String>) -> StageDefinitionBuilder {
        StageDefinitionBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transform(&self) -> &Arc<dyn Transform> {
        &self.transform
    }

    pub fn policy(&self) -> &StagePolicy {
        &self.policy
    }

    /// Counted failures tolerated before the item is failed and escalated.
    pub fn max_retry(&self) -> u32 {
        self.max_retry.unwrap_or(EngineConfig::default().default_max_retry)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
            .unwrap_or_else(|| EngineConfig::default().default_stage_timeout())
    }

    /// Fill unset limits from the engine configuration.
    pub(crate) fn apply_defaults(&mut self, config: &EngineConfig) {
        self.max_retry.get_or_insert(config.default_max_retry);
        self.timeout.get_or_insert(config.default_stage_timeout());
    }
}

impl std::fmt::Debug for StageDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDefinition")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("max_retry", &self.max_retry)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Builder for [`StageDefinition`]
pub struct StageDefinitionBuilder {
    name: String,
    transform: Option<Arc<dyn Transform>>,
    policy: StagePolicy,
    max_retry: Option<u32>,
    timeout: Option<Duration>,
}

impl StageDefinitionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            policy: StagePolicy::new(name.clone()),
            name,
            transform: None,
            max_retry: None,
            timeout: None,
        }
    }

    pub fn transform(mut self, transform: impl Transform + 'static) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn shared_transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Append a policy rule for this stage.
    pub fn rule(mut self, rule: impl PolicyRule + 'static) -> Self {
        self.policy = self.policy.with_rule(rule);
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<StageDefinition> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "stage name must not be empty".to_string(),
            ));
        }
        let transform = self.transform.ok_or_else(|| {
            PipelineError::Configuration(format!("stage {} has no transformation", self.name))
        })?;
        if self.timeout == Some(Duration::ZERO) {
            return Err(PipelineError::Configuration(format!(
                "stage {} timeout must be positive",
                self.name
            )));
        }
        Ok(StageDefinition {
            name: self.name,
            transform,
            policy: self.policy,
            max_retry: self.max_retry,
            timeout: self.timeout,
        })
    }
}
