//! Stage transformation capability

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Failure signalled by a transformation. Counts toward the stage's retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TransformError(pub String);

impl TransformError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The work a stage performs on an item's content.
///
/// Must behave as a pure function of `content` from the engine's point of
/// view: the same input is expected to produce the same output. It may call
/// out to external services while doing so, and may take a while.
#[async_trait]
pub trait Transform: Send + Sync {
    async fn transform(&self, content: Value) -> Result<Value, TransformError>;
}

/// Adapts a synchronous closure into a [`Transform`].
pub struct FnTransform<F> {
    f: F,
}

impl<F> FnTransform<F>
where
    F: Fn(Value) -> Result<Value, TransformError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Transform for FnTransform<F>
where
    F: Fn(Value) -> Result<Value, TransformError> + Send + Sync,
{
    async fn transform(&self, content: Value) -> Result<Value, TransformError> {
        (self.f)(content)
    }
}
