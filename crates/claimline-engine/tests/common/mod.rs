#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use claimline_engine::{
    EngineConfig, FnTransform, PipelineEngine, PipelineEngineBuilder, StageDefinition,
    Transform, TransformError,
};
use serde_json::{json, Value};

/// A deterministic stage that records its own name in the payload.
pub fn tagging_stage(name: &'static str) -> StageDefinition {
    StageDefinition::builder(name)
        .transform(FnTransform::new(move |mut content: Value| {
            let mut trail = content["trail"].as_array().cloned().unwrap_or_default();
            trail.push(json!(name));
            content["trail"] = Value::Array(trail);
            Ok(content)
        }))
        .build()
        .expect("valid stage")
}

/// A stage that always fails its transformation.
pub fn failing_stage(name: &'static str) -> StageDefinition {
    StageDefinition::builder(name)
        .transform(FnTransform::new(|_| {
            Err(TransformError::new("enrichment service unavailable"))
        }))
        .build()
        .expect("valid stage")
}

/// A stage whose transformation fails until `healthy` flips to true.
pub fn switchable_stage(name: &'static str, healthy: Arc<AtomicBool>) -> StageDefinition {
    StageDefinition::builder(name)
        .transform(FnTransform::new(move |mut content: Value| {
            if healthy.load(Ordering::SeqCst) {
                content[name] = json!("done");
                Ok(content)
            } else {
                Err(TransformError::new("upstream down"))
            }
        }))
        .build()
        .expect("valid stage")
}

/// A transformation whose output differs on every call.
pub fn nondeterministic_transform() -> Arc<dyn Transform> {
    let calls = AtomicU32::new(0);
    Arc::new(FnTransform::new(move |mut content: Value| {
        content["call"] = json!(calls.fetch_add(1, Ordering::SeqCst));
        Ok(content)
    }))
}

pub fn config(max_retry: u32) -> EngineConfig {
    EngineConfig {
        default_max_retry: max_retry,
        ..Default::default()
    }
}

pub fn three_stage_builder(max_retry: u32) -> PipelineEngineBuilder {
    PipelineEngine::builder(config(max_retry))
        .stage(tagging_stage("analyze"))
        .stage(tagging_stage("fact_check"))
        .stage(tagging_stage("prepare_publication"))
}

pub fn story(headline: &str) -> Value {
    json!({
        "headline": headline,
        "sources": ["parliament"],
    })
}
