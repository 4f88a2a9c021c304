//! Demo journalism pipeline
//!
//! Six deterministic stages that take a story from the feed to a
//! publication record:
//! - `analyze`: classify the story, name stakeholders, assess impact
//! - `fact_check`: keep only claims confirmed by primary, secondary and
//!   historical checks
//! - `verify_sources`: score outlet credibility and check declared content
//!   digests
//! - `build_context`: attach background and implications
//! - `detect_bias`: bucket sources by outlet lean
//! - `prepare_publication`: assemble the record and sign it
//!
//! Feed payloads look like:
//!
//! ```json
//! {
//!   "headline": "New Climate Bill Debate",
//!   "source": "parliament",
//!   "importance": 8,
//!   "sources": [{"id": "hansard-1", "outlet": "parliament", "content": "..."}],
//!   "claims": [{"claim": "...", "primary": true, "secondary": true, "historical": true}]
//! }
//! ```

use claimline_engine::{FnTransform, StageDefinition, TransformError};
use claimline_policy::{FnRule, ForbidMarkers, MinScore, RequireSources};
use claimline_types::{Fingerprint, PolicyVerdict};
use serde_json::{json, Map, Value};

/// Where approved publications are headed.
pub const WEBSITE_TARGET: &str = "omniplex.earth";

/// Share of claims that must survive fact checking.
const MIN_VERIFICATION_RATE: f64 = 0.5;

/// Build the six demo stages in order.
pub fn journalism_stages() -> anyhow::Result<Vec<StageDefinition>> {
    Ok(vec![
        StageDefinition::builder("analyze")
            .transform(FnTransform::new(analyze))
            .rule(ForbidMarkers::new(["fabricated", "doxxing", "unverified rumour"])?)
            .build()?,
        StageDefinition::builder("fact_check")
            .transform(FnTransform::new(fact_check))
            .rule(MinScore::new("verification_rate", MIN_VERIFICATION_RATE)?)
            .build()?,
        StageDefinition::builder("verify_sources")
            .transform(FnTransform::new(verify_sources))
            .rule(RequireSources::new("sources", 1)?)
            .rule(FnRule::new("source_integrity", |_, content| {
                let tampered = sources(content)
                    .filter(|s| s["sha_verified"] == json!(false))
                    .filter_map(|s| s["id"].as_str())
                    .collect::<Vec<_>>();
                if tampered.is_empty() {
                    PolicyVerdict::Allow
                } else {
                    PolicyVerdict::block(format!("content digest mismatch: {}", tampered.join(", ")))
                }
            }))
            .build()?,
        StageDefinition::builder("build_context")
            .transform(FnTransform::new(build_context))
            .build()?,
        StageDefinition::builder("detect_bias")
            .transform(FnTransform::new(detect_bias))
            .build()?,
        StageDefinition::builder("prepare_publication")
            .transform(FnTransform::new(prepare_publication))
            .rule(FnRule::new("ethics_approval", |_, content| {
                if approved(content) {
                    PolicyVerdict::Allow
                } else {
                    PolicyVerdict::block("publication lacks verified facts or cited sources")
                }
            }))
            .build()?,
    ])
}

fn object(content: Value) -> Result<Map<String, Value>, TransformError> {
    match content {
        Value::Object(map) => Ok(map),
        other => Err(TransformError::new(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

fn sources(content: &Value) -> impl Iterator<Item = &Value> {
    content["sources"].as_array().into_iter().flatten()
}

fn analyze(content: Value) -> Result<Value, TransformError> {
    let mut story = object(content)?;
    if story.get("headline").and_then(Value::as_str).is_none() {
        return Err(TransformError::new("story has no headline"));
    }

    let origin = story.get("source").and_then(Value::as_str).unwrap_or("");
    let kind = if origin.contains("parliament") {
        "political"
    } else {
        "general"
    };
    let importance = story.get("importance").and_then(Value::as_u64).unwrap_or(0);
    let impact = if importance > 7 { "high" } else { "medium" };

    story.insert("type".into(), json!(kind));
    story.insert("stakeholders".into(), json!(["Government", "Opposition", "Public"]));
    story.insert("impact".into(), json!(impact));
    story.insert("requires_verification".into(), json!(true));
    Ok(Value::Object(story))
}

fn fact_check(content: Value) -> Result<Value, TransformError> {
    let mut story = object(content)?;
    let claims = story
        .get("claims")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let verified: Vec<Value> = claims
        .iter()
        .filter(|c| {
            ["primary", "secondary", "historical"]
                .iter()
                .all(|check| c[*check].as_bool() == Some(true))
        })
        .cloned()
        .collect();
    let rate = if claims.is_empty() {
        0.0
    } else {
        verified.len() as f64 / claims.len() as f64
    };

    story.insert("verified_facts".into(), Value::Array(verified));
    story.insert("verification_rate".into(), json!(rate));
    story.insert("requires_verification".into(), json!(false));
    Ok(Value::Object(story))
}

fn outlet_credibility(outlet: &str) -> f64 {
    match outlet {
        "parliament" | "gov.uk" => 0.95,
        "bbc" | "reuters" | "ap" => 0.9,
        "guardian" | "telegraph" | "ft" => 0.8,
        "twitter" | "x" => 0.4,
        _ => 0.6,
    }
}

fn verify_sources(content: Value) -> Result<Value, TransformError> {
    let mut story = object(content)?;
    if let Some(Value::Array(list)) = story.get_mut("sources") {
        for source in list.iter_mut() {
            let Value::Object(source) = source else {
                return Err(TransformError::new("source entries must be objects"));
            };
            let outlet = source.get("outlet").and_then(Value::as_str).unwrap_or("");
            let credibility = outlet_credibility(outlet);
            let body = source.get("content").and_then(Value::as_str).unwrap_or("");
            let digest = Fingerprint::hash(body.as_bytes()).to_hex();
            // Sources without a declared digest are taken as first sight.
            let verified = source
                .get("sha")
                .and_then(Value::as_str)
                .map_or(true, |declared| declared == digest);

            source.insert("credibility".into(), json!(credibility));
            source.insert("sha".into(), json!(digest));
            source.insert("sha_verified".into(), json!(verified));
        }
    }
    Ok(Value::Object(story))
}

fn build_context(content: Value) -> Result<Value, TransformError> {
    let mut story = object(content)?;
    let headline = story
        .get("headline")
        .and_then(Value::as_str)
        .unwrap_or("story")
        .to_string();
    let stakeholders = story
        .get("stakeholders")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let positions: Map<String, Value> = stakeholders
        .iter()
        .filter_map(Value::as_str)
        .map(|s| (s.to_string(), json!("no recorded position")))
        .collect();
    let implications = match story.get("impact").and_then(Value::as_str) {
        Some("high") => "likely to shape policy debate",
        _ => "limited expected impact",
    };

    story.insert(
        "context".into(),
        json!({
            "historical": format!("Background to {}", headline),
            "stakeholder_positions": positions,
            "related_events": [],
            "future_implications": implications,
        }),
    );
    Ok(Value::Object(story))
}

fn outlet_lean(outlet: &str) -> f64 {
    match outlet {
        "guardian" | "mirror" => -0.5,
        "telegraph" | "mail" => 0.5,
        _ => 0.0,
    }
}

fn detect_bias(content: Value) -> Result<Value, TransformError> {
    let mut story = object(content)?;
    let (mut left, mut center, mut right) = (Vec::new(), Vec::new(), Vec::new());
    let mut total = 0.0;
    let mut count = 0usize;

    let listed = story.get("sources").and_then(Value::as_array);
    for source in listed.into_iter().flatten() {
        let lean = outlet_lean(source["outlet"].as_str().unwrap_or(""));
        let id = source["id"].clone();
        if lean < -0.3 {
            left.push(id);
        } else if lean > 0.3 {
            right.push(id);
        } else {
            center.push(id);
        }
        total += lean;
        count += 1;
    }
    let score = if count == 0 { 0.0 } else { total / count as f64 };

    story.insert(
        "bias_analysis".into(),
        json!({
            "left_sources": left,
            "center_sources": center,
            "right_sources": right,
            "bias_score": score,
        }),
    );
    Ok(Value::Object(story))
}

fn approved(publication: &Value) -> bool {
    let has_facts = publication["verified_facts"]
        .as_array()
        .is_some_and(|f| !f.is_empty());
    has_facts && publication["sources_cited"].as_u64().unwrap_or(0) > 0
}

fn prepare_publication(content: Value) -> Result<Value, TransformError> {
    let signature = Fingerprint::of_payload(&content)
        .map_err(|e| TransformError::new(e.to_string()))?
        .to_hex();
    let headline = content["headline"].as_str().unwrap_or("story").to_string();

    let mut publication = json!({
        "headline": headline,
        "summary": format!("Summary of {}", headline),
        "verified_facts": content["verified_facts"].clone(),
        "sources_cited": sources(&content).count(),
        "bias_disclosure": content["bias_analysis"].clone(),
        "website_target": WEBSITE_TARGET,
        "sha_signature": signature,
    });
    let status = if approved(&publication) {
        "READY_TO_PUBLISH"
    } else {
        "NEEDS_HUMAN_REVIEW"
    };
    publication["status"] = json!(status);
    Ok(publication)
}

#[cfg(test)]
mod tests {
    use super::*;
    use claimline_engine::{EngineConfig, PipelineEngine};
    use claimline_types::ItemStatus;

    fn story() -> Value {
        json!({
            "headline": "New Climate Bill Debate",
            "source": "parliament",
            "importance": 8,
            "sources": [
                {"id": "hansard-1", "outlet": "parliament", "content": "Second reading"},
                {"id": "guardian-1", "outlet": "guardian", "content": "Commentary"},
            ],
            "claims": [
                {"claim": "The bill targets 2050", "primary": true, "secondary": true, "historical": true},
            ],
        })
    }

    async fn engine() -> PipelineEngine {
        PipelineEngine::builder(EngineConfig::default())
            .stages(journalism_stages().unwrap())
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn well_sourced_story_is_published() {
        let engine = engine().await;
        let id = engine.submit(story()).await.unwrap();
        assert_eq!(engine.drain(id).await.unwrap(), ItemStatus::Published);

        let item = engine.status(id).unwrap();
        assert_eq!(item.fingerprints.len(), 6);
        assert_eq!(item.payload["status"], json!("READY_TO_PUBLISH"));
        assert_eq!(item.payload["sources_cited"], json!(2));
        assert_eq!(item.payload["website_target"], json!(WEBSITE_TARGET));
        assert_eq!(
            item.payload["bias_disclosure"]["left_sources"],
            json!(["guardian-1"])
        );
    }

    #[tokio::test]
    async fn unsourced_story_is_blocked() {
        let engine = engine().await;
        let mut payload = story();
        payload["sources"] = json!([]);
        let id = engine.submit(payload).await.unwrap();
        let err = engine.drain(id).await.unwrap_err();
        assert!(err.needs_escalation());
        let item = engine.status(id).unwrap();
        assert_eq!(item.status, ItemStatus::Blocked);
        assert_eq!(engine.stage_names()[item.stage_index], "verify_sources");
    }

    #[tokio::test]
    async fn tampered_source_content_is_blocked() {
        let engine = engine().await;
        let mut payload = story();
        payload["sources"][0]["sha"] = json!(Fingerprint::hash(b"original text").to_hex());
        let id = engine.submit(payload).await.unwrap();
        assert!(engine.drain(id).await.is_err());
        assert_eq!(engine.status(id).unwrap().stage_index, 2);
    }

    #[test]
    fn fact_check_requires_all_three_checks() {
        let out = fact_check(json!({
            "claims": [
                {"claim": "a", "primary": true, "secondary": true, "historical": true},
                {"claim": "b", "primary": true, "secondary": false, "historical": true},
            ]
        }))
        .unwrap();
        assert_eq!(out["verified_facts"].as_array().unwrap().len(), 1);
        assert_eq!(out["verification_rate"], json!(0.5));
    }

    #[test]
    fn non_object_payload_is_a_transform_error() {
        assert!(analyze(json!("just a string")).is_err());
        assert!(analyze(json!({"source": "bbc"})).is_err());
    }

    #[test]
    fn publication_without_facts_needs_review() {
        let out = prepare_publication(json!({"headline": "x", "sources": [{"id": "a"}]})).unwrap();
        assert_eq!(out["status"], json!("NEEDS_HUMAN_REVIEW"));
        assert!(!approved(&out));
    }
}
