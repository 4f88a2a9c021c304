//! Freeze, resume and restart behaviour of the pipeline engine.

mod common;

use std::sync::Arc;

use claimline_engine::{
    ControlEventKind, EngineStore, FileStore, HealthViolation, PipelineEngine, PipelineError,
    SupervisorConfig, SupervisorError, ViolationKind,
};
use claimline_ledger::{FileJournal, IntegrityLedger, LedgerError};
use claimline_types::{Checkpoint, ItemStatus};
use common::*;
use serde_json::json;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ceiling(max_chronic_failures_per_stage: u32) -> SupervisorConfig {
    SupervisorConfig {
        max_chronic_failures_per_stage,
        ..Default::default()
    }
}

async fn open_durable(dir: &std::path::Path) -> PipelineEngine {
    let store = Arc::new(FileStore::open(dir).await.unwrap());
    let journal = FileJournal::open(store.audit_journal_path()).unwrap();
    let ledger = Arc::new(IntegrityLedger::open(Arc::new(journal)).unwrap());
    three_stage_builder(2)
        .store(store)
        .ledger(ledger)
        .build()
        .await
        .unwrap()
}

// ---------------------------------------------------------------------------
// Health checks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn chronic_failures_over_ceiling_freeze_the_engine() {
    let engine = PipelineEngine::builder(config(0))
        .stage(failing_stage("verify_sources"))
        .supervisor_config(ceiling(2))
        .build()
        .await
        .unwrap();

    for n in 0..3 {
        let id = engine.submit(story(&format!("story {}", n))).await.unwrap();
        assert!(matches!(
            engine.advance(id).await,
            Err(PipelineError::RetriesExhausted { .. })
        ));
    }
    assert!(!engine.supervisor().is_frozen());

    let snapshot = engine.supervisor().check_health().await;
    assert!(!snapshot.is_healthy());
    assert!(snapshot.frozen);
    assert!(snapshot.violations.iter().any(|v| matches!(
        v,
        HealthViolation::ChronicFailures { stage, count: 3, ceiling: 2 } if stage == "verify_sources"
    )));
    let reason = engine.supervisor().frozen_reason().unwrap();
    assert!(!reason.is_empty());
    assert!(reason.contains("verify_sources"));
}

#[tokio::test]
async fn healthy_check_records_success_and_stays_running() {
    let engine = three_stage_builder(2).build().await.unwrap();
    let id = engine.submit(story("x")).await.unwrap();
    engine.drain(id).await.unwrap();

    let snapshot = engine.supervisor().check_health().await;
    assert!(snapshot.is_healthy());
    assert!(!engine.supervisor().is_frozen());
    assert!(engine.supervisor().counters().last_successful_check.is_some());
}

#[tokio::test]
async fn integrity_violation_freezes_at_default_ceiling() {
    let engine = three_stage_builder(2).build().await.unwrap();
    let supervisor = engine.supervisor();
    supervisor
        .report_integrity_violation("fact_check", ViolationKind::CorruptState, "bad chain")
        .await;
    let snapshot = supervisor.check_health().await;
    assert!(snapshot.frozen);
    assert!(snapshot
        .violations
        .contains(&HealthViolation::IntegrityViolations { count: 1, ceiling: 0 }));
}

// ---------------------------------------------------------------------------
// Frozen engine
// ---------------------------------------------------------------------------

#[tokio::test]
async fn frozen_engine_refuses_all_work_until_unfrozen() {
    let engine = three_stage_builder(2).build().await.unwrap();
    let first = engine.submit(story("a")).await.unwrap();
    let second = engine.submit(story("b")).await.unwrap();
    engine.advance(first).await.unwrap();
    engine.supervisor().report_chronic_failure("fact_check").await;

    assert!(engine.supervisor().freeze("manual review").await.unwrap());
    assert!(!engine.supervisor().freeze("second reason").await.unwrap());
    assert_eq!(
        engine.supervisor().frozen_reason().as_deref(),
        Some("manual review")
    );

    assert!(matches!(
        engine.submit(story("c")).await,
        Err(PipelineError::EngineFrozen { .. })
    ));
    for id in [first, second] {
        match engine.advance(id).await {
            Err(PipelineError::EngineFrozen { reason }) => assert_eq!(reason, "manual review"),
            other => panic!("unexpected {:?}", other),
        }
    }
    assert!(matches!(
        engine.override_item(first, "because").await,
        Err(PipelineError::EngineFrozen { .. })
    ));
    assert_eq!(engine.status(first).unwrap().stage_index, 1);
    assert_eq!(engine.status(second).unwrap().stage_index, 0);

    assert!(matches!(
        engine.supervisor().unfreeze("  ").await,
        Err(SupervisorError::EmptyText(_))
    ));
    engine
        .supervisor()
        .unfreeze("editor confirmed sources")
        .await
        .unwrap();
    assert!(matches!(
        engine.supervisor().unfreeze("again").await,
        Err(SupervisorError::NotFrozen)
    ));

    // Resuming does not forgive the recorded failures.
    assert_eq!(engine.supervisor().counters().chronic_failures["fact_check"], 1);
    assert_eq!(engine.advance(first).await.unwrap(), ItemStatus::InStage);
    assert_eq!(engine.advance(second).await.unwrap(), ItemStatus::InStage);

    let kinds: Vec<_> = engine
        .supervisor()
        .history()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert!(kinds.iter().any(|k| matches!(k, ControlEventKind::Frozen { .. })));
    assert!(kinds.iter().any(|k| matches!(k, ControlEventKind::Unfrozen { .. })));
}

#[tokio::test]
async fn reset_counters_clears_window_but_not_freeze() {
    let engine = three_stage_builder(2)
        .supervisor_config(ceiling(1))
        .build()
        .await
        .unwrap();
    let supervisor = engine.supervisor();
    supervisor.report_chronic_failure("analyze").await;
    assert!(supervisor.check_health().await.frozen);

    supervisor.reset_counters().await.unwrap();
    assert!(supervisor.is_frozen());
    assert!(supervisor.counters().chronic_failures.is_empty());

    supervisor.unfreeze("root cause fixed").await.unwrap();
    assert!(supervisor.check_health().await.is_healthy());
}

// ---------------------------------------------------------------------------
// Restart
// ---------------------------------------------------------------------------

#[tokio::test]
async fn items_and_ledger_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    let id = {
        let engine = open_durable(dir.path()).await;
        let id = engine.submit(story("Election Results")).await.unwrap();
        engine.advance(id).await.unwrap();
        engine.supervisor().freeze("maintenance window").await.unwrap();
        id
    };

    let engine = open_durable(dir.path()).await;
    let item = engine.status(id).unwrap();
    assert_eq!(item.status, ItemStatus::InStage);
    assert_eq!(item.stage_index, 1);
    assert!(engine
        .ledger()
        .verify(id, 0, Checkpoint::Output, item.fingerprints[0].hash));
    assert!(engine.ledger().verify_audit_chain().valid);

    // The freeze is durable too.
    assert_eq!(
        engine.supervisor().frozen_reason().as_deref(),
        Some("maintenance window")
    );
    engine.supervisor().unfreeze("window over").await.unwrap();
    assert_eq!(engine.drain(id).await.unwrap(), ItemStatus::Published);
    assert_eq!(engine.status(id).unwrap().fingerprints.len(), 3);
}

#[tokio::test]
async fn corrupt_item_is_failed_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let (good, bad, torn) = {
        let engine = open_durable(dir.path()).await;
        let good = engine.submit(story("good")).await.unwrap();
        let bad = engine.submit(story("bad")).await.unwrap();
        let torn = engine.submit(story("torn")).await.unwrap();
        engine.advance(good).await.unwrap();
        engine.advance(bad).await.unwrap();
        (good, bad, torn)
    };

    // Claim a stage was completed without a fingerprint for it.
    let store = FileStore::open(dir.path()).await.unwrap();
    let mut item = store
        .load_items()
        .await
        .unwrap()
        .items
        .into_iter()
        .find(|i| i.id == bad)
        .unwrap();
    item.stage_index = 2;
    store.save_item(&item).await.unwrap();

    // Undecodable documents, one still named after its item.
    let torn_path = store.item_path(torn);
    tokio::fs::write(&torn_path, b"{\"id\": tampered").await.unwrap();
    tokio::fs::write(dir.path().join("items").join("garbage.json"), b"{not json")
        .await
        .unwrap();

    let engine = open_durable(dir.path()).await;
    assert_eq!(engine.items().len(), 3);
    let failed = engine.status(bad).unwrap();
    assert_eq!(failed.status, ItemStatus::Failed);
    assert!(failed
        .status_reason
        .as_deref()
        .unwrap_or_default()
        .contains("corrupt"));
    assert_eq!(engine.status(good).unwrap().status, ItemStatus::InStage);

    let placeholder = engine.status(torn).unwrap();
    assert_eq!(placeholder.status, ItemStatus::Failed);
    assert!(placeholder
        .status_reason
        .as_deref()
        .unwrap_or_default()
        .contains("unreadable"));
    assert_eq!(engine.supervisor().counters().integrity_violations, 3);

    for id in [bad, torn] {
        assert!(matches!(
            engine.override_item(id, "please").await,
            Err(PipelineError::InvalidOverride { .. })
        ));
        assert!(matches!(
            engine.advance(id).await,
            Err(PipelineError::ItemFailed { .. })
        ));
    }
    assert_eq!(
        tokio::fs::read(&torn_path).await.unwrap(),
        b"{\"id\": tampered".to_vec()
    );
}

#[tokio::test]
async fn tampered_journal_refuses_to_open() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = open_durable(dir.path()).await;
        let id = engine.submit(story("x")).await.unwrap();
        engine.drain(id).await.unwrap();
    }

    let path = dir.path().join("audit.jsonl");
    let text = std::fs::read_to_string(&path).unwrap();
    let mut lines: Vec<String> = text.lines().map(String::from).collect();
    let mut entry: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
    entry["stage_index"] = json!(7);
    lines[1] = entry.to_string();
    std::fs::write(&path, lines.join("\n") + "\n").unwrap();

    let journal = FileJournal::open(&path).unwrap();
    assert!(matches!(
        IntegrityLedger::open(Arc::new(journal)),
        Err(LedgerError::ChainBroken { .. })
    ));
}
