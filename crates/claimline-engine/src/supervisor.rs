//! Drift supervisor: aggregate health predicates and the engine freeze.
//!
//! All control state (frozen flag, freeze reason, health counters) lives
//! behind a single mutex. The periodic health check and in-flight advances
//! both go through it, so a freeze is observed by the next commit attempt.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;
use crate::error::{StoreError, SupervisorError};
use crate::store::{EngineStore, MemoryStore};

/// Aggregate counters judged by the health predicates.
///
/// Cleared only by `reset_counters`, never by `unfreeze`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCounters {
    /// Items that exhausted their retries, per stage name
    pub chronic_failures: BTreeMap<String, u32>,
    pub integrity_violations: u64,
    /// Ledger slots offered a fingerprint different from the committed one
    pub fingerprint_collisions: u64,
    pub last_publication: Option<DateTime<Utc>>,
    pub last_successful_check: Option<DateTime<Utc>>,
    /// Start of the current counting window
    pub baseline: DateTime<Utc>,
}

impl Default for HealthCounters {
    fn default() -> Self {
        Self {
            chronic_failures: BTreeMap::new(),
            integrity_violations: 0,
            fingerprint_collisions: 0,
            last_publication: None,
            last_successful_check: None,
            baseline: Utc::now(),
        }
    }
}

/// Persisted control state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlSnapshot {
    pub frozen: bool,
    pub freeze_reason: Option<String>,
    pub frozen_at: Option<DateTime<Utc>>,
    pub counters: HealthCounters,
}

/// How an integrity violation was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Content fingerprint disagreed with a committed one
    FingerprintMismatch,
    /// Persisted item state failed its chain checks on load
    CorruptState,
}

/// A failed health predicate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "predicate", rename_all = "snake_case")]
pub enum HealthViolation {
    ChronicFailures { stage: String, count: u32, ceiling: u32 },
    IntegrityViolations { count: u64, ceiling: u64 },
    Stale { idle_secs: i64, ceiling_secs: u64 },
}

impl std::fmt::Display for HealthViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChronicFailures {
                stage,
                count,
                ceiling,
            } => write!(
                f,
                "stage {} has {} chronic failures (ceiling {})",
                stage, count, ceiling
            ),
            Self::IntegrityViolations { count, ceiling } => write!(
                f,
                "{} unresolved integrity violations (ceiling {})",
                count, ceiling
            ),
            Self::Stale {
                idle_secs,
                ceiling_secs,
            } => write!(
                f,
                "no publication for {}s (ceiling {}s)",
                idle_secs, ceiling_secs
            ),
        }
    }
}

/// Result of evaluating the health predicates
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub checked_at: DateTime<Utc>,
    pub frozen: bool,
    pub freeze_reason: Option<String>,
    pub counters: HealthCounters,
    /// Seconds since the last passing check, if there was one
    pub since_last_successful_check_secs: Option<i64>,
    pub violations: Vec<HealthViolation>,
}

impl HealthSnapshot {
    pub fn is_healthy(&self) -> bool {
        self.violations.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlEventKind {
    Frozen {
        reason: String,
    },
    Unfrozen {
        justification: String,
    },
    CountersReset,
    ChronicFailure {
        stage: String,
    },
    IntegrityViolation {
        stage: String,
        kind: ViolationKind,
        detail: String,
    },
}

/// Broadcast to subscribers and kept in the control history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ControlEventKind,
}

/// Watches aggregate health and owns the engine's frozen flag.
pub struct DriftSupervisor {
    config: SupervisorConfig,
    state: Mutex<ControlSnapshot>,
    store: Arc<dyn EngineStore>,
    /// Serializes control writes so the last write carries the newest state
    persist_lock: tokio::sync::Mutex<()>,
    history: Mutex<VecDeque<ControlEvent>>,
    event_tx: broadcast::Sender<ControlEvent>,
}

impl DriftSupervisor {
    /// A supervisor with fresh state and no durable store.
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_state(config, ControlSnapshot::default(), Arc::new(MemoryStore::new()))
    }

    /// Restore control state from a store, or start fresh if it has none.
    pub async fn open(
        config: SupervisorConfig,
        store: Arc<dyn EngineStore>,
    ) -> Result<Self, SupervisorError> {
        let state = store.load_control().await?.unwrap_or_default();
        if state.frozen {
            warn!(
                reason = state.freeze_reason.as_deref().unwrap_or(""),
                "Restored supervisor is frozen"
            );
        }
        Ok(Self::with_state(config, state, store))
    }

    fn with_state(
        config: SupervisorConfig,
        state: ControlSnapshot,
        store: Arc<dyn EngineStore>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            config,
            state: Mutex::new(state),
            store,
            persist_lock: tokio::sync::Mutex::new(()),
            history: Mutex::new(VecDeque::new()),
            event_tx,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.event_tx.subscribe()
    }

    /// The most recent control events, oldest first.
    ///
    /// Holds at most `history_capacity` events.
    pub fn history(&self) -> Vec<ControlEvent> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn is_frozen(&self) -> bool {
        self.state.lock().frozen
    }

    /// The freeze reason if frozen.
    pub fn frozen_reason(&self) -> Option<String> {
        let state = self.state.lock();
        if state.frozen {
            Some(state.freeze_reason.clone().unwrap_or_default())
        } else {
            None
        }
    }

    pub fn counters(&self) -> HealthCounters {
        self.state.lock().counters.clone()
    }

    pub fn control_snapshot(&self) -> ControlSnapshot {
        self.state.lock().clone()
    }

    /// Evaluate the health predicates without acting on them.
    pub fn evaluate(&self) -> HealthSnapshot {
        let state = self.state.lock().clone();
        let now = Utc::now();
        let counters = &state.counters;
        let mut violations = Vec::new();

        let ceiling = self.config.max_chronic_failures_per_stage;
        for (stage, &count) in &counters.chronic_failures {
            if count >= ceiling {
                violations.push(HealthViolation::ChronicFailures {
                    stage: stage.clone(),
                    count,
                    ceiling,
                });
            }
        }

        if counters.integrity_violations > self.config.max_integrity_violations {
            violations.push(HealthViolation::IntegrityViolations {
                count: counters.integrity_violations,
                ceiling: self.config.max_integrity_violations,
            });
        }

        if let Some(ceiling_secs) = self.config.staleness_ceiling_secs {
            let since = counters
                .last_publication
                .map_or(counters.baseline, |p| p.max(counters.baseline));
            let idle_secs = (now - since).num_seconds();
            if idle_secs >= ceiling_secs as i64 {
                violations.push(HealthViolation::Stale {
                    idle_secs,
                    ceiling_secs,
                });
            }
        }

        HealthSnapshot {
            checked_at: now,
            frozen: state.frozen,
            freeze_reason: state.freeze_reason.clone(),
            since_last_successful_check_secs: counters
                .last_successful_check
                .map(|t| (now - t).num_seconds()),
            counters: state.counters,
            violations,
        }
    }

    /// Evaluate the health predicates and freeze on any violation.
    pub async fn check_health(&self) -> HealthSnapshot {
        let mut snapshot = self.evaluate();

        if snapshot.is_healthy() {
            self.state.lock().counters.last_successful_check = Some(snapshot.checked_at);
            snapshot.counters.last_successful_check = Some(snapshot.checked_at);
            self.persist_logged().await;
            return snapshot;
        }

        let reason = format!(
            "health check failed: {}",
            snapshot
                .violations
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        );
        warn!(violations = snapshot.violations.len(), "Health check failed");

        if self.freeze_state(&reason) {
            self.persist_logged().await;
        }
        let state = self.state.lock();
        snapshot.frozen = state.frozen;
        snapshot.freeze_reason = state.freeze_reason.clone();
        snapshot
    }

    /// Halt the engine. Returns `false` if it was already frozen, in which
    /// case the original reason is kept.
    pub async fn freeze(&self, reason: &str) -> Result<bool, SupervisorError> {
        if reason.trim().is_empty() {
            return Err(SupervisorError::EmptyText("freeze reason"));
        }
        if !self.freeze_state(reason) {
            return Ok(false);
        }
        self.persist().await?;
        Ok(true)
    }

    fn freeze_state(&self, reason: &str) -> bool {
        {
            let mut state = self.state.lock();
            if state.frozen {
                return false;
            }
            state.frozen = true;
            state.freeze_reason = Some(reason.to_string());
            state.frozen_at = Some(Utc::now());
        }
        error!(reason = %reason, "Pipeline frozen");
        self.emit(ControlEventKind::Frozen {
            reason: reason.to_string(),
        });
        true
    }

    /// Administrative resume. Leaves every counter untouched.
    pub async fn unfreeze(&self, justification: &str) -> Result<(), SupervisorError> {
        if justification.trim().is_empty() {
            return Err(SupervisorError::EmptyText("justification"));
        }
        {
            let mut state = self.state.lock();
            if !state.frozen {
                return Err(SupervisorError::NotFrozen);
            }
            state.frozen = false;
            state.freeze_reason = None;
            state.frozen_at = None;
        }
        info!(justification = %justification, "Pipeline unfrozen");
        self.emit(ControlEventKind::Unfrozen {
            justification: justification.to_string(),
        });
        self.persist().await?;
        Ok(())
    }

    /// Clear the health counters and restart the counting window.
    ///
    /// Independent of the frozen flag.
    pub async fn reset_counters(&self) -> Result<(), SupervisorError> {
        {
            let mut state = self.state.lock();
            let last_publication = state.counters.last_publication;
            state.counters = HealthCounters {
                last_publication,
                ..HealthCounters::default()
            };
        }
        info!("Health counters reset");
        self.emit(ControlEventKind::CountersReset);
        self.persist().await?;
        Ok(())
    }

    /// An item exhausted its retries on `stage`.
    pub async fn report_chronic_failure(&self, stage: &str) {
        let count = {
            let mut state = self.state.lock();
            let count = state
                .counters
                .chronic_failures
                .entry(stage.to_string())
                .or_insert(0);
            *count += 1;
            *count
        };
        warn!(stage = %stage, count, "Chronic stage failure reported");
        self.emit(ControlEventKind::ChronicFailure {
            stage: stage.to_string(),
        });
        self.persist_logged().await;
    }

    pub async fn report_integrity_violation(&self, stage: &str, kind: ViolationKind, detail: &str) {
        {
            let mut state = self.state.lock();
            state.counters.integrity_violations += 1;
            if kind == ViolationKind::FingerprintMismatch {
                state.counters.fingerprint_collisions += 1;
            }
        }
        warn!(stage = %stage, kind = ?kind, detail = %detail, "Integrity violation reported");
        self.emit(ControlEventKind::IntegrityViolation {
            stage: stage.to_string(),
            kind,
            detail: detail.to_string(),
        });
        self.persist_logged().await;
    }

    /// An item reached `Published`.
    pub async fn record_publication(&self) {
        self.state.lock().counters.last_publication = Some(Utc::now());
        self.persist_logged().await;
    }

    /// Run `check_health` every `check_interval` until `shutdown` turns true.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.check_interval();
            let mut ticker = interval_at(Instant::now() + period, period);
            info!(interval_secs = period.as_secs(), "Drift supervisor started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = self.check_health().await;
                        if !snapshot.is_healthy() {
                            warn!(frozen = snapshot.frozen, "Periodic health check found drift");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Drift supervisor stopped");
        })
    }

    fn emit(&self, kind: ControlEventKind) {
        let event = ControlEvent {
            at: Utc::now(),
            kind,
        };
        {
            let mut history = self.history.lock();
            while history.len() >= self.config.history_capacity.max(1) {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        let _ = self.event_tx.send(event);
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.state.lock().clone();
        self.store.save_control(&snapshot).await
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            error!(error = %e, "Failed to persist control state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(ceiling: u32) -> SupervisorConfig {
        SupervisorConfig {
            max_chronic_failures_per_stage: ceiling,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn healthy_check_records_success() {
        let supervisor = DriftSupervisor::new(config(2));
        let snapshot = supervisor.check_health().await;
        assert!(snapshot.is_healthy());
        assert!(!snapshot.frozen);
        assert!(supervisor.counters().last_successful_check.is_some());
    }

    #[tokio::test]
    async fn chronic_failures_at_ceiling_freeze() {
        let supervisor = DriftSupervisor::new(config(2));
        supervisor.report_chronic_failure("fact_check").await;
        assert!(supervisor.check_health().await.is_healthy());

        supervisor.report_chronic_failure("fact_check").await;
        let snapshot = supervisor.check_health().await;
        assert!(!snapshot.is_healthy());
        assert!(snapshot.frozen);
        assert!(supervisor.is_frozen());
        let reason = supervisor.frozen_reason().unwrap();
        assert!(reason.contains("fact_check"), "{}", reason);
    }

    #[tokio::test]
    async fn any_integrity_violation_freezes_by_default() {
        let supervisor = DriftSupervisor::new(SupervisorConfig::default());
        supervisor
            .report_integrity_violation("analyze", ViolationKind::FingerprintMismatch, "x")
            .await;
        let counters = supervisor.counters();
        assert_eq!(counters.integrity_violations, 1);
        assert_eq!(counters.fingerprint_collisions, 1);

        let snapshot = supervisor.check_health().await;
        assert_eq!(
            snapshot.violations,
            vec![HealthViolation::IntegrityViolations {
                count: 1,
                ceiling: 0
            }]
        );
        assert!(supervisor.is_frozen());
    }

    #[tokio::test]
    async fn corrupt_state_is_not_a_collision() {
        let supervisor = DriftSupervisor::new(SupervisorConfig::default());
        supervisor
            .report_integrity_violation("load", ViolationKind::CorruptState, "gap")
            .await;
        assert_eq!(supervisor.counters().fingerprint_collisions, 0);
        assert_eq!(supervisor.counters().integrity_violations, 1);
    }

    #[tokio::test]
    async fn staleness_measured_from_baseline() {
        let supervisor = DriftSupervisor::new(SupervisorConfig {
            staleness_ceiling_secs: Some(60),
            ..Default::default()
        });
        assert!(supervisor.evaluate().is_healthy());

        supervisor.state.lock().counters.baseline = Utc::now() - chrono::Duration::seconds(120);
        let snapshot = supervisor.evaluate();
        assert!(matches!(
            snapshot.violations.as_slice(),
            [HealthViolation::Stale { ceiling_secs: 60, .. }]
        ));
        // evaluate never freezes
        assert!(!supervisor.is_frozen());

        supervisor.record_publication().await;
        assert!(supervisor.evaluate().is_healthy());
    }

    #[tokio::test]
    async fn unfreeze_keeps_counters() {
        let supervisor = DriftSupervisor::new(config(1));
        supervisor.report_chronic_failure("analyze").await;
        supervisor.check_health().await;
        assert!(supervisor.is_frozen());

        supervisor.unfreeze("root cause fixed").await.unwrap();
        assert!(!supervisor.is_frozen());
        assert_eq!(supervisor.counters().chronic_failures["analyze"], 1);

        // Still unhealthy until counters are reset.
        supervisor.check_health().await;
        assert!(supervisor.is_frozen());
        supervisor.unfreeze("again").await.unwrap();
        supervisor.reset_counters().await.unwrap();
        assert!(supervisor.counters().chronic_failures.is_empty());
        assert!(supervisor.check_health().await.is_healthy());
    }

    #[tokio::test]
    async fn unfreeze_validation() {
        let supervisor = DriftSupervisor::new(SupervisorConfig::default());
        assert!(matches!(
            supervisor.unfreeze("why").await,
            Err(SupervisorError::NotFrozen)
        ));
        supervisor.freeze("manual").await.unwrap();
        assert!(matches!(
            supervisor.unfreeze("  ").await,
            Err(SupervisorError::EmptyText(_))
        ));
        assert!(supervisor.is_frozen());
    }

    #[tokio::test]
    async fn freeze_keeps_first_reason() {
        let supervisor = DriftSupervisor::new(SupervisorConfig::default());
        assert!(supervisor.freeze("first").await.unwrap());
        assert!(!supervisor.freeze("second").await.unwrap());
        assert_eq!(supervisor.frozen_reason().as_deref(), Some("first"));
        assert!(supervisor.freeze("").await.is_err());
    }

    #[tokio::test]
    async fn reset_counters_works_while_frozen() {
        let supervisor = DriftSupervisor::new(SupervisorConfig::default());
        supervisor.report_chronic_failure("s").await;
        supervisor.freeze("manual").await.unwrap();
        supervisor.reset_counters().await.unwrap();
        assert!(supervisor.is_frozen());
        assert!(supervisor.counters().chronic_failures.is_empty());
    }

    #[tokio::test]
    async fn events_are_broadcast_and_kept() {
        let supervisor = DriftSupervisor::new(SupervisorConfig::default());
        let mut rx = supervisor.subscribe();
        supervisor.freeze("drift").await.unwrap();
        supervisor.unfreeze("checked").await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(
            first.kind,
            ControlEventKind::Frozen {
                reason: "drift".into()
            }
        );
        let second = rx.recv().await.unwrap();
        assert!(matches!(second.kind, ControlEventKind::Unfrozen { .. }));
        assert_eq!(supervisor.history().len(), 2);
    }

    #[tokio::test]
    async fn history_keeps_only_the_newest_events() {
        let supervisor = DriftSupervisor::new(SupervisorConfig {
            history_capacity: 4,
            ..Default::default()
        });
        for round in 0..5 {
            supervisor.freeze(&format!("drift {}", round)).await.unwrap();
            supervisor.unfreeze("checked").await.unwrap();
        }

        let history = supervisor.history();
        assert_eq!(history.len(), 4);
        assert_eq!(
            history[0].kind,
            ControlEventKind::Frozen {
                reason: "drift 3".into()
            }
        );
        assert!(matches!(history[3].kind, ControlEventKind::Unfrozen { .. }));
    }

    #[tokio::test]
    async fn control_state_survives_reopen() {
        let store: Arc<dyn EngineStore> = Arc::new(MemoryStore::new());
        {
            let supervisor = DriftSupervisor::open(config(5), store.clone()).await.unwrap();
            supervisor.report_chronic_failure("verify_sources").await;
            supervisor.freeze("operator halt").await.unwrap();
        }
        let supervisor = DriftSupervisor::open(config(5), store).await.unwrap();
        assert!(supervisor.is_frozen());
        assert_eq!(supervisor.frozen_reason().as_deref(), Some("operator halt"));
        assert_eq!(supervisor.counters().chronic_failures["verify_sources"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_loop_checks_and_stops() {
        let supervisor = Arc::new(DriftSupervisor::new(SupervisorConfig {
            check_interval_secs: 10,
            max_chronic_failures_per_stage: 1,
            ..Default::default()
        }));
        supervisor.report_chronic_failure("analyze").await;

        let (tx, rx) = watch::channel(false);
        let handle = supervisor.clone().spawn(rx);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(supervisor.is_frozen());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
