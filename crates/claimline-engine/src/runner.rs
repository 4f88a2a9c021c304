//! Runs a single stage for a single item.

use std::sync::Arc;

use claimline_ledger::IntegrityLedger;
use claimline_policy::PolicyGate;
use claimline_types::{Checkpoint, Fingerprint, FingerprintRecord, Item, ItemStatus, PolicyVerdict};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::stage::StageDefinition;
use crate::supervisor::{DriftSupervisor, ViolationKind};

/// Outcome of one stage attempt: the item as it should now be stored, and
/// what the caller gets back.
#[derive(Debug)]
pub struct StageRun {
    pub item: Item,
    pub result: Result<ItemStatus>,
}

impl StageRun {
    fn new(item: Item, result: Result<ItemStatus>) -> Self {
        Self { item, result }
    }
}

/// Brackets a stage's transformation with ledger checks and a policy verdict.
///
/// Holds no lock while the transformation runs.
pub struct StageRunner {
    ledger: Arc<IntegrityLedger>,
    gate: Arc<PolicyGate>,
    supervisor: Arc<DriftSupervisor>,
}

impl StageRunner {
    pub fn new(
        ledger: Arc<IntegrityLedger>,
        gate: Arc<PolicyGate>,
        supervisor: Arc<DriftSupervisor>,
    ) -> Self {
        Self {
            ledger,
            gate,
            supervisor,
        }
    }

    /// Run `stage` against `item`, which must sit at that stage's index.
    ///
    /// `stage_count` is the pipeline length, used to recognise the final
    /// stage.
    pub async fn run(&self, item: &Item, stage: &StageDefinition, stage_count: usize) -> StageRun {
        let index = item.stage_index;
        let updated = item.clone();

        if let Some(reason) = self.supervisor.frozen_reason() {
            return StageRun::new(updated, Err(PipelineError::EngineFrozen { reason }));
        }

        // Pre-stage fingerprint. Beyond stage 0 the payload must be exactly
        // what the previous stage committed.
        let pre = match self.ledger.fingerprint(&item.payload) {
            Ok(fp) => fp,
            Err(e) => return StageRun::new(updated, Err(e.into())),
        };
        if index > 0 {
            let chained = item.last_fingerprint();
            let committed = self.ledger.committed(item.id, index - 1, Checkpoint::Output);
            if chained != Some(pre) || committed.is_some_and(|c| c != pre) {
                let detail = format!(
                    "payload fingerprint {} differs from output committed by stage {}",
                    pre.short(),
                    index - 1
                );
                return self
                    .integrity_failure(updated, stage, ViolationKind::FingerprintMismatch, detail)
                    .await;
            }
        }
        if let Err(e) = self.ledger.record(item.id, index, Checkpoint::Input, pre) {
            return if e.is_integrity_violation() {
                self.integrity_failure(updated, stage, ViolationKind::FingerprintMismatch, e.to_string())
                    .await
            } else {
                StageRun::new(updated, Err(e.into()))
            };
        }

        debug!(
            item_id = %item.id,
            stage = %stage.name(),
            input = %pre.short(),
            "Running stage transformation"
        );
        let timeout = stage.timeout();
        let output = match tokio::time::timeout(
            timeout,
            stage.transform().transform(item.payload.clone()),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return self.counted_failure(updated, stage, e.to_string(), false).await,
            Err(_) => {
                let message = format!("transformation timed out after {:?}", timeout);
                return self.counted_failure(updated, stage, message, false).await;
            }
        };

        // A freeze raised while the transformation ran discards its result.
        if let Some(reason) = self.supervisor.frozen_reason() {
            warn!(
                item_id = %item.id,
                stage = %stage.name(),
                "Engine froze during transformation, result discarded"
            );
            return StageRun::new(updated, Err(PipelineError::EngineFrozen { reason }));
        }

        let post = match self.ledger.fingerprint(&output) {
            Ok(fp) => fp,
            Err(e) => return StageRun::new(updated, Err(e.into())),
        };

        match self.gate.evaluate(item, stage.policy(), &output) {
            PolicyVerdict::Allow => self.commit(updated, stage, stage_count, output, post).await,
            PolicyVerdict::Block(reason) => self.counted_failure(updated, stage, reason, true).await,
            PolicyVerdict::Defer(reason) => StageRun::new(
                updated,
                Err(PipelineError::PolicyDeferred {
                    item_id: item.id,
                    stage: stage.name().to_string(),
                    reason,
                }),
            ),
        }
    }

    async fn commit(
        &self,
        mut item: Item,
        stage: &StageDefinition,
        stage_count: usize,
        output: serde_json::Value,
        post: Fingerprint,
    ) -> StageRun {
        let index = item.stage_index;
        if let Err(e) = self.ledger.record(item.id, index, Checkpoint::Output, post) {
            return if e.is_integrity_violation() {
                self.integrity_failure(item, stage, ViolationKind::FingerprintMismatch, e.to_string())
                    .await
            } else {
                StageRun::new(item, Err(e.into()))
            };
        }

        item.payload = output;
        item.fingerprints.push(FingerprintRecord {
            stage_index: index,
            hash: post,
        });
        item.stage_index = index + 1;
        let status = if item.stage_index >= stage_count {
            ItemStatus::Published
        } else {
            ItemStatus::InStage
        };
        item.set_status(status, None);

        info!(
            item_id = %item.id,
            stage = %stage.name(),
            output = %post.short(),
            status = %status,
            "Stage committed"
        );
        StageRun::new(item, Ok(status))
    }

    /// A transformation failure, timeout or policy block. Escalates once the
    /// stage's count passes `max_retry`.
    async fn counted_failure(
        &self,
        mut item: Item,
        stage: &StageDefinition,
        message: String,
        blocked: bool,
    ) -> StageRun {
        let index = item.stage_index;
        let attempts = item.record_failure(index);
        let max_retry = stage.max_retry();

        if attempts > max_retry {
            warn!(
                item_id = %item.id,
                stage = %stage.name(),
                attempts,
                error = %message,
                "Retries exhausted, escalating"
            );
            item.set_status(
                ItemStatus::Failed,
                Some(format!(
                    "retries exhausted at stage {}: {}",
                    stage.name(),
                    message
                )),
            );
            self.supervisor.report_chronic_failure(stage.name()).await;
            let err = PipelineError::RetriesExhausted {
                item_id: item.id,
                stage: stage.name().to_string(),
                attempts,
            };
            return StageRun::new(item, Err(err));
        }

        if blocked {
            item.set_status(ItemStatus::Blocked, Some(message.clone()));
            let err = PipelineError::PolicyBlocked {
                item_id: item.id,
                stage: stage.name().to_string(),
                reason: message,
            };
            return StageRun::new(item, Err(err));
        }

        debug!(
            item_id = %item.id,
            stage = %stage.name(),
            attempt = attempts,
            error = %message,
            "Stage transformation failed"
        );
        item.updated_at = chrono::Utc::now();
        let err = PipelineError::TransformationError {
            item_id: item.id,
            stage: stage.name().to_string(),
            attempt: attempts,
            allowed: max_retry + 1,
            message,
        };
        StageRun::new(item, Err(err))
    }

    async fn integrity_failure(
        &self,
        mut item: Item,
        stage: &StageDefinition,
        kind: ViolationKind,
        detail: String,
    ) -> StageRun {
        warn!(
            item_id = %item.id,
            stage = %stage.name(),
            detail = %detail,
            "Integrity violation, failing item"
        );
        item.set_status(ItemStatus::Failed, Some(detail.clone()));
        self.supervisor
            .report_integrity_violation(stage.name(), kind, &detail)
            .await;
        let err = PipelineError::IntegrityViolation {
            item_id: item.id,
            stage: stage.name().to_string(),
            detail,
        };
        StageRun::new(item, Err(err))
    }
}
