//! The pipeline engine: item table, stage order, freeze gate.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use claimline_ledger::IntegrityLedger;
use claimline_policy::PolicyGate;
use claimline_types::{Checkpoint, Item, ItemId, ItemStatus, OverrideRecord};
use dashmap::DashSet;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::adapters::PublicationSink;
use crate::config::{EngineConfig, SupervisorConfig};
use crate::error::{PipelineError, Result};
use crate::runner::StageRunner;
use crate::stage::StageDefinition;
use crate::store::{EngineStore, MemoryStore};
use crate::supervisor::{DriftSupervisor, ViolationKind};

/// Marks an item as being advanced. Released on drop, so a cancelled
/// `advance` leaves nothing behind.
struct InFlightGuard<'a> {
    in_flight: &'a DashSet<ItemId>,
    id: ItemId,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(in_flight: &'a DashSet<ItemId>, id: ItemId) -> Result<Self> {
        if in_flight.insert(id) {
            Ok(Self { in_flight, id })
        } else {
            Err(PipelineError::ItemBusy(id))
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.id);
    }
}

/// Builder for [`PipelineEngine`]
pub struct PipelineEngineBuilder {
    config: EngineConfig,
    stages: Vec<StageDefinition>,
    ledger: Option<Arc<IntegrityLedger>>,
    gate: Option<Arc<PolicyGate>>,
    supervisor: Option<Arc<DriftSupervisor>>,
    supervisor_config: SupervisorConfig,
    store: Option<Arc<dyn EngineStore>>,
    sink: Option<Arc<dyn PublicationSink>>,
}

impl PipelineEngineBuilder {
    fn new(config: EngineConfig) -> Self {
        Self {
            config,
            stages: Vec::new(),
            ledger: None,
            gate: None,
            supervisor: None,
            supervisor_config: SupervisorConfig::default(),
            store: None,
            sink: None,
        }
    }

    /// Append the next stage. Order of calls is pipeline order.
    pub fn stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stages(mut self, stages: impl IntoIterator<Item = StageDefinition>) -> Self {
        self.stages.extend(stages);
        self
    }

    pub fn ledger(mut self, ledger: Arc<IntegrityLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn policy_gate(mut self, gate: Arc<PolicyGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Use an existing supervisor. Otherwise one is opened over the store.
    pub fn supervisor(mut self, supervisor: Arc<DriftSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Configuration for the supervisor opened when none is supplied.
    pub fn supervisor_config(mut self, config: SupervisorConfig) -> Self {
        self.supervisor_config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn EngineStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn PublicationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validate the stage list, then load and check persisted items.
    pub async fn build(self) -> Result<PipelineEngine> {
        if self.stages.is_empty() {
            return Err(PipelineError::Configuration(
                "pipeline needs at least one stage".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name().to_string()) {
                return Err(PipelineError::Configuration(format!(
                    "duplicate stage name: {}",
                    stage.name()
                )));
            }
        }

        let mut stages = self.stages;
        for stage in &mut stages {
            stage.apply_defaults(&self.config);
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(IntegrityLedger::new()));
        let gate = match self.gate {
            Some(gate) => gate,
            None => Arc::new(
                PolicyGate::with_capacity(self.config.decision_log_capacity)
                    .map_err(|e| PipelineError::Configuration(e.to_string()))?,
            ),
        };
        let supervisor = match self.supervisor {
            Some(supervisor) => supervisor,
            None => Arc::new(DriftSupervisor::open(self.supervisor_config, store.clone()).await?),
        };

        let engine = PipelineEngine {
            runner: StageRunner::new(ledger.clone(), gate.clone(), supervisor.clone()),
            config: self.config,
            stages,
            ledger,
            gate,
            supervisor,
            store,
            sink: self.sink,
            items: RwLock::new(HashMap::new()),
            in_flight: DashSet::new(),
            unreadable: DashSet::new(),
        };
        engine.load().await?;
        Ok(engine)
    }
}

/// Drives items through a fixed, ordered list of stages.
///
/// Safe to share across tasks. Different items may be advanced in
/// parallel; a second concurrent `advance` of the same item is refused with
/// [`PipelineError::ItemBusy`].
pub struct PipelineEngine {
    config: EngineConfig,
    stages: Vec<StageDefinition>,
    runner: StageRunner,
    ledger: Arc<IntegrityLedger>,
    gate: Arc<PolicyGate>,
    supervisor: Arc<DriftSupervisor>,
    store: Arc<dyn EngineStore>,
    sink: Option<Arc<dyn PublicationSink>>,
    items: RwLock<HashMap<ItemId, Item>>,
    in_flight: DashSet<ItemId>,
    /// Placeholders for item documents that failed to decode on load
    unreadable: DashSet<ItemId>,
}

impl PipelineEngine {
    pub fn builder(config: EngineConfig) -> PipelineEngineBuilder {
        PipelineEngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn ledger(&self) -> &Arc<IntegrityLedger> {
        &self.ledger
    }

    pub fn policy_gate(&self) -> &Arc<PolicyGate> {
        &self.gate
    }

    pub fn supervisor(&self) -> &Arc<DriftSupervisor> {
        &self.supervisor
    }

    fn ensure_running(&self) -> Result<()> {
        match self.supervisor.frozen_reason() {
            Some(reason) => Err(PipelineError::EngineFrozen { reason }),
            None => Ok(()),
        }
    }

    /// Accept a new item at stage 0.
    #[instrument(skip(self, payload))]
    pub async fn submit(&self, payload: Value) -> Result<ItemId> {
        self.ensure_running()?;
        let item = Item::new(payload);
        let id = item.id;
        self.store.save_item(&item).await?;
        self.items.write().insert(id, item);
        info!(item_id = %id, "Item submitted");
        Ok(id)
    }

    /// Run the item's current stage and return its new status.
    #[instrument(skip(self), fields(item_id = %id))]
    pub async fn advance(&self, id: ItemId) -> Result<ItemStatus> {
        self.ensure_running()?;
        let _guard = InFlightGuard::acquire(&self.in_flight, id)?;
        let item = self.status(id)?;

        match item.status {
            ItemStatus::Published => return Ok(ItemStatus::Published),
            ItemStatus::Failed => {
                return Err(PipelineError::ItemFailed {
                    item_id: id,
                    reason: item.status_reason.unwrap_or_default(),
                })
            }
            ItemStatus::Blocked => {
                return Err(PipelineError::PolicyBlocked {
                    item_id: id,
                    stage: self.stage_label(item.stage_index),
                    reason: item.status_reason.unwrap_or_default(),
                })
            }
            ItemStatus::Pending | ItemStatus::InStage => {}
        }

        let stage = self.stages.get(item.stage_index).ok_or_else(|| {
            PipelineError::ItemFailed {
                item_id: id,
                reason: format!("stage index {} beyond pipeline", item.stage_index),
            }
        })?;

        let run = self.runner.run(&item, stage, self.stages.len()).await;
        if run.item != item {
            self.store.save_item(&run.item).await?;
            self.items.write().insert(id, run.item.clone());
        }

        if matches!(run.result, Ok(ItemStatus::Published)) {
            self.on_published(&run.item).await;
        }
        run.result
    }

    async fn on_published(&self, item: &Item) {
        info!(
            item_id = %item.id,
            stages = item.fingerprints.len(),
            "Item published"
        );
        self.supervisor.record_publication().await;
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.publish(item.id, &item.payload, &item.fingerprints).await {
                error!(item_id = %item.id, error = %e, "Publication delivery failed");
            }
        }
    }

    /// Advance until the item is terminal or a call fails.
    pub async fn drain(&self, id: ItemId) -> Result<ItemStatus> {
        loop {
            let status = self.advance(id).await?;
            if status.is_terminal() {
                return Ok(status);
            }
        }
    }

    /// Read-only snapshot of one item.
    pub fn status(&self, id: ItemId) -> Result<Item> {
        self.items
            .read()
            .get(&id)
            .cloned()
            .ok_or(PipelineError::ItemNotFound(id))
    }

    /// All items, oldest submission first.
    pub fn items(&self) -> Vec<Item> {
        let mut items: Vec<Item> = self.items.read().values().cloned().collect();
        items.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));
        items
    }

    /// Administrative re-entry of a `Blocked` or `Failed` item at its current
    /// stage index. Failure counts are kept, so a stage that keeps failing
    /// after an override still escalates.
    #[instrument(skip(self, justification), fields(item_id = %id))]
    pub async fn override_item(&self, id: ItemId, justification: &str) -> Result<Item> {
        self.ensure_running()?;
        let _guard = InFlightGuard::acquire(&self.in_flight, id)?;
        let mut item = self.status(id)?;

        let invalid = |reason: String| PipelineError::InvalidOverride {
            item_id: id,
            reason,
        };
        if justification.trim().is_empty() {
            return Err(invalid("justification must not be empty".to_string()));
        }
        if !matches!(item.status, ItemStatus::Blocked | ItemStatus::Failed) {
            return Err(invalid(format!("item is {}", item.status)));
        }
        if self.unreadable.contains(&id) {
            return Err(invalid("item document is unreadable".to_string()));
        }
        if let Some(defect) = self.detect_corruption(&item) {
            return Err(invalid(format!("state is corrupt: {}", defect)));
        }

        let previous_status = item.status;
        let index = item.stage_index;
        item.overrides.push(OverrideRecord {
            stage_index: index,
            previous_status,
            justification: justification.to_string(),
            overridden_at: Utc::now(),
        });
        let status = if index == 0 {
            ItemStatus::Pending
        } else {
            ItemStatus::InStage
        };
        item.set_status(status, None);

        self.store.save_item(&item).await?;
        self.items.write().insert(id, item.clone());
        warn!(
            item_id = %id,
            stage = %self.stage_label(index),
            previous = %previous_status,
            justification = %justification,
            "Item overridden"
        );
        Ok(item)
    }

    fn stage_label(&self, index: usize) -> String {
        self.stages
            .get(index)
            .map(|s| s.name().to_string())
            .unwrap_or_else(|| format!("#{}", index))
    }

    /// Why an item's persisted state cannot be trusted, if it can't.
    fn detect_corruption(&self, item: &Item) -> Option<String> {
        if let Err(defect) = item.check_chain() {
            return Some(defect.to_string());
        }
        let stage_count = self.stages.len();
        if item.stage_index > stage_count {
            return Some(format!(
                "stage index {} beyond {} stages",
                item.stage_index, stage_count
            ));
        }
        let complete = item.stage_index == stage_count;
        if complete != (item.status == ItemStatus::Published) {
            return Some(format!(
                "status {} at stage index {} of {}",
                item.status, item.stage_index, stage_count
            ));
        }
        for record in &item.fingerprints {
            if let Some(committed) =
                self.ledger
                    .committed(item.id, record.stage_index, Checkpoint::Output)
            {
                if committed != record.hash {
                    return Some(format!(
                        "stage {} fingerprint disagrees with the ledger",
                        record.stage_index
                    ));
                }
            }
        }
        None
    }

    /// Load persisted items, failing any whose state is corrupt.
    ///
    /// Undecodable documents count as corrupt state. When the file name
    /// names an item, a `Failed` placeholder stands in for it. The
    /// placeholder is never written back, so the damaged document stays
    /// on disk as evidence.
    async fn load(&self) -> Result<()> {
        let loaded = self.store.load_items().await?;
        let total = loaded.items.len() + loaded.unreadable.len();
        let mut rejected = 0usize;

        for mut item in loaded.items {
            if item.status != ItemStatus::Failed {
                if let Some(defect) = self.detect_corruption(&item) {
                    rejected += 1;
                    warn!(item_id = %item.id, defect = %defect, "Corrupt item rejected on load");
                    let stage = self.stage_label(item.stage_index);
                    item.set_status(
                        ItemStatus::Failed,
                        Some(format!("corrupt state on load: {}", defect)),
                    );
                    self.store.save_item(&item).await?;
                    self.supervisor
                        .report_integrity_violation(&stage, ViolationKind::CorruptState, &defect)
                        .await;
                }
            }
            self.items.write().insert(item.id, item);
        }

        for document in loaded.unreadable {
            rejected += 1;
            let detail = format!(
                "unreadable item document {}: {}",
                document.path.display(),
                document.error
            );
            error!(
                path = %document.path.display(),
                error = %document.error,
                "Unreadable item document on load"
            );
            self.supervisor
                .report_integrity_violation("store", ViolationKind::CorruptState, &detail)
                .await;

            let Some(id) = document.id else { continue };
            let mut placeholder = Item::new(Value::Null);
            placeholder.id = id;
            placeholder.set_status(ItemStatus::Failed, Some(detail));
            let inserted = {
                let mut items = self.items.write();
                if items.contains_key(&id) {
                    false
                } else {
                    items.insert(id, placeholder);
                    true
                }
            };
            if inserted {
                self.unreadable.insert(id);
            }
        }

        info!(
            items = total,
            rejected,
            stages = self.stages.len(),
            "Pipeline engine ready"
        );
        Ok(())
    }
}
