//! Staged pipeline engine for Claimline.
//!
//! [`PipelineEngine`] owns a fixed, ordered list of [`StageDefinition`]s and
//! drives each submitted item through them one stage per `advance` call.
//! Every stage runs through a [`StageRunner`], which brackets the caller's
//! transformation with integrity-ledger checks and a policy-gate verdict.
//!
//! [`DriftSupervisor`] watches aggregate counters (chronic stage failures,
//! integrity violations, publication staleness) and freezes the engine when
//! any health predicate fails. A frozen engine refuses all submissions and
//! advances until an administrator unfreezes it with a justification.
//!
//! ```no_run
//! use claimline_engine::{EngineConfig, FnTransform, PipelineEngine, StageDefinition};
//!
//! # async fn demo() -> Result<(), claimline_engine::PipelineError> {
//! let engine = PipelineEngine::builder(EngineConfig::default())
//!     .stage(
//!         StageDefinition::builder("analyze")
//!             .transform(FnTransform::new(|content| Ok(content)))
//!             .build()?,
//!     )
//!     .build()
//!     .await?;
//!
//! let id = engine.submit(serde_json::json!({"headline": "Budget vote"})).await?;
//! let status = engine.advance(id).await?;
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod config;
pub mod engine;
pub mod error;
pub mod runner;
pub mod stage;
pub mod store;
pub mod supervisor;
pub mod transform;

pub use adapters::{
    AdapterError, JsonFileFeed, JsonlSink, LogSink, MemorySink, Publication, PublicationSink,
    SourceFeed,
};
pub use config::{EngineConfig, StorageConfig, SupervisorConfig};
pub use engine::{PipelineEngine, PipelineEngineBuilder};
pub use error::{PipelineError, Result, StoreError, SupervisorError};
pub use runner::{StageRun, StageRunner};
pub use stage::{StageDefinition, StageDefinitionBuilder};
pub use store::{open_store, EngineStore, FileStore, LoadedItems, MemoryStore, UnreadableItem};
pub use supervisor::{
    ControlEvent, ControlEventKind, ControlSnapshot, DriftSupervisor, HealthCounters,
    HealthSnapshot, HealthViolation, ViolationKind,
};
pub use transform::{FnTransform, Transform, TransformError};
