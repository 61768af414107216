//! # lakeshift-flow
//!
//! Orchestration of schema changes for a JSON-to-Parquet ingestion pipeline.
//!
//! A detected schema change is submitted to the [`SchemaChangeOrchestrator`],
//! which classifies it, optionally trial-runs the transform job in a sandbox
//! with the [`CompatibilityTester`], and then runs one of two checkpointed
//! procedures:
//!
//! - **Compatible**: pause triggers, map the new app version to the same
//!   dataset with a bumped update number, archive the current artifacts,
//!   publish the new schema, reset the job checkpoint, resume triggers.
//! - **Incompatible**: pause triggers, map the new app version to a forked
//!   dataset version, register its location with discovery, create and bind
//!   its ingestion job, resume triggers.
//!
//! Raw-record notifications reach the ingestion workflows through the
//! [`IngestDispatcher`], which sets invalid records aside and starts one
//! batched run per app and study.
//!
//! Progress is persisted after every step. A crash or failure leaves the flow
//! at a known step, and `resume` continues from there without duplicating
//! mapping entries, archive moves, or jobs.
//!
//! ## Storage Layout
//!
//! ```text
//! state/
//! ├── locks/families/{family}.lock.json
//! ├── flows/{flow_id}.json
//! ├── flows/{flow_id}.cancel.json
//! ├── flows/by-family/{family}.json
//! ├── jobs/{job}.json
//! ├── workflows/{workflow}.json
//! ├── checkpoints/{job}.json
//! ├── runs/{active,history}/...
//! └── ingest/invalid/{record}.json
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use lakeshift_flow::prelude::*;
//!
//! let orchestrator = SchemaChangeOrchestrator::new(storage, runner, discovery, config);
//! let report = orchestrator
//!     .submit(SchemaChangeRequest::new(
//!         "weather",
//!         "2.0".parse()?,
//!         CandidateSource::Provided(candidate),
//!         "weather-json-to-parquet",
//!     ))
//!     .await?;
//! if let FlowState::Failed { step, error } = &report.state {
//!     eprintln!("halted at {step}: {}", error.message);
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod collaborators;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod flow;
pub mod jobs;
pub mod metrics;
pub mod orchestrator;
pub mod store;
pub mod tester;

pub use collaborators::{SchemaDiscovery, TransformJobRunner, TransformOutcome};
pub use config::OrchestratorConfig;
pub use dispatch::{
    ArchiveMap, BatchOutcome, DispatchReport, IngestDispatcher, IngestMessage, RecordNotification,
};
pub use error::{Error, ErrorKind, Result};
pub use flow::{
    Branch, CandidateSource, FlowFailure, FlowRecord, FlowReport, FlowState, FlowStep,
    SchemaChangeRequest,
};
pub use jobs::{
    ActiveRun, CheckpointMarker, FireOutcome, JobCheckpoint, JobController, JobRecord,
    MESSAGES_PROPERTY, RunRecord, TriggerState, WorkflowRecord,
};
pub use orchestrator::SchemaChangeOrchestrator;
pub use store::FlowStore;
pub use tester::{CompatibilityTester, FailReason, SamplePlan, SampleRef, TestVerdict};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::collaborators::{SchemaDiscovery, TransformJobRunner, TransformOutcome};
    pub use crate::config::OrchestratorConfig;
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::flow::{CandidateSource, FlowReport, FlowState, FlowStep, SchemaChangeRequest};
    pub use crate::jobs::{JobController, TriggerState};
    pub use crate::orchestrator::SchemaChangeOrchestrator;
    pub use crate::tester::{SamplePlan, SampleRef, TestVerdict};
}
