//! Test fixtures: a wired orchestrator, schemas, and seeded data.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use lakeshift_catalog::{AppVersion, DataType, DatasetVersion, FieldSpec, SchemaDescription};
use lakeshift_core::StorageBackend;
use lakeshift_flow::{
    CandidateSource, OrchestratorConfig, SampleRef, SamplePlan, SchemaChangeOrchestrator,
    SchemaChangeRequest,
};

use crate::fakes::{FakeDiscovery, ScriptedTransformRunner};
use crate::storage::TracingMemoryBackend;

/// Family used by the fixtures.
pub const FAMILY: &str = "weather";
/// Ingestion job registered for [`FAMILY`].
pub const JOB: &str = "weather-json-to-parquet";
/// Workflow triggering [`JOB`].
pub const WORKFLOW: &str = "weather-ingest";
/// Artifacts seeded into `weather_v1` by [`TestContext::registered`].
pub const V1_ARTIFACTS: [&str; 3] = [
    "part-00000.parquet",
    "part-00001.parquet",
    "year=2024/part-00002.parquet",
];

/// Parses an app version literal.
pub fn app_version(value: &str) -> AppVersion {
    value.parse().expect("valid app version")
}

/// Orchestrator settings with short timeouts and fast polling.
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        lock_ttl: Duration::from_secs(30),
        tester_timeout: Duration::from_secs(2),
        scope_poll_attempts: 5,
        scope_poll_interval: Duration::from_millis(1),
        ..OrchestratorConfig::default()
    }
}

/// The schema `weather_v1` is registered with.
pub fn weather_v1() -> SchemaDescription {
    SchemaDescription::new(
        FAMILY,
        1,
        vec![
            FieldSpec::required("station", DataType::String),
            FieldSpec::nullable("temp", DataType::Double),
            FieldSpec::nullable("observed_at", DataType::Timestamp),
        ],
    )
    .expect("valid schema")
}

/// Adds a nullable field: a compatible change.
pub fn compatible_candidate() -> SchemaDescription {
    let mut schema = weather_v1();
    schema.revision = 2;
    schema
        .fields
        .push(FieldSpec::nullable("humidity", DataType::Double));
    schema
}

/// Retypes `temp` to a string: an incompatible change.
pub fn incompatible_candidate() -> SchemaDescription {
    let mut schema = weather_v1();
    schema.revision = 2;
    schema.fields[1] = FieldSpec::nullable("temp", DataType::String);
    schema
}

/// Tightens `temp` to required: the comparator cannot decide.
pub fn ambiguous_candidate() -> SchemaDescription {
    let mut schema = weather_v1();
    schema.revision = 2;
    schema.fields[1] = FieldSpec::required("temp", DataType::Double);
    schema
}

/// An orchestrator over traced in-memory storage and scripted collaborators.
#[derive(Debug, Clone)]
pub struct TestContext {
    /// Backing storage.
    pub storage: Arc<TracingMemoryBackend>,
    /// Transform engine fake.
    pub runner: Arc<ScriptedTransformRunner>,
    /// Discovery fake.
    pub discovery: Arc<FakeDiscovery>,
    /// The orchestrator under test.
    pub orchestrator: Arc<SchemaChangeOrchestrator>,
}

impl TestContext {
    /// Creates a context with [`test_config`] and no registered family.
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Creates a context with custom settings.
    pub fn with_config(config: OrchestratorConfig) -> Self {
        let storage = Arc::new(TracingMemoryBackend::new());
        let backend: Arc<dyn StorageBackend> = storage.clone();
        let runner = Arc::new(ScriptedTransformRunner::new(Arc::clone(&backend)));
        let discovery = Arc::new(FakeDiscovery::new());
        let orchestrator = Arc::new(SchemaChangeOrchestrator::new(
            backend,
            runner.clone(),
            discovery.clone(),
            config,
        ));
        Self {
            storage,
            runner,
            discovery,
            orchestrator,
        }
    }

    /// Creates a context with [`FAMILY`] registered at app version `1.0` and
    /// [`V1_ARTIFACTS`] seeded into `weather_v1`.
    pub async fn registered() -> Self {
        let ctx = Self::new();
        let dataset = ctx
            .orchestrator
            .register_family(FAMILY, &app_version("1.0"), weather_v1(), JOB, WORKFLOW)
            .await
            .expect("register family");
        ctx.seed_artifacts(&dataset, &V1_ARTIFACTS).await;
        ctx
    }

    /// Writes columnar artifacts into a dataset's location.
    pub async fn seed_artifacts(&self, dataset: &DatasetVersion, artifacts: &[&str]) {
        for artifact in artifacts {
            self.storage
                .seed(
                    &format!("{}{artifact}", dataset.storage_location),
                    Bytes::from(format!("PAR1:{artifact}")),
                )
                .await;
        }
    }

    /// Writes JSON-lines samples and returns a plan covering them.
    ///
    /// Old samples come from app versions `1.0` (two objects) and `1.1`; the
    /// new sample is a backfill written by app version `2.0`.
    pub async fn seed_samples(&self) -> SamplePlan {
        let old = vec![
            self.seed_sample("1.0", "raw/weather/1.0/obs-a.json", 10).await,
            self.seed_sample("1.0", "raw/weather/1.0/obs-b.json", 7).await,
            self.seed_sample("1.1", "raw/weather/1.1/obs-a.json", 20).await,
        ];
        let new = vec![self.seed_sample("2.0", "raw/weather/2.0/backfill.json", 5).await];
        SamplePlan { old, new }
    }

    async fn seed_sample(&self, version: &str, path: &str, records: u64) -> SampleRef {
        let body: String = (0..records)
            .map(|i| {
                let line = serde_json::json!({
                    "station": format!("KSEA-{i}"),
                    "temp": 12.5,
                    "observed_at": "2024-05-01T00:00:00Z",
                });
                format!("{line}\n")
            })
            .collect();
        self.storage.seed(path, body).await;
        SampleRef {
            app_version: app_version(version),
            path: path.to_string(),
            records,
        }
    }

    /// A request for `candidate` at app version `2.0`.
    pub fn request(&self, candidate: SchemaDescription) -> SchemaChangeRequest {
        self.request_at("2.0", candidate)
    }

    /// A request for `candidate` at `version`.
    pub fn request_at(&self, version: &str, candidate: SchemaDescription) -> SchemaChangeRequest {
        SchemaChangeRequest::new(
            FAMILY,
            app_version(version),
            CandidateSource::Provided(candidate),
            JOB,
        )
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
