//! Batched dispatch of raw-record notifications to ingestion workflows.
//!
//! Producers announce every uploaded raw record with a
//! [`RecordNotification`]. The [`IngestDispatcher`] takes a window of them,
//! checks each against the [`ArchiveMap`], and sets rejected records aside
//! under `state/ingest/invalid/`. Valid records are grouped by app and study,
//! and each group starts a single run of its workflow with the whole group in
//! the [`MESSAGES_PROPERTY`] run property.
//!
//! A record that belongs to several studies is dispatched once per study.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lakeshift_catalog::{AppVersion, ClientInfo};
use lakeshift_core::document::DocumentStore;
use lakeshift_core::{RunId, StorageBackend, paths};

use crate::error::{ErrorKind, Result};
use crate::jobs::{FireOutcome, JobController, MESSAGES_PROPERTY};

/// Where a raw record was uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Bucket holding the record archive.
    pub source_bucket: String,
    /// Key of the record archive.
    pub source_key: String,
    /// Folder of the upload in the producer's data store.
    pub raw_folder_id: String,
}

/// An assessment and revision that produced a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentRef {
    /// Assessment identifier.
    pub assessment_id: String,
    /// Assessment revision.
    pub revision: u32,
}

/// Announcement of one uploaded raw record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordNotification {
    /// Producer-assigned record id.
    pub record_id: String,
    /// App that uploaded the record.
    pub app_id: String,
    /// Studies the record belongs to.
    pub study_ids: Vec<String>,
    /// Raw client-info metadata of the upload.
    pub client_info: String,
    /// Assessment that produced the record.
    pub assessment: AssessmentRef,
    /// File names inside the record archive.
    pub files: Vec<String>,
    /// Upload location.
    pub record: RawRecord,
}

/// One entry of a batched run's [`MESSAGES_PROPERTY`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestMessage {
    /// Upload location.
    #[serde(flatten)]
    pub record: RawRecord,
    /// Producer-assigned record id.
    pub record_id: String,
    /// App version parsed from the client info.
    pub app_version: AppVersion,
}

/// Files of one assessment revision that have a JSON schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentFiles {
    /// The assessment.
    #[serde(flatten)]
    pub assessment: AssessmentRef,
    /// File names with a schema.
    pub files: BTreeSet<String>,
}

/// App-specific files, allowed only for the assessments the app lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppFiles {
    /// App identifier.
    pub app_id: String,
    /// Assessments whose records may carry these files.
    #[serde(default)]
    pub assessments: Vec<AssessmentRef>,
    /// File names with a schema.
    #[serde(default)]
    pub files: BTreeSet<String>,
}

/// Which files of a raw record have a known JSON schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveMap {
    /// Files scoped to one assessment revision.
    #[serde(default)]
    pub assessments: Vec<AssessmentFiles>,
    /// Files scoped to an app.
    #[serde(default)]
    pub apps: Vec<AppFiles>,
    /// Files valid in any record.
    #[serde(default)]
    pub any_of: BTreeSet<String>,
}

impl ArchiveMap {
    /// Returns true when `file` of a record from `app_id` and `assessment`
    /// has a schema. Assessment files are checked first, then the app's
    /// files, then the global ones.
    #[must_use]
    pub fn covers(&self, app_id: &str, assessment: &AssessmentRef, file: &str) -> bool {
        let by_assessment = self
            .assessments
            .iter()
            .any(|a| a.assessment == *assessment && a.files.contains(file));
        let by_app = || {
            self.apps.iter().any(|app| {
                app.app_id == app_id
                    && app.assessments.contains(assessment)
                    && app.files.contains(file)
            })
        };
        by_assessment || by_app() || self.any_of.contains(file)
    }
}

/// A raw record set aside at dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidRecord {
    /// Producer-assigned record id.
    pub record_id: String,
    /// App that uploaded the record.
    pub app_id: String,
    /// Upload location.
    pub record: RawRecord,
    /// Rejection reasons keyed by file name, or by `clientInfo` / `studyIds`.
    pub errors: BTreeMap<String, String>,
    /// First rejection time.
    pub rejected_at: DateTime<Utc>,
}

/// What happened to one (app, study) batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Runs were started.
    Started(Vec<RunId>),
    /// The workflow's trigger is paused.
    Skipped,
    /// The workflow could not be fired.
    Failed {
        /// Classification of the failure.
        kind: ErrorKind,
        /// Failure message.
        message: String,
    },
}

/// A batch sent to one workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchedBatch {
    /// Target workflow.
    pub workflow: String,
    /// Records in the batch.
    pub records: usize,
    /// Result of firing the workflow.
    pub outcome: BatchOutcome,
}

/// Result of [`IngestDispatcher::dispatch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// One entry per (app, study) pair, in app then study order.
    pub batches: Vec<DispatchedBatch>,
    /// Ids of the records set aside.
    pub invalid: Vec<String>,
}

/// Name of the ingestion workflow of a study.
#[must_use]
pub fn ingest_workflow(namespace: &str, app: &str, study: &str) -> String {
    format!("{namespace}-{app}-{study}-ingest")
}

/// Validates and batches raw-record notifications into workflow runs.
#[derive(Debug, Clone)]
pub struct IngestDispatcher {
    jobs: JobController,
    docs: DocumentStore,
    archive_map: ArchiveMap,
    namespace: String,
}

impl IngestDispatcher {
    /// Creates a dispatcher over the same state the orchestrator uses.
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        archive_map: ArchiveMap,
        namespace: impl Into<String>,
    ) -> Self {
        let docs = DocumentStore::new(storage);
        Self {
            jobs: JobController::new(docs.clone()),
            docs,
            archive_map,
            namespace: namespace.into(),
        }
    }

    /// Dispatches a window of notifications.
    ///
    /// Invalid records are stored under `state/ingest/invalid/` and left out
    /// of every batch. A record repeated within the window is batched once.
    /// A batch whose workflow cannot be fired is reported as
    /// [`BatchOutcome::Failed`] without stopping the others.
    ///
    /// # Errors
    ///
    /// Returns an invalid-input error, before anything is fired, if a
    /// record id is not a valid path segment, and a storage error if an
    /// invalid record cannot be stored.
    #[tracing::instrument(
        skip_all,
        fields(namespace = %self.namespace, notifications = notifications.len())
    )]
    pub async fn dispatch(&self, notifications: &[RecordNotification]) -> Result<DispatchReport> {
        for notification in notifications {
            paths::validate_segment("record", &notification.record_id)?;
        }

        let mut report = DispatchReport::default();
        let mut batches: BTreeMap<(&str, &str), Vec<IngestMessage>> = BTreeMap::new();
        for notification in notifications {
            let message = match self.validate(notification) {
                Ok(message) => message,
                Err(errors) => {
                    self.set_aside(notification, errors).await?;
                    if !report.invalid.contains(&notification.record_id) {
                        report.invalid.push(notification.record_id.clone());
                    }
                    continue;
                }
            };
            for study in &notification.study_ids {
                let key = (notification.app_id.as_str(), study.as_str());
                let batch = batches.entry(key).or_default();
                if !batch.iter().any(|m| m.record_id == message.record_id) {
                    batch.push(message.clone());
                }
            }
        }

        for ((app, study), messages) in batches {
            let workflow = ingest_workflow(&self.namespace, app, study);
            let outcome = match self.jobs.fire_batch(&workflow, &messages).await {
                Ok(FireOutcome::Started(runs)) => {
                    BatchOutcome::Started(runs.into_iter().map(|run| run.run_id).collect())
                }
                Ok(FireOutcome::Skipped { .. }) => BatchOutcome::Skipped,
                Err(err) => {
                    tracing::warn!(%workflow, error = %err, "batch not dispatched");
                    BatchOutcome::Failed {
                        kind: err.kind(),
                        message: err.to_string(),
                    }
                }
            };
            tracing::info!(%workflow, records = messages.len(), ?outcome, "batch dispatched");
            report.batches.push(DispatchedBatch {
                workflow,
                records: messages.len(),
                outcome,
            });
        }
        Ok(report)
    }

    /// Returns a record set aside earlier, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    pub async fn invalid_record(&self, record_id: &str) -> Result<Option<InvalidRecord>> {
        paths::validate_segment("record", record_id)?;
        Ok(self
            .docs
            .load::<InvalidRecord>(&paths::invalid_record(record_id))
            .await?
            .map(|doc| doc.value))
    }

    fn validate(
        &self,
        notification: &RecordNotification,
    ) -> std::result::Result<IngestMessage, BTreeMap<String, String>> {
        let mut errors = BTreeMap::new();

        let app_version = match ClientInfo::parse(&notification.client_info) {
            Ok(info) => Some(info.app_version),
            Err(err) => {
                errors.insert("clientInfo".to_string(), err.to_string());
                None
            }
        };
        if notification.study_ids.is_empty() {
            errors.insert("studyIds".to_string(), "record belongs to no study".to_string());
        }
        for file in &notification.files {
            let assessment = &notification.assessment;
            if !self.archive_map.covers(&notification.app_id, assessment, file) {
                errors.insert(
                    file.clone(),
                    format!(
                        "no schema for {} revision {}",
                        assessment.assessment_id, assessment.revision
                    ),
                );
            }
        }

        match app_version {
            Some(app_version) if errors.is_empty() => Ok(IngestMessage {
                record: notification.record.clone(),
                record_id: notification.record_id.clone(),
                app_version,
            }),
            _ => Err(errors),
        }
    }

    /// Stores a rejected record. A redelivered rejection keeps the first one.
    async fn set_aside(
        &self,
        notification: &RecordNotification,
        errors: BTreeMap<String, String>,
    ) -> Result<()> {
        let invalid = InvalidRecord {
            record_id: notification.record_id.clone(),
            app_id: notification.app_id.clone(),
            record: notification.record.clone(),
            errors,
            rejected_at: Utc::now(),
        };
        let path = paths::invalid_record(&notification.record_id);
        if self.docs.create(&path, &invalid).await?.is_some() {
            tracing::warn!(
                record_id = %invalid.record_id,
                errors = ?invalid.errors,
                "raw record set aside"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lakeshift_core::MemoryBackend;

    const NAMESPACE: &str = "lake";

    fn assessment() -> AssessmentRef {
        AssessmentRef {
            assessment_id: "weather-survey".into(),
            revision: 2,
        }
    }

    fn archive_map() -> ArchiveMap {
        ArchiveMap {
            assessments: vec![AssessmentFiles {
                assessment: assessment(),
                files: BTreeSet::from(["observations.json".to_string()]),
            }],
            apps: vec![AppFiles {
                app_id: "weather".into(),
                assessments: vec![assessment()],
                files: BTreeSet::from(["station.json".to_string()]),
            }],
            any_of: BTreeSet::from(["metadata.json".to_string()]),
        }
    }

    fn notification(id: &str, studies: &[&str], files: &[&str]) -> RecordNotification {
        RecordNotification {
            record_id: id.into(),
            app_id: "weather".into(),
            study_ids: studies.iter().map(|s| (*s).to_string()).collect(),
            client_info: "appName=weather, appVersion=27, osName=Android".into(),
            assessment: assessment(),
            files: files.iter().map(|f| (*f).to_string()).collect(),
            record: RawRecord {
                source_bucket: "uploads".into(),
                source_key: format!("raw/{id}.zip"),
                raw_folder_id: "folder-1".into(),
            },
        }
    }

    async fn setup(studies: &[&str]) -> (IngestDispatcher, JobController) {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let dispatcher = IngestDispatcher::new(storage, archive_map(), NAMESPACE);
        let jobs = dispatcher.jobs.clone();
        for study in studies {
            let workflow = ingest_workflow(NAMESPACE, "weather", study);
            let job = format!("{study}-json-to-parquet");
            jobs.register_workflow(&workflow).await.expect("workflow");
            jobs.create_job(&job, BTreeMap::new(), None).await.expect("job");
            jobs.bind_job_to_workflow(&job, &workflow).await.expect("bind");
        }
        (dispatcher, jobs)
    }

    async fn batch_of(jobs: &JobController, study: &str) -> Vec<IngestMessage> {
        let run = jobs
            .active_run(&format!("{study}-json-to-parquet"))
            .await
            .expect("read")
            .expect("run started");
        serde_json::from_str(&run.run_properties[MESSAGES_PROPERTY]).expect("messages")
    }

    #[test]
    fn archive_map_lookup_order() {
        let map = archive_map();
        let other = AssessmentRef {
            assessment_id: "sleep-diary".into(),
            revision: 1,
        };

        assert!(map.covers("weather", &assessment(), "observations.json"));
        assert!(map.covers("weather", &assessment(), "station.json"));
        assert!(map.covers("tides", &other, "metadata.json"));
        // App files only apply to the assessments the app lists.
        assert!(!map.covers("weather", &other, "station.json"));
        assert!(!map.covers("tides", &assessment(), "station.json"));
        assert!(!map.covers("weather", &assessment(), "unknown.json"));
    }

    #[tokio::test]
    async fn valid_records_batch_per_study() {
        let (dispatcher, jobs) = setup(&["study-a", "study-b"]).await;
        let files = ["observations.json", "metadata.json"];
        let window = [
            notification("rec-1", &["study-a", "study-b"], &files),
            notification("rec-2", &["study-a"], &files),
            notification("rec-2", &["study-a"], &files),
        ];

        let report = dispatcher.dispatch(&window).await.expect("dispatch");
        assert!(report.invalid.is_empty());
        assert_eq!(report.batches.len(), 2);
        assert_eq!(report.batches[0].workflow, "lake-weather-study-a-ingest");
        assert_eq!(report.batches[0].records, 2);
        assert_eq!(report.batches[1].records, 1);
        assert!(report.batches.iter().all(|b| matches!(b.outcome, BatchOutcome::Started(_))));

        let batch = batch_of(&jobs, "study-a").await;
        let ids: Vec<&str> = batch.iter().map(|m| m.record_id.as_str()).collect();
        assert_eq!(ids, ["rec-1", "rec-2"]);
        assert_eq!(batch[0].record.source_key, "raw/rec-1.zip");
        assert_eq!(batch[0].app_version, "27".parse::<AppVersion>().expect("version"));
        assert_eq!(batch_of(&jobs, "study-b").await.len(), 1);
    }

    #[tokio::test]
    async fn messages_property_uses_flat_snake_case_entries() {
        let (dispatcher, jobs) = setup(&["study-a"]).await;
        dispatcher
            .dispatch(&[notification("rec-1", &["study-a"], &["metadata.json"])])
            .await
            .expect("dispatch");

        let run = jobs
            .active_run("study-a-json-to-parquet")
            .await
            .expect("read")
            .expect("run");
        let raw: serde_json::Value =
            serde_json::from_str(&run.run_properties[MESSAGES_PROPERTY]).expect("json");
        assert_eq!(
            raw,
            serde_json::json!([{
                "source_bucket": "uploads",
                "source_key": "raw/rec-1.zip",
                "raw_folder_id": "folder-1",
                "record_id": "rec-1",
                "app_version": "27",
            }])
        );
    }

    #[tokio::test]
    async fn invalid_records_are_set_aside_once() {
        let (dispatcher, jobs) = setup(&["study-a"]).await;
        let mut unreadable = notification("rec-3", &["study-a"], &["metadata.json"]);
        unreadable.client_info = "osName=iOS".into();
        let window = [
            notification("rec-1", &["study-a"], &["metadata.json"]),
            notification("rec-2", &["study-a"], &["metadata.json", "unknown.json"]),
            unreadable,
        ];

        let report = dispatcher.dispatch(&window).await.expect("dispatch");
        assert_eq!(report.invalid, ["rec-2", "rec-3"]);
        assert_eq!(report.batches.len(), 1);
        assert_eq!(report.batches[0].records, 1);
        assert_eq!(batch_of(&jobs, "study-a").await[0].record_id, "rec-1");

        let rejected = dispatcher
            .invalid_record("rec-2")
            .await
            .expect("read")
            .expect("set aside");
        assert_eq!(rejected.errors.keys().collect::<Vec<_>>(), ["unknown.json"]);
        let unreadable = dispatcher
            .invalid_record("rec-3")
            .await
            .expect("read")
            .expect("set aside");
        assert!(unreadable.errors.contains_key("clientInfo"));
        assert_eq!(dispatcher.invalid_record("rec-1").await.expect("read"), None);

        // Redelivery keeps the first rejection.
        let again = dispatcher.dispatch(&window[1..2]).await.expect("redeliver");
        assert_eq!(again.invalid, ["rec-2"]);
        let kept = dispatcher
            .invalid_record("rec-2")
            .await
            .expect("read")
            .expect("set aside");
        assert_eq!(kept.rejected_at, rejected.rejected_at);
    }

    #[tokio::test]
    async fn unfireable_batch_does_not_stop_the_rest() {
        let (dispatcher, jobs) = setup(&["study-a"]).await;
        jobs.register_workflow("lake-weather-study-p-ingest").await.expect("workflow");
        jobs.pause_trigger("lake-weather-study-p-ingest").await.expect("pause");
        let window = [notification(
            "rec-1",
            &["study-a", "study-p", "study-z"],
            &["metadata.json"],
        )];

        let report = dispatcher.dispatch(&window).await.expect("dispatch");
        let outcomes: Vec<_> = report.batches.iter().map(|b| &b.outcome).collect();
        assert!(matches!(outcomes[0], BatchOutcome::Started(runs) if runs.len() == 1));
        assert_eq!(outcomes[1], &BatchOutcome::Skipped);
        assert!(matches!(
            outcomes[2],
            BatchOutcome::Failed { kind: ErrorKind::WorkflowNotFound, .. }
        ));
    }

    #[tokio::test]
    async fn bad_record_id_fires_nothing() {
        let (dispatcher, jobs) = setup(&["study-a"]).await;
        let window = [
            notification("rec-1", &["study-a"], &["metadata.json"]),
            notification("../rec-2", &["study-a"], &["metadata.json"]),
        ];

        let err = dispatcher.dispatch(&window).await.expect_err("rejected");
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(jobs.active_run("study-a-json-to-parquet").await.expect("read"), None);
    }
}
