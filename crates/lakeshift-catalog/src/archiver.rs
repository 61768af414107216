//! Relocation of dataset artifacts into the archive namespace.
//!
//! Archiving a dataset version moves every object under its storage location
//! into a fresh slot `{archive_root}/{family}_{version}_{slot}/`. Slots are
//! numbered from the durable bookkeeping, never from a directory scan:
//!
//! 1. Load existing intents and records of `(family, version)`
//! 2. If a record already covers the current update, return it
//! 3. If an intent for the current update has no record yet, resume it
//! 4. Otherwise take slot `1 + max(slot)`, check it is empty, and write an
//!    intent (`DoesNotExist`) listing the artifacts to move
//! 5. Move each artifact (copy with `DoesNotExist`, then delete the source)
//! 6. Write the write-once [`ArchiveRecord`]
//!
//! Intents are never deleted, so a slot number is never handed out twice even
//! if its move was abandoned.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lakeshift_core::document::DocumentStore;
use lakeshift_core::paths;
use lakeshift_core::storage::{self, MoveOutcome, StorageBackend};

use crate::dataset::DatasetVersion;
use crate::error::{CatalogError, Result};

/// Durable record of a completed archive move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRecord {
    /// Dataset family.
    pub family: String,
    /// Archived dataset version.
    pub dataset_version: u32,
    /// Update number of the dataset when it was archived.
    pub update_number: u32,
    /// Slot number within `(family, dataset_version)`.
    pub slot: u32,
    /// Storage location the artifacts were moved from.
    pub original_location: String,
    /// Archive location the artifacts were moved to.
    pub archive_location: String,
    /// Artifact paths relative to both locations.
    pub artifacts: Vec<String>,
    /// When the move completed.
    pub archived_at: DateTime<Utc>,
}

/// Durable plan of a move, written before the first artifact is touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveIntent {
    /// Dataset family.
    pub family: String,
    /// Dataset version being archived.
    pub dataset_version: u32,
    /// Update number being archived.
    pub update_number: u32,
    /// Reserved slot.
    pub slot: u32,
    /// Source location.
    pub original_location: String,
    /// Target location.
    pub archive_location: String,
    /// Artifact paths relative to both locations.
    pub artifacts: Vec<String>,
    /// When the slot was reserved.
    pub created_at: DateTime<Utc>,
}

/// Archive location of a slot, e.g. `archive/weather_1_3/`.
#[must_use]
pub fn slot_location(archive_root: &str, family: &str, version: u32, slot: u32) -> String {
    paths::as_prefix(&format!(
        "{}/{family}_{version}_{slot}",
        archive_root.trim_end_matches('/')
    ))
}

/// Moves dataset artifacts into numbered archive slots.
pub struct DatasetArchiver {
    docs: DocumentStore,
    storage: Arc<dyn StorageBackend>,
    archive_root: String,
}

impl std::fmt::Debug for DatasetArchiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetArchiver")
            .field("archive_root", &self.archive_root)
            .finish_non_exhaustive()
    }
}

impl DatasetArchiver {
    /// Creates an archiver writing slots under `archive_root`.
    #[must_use]
    pub fn new(docs: DocumentStore, archive_root: impl Into<String>) -> Self {
        Self {
            storage: Arc::clone(docs.storage()),
            docs,
            archive_root: archive_root.into(),
        }
    }

    /// Archives the artifacts of a dataset version in its current update.
    ///
    /// Safe to re-invoke after any failure: a completed archive is returned as
    /// is, and an interrupted one resumes in its reserved slot.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::ArchiveCollision`] when the next slot holds foreign
    ///   data or another archiver reserved it concurrently
    /// - [`CatalogError::PartialMoveFailure`] when storage fails mid-move
    /// - [`CatalogError::ArtifactMissing`] when a planned artifact vanished
    #[tracing::instrument(
        skip(self, dataset),
        fields(family = %dataset.family, version = dataset.version, update = dataset.update_number)
    )]
    pub async fn archive(&self, dataset: &DatasetVersion) -> Result<ArchiveRecord> {
        let records = self.records(&dataset.family, dataset.version).await?;
        let done = records
            .iter()
            .find(|r| covers(dataset, r.update_number, &r.original_location));
        if let Some(done) = done {
            tracing::debug!(slot = done.slot, "dataset already archived");
            return Ok(done.clone());
        }

        let intents = self.intents(&dataset.family, dataset.version).await?;
        let pending = intents
            .iter()
            .find(|i| covers(dataset, i.update_number, &i.original_location))
            .cloned();

        let intent = match pending {
            Some(intent) => {
                tracing::info!(slot = intent.slot, "resuming interrupted archive move");
                intent
            }
            None => {
                let next_slot = records
                    .iter()
                    .map(|r| r.slot)
                    .chain(intents.iter().map(|i| i.slot))
                    .max()
                    .unwrap_or(0)
                    + 1;
                self.reserve(dataset, next_slot).await?
            }
        };

        self.execute(&intent).await
    }

    /// Returns the archive records of a dataset version, ordered by slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be read.
    pub async fn records(&self, family: &str, version: u32) -> Result<Vec<ArchiveRecord>> {
        let mut records: Vec<ArchiveRecord> = self
            .docs
            .load_prefix::<ArchiveRecord>(&paths::archive_records_prefix(family, version))
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect();
        records.sort_by_key(|r| r.slot);
        Ok(records)
    }

    async fn intents(&self, family: &str, version: u32) -> Result<Vec<ArchiveIntent>> {
        Ok(self
            .docs
            .load_prefix::<ArchiveIntent>(&paths::archive_intents_prefix(family, version))
            .await?
            .into_iter()
            .map(|(_, intent)| intent)
            .collect())
    }

    async fn reserve(&self, dataset: &DatasetVersion, slot: u32) -> Result<ArchiveIntent> {
        let archive_location =
            slot_location(&self.archive_root, &dataset.family, dataset.version, slot);

        if storage::prefix_occupied(self.storage.as_ref(), &archive_location).await? {
            crate::metrics::record_archive_outcome("collision");
            return Err(CatalogError::ArchiveCollision {
                slot: archive_location,
                message: "slot holds objects without an archive intent".into(),
            });
        }

        let source = paths::as_prefix(&dataset.storage_location);
        let mut artifacts: Vec<String> = self
            .storage
            .list(&source)
            .await?
            .into_iter()
            .filter_map(|meta| meta.path.strip_prefix(&source).map(str::to_string))
            .collect();
        artifacts.sort();

        let intent = ArchiveIntent {
            family: dataset.family.clone(),
            dataset_version: dataset.version,
            update_number: dataset.update_number,
            slot,
            original_location: source,
            archive_location,
            artifacts,
            created_at: Utc::now(),
        };

        let path = paths::archive_intent(&dataset.family, dataset.version, slot);
        if self.docs.create(&path, &intent).await?.is_none() {
            crate::metrics::record_archive_outcome("collision");
            return Err(CatalogError::ArchiveCollision {
                slot: intent.archive_location,
                message: "slot reserved concurrently by another archiver".into(),
            });
        }

        tracing::info!(
            slot,
            artifacts = intent.artifacts.len(),
            target = %intent.archive_location,
            "reserved archive slot"
        );
        Ok(intent)
    }

    async fn execute(&self, intent: &ArchiveIntent) -> Result<ArchiveRecord> {
        let total = intent.artifacts.len();

        for (moved, artifact) in intent.artifacts.iter().enumerate() {
            let src = format!("{}{artifact}", intent.original_location);
            let dst = format!("{}{artifact}", intent.archive_location);

            match storage::move_object(self.storage.as_ref(), &src, &dst).await {
                Ok(MoveOutcome::Moved | MoveOutcome::AlreadyMoved) => {
                    crate::metrics::record_artifact_moved(&intent.family);
                }
                Ok(MoveOutcome::DestinationConflict) => {
                    crate::metrics::record_archive_outcome("collision");
                    return Err(CatalogError::ArchiveCollision {
                        slot: intent.archive_location.clone(),
                        message: format!("{dst} holds different content"),
                    });
                }
                Err(lakeshift_core::Error::NotFound(_)) => {
                    crate::metrics::record_archive_outcome("artifact_missing");
                    return Err(CatalogError::ArtifactMissing { path: src });
                }
                Err(e) => {
                    crate::metrics::record_archive_outcome("partial");
                    tracing::warn!(moved, total, error = %e, "archive move interrupted");
                    return Err(CatalogError::PartialMoveFailure {
                        slot: intent.archive_location.clone(),
                        moved,
                        total,
                        message: e.to_string(),
                    });
                }
            }
        }

        let record = ArchiveRecord {
            family: intent.family.clone(),
            dataset_version: intent.dataset_version,
            update_number: intent.update_number,
            slot: intent.slot,
            original_location: intent.original_location.clone(),
            archive_location: intent.archive_location.clone(),
            artifacts: intent.artifacts.clone(),
            archived_at: Utc::now(),
        };

        let path = paths::archive_record(&intent.family, intent.dataset_version, intent.slot);
        if self.docs.create(&path, &record).await?.is_none() {
            // Another invocation finished the same intent first.
            if let Some(existing) = self.docs.load::<ArchiveRecord>(&path).await? {
                return Ok(existing.value);
            }
        }

        crate::metrics::record_archive_outcome("archived");
        tracing::info!(
            slot = record.slot,
            artifacts = total,
            target = %record.archive_location,
            "archived dataset"
        );
        Ok(record)
    }
}

fn covers(dataset: &DatasetVersion, update_number: u32, original_location: &str) -> bool {
    update_number == dataset.update_number
        && original_location == paths::as_prefix(&dataset.storage_location)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, FieldSpec, SchemaDescription};
    use bytes::Bytes;
    use lakeshift_core::storage::{MemoryBackend, WritePrecondition};
    use std::collections::BTreeSet;

    fn dataset() -> DatasetVersion {
        let schema = SchemaDescription::new(
            "weather",
            1,
            vec![FieldSpec::nullable("temp", DataType::Double)],
        )
        .expect("valid");
        DatasetVersion::initial("datasets", schema)
    }

    async fn seed(backend: &MemoryBackend, paths: &[&str]) {
        for path in paths {
            backend
                .put(path, Bytes::from(path.to_string()), WritePrecondition::None)
                .await
                .expect("seed");
        }
    }

    fn archiver(backend: &MemoryBackend) -> DatasetArchiver {
        DatasetArchiver::new(DocumentStore::new(Arc::new(backend.clone())), "archive")
    }

    async fn names_under(backend: &MemoryBackend, prefix: &str) -> BTreeSet<String> {
        backend
            .list(prefix)
            .await
            .expect("list")
            .into_iter()
            .filter_map(|m| m.path.strip_prefix(prefix).map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn archive_moves_every_artifact() {
        let backend = MemoryBackend::new();
        seed(
            &backend,
            &[
                "datasets/weather_v1/part-0.parquet",
                "datasets/weather_v1/part-1.parquet",
                "datasets/weather_v1/dt=2024-01-01/part-2.parquet",
            ],
        )
        .await;
        let before = names_under(&backend, "datasets/weather_v1/").await;

        let record = archiver(&backend).archive(&dataset()).await.expect("archive");
        assert_eq!(record.slot, 1);
        assert_eq!(record.archive_location, "archive/weather_1_1/");
        assert!(names_under(&backend, "datasets/weather_v1/").await.is_empty());
        assert_eq!(names_under(&backend, "archive/weather_1_1/").await, before);
    }

    #[tokio::test]
    async fn archive_twice_returns_same_record() {
        let backend = MemoryBackend::new();
        seed(&backend, &["datasets/weather_v1/part-0.parquet"]).await;
        let archiver = archiver(&backend);

        let first = archiver.archive(&dataset()).await.expect("archive");
        let second = archiver.archive(&dataset()).await.expect("archive again");
        assert_eq!(first, second);
        assert_eq!(archiver.records("weather", 1).await.expect("records").len(), 1);
    }

    #[tokio::test]
    async fn slots_increase_per_update() {
        let backend = MemoryBackend::new();
        let archiver = archiver(&backend);
        let mut current = dataset();

        for expected_slot in 1..=3 {
            seed(&backend, &["datasets/weather_v1/part-0.parquet"]).await;
            let record = archiver.archive(&current).await.expect("archive");
            assert_eq!(record.slot, expected_slot);
            current = current.with_update(current.current_schema.clone());
        }
    }

    #[tokio::test]
    async fn foreign_data_in_slot_is_a_collision() {
        let backend = MemoryBackend::new();
        seed(
            &backend,
            &[
                "datasets/weather_v1/part-0.parquet",
                "archive/weather_1_1/stray.parquet",
            ],
        )
        .await;

        let result = archiver(&backend).archive(&dataset()).await;
        assert!(matches!(result, Err(CatalogError::ArchiveCollision { .. })));
        // Nothing was moved.
        assert_eq!(names_under(&backend, "datasets/weather_v1/").await.len(), 1);
    }

    #[tokio::test]
    async fn empty_dataset_archives_to_empty_record() {
        let backend = MemoryBackend::new();
        let record = archiver(&backend).archive(&dataset()).await.expect("archive");
        assert!(record.artifacts.is_empty());
    }

    #[tokio::test]
    async fn vanished_artifact_is_reported() {
        let backend = MemoryBackend::new();
        seed(&backend, &["datasets/weather_v1/part-0.parquet"]).await;
        let archiver = archiver(&backend);

        // Reserve the slot, then lose the artifact before the move runs.
        let intent = archiver.reserve(&dataset(), 1).await.expect("reserve");
        backend
            .delete("datasets/weather_v1/part-0.parquet")
            .await
            .expect("delete");

        assert!(matches!(
            archiver.execute(&intent).await,
            Err(CatalogError::ArtifactMissing { .. })
        ));
    }
}
