//! Dataset versions and their registry.
//!
//! A dataset family is materialized as a lineage of dataset versions. The
//! compatible procedure keeps the version and bumps its update number; the
//! incompatible procedure forks version `n + 1` at a fresh storage location.
//! Datasets are never deleted.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use lakeshift_core::document::{DocumentStore, Mutation};
use lakeshift_core::paths;

use crate::error::{CatalogError, Result};
use crate::schema::SchemaDescription;

/// One concrete dataset of a family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetVersion {
    /// Dataset family.
    pub family: String,
    /// Lineage version, starting at 1.
    pub version: u32,
    /// Compatible updates applied to this version, starting at 0.
    pub update_number: u32,
    /// Storage prefix holding the dataset's columnar artifacts.
    pub storage_location: String,
    /// Schema the dataset is currently published with.
    pub current_schema: SchemaDescription,
}

impl DatasetVersion {
    /// The first dataset of a family (`v1`, update 0).
    #[must_use]
    pub fn initial(dataset_root: &str, schema: SchemaDescription) -> Self {
        let family = schema.family.clone();
        Self {
            storage_location: location_for(dataset_root, &family, 1),
            family,
            version: 1,
            update_number: 0,
            current_schema: schema,
        }
    }

    /// The same dataset after a compatible update to `schema`.
    #[must_use]
    pub fn with_update(&self, schema: SchemaDescription) -> Self {
        Self {
            update_number: self.update_number + 1,
            current_schema: schema,
            ..self.clone()
        }
    }

    /// The next dataset version of the lineage, created for `schema`.
    #[must_use]
    pub fn fork(&self, dataset_root: &str, schema: SchemaDescription) -> Self {
        let version = self.version + 1;
        Self {
            family: self.family.clone(),
            version,
            update_number: 0,
            storage_location: location_for(dataset_root, &self.family, version),
            current_schema: schema,
        }
    }

    /// Returns the dataset name, e.g. `weather_v2`.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}_v{}", self.family, self.version)
    }

    /// Orders datasets of one family by `(version, update_number)`.
    #[must_use]
    pub fn lineage_cmp(&self, other: &Self) -> Ordering {
        (self.version, self.update_number).cmp(&(other.version, other.update_number))
    }

    /// Returns true when both values denote the same dataset state.
    #[must_use]
    pub fn same_state(&self, other: &Self) -> bool {
        self.family == other.family
            && self.version == other.version
            && self.update_number == other.update_number
    }
}

/// Storage prefix of a dataset version, e.g. `datasets/weather_v2/`.
#[must_use]
pub fn location_for(dataset_root: &str, family: &str, version: u32) -> String {
    paths::as_prefix(&format!(
        "{}/{family}_v{version}",
        dataset_root.trim_end_matches('/')
    ))
}

/// Durable registry of dataset versions, one record per `(family, version)`.
///
/// The record is the pointer the ingestion job reads its schema from;
/// [`DatasetRegistry::publish_schema`] swaps it atomically.
#[derive(Debug, Clone)]
pub struct DatasetRegistry {
    docs: DocumentStore,
}

impl DatasetRegistry {
    /// Creates a registry over a document store.
    #[must_use]
    pub fn new(docs: DocumentStore) -> Self {
        Self { docs }
    }

    /// Registers a dataset version.
    ///
    /// Registering the same dataset state again returns the stored record.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::DatasetConflict`] if the version is registered
    /// with a different location or update number.
    #[tracing::instrument(
        skip(self, dataset),
        fields(family = %dataset.family, version = dataset.version)
    )]
    pub async fn register(&self, dataset: &DatasetVersion) -> Result<DatasetVersion> {
        paths::validate_segment("family", &dataset.family)?;
        let path = paths::dataset_record(&dataset.family, dataset.version);

        if self.docs.create(&path, dataset).await?.is_some() {
            tracing::info!(location = %dataset.storage_location, "registered dataset version");
            return Ok(dataset.clone());
        }

        let existing = self.get(&dataset.family, dataset.version).await?;
        if existing.storage_location == dataset.storage_location
            && existing.update_number >= dataset.update_number
        {
            Ok(existing)
        } else {
            Err(CatalogError::DatasetConflict {
                family: dataset.family.clone(),
                version: dataset.version,
            })
        }
    }

    /// Loads a dataset version.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::DatasetNotFound`] if it is not registered.
    pub async fn get(&self, family: &str, version: u32) -> Result<DatasetVersion> {
        self.docs
            .load::<DatasetVersion>(&paths::dataset_record(family, version))
            .await?
            .map(|doc| doc.value)
            .ok_or_else(|| CatalogError::DatasetNotFound {
                family: family.to_string(),
                version,
            })
    }

    /// Returns the highest registered version of a family.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read.
    pub async fn latest(&self, family: &str) -> Result<Option<DatasetVersion>> {
        let records = self
            .docs
            .load_prefix::<DatasetVersion>(&paths::dataset_records_prefix(family))
            .await?;
        Ok(records
            .into_iter()
            .map(|(_, dataset)| dataset)
            .max_by_key(|dataset| dataset.version))
    }

    /// Atomically publishes `schema` on a dataset version, moving its update
    /// number from `expected_update` to `expected_update + 1`.
    ///
    /// Re-publishing a swap that already happened returns the stored record.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::StalePublish`] if the record moved to any other
    /// update number, and [`CatalogError::DatasetNotFound`] if the version is
    /// not registered.
    #[tracing::instrument(skip(self, schema))]
    pub async fn publish_schema(
        &self,
        family: &str,
        version: u32,
        expected_update: u32,
        schema: &SchemaDescription,
    ) -> Result<DatasetVersion> {
        let path = paths::dataset_record(family, version);
        let stored = self
            .docs
            .update::<DatasetVersion, CatalogError, _>(&path, |current| {
                let Some(current) = current else {
                    return Err(CatalogError::DatasetNotFound {
                        family: family.to_string(),
                        version,
                    });
                };
                if current.update_number == expected_update + 1
                    && current.current_schema == *schema
                {
                    return Ok(Mutation::Unchanged);
                }
                if current.update_number != expected_update {
                    return Err(CatalogError::StalePublish {
                        family: family.to_string(),
                        version,
                        expected: expected_update,
                        found: current.update_number,
                    });
                }
                Ok(Mutation::Put(current.with_update(schema.clone())))
            })
            .await
            .map_err(CatalogError::from_cas)?;

        stored.ok_or_else(|| CatalogError::DatasetNotFound {
            family: family.to_string(),
            version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, FieldSpec};
    use lakeshift_core::MemoryBackend;
    use std::sync::Arc;

    fn schema(revision: u32) -> SchemaDescription {
        SchemaDescription::new(
            "weather",
            revision,
            vec![FieldSpec::nullable("temp", DataType::Double)],
        )
        .expect("valid")
    }

    fn registry() -> DatasetRegistry {
        DatasetRegistry::new(DocumentStore::new(Arc::new(MemoryBackend::new())))
    }

    #[test]
    fn lineage_transitions() {
        let v1 = DatasetVersion::initial("datasets", schema(1));
        assert_eq!(v1.storage_location, "datasets/weather_v1/");
        assert_eq!(v1.name(), "weather_v1");

        let updated = v1.with_update(schema(2));
        assert_eq!((updated.version, updated.update_number), (1, 1));
        assert_eq!(updated.storage_location, v1.storage_location);

        let v2 = updated.fork("datasets/", schema(3));
        assert_eq!((v2.version, v2.update_number), (2, 0));
        assert_eq!(v2.storage_location, "datasets/weather_v2/");
        assert_eq!(v1.lineage_cmp(&updated), Ordering::Less);
        assert_eq!(updated.lineage_cmp(&v2), Ordering::Less);
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let registry = registry();
        let v1 = DatasetVersion::initial("datasets", schema(1));
        registry.register(&v1).await.expect("register");
        let again = registry.register(&v1).await.expect("register again");
        assert_eq!(again, v1);

        let mut foreign = v1.clone();
        foreign.storage_location = "elsewhere/".into();
        assert!(matches!(
            registry.register(&foreign).await,
            Err(CatalogError::DatasetConflict { .. })
        ));
    }

    #[tokio::test]
    async fn latest_picks_highest_version() {
        let registry = registry();
        let v1 = DatasetVersion::initial("datasets", schema(1));
        let v2 = v1.fork("datasets", schema(2));
        registry.register(&v2).await.expect("register");
        registry.register(&v1).await.expect("register");

        let latest = registry.latest("weather").await.expect("latest");
        assert_eq!(latest.map(|d| d.version), Some(2));
        assert!(registry.latest("tides").await.expect("latest").is_none());
    }

    #[tokio::test]
    async fn publish_schema_swaps_once() {
        let registry = registry();
        let v1 = DatasetVersion::initial("datasets", schema(1));
        registry.register(&v1).await.expect("register");

        let published = registry
            .publish_schema("weather", 1, 0, &schema(2))
            .await
            .expect("publish");
        assert_eq!(published.update_number, 1);
        assert_eq!(published.current_schema.revision, 2);

        // Retrying the same swap is a no-op.
        let again = registry
            .publish_schema("weather", 1, 0, &schema(2))
            .await
            .expect("republish");
        assert_eq!(again, published);

        // A different schema against a moved pointer is stale.
        assert!(matches!(
            registry.publish_schema("weather", 1, 0, &schema(3)).await,
            Err(CatalogError::StalePublish { found: 1, .. })
        ));
    }

    #[tokio::test]
    async fn publish_on_missing_dataset_fails() {
        let registry = registry();
        assert!(matches!(
            registry.publish_schema("weather", 4, 0, &schema(2)).await,
            Err(CatalogError::DatasetNotFound { version: 4, .. })
        ));
    }
}
