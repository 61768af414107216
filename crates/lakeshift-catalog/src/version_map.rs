//! Mapping from producer app versions to dataset versions.
//!
//! For each family the map is a step function: an entry at app version `a`
//! covers every app version from `a` (inclusive) up to the next entry. Entries
//! are kept sorted and strictly increasing, so [`VersionMap::resolve`] is a
//! binary search and the map can only grow at its upper end.
//!
//! Each family is one JSON document updated by compare-and-swap, which
//! serializes concurrent appends to the same family without any lock.

use serde::{Deserialize, Serialize};

use lakeshift_core::document::{DocumentStore, Mutation};
use lakeshift_core::paths;

use crate::app_version::AppVersion;
use crate::dataset::DatasetVersion;
use crate::error::{CatalogError, Result};

/// One step of a family's mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionMapEntry {
    /// Dataset family.
    pub family: String,
    /// Inclusive lower bound of the covered app versions.
    pub app_version: AppVersion,
    /// Dataset the covered app versions are ingested into.
    pub dataset: DatasetVersion,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FamilyMap {
    entries: Vec<VersionMapEntry>,
}

/// Result of [`VersionMap::ensure_entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The entry was added.
    Appended,
    /// An identical entry was already the family's last entry.
    AlreadyPresent,
}

/// Resolves `app_version` against sorted `entries`.
///
/// Returns the entry with the greatest lower bound not above `app_version`.
#[must_use]
pub fn resolve_in<'a>(
    entries: &'a [VersionMapEntry],
    app_version: &AppVersion,
) -> Option<&'a VersionMapEntry> {
    let idx = entries.partition_point(|e| e.app_version <= *app_version);
    idx.checked_sub(1).map(|i| &entries[i])
}

/// Durable per-family version map.
#[derive(Debug, Clone)]
pub struct VersionMap {
    docs: DocumentStore,
}

impl VersionMap {
    /// Creates a version map over a document store.
    #[must_use]
    pub fn new(docs: DocumentStore) -> Self {
        Self { docs }
    }

    /// Returns the entries of a family in app-version order.
    ///
    /// # Errors
    ///
    /// Returns an error if the map cannot be read.
    pub async fn entries(&self, family: &str) -> Result<Vec<VersionMapEntry>> {
        Ok(self
            .docs
            .load::<FamilyMap>(&paths::version_map(family))
            .await?
            .map(|doc| doc.value.entries)
            .unwrap_or_default())
    }

    /// Returns the family's last entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the map cannot be read.
    pub async fn latest(&self, family: &str) -> Result<Option<VersionMapEntry>> {
        Ok(self.entries(family).await?.pop())
    }

    /// Resolves the dataset an app version's records belong to.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::UnmappedAppVersion`] when `app_version` precedes
    /// the earliest entry (or the family has none).
    pub async fn resolve(&self, family: &str, app_version: &AppVersion) -> Result<DatasetVersion> {
        let entries = self.entries(family).await?;
        resolve_in(&entries, app_version)
            .map(|entry| entry.dataset.clone())
            .ok_or_else(|| CatalogError::UnmappedAppVersion {
                family: family.to_string(),
                app_version: app_version.to_string(),
                earliest: entries.first().map(|e| e.app_version.to_string()),
            })
    }

    /// Appends an entry above the family's current maximum.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::OverlapViolation`] unless `app_version` is
    /// strictly greater than every mapped app version.
    #[tracing::instrument(skip(self, dataset), fields(dataset = %dataset.name()))]
    pub async fn append(
        &self,
        family: &str,
        app_version: &AppVersion,
        dataset: &DatasetVersion,
    ) -> Result<VersionMapEntry> {
        self.write_entry(family, app_version, dataset, false)
            .await
            .map(|(entry, _)| entry)
    }

    /// Appends an entry unless the family's last entry is already exactly it.
    ///
    /// This is the check-before-append used by re-entrant callers: a retry
    /// after a crash finds its own entry and does not append twice.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::OverlapViolation`] when the entry is neither
    /// present as the last entry nor strictly above the maximum.
    #[tracing::instrument(skip(self, dataset), fields(dataset = %dataset.name()))]
    pub async fn ensure_entry(
        &self,
        family: &str,
        app_version: &AppVersion,
        dataset: &DatasetVersion,
    ) -> Result<AppendOutcome> {
        self.write_entry(family, app_version, dataset, true)
            .await
            .map(|(_, outcome)| outcome)
    }

    async fn write_entry(
        &self,
        family: &str,
        app_version: &AppVersion,
        dataset: &DatasetVersion,
        accept_existing: bool,
    ) -> Result<(VersionMapEntry, AppendOutcome)> {
        paths::validate_segment("family", family)?;
        if dataset.family != family {
            return Err(CatalogError::InvalidSchema {
                message: format!(
                    "dataset {} does not belong to family {family}",
                    dataset.name()
                ),
            });
        }

        let entry = VersionMapEntry {
            family: family.to_string(),
            app_version: app_version.clone(),
            dataset: dataset.clone(),
        };
        let mut outcome = AppendOutcome::Appended;

        self.docs
            .update::<FamilyMap, CatalogError, _>(&paths::version_map(family), |current| {
                let mut map = current.cloned().unwrap_or_default();
                if let Some(last) = map.entries.last() {
                    if accept_existing
                        && last.app_version == entry.app_version
                        && last.dataset.same_state(&entry.dataset)
                    {
                        outcome = AppendOutcome::AlreadyPresent;
                        return Ok(Mutation::Unchanged);
                    }
                    if entry.app_version <= last.app_version {
                        return Err(CatalogError::OverlapViolation {
                            family: entry.family.clone(),
                            app_version: entry.app_version.to_string(),
                            current_max: last.app_version.to_string(),
                        });
                    }
                }
                outcome = AppendOutcome::Appended;
                map.entries.push(entry.clone());
                Ok(Mutation::Put(map))
            })
            .await
            .map_err(CatalogError::from_cas)?;

        if outcome == AppendOutcome::Appended {
            crate::metrics::record_map_append(family, entry.dataset.version);
            tracing::info!(app_version = %entry.app_version, "appended version map entry");
        }
        Ok((entry, outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, FieldSpec, SchemaDescription};
    use lakeshift_core::MemoryBackend;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn v(s: &str) -> AppVersion {
        s.parse().expect("valid")
    }

    fn dataset(version: u32, update: u32) -> DatasetVersion {
        let schema = SchemaDescription::new(
            "weather",
            version * 10 + update,
            vec![FieldSpec::nullable("temp", DataType::Double)],
        )
        .expect("valid");
        let mut d = DatasetVersion::initial("datasets", schema);
        d.version = version;
        d.update_number = update;
        d
    }

    fn map() -> VersionMap {
        VersionMap::new(DocumentStore::new(Arc::new(MemoryBackend::new())))
    }

    #[tokio::test]
    async fn resolve_follows_step_function() {
        let map = map();
        map.append("weather", &v("1.0"), &dataset(1, 0)).await.expect("a");
        map.append("weather", &v("1.5"), &dataset(1, 1)).await.expect("b");
        map.append("weather", &v("2.0"), &dataset(2, 0)).await.expect("c");

        let at = |s: &'static str| {
            let map = map.clone();
            async move { map.resolve("weather", &v(s)).await.expect("resolve") }
        };
        assert_eq!(at("1.0").await.update_number, 0);
        assert_eq!(at("1.4.9").await.update_number, 0);
        assert_eq!(at("1.5").await.update_number, 1);
        assert_eq!(at("1.9").await.version, 1);
        assert_eq!(at("2.0").await.version, 2);
        assert_eq!(at("17").await.version, 2);
    }

    #[tokio::test]
    async fn resolve_before_earliest_is_unmapped() {
        let map = map();
        map.append("weather", &v("2.0"), &dataset(1, 0)).await.expect("a");

        match map.resolve("weather", &v("1.9")).await {
            Err(CatalogError::UnmappedAppVersion { earliest, .. }) => {
                assert_eq!(earliest.as_deref(), Some("2.0"));
            }
            other => panic!("expected unmapped, got {other:?}"),
        }
        assert!(matches!(
            map.resolve("tides", &v("1")).await,
            Err(CatalogError::UnmappedAppVersion { earliest: None, .. })
        ));
    }

    #[tokio::test]
    async fn append_rejects_non_increasing() {
        let map = map();
        map.append("weather", &v("2.0"), &dataset(1, 0)).await.expect("a");

        for bad in ["2.0", "2", "1.9"] {
            assert!(matches!(
                map.append("weather", &v(bad), &dataset(1, 1)).await,
                Err(CatalogError::OverlapViolation { .. })
            ));
        }
        assert_eq!(map.entries("weather").await.expect("entries").len(), 1);
    }

    #[tokio::test]
    async fn ensure_entry_is_idempotent() {
        let map = map();
        map.append("weather", &v("1.0"), &dataset(1, 0)).await.expect("a");

        let first = map
            .ensure_entry("weather", &v("1.2"), &dataset(1, 1))
            .await
            .expect("ensure");
        let second = map
            .ensure_entry("weather", &v("1.2"), &dataset(1, 1))
            .await
            .expect("ensure");
        assert_eq!(first, AppendOutcome::Appended);
        assert_eq!(second, AppendOutcome::AlreadyPresent);
        assert_eq!(map.entries("weather").await.expect("entries").len(), 2);

        // Same app version with a different dataset is still an overlap.
        assert!(matches!(
            map.ensure_entry("weather", &v("1.2"), &dataset(2, 0)).await,
            Err(CatalogError::OverlapViolation { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_appends_are_serialized() {
        let map = map();
        map.append("weather", &v("1"), &dataset(1, 0)).await.expect("seed");

        let mut handles = Vec::new();
        for i in 2..10u32 {
            let map = map.clone();
            handles.push(tokio::spawn(async move {
                map.append("weather", &v(&i.to_string()), &dataset(1, i)).await
            }));
        }
        for handle in handles {
            // Each append either lands above the max or is rejected as an overlap.
            match handle.await.expect("join") {
                Ok(_) | Err(CatalogError::OverlapViolation { .. }) => {}
                Err(other) => panic!("unexpected error {other}"),
            }
        }

        let entries = map.entries("weather").await.expect("entries");
        assert!(entries.windows(2).all(|w| w[0].app_version < w[1].app_version));
    }

    proptest! {
        #[test]
        fn prop_resolve_is_monotonic(
            bounds in prop::collection::btree_set(0u64..500, 1..12),
            lookups in prop::collection::vec(0u64..600, 2..20),
        ) {
            let bounds: Vec<u64> = bounds.into_iter().collect();
            let entries: Vec<VersionMapEntry> = bounds
                .iter()
                .enumerate()
                .map(|(i, b)| VersionMapEntry {
                    family: "weather".into(),
                    app_version: v(&b.to_string()),
                    dataset: dataset(
                        1 + u32::try_from(i / 2).unwrap_or(0),
                        u32::try_from(i % 2).unwrap_or(0),
                    ),
                })
                .collect();

            let mut lookups = lookups;
            lookups.sort_unstable();
            let resolved: Vec<Option<&VersionMapEntry>> = lookups
                .iter()
                .map(|p| resolve_in(&entries, &v(&p.to_string())))
                .collect();

            for (lookup, hit) in lookups.iter().zip(&resolved) {
                prop_assert_eq!(hit.is_none(), *lookup < bounds[0]);
            }
            for pair in resolved.windows(2) {
                if let (Some(a), Some(b)) = (pair[0], pair[1]) {
                    prop_assert!(a.dataset.lineage_cmp(&b.dataset).is_le());
                }
            }
        }
    }
}
