//! # lakeshift-catalog
//!
//! The durable data model of Lakeshift's schema-change orchestration.
//!
//! - **Schemas**: [`SchemaDescription`] and the pure [`SchemaComparator`]
//! - **Datasets**: [`DatasetVersion`] lineage and the [`DatasetRegistry`]
//! - **Version map**: [`VersionMap`], the append-only step function from
//!   producer app versions to dataset versions
//! - **Archive**: [`DatasetArchiver`], moving artifacts into numbered slots
//!
//! ## Storage Layout
//!
//! ```text
//! state/
//! ├── version_maps/{family}.json
//! ├── datasets/{family}/{version}.json
//! └── archive/
//!     ├── intents/{family}/{version}/{slot}.json
//!     └── records/{family}/{version}/{slot}.json
//! {archive_root}/{family}_{version}_{slot}/...   # relocated artifacts
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use lakeshift_catalog::prelude::*;
//!
//! let kind = SchemaComparator.classify(&current, &candidate)?;
//! let dataset = version_map.resolve("weather", &"2.4.1".parse()?).await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod app_version;
pub mod archiver;
pub mod dataset;
pub mod error;
pub mod metrics;
pub mod schema;
pub mod version_map;

pub use app_version::{AppVersion, ClientInfo};
pub use archiver::{ArchiveIntent, ArchiveRecord, DatasetArchiver};
pub use dataset::{DatasetRegistry, DatasetVersion};
pub use error::{CatalogError, Result};
pub use schema::{
    ChangeKind, Classification, DataType, FieldSpec, SchemaChange, SchemaComparator,
    SchemaDescription, SchemaDiff,
};
pub use version_map::{AppendOutcome, VersionMap, VersionMapEntry};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::app_version::{AppVersion, ClientInfo};
    pub use crate::archiver::{ArchiveRecord, DatasetArchiver};
    pub use crate::dataset::{DatasetRegistry, DatasetVersion};
    pub use crate::error::{CatalogError, Result};
    pub use crate::schema::{ChangeKind, DataType, FieldSpec, SchemaComparator, SchemaDescription};
    pub use crate::version_map::{VersionMap, VersionMapEntry};
}
