//! Schema descriptions and the compatibility comparator.
//!
//! A [`SchemaDescription`] is the tabular schema inferred for one dataset
//! family: an ordered list of field paths with a data type and a nullability
//! flag. The [`SchemaComparator`] decides whether moving from one description
//! to another can be absorbed by the existing dataset lineage.
//!
//! # Classification rules
//!
//! | Difference between `old` and `new`                | Verdict        |
//! |----------------------------------------------------|----------------|
//! | none                                               | `NoChange`     |
//! | any shared field changed data type                 | `Incompatible` |
//! | fields added/removed, or nullability loosened      | `Compatible`   |
//! | shared fields became required, nothing else        | ambiguous      |
//!
//! Type changes dominate: a retyped field makes the change incompatible no
//! matter what else differs. Field order never matters.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};

/// Column data type of a tabular field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataType {
    /// Boolean.
    Boolean,
    /// 32-bit signed integer.
    Int,
    /// 64-bit signed integer.
    Bigint,
    /// 64-bit floating point.
    Double,
    /// Fixed-point decimal.
    Decimal {
        /// Total digits.
        precision: u8,
        /// Digits after the decimal point.
        scale: u8,
    },
    /// UTF-8 string.
    String,
    /// Raw bytes.
    Binary,
    /// Calendar date.
    Date,
    /// Timestamp.
    Timestamp,
    /// Homogeneous list.
    Array {
        /// Element type.
        element: Box<DataType>,
    },
    /// Key/value map.
    Map {
        /// Key type.
        key: Box<DataType>,
        /// Value type.
        value: Box<DataType>,
    },
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean => f.write_str("boolean"),
            Self::Int => f.write_str("int"),
            Self::Bigint => f.write_str("bigint"),
            Self::Double => f.write_str("double"),
            Self::Decimal { precision, scale } => write!(f, "decimal({precision},{scale})"),
            Self::String => f.write_str("string"),
            Self::Binary => f.write_str("binary"),
            Self::Date => f.write_str("date"),
            Self::Timestamp => f.write_str("timestamp"),
            Self::Array { element } => write!(f, "array<{element}>"),
            Self::Map { key, value } => write!(f, "map<{key},{value}>"),
        }
    }
}

/// One field of a schema. Nested fields use dotted paths (`location.lat`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    /// Dotted field path, unique within a schema.
    pub path: String,
    /// Column data type.
    pub data_type: DataType,
    /// Whether the field may be absent or null.
    pub nullable: bool,
}

impl FieldSpec {
    /// Creates a nullable field.
    #[must_use]
    pub fn nullable(path: impl Into<String>, data_type: DataType) -> Self {
        Self {
            path: path.into(),
            data_type,
            nullable: true,
        }
    }

    /// Creates a required field.
    #[must_use]
    pub fn required(path: impl Into<String>, data_type: DataType) -> Self {
        Self {
            path: path.into(),
            data_type,
            nullable: false,
        }
    }
}

/// The tabular schema of a dataset family at one revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDescription {
    /// Dataset family the schema belongs to.
    pub family: String,
    /// Revision counter assigned by the producer of the schema.
    pub revision: u32,
    /// Fields in declaration order.
    pub fields: Vec<FieldSpec>,
}

impl SchemaDescription {
    /// Creates a validated schema description.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidSchema`] if the family is empty or a
    /// field path is empty or duplicated.
    pub fn new(family: impl Into<String>, revision: u32, fields: Vec<FieldSpec>) -> Result<Self> {
        let schema = Self {
            family: family.into(),
            revision,
            fields,
        };
        schema.validate()?;
        Ok(schema)
    }

    /// Checks the structural invariants of the description.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidSchema`] on an empty family, an empty
    /// field path, or a duplicated field path.
    pub fn validate(&self) -> Result<()> {
        if self.family.is_empty() {
            return Err(CatalogError::InvalidSchema {
                message: "family must not be empty".into(),
            });
        }
        let mut seen = BTreeSet::new();
        for field in &self.fields {
            if field.path.is_empty() {
                return Err(CatalogError::InvalidSchema {
                    message: format!("{}: empty field path", self.family),
                });
            }
            if !seen.insert(field.path.as_str()) {
                return Err(CatalogError::InvalidSchema {
                    message: format!("{}: duplicate field path '{}'", self.family, field.path),
                });
            }
        }
        Ok(())
    }

    /// Looks up a field by path.
    #[must_use]
    pub fn field(&self, path: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.path == path)
    }

    fn by_path(&self) -> BTreeMap<&str, &FieldSpec> {
        self.fields.iter().map(|f| (f.path.as_str(), f)).collect()
    }
}

/// Outcome of comparing two schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// The schemas are identical up to field order.
    NoChange,
    /// The existing dataset can absorb the new schema.
    Compatible,
    /// The new schema needs a new dataset version.
    Incompatible,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoChange => "no_change",
            Self::Compatible => "compatible",
            Self::Incompatible => "incompatible",
        })
    }
}

/// A shared field whose data type differs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeChange {
    /// Field path.
    pub path: String,
    /// Type in the old schema.
    pub from: DataType,
    /// Type in the new schema.
    pub to: DataType,
}

/// Field-level difference between two schemas. All lists are sorted by path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDiff {
    /// Paths only in the new schema.
    pub added: Vec<String>,
    /// Paths only in the old schema.
    pub removed: Vec<String>,
    /// Shared paths whose type changed.
    pub retyped: Vec<TypeChange>,
    /// Shared paths that went from nullable to required.
    pub tightened: Vec<String>,
    /// Shared paths that went from required to nullable.
    pub loosened: Vec<String>,
}

impl SchemaDiff {
    /// Computes the difference between `old` and `new`.
    #[must_use]
    pub fn between(old: &SchemaDescription, new: &SchemaDescription) -> Self {
        let old_fields = old.by_path();
        let new_fields = new.by_path();
        let mut diff = Self::default();

        for (path, before) in &old_fields {
            match new_fields.get(path) {
                None => diff.removed.push((*path).to_string()),
                Some(after) => {
                    if before.data_type != after.data_type {
                        diff.retyped.push(TypeChange {
                            path: (*path).to_string(),
                            from: before.data_type.clone(),
                            to: after.data_type.clone(),
                        });
                    } else if before.nullable && !after.nullable {
                        diff.tightened.push((*path).to_string());
                    } else if !before.nullable && after.nullable {
                        diff.loosened.push((*path).to_string());
                    }
                }
            }
        }
        diff.added = new_fields
            .keys()
            .filter(|path| !old_fields.contains_key(*path))
            .map(|path| (*path).to_string())
            .collect();

        diff
    }

    /// Returns true when the schemas are identical up to field order.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.retyped.is_empty()
            && self.tightened.is_empty()
            && self.loosened.is_empty()
    }
}

/// Classification state of a recorded schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// The change keeps the current dataset version.
    Compatible,
    /// The change forks a new dataset version.
    Incompatible,
    /// Not yet decided.
    Unknown,
}

impl From<ChangeKind> for Classification {
    fn from(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::Compatible | ChangeKind::NoChange => Self::Compatible,
            ChangeKind::Incompatible => Self::Incompatible,
        }
    }
}

/// A detected schema change for a family.
///
/// Starts out [`Classification::Unknown`]; once finalized its classification
/// can no longer change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaChange {
    /// Dataset family.
    pub family: String,
    /// Schema the dataset currently has.
    pub from: SchemaDescription,
    /// Candidate schema.
    pub to: SchemaDescription,
    classification: Classification,
}

impl SchemaChange {
    /// Records an unclassified change.
    #[must_use]
    pub fn detected(from: SchemaDescription, to: SchemaDescription) -> Self {
        Self {
            family: from.family.clone(),
            from,
            to,
            classification: Classification::Unknown,
        }
    }

    /// Returns the current classification.
    #[must_use]
    pub fn classification(&self) -> Classification {
        self.classification
    }

    /// Returns true once a verdict has been recorded.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.classification != Classification::Unknown
    }

    /// Records the verdict.
    ///
    /// Finalizing again with the same verdict is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidSchema`] when the change is already
    /// finalized with a different verdict, or when `verdict` is `Unknown`.
    pub fn finalize(&mut self, verdict: Classification) -> Result<()> {
        if verdict == Classification::Unknown {
            return Err(CatalogError::InvalidSchema {
                message: format!("{}: cannot finalize to unknown", self.family),
            });
        }
        if self.is_finalized() && self.classification != verdict {
            return Err(CatalogError::InvalidSchema {
                message: format!(
                    "{}: change already finalized as {:?}",
                    self.family, self.classification
                ),
            });
        }
        self.classification = verdict;
        Ok(())
    }
}

/// Pure schema classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaComparator;

impl SchemaComparator {
    /// Classifies the move from `old` to `new`.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::ClassificationAmbiguous`] when tightening a
    /// shared field from nullable to required is the only difference, and
    /// [`CatalogError::InvalidSchema`] when the schemas belong to different
    /// families or are malformed.
    pub fn classify(&self, old: &SchemaDescription, new: &SchemaDescription) -> Result<ChangeKind> {
        old.validate()?;
        new.validate()?;
        if old.family != new.family {
            return Err(CatalogError::InvalidSchema {
                message: format!(
                    "cannot compare schemas of different families ({} vs {})",
                    old.family, new.family
                ),
            });
        }

        let diff = SchemaDiff::between(old, new);
        let kind = Self::verdict(&old.family, &diff)?;
        crate::metrics::record_classification(kind);
        Ok(kind)
    }

    /// Derives the verdict from a precomputed diff.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::ClassificationAmbiguous`] for tightened fields
    /// when nothing was retyped, added or removed.
    pub fn verdict(family: &str, diff: &SchemaDiff) -> Result<ChangeKind> {
        if !diff.retyped.is_empty() {
            return Ok(ChangeKind::Incompatible);
        }
        // Any addition or removal settles it as compatible.
        let reshaped = !diff.added.is_empty() || !diff.removed.is_empty();
        if !diff.tightened.is_empty() && !reshaped {
            return Err(CatalogError::ClassificationAmbiguous {
                family: family.to_string(),
                fields: diff.tightened.clone(),
            });
        }
        if diff.is_empty() {
            Ok(ChangeKind::NoChange)
        } else {
            Ok(ChangeKind::Compatible)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn schema(fields: Vec<FieldSpec>) -> SchemaDescription {
        SchemaDescription::new("weather", 1, fields).expect("valid schema")
    }

    fn base() -> SchemaDescription {
        schema(vec![
            FieldSpec::required("station", DataType::String),
            FieldSpec::nullable("temp", DataType::Double),
            FieldSpec::nullable("observed_at", DataType::Timestamp),
        ])
    }

    #[test]
    fn identical_schemas_are_no_change() {
        let kind = SchemaComparator.classify(&base(), &base()).expect("classify");
        assert_eq!(kind, ChangeKind::NoChange);
    }

    #[test]
    fn added_field_is_compatible() {
        let mut new = base();
        new.fields.push(FieldSpec::nullable("humidity", DataType::Double));
        assert_eq!(
            SchemaComparator.classify(&base(), &new).expect("classify"),
            ChangeKind::Compatible
        );
    }

    #[test]
    fn removed_field_is_compatible() {
        let mut new = base();
        new.fields.pop();
        assert_eq!(
            SchemaComparator.classify(&base(), &new).expect("classify"),
            ChangeKind::Compatible
        );
    }

    #[test]
    fn small_schema_scenarios() {
        let a_int = FieldSpec::nullable("a", DataType::Int);
        let old = schema(vec![a_int.clone(), FieldSpec::nullable("b", DataType::String)]);
        let mut widened = old.clone();
        widened.fields.push(FieldSpec::nullable("c", DataType::Boolean));
        assert_eq!(
            SchemaComparator.classify(&old, &widened).expect("classify"),
            ChangeKind::Compatible
        );

        let retyped = schema(vec![FieldSpec::nullable("a", DataType::String)]);
        assert_eq!(
            SchemaComparator
                .classify(&schema(vec![a_int]), &retyped)
                .expect("classify"),
            ChangeKind::Incompatible
        );
    }

    #[test]
    fn retyped_field_is_incompatible_despite_additions() {
        let mut new = base();
        new.fields[1].data_type = DataType::String;
        new.fields.push(FieldSpec::nullable("humidity", DataType::Double));
        assert_eq!(
            SchemaComparator.classify(&base(), &new).expect("classify"),
            ChangeKind::Incompatible
        );
    }

    #[test]
    fn loosened_nullability_is_compatible() {
        let mut new = base();
        new.fields[0].nullable = true;
        assert_eq!(
            SchemaComparator.classify(&base(), &new).expect("classify"),
            ChangeKind::Compatible
        );
    }

    #[test]
    fn tightened_nullability_is_ambiguous() {
        let mut new = base();
        new.fields[1].nullable = false;
        match SchemaComparator.classify(&base(), &new) {
            Err(CatalogError::ClassificationAmbiguous { fields, .. }) => {
                assert_eq!(fields, vec!["temp".to_string()]);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn tightened_with_added_field_is_compatible() {
        let old = schema(vec![FieldSpec::nullable("a", DataType::Int)]);
        let new = schema(vec![
            FieldSpec::required("a", DataType::Int),
            FieldSpec::nullable("c", DataType::Boolean),
        ]);
        assert_eq!(
            SchemaComparator.classify(&old, &new).expect("classify"),
            ChangeKind::Compatible
        );
    }

    #[test]
    fn tightened_and_retyped_is_incompatible() {
        let mut new = base();
        new.fields[1].nullable = false;
        new.fields[2].data_type = DataType::String;
        assert_eq!(
            SchemaComparator.classify(&base(), &new).expect("classify"),
            ChangeKind::Incompatible
        );
    }

    #[test]
    fn duplicate_paths_are_rejected() {
        let result = SchemaDescription::new(
            "weather",
            1,
            vec![
                FieldSpec::nullable("a", DataType::Int),
                FieldSpec::nullable("a", DataType::Bigint),
            ],
        );
        assert!(matches!(result, Err(CatalogError::InvalidSchema { .. })));
    }

    #[test]
    fn families_must_match() {
        let other = SchemaDescription::new("tides", 1, base().fields).expect("valid");
        assert!(matches!(
            SchemaComparator.classify(&base(), &other),
            Err(CatalogError::InvalidSchema { .. })
        ));
    }

    #[test]
    fn schema_change_is_immutable_once_finalized() {
        let mut change = SchemaChange::detected(base(), base());
        assert_eq!(change.classification(), Classification::Unknown);

        change.finalize(Classification::Compatible).expect("finalize");
        change.finalize(Classification::Compatible).expect("same verdict");
        assert!(change.finalize(Classification::Incompatible).is_err());
        assert_eq!(change.classification(), Classification::Compatible);
    }

    #[test]
    fn data_type_display() {
        let t = DataType::Map {
            key: Box::new(DataType::String),
            value: Box::new(DataType::Array {
                element: Box::new(DataType::Decimal {
                    precision: 10,
                    scale: 2,
                }),
            }),
        };
        assert_eq!(t.to_string(), "map<string,array<decimal(10,2)>>");
    }

    fn arb_type() -> impl Strategy<Value = DataType> {
        prop_oneof![
            Just(DataType::Boolean),
            Just(DataType::Int),
            Just(DataType::Bigint),
            Just(DataType::Double),
            Just(DataType::String),
            Just(DataType::Date),
            Just(DataType::Timestamp),
        ]
    }

    fn arb_schema() -> impl Strategy<Value = SchemaDescription> {
        prop::collection::btree_map("[a-z]{1,6}", (arb_type(), any::<bool>()), 0..8).prop_map(
            |fields| SchemaDescription {
                family: "weather".into(),
                revision: 1,
                fields: fields
                    .into_iter()
                    .map(|(path, (data_type, nullable))| FieldSpec {
                        path,
                        data_type,
                        nullable,
                    })
                    .collect(),
            },
        )
    }

    fn other_type(t: &DataType) -> DataType {
        if *t == DataType::String {
            DataType::Bigint
        } else {
            DataType::String
        }
    }

    proptest! {
        #[test]
        fn prop_reflexive_no_change(s in arb_schema()) {
            prop_assert_eq!(SchemaComparator.classify(&s, &s).ok(), Some(ChangeKind::NoChange));
        }

        #[test]
        fn prop_field_order_is_irrelevant(s in arb_schema()) {
            let mut reversed = s.clone();
            reversed.fields.reverse();
            prop_assert_eq!(
                SchemaComparator.classify(&s, &reversed).ok(),
                Some(ChangeKind::NoChange)
            );
        }

        #[test]
        fn prop_adding_fresh_field_is_compatible(
            s in arb_schema(),
            t in arb_type(),
            nullable in any::<bool>(),
        ) {
            let mut new = s.clone();
            // Generated paths are lowercase letters only, so this never collides.
            new.fields.push(FieldSpec { path: "fresh_field".into(), data_type: t, nullable });
            prop_assert_eq!(SchemaComparator.classify(&s, &new).ok(), Some(ChangeKind::Compatible));
        }

        #[test]
        fn prop_reshaping_with_tightened_field_is_compatible(
            s in arb_schema(),
            idx in any::<prop::sample::Index>(),
            extra in arb_type(),
            add in any::<bool>(),
        ) {
            prop_assume!(s.fields.len() >= 2);
            let mut new = s.clone();
            let i = idx.index(new.fields.len());
            new.fields[i].nullable = false;
            if add {
                new.fields.push(FieldSpec::nullable("fresh_field", extra));
            } else {
                // Drop a field other than the tightened one.
                let victim = if i == 0 { 1 } else { 0 };
                new.fields.remove(victim);
            }
            prop_assert_eq!(SchemaComparator.classify(&s, &new).ok(), Some(ChangeKind::Compatible));
        }

        #[test]
        fn prop_retyping_dominates(
            s in arb_schema(),
            idx in any::<prop::sample::Index>(),
            extra in arb_type(),
        ) {
            prop_assume!(!s.fields.is_empty());
            let mut new = s.clone();
            let i = idx.index(new.fields.len());
            new.fields[i].data_type = other_type(&new.fields[i].data_type);
            new.fields[i].nullable = !new.fields[i].nullable;
            new.fields.push(FieldSpec::nullable("fresh_field", extra));
            prop_assert_eq!(
                SchemaComparator.classify(&s, &new).ok(),
                Some(ChangeKind::Incompatible)
            );
        }

        #[test]
        fn prop_classification_is_deterministic(a in arb_schema(), b in arb_schema()) {
            let first = SchemaComparator.classify(&a, &b).ok();
            let second = SchemaComparator.classify(&a, &b).ok();
            prop_assert_eq!(first, second);
        }
    }
}
