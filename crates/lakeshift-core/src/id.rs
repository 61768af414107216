//! Strongly-typed identifiers for Lakeshift entities.
//!
//! All identifiers are ULIDs wrapped in a newtype, so a flow id can never be
//! passed where a sandbox id is expected, and ids sort by creation time.
//!
//! # Example
//!
//! ```rust
//! use lakeshift_core::id::{FlowId, SandboxId};
//!
//! let flow = FlowId::generate();
//! let parsed: FlowId = flow.to_string().parse().unwrap();
//! assert_eq!(flow, parsed);
//!
//! // Different types - this won't compile:
//! // let wrong: SandboxId = flow;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Generates a new unique ID.
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            /// Creates an ID from a raw ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the creation timestamp encoded in the ID.
            #[must_use]
            pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
                i64::try_from(self.0.timestamp_ms())
                    .ok()
                    .and_then(chrono::DateTime::from_timestamp_millis)
                    .unwrap_or_else(chrono::Utc::now)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Ulid::from_string(s)
                    .map(Self)
                    .map_err(|e| Error::InvalidId {
                        message: format!("invalid {} ID '{s}': {e}", $label),
                    })
            }
        }
    };
}

ulid_id!(
    /// Identifies one schema-change flow from submission to a terminal state.
    FlowId,
    "flow"
);

ulid_id!(
    /// Identifies a compatibility-test sandbox; its objects live under a
    /// prefix derived from this id.
    SandboxId,
    "sandbox"
);

ulid_id!(
    /// Identifies a single run of an ingestion job.
    RunId,
    "run"
);
