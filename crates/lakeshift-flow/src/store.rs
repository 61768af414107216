//! Durable flow records, family pointers, and cancel markers.
//!
//! Each family has at most one unfinished flow. The pointer document at
//! `flows/by-family/{family}.json` names it; it is claimed with a
//! create-if-absent write and deleted when the flow finishes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lakeshift_core::document::{DocumentStore, Mutation};
use lakeshift_core::{FlowId, paths, storage};

use crate::error::{Error, Result};
use crate::flow::FlowRecord;

const CLAIM_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FamilyPointer {
    flow_id: FlowId,
    claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelMarker {
    requested_at: DateTime<Utc>,
}

/// Persistence for flow records.
#[derive(Debug, Clone)]
pub struct FlowStore {
    docs: DocumentStore,
}

impl FlowStore {
    /// Creates a flow store over `docs`.
    #[must_use]
    pub fn new(docs: DocumentStore) -> Self {
        Self { docs }
    }

    /// Writes a new flow record.
    ///
    /// # Errors
    ///
    /// Returns an error if a record with the same id exists or storage fails.
    pub async fn create(&self, record: &FlowRecord) -> Result<()> {
        let path = paths::flow(&record.flow_id.to_string());
        match self.docs.create(&path, record).await? {
            Some(_) => Ok(()),
            None => Err(lakeshift_core::Error::Internal {
                message: format!("flow record {} already exists", record.flow_id),
            }
            .into()),
        }
    }

    /// Persists `record` over the stored one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FlowNotFound`] if the record vanished, and
    /// [`Error::InvalidStateTransition`] if another process already finished
    /// or aborted the flow.
    pub async fn save(&self, record: &FlowRecord) -> Result<()> {
        let path = paths::flow(&record.flow_id.to_string());
        self.docs
            .update::<FlowRecord, Error, _>(&path, |current| {
                let Some(current) = current else {
                    return Err(Error::FlowNotFound {
                        flow_id: record.flow_id,
                    });
                };
                if current.state.is_terminal() && current.state != record.state {
                    return Err(Error::InvalidStateTransition {
                        from: current.state.to_string(),
                        to: record.state.to_string(),
                        reason: "flow was finished by another process".into(),
                    });
                }
                if current == record {
                    return Ok(Mutation::Unchanged);
                }
                Ok(Mutation::Put(record.clone()))
            })
            .await?;
        Ok(())
    }

    /// Loads a flow record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FlowNotFound`] if it does not exist.
    pub async fn load(&self, flow_id: FlowId) -> Result<FlowRecord> {
        self.docs
            .load::<FlowRecord>(&paths::flow(&flow_id.to_string()))
            .await?
            .map(|doc| doc.value)
            .ok_or(Error::FlowNotFound { flow_id })
    }

    /// Makes `flow_id` the family's unfinished flow.
    ///
    /// Returns the id of a different flow already holding the family, or
    /// `None` once `flow_id` holds it.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn claim_family(&self, family: &str, flow_id: FlowId) -> Result<Option<FlowId>> {
        let path = paths::family_flow(family);
        let pointer = FamilyPointer {
            flow_id,
            claimed_at: Utc::now(),
        };
        for _ in 0..CLAIM_ATTEMPTS {
            if self.docs.create(&path, &pointer).await?.is_some() {
                return Ok(None);
            }
            // Lost the create race; the holder may have released since.
            if let Some(doc) = self.docs.load::<FamilyPointer>(&path).await? {
                let holder = doc.value.flow_id;
                return Ok((holder != flow_id).then_some(holder));
            }
        }
        Err(lakeshift_core::Error::PreconditionFailed {
            message: format!("family pointer for {family} kept changing"),
        }
        .into())
    }

    /// Releases the family if `flow_id` holds it.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn release_family(&self, family: &str, flow_id: FlowId) -> Result<()> {
        if self.active_flow(family).await? == Some(flow_id) {
            self.docs.delete(&paths::family_flow(family)).await?;
        }
        Ok(())
    }

    /// Returns the family's unfinished flow, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn active_flow(&self, family: &str) -> Result<Option<FlowId>> {
        Ok(self
            .docs
            .load::<FamilyPointer>(&paths::family_flow(family))
            .await?
            .map(|doc| doc.value.flow_id))
    }

    /// Records an operator's request to stop the flow between steps.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn request_cancel(&self, flow_id: FlowId) -> Result<()> {
        let marker = CancelMarker {
            requested_at: Utc::now(),
        };
        self.docs
            .update::<CancelMarker, Error, _>(&paths::flow_cancel(&flow_id.to_string()), |current| {
                Ok(match current {
                    Some(_) => Mutation::Unchanged,
                    None => Mutation::Put(marker.clone()),
                })
            })
            .await?;
        Ok(())
    }

    /// Returns true while a cancel request is pending.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn cancel_requested(&self, flow_id: FlowId) -> Result<bool> {
        Ok(storage::exists(
            self.docs.storage().as_ref(),
            &paths::flow_cancel(&flow_id.to_string()),
        )
        .await?)
    }

    /// Clears a pending cancel request.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn clear_cancel(&self, flow_id: FlowId) -> Result<()> {
        self.docs
            .delete(&paths::flow_cancel(&flow_id.to_string()))
            .await?;
        Ok(())
    }
}
