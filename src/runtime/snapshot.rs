use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use super::data::Data;
use super::descriptor::{ConcreteRequest, DataId, RequiredAction, SingularSelector};

/// A client edge whose destination record is not in the store yet.
#[derive(Debug, Clone, PartialEq)]
pub struct MissingClientEdge {
    pub request: Arc<ConcreteRequest>,
    pub destination_id: DataId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingLiveResolverField {
    pub path: String,
    pub live_state_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingRequiredFields {
    pub action: RequiredAction,
    pub owner: String,
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub owner: String,
    pub path: String,
    pub message: String,
}

/// Result of reading one selector from the store.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub data: Data,
    pub is_missing_data: bool,
    pub missing_client_edges: Vec<MissingClientEdge>,
    pub missing_live_resolver_fields: Vec<MissingLiveResolverField>,
    pub missing_required_fields: Option<MissingRequiredFields>,
    pub field_errors: Vec<FieldError>,
    pub seen_records: BTreeSet<DataId>,
    pub selector: SingularSelector,
}

impl Snapshot {
    /// Copy of this snapshot carrying `data` instead of its own.
    pub fn with_data(&self, data: Data) -> Self {
        Self {
            data,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityStatus {
    Available,
    Missing,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationAvailability {
    pub status: AvailabilityStatus,
    pub fetch_time: Option<OffsetDateTime>,
}

impl OperationAvailability {
    pub fn missing() -> Self {
        Self {
            status: AvailabilityStatus::Missing,
            fetch_time: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQlError {
    pub message: String,
    #[serde(default)]
    pub path: Vec<Value>,
}

/// One payload from the network; incremental responses set `hasNext`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQlResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Vec<GraphQlError>,
    #[serde(default, rename = "hasNext")]
    pub has_next: bool,
}

impl GraphQlResponse {
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn incremental(data: Value) -> Self {
        Self {
            data: Some(data),
            has_next: true,
            ..Self::default()
        }
    }
}
