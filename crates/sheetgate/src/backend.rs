//! Consumed interfaces: the remote spreadsheet API and the snapshot service.
//!
//! Everything that crosses the network is expressed as a [`BackendCall`] so the
//! deduplicator can hash it and the rate limiter can classify it.

use crate::intent::{CellFormat, Dimension, OperationClass};
use crate::structure::LiveStructure;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sheetgate_common::{Grid, GridRange, RenderMode, SheetId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Quota exceeded (HTTP 429 or a rate-limit 403).
    #[error("quota exceeded")]
    Throttled { retry_after: Option<Duration> },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub range: GridRange,
    pub render: RenderMode,
}

/// Who last changed a range, when the backend reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionInfo {
    pub modified_at: DateTime<Utc>,
    pub modifier_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueRange {
    pub range: GridRange,
    pub values: Grid,
    #[serde(default)]
    pub revision: Option<RevisionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueMutation {
    Write { range: GridRange, values: Grid },
    Clear { range: GridRange },
    /// Rows appended at `range`, which the compiler computed from the sheet extent.
    Append { range: GridRange, rows: Grid },
}

impl ValueMutation {
    pub fn range(&self) -> &GridRange {
        match self {
            ValueMutation::Write { range, .. }
            | ValueMutation::Clear { range }
            | ValueMutation::Append { range, .. } => range,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StructuralRequest {
    AddSheet {
        title: String,
        rows: u32,
        cols: u32,
    },
    DeleteSheet {
        sheet_id: SheetId,
    },
    RenameSheet {
        sheet_id: SheetId,
        title: String,
    },
    InsertDimension {
        sheet_id: SheetId,
        dimension: Dimension,
        start: u32,
        count: u32,
    },
    DeleteDimension {
        sheet_id: SheetId,
        dimension: Dimension,
        start: u32,
        count: u32,
    },
    FormatCells {
        range: GridRange,
        format: CellFormat,
    },
}

impl StructuralRequest {
    pub fn sheet_id(&self) -> Option<SheetId> {
        match self {
            StructuralRequest::AddSheet { .. } => None,
            StructuralRequest::DeleteSheet { sheet_id }
            | StructuralRequest::RenameSheet { sheet_id, .. }
            | StructuralRequest::InsertDimension { sheet_id, .. }
            | StructuralRequest::DeleteDimension { sheet_id, .. } => Some(*sheet_id),
            StructuralRequest::FormatCells { range, .. } => Some(range.sheet_id),
        }
    }

    pub fn is_idempotent(&self) -> bool {
        !matches!(
            self,
            StructuralRequest::AddSheet { .. }
                | StructuralRequest::InsertDimension { .. }
                | StructuralRequest::DeleteDimension { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StructuralReply {
    AddSheet { sheet_id: SheetId },
    Done,
}

/// The remote tabular-data API. Implementations perform exactly one network
/// round-trip per method call.
#[async_trait]
pub trait SheetsBackend: Send + Sync {
    /// Object metadata, sheet extents, first rows and named ranges.
    async fn fetch_structure(&self, object_id: &str) -> Result<LiveStructure, BackendError>;

    async fn batch_get(
        &self,
        object_id: &str,
        ranges: &[ReadRequest],
    ) -> Result<Vec<ValueRange>, BackendError>;

    /// Returns the number of cells updated per mutation.
    async fn values_batch_update(
        &self,
        object_id: &str,
        data: &[ValueMutation],
    ) -> Result<Vec<u64>, BackendError>;

    async fn batch_update(
        &self,
        object_id: &str,
        requests: &[StructuralRequest],
    ) -> Result<Vec<StructuralReply>, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub String);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SnapshotError(pub String);

/// Point-in-time backups used to emulate transactions.
#[async_trait]
pub trait SnapshotService: Send + Sync {
    async fn create_snapshot(&self, object_id: &str) -> Result<SnapshotId, SnapshotError>;
    async fn restore(&self, snapshot: &SnapshotId) -> Result<(), SnapshotError>;
}

/// One network call, fully described.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum BackendCall {
    FetchStructure {
        object_id: String,
    },
    BatchGet {
        object_id: String,
        ranges: Vec<ReadRequest>,
    },
    ValuesBatchUpdate {
        object_id: String,
        data: Vec<ValueMutation>,
    },
    BatchUpdate {
        object_id: String,
        requests: Vec<StructuralRequest>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendResponse {
    Structure(Arc<LiveStructure>),
    ValueRanges(Vec<ValueRange>),
    Updated(Vec<u64>),
    Replies(Vec<StructuralReply>),
}

impl BackendCall {
    pub fn object_id(&self) -> &str {
        match self {
            BackendCall::FetchStructure { object_id }
            | BackendCall::BatchGet { object_id, .. }
            | BackendCall::ValuesBatchUpdate { object_id, .. }
            | BackendCall::BatchUpdate { object_id, .. } => object_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BackendCall::FetchStructure { .. } => "fetch_structure",
            BackendCall::BatchGet { .. } => "batch_get",
            BackendCall::ValuesBatchUpdate { .. } => "values_batch_update",
            BackendCall::BatchUpdate { .. } => "batch_update",
        }
    }

    pub fn class(&self) -> OperationClass {
        match self {
            BackendCall::FetchStructure { .. } | BackendCall::BatchGet { .. } => {
                OperationClass::Read
            }
            BackendCall::ValuesBatchUpdate { .. } | BackendCall::BatchUpdate { .. } => {
                OperationClass::Write
            }
        }
    }

    /// Whether two identical in-flight copies may share one dispatch.
    pub fn is_idempotent(&self) -> bool {
        match self {
            BackendCall::FetchStructure { .. } | BackendCall::BatchGet { .. } => true,
            BackendCall::ValuesBatchUpdate { data, .. } => data
                .iter()
                .all(|m| !matches!(m, ValueMutation::Append { .. })),
            BackendCall::BatchUpdate { requests, .. } => {
                requests.iter().all(StructuralRequest::is_idempotent)
            }
        }
    }

    pub async fn send(&self, backend: &dyn SheetsBackend) -> Result<BackendResponse, BackendError> {
        match self {
            BackendCall::FetchStructure { object_id } => backend
                .fetch_structure(object_id)
                .await
                .map(|s| BackendResponse::Structure(Arc::new(s))),
            BackendCall::BatchGet { object_id, ranges } => backend
                .batch_get(object_id, ranges)
                .await
                .map(BackendResponse::ValueRanges),
            BackendCall::ValuesBatchUpdate { object_id, data } => backend
                .values_batch_update(object_id, data)
                .await
                .map(BackendResponse::Updated),
            BackendCall::BatchUpdate {
                object_id,
                requests,
            } => backend
                .batch_update(object_id, requests)
                .await
                .map(BackendResponse::Replies),
        }
    }
}
