use serde::{Deserialize, Serialize};
use thiserror::Error;

use tally_core::{TransactionPatch, TransactionPayload};

use super::record::TransactionRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
    UploadReceipt,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Create => "create",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
            MutationKind::UploadReceipt => "upload_receipt",
        }
    }

    pub fn parse(value: &str) -> Result<Self, QueueStateError> {
        match value {
            "create" => Ok(MutationKind::Create),
            "update" => Ok(MutationKind::Update),
            "delete" => Ok(MutationKind::Delete),
            "upload_receipt" => Ok(MutationKind::UploadReceipt),
            other => Err(QueueStateError::InvalidKind(other.to_string())),
        }
    }
}

/// Payload union over the mutation kinds. Persisted as a JSON text column;
/// the external tag keeps the stored form self-describing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationPayload {
    Create { transaction: TransactionPayload },
    Update { patch: TransactionPatch },
    Delete,
    UploadReceipt { receipt_key: String },
}

impl MutationPayload {
    pub fn kind(&self) -> MutationKind {
        match self {
            MutationPayload::Create { .. } => MutationKind::Create,
            MutationPayload::Update { .. } => MutationKind::Update,
            MutationPayload::Delete => MutationKind::Delete,
            MutationPayload::UploadReceipt { .. } => MutationKind::UploadReceipt,
        }
    }
}

/// Identifies the target transaction record; at least one id must be set.
/// The local id stays stable across the create handshake, the remote id
/// appears once the server has assigned one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordRef {
    pub local_id: Option<String>,
    pub remote_id: Option<String>,
}

impl RecordRef {
    pub fn local(id: impl Into<String>) -> Self {
        Self {
            local_id: Some(id.into()),
            remote_id: None,
        }
    }

    pub fn remote(id: impl Into<String>) -> Self {
        Self {
            local_id: None,
            remote_id: Some(id.into()),
        }
    }

    pub fn of_record(record: &TransactionRecord) -> Self {
        Self {
            local_id: Some(record.id.clone()),
            remote_id: record.remote_id.clone(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.local_id.is_some() || self.remote_id.is_some()
    }

    pub fn matches(&self, record: &TransactionRecord) -> bool {
        if let Some(local_id) = &self.local_id
            && *local_id == record.id
        {
            return true;
        }
        if let Some(remote_id) = &self.remote_id
            && record.remote_id.as_deref() == Some(remote_id.as_str())
        {
            return true;
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Processing,
    Error,
    Conflict,
    Done,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Error => "error",
            QueueStatus::Conflict => "conflict",
            QueueStatus::Done => "done",
        }
    }

    pub fn parse(value: &str) -> Result<Self, QueueStateError> {
        match value {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "error" => Ok(QueueStatus::Error),
            "conflict" => Ok(QueueStatus::Conflict),
            "done" => Ok(QueueStatus::Done),
            other => Err(QueueStateError::InvalidStatus(other.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Done | QueueStatus::Conflict)
    }

    /// Applier-side transitions. `Done` never leaves, `Conflict` exits only
    /// through the resolver (which replaces or removes the item instead of
    /// transitioning it), `Error` goes back to `Pending` via retry.
    pub fn can_transition(self, next: QueueStatus) -> bool {
        matches!(
            (self, next),
            (QueueStatus::Pending, QueueStatus::Processing)
                | (QueueStatus::Processing, QueueStatus::Done)
                | (QueueStatus::Processing, QueueStatus::Error)
                | (QueueStatus::Processing, QueueStatus::Conflict)
                | (QueueStatus::Processing, QueueStatus::Pending)
                | (QueueStatus::Error, QueueStatus::Pending)
        )
    }
}

#[derive(Debug, Error)]
pub enum QueueStateError {
    #[error("invalid mutation kind: {0}")]
    InvalidKind(String),
    #[error("invalid queue status: {0}")]
    InvalidStatus(String),
    #[error("invalid resolution decision: {0}")]
    InvalidDecision(String),
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
}

/// Input for a new queue entry; id, status and timestamps are assigned by
/// the store on insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInput {
    pub record: RecordRef,
    pub payload: MutationPayload,
    pub base_version: Option<i64>,
    pub unconditional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub id: i64,
    pub record: RecordRef,
    pub payload: MutationPayload,
    pub base_version: Option<i64>,
    pub unconditional: bool,
    pub status: QueueStatus,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl QueueItem {
    pub fn kind(&self) -> MutationKind {
        self.payload.kind()
    }
}
