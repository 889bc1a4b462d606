use tally_core::{TransactionPatch, TransactionPayload};

/// Locally materialized transaction, mirroring the authoritative state as
/// last observed plus any optimistic edits. `base_version` is the opaque
/// concurrency token for the next conditional mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub id: String,
    pub remote_id: Option<String>,
    pub amount: i64,
    pub occurred_at: i64,
    pub category_id: Option<String>,
    pub payee: Option<String>,
    pub payment_method: String,
    pub notes: Option<String>,
    pub pending: bool,
    pub conflict: bool,
    pub base_version: Option<i64>,
    pub last_synced_at: Option<i64>,
    pub receipt_url: Option<String>,
    pub receipt_pending: bool,
}

impl TransactionRecord {
    /// Fresh local-only record from a draft payload; not yet known to the
    /// server.
    pub fn new_local(id: impl Into<String>, payload: &TransactionPayload) -> Self {
        Self {
            id: id.into(),
            remote_id: None,
            amount: payload.amount,
            occurred_at: payload.occurred_at,
            category_id: payload.category_id.clone(),
            payee: payload.payee.clone(),
            payment_method: payload.payment_method.clone(),
            notes: payload.notes.clone(),
            pending: false,
            conflict: false,
            base_version: None,
            last_synced_at: None,
            receipt_url: None,
            receipt_pending: false,
        }
    }

    /// The id to address this record by against the server and the
    /// conflict store: the server id once known, the local id before that.
    pub fn sync_id(&self) -> &str {
        self.remote_id.as_deref().unwrap_or(&self.id)
    }

    pub fn payload(&self) -> TransactionPayload {
        TransactionPayload {
            amount: self.amount,
            occurred_at: self.occurred_at,
            category_id: self.category_id.clone(),
            payee: self.payee.clone(),
            payment_method: self.payment_method.clone(),
            notes: self.notes.clone(),
        }
    }

    pub fn apply_patch(&mut self, patch: &TransactionPatch) {
        let merged = self.payload().with_patch(patch);
        self.apply_payload(&merged);
    }

    pub fn apply_payload(&mut self, payload: &TransactionPayload) {
        self.amount = payload.amount;
        self.occurred_at = payload.occurred_at;
        self.category_id = payload.category_id.clone();
        self.payee = payload.payee.clone();
        self.payment_method = payload.payment_method.clone();
        self.notes = payload.notes.clone();
    }
}
