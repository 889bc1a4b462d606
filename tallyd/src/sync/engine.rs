use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use tally_core::{ApplyOutcome, LedgerApiError, LedgerClient, TransactionPatch, TransactionPayload};

use super::conflict::{ConflictRecord, LocalChanges, ServerState};
use super::notify::{ChangeHint, ChangeNotifier};
use super::now_unix;
use super::queue::{MutationPayload, QueueInput, QueueItem, QueueStatus, RecordRef};
use super::record::TransactionRecord;
use super::store::{CommitEffect, ReceiptBlobEntry, StoreError, SyncStore};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("api error: {0}")]
    Api(#[from] LedgerApiError),
    #[error("time parse error: {0}")]
    Time(#[from] time::error::Parse),
    #[error("record not found: {0}")]
    MissingRecord(String),
    #[error("record {0} has no server id yet")]
    NotSynced(String),
    #[error("receipt blob {0} is gone")]
    MissingReceipt(String),
}

impl EngineError {
    /// Failures scoped to one queue item; they park the item in `Error`
    /// instead of aborting the drain. Store failures are never item-scoped.
    fn is_item_failure(&self) -> bool {
        !matches!(self, EngineError::Store(_))
    }
}

/// Terminal outcome of processing one queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    Conflicted,
    Failed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainSummary {
    pub committed: usize,
    pub conflicts: usize,
    pub errors: usize,
}

impl DrainSummary {
    pub fn processed(&self) -> usize {
        self.committed + self.conflicts + self.errors
    }
}

enum Applied {
    Committed(CommitEffect),
    Conflicted {
        record_id: String,
        conflict: ConflictRecord,
    },
}

pub struct SyncEngine {
    pub(crate) client: LedgerClient,
    pub(crate) store: SyncStore,
    pub(crate) notifier: ChangeNotifier,
}

impl SyncEngine {
    pub fn new(client: LedgerClient, store: SyncStore) -> Self {
        Self {
            client,
            store,
            notifier: ChangeNotifier::default(),
        }
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub fn store(&self) -> &SyncStore {
        &self.store
    }

    // ---- staging commands (optimistic apply + enqueue) ----

    /// New local transaction; queued for creation on the server under a
    /// client-generated id until the server assigns one.
    pub async fn stage_create(
        &self,
        draft: TransactionPayload,
    ) -> Result<TransactionRecord, EngineError> {
        let id = Uuid::new_v4().to_string();
        let mut record = TransactionRecord::new_local(&id, &draft);
        record.pending = true;
        let input = QueueInput {
            record: RecordRef::local(&id),
            payload: MutationPayload::Create { transaction: draft },
            base_version: None,
            unconditional: false,
        };
        self.store
            .stage_mutation(&record, &input, None, now_unix())
            .await?;
        self.notifier.publish(ChangeHint::QueueChanged);
        Ok(record)
    }

    /// Sparse edit against the last-known server values, applied to the
    /// local mirror immediately. An empty patch stages nothing.
    pub async fn stage_update(
        &self,
        id: &str,
        patch: TransactionPatch,
    ) -> Result<TransactionRecord, EngineError> {
        let mut record = self
            .store
            .find_record(id)
            .await?
            .ok_or_else(|| EngineError::MissingRecord(id.to_string()))?;
        if patch.is_empty() {
            return Ok(record);
        }
        record.apply_patch(&patch);
        record.pending = true;
        let input = QueueInput {
            record: RecordRef::of_record(&record),
            payload: MutationPayload::Update { patch },
            base_version: record.base_version,
            unconditional: false,
        };
        self.store
            .stage_mutation(&record, &input, None, now_unix())
            .await?;
        self.notifier.publish(ChangeHint::QueueChanged);
        Ok(record)
    }

    /// The record row stays (hidden behind `pending`) until the delete
    /// commits; only then does the local mirror drop it.
    pub async fn stage_delete(&self, id: &str) -> Result<TransactionRecord, EngineError> {
        let mut record = self
            .store
            .find_record(id)
            .await?
            .ok_or_else(|| EngineError::MissingRecord(id.to_string()))?;
        record.pending = true;
        let input = QueueInput {
            record: RecordRef::of_record(&record),
            payload: MutationPayload::Delete,
            base_version: record.base_version,
            unconditional: false,
        };
        self.store
            .stage_mutation(&record, &input, None, now_unix())
            .await?;
        self.notifier.publish(ChangeHint::QueueChanged);
        Ok(record)
    }

    /// Stores the blob locally and queues its upload; the queue item is the
    /// only link between blob and transaction until the upload commits into
    /// a durable `receipt_url`.
    pub async fn attach_receipt(
        &self,
        id: &str,
        blob: Vec<u8>,
        mime: &str,
    ) -> Result<String, EngineError> {
        let mut record = self
            .store
            .find_record(id)
            .await?
            .ok_or_else(|| EngineError::MissingRecord(id.to_string()))?;
        record.pending = true;
        record.receipt_pending = true;
        let key = Uuid::new_v4().to_string();
        let entry = ReceiptBlobEntry {
            key: key.clone(),
            size: blob.len() as i64,
            blob,
            mime: mime.to_string(),
            record: RecordRef::of_record(&record),
            created_at: now_unix(),
        };
        let input = QueueInput {
            record: RecordRef::of_record(&record),
            payload: MutationPayload::UploadReceipt {
                receipt_key: key.clone(),
            },
            base_version: None,
            unconditional: false,
        };
        self.store
            .stage_mutation(&record, &input, Some(&entry), now_unix())
            .await?;
        self.notifier.publish(ChangeHint::QueueChanged);
        Ok(key)
    }

    // ---- queue management ----

    pub async fn retry(&self, item_id: i64) -> Result<bool, EngineError> {
        let changed = self.store.retry(item_id, now_unix()).await?;
        if changed {
            self.notifier.publish(ChangeHint::QueueChanged);
        }
        Ok(changed)
    }

    pub async fn retry_all_errors(&self) -> Result<u64, EngineError> {
        let changed = self.store.retry_all_errors(now_unix()).await?;
        if changed > 0 {
            self.notifier.publish(ChangeHint::QueueChanged);
        }
        Ok(changed)
    }

    pub async fn remove_item(&self, item_id: i64, delete_orphan: bool) -> Result<bool, EngineError> {
        let removed = self.store.remove_error_item(item_id, delete_orphan).await?;
        if removed {
            self.notifier.publish(ChangeHint::QueueChanged);
        }
        Ok(removed)
    }

    /// Startup recovery for items a dead process left in `Processing`.
    pub async fn recover_processing(&self) -> Result<u64, EngineError> {
        Ok(self.store.recover_processing(now_unix()).await?)
    }

    pub async fn prune_done(&self, retention_secs: i64) -> Result<u64, EngineError> {
        let cutoff = now_unix().saturating_sub(retention_secs);
        Ok(self.store.prune_done(cutoff).await?)
    }

    // ---- read models ----

    pub async fn get_record(&self, id: &str) -> Result<Option<TransactionRecord>, EngineError> {
        Ok(self.store.find_record(id).await?)
    }

    pub async fn list_records(&self) -> Result<Vec<TransactionRecord>, EngineError> {
        Ok(self.store.list_records().await?)
    }

    pub async fn list_queue(&self) -> Result<Vec<QueueItem>, EngineError> {
        Ok(self.store.list_queue().await?)
    }

    pub async fn list_queue_by_status(
        &self,
        status: QueueStatus,
    ) -> Result<Vec<QueueItem>, EngineError> {
        Ok(self.store.list_queue_by_status(status).await?)
    }

    pub async fn list_conflicts(&self) -> Result<Vec<ConflictRecord>, EngineError> {
        Ok(self.store.list_conflicts().await?)
    }

    // ---- draining ----

    /// Applies the oldest `Pending` item, if any. FIFO across the queue;
    /// an item-scoped failure parks that item in `Error` and still counts
    /// as progress.
    pub async fn run_once(&self) -> Result<Option<Outcome>, EngineError> {
        let Some(item) = self.store.begin_next_pending(now_unix()).await? else {
            return Ok(None);
        };
        eprintln!(
            "[tallyd] op start: kind={} item={}",
            item.kind().as_str(),
            item.id
        );

        match self.apply_item(&item).await {
            Ok(Applied::Committed(effect)) => {
                self.store.mark_done(item.id, effect, now_unix()).await?;
                self.notifier.publish(ChangeHint::QueueChanged);
                eprintln!(
                    "[tallyd] op done: kind={} item={}",
                    item.kind().as_str(),
                    item.id
                );
                Ok(Some(Outcome::Committed))
            }
            Ok(Applied::Conflicted {
                record_id,
                conflict,
            }) => {
                self.store
                    .mark_conflict(item.id, &record_id, &conflict, now_unix())
                    .await?;
                self.notifier.publish(ChangeHint::QueueChanged);
                self.notifier.publish(ChangeHint::ConflictsChanged);
                eprintln!(
                    "[tallyd] op conflict: kind={} item={} txn={}",
                    item.kind().as_str(),
                    item.id,
                    conflict.id
                );
                Ok(Some(Outcome::Conflicted))
            }
            Err(err) if err.is_item_failure() => {
                self.store
                    .mark_error(item.id, &err.to_string(), now_unix())
                    .await?;
                self.notifier.publish(ChangeHint::QueueChanged);
                eprintln!(
                    "[tallyd] op failed: kind={} item={} err={}",
                    item.kind().as_str(),
                    item.id,
                    err
                );
                Ok(Some(Outcome::Failed))
            }
            Err(err) => Err(err),
        }
    }

    /// Processes until no `Pending` item remains.
    pub async fn drain(&self) -> Result<DrainSummary, EngineError> {
        let mut summary = DrainSummary::default();
        while let Some(outcome) = self.run_once().await? {
            match outcome {
                Outcome::Committed => summary.committed += 1,
                Outcome::Conflicted => summary.conflicts += 1,
                Outcome::Failed => summary.errors += 1,
            }
        }
        Ok(summary)
    }

    async fn apply_item(&self, item: &QueueItem) -> Result<Applied, EngineError> {
        let record = self
            .store
            .resolve_ref(&item.record)
            .await?
            .ok_or_else(|| EngineError::MissingRecord(describe_ref(&item.record)))?;

        match &item.payload {
            MutationPayload::Create { transaction } => {
                let receipt = self.client.create_transaction(transaction).await?;
                Ok(Applied::Committed(CommitEffect::Refresh {
                    record_id: record.id,
                    remote_id: Some(receipt.id),
                    new_version: receipt.version,
                    synced_at: parse_updated_at(&receipt.updated_at)?,
                }))
            }
            MutationPayload::Update { patch } => {
                let remote_id = record
                    .remote_id
                    .clone()
                    .ok_or_else(|| EngineError::NotSynced(record.id.clone()))?;
                let precondition = precondition_of(item);
                match self
                    .client
                    .update_transaction(&remote_id, patch, precondition)
                    .await?
                {
                    ApplyOutcome::Committed(receipt) => {
                        Ok(Applied::Committed(CommitEffect::Refresh {
                            record_id: record.id,
                            remote_id: None,
                            new_version: receipt.version,
                            synced_at: parse_updated_at(&receipt.updated_at)?,
                        }))
                    }
                    ApplyOutcome::Conflict(snapshot) => Ok(Applied::Conflicted {
                        record_id: record.id,
                        conflict: ConflictRecord {
                            id: remote_id,
                            my_changes: LocalChanges {
                                payload: item.payload.clone(),
                                base_version: item.base_version,
                            },
                            server: ServerState {
                                payload: snapshot.transaction,
                                version: snapshot.version,
                                updated_at: parse_updated_at(&snapshot.updated_at)?,
                            },
                            decided: None,
                            decided_payload: None,
                            created_at: now_unix(),
                        },
                    }),
                }
            }
            MutationPayload::Delete => {
                let remote_id = match record.remote_id.clone() {
                    Some(remote_id) => remote_id,
                    // Never reached the server: deleting the local row is
                    // the whole mutation.
                    None => {
                        return Ok(Applied::Committed(CommitEffect::Remove {
                            record_id: record.id,
                        }));
                    }
                };
                let precondition = precondition_of(item);
                match self
                    .client
                    .delete_transaction(&remote_id, precondition)
                    .await?
                {
                    ApplyOutcome::Committed(_) => Ok(Applied::Committed(CommitEffect::Remove {
                        record_id: record.id,
                    })),
                    ApplyOutcome::Conflict(snapshot) => Ok(Applied::Conflicted {
                        record_id: record.id,
                        conflict: ConflictRecord {
                            id: remote_id,
                            my_changes: LocalChanges {
                                payload: item.payload.clone(),
                                base_version: item.base_version,
                            },
                            server: ServerState {
                                payload: snapshot.transaction,
                                version: snapshot.version,
                                updated_at: parse_updated_at(&snapshot.updated_at)?,
                            },
                            decided: None,
                            decided_payload: None,
                            created_at: now_unix(),
                        },
                    }),
                }
            }
            MutationPayload::UploadReceipt { receipt_key } => {
                let remote_id = record
                    .remote_id
                    .clone()
                    .ok_or_else(|| EngineError::NotSynced(record.id.clone()))?;
                let entry = self
                    .store
                    .get_receipt(receipt_key)
                    .await?
                    .ok_or_else(|| EngineError::MissingReceipt(receipt_key.clone()))?;
                let receipt = self
                    .client
                    .upload_receipt(&remote_id, entry.blob, &entry.mime)
                    .await?;
                Ok(Applied::Committed(CommitEffect::Receipt {
                    record_id: record.id,
                    receipt_url: receipt.receipt_url,
                    receipt_key: receipt_key.clone(),
                    new_version: receipt.version,
                    synced_at: parse_updated_at(&receipt.updated_at)?,
                }))
            }
        }
    }
}

/// `base_version = None` means "no precondition"; the last-writer-wins
/// override drops the precondition outright.
fn precondition_of(item: &QueueItem) -> Option<i64> {
    if item.unconditional {
        None
    } else {
        item.base_version
    }
}

fn describe_ref(record_ref: &RecordRef) -> String {
    match (&record_ref.local_id, &record_ref.remote_id) {
        (Some(local_id), _) => local_id.clone(),
        (None, Some(remote_id)) => remote_id.clone(),
        (None, None) => "<no ref>".to_string(),
    }
}

fn parse_updated_at(value: &str) -> Result<i64, time::error::Parse> {
    Ok(OffsetDateTime::parse(value, &Rfc3339)?.unix_timestamp())
}
