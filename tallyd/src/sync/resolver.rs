use tally_core::{TransactionPatch, TransactionPayload};

use super::conflict::{ConflictRecord, Decision, MergeSelection, merge_payloads};
use super::engine::{EngineError, SyncEngine};
use super::notify::ChangeHint;
use super::now_unix;
use super::queue::{MutationPayload, QueueInput, QueueStatus, RecordRef};
use super::record::TransactionRecord;
use super::store::Resolution;

impl SyncEngine {
    /// Keep the local change: re-send it as a last-writer-wins update and
    /// drop the conflict. A missing conflict is a successful no-op (it was
    /// resolved from another context).
    pub async fn resolve_keep_mine(&self, id: &str) -> Result<(), EngineError> {
        let Some(conflict) = self.store.get_conflict(id).await? else {
            return Ok(());
        };
        self.store
            .set_decided(&conflict.id, Decision::Mine, None)
            .await?;
        self.finish_keep_mine(&conflict).await
    }

    /// Keep the server state: overwrite the local mirror, discard the
    /// colliding and failed local edits, drop the conflict.
    pub async fn resolve_keep_server(&self, id: &str) -> Result<(), EngineError> {
        let Some(conflict) = self.store.get_conflict(id).await? else {
            return Ok(());
        };
        self.store
            .set_decided(&conflict.id, Decision::Server, None)
            .await?;
        self.finish_keep_server(&conflict).await
    }

    /// Field-level merge: the caller picks mine/server per field; the
    /// composed payload overwrites the local mirror and goes back out as a
    /// fresh update.
    pub async fn resolve_merge(
        &self,
        id: &str,
        selection: &MergeSelection,
    ) -> Result<(), EngineError> {
        let Some(conflict) = self.store.get_conflict(id).await? else {
            return Ok(());
        };
        let record = self.store.find_record(&conflict.id).await?;
        let mine = conflict.effective_mine(record.as_ref().map(|r| r.payload()).as_ref());
        let merged = merge_payloads(&mine, &conflict.server.payload, selection);
        let patch = TransactionPatch::overwrite(&merged);
        self.store
            .set_decided(&conflict.id, Decision::Merge, Some(&patch))
            .await?;
        let resolution = plan_merge_from_patch(&conflict, record.as_ref(), &patch);
        self.store.apply_resolution(&resolution, now_unix()).await?;
        self.publish_resolution();
        Ok(())
    }

    pub async fn bulk_resolve_keep_mine(&self) -> Result<usize, EngineError> {
        let conflicts = self.store.list_conflicts().await?;
        let mut resolved = 0;
        for conflict in conflicts {
            self.resolve_keep_mine(&conflict.id).await?;
            resolved += 1;
        }
        Ok(resolved)
    }

    pub async fn bulk_resolve_keep_server(&self) -> Result<usize, EngineError> {
        let conflicts = self.store.list_conflicts().await?;
        let mut resolved = 0;
        for conflict in conflicts {
            self.resolve_keep_server(&conflict.id).await?;
            resolved += 1;
        }
        Ok(resolved)
    }

    /// Startup resume: any conflict still carrying a `decided` marker was
    /// interrupted between choosing a strategy and finishing its cleanup;
    /// replay the committed choice.
    pub async fn resume_decided(&self) -> Result<usize, EngineError> {
        let mut resumed = 0;
        for conflict in self.store.list_conflicts().await? {
            let Some(decision) = conflict.decided else {
                continue;
            };
            match decision {
                Decision::Mine => self.finish_keep_mine(&conflict).await?,
                Decision::Server => self.finish_keep_server(&conflict).await?,
                Decision::Merge => {
                    let record = self.store.find_record(&conflict.id).await?;
                    let patch = match &conflict.decided_payload {
                        Some(patch) => patch.clone(),
                        // Marker written without a composed payload; fall
                        // back to the rejected change itself.
                        None => TransactionPatch::overwrite(
                            &conflict
                                .effective_mine(record.as_ref().map(|r| r.payload()).as_ref()),
                        ),
                    };
                    let resolution = plan_merge_from_patch(&conflict, record.as_ref(), &patch);
                    self.store.apply_resolution(&resolution, now_unix()).await?;
                }
            }
            resumed += 1;
        }
        if resumed > 0 {
            self.publish_resolution();
        }
        Ok(resumed)
    }

    async fn finish_keep_mine(&self, conflict: &ConflictRecord) -> Result<(), EngineError> {
        let record = self.store.find_record(&conflict.id).await?;
        let resolution = plan_keep_mine(conflict, record.as_ref());
        self.store.apply_resolution(&resolution, now_unix()).await?;
        self.publish_resolution();
        Ok(())
    }

    async fn finish_keep_server(&self, conflict: &ConflictRecord) -> Result<(), EngineError> {
        let record = self.store.find_record(&conflict.id).await?;
        let resolution = plan_keep_server(conflict, record.as_ref());
        self.store.apply_resolution(&resolution, now_unix()).await?;
        self.publish_resolution();
        Ok(())
    }

    fn publish_resolution(&self) {
        self.notifier.publish(ChangeHint::QueueChanged);
        self.notifier.publish(ChangeHint::ConflictsChanged);
    }
}

/// Local mirror for a conflict whose record row is gone (resolved from a
/// context that already dropped it); rebuilt server-side-up.
fn reconstruct_record(conflict: &ConflictRecord, payload: &TransactionPayload) -> TransactionRecord {
    let mut record = TransactionRecord::new_local(conflict.id.clone(), payload);
    record.remote_id = Some(conflict.id.clone());
    record
}

pub fn plan_keep_mine(
    conflict: &ConflictRecord,
    record: Option<&TransactionRecord>,
) -> Resolution {
    // A rejected delete keeps its meaning: re-issue it unconditionally.
    if matches!(conflict.my_changes.payload, MutationPayload::Delete) {
        let mut row = record
            .cloned()
            .unwrap_or_else(|| reconstruct_record(conflict, &conflict.server.payload));
        row.pending = true;
        row.conflict = false;
        return Resolution {
            conflict_id: conflict.id.clone(),
            enqueue: Some(QueueInput {
                record: RecordRef::of_record(&row),
                payload: MutationPayload::Delete,
                base_version: None,
                unconditional: true,
            }),
            remove_statuses: vec![QueueStatus::Conflict],
            record: row,
        };
    }

    let mine = conflict.effective_mine(record.map(|r| r.payload()).as_ref());
    let mut row = record
        .cloned()
        .unwrap_or_else(|| reconstruct_record(conflict, &mine));
    row.apply_payload(&mine);
    row.pending = true;
    row.conflict = false;
    Resolution {
        conflict_id: conflict.id.clone(),
        enqueue: Some(QueueInput {
            record: RecordRef::of_record(&row),
            payload: MutationPayload::Update {
                patch: TransactionPatch::overwrite(&mine),
            },
            base_version: None,
            unconditional: true,
        }),
        remove_statuses: vec![QueueStatus::Conflict],
        record: row,
    }
}

pub fn plan_keep_server(
    conflict: &ConflictRecord,
    record: Option<&TransactionRecord>,
) -> Resolution {
    let mut row = record
        .cloned()
        .unwrap_or_else(|| reconstruct_record(conflict, &conflict.server.payload));
    row.apply_payload(&conflict.server.payload);
    if row.remote_id.is_none() {
        row.remote_id = Some(conflict.id.clone());
    }
    row.pending = false;
    row.conflict = false;
    row.base_version = Some(conflict.server.version);
    row.last_synced_at = Some(conflict.server.updated_at);
    Resolution {
        conflict_id: conflict.id.clone(),
        enqueue: None,
        // Local edits are discarded, not retried.
        remove_statuses: vec![QueueStatus::Conflict, QueueStatus::Error],
        record: row,
    }
}

fn plan_merge_from_patch(
    conflict: &ConflictRecord,
    record: Option<&TransactionRecord>,
    patch: &TransactionPatch,
) -> Resolution {
    let merged = conflict.server.payload.with_patch(patch);
    let mut row = record
        .cloned()
        .unwrap_or_else(|| reconstruct_record(conflict, &merged));
    row.apply_payload(&merged);
    row.pending = true;
    row.conflict = false;
    Resolution {
        conflict_id: conflict.id.clone(),
        enqueue: Some(QueueInput {
            record: RecordRef::of_record(&row),
            payload: MutationPayload::Update {
                patch: patch.clone(),
            },
            // Weakest precondition of the three paths: no token, but not
            // the last-writer-wins override either.
            base_version: None,
            unconditional: false,
        }),
        remove_statuses: vec![QueueStatus::Conflict],
        record: row,
    }
}
