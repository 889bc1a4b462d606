use std::{fs, path::Path, path::PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool, migrate::Migrator};
use thiserror::Error;

use tally_core::TransactionPatch;

use super::conflict::{ConflictRecord, Decision, LocalChanges, ServerState};
use super::queue::{MutationKind, QueueInput, QueueItem, QueueStateError, QueueStatus, RecordRef};
use super::record::TransactionRecord;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("{0}")]
    State(#[from] QueueStateError),
    #[error("payload encoding error: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("queue item reference carries no ids")]
    EmptyRef,
}

/// Pending receipt attachment; owned by its `UploadReceipt` queue item and
/// deleted once that item commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptBlobEntry {
    pub key: String,
    pub blob: Vec<u8>,
    pub mime: String,
    pub size: i64,
    pub record: RecordRef,
    pub created_at: i64,
}

/// Record-side effect of a committed queue item, applied atomically with
/// the item's `Done` transition.
#[derive(Debug, Clone)]
pub enum CommitEffect {
    /// Create/Update committed: refresh the concurrency token and, for
    /// creates, learn the server-assigned id.
    Refresh {
        record_id: String,
        remote_id: Option<String>,
        new_version: i64,
        synced_at: i64,
    },
    /// Delete committed: the local mirror goes away.
    Remove { record_id: String },
    /// Receipt upload committed: durable url replaces the local blob.
    Receipt {
        record_id: String,
        receipt_url: Option<String>,
        receipt_key: String,
        new_version: i64,
        synced_at: i64,
    },
}

/// Output of a resolver strategy, applied as one transaction: a record
/// write, stale-item removal, an optional replacement queue item, and the
/// conflict row's deletion.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub conflict_id: String,
    pub record: TransactionRecord,
    pub enqueue: Option<QueueInput>,
    pub remove_statuses: Vec<QueueStatus>,
}

pub struct SyncStore {
    pool: SqlitePool,
}

impl SyncStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open_at(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open_default() -> Result<Self, StoreError> {
        Self::open_at(&default_db_path()?).await
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    // ---- transaction records ----

    pub async fn upsert_record(&self, record: &TransactionRecord) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_record_on(&mut conn, record).await?;
        Ok(())
    }

    pub async fn get_record(&self, id: &str) -> Result<Option<TransactionRecord>, StoreError> {
        let row = sqlx::query(RECORD_SELECT_BY_ID)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Lookup by either the local or the server-assigned id.
    pub async fn find_record(&self, id: &str) -> Result<Option<TransactionRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, remote_id, amount, occurred_at, category_id, payee, payment_method, notes,
                    pending, conflict, base_version, last_synced_at, receipt_url, receipt_pending
             FROM records WHERE id = ?1 OR remote_id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn resolve_ref(
        &self,
        record_ref: &RecordRef,
    ) -> Result<Option<TransactionRecord>, StoreError> {
        if let Some(local_id) = &record_ref.local_id
            && let Some(record) = self.get_record(local_id).await?
        {
            return Ok(Some(record));
        }
        if let Some(remote_id) = &record_ref.remote_id {
            return self.find_record(remote_id).await;
        }
        Ok(None)
    }

    pub async fn list_records(&self) -> Result<Vec<TransactionRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, remote_id, amount, occurred_at, category_id, payee, payment_method, notes,
                    pending, conflict, base_version, last_synced_at, receipt_url, receipt_pending
             FROM records ORDER BY occurred_at DESC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn delete_record(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM records WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- staging ----

    /// Optimistic local write paired with its queue entry (and, for receipt
    /// attachments, the blob) in a single transaction.
    pub async fn stage_mutation(
        &self,
        record: &TransactionRecord,
        input: &QueueInput,
        receipt: Option<&ReceiptBlobEntry>,
        now: i64,
    ) -> Result<QueueItem, StoreError> {
        if !input.record.is_valid() {
            return Err(StoreError::EmptyRef);
        }
        let mut tx = self.pool.begin().await?;
        upsert_record_on(&mut tx, record).await?;
        if let Some(entry) = receipt {
            sqlx::query(
                "INSERT INTO receipts (key, blob, mime, size, local_id, remote_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .bind(&entry.key)
            .bind(&entry.blob)
            .bind(&entry.mime)
            .bind(entry.size)
            .bind(&entry.record.local_id)
            .bind(&entry.record.remote_id)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await?;
        }
        let item = insert_queue_item(&mut tx, input, now).await?;
        tx.commit().await?;
        Ok(item)
    }

    // ---- queue ----

    pub async fn get_item(&self, item_id: i64) -> Result<Option<QueueItem>, StoreError> {
        let row = sqlx::query(ITEM_SELECT_BY_ID)
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    pub async fn list_queue(&self) -> Result<Vec<QueueItem>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, kind, local_id, remote_id, payload, base_version, unconditional, status,
                    error, created_at, updated_at
             FROM queue ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    pub async fn list_queue_by_status(
        &self,
        status: QueueStatus,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, kind, local_id, remote_id, payload, base_version, unconditional, status,
                    error, created_at, updated_at
             FROM queue WHERE status = ?1 ORDER BY id ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    /// Oldest `Pending` item, atomically moved to `Processing`. FIFO across
    /// the whole queue, one item in flight at a time.
    pub async fn begin_next_pending(&self, now: i64) -> Result<Option<QueueItem>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT id, kind, local_id, remote_id, payload, base_version, unconditional, status,
                    error, created_at, updated_at
             FROM queue WHERE status = 'pending' ORDER BY id ASC LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut item = item_from_row(&row)?;
        sqlx::query("UPDATE queue SET status = 'processing', updated_at = ?1 WHERE id = ?2")
            .bind(now)
            .bind(item.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        item.status = QueueStatus::Processing;
        item.updated_at = now;
        Ok(Some(item))
    }

    /// Commit handling: queue item to `Done` plus the paired record write.
    /// Returns `false` (and does nothing) when the item is gone or no
    /// longer `Processing` - another context finished it first.
    pub async fn mark_done(
        &self,
        item_id: i64,
        effect: CommitEffect,
        now: i64,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        if !guard_processing(&mut tx, item_id).await? {
            return Ok(false);
        }
        sqlx::query("UPDATE queue SET status = 'done', error = NULL, updated_at = ?1 WHERE id = ?2")
            .bind(now)
            .bind(item_id)
            .execute(&mut *tx)
            .await?;

        match &effect {
            CommitEffect::Refresh {
                record_id,
                remote_id,
                new_version,
                synced_at,
            } => {
                sqlx::query(
                    "UPDATE records SET remote_id = COALESCE(?1, remote_id), base_version = ?2,
                            last_synced_at = ?3, conflict = 0
                     WHERE id = ?4",
                )
                .bind(remote_id)
                .bind(new_version)
                .bind(synced_at)
                .bind(record_id)
                .execute(&mut *tx)
                .await?;
                delete_conflicts_for(&mut tx, record_id).await?;
                recompute_flags(&mut tx, record_id).await?;
            }
            CommitEffect::Remove { record_id } => {
                delete_conflicts_for(&mut tx, record_id).await?;
                sqlx::query("DELETE FROM records WHERE id = ?1")
                    .bind(record_id)
                    .execute(&mut *tx)
                    .await?;
            }
            CommitEffect::Receipt {
                record_id,
                receipt_url,
                receipt_key,
                new_version,
                synced_at,
            } => {
                sqlx::query(
                    "UPDATE records SET receipt_url = COALESCE(?1, receipt_url), base_version = ?2,
                            last_synced_at = ?3
                     WHERE id = ?4",
                )
                .bind(receipt_url)
                .bind(new_version)
                .bind(synced_at)
                .bind(record_id)
                .execute(&mut *tx)
                .await?;
                sqlx::query("DELETE FROM receipts WHERE key = ?1")
                    .bind(receipt_key)
                    .execute(&mut *tx)
                    .await?;
                recompute_flags(&mut tx, record_id).await?;
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Transient failure: item to `Error`, record state untouched.
    pub async fn mark_error(
        &self,
        item_id: i64,
        reason: &str,
        now: i64,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        if !guard_processing(&mut tx, item_id).await? {
            return Ok(false);
        }
        sqlx::query("UPDATE queue SET status = 'error', error = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(reason)
            .bind(now)
            .bind(item_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Version conflict: item to `Conflict`, conflict row written (or
    /// overwritten - one collision per transaction id), record flagged.
    pub async fn mark_conflict(
        &self,
        item_id: i64,
        record_id: &str,
        conflict: &ConflictRecord,
        now: i64,
    ) -> Result<bool, StoreError> {
        let my_payload = serde_json::to_string(&conflict.my_changes.payload)?;
        let server_payload = serde_json::to_string(&conflict.server.payload)?;
        let mut tx = self.pool.begin().await?;
        if !guard_processing(&mut tx, item_id).await? {
            return Ok(false);
        }
        sqlx::query(
            "UPDATE queue SET status = 'conflict', error = NULL, updated_at = ?1 WHERE id = ?2",
        )
        .bind(now)
        .bind(item_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO conflicts (id, my_payload, my_base_version, server_payload,
                                    server_version, server_updated_at, decided, decided_payload,
                                    created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, ?7)
             ON CONFLICT(id) DO UPDATE SET
                my_payload = excluded.my_payload,
                my_base_version = excluded.my_base_version,
                server_payload = excluded.server_payload,
                server_version = excluded.server_version,
                server_updated_at = excluded.server_updated_at,
                decided = NULL,
                decided_payload = NULL,
                created_at = excluded.created_at;",
        )
        .bind(&conflict.id)
        .bind(&my_payload)
        .bind(conflict.my_changes.base_version)
        .bind(&server_payload)
        .bind(conflict.server.version)
        .bind(conflict.server.updated_at)
        .bind(conflict.created_at)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE records SET conflict = 1 WHERE id = ?1")
            .bind(record_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// `Error -> Pending`; a no-op returning `false` for any other status.
    pub async fn retry(&self, item_id: i64, now: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE queue SET status = 'pending', error = NULL, updated_at = ?1
             WHERE id = ?2 AND status = 'error'",
        )
        .bind(now)
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn retry_all_errors(&self, now: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE queue SET status = 'pending', error = NULL, updated_at = ?1
             WHERE status = 'error'",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// User removal of a failed item; only `Error` items can be removed.
    /// For a failed `Create`, `delete_orphan` also drops the local-only
    /// record (no server copy exists to reconcile against) along with any
    /// later items queued against it.
    pub async fn remove_error_item(
        &self,
        item_id: i64,
        delete_orphan: bool,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(ITEM_SELECT_BY_ID)
            .bind(item_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let item = item_from_row(&row)?;
        if item.status != QueueStatus::Error {
            return Ok(false);
        }
        sqlx::query("DELETE FROM queue WHERE id = ?1")
            .bind(item_id)
            .execute(&mut *tx)
            .await?;
        if let super::queue::MutationPayload::UploadReceipt { receipt_key } = &item.payload {
            sqlx::query("DELETE FROM receipts WHERE key = ?1")
                .bind(receipt_key)
                .execute(&mut *tx)
                .await?;
        }

        let record = resolve_ref_on(&mut tx, &item.record).await?;
        if let Some(record) = record {
            let orphaned_create = delete_orphan
                && item.kind() == MutationKind::Create
                && record.remote_id.is_none();
            if orphaned_create {
                sqlx::query("DELETE FROM queue WHERE local_id = ?1")
                    .bind(&record.id)
                    .execute(&mut *tx)
                    .await?;
                delete_conflicts_for(&mut tx, &record.id).await?;
                sqlx::query("DELETE FROM records WHERE id = ?1")
                    .bind(&record.id)
                    .execute(&mut *tx)
                    .await?;
            } else {
                recompute_flags(&mut tx, &record.id).await?;
            }
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Drops `Done` items older than `cutoff`; bounded recent history only.
    pub async fn prune_done(&self, cutoff: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM queue WHERE status = 'done' AND updated_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Startup-only recovery: a previous process died mid-apply, so any
    /// `Processing` row is stale and goes back to `Pending`.
    pub async fn recover_processing(&self, now: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE queue SET status = 'pending', updated_at = ?1 WHERE status = 'processing'",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ---- conflicts ----

    pub async fn get_conflict(&self, id: &str) -> Result<Option<ConflictRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, my_payload, my_base_version, server_payload, server_version,
                    server_updated_at, decided, decided_payload, created_at
             FROM conflicts WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conflict_from_row).transpose()
    }

    pub async fn list_conflicts(&self) -> Result<Vec<ConflictRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, my_payload, my_base_version, server_payload, server_version,
                    server_updated_at, decided, decided_payload, created_at
             FROM conflicts ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(conflict_from_row).collect()
    }

    /// Marks the chosen strategy before its mutations run, so an
    /// interrupted resolution can be resumed. The merge path also stores
    /// the composed payload, which is what resume replays.
    pub async fn set_decided(
        &self,
        id: &str,
        decision: Decision,
        merged: Option<&TransactionPatch>,
    ) -> Result<bool, StoreError> {
        let payload = merged.map(serde_json::to_string).transpose()?;
        let result =
            sqlx::query("UPDATE conflicts SET decided = ?1, decided_payload = ?2 WHERE id = ?3")
                .bind(decision.as_str())
                .bind(payload)
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Applies a resolver decision as one transaction: record write, stale
    /// queue-item removal, optional replacement item, conflict deletion.
    pub async fn apply_resolution(
        &self,
        resolution: &Resolution,
        now: i64,
    ) -> Result<Option<QueueItem>, StoreError> {
        let mut tx = self.pool.begin().await?;
        upsert_record_on(&mut tx, &resolution.record).await?;
        for status in &resolution.remove_statuses {
            sqlx::query(
                "DELETE FROM queue
                 WHERE status = ?1
                   AND (local_id = ?2 OR (?3 IS NOT NULL AND remote_id = ?3))",
            )
            .bind(status.as_str())
            .bind(&resolution.record.id)
            .bind(&resolution.record.remote_id)
            .execute(&mut *tx)
            .await?;
        }
        let item = match &resolution.enqueue {
            Some(input) => Some(insert_queue_item(&mut tx, input, now).await?),
            None => None,
        };
        sqlx::query("DELETE FROM conflicts WHERE id = ?1")
            .bind(&resolution.conflict_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(item)
    }

    // ---- receipts ----

    pub async fn get_receipt(&self, key: &str) -> Result<Option<ReceiptBlobEntry>, StoreError> {
        let row = sqlx::query(
            "SELECT key, blob, mime, size, local_id, remote_id, created_at
             FROM receipts WHERE key = ?1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ReceiptBlobEntry {
            key: row.try_get("key")?,
            blob: row.try_get("blob")?,
            mime: row.try_get("mime")?,
            size: row.try_get("size")?,
            record: RecordRef {
                local_id: row.try_get("local_id")?,
                remote_id: row.try_get("remote_id")?,
            },
            created_at: row.try_get("created_at")?,
        }))
    }

    pub async fn delete_receipt(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM receipts WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

const RECORD_SELECT_BY_ID: &str =
    "SELECT id, remote_id, amount, occurred_at, category_id, payee, payment_method, notes,
            pending, conflict, base_version, last_synced_at, receipt_url, receipt_pending
     FROM records WHERE id = ?1";

const ITEM_SELECT_BY_ID: &str =
    "SELECT id, kind, local_id, remote_id, payload, base_version, unconditional, status,
            error, created_at, updated_at
     FROM queue WHERE id = ?1";

async fn upsert_record_on(
    conn: &mut SqliteConnection,
    record: &TransactionRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO records (id, remote_id, amount, occurred_at, category_id, payee,
                              payment_method, notes, pending, conflict, base_version,
                              last_synced_at, receipt_url, receipt_pending)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(id) DO UPDATE SET
            remote_id = excluded.remote_id,
            amount = excluded.amount,
            occurred_at = excluded.occurred_at,
            category_id = excluded.category_id,
            payee = excluded.payee,
            payment_method = excluded.payment_method,
            notes = excluded.notes,
            pending = excluded.pending,
            conflict = excluded.conflict,
            base_version = excluded.base_version,
            last_synced_at = excluded.last_synced_at,
            receipt_url = excluded.receipt_url,
            receipt_pending = excluded.receipt_pending;",
    )
    .bind(&record.id)
    .bind(&record.remote_id)
    .bind(record.amount)
    .bind(record.occurred_at)
    .bind(&record.category_id)
    .bind(&record.payee)
    .bind(&record.payment_method)
    .bind(&record.notes)
    .bind(if record.pending { 1 } else { 0 })
    .bind(if record.conflict { 1 } else { 0 })
    .bind(record.base_version)
    .bind(record.last_synced_at)
    .bind(&record.receipt_url)
    .bind(if record.receipt_pending { 1 } else { 0 })
    .execute(conn)
    .await?;
    Ok(())
}

async fn insert_queue_item(
    conn: &mut SqliteConnection,
    input: &QueueInput,
    now: i64,
) -> Result<QueueItem, StoreError> {
    let payload_json = serde_json::to_string(&input.payload)?;
    let result = sqlx::query(
        "INSERT INTO queue (kind, local_id, remote_id, payload, base_version, unconditional,
                            status, error, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', NULL, ?7, ?7)",
    )
    .bind(input.payload.kind().as_str())
    .bind(&input.record.local_id)
    .bind(&input.record.remote_id)
    .bind(&payload_json)
    .bind(input.base_version)
    .bind(if input.unconditional { 1 } else { 0 })
    .bind(now)
    .execute(conn)
    .await?;
    Ok(QueueItem {
        id: result.last_insert_rowid(),
        record: input.record.clone(),
        payload: input.payload.clone(),
        base_version: input.base_version,
        unconditional: input.unconditional,
        status: QueueStatus::Pending,
        error: None,
        created_at: now,
        updated_at: now,
    })
}

async fn guard_processing(conn: &mut SqliteConnection, item_id: i64) -> Result<bool, StoreError> {
    let row = sqlx::query("SELECT status FROM queue WHERE id = ?1")
        .bind(item_id)
        .fetch_optional(&mut *conn)
        .await?;
    let Some(row) = row else {
        return Ok(false);
    };
    let status: String = row.try_get("status")?;
    Ok(QueueStatus::parse(&status)? == QueueStatus::Processing)
}

/// Conflict rows are keyed by the sync id (server id once known); drop any
/// row keyed by either identity of the record.
async fn delete_conflicts_for(
    conn: &mut SqliteConnection,
    record_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "DELETE FROM conflicts
         WHERE id = ?1 OR id = (SELECT remote_id FROM records WHERE id = ?1)",
    )
    .bind(record_id)
    .execute(conn)
    .await?;
    Ok(())
}

/// `pending`/`receipt_pending` are derived from the items still in flight
/// for the record; recomputed inside the same transaction as the queue
/// mutation that may have changed them.
async fn recompute_flags(conn: &mut SqliteConnection, record_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE records SET
            pending = EXISTS(
                SELECT 1 FROM queue
                WHERE queue.status IN ('pending', 'processing', 'error', 'conflict')
                  AND (queue.local_id = records.id
                       OR (records.remote_id IS NOT NULL AND queue.remote_id = records.remote_id))
            ),
            receipt_pending = EXISTS(
                SELECT 1 FROM queue
                WHERE queue.kind = 'upload_receipt'
                  AND queue.status IN ('pending', 'processing', 'error', 'conflict')
                  AND (queue.local_id = records.id
                       OR (records.remote_id IS NOT NULL AND queue.remote_id = records.remote_id))
            )
         WHERE id = ?1",
    )
    .bind(record_id)
    .execute(conn)
    .await?;
    Ok(())
}

async fn resolve_ref_on(
    conn: &mut SqliteConnection,
    record_ref: &RecordRef,
) -> Result<Option<TransactionRecord>, StoreError> {
    let id = match (&record_ref.local_id, &record_ref.remote_id) {
        (Some(local_id), _) => local_id,
        (None, Some(remote_id)) => remote_id,
        (None, None) => return Ok(None),
    };
    let row = sqlx::query(
        "SELECT id, remote_id, amount, occurred_at, category_id, payee, payment_method, notes,
                pending, conflict, base_version, last_synced_at, receipt_url, receipt_pending
         FROM records WHERE id = ?1 OR remote_id = ?1",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(record_from_row).transpose()
}

fn record_from_row(row: &SqliteRow) -> Result<TransactionRecord, StoreError> {
    let pending: i64 = row.try_get("pending")?;
    let conflict: i64 = row.try_get("conflict")?;
    let receipt_pending: i64 = row.try_get("receipt_pending")?;
    Ok(TransactionRecord {
        id: row.try_get("id")?,
        remote_id: row.try_get("remote_id")?,
        amount: row.try_get("amount")?,
        occurred_at: row.try_get("occurred_at")?,
        category_id: row.try_get("category_id")?,
        payee: row.try_get("payee")?,
        payment_method: row.try_get("payment_method")?,
        notes: row.try_get("notes")?,
        pending: pending != 0,
        conflict: conflict != 0,
        base_version: row.try_get("base_version")?,
        last_synced_at: row.try_get("last_synced_at")?,
        receipt_url: row.try_get("receipt_url")?,
        receipt_pending: receipt_pending != 0,
    })
}

fn item_from_row(row: &SqliteRow) -> Result<QueueItem, StoreError> {
    let payload: String = row.try_get("payload")?;
    let status: String = row.try_get("status")?;
    let unconditional: i64 = row.try_get("unconditional")?;
    Ok(QueueItem {
        id: row.try_get("id")?,
        record: RecordRef {
            local_id: row.try_get("local_id")?,
            remote_id: row.try_get("remote_id")?,
        },
        payload: serde_json::from_str(&payload)?,
        base_version: row.try_get("base_version")?,
        unconditional: unconditional != 0,
        status: QueueStatus::parse(&status)?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn conflict_from_row(row: &SqliteRow) -> Result<ConflictRecord, StoreError> {
    let my_payload: String = row.try_get("my_payload")?;
    let server_payload: String = row.try_get("server_payload")?;
    let decided: Option<String> = row.try_get("decided")?;
    let decided_payload: Option<String> = row.try_get("decided_payload")?;
    Ok(ConflictRecord {
        id: row.try_get("id")?,
        my_changes: LocalChanges {
            payload: serde_json::from_str(&my_payload)?,
            base_version: row.try_get("my_base_version")?,
        },
        server: ServerState {
            payload: serde_json::from_str(&server_payload)?,
            version: row.try_get("server_version")?,
            updated_at: row.try_get("server_updated_at")?,
        },
        decided: decided.as_deref().map(Decision::parse).transpose()?,
        decided_payload: decided_payload
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        created_at: row.try_get("created_at")?,
    })
}

fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("tally");
    path.push("sync.db");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::queue::MutationPayload;
    use tally_core::{TransactionPatch, TransactionPayload};

    async fn make_store() -> SyncStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = SyncStore::from_pool(pool);
        store.init().await.unwrap();
        store
    }

    fn payload() -> TransactionPayload {
        TransactionPayload {
            amount: 5000,
            occurred_at: 1_700_000_000,
            category_id: Some("groceries".into()),
            payee: Some("Cafe X".into()),
            payment_method: "card".into(),
            notes: None,
        }
    }

    fn pending_record(id: &str) -> TransactionRecord {
        let mut record = TransactionRecord::new_local(id, &payload());
        record.pending = true;
        record
    }

    async fn stage_create(store: &SyncStore, id: &str, now: i64) -> QueueItem {
        store
            .stage_mutation(
                &pending_record(id),
                &QueueInput {
                    record: RecordRef::local(id),
                    payload: MutationPayload::Create {
                        transaction: payload(),
                    },
                    base_version: None,
                    unconditional: false,
                },
                None,
                now,
            )
            .await
            .unwrap()
    }

    async fn stage_update(store: &SyncStore, id: &str, amount: i64, now: i64) -> QueueItem {
        store
            .stage_mutation(
                &pending_record(id),
                &QueueInput {
                    record: RecordRef::local(id),
                    payload: MutationPayload::Update {
                        patch: TransactionPatch {
                            amount: Some(amount),
                            ..Default::default()
                        },
                    },
                    base_version: Some(10),
                    unconditional: false,
                },
                None,
                now,
            )
            .await
            .unwrap()
    }

    fn conflict_for(id: &str) -> ConflictRecord {
        ConflictRecord {
            id: id.into(),
            my_changes: LocalChanges {
                payload: MutationPayload::Update {
                    patch: TransactionPatch {
                        amount: Some(5000),
                        ..Default::default()
                    },
                },
                base_version: Some(10),
            },
            server: ServerState {
                payload: TransactionPayload {
                    amount: 7000,
                    ..payload()
                },
                version: 11,
                updated_at: 1_700_000_100,
            },
            decided: None,
            decided_payload: None,
            created_at: 1_700_000_200,
        }
    }

    #[tokio::test]
    async fn stage_mutation_pairs_record_and_queue_item() {
        let store = make_store().await;
        let item = stage_create(&store, "l1", 100).await;

        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.kind(), MutationKind::Create);
        let record = store.get_record("l1").await.unwrap().unwrap();
        assert!(record.pending);
        assert_eq!(store.list_queue().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn begin_next_pending_is_fifo() {
        let store = make_store().await;
        let first = stage_create(&store, "l1", 100).await;
        let second = stage_update(&store, "l1", 7000, 101).await;
        assert!(first.id < second.id);

        let got = store.begin_next_pending(102).await.unwrap().unwrap();
        assert_eq!(got.id, first.id);
        assert_eq!(got.status, QueueStatus::Processing);

        // The second item stays queued until the first finishes.
        let got = store.begin_next_pending(103).await.unwrap().unwrap();
        assert_eq!(got.id, second.id);
        assert!(store.begin_next_pending(104).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_done_refreshes_record_and_clears_pending() {
        let store = make_store().await;
        stage_create(&store, "l1", 100).await;
        let item = store.begin_next_pending(101).await.unwrap().unwrap();

        let applied = store
            .mark_done(
                item.id,
                CommitEffect::Refresh {
                    record_id: "l1".into(),
                    remote_id: Some("t1".into()),
                    new_version: 1,
                    synced_at: 102,
                },
                102,
            )
            .await
            .unwrap();
        assert!(applied);

        let record = store.get_record("l1").await.unwrap().unwrap();
        assert_eq!(record.remote_id.as_deref(), Some("t1"));
        assert_eq!(record.base_version, Some(1));
        assert!(!record.pending);
        assert!(!record.conflict);
    }

    #[tokio::test]
    async fn mark_done_keeps_pending_while_items_remain() {
        let store = make_store().await;
        stage_create(&store, "l1", 100).await;
        stage_update(&store, "l1", 7000, 101).await;

        let first = store.begin_next_pending(102).await.unwrap().unwrap();
        store
            .mark_done(
                first.id,
                CommitEffect::Refresh {
                    record_id: "l1".into(),
                    remote_id: Some("t1".into()),
                    new_version: 1,
                    synced_at: 103,
                },
                103,
            )
            .await
            .unwrap();

        let record = store.get_record("l1").await.unwrap().unwrap();
        assert!(record.pending, "second item still in flight");
    }

    #[tokio::test]
    async fn mark_done_on_missing_or_finished_item_is_a_noop() {
        let store = make_store().await;
        let applied = store
            .mark_done(
                999,
                CommitEffect::Remove {
                    record_id: "l1".into(),
                },
                100,
            )
            .await
            .unwrap();
        assert!(!applied);

        let item = stage_create(&store, "l1", 100).await;
        // Still pending, not processing: refused.
        let applied = store
            .mark_done(
                item.id,
                CommitEffect::Remove {
                    record_id: "l1".into(),
                },
                101,
            )
            .await
            .unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn retry_applies_only_to_error_items() {
        let store = make_store().await;
        let item = stage_create(&store, "l1", 100).await;
        assert!(!store.retry(item.id, 101).await.unwrap());

        let item = store.begin_next_pending(101).await.unwrap().unwrap();
        store.mark_error(item.id, "timeout", 102).await.unwrap();
        let stored = store.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Error);
        assert_eq!(stored.error.as_deref(), Some("timeout"));

        assert!(store.retry(item.id, 103).await.unwrap());
        let stored = store.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Pending);
        assert_eq!(stored.error, None);
        assert_eq!(stored.updated_at, 103);
    }

    #[tokio::test]
    async fn retry_all_errors_leaves_done_items_alone() {
        let store = make_store().await;
        stage_create(&store, "l1", 100).await;
        stage_update(&store, "l1", 7000, 100).await;
        stage_update(&store, "l1", 8000, 100).await;

        let first = store.begin_next_pending(101).await.unwrap().unwrap();
        store
            .mark_done(
                first.id,
                CommitEffect::Refresh {
                    record_id: "l1".into(),
                    remote_id: Some("t1".into()),
                    new_version: 1,
                    synced_at: 101,
                },
                101,
            )
            .await
            .unwrap();
        let second = store.begin_next_pending(102).await.unwrap().unwrap();
        store.mark_error(second.id, "offline", 102).await.unwrap();
        let third = store.begin_next_pending(103).await.unwrap().unwrap();
        store.mark_error(third.id, "offline", 103).await.unwrap();

        assert_eq!(store.retry_all_errors(104).await.unwrap(), 2);
        assert_eq!(
            store
                .list_queue_by_status(QueueStatus::Pending)
                .await
                .unwrap()
                .len(),
            2
        );
        assert_eq!(
            store
                .list_queue_by_status(QueueStatus::Done)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn mark_conflict_keeps_a_single_row_per_transaction() {
        let store = make_store().await;
        stage_update(&store, "l1", 5000, 100).await;
        stage_update(&store, "l1", 5500, 100).await;

        let first = store.begin_next_pending(101).await.unwrap().unwrap();
        store
            .mark_conflict(first.id, "l1", &conflict_for("t1"), 101)
            .await
            .unwrap();
        let second = store.begin_next_pending(102).await.unwrap().unwrap();
        let mut newer = conflict_for("t1");
        newer.server.version = 12;
        store
            .mark_conflict(second.id, "l1", &newer, 102)
            .await
            .unwrap();

        let conflicts = store.list_conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].server.version, 12);
        let record = store.get_record("l1").await.unwrap().unwrap();
        assert!(record.conflict);
    }

    #[tokio::test]
    async fn remove_error_item_drops_orphaned_create() {
        let store = make_store().await;
        let item = stage_create(&store, "l1", 100).await;
        let item_id = item.id;
        let item = store.begin_next_pending(101).await.unwrap().unwrap();
        assert_eq!(item.id, item_id);
        store.mark_error(item_id, "offline", 102).await.unwrap();

        assert!(store.remove_error_item(item_id, true).await.unwrap());
        assert!(store.get_record("l1").await.unwrap().is_none());
        assert!(store.list_queue().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_error_item_refuses_other_statuses() {
        let store = make_store().await;
        let item = stage_create(&store, "l1", 100).await;
        assert!(!store.remove_error_item(item.id, false).await.unwrap());
        assert_eq!(store.list_queue().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn prune_done_drops_only_old_done_items() {
        let store = make_store().await;
        stage_create(&store, "l1", 100).await;
        let item = store.begin_next_pending(101).await.unwrap().unwrap();
        store
            .mark_done(
                item.id,
                CommitEffect::Refresh {
                    record_id: "l1".into(),
                    remote_id: Some("t1".into()),
                    new_version: 1,
                    synced_at: 200,
                },
                200,
            )
            .await
            .unwrap();
        stage_update(&store, "l1", 7000, 300).await;

        assert_eq!(store.prune_done(250).await.unwrap(), 1);
        assert_eq!(store.list_queue().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recover_processing_requeues_stale_items() {
        let store = make_store().await;
        stage_create(&store, "l1", 100).await;
        store.begin_next_pending(101).await.unwrap().unwrap();

        assert_eq!(store.recover_processing(102).await.unwrap(), 1);
        let queue = store.list_queue().await.unwrap();
        assert_eq!(queue[0].status, QueueStatus::Pending);
    }

    #[tokio::test]
    async fn receipt_blob_is_dropped_when_upload_commits() {
        let store = make_store().await;
        let mut record = pending_record("l1");
        record.remote_id = Some("t1".into());
        record.receipt_pending = true;
        let entry = ReceiptBlobEntry {
            key: "r-1".into(),
            blob: b"png-bytes".to_vec(),
            mime: "image/png".into(),
            size: 9,
            record: RecordRef::local("l1"),
            created_at: 100,
        };
        store
            .stage_mutation(
                &record,
                &QueueInput {
                    record: RecordRef::of_record(&record),
                    payload: MutationPayload::UploadReceipt {
                        receipt_key: "r-1".into(),
                    },
                    base_version: None,
                    unconditional: false,
                },
                Some(&entry),
                100,
            )
            .await
            .unwrap();
        assert_eq!(store.get_receipt("r-1").await.unwrap().unwrap().size, 9);

        let item = store.begin_next_pending(101).await.unwrap().unwrap();
        store
            .mark_done(
                item.id,
                CommitEffect::Receipt {
                    record_id: "l1".into(),
                    receipt_url: Some("https://cdn.tally.example/r/abc.png".into()),
                    receipt_key: "r-1".into(),
                    new_version: 2,
                    synced_at: 102,
                },
                102,
            )
            .await
            .unwrap();

        assert!(store.get_receipt("r-1").await.unwrap().is_none());
        let record = store.get_record("l1").await.unwrap().unwrap();
        assert!(!record.receipt_pending);
        assert_eq!(
            record.receipt_url.as_deref(),
            Some("https://cdn.tally.example/r/abc.png")
        );
    }

    #[tokio::test]
    async fn apply_resolution_replaces_items_and_deletes_conflict() {
        let store = make_store().await;
        stage_update(&store, "l1", 5000, 100).await;
        let item = store.begin_next_pending(101).await.unwrap().unwrap();
        store
            .mark_conflict(item.id, "l1", &conflict_for("t1"), 101)
            .await
            .unwrap();

        let mut record = pending_record("l1");
        record.remote_id = Some("t1".into());
        record.conflict = false;
        let resolution = Resolution {
            conflict_id: "t1".into(),
            record,
            enqueue: Some(QueueInput {
                record: RecordRef {
                    local_id: Some("l1".into()),
                    remote_id: Some("t1".into()),
                },
                payload: MutationPayload::Update {
                    patch: TransactionPatch {
                        amount: Some(5000),
                        ..Default::default()
                    },
                },
                base_version: None,
                unconditional: true,
            }),
            remove_statuses: vec![QueueStatus::Conflict],
        };
        let new_item = store
            .apply_resolution(&resolution, 102)
            .await
            .unwrap()
            .unwrap();

        assert!(new_item.unconditional);
        assert!(store.get_conflict("t1").await.unwrap().is_none());
        let queue = store.list_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, new_item.id);
        assert_eq!(queue[0].status, QueueStatus::Pending);
    }

    #[tokio::test]
    async fn open_at_creates_and_reopens_a_disk_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.db");

        let store = SyncStore::open_at(&path).await.unwrap();
        store.upsert_record(&pending_record("l1")).await.unwrap();
        drop(store);
        assert!(path.exists());

        let store = SyncStore::open_at(&path).await.unwrap();
        let record = store.get_record("l1").await.unwrap().unwrap();
        assert!(record.pending);
    }

    #[tokio::test]
    async fn set_decided_marks_conflict_for_resume() {
        let store = make_store().await;
        stage_update(&store, "l1", 5000, 100).await;
        let item = store.begin_next_pending(101).await.unwrap().unwrap();
        store
            .mark_conflict(item.id, "l1", &conflict_for("t1"), 101)
            .await
            .unwrap();

        assert!(
            store
                .set_decided("t1", Decision::Server, None)
                .await
                .unwrap()
        );
        let conflict = store.get_conflict("t1").await.unwrap().unwrap();
        assert_eq!(conflict.decided, Some(Decision::Server));

        // Unknown id: idempotent no-op.
        assert!(
            !store
                .set_decided("t9", Decision::Server, None)
                .await
                .unwrap()
        );
    }
}
