use serde_json::Value;

use tally_core::{TransactionField, TransactionPatch, TransactionPayload};

use super::queue::{MutationPayload, QueueStateError};

/// Resolution strategy chosen for a conflict. Written to the conflict row
/// before the resolution's mutations so an interrupted batch can resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Mine,
    Server,
    Merge,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Mine => "mine",
            Decision::Server => "server",
            Decision::Merge => "merge",
        }
    }

    pub fn parse(value: &str) -> Result<Self, QueueStateError> {
        match value {
            "mine" => Ok(Decision::Mine),
            "server" => Ok(Decision::Server),
            "merge" => Ok(Decision::Merge),
            other => Err(QueueStateError::InvalidDecision(other.to_string())),
        }
    }
}

/// The local mutation that was rejected by the precondition check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalChanges {
    pub payload: MutationPayload,
    pub base_version: Option<i64>,
}

/// The authoritative state the server answered the rejection with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerState {
    pub payload: TransactionPayload,
    pub version: i64,
    pub updated_at: i64,
}

/// One collision per transaction id: the user's rejected change paired
/// with the server state that rejected it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    pub id: String,
    pub my_changes: LocalChanges,
    pub server: ServerState,
    pub decided: Option<Decision>,
    pub decided_payload: Option<TransactionPatch>,
    pub created_at: i64,
}

impl ConflictRecord {
    pub fn local_patch(&self) -> Option<&TransactionPatch> {
        match &self.my_changes.payload {
            MutationPayload::Update { patch } => Some(patch),
            _ => None,
        }
    }

    /// The user's side of the collision as a full payload: the current
    /// local snapshot when one is available, otherwise the rejected change
    /// laid over the server state.
    pub fn effective_mine(&self, local_snapshot: Option<&TransactionPayload>) -> TransactionPayload {
        if let Some(snapshot) = local_snapshot {
            return snapshot.clone();
        }
        match &self.my_changes.payload {
            MutationPayload::Create { transaction } => transaction.clone(),
            MutationPayload::Update { patch } => self.server.payload.with_patch(patch),
            MutationPayload::Delete | MutationPayload::UploadReceipt { .. } => {
                self.server.payload.clone()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldChoice {
    Mine,
    #[default]
    Server,
}

/// Per-field pick for the merge resolution path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeSelection {
    pub amount: FieldChoice,
    pub occurred_at: FieldChoice,
    pub category_id: FieldChoice,
    pub payee: FieldChoice,
    pub payment_method: FieldChoice,
    pub notes: FieldChoice,
}

impl MergeSelection {
    pub fn choice(&self, field: TransactionField) -> FieldChoice {
        match field {
            TransactionField::Amount => self.amount,
            TransactionField::OccurredAt => self.occurred_at,
            TransactionField::CategoryId => self.category_id,
            TransactionField::Payee => self.payee,
            TransactionField::PaymentMethod => self.payment_method,
            TransactionField::Notes => self.notes,
        }
    }

    pub fn set(&mut self, field: TransactionField, choice: FieldChoice) {
        match field {
            TransactionField::Amount => self.amount = choice,
            TransactionField::OccurredAt => self.occurred_at = choice,
            TransactionField::CategoryId => self.category_id = choice,
            TransactionField::Payee => self.payee = choice,
            TransactionField::PaymentMethod => self.payment_method = choice,
            TransactionField::Notes => self.notes = choice,
        }
    }
}

/// Per-field view of a collision for display. `mine`/`server` are
/// normalized JSON values with `Null` standing in for an unset field, so
/// two unset fields always compare equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDiff {
    pub field: TransactionField,
    pub mine: Value,
    pub server: Value,
    pub differs: bool,
}

pub fn field_diffs(
    conflict: &ConflictRecord,
    local_snapshot: Option<&TransactionPayload>,
) -> Vec<FieldDiff> {
    let mine = conflict.effective_mine(local_snapshot);
    TransactionField::ALL
        .iter()
        .map(|&field| {
            let mine_value = mine.field_value(field);
            let server_value = conflict.server.payload.field_value(field);
            let differs = mine_value != server_value;
            FieldDiff {
                field,
                mine: mine_value,
                server: server_value,
                differs,
            }
        })
        .collect()
}

/// Initial merge defaults: `Mine` for the fields the rejected change
/// touched, `Server` everywhere else.
pub fn default_selection(conflict: &ConflictRecord) -> MergeSelection {
    let mut selection = MergeSelection::default();
    match &conflict.my_changes.payload {
        MutationPayload::Update { patch } => {
            for field in TransactionField::ALL {
                if patch.touches(field) {
                    selection.set(field, FieldChoice::Mine);
                }
            }
        }
        MutationPayload::Create { .. } => {
            for field in TransactionField::ALL {
                selection.set(field, FieldChoice::Mine);
            }
        }
        MutationPayload::Delete | MutationPayload::UploadReceipt { .. } => {}
    }
    selection
}

/// Field-by-field composition of the merge result.
pub fn merge_payloads(
    mine: &TransactionPayload,
    server: &TransactionPayload,
    selection: &MergeSelection,
) -> TransactionPayload {
    let mut out = server.clone();
    for field in TransactionField::ALL {
        if selection.choice(field) != FieldChoice::Mine {
            continue;
        }
        match field {
            TransactionField::Amount => out.amount = mine.amount,
            TransactionField::OccurredAt => out.occurred_at = mine.occurred_at,
            TransactionField::CategoryId => out.category_id = mine.category_id.clone(),
            TransactionField::Payee => out.payee = mine.payee.clone(),
            TransactionField::PaymentMethod => out.payment_method = mine.payment_method.clone(),
            TransactionField::Notes => out.notes = mine.notes.clone(),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_payload() -> TransactionPayload {
        TransactionPayload {
            amount: 7000,
            occurred_at: 1_700_000_000,
            category_id: Some("groceries".into()),
            payee: Some("Cafe Old".into()),
            payment_method: "card".into(),
            notes: None,
        }
    }

    fn conflict_with_patch(patch: TransactionPatch) -> ConflictRecord {
        ConflictRecord {
            id: "t1".into(),
            my_changes: LocalChanges {
                payload: MutationPayload::Update { patch },
                base_version: Some(10),
            },
            server: ServerState {
                payload: server_payload(),
                version: 11,
                updated_at: 1_700_000_100,
            },
            decided: None,
            decided_payload: None,
            created_at: 1_700_000_200,
        }
    }

    #[test]
    fn effective_mine_lays_patch_over_server() {
        let conflict = conflict_with_patch(TransactionPatch {
            amount: Some(5000),
            payee: Some(Some("Cafe X".into())),
            ..Default::default()
        });
        let mine = conflict.effective_mine(None);
        assert_eq!(mine.amount, 5000);
        assert_eq!(mine.payee.as_deref(), Some("Cafe X"));
        assert_eq!(mine.category_id.as_deref(), Some("groceries"));
    }

    #[test]
    fn effective_mine_prefers_local_snapshot() {
        let conflict = conflict_with_patch(TransactionPatch {
            amount: Some(5000),
            ..Default::default()
        });
        let mut snapshot = server_payload();
        snapshot.amount = 4200;
        let mine = conflict.effective_mine(Some(&snapshot));
        assert_eq!(mine.amount, 4200);
    }

    #[test]
    fn diff_marks_only_changed_fields() {
        let conflict = conflict_with_patch(TransactionPatch {
            amount: Some(5000),
            ..Default::default()
        });
        let diffs = field_diffs(&conflict, None);
        let amount = diffs
            .iter()
            .find(|d| d.field == TransactionField::Amount)
            .unwrap();
        assert!(amount.differs);
        assert_eq!(amount.mine, Value::from(5000));
        assert_eq!(amount.server, Value::from(7000));

        let notes = diffs
            .iter()
            .find(|d| d.field == TransactionField::Notes)
            .unwrap();
        assert!(!notes.differs);
        assert_eq!(notes.mine, Value::Null);
        assert_eq!(notes.server, Value::Null);
    }

    #[test]
    fn unset_fields_compare_equal_after_normalization() {
        // Both sides have no notes: one side "never set", the other
        // "explicitly cleared" - normalization makes them identical.
        let conflict = conflict_with_patch(TransactionPatch {
            notes: Some(None),
            ..Default::default()
        });
        let diffs = field_diffs(&conflict, None);
        let notes = diffs
            .iter()
            .find(|d| d.field == TransactionField::Notes)
            .unwrap();
        assert!(!notes.differs);
    }

    #[test]
    fn default_selection_follows_touched_fields() {
        let conflict = conflict_with_patch(TransactionPatch {
            amount: Some(5000),
            payee: Some(Some("Cafe X".into())),
            ..Default::default()
        });
        let selection = default_selection(&conflict);
        assert_eq!(selection.amount, FieldChoice::Mine);
        assert_eq!(selection.payee, FieldChoice::Mine);
        assert_eq!(selection.category_id, FieldChoice::Server);
        assert_eq!(selection.notes, FieldChoice::Server);
    }

    #[test]
    fn merge_composes_field_by_field() {
        let conflict = conflict_with_patch(TransactionPatch {
            amount: Some(5000),
            payee: Some(Some("Cafe X".into())),
            ..Default::default()
        });
        let mine = conflict.effective_mine(None);
        let mut selection = MergeSelection::default();
        selection.payee = FieldChoice::Mine;

        let merged = merge_payloads(&mine, &conflict.server.payload, &selection);

        // amount follows the server, payee follows mine.
        assert_eq!(merged.amount, 7000);
        assert_eq!(merged.payee.as_deref(), Some("Cafe X"));
        assert_eq!(merged.payment_method, "card");
    }

    #[test]
    fn merge_with_all_mine_reproduces_mine() {
        let conflict = conflict_with_patch(TransactionPatch {
            amount: Some(5000),
            notes: Some(Some("lunch".into())),
            ..Default::default()
        });
        let mine = conflict.effective_mine(None);
        let mut selection = MergeSelection::default();
        for field in TransactionField::ALL {
            selection.set(field, FieldChoice::Mine);
        }
        assert_eq!(
            merge_payloads(&mine, &conflict.server.payload, &selection),
            mine
        );
    }
}
