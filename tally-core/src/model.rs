use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Full domain state of a ledger transaction as the server understands it.
/// `amount` is in minor currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionPayload {
    pub amount: i64,
    pub occurred_at: i64,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub payee: Option<String>,
    pub payment_method: String,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Sparse diff against the last-known server state. A field that is `None`
/// was not touched; for nullable fields `Some(None)` means "clear it", so
/// the wire form can tell absent and explicit-null apart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<i64>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub category_id: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub payee: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub notes: Option<Option<String>>,
}

fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// The domain fields a transaction carries, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionField {
    Amount,
    OccurredAt,
    CategoryId,
    Payee,
    PaymentMethod,
    Notes,
}

impl TransactionField {
    pub const ALL: [TransactionField; 6] = [
        TransactionField::Amount,
        TransactionField::OccurredAt,
        TransactionField::CategoryId,
        TransactionField::Payee,
        TransactionField::PaymentMethod,
        TransactionField::Notes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionField::Amount => "amount",
            TransactionField::OccurredAt => "occurred_at",
            TransactionField::CategoryId => "category_id",
            TransactionField::Payee => "payee",
            TransactionField::PaymentMethod => "payment_method",
            TransactionField::Notes => "notes",
        }
    }
}

impl TransactionPayload {
    /// Field value normalized to JSON, with `Null` standing in for an unset
    /// optional field.
    pub fn field_value(&self, field: TransactionField) -> Value {
        match field {
            TransactionField::Amount => Value::from(self.amount),
            TransactionField::OccurredAt => Value::from(self.occurred_at),
            TransactionField::CategoryId => opt_value(self.category_id.as_deref()),
            TransactionField::Payee => opt_value(self.payee.as_deref()),
            TransactionField::PaymentMethod => Value::from(self.payment_method.clone()),
            TransactionField::Notes => opt_value(self.notes.as_deref()),
        }
    }

    /// Returns a copy with `patch` laid over it.
    pub fn with_patch(&self, patch: &TransactionPatch) -> TransactionPayload {
        let mut out = self.clone();
        if let Some(amount) = patch.amount {
            out.amount = amount;
        }
        if let Some(occurred_at) = patch.occurred_at {
            out.occurred_at = occurred_at;
        }
        if let Some(category_id) = &patch.category_id {
            out.category_id = category_id.clone();
        }
        if let Some(payee) = &patch.payee {
            out.payee = payee.clone();
        }
        if let Some(payment_method) = &patch.payment_method {
            out.payment_method = payment_method.clone();
        }
        if let Some(notes) = &patch.notes {
            out.notes = notes.clone();
        }
        out
    }
}

impl TransactionPatch {
    pub fn is_empty(&self) -> bool {
        self.amount.is_none()
            && self.occurred_at.is_none()
            && self.category_id.is_none()
            && self.payee.is_none()
            && self.payment_method.is_none()
            && self.notes.is_none()
    }

    /// Whether the patch carries a value for `field`, including an explicit
    /// clear of a nullable field.
    pub fn touches(&self, field: TransactionField) -> bool {
        match field {
            TransactionField::Amount => self.amount.is_some(),
            TransactionField::OccurredAt => self.occurred_at.is_some(),
            TransactionField::CategoryId => self.category_id.is_some(),
            TransactionField::Payee => self.payee.is_some(),
            TransactionField::PaymentMethod => self.payment_method.is_some(),
            TransactionField::Notes => self.notes.is_some(),
        }
    }

    /// Full-overwrite patch carrying every field of `payload`.
    pub fn overwrite(payload: &TransactionPayload) -> TransactionPatch {
        TransactionPatch {
            amount: Some(payload.amount),
            occurred_at: Some(payload.occurred_at),
            category_id: Some(payload.category_id.clone()),
            payee: Some(payload.payee.clone()),
            payment_method: Some(payload.payment_method.clone()),
            notes: Some(payload.notes.clone()),
        }
    }
}

fn opt_value(value: Option<&str>) -> Value {
    match value {
        Some(value) => Value::from(value),
        None => Value::Null,
    }
}
