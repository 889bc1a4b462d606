mod client;
mod model;

pub use client::{
    ApiErrorClass, ApplyOutcome, CommitReceipt, ConflictSnapshot, LedgerApiError, LedgerClient,
};
pub use model::{TransactionField, TransactionPatch, TransactionPayload};
