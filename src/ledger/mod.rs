//! Token ledger: wallets, the append-only change log, and the idempotent credit operation.
//!
//! Every balance change goes through [`LedgerService::apply`], which hands a single
//! [`AppendRequest`] to a [`LedgerStore`]. The store performs the check-compute-append
//! sequence as one unit per wallet, so a given idempotency key produces at most one
//! [`LedgerEntry`] no matter how many times, or how concurrently, it is submitted.

use chrono::{DateTime, Utc};
use sea_orm::DbErr;
use serde::Serialize;
use uuid::Uuid;

pub mod audit;
pub mod feed;
pub mod memory;
pub mod metadata;
pub mod postgres;
pub mod service;
pub mod store;

pub use crate::entities::sea_orm_active_enums::ChangeType;
pub use audit::{AuditError, AuditReport};
pub use feed::{BalanceFeed, BalanceStream, BalanceSubscription};
pub use memory::MemoryLedgerStore;
pub use metadata::{Metadata, MetadataError, MetadataValue};
pub use postgres::PgLedgerStore;
pub use service::{CreditRequest, LedgerService};
pub use store::{AppendRequest, AuditSnapshot, LedgerStore};

pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Snapshot of a wallet at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Wallet {
    pub user_id: Uuid,
    pub balance: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: Uuid,
    pub wallet_id: Uuid,
    pub change_type: ChangeType,
    pub change_amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub idempotency_key: String,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// Result of a credit attempt that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreditOutcome {
    Applied { entry: LedgerEntry, wallet: Wallet },
    /// The idempotency key was already used; nothing changed.
    Duplicate { entry_id: i64 },
}

impl CreditOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }

    pub fn entry_id(&self) -> i64 {
        match self {
            Self::Applied { entry, .. } => entry.id,
            Self::Duplicate { entry_id } => *entry_id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("change amount must be non-zero")]
    ZeroAmount,
    #[error("{change_type} amount must be {expected}, got {amount}")]
    AmountSign {
        change_type: ChangeType,
        amount: i64,
        expected: &'static str,
    },
    #[error("{0} requires an idempotency key")]
    MissingIdempotencyKey(ChangeType),
    #[error("idempotency key exceeds {MAX_IDEMPOTENCY_KEY_LEN} characters")]
    IdempotencyKeyTooLong,
    #[error("invalid metadata: {0}")]
    Metadata(#[from] MetadataError),
    #[error("insufficient balance: wallet holds {balance}, change of {requested} rejected")]
    InsufficientBalance { balance: i64, requested: i64 },
    #[error("balance overflow applying {amount} to {balance}")]
    Overflow { balance: i64, amount: i64 },
    #[error("ledger audit failed: {0}")]
    Audit(#[from] AuditError),
    #[error("storage error: {0}")]
    Storage(#[from] DbErr),
}

impl LedgerError {
    /// Storage failures may succeed on retry; everything else is a rejection.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}
