use async_trait::async_trait;
use uuid::Uuid;

use super::{ChangeType, CreditOutcome, LedgerEntry, LedgerError, Metadata, Wallet};

/// A fully validated change, ready to be applied exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    pub idempotency_key: String,
    pub user_id: Uuid,
    pub change_type: ChangeType,
    pub amount: i64,
    pub metadata: Metadata,
}

/// Balance and change log read at one consistent point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditSnapshot {
    /// 0 when the wallet does not exist.
    pub balance: i64,
    /// Application order.
    pub entries: Vec<LedgerEntry>,
}

/// Durable wallet and change-log storage.
///
/// Implementors MUST run [`LedgerStore::append_entry_if_absent`] as one
/// all-or-nothing unit serialized per wallet:
/// 1. create the wallet with balance 0 if it does not exist
/// 2. lock the wallet against concurrent writers
/// 3. return [`CreditOutcome::Duplicate`] if an entry with the idempotency key exists
/// 4. reject with [`LedgerError::InsufficientBalance`] if the balance would go negative
/// 5. write the new balance and append the entry, then release the lock
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_wallet(&self, user_id: Uuid) -> Result<Option<Wallet>, LedgerError>;

    /// Returns the wallet, creating an empty one if needed.
    async fn ensure_wallet(&self, user_id: Uuid) -> Result<Wallet, LedgerError>;

    async fn append_entry_if_absent(
        &self,
        request: AppendRequest,
    ) -> Result<CreditOutcome, LedgerError>;

    /// Entries for one wallet, newest first.
    async fn list_entries(
        &self,
        user_id: Uuid,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Balance and every entry for one wallet, with no append in between.
    async fn audit_snapshot(&self, user_id: Uuid) -> Result<AuditSnapshot, LedgerError>;

    async fn ping(&self) -> Result<(), LedgerError>;
}

/// Balance after applying `amount`, or the reason it cannot be applied.
pub fn next_balance(current: i64, amount: i64) -> Result<i64, LedgerError> {
    assert!(current >= 0, "Stored wallet balance is negative");
    let next = current.checked_add(amount).ok_or(LedgerError::Overflow {
        balance: current,
        amount,
    })?;
    if next < 0 {
        return Err(LedgerError::InsufficientBalance {
            balance: current,
            requested: amount,
        });
    }
    Ok(next)
}
