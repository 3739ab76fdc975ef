use serde::Serialize;
use uuid::Uuid;

use super::LedgerEntry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub user_id: Uuid,
    pub entries: usize,
    pub balance: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    #[error("entry {entry_id} starts at {actual}, previous entry ended at {expected}")]
    BrokenChain {
        entry_id: i64,
        expected: i64,
        actual: i64,
    },
    #[error("entry {entry_id} records {before} + {amount} = {after}")]
    InconsistentEntry {
        entry_id: i64,
        before: i64,
        amount: i64,
        after: i64,
    },
    #[error("entry {entry_id} leaves a negative balance")]
    NegativeBalance { entry_id: i64 },
    #[error("entries are out of order at {entry_id}")]
    OutOfOrder { entry_id: i64 },
    #[error("wallet holds {balance} but entries sum to {replayed}")]
    BalanceMismatch { balance: i64, replayed: i64 },
}

/// Replays `entries` (oldest first) and checks them against the stored `balance`.
pub fn audit_entries(
    user_id: Uuid,
    balance: i64,
    entries: &[LedgerEntry],
) -> Result<AuditReport, AuditError> {
    let mut replayed = 0_i64;
    let mut previous_id = None;

    for entry in entries {
        assert_eq!(entry.wallet_id, user_id, "Audit received a foreign entry");
        if previous_id.is_some_and(|id| entry.id <= id) {
            return Err(AuditError::OutOfOrder { entry_id: entry.id });
        }
        if entry.balance_before != replayed {
            return Err(AuditError::BrokenChain {
                entry_id: entry.id,
                expected: replayed,
                actual: entry.balance_before,
            });
        }
        if entry.balance_before.checked_add(entry.change_amount) != Some(entry.balance_after) {
            return Err(AuditError::InconsistentEntry {
                entry_id: entry.id,
                before: entry.balance_before,
                amount: entry.change_amount,
                after: entry.balance_after,
            });
        }
        if entry.balance_after < 0 {
            return Err(AuditError::NegativeBalance { entry_id: entry.id });
        }
        replayed = entry.balance_after;
        previous_id = Some(entry.id);
    }

    if replayed != balance {
        return Err(AuditError::BalanceMismatch { balance, replayed });
    }

    Ok(AuditReport {
        user_id,
        entries: entries.len(),
        balance,
    })
}
