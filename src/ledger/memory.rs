// In-memory ledger store used by tests and local development.
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::store::next_balance;
use super::{
    AppendRequest, AuditSnapshot, CreditOutcome, LedgerEntry, LedgerError, LedgerStore, Wallet,
};

#[derive(Default)]
struct MemoryState {
    wallets: HashMap<Uuid, Wallet>,
    entries: Vec<LedgerEntry>,
    keys: HashMap<String, i64>,
}

impl MemoryState {
    fn wallet_or_insert(&mut self, user_id: Uuid) -> &mut Wallet {
        self.wallets.entry(user_id).or_insert_with(|| {
            let now = Utc::now();
            Wallet {
                user_id,
                balance: 0,
                created_at: now,
                updated_at: now,
            }
        })
    }
}

/// Single-mutex store: every append is serialized, which is stricter than per-wallet.
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: Mutex<MemoryState>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn get_wallet(&self, user_id: Uuid) -> Result<Option<Wallet>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state.wallets.get(&user_id).cloned())
    }

    async fn ensure_wallet(&self, user_id: Uuid) -> Result<Wallet, LedgerError> {
        let mut state = self.state.lock().await;
        Ok(state.wallet_or_insert(user_id).clone())
    }

    async fn append_entry_if_absent(
        &self,
        request: AppendRequest,
    ) -> Result<CreditOutcome, LedgerError> {
        let mut state = self.state.lock().await;

        if let Some(entry_id) = state.keys.get(&request.idempotency_key) {
            return Ok(CreditOutcome::Duplicate {
                entry_id: *entry_id,
            });
        }

        assert!(
            state.entries.len() < i64::MAX as usize,
            "Entry sequence exhausted"
        );
        let entry_id = state.entries.len() as i64 + 1;
        let wallet = state.wallet_or_insert(request.user_id);
        let balance_before = wallet.balance;
        let balance_after = next_balance(balance_before, request.amount)?;

        let now = Utc::now();
        wallet.balance = balance_after;
        wallet.updated_at = now;
        let wallet = wallet.clone();

        let entry = LedgerEntry {
            id: entry_id,
            user_id: request.user_id,
            wallet_id: request.user_id,
            change_type: request.change_type,
            change_amount: request.amount,
            balance_before,
            balance_after,
            idempotency_key: request.idempotency_key.clone(),
            metadata: request.metadata,
            created_at: now,
        };
        state.entries.push(entry.clone());
        state.keys.insert(request.idempotency_key, entry_id);

        Ok(CreditOutcome::Applied { entry, wallet })
    }

    async fn list_entries(
        &self,
        user_id: Uuid,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let state = self.state.lock().await;
        let entries = state
            .entries
            .iter()
            .rev()
            .filter(|entry| entry.wallet_id == user_id)
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(entries)
    }

    async fn audit_snapshot(&self, user_id: Uuid) -> Result<AuditSnapshot, LedgerError> {
        let state = self.state.lock().await;
        let balance = state
            .wallets
            .get(&user_id)
            .map(|wallet| wallet.balance)
            .unwrap_or(0);
        let entries = state
            .entries
            .iter()
            .filter(|entry| entry.wallet_id == user_id)
            .cloned()
            .collect();
        Ok(AuditSnapshot { balance, entries })
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}
