use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use super::audit::audit_entries;
use super::metadata::normalize_metadata;
use super::{
    AppendRequest, AuditReport, BalanceFeed, BalanceSubscription, ChangeType, CreditOutcome,
    LedgerEntry, LedgerError, LedgerStore, MAX_IDEMPOTENCY_KEY_LEN, Metadata, MetadataError,
    MetadataValue, Wallet,
};

/// Metadata key echoing the idempotency key on every entry.
pub const IDEMPOTENCY_METADATA_KEY: &str = "idempotency_key";

/// A requested balance change before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditRequest {
    pub user_id: Uuid,
    pub change_type: ChangeType,
    pub amount: i64,
    pub idempotency_key: Option<String>,
    pub metadata: Metadata,
}

impl CreditRequest {
    pub fn new(user_id: Uuid, change_type: ChangeType, amount: i64) -> Self {
        Self {
            user_id,
            change_type,
            amount,
            idempotency_key: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<MetadataValue>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Entry point for every balance change, and the read side built on the same store.
#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
    feed: Arc<BalanceFeed>,
    signup_bonus: i64,
}

impl LedgerService {
    pub fn new(store: Arc<dyn LedgerStore>, feed: Arc<BalanceFeed>, signup_bonus: i64) -> Self {
        assert!(signup_bonus >= 0, "Signup bonus cannot be negative");
        Self {
            store,
            feed,
            signup_bonus,
        }
    }

    /// Applies `request` at most once per idempotency key.
    pub async fn apply(&self, request: CreditRequest) -> Result<CreditOutcome, LedgerError> {
        validate_amount(request.change_type, request.amount)?;
        let idempotency_key =
            resolve_idempotency_key(request.change_type, request.idempotency_key)?;
        let mut metadata = request.metadata;
        if metadata.contains_key(IDEMPOTENCY_METADATA_KEY) {
            return Err(MetadataError::ReservedKey {
                key: IDEMPOTENCY_METADATA_KEY.to_string(),
            }
            .into());
        }
        metadata.insert(
            IDEMPOTENCY_METADATA_KEY.to_string(),
            MetadataValue::Text(idempotency_key.clone()),
        );
        let metadata = normalize_metadata(metadata)?;

        let outcome = self
            .store
            .append_entry_if_absent(AppendRequest {
                idempotency_key: idempotency_key.clone(),
                user_id: request.user_id,
                change_type: request.change_type,
                amount: request.amount,
                metadata,
            })
            .await?;

        match &outcome {
            CreditOutcome::Applied { entry, wallet } => {
                info!(
                    "Ledger entry {} applied: {} {:+} tokens for user {} (balance {} -> {})",
                    entry.id,
                    entry.change_type,
                    entry.change_amount,
                    entry.user_id,
                    entry.balance_before,
                    entry.balance_after
                );
                self.feed.publish(wallet, entry.id);
            }
            CreditOutcome::Duplicate { entry_id } => {
                info!(
                    "Idempotency key {idempotency_key} already applied as entry {entry_id}; \
                     no change"
                );
            }
        }
        Ok(outcome)
    }

    /// Creates the wallet for a new account and grants the configured signup bonus once.
    pub async fn open_wallet(&self, user_id: Uuid) -> Result<Wallet, LedgerError> {
        let wallet = self.store.ensure_wallet(user_id).await?;
        if self.signup_bonus == 0 {
            return Ok(wallet);
        }
        let request = CreditRequest::new(user_id, ChangeType::SignupBonus, self.signup_bonus)
            .with_idempotency_key(format!("signup:{user_id}"));
        match self.apply(request).await? {
            CreditOutcome::Applied { wallet, .. } => Ok(wallet),
            CreditOutcome::Duplicate { .. } => self.store.ensure_wallet(user_id).await,
        }
    }

    /// Debits `tokens` for a content-generation action.
    pub async fn record_usage(
        &self,
        user_id: Uuid,
        tokens: i64,
        action: &str,
        idempotency_key: Option<String>,
    ) -> Result<CreditOutcome, LedgerError> {
        if tokens <= 0 {
            return Err(LedgerError::AmountSign {
                change_type: ChangeType::ActionUsage,
                amount: tokens,
                expected: "positive",
            });
        }
        let mut request = CreditRequest::new(user_id, ChangeType::ActionUsage, -tokens)
            .with_metadata("action", action);
        request.idempotency_key = idempotency_key;
        self.apply(request).await
    }

    /// Current balance; 0 when the user has no wallet yet.
    pub async fn balance(&self, user_id: Uuid) -> Result<i64, LedgerError> {
        Ok(self
            .store
            .get_wallet(user_id)
            .await?
            .map(|wallet| wallet.balance)
            .unwrap_or(0))
    }

    pub async fn wallet(&self, user_id: Uuid) -> Result<Option<Wallet>, LedgerError> {
        self.store.get_wallet(user_id).await
    }

    pub async fn history(
        &self,
        user_id: Uuid,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.store.list_entries(user_id, limit, offset).await
    }

    pub fn subscribe(&self, user_id: Uuid) -> BalanceSubscription {
        self.feed.subscribe(user_id)
    }

    /// Replays the change log and checks it against the stored balance.
    pub async fn audit(&self, user_id: Uuid) -> Result<AuditReport, LedgerError> {
        let snapshot = self.store.audit_snapshot(user_id).await?;
        Ok(audit_entries(user_id, snapshot.balance, &snapshot.entries)?)
    }

    pub async fn ping(&self) -> Result<(), LedgerError> {
        self.store.ping().await
    }
}

fn validate_amount(change_type: ChangeType, amount: i64) -> Result<(), LedgerError> {
    if amount == 0 {
        return Err(LedgerError::ZeroAmount);
    }
    let expected = match change_type {
        ChangeType::SignupBonus | ChangeType::StripePurchase if amount < 0 => "positive",
        ChangeType::ActionUsage if amount > 0 => "negative",
        _ => return Ok(()),
    };
    Err(LedgerError::AmountSign {
        change_type,
        amount,
        expected,
    })
}

fn resolve_idempotency_key(
    change_type: ChangeType,
    supplied: Option<String>,
) -> Result<String, LedgerError> {
    match supplied.map(|key| key.trim().to_string()) {
        Some(key) if !key.is_empty() => {
            if key.chars().count() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(LedgerError::IdempotencyKeyTooLong);
            }
            Ok(key)
        }
        _ if change_type.requires_idempotency_key() => {
            Err(LedgerError::MissingIdempotencyKey(change_type))
        }
        _ => Ok(format!(
            "{}:{}",
            change_type.as_str().to_ascii_lowercase(),
            Uuid::now_v7()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedgerStore;
    use crate::ledger::metadata::{MAX_METADATA_KEYS, MAX_METADATA_VALUE_CHARS, TRUNCATION_MARKER};

    fn service() -> LedgerService {
        service_with_bonus(0)
    }

    fn service_with_bonus(bonus: i64) -> LedgerService {
        LedgerService::new(
            Arc::new(MemoryLedgerStore::new()),
            Arc::new(BalanceFeed::default()),
            bonus,
        )
    }

    fn purchase(user_id: Uuid, key: &str, amount: i64) -> CreditRequest {
        CreditRequest::new(user_id, ChangeType::StripePurchase, amount).with_idempotency_key(key)
    }

    #[tokio::test]
    async fn fresh_purchase_is_applied() {
        let ledger = service();
        let user = Uuid::now_v7();

        let outcome = ledger.apply(purchase(user, "evt_1", 100)).await.unwrap();
        let CreditOutcome::Applied { entry, wallet } = outcome else {
            panic!("expected applied outcome");
        };
        assert_eq!(wallet.balance, 100);
        assert_eq!(entry.balance_before, 0);
        assert_eq!(entry.balance_after, 100);
        assert_eq!(entry.change_type, ChangeType::StripePurchase);
        assert_eq!(entry.metadata[IDEMPOTENCY_METADATA_KEY].as_text(), Some("evt_1"));
        assert_eq!(ledger.history(user, 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_key_applies_once() {
        let ledger = service();
        let user = Uuid::now_v7();

        let first = ledger.apply(purchase(user, "evt_1", 100)).await.unwrap();
        let second = ledger.apply(purchase(user, "evt_1", 100)).await.unwrap();

        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
        assert_eq!(second.entry_id(), first.entry_id());
        assert_eq!(ledger.balance(user).await.unwrap(), 100);
        assert_eq!(ledger.history(user, 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicates_apply_once() {
        let ledger = service();
        let user = Uuid::now_v7();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.apply(purchase(user, "evt_race", 100)).await
            }));
        }

        let mut applied = 0;
        for handle in handles {
            if !handle.await.unwrap().unwrap().is_duplicate() {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
        assert_eq!(ledger.balance(user).await.unwrap(), 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_distinct_keys_never_lose_updates() {
        let ledger = service();
        let user = Uuid::now_v7();

        let mut handles = Vec::new();
        for index in 0..20 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.apply(purchase(user, &format!("evt_{index}"), 5)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(ledger.balance(user).await.unwrap(), 100);
        let report = ledger.audit(user).await.unwrap();
        assert_eq!(report.entries, 20);
    }

    #[tokio::test]
    async fn mixed_history_conserves_balance_and_chains() {
        let ledger = service_with_bonus(10);
        let user = Uuid::now_v7();

        ledger.open_wallet(user).await.unwrap();
        ledger.apply(purchase(user, "evt_1", 250)).await.unwrap();
        ledger.record_usage(user, 3, "listing_description", None).await.unwrap();
        let refund = CreditRequest::new(user, ChangeType::Refund, 3)
            .with_metadata("reason", "generation failed");
        ledger.apply(refund).await.unwrap();
        ledger
            .apply(CreditRequest::new(user, ChangeType::ManualAdjustment, -60))
            .await
            .unwrap();

        let mut entries = ledger.history(user, 100, 0).await.unwrap();
        entries.reverse();
        let sum: i64 = entries.iter().map(|entry| entry.change_amount).sum();
        assert_eq!(sum, ledger.balance(user).await.unwrap());
        assert_eq!(sum, 200);
        for pair in entries.windows(2) {
            assert_eq!(pair[0].balance_after, pair[1].balance_before);
        }
        assert!(ledger.audit(user).await.is_ok());
    }

    #[tokio::test]
    async fn overdraft_is_rejected_without_entry() {
        let ledger = service();
        let user = Uuid::now_v7();
        ledger.apply(purchase(user, "evt_1", 10)).await.unwrap();

        let err = ledger.record_usage(user, 15, "social_post", None).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { balance: 10, .. }));
        assert!(!err.is_retryable());
        assert_eq!(ledger.balance(user).await.unwrap(), 10);
        assert_eq!(ledger.history(user, 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn signup_bonus_is_granted_once() {
        let ledger = service_with_bonus(5);
        let user = Uuid::now_v7();

        assert_eq!(ledger.open_wallet(user).await.unwrap().balance, 5);
        assert_eq!(ledger.open_wallet(user).await.unwrap().balance, 5);
        assert_eq!(ledger.history(user, 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn open_wallet_without_bonus_creates_empty_wallet() {
        let ledger = service();
        let user = Uuid::now_v7();
        assert!(ledger.wallet(user).await.unwrap().is_none());
        assert_eq!(ledger.open_wallet(user).await.unwrap().balance, 0);
        assert!(ledger.wallet(user).await.unwrap().is_some());
        assert!(ledger.history(user, 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected() {
        let ledger = service();
        let user = Uuid::now_v7();

        assert!(matches!(
            ledger.apply(purchase(user, "evt_0", 0)).await,
            Err(LedgerError::ZeroAmount)
        ));
        assert!(matches!(
            ledger.apply(purchase(user, "evt_neg", -5)).await,
            Err(LedgerError::AmountSign { .. })
        ));
        assert!(matches!(
            ledger
                .apply(CreditRequest::new(user, ChangeType::StripePurchase, 100))
                .await,
            Err(LedgerError::MissingIdempotencyKey(ChangeType::StripePurchase))
        ));
        assert!(matches!(
            ledger.apply(purchase(user, "   ", 100)).await,
            Err(LedgerError::MissingIdempotencyKey(_))
        ));
        assert!(matches!(
            ledger.apply(purchase(user, &"k".repeat(300), 100)).await,
            Err(LedgerError::IdempotencyKeyTooLong)
        ));
        assert!(matches!(
            ledger.apply(CreditRequest::new(user, ChangeType::ActionUsage, 5)).await,
            Err(LedgerError::AmountSign { .. })
        ));
        assert_eq!(ledger.balance(user).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn metadata_is_truncated_before_storage() {
        let ledger = service();
        let user = Uuid::now_v7();
        let request = purchase(user, "evt_meta", 30)
            .with_metadata("long", "a".repeat(800))
            .with_metadata("short", "b".repeat(400));

        let CreditOutcome::Applied { entry, .. } = ledger.apply(request).await.unwrap() else {
            panic!("expected applied outcome");
        };
        let long = entry.metadata["long"].as_text().unwrap();
        assert_eq!(long.chars().count(), MAX_METADATA_VALUE_CHARS);
        assert!(long.ends_with(TRUNCATION_MARKER));
        assert_eq!(entry.metadata["short"].as_text().unwrap(), "b".repeat(400));
    }

    #[tokio::test]
    async fn stored_key_counts_toward_metadata_limit() {
        let ledger = service();
        let user = Uuid::now_v7();

        let mut full = purchase(user, "evt_full", 10);
        for index in 0..MAX_METADATA_KEYS {
            full = full.with_metadata(format!("k{index}"), "v");
        }
        assert!(matches!(
            ledger.apply(full).await,
            Err(LedgerError::Metadata(MetadataError::TooManyKeys { count })) if count == 51
        ));

        let mut fits = purchase(user, "evt_fits", 10);
        for index in 0..MAX_METADATA_KEYS - 1 {
            fits = fits.with_metadata(format!("k{index}"), "v");
        }
        let CreditOutcome::Applied { entry, .. } = ledger.apply(fits).await.unwrap() else {
            panic!("expected applied outcome");
        };
        assert_eq!(entry.metadata.len(), MAX_METADATA_KEYS);
        assert_eq!(
            entry.metadata[IDEMPOTENCY_METADATA_KEY].as_text(),
            Some("evt_fits")
        );
    }

    #[tokio::test]
    async fn caller_cannot_supply_idempotency_metadata() {
        let ledger = service();
        let user = Uuid::now_v7();
        let request = purchase(user, "evt_real", 10)
            .with_metadata(IDEMPOTENCY_METADATA_KEY, "evt_fake");

        let err = ledger.apply(request).await.unwrap_err();
        let LedgerError::Metadata(MetadataError::ReservedKey { key }) = err else {
            panic!("expected reserved key error");
        };
        assert_eq!(key, IDEMPOTENCY_METADATA_KEY);
        assert!(ledger.history(user, 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn audit_holds_during_concurrent_writes() {
        let ledger = service();
        let user = Uuid::now_v7();

        let writer = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                for index in 0..200 {
                    ledger
                        .apply(purchase(user, &format!("evt_{index}"), 1))
                        .await
                        .unwrap();
                }
            })
        };
        for _ in 0..200 {
            ledger.audit(user).await.unwrap();
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();

        let report = ledger.audit(user).await.unwrap();
        assert_eq!(report.entries, 200);
        assert_eq!(report.balance, 200);
    }

    #[tokio::test]
    async fn applied_change_is_published() {
        let ledger = service();
        let user = Uuid::now_v7();
        let mut subscription = ledger.subscribe(user);

        ledger.apply(purchase(user, "evt_1", 100)).await.unwrap();
        let snapshot = subscription.recv().await.unwrap();
        assert_eq!(snapshot.balance, 100);

        // Duplicates publish nothing; the next snapshot comes from a new change.
        ledger.apply(purchase(user, "evt_1", 100)).await.unwrap();
        ledger.apply(purchase(user, "evt_2", 30)).await.unwrap();
        assert_eq!(subscription.recv().await.unwrap().balance, 130);
    }

    #[test]
    fn generated_keys_are_prefixed_by_type() {
        let key = resolve_idempotency_key(ChangeType::ManualAdjustment, None).unwrap();
        assert!(key.starts_with("manual_adjustment:"));
        let other = resolve_idempotency_key(ChangeType::ManualAdjustment, None).unwrap();
        assert_ne!(key, other);
    }
}
