use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::ActiveValue::{NotSet, Set};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    IntoActiveModel, QueryFilter, QueryOrder, QuerySelect, SqlErr, TransactionTrait,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entities::{token_ledger_entry, token_wallet};

use super::store::next_balance;
use super::{
    AppendRequest, AuditSnapshot, CreditOutcome, LedgerEntry, LedgerError, LedgerStore, Metadata,
    Wallet,
};

const MAX_PAGE_SIZE: u64 = 1_000;

/// PostgreSQL store. Appends lock the wallet row with `SELECT ... FOR UPDATE` for
/// the duration of the transaction; the unique index on `idempotency_key` catches
/// the same key racing across two different wallets.
pub struct PgLedgerStore {
    database: DatabaseConnection,
}

impl PgLedgerStore {
    pub fn new(database: DatabaseConnection) -> Self {
        Self { database }
    }

    async fn find_entry_id_by_key<C: ConnectionTrait>(
        conn: &C,
        key: &str,
    ) -> Result<Option<i64>, DbErr> {
        let existing = token_ledger_entry::Entity::find()
            .filter(token_ledger_entry::Column::IdempotencyKey.eq(key))
            .one(conn)
            .await?;
        Ok(existing.map(|entry| entry.id))
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn get_wallet(&self, user_id: Uuid) -> Result<Option<Wallet>, LedgerError> {
        let wallet = token_wallet::Entity::find_by_id(user_id)
            .one(&self.database)
            .await?;
        Ok(wallet.map(Wallet::from))
    }

    async fn ensure_wallet(&self, user_id: Uuid) -> Result<Wallet, LedgerError> {
        insert_wallet_if_missing(&self.database, user_id, fixed_now()).await?;
        let wallet = token_wallet::Entity::find_by_id(user_id)
            .one(&self.database)
            .await?
            .ok_or_else(|| missing_wallet(user_id))?;
        Ok(wallet.into())
    }

    async fn append_entry_if_absent(
        &self,
        request: AppendRequest,
    ) -> Result<CreditOutcome, LedgerError> {
        assert!(
            !request.idempotency_key.is_empty(),
            "Idempotency key must be resolved before storage"
        );
        let metadata = serde_json::to_value(&request.metadata)
            .map_err(|err| DbErr::Json(err.to_string()))?;
        let now = fixed_now();

        let txn = self.database.begin().await?;
        insert_wallet_if_missing(&txn, request.user_id, now).await?;

        // Held until commit or rollback; serializes every writer of this wallet.
        let wallet = token_wallet::Entity::find_by_id(request.user_id)
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or_else(|| missing_wallet(request.user_id))?;

        if let Some(entry_id) = Self::find_entry_id_by_key(&txn, &request.idempotency_key).await? {
            txn.rollback().await?;
            return Ok(CreditOutcome::Duplicate { entry_id });
        }

        let balance_before = wallet.balance;
        let balance_after = match next_balance(balance_before, request.amount) {
            Ok(balance) => balance,
            Err(err) => {
                txn.rollback().await?;
                return Err(err);
            }
        };

        let mut wallet_update = wallet.into_active_model();
        wallet_update.balance = Set(balance_after);
        wallet_update.updated_at = Set(now);
        let wallet = wallet_update.update(&txn).await?;

        let entry = token_ledger_entry::ActiveModel {
            id: NotSet,
            user_id: Set(request.user_id),
            wallet_id: Set(request.user_id),
            change_type: Set(request.change_type),
            change_amount: Set(request.amount),
            balance_before: Set(balance_before),
            balance_after: Set(balance_after),
            idempotency_key: Set(request.idempotency_key.clone()),
            metadata: Set(metadata),
            created_at: Set(now),
        };

        let entry = match entry.insert(&txn).await {
            Ok(model) => model,
            Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                txn.rollback().await?;
                warn!(
                    "Idempotency key {} claimed concurrently by another wallet",
                    request.idempotency_key
                );
                let entry_id = Self::find_entry_id_by_key(&self.database, &request.idempotency_key)
                    .await?
                    .ok_or(err)?;
                return Ok(CreditOutcome::Duplicate { entry_id });
            }
            Err(err) => return Err(err.into()),
        };

        txn.commit().await?;
        debug!(
            "Committed ledger entry {} for wallet {}",
            entry.id, entry.wallet_id
        );

        Ok(CreditOutcome::Applied {
            entry: entry.try_into()?,
            wallet: wallet.into(),
        })
    }

    async fn list_entries(
        &self,
        user_id: Uuid,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        assert!(limit <= MAX_PAGE_SIZE, "Ledger page size exceeds bound");
        let models = token_ledger_entry::Entity::find()
            .filter(token_ledger_entry::Column::WalletId.eq(user_id))
            .order_by_desc(token_ledger_entry::Column::Id)
            .limit(limit)
            .offset(offset)
            .all(&self.database)
            .await?;
        models
            .into_iter()
            .map(LedgerEntry::try_from)
            .collect::<Result<Vec<_>, _>>()
            .map_err(LedgerError::from)
    }

    async fn audit_snapshot(&self, user_id: Uuid) -> Result<AuditSnapshot, LedgerError> {
        let txn = self.database.begin().await?;
        // FOR SHARE holds off appends to this wallet until the entries are read.
        let Some(wallet) = token_wallet::Entity::find_by_id(user_id)
            .lock_shared()
            .one(&txn)
            .await?
        else {
            txn.commit().await?;
            return Ok(AuditSnapshot {
                balance: 0,
                entries: Vec::new(),
            });
        };
        let models = token_ledger_entry::Entity::find()
            .filter(token_ledger_entry::Column::WalletId.eq(user_id))
            .order_by_asc(token_ledger_entry::Column::Id)
            .all(&txn)
            .await?;
        txn.commit().await?;

        let entries = models
            .into_iter()
            .map(LedgerEntry::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AuditSnapshot {
            balance: wallet.balance,
            entries,
        })
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        self.database.ping().await?;
        Ok(())
    }
}

async fn insert_wallet_if_missing<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    now: DateTime<FixedOffset>,
) -> Result<(), DbErr> {
    let seed = token_wallet::ActiveModel {
        user_id: Set(user_id),
        balance: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
    };
    token_wallet::Entity::insert(seed)
        .on_conflict(
            OnConflict::column(token_wallet::Column::UserId)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;
    Ok(())
}

fn missing_wallet(user_id: Uuid) -> LedgerError {
    LedgerError::Storage(DbErr::RecordNotFound(format!(
        "wallet {user_id} vanished after insert"
    )))
}

fn fixed_now() -> DateTime<FixedOffset> {
    Utc::now().fixed_offset()
}

impl From<token_wallet::Model> for Wallet {
    fn from(model: token_wallet::Model) -> Self {
        Self {
            user_id: model.user_id,
            balance: model.balance,
            created_at: model.created_at.with_timezone(&Utc),
            updated_at: model.updated_at.with_timezone(&Utc),
        }
    }
}

impl TryFrom<token_ledger_entry::Model> for LedgerEntry {
    type Error = DbErr;

    fn try_from(model: token_ledger_entry::Model) -> Result<Self, Self::Error> {
        let metadata: Metadata = serde_json::from_value(model.metadata).map_err(|err| {
            DbErr::Json(format!("ledger entry {} metadata: {err}", model.id))
        })?;
        Ok(Self {
            id: model.id,
            user_id: model.user_id,
            wallet_id: model.wallet_id,
            change_type: model.change_type,
            change_amount: model.change_amount,
            balance_before: model.balance_before,
            balance_after: model.balance_after,
            idempotency_key: model.idempotency_key,
            metadata,
            created_at: model.created_at.with_timezone(&Utc),
        })
    }
}
