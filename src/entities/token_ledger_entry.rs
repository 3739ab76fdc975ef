//! Append-only change log entry. Rows are inserted once and never updated.

use sea_orm::entity::prelude::*;

use super::sea_orm_active_enums::ChangeType;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "token_ledger_entries")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: Uuid,
    pub wallet_id: Uuid,
    pub change_type: ChangeType,
    /// Signed delta applied to the wallet
    pub change_amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    #[sea_orm(column_type = "String(StringLen::N(255))", unique)]
    pub idempotency_key: String,
    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: Json,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::token_wallet::Entity",
        from = "Column::WalletId",
        to = "super::token_wallet::Column::UserId"
    )]
    TokenWallet,
}

impl Related<super::token_wallet::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TokenWallet.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
