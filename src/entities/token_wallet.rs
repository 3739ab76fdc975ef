//! Per-user token wallet. Exactly one row per user.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "token_wallets")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub user_id: Uuid,
    /// Current balance in tokens, never negative
    pub balance: i64,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::token_ledger_entry::Entity")]
    TokenLedgerEntry,
}

impl Related<super::token_ledger_entry::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TokenLedgerEntry.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
