use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_query::Expr;

use crate::m20250301_000001_create_token_wallets::TokenWallets;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Append-only change log, one row per balance change
        manager
            .create_table(
                Table::create()
                    .table(TokenLedgerEntries::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TokenLedgerEntries::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(TokenLedgerEntries::UserId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TokenLedgerEntries::WalletId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TokenLedgerEntries::ChangeType)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TokenLedgerEntries::ChangeAmount)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TokenLedgerEntries::BalanceBefore)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TokenLedgerEntries::BalanceAfter)
                            .big_integer()
                            .not_null()
                            .check(Expr::col(TokenLedgerEntries::BalanceAfter).gte(0)),
                    )
                    .col(
                        ColumnDef::new(TokenLedgerEntries::IdempotencyKey)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TokenLedgerEntries::Metadata)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TokenLedgerEntries::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_token_ledger_entries_wallet")
                            .from(TokenLedgerEntries::Table, TokenLedgerEntries::WalletId)
                            .to(TokenWallets::Table, TokenWallets::UserId)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        // Idempotency: at most one entry per external event id
        manager
            .create_index(
                Index::create()
                    .name("idx_token_ledger_entries_idempotency_key")
                    .table(TokenLedgerEntries::Table)
                    .col(TokenLedgerEntries::IdempotencyKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_token_ledger_entries_wallet_id")
                    .table(TokenLedgerEntries::Table)
                    .col(TokenLedgerEntries::WalletId)
                    .col(TokenLedgerEntries::Id)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TokenLedgerEntries::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum TokenLedgerEntries {
    Table,
    Id,
    UserId,
    WalletId,
    ChangeType,
    ChangeAmount,
    BalanceBefore,
    BalanceAfter,
    IdempotencyKey,
    Metadata,
    CreatedAt,
}
