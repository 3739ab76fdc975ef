use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_query::Expr;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // One wallet per user; balance is only ever written by the credit operation
        manager
            .create_table(
                Table::create()
                    .table(TokenWallets::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TokenWallets::UserId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(TokenWallets::Balance)
                            .big_integer()
                            .not_null()
                            .default(0)
                            .check(Expr::col(TokenWallets::Balance).gte(0)),
                    )
                    .col(
                        ColumnDef::new(TokenWallets::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(TokenWallets::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TokenWallets::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum TokenWallets {
    Table,
    UserId,
    Balance,
    CreatedAt,
    UpdatedAt,
}
