pub mod prelude;

pub mod sea_orm_active_enums;
pub mod token_ledger_entry;
pub mod token_wallet;
