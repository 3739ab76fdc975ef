#![allow(unused_imports)]

pub use super::token_ledger_entry::Entity as TokenLedgerEntry;
pub use super::token_wallet::Entity as TokenWallet;
