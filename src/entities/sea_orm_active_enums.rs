use std::fmt;

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Reason a wallet balance changed. Stored as its upper-case string form.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    #[sea_orm(string_value = "SIGNUP_BONUS")]
    SignupBonus,
    #[sea_orm(string_value = "STRIPE_PURCHASE")]
    StripePurchase,
    #[sea_orm(string_value = "ACTION_USAGE")]
    ActionUsage,
    #[sea_orm(string_value = "MANUAL_ADJUSTMENT")]
    ManualAdjustment,
    #[sea_orm(string_value = "REFUND")]
    Refund,
}

impl ChangeType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SignupBonus => "SIGNUP_BONUS",
            Self::StripePurchase => "STRIPE_PURCHASE",
            Self::ActionUsage => "ACTION_USAGE",
            Self::ManualAdjustment => "MANUAL_ADJUSTMENT",
            Self::Refund => "REFUND",
        }
    }

    /// Purchase credits must carry the provider's event id.
    pub const fn requires_idempotency_key(self) -> bool {
        matches!(self, Self::StripePurchase)
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
