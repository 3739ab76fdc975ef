//! The single package → token table shared by checkout creation and webhook crediting.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Checkout session metadata key carrying the purchasing user's id.
pub const METADATA_USER_ID: &str = "userId";
/// Checkout session metadata key carrying the package identifier.
pub const METADATA_PACKAGE_ID: &str = "packageId";

pub const MAX_PACKAGE_ID_LEN: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TokenPackage {
    Tokens30,
    Tokens100,
    Tokens250,
}

impl TokenPackage {
    pub const ALL: [TokenPackage; 3] = [Self::Tokens30, Self::Tokens100, Self::Tokens250];

    pub const fn id(self) -> &'static str {
        match self {
            Self::Tokens30 => "30",
            Self::Tokens100 => "100",
            Self::Tokens250 => "250",
        }
    }

    pub const fn tokens(self) -> i64 {
        match self {
            Self::Tokens30 => 30,
            Self::Tokens100 => 100,
            Self::Tokens250 => 250,
        }
    }

    pub fn from_id(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.len() > MAX_PACKAGE_ID_LEN {
            return None;
        }
        Self::ALL.into_iter().find(|package| package.id() == trimmed)
    }
}

impl fmt::Display for TokenPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for TokenPackage {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::from_id(value).ok_or_else(|| anyhow!("Unknown token package: {value}"))
    }
}

impl TryFrom<String> for TokenPackage {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TokenPackage> for String {
    fn from(package: TokenPackage) -> Self {
        package.id().to_string()
    }
}
