//! Quota vocabulary shared with the quota service.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaType {
    Tokens,
    Requests,
    Cost,
}

impl QuotaType {
    /// Order in which pre-check evaluates quotas.
    pub const ALL: [QuotaType; 3] = [QuotaType::Tokens, QuotaType::Requests, QuotaType::Cost];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tokens => "tokens",
            Self::Requests => "requests",
            Self::Cost => "cost",
        }
    }
}

impl std::fmt::Display for QuotaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaCheck {
    pub allowed: bool,
    pub limit: Option<Decimal>,
    pub used: Decimal,
    pub remaining: Option<Decimal>,
}

impl QuotaCheck {
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: None,
            used: Decimal::ZERO,
            remaining: None,
        }
    }
}
