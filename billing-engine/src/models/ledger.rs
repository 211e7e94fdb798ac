//! Append-only ledger of charges, refunds and adjustments.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerEntryType {
    Usage,
    Refund,
    Adjustment,
}

impl LedgerEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usage => "usage",
            Self::Refund => "refund",
            Self::Adjustment => "adjustment",
        }
    }
}

impl std::fmt::Display for LedgerEntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerEntryStatus {
    Pending,
    Processed,
    Failed,
}

/// One ledger line. Usage amounts are positive charges, refunds are
/// negative amounts, adjustments carry the signed balance change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: i64,
    pub usage_log_id: Option<Uuid>,
    pub request_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub entry_type: LedgerEntryType,
    pub status: LedgerEntryStatus,
    pub description: String,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    fn processed(
        user_id: i64,
        entry_type: LedgerEntryType,
        amount: Decimal,
        currency: &str,
        description: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            usage_log_id: None,
            request_id: None,
            amount,
            currency: currency.to_string(),
            entry_type,
            status: LedgerEntryStatus::Processed,
            description,
            processed_at: Some(now),
            created_at: now,
        }
    }

    pub fn usage(
        user_id: i64,
        usage_log_id: Uuid,
        request_id: &str,
        amount: Decimal,
        currency: &str,
    ) -> Self {
        let mut entry = Self::processed(
            user_id,
            LedgerEntryType::Usage,
            amount,
            currency,
            format!("API usage cost for request {}", request_id),
        );
        entry.usage_log_id = Some(usage_log_id);
        entry.request_id = Some(request_id.to_string());
        entry
    }

    /// `amount` is the positive sum returned; it is stored negated.
    pub fn refund(
        user_id: i64,
        usage_log_id: Uuid,
        request_id: &str,
        amount: Decimal,
        currency: &str,
        reason: &str,
    ) -> Self {
        let mut entry = Self::processed(
            user_id,
            LedgerEntryType::Refund,
            -amount,
            currency,
            format!("Refund for request {}: {}", request_id, reason),
        );
        entry.usage_log_id = Some(usage_log_id);
        entry.request_id = Some(request_id.to_string());
        entry
    }

    pub fn adjustment(user_id: i64, amount: Decimal, currency: &str, reason: &str) -> Self {
        Self::processed(
            user_id,
            LedgerEntryType::Adjustment,
            amount,
            currency,
            format!("Balance adjustment: {}", reason),
        )
    }

    /// Signed effect this entry had on the user's balance.
    pub fn balance_effect(&self) -> Decimal {
        if self.status != LedgerEntryStatus::Processed {
            return Decimal::ZERO;
        }
        match self.entry_type {
            LedgerEntryType::Usage | LedgerEntryType::Refund => -self.amount,
            LedgerEntryType::Adjustment => self.amount,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn balance_effects_by_type() {
        let log = Uuid::new_v4();
        let usage = LedgerEntry::usage(1, log, "req", dec!(2.5), "USD");
        let refund = LedgerEntry::refund(1, log, "req", dec!(1), "USD", "dup");
        let adjust = LedgerEntry::adjustment(1, dec!(-0.5), "USD", "fix");

        assert_eq!(usage.balance_effect(), dec!(-2.5));
        assert_eq!(refund.amount, dec!(-1));
        assert_eq!(refund.balance_effect(), dec!(1));
        assert_eq!(adjust.balance_effect(), dec!(-0.5));
        assert_eq!(refund.description, "Refund for request req: dup");
    }

    #[test]
    fn unprocessed_entries_have_no_effect() {
        let mut entry = LedgerEntry::adjustment(1, dec!(3), "USD", "promo");
        entry.status = LedgerEntryStatus::Failed;
        assert_eq!(entry.balance_effect(), Decimal::ZERO);
    }
}
