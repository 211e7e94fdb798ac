//! Persisted usage log, one per request attempt.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::record::RequestKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageLog {
    pub id: Uuid,
    pub request_id: String,
    pub user_id: i64,
    pub api_key_id: i64,
    pub model_id: i64,
    pub provider_id: Option<i64>,
    pub kind: RequestKind,
    pub method: String,
    pub endpoint: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub duration_ms: u64,
    pub status_code: u16,
    pub cost: Decimal,
    pub is_billed: bool,
    /// Amount taken from the balance with no ledger entry behind it, left
    /// after a charge whose ledger write and rollback both failed. Billing
    /// stops for this request until an operator settles it.
    #[serde(default)]
    pub unrecorded_charge: Option<Decimal>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set on creation for synchronous calls, on completion for async jobs.
    pub completed_at: Option<DateTime<Utc>>,
}

impl UsageLog {
    pub fn is_successful(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn needs_manual_review(&self) -> bool {
        self.unrecorded_charge.is_some()
    }

    pub fn awaiting_completion(&self) -> bool {
        self.kind.is_async() && self.completed_at.is_none()
    }
}
