//! Request-scoped billing record and its lifecycle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::quota::QuotaType;
use super::usage_log::UsageLog;
use crate::error::BillingError;

/// What kind of upstream call a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Synchronous API call, billable as soon as the response is known.
    #[default]
    Api,
    /// Image generation job whose outcome arrives through a completion callback.
    AsyncImageJob,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::AsyncImageJob => "async_image_job",
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Self::AsyncImageJob)
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle stage of a billing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStage {
    #[default]
    PreCheck,
    Pending,
    Processed,
    Error,
    Refunded,
    LogOnly,
}

impl BillingStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreCheck => "pre_check",
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Error => "error",
            Self::Refunded => "refunded",
            Self::LogOnly => "log_only",
        }
    }

    /// Allowed forward edges. `LogOnly` is an initial state with no exits.
    pub fn can_transition_to(self, next: BillingStage) -> bool {
        matches!(
            (self, next),
            (Self::PreCheck, Self::Pending)
                | (Self::PreCheck, Self::Error)
                | (Self::Pending, Self::Processed)
                | (Self::Pending, Self::Error)
                | (Self::Processed, Self::Refunded)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Processed | Self::Error | Self::Refunded)
    }
}

impl std::fmt::Display for BillingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything known about one request, from pre-check to final disposition.
///
/// Built once by the caller and passed by reference to the manager, which
/// mutates it in place.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BillingRecord {
    pub request_id: String,
    pub user_id: i64,
    pub api_key_id: i64,
    pub model_id: i64,
    pub provider_id: Option<i64>,

    pub method: String,
    pub endpoint: String,
    pub kind: RequestKind,

    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,

    pub estimated_cost: Decimal,
    pub actual_cost: Decimal,

    pub status_code: u16,
    pub duration_ms: u64,
    pub success: bool,
    pub error_message: Option<String>,

    pub stage: BillingStage,
    is_billed: bool,
    pub billing_error: Option<String>,
}

impl BillingRecord {
    pub fn new(
        request_id: impl Into<String>,
        user_id: i64,
        api_key_id: i64,
        model_id: i64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            user_id,
            api_key_id,
            model_id,
            ..Default::default()
        }
    }

    pub fn is_billed(&self) -> bool {
        self.is_billed
    }

    /// One-way: there is no way to clear the flag.
    pub(crate) fn mark_billed(&mut self) {
        self.is_billed = true;
    }

    /// Input tokens, derived as `total - output` when only those two are known.
    pub fn calculate_input_tokens(&self) -> u64 {
        if self.input_tokens == 0 && self.total_tokens > 0 && self.output_tokens > 0 {
            return self.total_tokens.saturating_sub(self.output_tokens);
        }
        self.input_tokens
    }

    pub fn calculate_output_tokens(&self) -> u64 {
        if self.output_tokens == 0 && self.total_tokens > 0 && self.input_tokens > 0 {
            return self.total_tokens.saturating_sub(self.input_tokens);
        }
        self.output_tokens
    }

    pub fn calculate_total_tokens(&self) -> u64 {
        if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.input_tokens.saturating_add(self.output_tokens)
        }
    }

    /// Success flag set and a 2xx status.
    pub fn is_successful(&self) -> bool {
        self.success && (200..300).contains(&self.status_code)
    }

    /// Async jobs only bill once their completion has been processed.
    pub fn should_bill(&self) -> bool {
        if !self.is_successful() {
            return false;
        }
        !self.kind.is_async() || self.stage == BillingStage::Processed
    }

    pub fn advance(&mut self, next: BillingStage) -> Result<(), BillingError> {
        if self.stage == next {
            return Ok(());
        }
        if !self.stage.can_transition_to(next) {
            return Err(BillingError::InvalidTransition {
                from: self.stage,
                to: next,
            });
        }
        self.stage = next;
        Ok(())
    }

    /// Record a billing failure, moving to `Error` when the stage allows it.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.billing_error = Some(error.into());
        if self.stage.can_transition_to(BillingStage::Error) {
            self.stage = BillingStage::Error;
        }
    }

    /// Value handed to the quota service for each quota type.
    pub fn quota_value(&self, quota_type: QuotaType, cost: Decimal) -> Decimal {
        match quota_type {
            QuotaType::Tokens => Decimal::from(self.calculate_total_tokens()),
            QuotaType::Requests => Decimal::ONE,
            QuotaType::Cost => cost,
        }
    }

    /// Durable usage log for this attempt. Synchronous calls are complete on
    /// creation; async jobs wait for their completion callback. Cost stays
    /// zero until a charge settles.
    pub fn to_usage_log(&self) -> UsageLog {
        let now = Utc::now();
        let completed_at = if self.kind.is_async() && self.stage != BillingStage::Processed {
            None
        } else {
            Some(now)
        };

        UsageLog {
            id: Uuid::new_v4(),
            request_id: self.request_id.clone(),
            user_id: self.user_id,
            api_key_id: self.api_key_id,
            model_id: self.model_id,
            provider_id: self.provider_id,
            kind: self.kind,
            method: self.method.clone(),
            endpoint: self.endpoint.clone(),
            input_tokens: self.calculate_input_tokens(),
            output_tokens: self.calculate_output_tokens(),
            total_tokens: self.calculate_total_tokens(),
            duration_ms: self.duration_ms,
            status_code: self.status_code,
            cost: Decimal::ZERO,
            is_billed: self.is_billed,
            unrecorded_charge: None,
            error_message: self.error_message.clone(),
            created_at: now,
            completed_at,
        }
    }

    /// Rebuild a record from a stored usage log when an async job completes.
    pub fn from_usage_log(log: &UsageLog, success: bool) -> Self {
        Self {
            request_id: log.request_id.clone(),
            user_id: log.user_id,
            api_key_id: log.api_key_id,
            model_id: log.model_id,
            provider_id: log.provider_id,
            method: log.method.clone(),
            endpoint: log.endpoint.clone(),
            kind: log.kind,
            input_tokens: log.input_tokens,
            output_tokens: log.output_tokens,
            total_tokens: log.total_tokens,
            estimated_cost: Decimal::ZERO,
            actual_cost: Decimal::ZERO,
            status_code: match (success, log.is_successful()) {
                (true, true) => log.status_code,
                (true, false) => 200,
                (false, _) => 500,
            },
            duration_ms: log.duration_ms,
            success,
            error_message: if success {
                None
            } else {
                Some("async job failed".to_string())
            },
            stage: BillingStage::Processed,
            is_billed: log.is_billed,
            billing_error: None,
        }
    }
}

/// Why a pre-check refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreCheckReason {
    InsufficientBalance,
    TokensQuotaExceeded,
    RequestsQuotaExceeded,
    CostQuotaExceeded,
}

impl PreCheckReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InsufficientBalance => "insufficient_balance",
            Self::TokensQuotaExceeded => "tokens_quota_exceeded",
            Self::RequestsQuotaExceeded => "requests_quota_exceeded",
            Self::CostQuotaExceeded => "cost_quota_exceeded",
        }
    }

    pub fn quota_exceeded(quota_type: QuotaType) -> Self {
        match quota_type {
            QuotaType::Tokens => Self::TokensQuotaExceeded,
            QuotaType::Requests => Self::RequestsQuotaExceeded,
            QuotaType::Cost => Self::CostQuotaExceeded,
        }
    }

    /// Error code returned to API clients.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InsufficientBalance => "INSUFFICIENT_BALANCE",
            Self::TokensQuotaExceeded => "TOKEN_QUOTA_EXCEEDED",
            Self::RequestsQuotaExceeded => "REQUEST_QUOTA_EXCEEDED",
            Self::CostQuotaExceeded => "COST_QUOTA_EXCEEDED",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::InsufficientBalance => "Insufficient account balance",
            Self::TokensQuotaExceeded => "Token quota exceeded",
            Self::RequestsQuotaExceeded => "Request quota exceeded",
            Self::CostQuotaExceeded => "Cost quota exceeded",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::InsufficientBalance => 402,
            _ => 429,
        }
    }
}

impl std::fmt::Display for PreCheckReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreCheckResult {
    pub balance_ok: bool,
    pub quota_ok: bool,
    pub can_proceed: bool,
    pub reason: Option<PreCheckReason>,
    pub estimated_cost: Decimal,
    pub details: HashMap<String, serde_json::Value>,
}

impl PreCheckResult {
    pub fn denied(reason: PreCheckReason, estimated_cost: Decimal) -> Self {
        Self {
            balance_ok: reason != PreCheckReason::InsufficientBalance,
            quota_ok: false,
            can_proceed: false,
            reason: Some(reason),
            estimated_cost,
            details: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BillingResult {
    pub success: bool,
    pub amount: Decimal,
    pub usage_log_id: Option<Uuid>,
    pub ledger_entry_id: Option<Uuid>,
    pub error: Option<String>,
}

impl BillingResult {
    pub fn not_charged(usage_log_id: Uuid) -> Self {
        Self {
            success: true,
            amount: Decimal::ZERO,
            usage_log_id: Some(usage_log_id),
            ledger_entry_id: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> BillingRecord {
        let mut record = BillingRecord::new("req-1", 1, 2, 3);
        record.status_code = 200;
        record.success = true;
        record
    }

    #[test]
    fn input_tokens_derived_from_total_and_output() {
        let mut r = record();
        r.total_tokens = 100;
        r.output_tokens = 40;
        assert_eq!(r.calculate_input_tokens(), 60);
    }

    #[test]
    fn explicit_input_tokens_win() {
        let mut r = record();
        r.input_tokens = 10;
        r.total_tokens = 100;
        r.output_tokens = 40;
        assert_eq!(r.calculate_input_tokens(), 10);
    }

    #[test]
    fn total_tokens_summed_when_absent() {
        let mut r = record();
        r.input_tokens = 30;
        r.output_tokens = 20;
        assert_eq!(r.calculate_total_tokens(), 50);
    }

    #[test]
    fn output_larger_than_total_does_not_underflow() {
        let mut r = record();
        r.total_tokens = 10;
        r.output_tokens = 40;
        assert_eq!(r.calculate_input_tokens(), 0);
    }

    #[test]
    fn sync_success_is_billable() {
        let r = record();
        assert!(r.should_bill());
    }

    #[test]
    fn non_2xx_is_not_billable() {
        let mut r = record();
        r.status_code = 502;
        assert!(!r.is_successful());
        assert!(!r.should_bill());
    }

    #[test]
    fn async_job_bills_only_when_processed() {
        let mut r = record();
        r.kind = RequestKind::AsyncImageJob;
        r.stage = BillingStage::Pending;
        assert!(!r.should_bill());

        r.advance(BillingStage::Processed).unwrap();
        assert!(r.should_bill());
    }

    #[test]
    fn stage_transitions_follow_lifecycle() {
        let mut r = record();
        r.advance(BillingStage::Pending).unwrap();
        r.advance(BillingStage::Processed).unwrap();
        r.advance(BillingStage::Refunded).unwrap();

        let err = r.advance(BillingStage::Pending).unwrap_err();
        assert!(matches!(err, BillingError::InvalidTransition { .. }));
    }

    #[test]
    fn log_only_has_no_exits() {
        for next in [
            BillingStage::Pending,
            BillingStage::Processed,
            BillingStage::Error,
            BillingStage::Refunded,
        ] {
            assert!(!BillingStage::LogOnly.can_transition_to(next));
        }
    }

    #[test]
    fn billed_flag_is_one_way() {
        let mut r = record();
        assert!(!r.is_billed());
        r.mark_billed();
        r.mark_billed();
        assert!(r.is_billed());
    }

    #[test]
    fn pending_async_log_awaits_completion() {
        let mut r = record();
        r.kind = RequestKind::AsyncImageJob;
        r.stage = BillingStage::Pending;
        let log = r.to_usage_log();
        assert!(log.awaiting_completion());

        let rebuilt = BillingRecord::from_usage_log(&log, true);
        assert_eq!(rebuilt.stage, BillingStage::Processed);
        assert!(rebuilt.should_bill());
    }

    #[test]
    fn precheck_reason_codes() {
        assert_eq!(
            PreCheckReason::quota_exceeded(QuotaType::Requests).error_code(),
            "REQUEST_QUOTA_EXCEEDED"
        );
        assert_eq!(PreCheckReason::InsufficientBalance.http_status(), 402);
        assert_eq!(
            serde_json::to_value(PreCheckReason::TokensQuotaExceeded).unwrap(),
            "tokens_quota_exceeded"
        );
    }
}
