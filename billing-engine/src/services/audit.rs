//! Billing audit trail.
//!
//! Every billing transition is emitted as a structured `AuditEvent` through
//! an injected `AuditSink`. Sinks never fail the caller.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::models::{
    BillingRecord, BillingResult, BillingStage, CompensationTask, ConsistencyCheckResult,
    PreCheckResult, QuotaType, RequestKind,
};

/// Audit event types.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    BillingPrecheckStart {
        request_id: String,
        user_id: i64,
        api_key_id: i64,
        model_id: i64,
    },
    BillingPrecheckResult {
        request_id: String,
        user_id: i64,
        api_key_id: i64,
        can_proceed: bool,
        balance_ok: bool,
        quota_ok: bool,
        estimated_cost: Decimal,
        reason: Option<String>,
    },
    BillingPrecheckError {
        request_id: String,
        user_id: i64,
        api_key_id: i64,
        error_type: String,
        error: String,
    },
    BillingStart {
        request_id: String,
        user_id: i64,
        api_key_id: i64,
        model_id: i64,
        provider_id: Option<i64>,
        request_kind: RequestKind,
        input_tokens: u64,
        output_tokens: u64,
        total_tokens: u64,
        estimated_cost: Decimal,
        stage: BillingStage,
    },
    BillingResult {
        request_id: String,
        user_id: i64,
        api_key_id: i64,
        success: bool,
        amount: Decimal,
        usage_log_id: Option<Uuid>,
        ledger_entry_id: Option<Uuid>,
        reason: String,
        error: Option<String>,
    },
    BillingError {
        request_id: String,
        user_id: i64,
        api_key_id: i64,
        model_id: i64,
        error_type: String,
        error: String,
    },
    BillingAsyncCompletionStart {
        request_id: String,
        user_id: i64,
        api_key_id: i64,
        request_kind: RequestKind,
        task_success: bool,
    },
    BillingAsyncCompletionResult {
        request_id: String,
        user_id: i64,
        api_key_id: i64,
        amount: Decimal,
        reason: String,
        is_billed: bool,
    },
    BillingLogOnlyStart {
        request_id: String,
        user_id: i64,
        endpoint: String,
    },
    BillingLogOnlyResult {
        request_id: String,
        user_id: i64,
        usage_log_id: Uuid,
    },
    QuotaConsumption {
        request_id: String,
        api_key_id: i64,
        quota_type: QuotaType,
        value: Decimal,
        success: bool,
        error: Option<String>,
    },
    BillingRefund {
        request_id: String,
        user_id: i64,
        usage_log_id: Uuid,
        amount: Decimal,
        reason: String,
        stage: BillingStage,
    },
    CompensationResult {
        task_id: String,
        task_type: String,
        user_id: i64,
        status: String,
        attempts: u32,
        error: Option<String>,
    },
    BillingConsistencyCheck {
        check_type: String,
        total_checked: usize,
        inconsistent_count: usize,
        fixed_count: usize,
        error_count: usize,
    },
}

/// Severity used when an event is written to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl AuditEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BillingPrecheckStart { .. } => "billing_precheck_start",
            Self::BillingPrecheckResult { .. } => "billing_precheck_result",
            Self::BillingPrecheckError { .. } => "billing_precheck_error",
            Self::BillingStart { .. } => "billing_start",
            Self::BillingResult { .. } => "billing_result",
            Self::BillingError { .. } => "billing_error",
            Self::BillingAsyncCompletionStart { .. } => "billing_async_completion_start",
            Self::BillingAsyncCompletionResult { .. } => "billing_async_completion_result",
            Self::BillingLogOnlyStart { .. } => "billing_log_only_start",
            Self::BillingLogOnlyResult { .. } => "billing_log_only_result",
            Self::QuotaConsumption { .. } => "quota_consumption",
            Self::BillingRefund { .. } => "billing_refund",
            Self::CompensationResult { .. } => "compensation_result",
            Self::BillingConsistencyCheck { .. } => "billing_consistency_check",
        }
    }

    pub fn level(&self) -> AuditLevel {
        match self {
            Self::BillingPrecheckError { .. } | Self::BillingError { .. } => AuditLevel::Error,
            Self::BillingResult { success, .. } if !success => AuditLevel::Error,
            Self::QuotaConsumption { success, .. } => {
                if *success {
                    AuditLevel::Debug
                } else {
                    AuditLevel::Warn
                }
            }
            Self::CompensationResult { error, .. } if error.is_some() => AuditLevel::Error,
            Self::BillingConsistencyCheck {
                inconsistent_count, ..
            } if *inconsistent_count > 0 => AuditLevel::Warn,
            _ => AuditLevel::Info,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::BillingPrecheckStart { request_id, .. }
            | Self::BillingPrecheckResult { request_id, .. }
            | Self::BillingPrecheckError { request_id, .. }
            | Self::BillingStart { request_id, .. }
            | Self::BillingResult { request_id, .. }
            | Self::BillingError { request_id, .. }
            | Self::BillingAsyncCompletionStart { request_id, .. }
            | Self::BillingAsyncCompletionResult { request_id, .. }
            | Self::BillingLogOnlyStart { request_id, .. }
            | Self::BillingLogOnlyResult { request_id, .. }
            | Self::QuotaConsumption { request_id, .. }
            | Self::BillingRefund { request_id, .. } => Some(request_id),
            Self::CompensationResult { .. } | Self::BillingConsistencyCheck { .. } => None,
        }
    }
}

/// Destination for audit events. Implementations must swallow their own failures.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: &AuditEvent);
}

/// Writes audit events as structured tracing records under the `billing_audit` target.
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: &AuditEvent) {
        let payload = serde_json::to_string(event).unwrap_or_else(|e| {
            format!("{{\"event\":\"{}\",\"serialize_error\":\"{}\"}}", event.name(), e)
        });
        let name = event.name();
        let request_id = event.request_id().unwrap_or("");

        match event.level() {
            AuditLevel::Debug => {
                tracing::debug!(
                    target: "billing_audit",
                    event = name,
                    request_id,
                    payload = %payload,
                    "Billing audit event"
                )
            }
            AuditLevel::Info => {
                tracing::info!(
                    target: "billing_audit",
                    event = name,
                    request_id,
                    payload = %payload,
                    "Billing audit event"
                )
            }
            AuditLevel::Warn => {
                tracing::warn!(
                    target: "billing_audit",
                    event = name,
                    request_id,
                    payload = %payload,
                    "Billing audit event"
                )
            }
            AuditLevel::Error => {
                tracing::error!(
                    target: "billing_audit",
                    event = name,
                    request_id,
                    payload = %payload,
                    "Billing audit event"
                )
            }
        }
    }
}

/// Keeps events in memory with their emission time.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<(DateTime<Utc>, AuditEvent)>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(AuditEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: &AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((Utc::now(), event.clone()));
    }
}

/// Builds audit events from engine values so callers never assemble them by hand.
#[derive(Clone)]
pub struct BillingAuditLogger {
    sink: Arc<dyn AuditSink>,
}

impl BillingAuditLogger {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    pub fn precheck_start(&self, record: &BillingRecord) {
        self.sink.emit(&AuditEvent::BillingPrecheckStart {
            request_id: record.request_id.clone(),
            user_id: record.user_id,
            api_key_id: record.api_key_id,
            model_id: record.model_id,
        });
    }

    pub fn precheck_result(&self, record: &BillingRecord, result: &PreCheckResult) {
        self.sink.emit(&AuditEvent::BillingPrecheckResult {
            request_id: record.request_id.clone(),
            user_id: record.user_id,
            api_key_id: record.api_key_id,
            can_proceed: result.can_proceed,
            balance_ok: result.balance_ok,
            quota_ok: result.quota_ok,
            estimated_cost: result.estimated_cost,
            reason: result.reason.map(|r| r.as_str().to_string()),
        });
    }

    pub fn precheck_error(
        &self,
        record: &BillingRecord,
        error_type: &str,
        error: &dyn std::fmt::Display,
    ) {
        self.sink.emit(&AuditEvent::BillingPrecheckError {
            request_id: record.request_id.clone(),
            user_id: record.user_id,
            api_key_id: record.api_key_id,
            error_type: error_type.to_string(),
            error: error.to_string(),
        });
    }

    pub fn billing_start(&self, record: &BillingRecord) {
        self.sink.emit(&AuditEvent::BillingStart {
            request_id: record.request_id.clone(),
            user_id: record.user_id,
            api_key_id: record.api_key_id,
            model_id: record.model_id,
            provider_id: record.provider_id,
            request_kind: record.kind,
            input_tokens: record.calculate_input_tokens(),
            output_tokens: record.calculate_output_tokens(),
            total_tokens: record.calculate_total_tokens(),
            estimated_cost: record.estimated_cost,
            stage: record.stage,
        });
    }

    pub fn billing_result(&self, record: &BillingRecord, result: &BillingResult, reason: &str) {
        self.sink.emit(&AuditEvent::BillingResult {
            request_id: record.request_id.clone(),
            user_id: record.user_id,
            api_key_id: record.api_key_id,
            success: result.success,
            amount: result.amount,
            usage_log_id: result.usage_log_id,
            ledger_entry_id: result.ledger_entry_id,
            reason: reason.to_string(),
            error: result.error.clone(),
        });
    }

    pub fn billing_error(
        &self,
        record: &BillingRecord,
        error_type: &str,
        error: &dyn std::fmt::Display,
    ) {
        self.sink.emit(&AuditEvent::BillingError {
            request_id: record.request_id.clone(),
            user_id: record.user_id,
            api_key_id: record.api_key_id,
            model_id: record.model_id,
            error_type: error_type.to_string(),
            error: error.to_string(),
        });
    }

    pub fn async_completion_start(&self, record: &BillingRecord, success: bool) {
        self.sink.emit(&AuditEvent::BillingAsyncCompletionStart {
            request_id: record.request_id.clone(),
            user_id: record.user_id,
            api_key_id: record.api_key_id,
            request_kind: record.kind,
            task_success: success,
        });
    }

    pub fn async_completion_result(&self, record: &BillingRecord, amount: Decimal, reason: &str) {
        self.sink.emit(&AuditEvent::BillingAsyncCompletionResult {
            request_id: record.request_id.clone(),
            user_id: record.user_id,
            api_key_id: record.api_key_id,
            amount,
            reason: reason.to_string(),
            is_billed: record.is_billed(),
        });
    }

    pub fn log_only_start(&self, request_id: &str, user_id: i64, endpoint: &str) {
        self.sink.emit(&AuditEvent::BillingLogOnlyStart {
            request_id: request_id.to_string(),
            user_id,
            endpoint: endpoint.to_string(),
        });
    }

    pub fn log_only_result(&self, request_id: &str, user_id: i64, usage_log_id: Uuid) {
        self.sink.emit(&AuditEvent::BillingLogOnlyResult {
            request_id: request_id.to_string(),
            user_id,
            usage_log_id,
        });
    }

    pub fn quota_consumption(
        &self,
        request_id: &str,
        api_key_id: i64,
        quota_type: QuotaType,
        value: Decimal,
        error: Option<String>,
    ) {
        self.sink.emit(&AuditEvent::QuotaConsumption {
            request_id: request_id.to_string(),
            api_key_id,
            quota_type,
            value,
            success: error.is_none(),
            error,
        });
    }

    pub fn refund(
        &self,
        record: &BillingRecord,
        usage_log_id: Uuid,
        amount: Decimal,
        reason: &str,
    ) {
        self.sink.emit(&AuditEvent::BillingRefund {
            request_id: record.request_id.clone(),
            user_id: record.user_id,
            usage_log_id,
            amount,
            reason: reason.to_string(),
            stage: record.stage,
        });
    }

    pub fn compensation_result(&self, task: &CompensationTask) {
        self.sink.emit(&AuditEvent::CompensationResult {
            task_id: task.id.clone(),
            task_type: task.task_type.as_str().to_string(),
            user_id: task.user_id,
            status: task.status.as_str().to_string(),
            attempts: task.attempts,
            error: task.error.clone(),
        });
    }

    pub fn consistency_check(&self, result: &ConsistencyCheckResult) {
        self.sink.emit(&AuditEvent::BillingConsistencyCheck {
            check_type: result.check_type.as_str().to_string(),
            total_checked: result.total_checked,
            inconsistent_count: result.inconsistent_count,
            fixed_count: result.fixed_count,
            error_count: result.error_count,
        });
    }
}
