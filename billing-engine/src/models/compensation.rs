//! Compensation tasks: bounded-retry remediation units.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationTaskType {
    RetryBilling,
    Refund,
    Adjustment,
}

impl CompensationTaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetryBilling => "retry_billing",
            Self::Refund => "refund",
            Self::Adjustment => "adjustment",
        }
    }
}

impl std::fmt::Display for CompensationTaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompensationStatus {
    Pending,
    Processed,
    Failed,
}

impl CompensationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationTask {
    pub id: String,
    pub task_type: CompensationTaskType,
    pub request_id: Option<String>,
    pub usage_log_id: Option<Uuid>,
    pub user_id: i64,
    pub amount: Decimal,
    pub reason: String,
    pub status: CompensationStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub data: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl CompensationTask {
    /// Task ids read `<type>_<subject>_<unix seconds>`, with a short random
    /// suffix so two tasks for one subject in the same second stay distinct.
    pub fn new(
        task_type: CompensationTaskType,
        subject: &str,
        user_id: i64,
        amount: Decimal,
        reason: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        let prefix = match task_type {
            CompensationTaskType::RetryBilling => "retry",
            CompensationTaskType::Refund => "refund",
            CompensationTaskType::Adjustment => "adjustment",
        };
        let suffix = Uuid::new_v4().simple().to_string();

        Self {
            id: format!("{}_{}_{}_{}", prefix, subject, now.timestamp(), &suffix[..8]),
            task_type,
            request_id: None,
            usage_log_id: None,
            user_id,
            amount,
            reason: reason.into(),
            status: CompensationStatus::Pending,
            attempts: 0,
            max_attempts,
            data: HashMap::new(),
            created_at: now,
            updated_at: now,
            processed_at: None,
            error: None,
        }
    }

    pub fn with_data(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
        self.updated_at = Utc::now();
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn mark_processed(&mut self) {
        let now = Utc::now();
        self.status = CompensationStatus::Processed;
        self.error = None;
        self.processed_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = CompensationStatus::Failed;
        self.error = Some(error.into());
        self.updated_at = Utc::now();
    }
}
