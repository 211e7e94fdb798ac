//! Results produced by the reconciliation sweeps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    UnbilledUsageLogs,
    BillingRecordConsistency,
    UserBalanceConsistency,
}

impl CheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnbilledUsageLogs => "unbilled_usage_logs",
            Self::BillingRecordConsistency => "billing_record_consistency",
            Self::UserBalanceConsistency => "user_balance_consistency",
        }
    }
}

impl std::fmt::Display for CheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    UnbilledSuccessfulRequest,
    LedgerEntryWithoutBilledFlag,
    BilledWithoutLedgerEntry,
    UnrecordedCharge,
    BalanceMismatch,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnbilledSuccessfulRequest => "unbilled_successful_request",
            Self::LedgerEntryWithoutBilledFlag => "ledger_entry_without_billed_flag",
            Self::BilledWithoutLedgerEntry => "billed_without_ledger_entry",
            Self::UnrecordedCharge => "unrecorded_charge",
            Self::BalanceMismatch => "balance_mismatch",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyIssue {
    pub issue_type: IssueType,
    pub request_id: Option<String>,
    pub usage_log_id: Option<Uuid>,
    pub user_id: Option<i64>,
    pub description: String,
    pub data: HashMap<String, serde_json::Value>,
    pub fixed: bool,
    pub fix_error: Option<String>,
}

impl ConsistencyIssue {
    pub fn new(issue_type: IssueType, description: impl Into<String>) -> Self {
        Self {
            issue_type,
            request_id: None,
            usage_log_id: None,
            user_id: None,
            description: description.into(),
            data: HashMap::new(),
            fixed: false,
            fix_error: None,
        }
    }

    pub fn with_data(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyCheckResult {
    pub check_type: CheckType,
    pub total_checked: usize,
    pub inconsistent_count: usize,
    pub fixed_count: usize,
    pub error_count: usize,
    pub issues: Vec<ConsistencyIssue>,
    pub summary: HashMap<String, serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
}

impl ConsistencyCheckResult {
    pub fn start(check_type: CheckType) -> Self {
        Self {
            check_type,
            total_checked: 0,
            inconsistent_count: 0,
            fixed_count: 0,
            error_count: 0,
            issues: Vec::new(),
            summary: HashMap::new(),
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: 0,
        }
    }

    pub fn record_issue(&mut self, issue: ConsistencyIssue) {
        self.inconsistent_count += 1;
        if issue.fixed {
            self.fixed_count += 1;
        }
        if issue.fix_error.is_some() {
            self.error_count += 1;
        }
        self.issues.push(issue);
    }

    pub fn is_consistent(&self) -> bool {
        self.inconsistent_count == 0
    }

    pub fn finish(mut self) -> Self {
        let now = Utc::now();
        self.duration_ms = (now - self.started_at).num_milliseconds();
        self.completed_at = Some(now);
        self.summary
            .insert("total_checked".into(), self.total_checked.into());
        self.summary
            .insert("inconsistent_count".into(), self.inconsistent_count.into());
        self.summary
            .insert("fixed_count".into(), self.fixed_count.into());
        self.summary
            .insert("error_count".into(), self.error_count.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issues_update_counters_and_summary() {
        let mut result = ConsistencyCheckResult::start(CheckType::UnbilledUsageLogs);
        result.total_checked = 3;

        let mut fixed = ConsistencyIssue::new(IssueType::UnbilledSuccessfulRequest, "a");
        fixed.fixed = true;
        let mut broken = ConsistencyIssue::new(IssueType::UnbilledSuccessfulRequest, "b");
        broken.fix_error = Some("ledger unavailable".into());
        result.record_issue(fixed);
        result.record_issue(broken);
        result.record_issue(ConsistencyIssue::new(IssueType::BalanceMismatch, "c"));

        let result = result.finish();
        assert!(!result.is_consistent());
        assert_eq!(result.inconsistent_count, 3);
        assert_eq!(result.fixed_count, 1);
        assert_eq!(result.error_count, 1);
        assert!(result.completed_at.is_some());
        assert_eq!(result.summary["total_checked"], serde_json::json!(3));
    }

    #[test]
    fn check_type_names() {
        assert_eq!(CheckType::UnbilledUsageLogs.as_str(), "unbilled_usage_logs");
        assert_eq!(
            CheckType::BillingRecordConsistency.as_str(),
            "billing_record_consistency"
        );
        assert_eq!(
            CheckType::UserBalanceConsistency.as_str(),
            "user_balance_consistency"
        );
    }
}
