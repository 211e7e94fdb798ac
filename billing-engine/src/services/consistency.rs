//! Reconciliation sweeps over usage logs, ledger entries and balances.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use super::audit::BillingAuditLogger;
use super::compensation::CompensationService;
use super::metrics;
use crate::config::ConsistencyConfig;
use crate::error::BillingError;
use crate::models::{
    CheckType, ConsistencyCheckResult, ConsistencyIssue, IssueType, LedgerEntryType, UsageLog,
};
use crate::stores::{BillingStores, CreditLedger, LedgerStore, UsageLogStore, UserStore};

const RECONCILIATION_REASON: &str = "unbilled successful request found by reconciliation";

pub struct ConsistencyChecker {
    usage_logs: Arc<dyn UsageLogStore>,
    users: Arc<dyn UserStore>,
    ledger: Arc<dyn LedgerStore>,
    credits: Arc<dyn CreditLedger>,
    compensation: Arc<CompensationService>,
    audit: BillingAuditLogger,
    config: ConsistencyConfig,
}

impl ConsistencyChecker {
    pub fn new(
        stores: &BillingStores,
        compensation: Arc<CompensationService>,
        audit: BillingAuditLogger,
        config: ConsistencyConfig,
    ) -> Self {
        Self {
            usage_logs: stores.usage_logs.clone(),
            users: stores.users.clone(),
            ledger: stores.ledger.clone(),
            credits: stores.credits.clone(),
            compensation,
            audit,
            config,
        }
    }

    pub fn config(&self) -> &ConsistencyConfig {
        &self.config
    }

    /// Successful, completed requests that never got billed. With
    /// `auto_fix`, each one goes through the retry-billing compensation.
    #[instrument(skip(self))]
    pub async fn check_unbilled_usage_logs(
        &self,
        look_back: chrono::Duration,
        auto_fix: bool,
    ) -> Result<ConsistencyCheckResult, BillingError> {
        let mut result = ConsistencyCheckResult::start(CheckType::UnbilledUsageLogs);
        let since = Utc::now() - look_back;

        let unbilled = self.usage_logs.find_unbilled_successful(since).await?;
        result.total_checked = unbilled.len();

        for log in unbilled {
            let mut issue = ConsistencyIssue::new(
                IssueType::UnbilledSuccessfulRequest,
                format!("Successful request not billed: {}", log.request_id),
            )
            .with_data("status_code", log.status_code)
            .with_data("cost", log.cost.to_string())
            .with_data("created_at", log.created_at.to_rfc3339())
            .with_data("request_kind", log.kind.as_str());
            issue.request_id = Some(log.request_id.clone());
            issue.usage_log_id = Some(log.id);
            issue.user_id = Some(log.user_id);

            if auto_fix {
                match self
                    .compensation
                    .process_failed_billing(&log.request_id, RECONCILIATION_REASON)
                    .await
                {
                    Ok(_) => issue.fixed = true,
                    Err(e) => issue.fix_error = Some(e.to_string()),
                }
            }

            result.record_issue(issue);
        }

        result
            .summary
            .insert("unbilled_logs_found".into(), result.inconsistent_count.into());
        result
            .summary
            .insert("auto_fix_enabled".into(), auto_fix.into());
        Ok(self.complete(result))
    }

    /// Usage logs and ledger entries that disagree about whether a request
    /// was billed. A ledger entry without the flag is repaired by setting the
    /// flag. A flagged log with no ledger entry, or a log holding an
    /// unrecorded charge, is reported for review.
    #[instrument(skip(self))]
    pub async fn check_ledger_consistency(
        &self,
        look_back: chrono::Duration,
        auto_fix: bool,
    ) -> Result<ConsistencyCheckResult, BillingError> {
        let mut result = ConsistencyCheckResult::start(CheckType::BillingRecordConsistency);
        let since = Utc::now() - look_back;

        let usage_entries: Vec<_> = self
            .ledger
            .list_since(since)
            .await?
            .into_iter()
            .filter(|e| e.entry_type == LedgerEntryType::Usage)
            .collect();
        let billed_logs = self.usage_logs.find_billed_since(since).await?;
        let unrecorded = self.usage_logs.find_unrecorded_charges(since).await?;
        result.total_checked = usage_entries.len() + billed_logs.len() + unrecorded.len();

        for entry in &usage_entries {
            let Some(usage_log_id) = entry.usage_log_id else {
                continue;
            };
            let Some(log) = self.usage_logs.get(usage_log_id).await? else {
                warn!(
                    entry_id = %entry.id,
                    %usage_log_id,
                    "Ledger entry references missing usage log"
                );
                continue;
            };
            if log.is_billed {
                continue;
            }

            let mut issue = ConsistencyIssue::new(
                IssueType::LedgerEntryWithoutBilledFlag,
                format!(
                    "Ledger entry {} exists but usage log for {} is not marked billed",
                    entry.id, log.request_id
                ),
            )
            .with_data("ledger_entry_id", entry.id.to_string())
            .with_data("amount", entry.amount.to_string());
            issue.request_id = Some(log.request_id.clone());
            issue.usage_log_id = Some(log.id);
            issue.user_id = Some(log.user_id);

            if auto_fix {
                match self.mark_billed(log).await {
                    Ok(()) => issue.fixed = true,
                    Err(e) => issue.fix_error = Some(e.to_string()),
                }
            }

            result.record_issue(issue);
        }

        let mut manual_review = 0usize;
        for log in billed_logs.iter().filter(|l| l.cost > Decimal::ZERO) {
            let has_entry = self
                .ledger
                .find_by_usage_log(log.id)
                .await?
                .iter()
                .any(|e| e.entry_type == LedgerEntryType::Usage);
            if has_entry {
                continue;
            }

            let mut issue = ConsistencyIssue::new(
                IssueType::BilledWithoutLedgerEntry,
                format!(
                    "Usage log for {} is marked billed but has no ledger entry",
                    log.request_id
                ),
            )
            .with_data("cost", log.cost.to_string());
            issue.request_id = Some(log.request_id.clone());
            issue.usage_log_id = Some(log.id);
            issue.user_id = Some(log.user_id);
            manual_review += 1;

            result.record_issue(issue);
        }

        for log in &unrecorded {
            let amount = log.unrecorded_charge.unwrap_or_default();
            let mut issue = ConsistencyIssue::new(
                IssueType::UnrecordedCharge,
                format!(
                    "Balance charged {} for {} with no ledger entry after a failed rollback",
                    amount, log.request_id
                ),
            )
            .with_data("amount", amount.to_string());
            issue.request_id = Some(log.request_id.clone());
            issue.usage_log_id = Some(log.id);
            issue.user_id = Some(log.user_id);
            manual_review += 1;

            result.record_issue(issue);
        }

        result.summary.insert(
            "inconsistent_records_found".into(),
            result.inconsistent_count.into(),
        );
        result
            .summary
            .insert("manual_review_required".into(), manual_review.into());
        Ok(self.complete(result))
    }

    /// Stored balance against credits plus the signed sum of the user's
    /// ledger. Report only.
    #[instrument(skip(self))]
    pub async fn check_user_balance(
        &self,
        user_id: i64,
    ) -> Result<ConsistencyCheckResult, BillingError> {
        let mut result = ConsistencyCheckResult::start(CheckType::UserBalanceConsistency);

        let user = self
            .users
            .get(user_id)
            .await?
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;

        let credits = self.credits.total_credits(user_id).await?;
        let ledger_effect: Decimal = self
            .ledger
            .list_by_user(user_id)
            .await?
            .iter()
            .map(|e| e.balance_effect())
            .sum();
        let expected = credits + ledger_effect;
        let difference = user.balance - expected;
        result.total_checked = 1;

        if difference.abs() > self.config.balance_tolerance {
            let mut issue = ConsistencyIssue::new(
                IssueType::BalanceMismatch,
                format!(
                    "User balance mismatch: actual={}, expected={}, diff={}",
                    user.balance, expected, difference
                ),
            )
            .with_data("actual_balance", user.balance.to_string())
            .with_data("expected_balance", expected.to_string())
            .with_data("difference", difference.to_string());
            issue.user_id = Some(user_id);
            result.record_issue(issue);
        }

        result
            .summary
            .insert("balance_difference".into(), difference.to_string().into());
        Ok(self.complete(result))
    }

    /// Both sweeps. A sweep that fails is logged and left out of the map.
    pub async fn run_full_check(
        &self,
        look_back: chrono::Duration,
        auto_fix: bool,
    ) -> HashMap<CheckType, ConsistencyCheckResult> {
        let mut results = HashMap::new();

        match self.check_unbilled_usage_logs(look_back, auto_fix).await {
            Ok(result) => {
                results.insert(CheckType::UnbilledUsageLogs, result);
            }
            Err(e) => error!(
                check_type = CheckType::UnbilledUsageLogs.as_str(),
                error = %e,
                "Consistency check failed"
            ),
        }

        match self.check_ledger_consistency(look_back, auto_fix).await {
            Ok(result) => {
                results.insert(CheckType::BillingRecordConsistency, result);
            }
            Err(e) => error!(
                check_type = CheckType::BillingRecordConsistency.as_str(),
                error = %e,
                "Consistency check failed"
            ),
        }

        results
    }

    /// Full check with the configured window and fix mode.
    pub async fn run_configured(&self) -> HashMap<CheckType, ConsistencyCheckResult> {
        self.run_full_check(self.config.look_back(), self.config.auto_fix)
            .await
    }

    async fn mark_billed(&self, mut log: UsageLog) -> Result<(), BillingError> {
        log.is_billed = true;
        if log.completed_at.is_none() {
            log.completed_at = Some(Utc::now());
        }
        self.usage_logs.update(&log).await?;
        Ok(())
    }

    fn complete(&self, result: ConsistencyCheckResult) -> ConsistencyCheckResult {
        let result = result.finish();
        info!(
            check_type = result.check_type.as_str(),
            total_checked = result.total_checked,
            inconsistent = result.inconsistent_count,
            fixed = result.fixed_count,
            errors = result.error_count,
            duration_ms = result.duration_ms,
            "Consistency check completed"
        );
        metrics::record_consistency_issues(result.check_type.as_str(), result.inconsistent_count);
        self.audit.consistency_check(&result);
        result
    }
}
