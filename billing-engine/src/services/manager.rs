//! Billing manager: pre-authorization, charging and async completion.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::audit::BillingAuditLogger;
use super::ledger::BalanceLedger;
use super::locks::KeyedLocks;
use super::metrics;
use super::pricing::PricingEngine;
use crate::error::BillingError;
use crate::models::{
    BillingRecord, BillingResult, BillingStage, LedgerEntry, LedgerEntryType, PreCheckReason,
    PreCheckResult, QuotaType, UsageLog,
};
use crate::stores::{BillingStores, QuotaService, UsageLogStore, UserStore};

pub struct BillingManager {
    usage_logs: Arc<dyn UsageLogStore>,
    users: Arc<dyn UserStore>,
    quotas: Arc<dyn QuotaService>,
    pricing: PricingEngine,
    ledger: Arc<BalanceLedger>,
    audit: BillingAuditLogger,
    request_locks: KeyedLocks<String>,
}

impl BillingManager {
    pub fn new(
        stores: &BillingStores,
        pricing: PricingEngine,
        ledger: Arc<BalanceLedger>,
        audit: BillingAuditLogger,
    ) -> Self {
        Self {
            usage_logs: stores.usage_logs.clone(),
            users: stores.users.clone(),
            quotas: stores.quotas.clone(),
            pricing,
            ledger,
            audit,
            request_locks: KeyedLocks::new(),
        }
    }

    /// Balance and quota authorization before the request runs.
    ///
    /// Denials come back as a result with `can_proceed == false`; only
    /// infrastructure failures are errors. Quota lookups fail open.
    #[instrument(
        skip(self, record),
        fields(request_id = %record.request_id, user_id = record.user_id)
    )]
    pub async fn pre_check(
        &self,
        record: &mut BillingRecord,
    ) -> Result<PreCheckResult, BillingError> {
        self.audit.precheck_start(record);

        let estimated_cost = match self
            .pricing
            .cost(
                record.model_id,
                record.calculate_input_tokens(),
                record.calculate_output_tokens(),
                record.kind,
            )
            .await
        {
            Ok(cost) => cost,
            Err(e) => {
                self.audit.precheck_error(record, "cost_estimation_failed", &e);
                metrics::record_precheck("error");
                return Err(e);
            }
        };
        record.estimated_cost = estimated_cost;

        let user = match self.users.get(record.user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                let e = BillingError::UserNotFound(record.user_id.to_string());
                self.audit.precheck_error(record, "balance_check_failed", &e);
                metrics::record_precheck("error");
                return Err(e);
            }
            Err(e) => {
                self.audit.precheck_error(record, "balance_check_failed", &e);
                metrics::record_precheck("error");
                return Err(e.into());
            }
        };

        let mut details = HashMap::new();
        let balance_ok = user.balance >= estimated_cost;
        details.insert("balance_check".to_string(), balance_ok.into());

        if !balance_ok {
            let mut result =
                PreCheckResult::denied(PreCheckReason::InsufficientBalance, estimated_cost);
            result.details = details;
            info!(
                balance = %user.balance,
                estimated_cost = %estimated_cost,
                "Pre-check denied: insufficient balance"
            );
            self.audit.precheck_result(record, &result);
            metrics::record_precheck(PreCheckReason::InsufficientBalance.as_str());
            return Ok(result);
        }

        let mut denial = None;
        for quota_type in QuotaType::ALL {
            let value = record.quota_value(quota_type, estimated_cost);
            if value <= Decimal::ZERO {
                continue;
            }

            match self
                .quotas
                .check_quota(record.api_key_id, quota_type, value)
                .await
            {
                Ok(check) => {
                    let allowed = check.allowed;
                    details.insert(
                        format!("quota_{}", quota_type),
                        serde_json::to_value(&check).unwrap_or_default(),
                    );
                    if !allowed {
                        denial = Some(PreCheckReason::quota_exceeded(quota_type));
                        break;
                    }
                }
                Err(e) => {
                    warn!(
                        quota_type = %quota_type,
                        error = %e,
                        "Failed to check quota, allowing request"
                    );
                }
            }
        }

        let quota_ok = denial.is_none();
        let result = PreCheckResult {
            balance_ok,
            quota_ok,
            can_proceed: balance_ok && quota_ok,
            reason: denial,
            estimated_cost,
            details,
        };

        if result.can_proceed && record.stage == BillingStage::PreCheck {
            record.advance(BillingStage::Pending)?;
        }

        self.audit.precheck_result(record, &result);
        metrics::record_precheck(denial.map_or("allowed", |r| r.as_str()));
        Ok(result)
    }

    /// Record the attempt and, when billable, charge it.
    #[instrument(
        skip(self, record),
        fields(request_id = %record.request_id, user_id = record.user_id)
    )]
    pub async fn process_request(
        &self,
        record: &mut BillingRecord,
    ) -> Result<BillingResult, BillingError> {
        let started = Instant::now();
        self.audit.billing_start(record);

        if record.stage == BillingStage::PreCheck {
            record.advance(BillingStage::Pending)?;
        }

        let mut usage_log = record.to_usage_log();
        if let Err(e) = self.usage_logs.create(&usage_log).await {
            self.audit.billing_error(record, "usage_log_creation_failed", &e);
            record.fail(e.to_string());
            metrics::record_charge("process_request", "error");
            return Err(e.into());
        }

        if !record.should_bill() {
            if !record.kind.is_async() {
                record.advance(BillingStage::Processed)?;
            }
            let result = BillingResult::not_charged(usage_log.id);
            debug!(
                status_code = record.status_code,
                stage = %record.stage,
                "No billing required"
            );
            self.audit.billing_result(record, &result, "no_billing_required");
            metrics::record_charge("process_request", "not_billable");
            return Ok(result);
        }

        let cost = if record.actual_cost > Decimal::ZERO {
            record.actual_cost
        } else {
            match self.price(record).await {
                Ok(cost) => cost,
                Err(e) => {
                    self.audit.billing_error(record, "cost_calculation_failed", &e);
                    record.fail(e.to_string());
                    metrics::record_charge("process_request", "error");
                    return Err(e);
                }
            }
        };
        record.actual_cost = cost;
        usage_log.cost = cost;

        let ledger_entry_id = match self.settle(record, &mut usage_log).await {
            Ok(id) => id,
            Err(e) => {
                self.audit.billing_error(record, "billing_processing_failed", &e);
                if usage_log.needs_manual_review() {
                    self.persist_log(&usage_log).await;
                }
                record.fail(e.to_string());
                metrics::record_charge("process_request", "error");
                return Err(e);
            }
        };

        if let Err(e) = self.usage_logs.update(&usage_log).await {
            error!(
                usage_log_id = %usage_log.id,
                error = %e,
                "Failed to update usage log billing status"
            );
        }

        record.advance(BillingStage::Processed)?;

        let result = BillingResult {
            success: true,
            amount: cost,
            usage_log_id: Some(usage_log.id),
            ledger_entry_id,
            error: None,
        };
        self.audit.billing_result(record, &result, "billing_completed");
        metrics::record_charge("process_request", "charged");
        metrics::observe_charge_duration("process_request", started.elapsed().as_secs_f64());
        Ok(result)
    }

    /// Charge an async job once its completion is known.
    ///
    /// Serialized per request id, so concurrent completions for the same
    /// job charge at most once.
    #[instrument(skip(self))]
    pub async fn process_async_completion(
        &self,
        request_id: &str,
        success: bool,
    ) -> Result<(), BillingError> {
        let started = Instant::now();
        let _lease = self.request_locks.lock(request_id.to_string()).await;

        let mut usage_log = self
            .usage_logs
            .get_by_request_id(request_id)
            .await?
            .ok_or_else(|| BillingError::UsageLogNotFound(request_id.to_string()))?;

        if usage_log.is_billed {
            debug!(usage_log_id = %usage_log.id, "Usage log already billed, skipping");
            return Ok(());
        }

        if let Some(amount) = usage_log.unrecorded_charge {
            warn!(
                usage_log_id = %usage_log.id,
                amount = %amount,
                "Unrecorded charge pending manual review, not charging again"
            );
            return Err(BillingError::ManualReviewRequired(request_id.to_string()));
        }

        if self.has_usage_entry(usage_log.id).await? {
            warn!(
                usage_log_id = %usage_log.id,
                "Usage already posted to ledger but log not flagged, repairing flag"
            );
            usage_log.is_billed = true;
            if usage_log.completed_at.is_none() {
                usage_log.completed_at = Some(Utc::now());
            }
            self.usage_logs.update(&usage_log).await?;
            return Ok(());
        }

        let mut record = BillingRecord::from_usage_log(&usage_log, success);
        self.audit.async_completion_start(&record, success);

        usage_log.status_code = record.status_code;
        usage_log.completed_at = Some(Utc::now());
        if !success {
            usage_log.error_message = record.error_message.clone();
        }

        if !(success && record.should_bill()) {
            usage_log.cost = Decimal::ZERO;
            self.audit.async_completion_result(&record, Decimal::ZERO, "no_billing_required");
            self.usage_logs.update(&usage_log).await?;
            metrics::record_charge("async_completion", "not_billable");
            return Ok(());
        }

        let cost = match self.price(&record).await {
            Ok(cost) => cost,
            Err(e) => {
                self.audit.billing_error(&record, "async_cost_calculation_failed", &e);
                self.persist_log(&usage_log).await;
                metrics::record_charge("async_completion", "error");
                return Err(e);
            }
        };
        record.actual_cost = cost;
        usage_log.cost = cost;

        if let Err(e) = self.settle(&mut record, &mut usage_log).await {
            self.audit.billing_error(&record, "async_billing_failed", &e);
            self.persist_log(&usage_log).await;
            metrics::record_charge("async_completion", "error");
            return Err(e);
        }

        self.audit.async_completion_result(&record, cost, "billing_completed");

        if let Err(e) = self.usage_logs.update(&usage_log).await {
            error!(
                usage_log_id = %usage_log.id,
                error = %e,
                "Failed to update usage log after async charge"
            );
        }

        metrics::record_charge("async_completion", "charged");
        metrics::observe_charge_duration("async_completion", started.elapsed().as_secs_f64());
        Ok(())
    }

    /// Persist a usage log for a caller that is never charged.
    #[instrument(skip(self, usage_log), fields(request_id = %usage_log.request_id))]
    pub async fn create_usage_log_only(
        &self,
        mut usage_log: UsageLog,
    ) -> Result<UsageLog, BillingError> {
        self.audit.log_only_start(&usage_log.request_id, usage_log.user_id, &usage_log.endpoint);

        usage_log.cost = Decimal::ZERO;
        usage_log.is_billed = true;
        if usage_log.completed_at.is_none() {
            usage_log.completed_at = Some(Utc::now());
        }

        if let Err(e) = self.usage_logs.create(&usage_log).await {
            let mut record = BillingRecord::new(
                usage_log.request_id.clone(),
                usage_log.user_id,
                usage_log.api_key_id,
                usage_log.model_id,
            );
            record.stage = BillingStage::LogOnly;
            self.audit.billing_error(&record, "usage_log_creation_failed", &e);
            metrics::record_charge("log_only", "error");
            return Err(e.into());
        }

        self.audit.log_only_result(&usage_log.request_id, usage_log.user_id, usage_log.id);
        metrics::record_charge("log_only", "logged");
        Ok(usage_log)
    }

    async fn price(&self, record: &BillingRecord) -> Result<Decimal, BillingError> {
        self.pricing
            .cost(
                record.model_id,
                record.calculate_input_tokens(),
                record.calculate_output_tokens(),
                record.kind,
            )
            .await
    }

    async fn has_usage_entry(&self, usage_log_id: Uuid) -> Result<bool, BillingError> {
        Ok(self
            .ledger
            .ledger_store()
            .find_by_usage_log(usage_log_id)
            .await?
            .iter()
            .any(|e| e.entry_type == LedgerEntryType::Usage))
    }

    /// Deduct and record the charge, consume quotas, flag the log as billed.
    /// The caller persists the log.
    async fn settle(
        &self,
        record: &mut BillingRecord,
        usage_log: &mut UsageLog,
    ) -> Result<Option<Uuid>, BillingError> {
        let cost = record.actual_cost;

        let ledger_entry_id = if cost > Decimal::ZERO {
            let entry = LedgerEntry::usage(
                record.user_id,
                usage_log.id,
                &record.request_id,
                cost,
                self.pricing.currency(),
            );
            match self.ledger.post(entry).await {
                Ok(posted) => Some(posted.entry.id),
                Err(e) => {
                    if e.is_unrecorded_change() {
                        usage_log.unrecorded_charge = Some(cost);
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        self.consume_quotas(record, cost).await;

        record.mark_billed();
        usage_log.is_billed = true;
        Ok(ledger_entry_id)
    }

    async fn consume_quotas(&self, record: &BillingRecord, cost: Decimal) {
        for quota_type in QuotaType::ALL {
            let value = record.quota_value(quota_type, cost);
            if value <= Decimal::ZERO {
                continue;
            }

            let outcome = self
                .quotas
                .consume_quota(record.api_key_id, quota_type, value)
                .await;

            let error = match outcome {
                Ok(()) => None,
                Err(e) => {
                    warn!(
                        request_id = %record.request_id,
                        quota_type = %quota_type,
                        error = %e,
                        "Failed to consume quota, charge stands"
                    );
                    metrics::record_quota_consumption_failure(quota_type.as_str());
                    Some(e.to_string())
                }
            };
            self.audit.quota_consumption(
                &record.request_id,
                record.api_key_id,
                quota_type,
                value,
                error,
            );
        }
    }

    async fn persist_log(&self, usage_log: &UsageLog) {
        if let Err(e) = self.usage_logs.update(usage_log).await {
            error!(
                usage_log_id = %usage_log.id,
                error = %e,
                "Failed to persist usage log state"
            );
        }
    }
}
