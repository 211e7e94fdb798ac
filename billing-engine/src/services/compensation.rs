//! Compensation: bounded-retry repair of failed charges, refunds and
//! manual balance adjustments.
//!
//! Every task runs at most `max_attempts` times with a fixed pause between
//! attempts. It ends `Processed` on the first success or `Failed` once the
//! attempts are spent, and the failure is returned to the caller. A balance
//! change that could not be recorded or reversed ends the task at once.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use super::audit::BillingAuditLogger;
use super::ledger::BalanceLedger;
use super::manager::BillingManager;
use super::metrics;
use crate::config::CompensationConfig;
use crate::error::BillingError;
use crate::models::{
    BillingRecord, BillingStage, CompensationTask, CompensationTaskType, LedgerEntry, UsageLog,
};
use crate::stores::{BillingStores, CompensationTaskStore, UsageLogStore};

pub struct CompensationService {
    manager: Arc<BillingManager>,
    usage_logs: Arc<dyn UsageLogStore>,
    tasks: Arc<dyn CompensationTaskStore>,
    ledger: Arc<BalanceLedger>,
    audit: BillingAuditLogger,
    config: CompensationConfig,
    currency: String,
}

impl CompensationService {
    pub fn new(
        manager: Arc<BillingManager>,
        stores: &BillingStores,
        ledger: Arc<BalanceLedger>,
        audit: BillingAuditLogger,
        config: CompensationConfig,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            usage_logs: stores.usage_logs.clone(),
            tasks: stores.tasks.clone(),
            ledger,
            audit,
            config,
            currency: currency.into(),
        }
    }

    /// Re-run the charge for a request whose billing did not complete.
    #[instrument(skip(self))]
    pub async fn process_failed_billing(
        &self,
        request_id: &str,
        reason: &str,
    ) -> Result<CompensationTask, BillingError> {
        let usage_log = self.find_usage_log(request_id).await?;

        let mut task = CompensationTask::new(
            CompensationTaskType::RetryBilling,
            request_id,
            usage_log.user_id,
            usage_log.cost,
            reason,
            self.config.max_attempts,
        )
        .with_data("original_request_type", usage_log.kind.as_str())
        .with_data("original_cost", usage_log.cost.to_string())
        .with_data("original_status_code", usage_log.status_code);
        task.request_id = Some(request_id.to_string());
        task.usage_log_id = Some(usage_log.id);

        self.execute(task).await
    }

    /// Return `amount` to the user for a billed request.
    #[instrument(skip(self))]
    pub async fn process_refund(
        &self,
        request_id: &str,
        amount: Decimal,
        reason: &str,
    ) -> Result<CompensationTask, BillingError> {
        let usage_log = self.find_usage_log(request_id).await?;

        if !usage_log.is_billed {
            warn!(request_id, "Refund rejected: request was never billed");
            return Err(BillingError::NotBilled(request_id.to_string()));
        }
        if amount <= Decimal::ZERO {
            return Err(BillingError::InvalidAmount(amount));
        }
        if amount > usage_log.cost {
            warn!(
                request_id,
                amount = %amount,
                original_cost = %usage_log.cost,
                "Refund exceeds original charge"
            );
        }

        let mut task = CompensationTask::new(
            CompensationTaskType::Refund,
            request_id,
            usage_log.user_id,
            amount,
            reason,
            self.config.max_attempts,
        )
        .with_data("original_cost", usage_log.cost.to_string())
        .with_data("refund_amount", amount.to_string());
        task.request_id = Some(request_id.to_string());
        task.usage_log_id = Some(usage_log.id);

        self.execute(task).await
    }

    /// Signed manual balance change. Zero is a successful no-op.
    #[instrument(skip(self))]
    pub async fn process_balance_adjustment(
        &self,
        user_id: i64,
        amount: Decimal,
        reason: &str,
    ) -> Result<CompensationTask, BillingError> {
        let task = CompensationTask::new(
            CompensationTaskType::Adjustment,
            &user_id.to_string(),
            user_id,
            amount,
            reason,
            self.config.max_attempts,
        )
        .with_data("adjustment_amount", amount.to_string())
        .with_data("adjustment_reason", reason);

        self.execute(task).await
    }

    /// Most recent tasks for a user.
    pub async fn task_history(
        &self,
        user_id: i64,
        limit: usize,
    ) -> Result<Vec<CompensationTask>, BillingError> {
        Ok(self.tasks.list_by_user(user_id, limit).await?)
    }

    async fn find_usage_log(&self, request_id: &str) -> Result<UsageLog, BillingError> {
        self.usage_logs
            .get_by_request_id(request_id)
            .await?
            .ok_or_else(|| BillingError::UsageLogNotFound(request_id.to_string()))
    }

    async fn execute(&self, mut task: CompensationTask) -> Result<CompensationTask, BillingError> {
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            user_id = task.user_id,
            amount = %task.amount,
            reason = %task.reason,
            "Executing compensation task"
        );
        self.save(&task).await;

        while task.has_attempts_left() {
            task.begin_attempt();

            match self.run(&task).await {
                Ok(()) => {
                    task.mark_processed();
                    info!(
                        task_id = %task.id,
                        attempts = task.attempts,
                        "Compensation task completed"
                    );
                    self.finish(&task).await;
                    return Ok(task);
                }
                Err(e) if e.is_unrecorded_change() => {
                    task.mark_failed(e.to_string());
                    error!(
                        task_id = %task.id,
                        task_type = %task.task_type,
                        attempt = task.attempts,
                        error = %e,
                        "Compensation stopped: unrecorded balance change needs manual review"
                    );
                    self.finish(&task).await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        task_id = %task.id,
                        attempt = task.attempts,
                        error = %e,
                        "Compensation task attempt failed"
                    );
                    task.error = Some(e.to_string());
                    self.save(&task).await;
                }
            }

            if task.has_attempts_left() {
                tokio::time::sleep(self.config.retry_interval()).await;
            }
        }

        let last_error = task.error.clone().unwrap_or_default();
        task.mark_failed(last_error.clone());
        error!(
            task_id = %task.id,
            task_type = %task.task_type,
            max_attempts = task.max_attempts,
            final_error = %last_error,
            "Compensation task failed after all attempts"
        );
        self.finish(&task).await;

        Err(BillingError::CompensationExhausted {
            task_id: task.id,
            attempts: task.attempts,
            last_error,
        })
    }

    async fn run(&self, task: &CompensationTask) -> Result<(), BillingError> {
        match task.task_type {
            CompensationTaskType::RetryBilling => {
                let request_id = task.request_id.as_deref().unwrap_or_default();
                self.manager.process_async_completion(request_id, true).await
            }
            CompensationTaskType::Refund => self.refund(task).await,
            CompensationTaskType::Adjustment => self.adjust(task).await,
        }
    }

    async fn refund(&self, task: &CompensationTask) -> Result<(), BillingError> {
        let request_id = task.request_id.as_deref().unwrap_or_default();
        let usage_log = self.find_usage_log(request_id).await?;

        let entry = LedgerEntry::refund(
            task.user_id,
            usage_log.id,
            request_id,
            task.amount,
            &self.currency,
            &task.reason,
        );
        self.ledger.post(entry).await?;

        let mut record = BillingRecord::from_usage_log(&usage_log, true);
        record.advance(BillingStage::Refunded)?;
        self.audit.refund(&record, usage_log.id, task.amount, &task.reason);
        Ok(())
    }

    async fn adjust(&self, task: &CompensationTask) -> Result<(), BillingError> {
        if task.amount.is_zero() {
            return Ok(());
        }
        let entry =
            LedgerEntry::adjustment(task.user_id, task.amount, &self.currency, &task.reason);
        self.ledger.post(entry).await?;
        Ok(())
    }

    async fn save(&self, task: &CompensationTask) {
        if let Err(e) = self.tasks.save(task).await {
            warn!(task_id = %task.id, error = %e, "Failed to persist compensation task");
        }
    }

    async fn finish(&self, task: &CompensationTask) {
        self.save(task).await;
        self.audit.compensation_result(task);
        metrics::record_compensation_task(task.task_type.as_str(), task.status.as_str());
    }
}
