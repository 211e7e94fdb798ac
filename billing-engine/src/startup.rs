//! Engine assembly and lifecycle.

use std::sync::Arc;

use crate::config::BillingConfig;
use crate::services::{
    init_metrics, AuditSink, BalanceLedger, BillingAuditLogger, BillingManager, ChargeDispatcher,
    CompensationService, ConsistencyChecker, PricingEngine, ReconciliationScheduler,
};
use crate::stores::BillingStores;

/// Every billing service wired to one set of collaborators.
#[derive(Clone)]
pub struct BillingEngine {
    config: BillingConfig,
    ledger: Arc<BalanceLedger>,
    manager: Arc<BillingManager>,
    compensation: Arc<CompensationService>,
    checker: Arc<ConsistencyChecker>,
}

impl BillingEngine {
    pub fn new(config: BillingConfig, stores: BillingStores, sink: Arc<dyn AuditSink>) -> Self {
        init_metrics();

        let audit = BillingAuditLogger::new(sink);
        let pricing = PricingEngine::new(stores.pricing.clone(), config.pricing.clone());
        let currency = pricing.currency().to_string();
        let ledger = Arc::new(BalanceLedger::new(
            stores.users.clone(),
            stores.ledger.clone(),
        ));

        let manager = Arc::new(BillingManager::new(
            &stores,
            pricing,
            ledger.clone(),
            audit.clone(),
        ));
        let compensation = Arc::new(CompensationService::new(
            manager.clone(),
            &stores,
            ledger.clone(),
            audit.clone(),
            config.compensation.clone(),
            currency,
        ));
        let checker = Arc::new(ConsistencyChecker::new(
            &stores,
            compensation.clone(),
            audit,
            config.consistency.clone(),
        ));

        tracing::info!(
            service = %config.service_name,
            currency = %config.pricing.currency,
            max_attempts = config.compensation.max_attempts,
            auto_fix = config.consistency.auto_fix,
            "Billing engine assembled"
        );

        Self {
            config,
            ledger,
            manager,
            compensation,
            checker,
        }
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<BillingManager> {
        &self.manager
    }

    pub fn ledger(&self) -> &Arc<BalanceLedger> {
        &self.ledger
    }

    pub fn compensation(&self) -> &Arc<CompensationService> {
        &self.compensation
    }

    pub fn checker(&self) -> &Arc<ConsistencyChecker> {
        &self.checker
    }

    /// Build the charge dispatcher and spawn its workers.
    pub async fn start_dispatcher(&self) -> ChargeDispatcher {
        let dispatcher =
            ChargeDispatcher::new(self.manager.clone(), self.config.dispatcher.clone());
        dispatcher.start().await;
        dispatcher
    }

    /// Start periodic reconciliation at the configured interval.
    pub fn start_scheduler(&self) -> ReconciliationScheduler {
        ReconciliationScheduler::spawn(self.checker.clone(), self.config.consistency.interval())
    }
}
