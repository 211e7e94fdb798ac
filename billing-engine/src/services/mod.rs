//! Services module for the billing engine.

pub mod audit;
pub mod compensation;
pub mod consistency;
pub mod dispatcher;
pub mod ledger;
pub mod locks;
pub mod manager;
pub mod metrics;
pub mod pricing;
pub mod scheduler;

pub use audit::{
    AuditEvent, AuditLevel, AuditSink, BillingAuditLogger, MemoryAuditSink, TracingAuditSink,
};
pub use compensation::CompensationService;
pub use consistency::ConsistencyChecker;
pub use dispatcher::{ChargeDispatcher, ChargeJob};
pub use ledger::{BalanceLedger, PostedEntry};
pub use locks::KeyedLocks;
pub use manager::BillingManager;
pub use metrics::{get_metrics, init_metrics};
pub use pricing::{compute_cost, CostQuote, PricingEngine};
pub use scheduler::ReconciliationScheduler;
