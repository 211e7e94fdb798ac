//! Domain models for the billing engine.

pub mod compensation;
pub mod consistency;
pub mod ledger;
pub mod pricing;
pub mod quota;
pub mod record;
pub mod usage_log;
pub mod user;

pub use compensation::{CompensationStatus, CompensationTask, CompensationTaskType};
pub use consistency::{CheckType, ConsistencyCheckResult, ConsistencyIssue, IssueType};
pub use ledger::{LedgerEntry, LedgerEntryStatus, LedgerEntryType};
pub use pricing::{ModelPricing, PricingKind, PricingUnit};
pub use quota::{QuotaCheck, QuotaType};
pub use record::{
    BillingRecord, BillingResult, BillingStage, PreCheckReason, PreCheckResult, RequestKind,
};
pub use usage_log::UsageLog;
pub use user::UserAccount;
