//! Collaborator interfaces consumed by the engine.
//!
//! Implementations live outside the engine (SQL, cache, remote services);
//! `memory` provides in-process implementations with the same semantics.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    CompensationTask, LedgerEntry, ModelPricing, QuotaCheck, QuotaType, UsageLog, UserAccount,
};

pub use memory::InMemoryStores;

#[async_trait]
pub trait UsageLogStore: Send + Sync {
    async fn create(&self, log: &UsageLog) -> Result<(), StoreError>;

    async fn update(&self, log: &UsageLog) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<UsageLog>, StoreError>;

    async fn get_by_request_id(&self, request_id: &str) -> Result<Option<UsageLog>, StoreError>;

    /// Successful, completed, not yet billed logs created at or after `since`.
    /// Logs holding an unrecorded charge are excluded.
    async fn find_unbilled_successful(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageLog>, StoreError>;

    async fn find_billed_since(&self, since: DateTime<Utc>) -> Result<Vec<UsageLog>, StoreError>;

    async fn find_unrecorded_charges(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageLog>, StoreError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get(&self, user_id: i64) -> Result<Option<UserAccount>, StoreError>;

    async fn update(&self, user: &UserAccount) -> Result<(), StoreError>;
}

/// Append-only ledger of charges, refunds and adjustments.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn create(&self, entry: &LedgerEntry) -> Result<(), StoreError>;

    async fn find_by_usage_log(&self, usage_log_id: Uuid) -> Result<Vec<LedgerEntry>, StoreError>;

    async fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<LedgerEntry>, StoreError>;

    async fn list_by_user(&self, user_id: i64) -> Result<Vec<LedgerEntry>, StoreError>;
}

#[async_trait]
pub trait PricingStore: Send + Sync {
    /// Entries for the model whose window contains `at`.
    async fn effective_pricing(
        &self,
        model_id: i64,
        at: DateTime<Utc>,
    ) -> Result<Vec<ModelPricing>, StoreError>;
}

#[async_trait]
pub trait QuotaService: Send + Sync {
    async fn check_quota(
        &self,
        api_key_id: i64,
        quota_type: QuotaType,
        value: Decimal,
    ) -> Result<QuotaCheck, StoreError>;

    async fn consume_quota(
        &self,
        api_key_id: i64,
        quota_type: QuotaType,
        value: Decimal,
    ) -> Result<(), StoreError>;
}

/// Money put into accounts by the payment subsystem (recharges, gifts).
#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn total_credits(&self, user_id: i64) -> Result<Decimal, StoreError>;
}

#[async_trait]
pub trait CompensationTaskStore: Send + Sync {
    /// Insert or replace by task id.
    async fn save(&self, task: &CompensationTask) -> Result<(), StoreError>;

    /// Most recent first.
    async fn list_by_user(
        &self,
        user_id: i64,
        limit: usize,
    ) -> Result<Vec<CompensationTask>, StoreError>;
}

/// The full set of collaborators the engine is wired with.
#[derive(Clone)]
pub struct BillingStores {
    pub usage_logs: Arc<dyn UsageLogStore>,
    pub users: Arc<dyn UserStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub pricing: Arc<dyn PricingStore>,
    pub quotas: Arc<dyn QuotaService>,
    pub credits: Arc<dyn CreditLedger>,
    pub tasks: Arc<dyn CompensationTaskStore>,
}

impl BillingStores {
    /// Wire every collaborator to one in-memory store.
    pub fn in_memory(stores: Arc<InMemoryStores>) -> Self {
        Self {
            usage_logs: stores.clone(),
            users: stores.clone(),
            ledger: stores.clone(),
            pricing: stores.clone(),
            quotas: stores.clone(),
            credits: stores.clone(),
            tasks: stores,
        }
    }
}
