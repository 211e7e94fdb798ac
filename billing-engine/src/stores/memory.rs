//! In-process store implementations backed by `DashMap`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{
    CompensationTaskStore, CreditLedger, LedgerStore, PricingStore, QuotaService, UsageLogStore,
    UserStore,
};
use crate::error::StoreError;
use crate::models::{
    CompensationTask, LedgerEntry, ModelPricing, QuotaCheck, QuotaType, UsageLog, UserAccount,
};

#[derive(Debug, Clone, Default)]
struct QuotaState {
    limit: Option<Decimal>,
    used: Decimal,
}

/// Every collaborator store in one struct. Share it behind an `Arc` and
/// hand out trait objects.
#[derive(Debug, Default)]
pub struct InMemoryStores {
    usage_logs: DashMap<Uuid, UsageLog>,
    request_index: DashMap<String, Uuid>,
    users: DashMap<i64, UserAccount>,
    ledger: DashMap<Uuid, LedgerEntry>,
    pricing: DashMap<i64, Vec<ModelPricing>>,
    quotas: DashMap<(i64, QuotaType), QuotaState>,
    credits: DashMap<i64, Decimal>,
    tasks: DashMap<String, CompensationTask>,
}

impl InMemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a user and record the opening balance as a credit so the
    /// balance check starts out consistent.
    pub fn seed_user(&self, user_id: i64, balance: Decimal) {
        self.users.insert(user_id, UserAccount::new(user_id, balance));
        self.credits.insert(user_id, balance);
    }

    pub fn put_user(&self, user: UserAccount) {
        self.users.insert(user.id, user);
    }

    pub fn add_credits(&self, user_id: i64, amount: Decimal) {
        *self.credits.entry(user_id).or_default() += amount;
    }

    pub fn add_pricing(&self, pricing: ModelPricing) {
        self.pricing.entry(pricing.model_id).or_default().push(pricing);
    }

    pub fn set_quota_limit(&self, api_key_id: i64, quota_type: QuotaType, limit: Decimal) {
        self.quotas.entry((api_key_id, quota_type)).or_default().limit = Some(limit);
    }

    pub fn quota_used(&self, api_key_id: i64, quota_type: QuotaType) -> Decimal {
        self.quotas
            .get(&(api_key_id, quota_type))
            .map(|q| q.used)
            .unwrap_or_default()
    }

    pub fn balance(&self, user_id: i64) -> Option<Decimal> {
        self.users.get(&user_id).map(|u| u.balance)
    }

    pub fn ledger_entries(&self) -> Vec<LedgerEntry> {
        let mut entries: Vec<_> = self.ledger.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.created_at);
        entries
    }

    pub fn usage_logs(&self) -> Vec<UsageLog> {
        let mut logs: Vec<_> = self.usage_logs.iter().map(|l| l.value().clone()).collect();
        logs.sort_by_key(|l| l.created_at);
        logs
    }

    /// Overwrite a stored log directly, bypassing engine invariants.
    pub fn replace_usage_log(&self, log: UsageLog) {
        self.request_index.insert(log.request_id.clone(), log.id);
        self.usage_logs.insert(log.id, log);
    }

    pub fn insert_ledger_entry(&self, entry: LedgerEntry) {
        self.ledger.insert(entry.id, entry);
    }
}

#[async_trait]
impl UsageLogStore for InMemoryStores {
    async fn create(&self, log: &UsageLog) -> Result<(), StoreError> {
        if self.request_index.contains_key(&log.request_id) {
            return Err(StoreError::conflict("usage_log", &log.request_id));
        }
        self.request_index.insert(log.request_id.clone(), log.id);
        self.usage_logs.insert(log.id, log.clone());
        Ok(())
    }

    async fn update(&self, log: &UsageLog) -> Result<(), StoreError> {
        match self.usage_logs.get_mut(&log.id) {
            Some(mut existing) => {
                *existing = log.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("usage_log", log.id)),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<UsageLog>, StoreError> {
        Ok(self.usage_logs.get(&id).map(|l| l.value().clone()))
    }

    async fn get_by_request_id(&self, request_id: &str) -> Result<Option<UsageLog>, StoreError> {
        let id = match self.request_index.get(request_id) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(self.usage_logs.get(&id).map(|l| l.value().clone()))
    }

    async fn find_unbilled_successful(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageLog>, StoreError> {
        let mut logs: Vec<_> = self
            .usage_logs
            .iter()
            .filter(|l| {
                l.created_at >= since
                    && l.is_successful()
                    && !l.is_billed
                    && !l.needs_manual_review()
                    && l.completed_at.is_some()
            })
            .map(|l| l.value().clone())
            .collect();
        logs.sort_by_key(|l| l.created_at);
        Ok(logs)
    }

    async fn find_billed_since(&self, since: DateTime<Utc>) -> Result<Vec<UsageLog>, StoreError> {
        let mut logs: Vec<_> = self
            .usage_logs
            .iter()
            .filter(|l| l.created_at >= since && l.is_billed)
            .map(|l| l.value().clone())
            .collect();
        logs.sort_by_key(|l| l.created_at);
        Ok(logs)
    }

    async fn find_unrecorded_charges(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageLog>, StoreError> {
        let mut logs: Vec<_> = self
            .usage_logs
            .iter()
            .filter(|l| l.created_at >= since && l.needs_manual_review())
            .map(|l| l.value().clone())
            .collect();
        logs.sort_by_key(|l| l.created_at);
        Ok(logs)
    }
}

#[async_trait]
impl UserStore for InMemoryStores {
    async fn get(&self, user_id: i64) -> Result<Option<UserAccount>, StoreError> {
        Ok(self.users.get(&user_id).map(|u| u.value().clone()))
    }

    async fn update(&self, user: &UserAccount) -> Result<(), StoreError> {
        match self.users.get_mut(&user.id) {
            Some(mut existing) => {
                *existing = user.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("user", user.id)),
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryStores {
    async fn create(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        if self.ledger.contains_key(&entry.id) {
            return Err(StoreError::conflict("ledger_entry", entry.id));
        }
        self.ledger.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn find_by_usage_log(&self, usage_log_id: Uuid) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self
            .ledger
            .iter()
            .filter(|e| e.usage_log_id == Some(usage_log_id))
            .map(|e| e.value().clone())
            .collect())
    }

    async fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self
            .ledger
            .iter()
            .filter(|e| e.created_at >= since)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn list_by_user(&self, user_id: i64) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self
            .ledger
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.value().clone())
            .collect())
    }
}

#[async_trait]
impl PricingStore for InMemoryStores {
    async fn effective_pricing(
        &self,
        model_id: i64,
        at: DateTime<Utc>,
    ) -> Result<Vec<ModelPricing>, StoreError> {
        Ok(self
            .pricing
            .get(&model_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|p| p.is_effective(at))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl QuotaService for InMemoryStores {
    async fn check_quota(
        &self,
        api_key_id: i64,
        quota_type: QuotaType,
        value: Decimal,
    ) -> Result<QuotaCheck, StoreError> {
        let Some(state) = self.quotas.get(&(api_key_id, quota_type)) else {
            return Ok(QuotaCheck::unlimited());
        };

        Ok(match state.limit {
            Some(limit) => QuotaCheck {
                allowed: state.used + value <= limit,
                limit: Some(limit),
                used: state.used,
                remaining: Some((limit - state.used).max(Decimal::ZERO)),
            },
            None => QuotaCheck {
                used: state.used,
                ..QuotaCheck::unlimited()
            },
        })
    }

    async fn consume_quota(
        &self,
        api_key_id: i64,
        quota_type: QuotaType,
        value: Decimal,
    ) -> Result<(), StoreError> {
        self.quotas.entry((api_key_id, quota_type)).or_default().used += value;
        Ok(())
    }
}

#[async_trait]
impl CreditLedger for InMemoryStores {
    async fn total_credits(&self, user_id: i64) -> Result<Decimal, StoreError> {
        Ok(self.credits.get(&user_id).map(|c| *c).unwrap_or_default())
    }
}

#[async_trait]
impl CompensationTaskStore for InMemoryStores {
    async fn save(&self, task: &CompensationTask) -> Result<(), StoreError> {
        self.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn list_by_user(
        &self,
        user_id: i64,
        limit: usize,
    ) -> Result<Vec<CompensationTask>, StoreError> {
        let mut tasks: Vec<_> = self
            .tasks
            .iter()
            .filter(|t| t.user_id == user_id)
            .map(|t| t.value().clone())
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit);
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PricingKind;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn quota_limits_enforced() {
        let stores = InMemoryStores::new();
        stores.set_quota_limit(7, QuotaType::Requests, dec!(2));

        stores.consume_quota(7, QuotaType::Requests, dec!(2)).await.unwrap();
        let check = stores.check_quota(7, QuotaType::Requests, dec!(1)).await.unwrap();
        assert!(!check.allowed);
        assert_eq!(check.remaining, Some(dec!(0)));

        let other = stores.check_quota(8, QuotaType::Requests, dec!(1)).await.unwrap();
        assert!(other.allowed);
    }

    #[tokio::test]
    async fn pricing_filtered_by_window() {
        let stores = InMemoryStores::new();
        let now = Utc::now();
        stores.add_pricing(
            ModelPricing::new(1, PricingKind::Input, dec!(0.001))
                .with_window(now - Duration::days(2), Some(now - Duration::days(1))),
        );
        stores.add_pricing(ModelPricing::new(1, PricingKind::Output, dec!(0.002)));

        let effective = stores.effective_pricing(1, now).await.unwrap();
        assert_eq!(effective.len(), 1);
        assert_eq!(effective[0].kind, PricingKind::Output);
    }
}
