//! Common test utilities for billing-engine integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use billing_engine::config::BillingConfig;
use billing_engine::error::StoreError;
use billing_engine::models::{
    BillingRecord, BillingStage, LedgerEntry, ModelPricing, PricingKind, QuotaCheck, QuotaType,
    RequestKind, UserAccount,
};
use billing_engine::services::MemoryAuditSink;
use billing_engine::startup::BillingEngine;
use billing_engine::stores::{
    BillingStores, InMemoryStores, LedgerStore, QuotaService, UserStore,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub const USER_ID: i64 = 1001;
pub const API_KEY_ID: i64 = 2001;
/// Priced per token: 0.001 input, 0.002 output, per 1K, markup 1.5.
pub const CHAT_MODEL: i64 = 1;
/// Priced per request: 0.50 flat, markup 1.0.
pub const IMAGE_MODEL: i64 = 2;
/// No pricing entries at all.
pub const UNPRICED_MODEL: i64 = 3;

pub struct TestEngine {
    pub stores: Arc<InMemoryStores>,
    pub audit: Arc<MemoryAuditSink>,
    pub engine: BillingEngine,
}

impl TestEngine {
    pub fn balance(&self) -> Decimal {
        self.stores.balance(USER_ID).unwrap_or_default()
    }
}

/// Defaults with compensation retries that do not sleep.
pub fn test_config() -> BillingConfig {
    let mut config = BillingConfig::default();
    config.service_name = "billing-engine-test".to_string();
    config.compensation.retry_interval_secs = 0;
    config.dispatcher.worker_count = 2;
    config.dispatcher.queue_size = 16;
    config.dispatcher.charge_timeout_secs = 5;
    config
}

pub fn seeded_stores(balance: Decimal) -> Arc<InMemoryStores> {
    let stores = Arc::new(InMemoryStores::new());
    stores.seed_user(USER_ID, balance);
    stores.add_pricing(
        ModelPricing::new(CHAT_MODEL, PricingKind::Input, dec!(0.001)).with_multiplier(dec!(1.5)),
    );
    stores.add_pricing(
        ModelPricing::new(CHAT_MODEL, PricingKind::Output, dec!(0.002)).with_multiplier(dec!(1.5)),
    );
    stores.add_pricing(
        ModelPricing::new(IMAGE_MODEL, PricingKind::Request, dec!(0.50)).with_multiplier(dec!(1.0)),
    );
    stores
}

pub fn spawn_engine(balance: Decimal) -> TestEngine {
    spawn_engine_with(test_config(), balance, |_, _| {})
}

/// Build an engine over seeded in-memory stores, letting the caller swap
/// individual collaborators before wiring.
pub fn spawn_engine_with(
    config: BillingConfig,
    balance: Decimal,
    customize: impl FnOnce(&Arc<InMemoryStores>, &mut BillingStores),
) -> TestEngine {
    service_core::observability::init_test_tracing();

    let stores = seeded_stores(balance);
    let mut wiring = BillingStores::in_memory(stores.clone());
    customize(&stores, &mut wiring);

    let audit = Arc::new(MemoryAuditSink::new());
    let engine = BillingEngine::new(config, wiring, audit.clone());

    TestEngine {
        stores,
        audit,
        engine,
    }
}

/// A successful chat call: 1000 input and 500 output tokens, costing 0.003.
pub fn chat_record(request_id: &str) -> BillingRecord {
    let mut record = BillingRecord::new(request_id, USER_ID, API_KEY_ID, CHAT_MODEL);
    record.method = "POST".to_string();
    record.endpoint = "/api/v1/chat/completions".to_string();
    record.input_tokens = 1000;
    record.output_tokens = 500;
    record.status_code = 200;
    record.success = true;
    record.stage = BillingStage::Pending;
    record
}

/// A submitted image job, not yet completed. Costs 0.50 once it succeeds.
pub fn image_job_record(request_id: &str) -> BillingRecord {
    let mut record = BillingRecord::new(request_id, USER_ID, API_KEY_ID, IMAGE_MODEL);
    record.method = "POST".to_string();
    record.endpoint = "/api/v1/images/generations".to_string();
    record.kind = RequestKind::AsyncImageJob;
    record.status_code = 202;
    record.success = true;
    record.stage = BillingStage::Pending;
    record
}

/// Ledger store that can be told to reject writes. Reads pass through.
pub struct FailingLedgerStore {
    inner: Arc<InMemoryStores>,
    failing: AtomicBool,
    create_calls: AtomicUsize,
}

impl FailingLedgerStore {
    pub fn new(inner: Arc<InMemoryStores>, failing: bool) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(failing),
            create_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerStore for FailingLedgerStore {
    async fn create(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(anyhow::anyhow!("ledger unavailable")));
        }
        LedgerStore::create(self.inner.as_ref(), entry).await
    }

    async fn find_by_usage_log(&self, usage_log_id: Uuid) -> Result<Vec<LedgerEntry>, StoreError> {
        self.inner.find_by_usage_log(usage_log_id).await
    }

    async fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<LedgerEntry>, StoreError> {
        self.inner.list_since(since).await
    }

    async fn list_by_user(&self, user_id: i64) -> Result<Vec<LedgerEntry>, StoreError> {
        LedgerStore::list_by_user(self.inner.as_ref(), user_id).await
    }
}

/// Quota service whose lookups and/or consumption always fail.
pub struct FailingQuotaService {
    inner: Arc<InMemoryStores>,
    fail_check: bool,
    fail_consume: bool,
}

impl FailingQuotaService {
    pub fn new(inner: Arc<InMemoryStores>, fail_check: bool, fail_consume: bool) -> Self {
        Self {
            inner,
            fail_check,
            fail_consume,
        }
    }
}

#[async_trait]
impl QuotaService for FailingQuotaService {
    async fn check_quota(
        &self,
        api_key_id: i64,
        quota_type: QuotaType,
        value: Decimal,
    ) -> Result<QuotaCheck, StoreError> {
        if self.fail_check {
            return Err(StoreError::Backend(anyhow::anyhow!("quota cache unavailable")));
        }
        self.inner.check_quota(api_key_id, quota_type, value).await
    }

    async fn consume_quota(
        &self,
        api_key_id: i64,
        quota_type: QuotaType,
        value: Decimal,
    ) -> Result<(), StoreError> {
        if self.fail_consume {
            return Err(StoreError::Backend(anyhow::anyhow!("quota cache unavailable")));
        }
        self.inner.consume_quota(api_key_id, quota_type, value).await
    }
}

/// User store that rejects one chosen `update` call, counted from 1.
/// Used to make a balance rollback fail after the deduction went through.
pub struct FailingUserStore {
    inner: Arc<InMemoryStores>,
    fail_on_update: usize,
    update_calls: AtomicUsize,
}

impl FailingUserStore {
    pub fn new(inner: Arc<InMemoryStores>, fail_on_update: usize) -> Self {
        Self {
            inner,
            fail_on_update,
            update_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl UserStore for FailingUserStore {
    async fn get(&self, user_id: i64) -> Result<Option<UserAccount>, StoreError> {
        UserStore::get(self.inner.as_ref(), user_id).await
    }

    async fn update(&self, user: &UserAccount) -> Result<(), StoreError> {
        let call = self.update_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on_update {
            return Err(StoreError::Backend(anyhow::anyhow!("user store unavailable")));
        }
        UserStore::update(self.inner.as_ref(), user).await
    }
}
