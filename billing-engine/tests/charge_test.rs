mod common;

use billing_engine::error::{BillingError, StoreError};
use billing_engine::models::{BillingStage, LedgerEntryType, QuotaType};
use common::{
    chat_record, spawn_engine, spawn_engine_with, test_config, FailingLedgerStore,
    FailingQuotaService, API_KEY_ID, USER_ID,
};
use rust_decimal_macros::dec;
use std::sync::Arc;

#[tokio::test]
async fn successful_call_is_charged_once() {
    let app = spawn_engine(dec!(10));
    let mut record = chat_record("req-charge-1");

    let result = app
        .engine
        .manager()
        .process_request(&mut record)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.amount, dec!(0.003));
    assert!(result.ledger_entry_id.is_some());
    assert_eq!(app.balance(), dec!(9.997));
    assert_eq!(record.stage, BillingStage::Processed);
    assert!(record.is_billed());

    let entries = app.stores.ledger_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].entry_type, LedgerEntryType::Usage);
    assert_eq!(entries[0].amount, dec!(0.003));
    assert_eq!(entries[0].user_id, USER_ID);
    assert_eq!(Some(entries[0].id), result.ledger_entry_id);

    let logs = app.stores.usage_logs();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].is_billed);
    assert_eq!(logs[0].cost, dec!(0.003));
    assert_eq!(Some(logs[0].id), result.usage_log_id);

    assert_eq!(app.stores.quota_used(API_KEY_ID, QuotaType::Requests), dec!(1));
    assert_eq!(app.stores.quota_used(API_KEY_ID, QuotaType::Tokens), dec!(1500));
    assert_eq!(app.stores.quota_used(API_KEY_ID, QuotaType::Cost), dec!(0.003));
    assert_eq!(app.audit.count("billing_result"), 1);
}

#[tokio::test]
async fn ledger_failure_rolls_back_balance() {
    let mut ledger = None;
    let app = spawn_engine_with(test_config(), dec!(10), |stores, wiring| {
        let failing = Arc::new(FailingLedgerStore::new(stores.clone(), true));
        ledger = Some(failing.clone());
        wiring.ledger = failing;
    });
    let mut record = chat_record("req-charge-rollback");

    let err = app
        .engine
        .manager()
        .process_request(&mut record)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BillingError::LedgerWriteFailed {
            rolled_back: true,
            ..
        }
    ));
    assert_eq!(app.balance(), dec!(10));
    assert_eq!(ledger.unwrap().create_calls(), 1);
    assert!(app.stores.ledger_entries().is_empty());
    assert_eq!(record.stage, BillingStage::Error);
    assert!(!record.is_billed());

    let logs = app.stores.usage_logs();
    assert_eq!(logs.len(), 1);
    assert!(!logs[0].is_billed);
    assert_eq!(app.audit.count("billing_error"), 1);
}

#[tokio::test]
async fn failed_call_is_logged_but_not_charged() {
    let app = spawn_engine(dec!(10));
    let mut record = chat_record("req-charge-500");
    record.status_code = 500;
    record.success = false;

    let result = app
        .engine
        .manager()
        .process_request(&mut record)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.amount, dec!(0));
    assert!(result.ledger_entry_id.is_none());
    assert_eq!(app.balance(), dec!(10));
    assert_eq!(record.stage, BillingStage::Processed);
    assert!(app.stores.ledger_entries().is_empty());
    assert_eq!(app.stores.usage_logs().len(), 1);
}

#[tokio::test]
async fn unbillable_call_stores_zero_cost() {
    let app = spawn_engine(dec!(10));
    let mut record = chat_record("req-charge-unbillable-cost");
    record.status_code = 503;
    record.success = false;
    record.actual_cost = dec!(0.40);

    let result = app
        .engine
        .manager()
        .process_request(&mut record)
        .await
        .unwrap();

    assert_eq!(result.amount, dec!(0));
    let log = &app.stores.usage_logs()[0];
    assert!(!log.is_billed);
    assert_eq!(log.cost, dec!(0));
    assert_eq!(app.balance(), dec!(10));
}

#[tokio::test]
async fn success_flag_without_2xx_is_not_charged() {
    let app = spawn_engine(dec!(10));
    let mut record = chat_record("req-charge-302");
    record.status_code = 302;

    let result = app
        .engine
        .manager()
        .process_request(&mut record)
        .await
        .unwrap();

    assert_eq!(result.amount, dec!(0));
    assert_eq!(app.balance(), dec!(10));
}

#[tokio::test]
async fn quota_consumption_failure_keeps_the_charge() {
    let app = spawn_engine_with(test_config(), dec!(10), |stores, wiring| {
        wiring.quotas = Arc::new(FailingQuotaService::new(stores.clone(), false, true));
    });
    let mut record = chat_record("req-charge-quota");

    let result = app
        .engine
        .manager()
        .process_request(&mut record)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(app.balance(), dec!(9.997));
    assert!(record.is_billed());
    assert_eq!(app.audit.count("quota_consumption"), 3);
}

#[tokio::test]
async fn caller_supplied_cost_takes_precedence() {
    let app = spawn_engine(dec!(10));
    let mut record = chat_record("req-charge-actual");
    record.actual_cost = dec!(0.25);

    let result = app
        .engine
        .manager()
        .process_request(&mut record)
        .await
        .unwrap();

    assert_eq!(result.amount, dec!(0.25));
    assert_eq!(app.balance(), dec!(9.75));
}

#[tokio::test]
async fn zero_cost_call_is_billed_without_ledger_entry() {
    let app = spawn_engine(dec!(10));
    let mut record = chat_record("req-charge-zero");
    record.input_tokens = 0;
    record.output_tokens = 0;

    let result = app
        .engine
        .manager()
        .process_request(&mut record)
        .await
        .unwrap();

    assert_eq!(result.amount, dec!(0));
    assert!(result.ledger_entry_id.is_none());
    assert!(record.is_billed());
    assert!(app.stores.ledger_entries().is_empty());
    assert!(app.stores.usage_logs()[0].is_billed);
    assert_eq!(app.balance(), dec!(10));
}

#[tokio::test]
async fn duplicate_request_id_is_not_charged_twice() {
    let app = spawn_engine(dec!(10));
    let mut first = chat_record("req-charge-dup");
    let mut second = chat_record("req-charge-dup");

    app.engine
        .manager()
        .process_request(&mut first)
        .await
        .unwrap();
    let err = app
        .engine
        .manager()
        .process_request(&mut second)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BillingError::Store(StoreError::Conflict { .. })
    ));
    assert_eq!(app.balance(), dec!(9.997));
    assert_eq!(app.stores.ledger_entries().len(), 1);
}

#[tokio::test]
async fn balance_may_go_negative_on_charge() {
    let app = spawn_engine(dec!(0.001));
    let mut record = chat_record("req-charge-overdraw");

    app.engine
        .manager()
        .process_request(&mut record)
        .await
        .unwrap();

    assert_eq!(app.balance(), dec!(-0.002));
}
