mod common;

use billing_engine::policy::{BillingBehavior, BillingPolicy, CallerRole, RequestDescriptor};
use common::{chat_record, spawn_engine};
use rust_decimal_macros::dec;

#[tokio::test]
async fn admin_request_is_logged_free_and_marked_billed() {
    let app = spawn_engine(dec!(10));
    let policy = BillingPolicy::default();
    let request = RequestDescriptor::new("POST", "/api/v1/chat/completions")
        .with_role(CallerRole::Admin);
    assert_eq!(policy.classify(&request), BillingBehavior::LogOnly);

    let mut record = chat_record("req-admin");
    record.actual_cost = dec!(1.25);
    let log = app
        .engine
        .manager()
        .create_usage_log_only(record.to_usage_log())
        .await
        .unwrap();

    assert_eq!(log.cost, dec!(0));
    assert!(log.is_billed);
    assert!(log.completed_at.is_some());
    assert_eq!(app.balance(), dec!(10));
    assert!(app.stores.ledger_entries().is_empty());

    let stored = app.stores.usage_logs();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, log.id);
    assert!(stored[0].is_billed);
    assert_eq!(
        app.audit.names(),
        vec!["billing_log_only_start", "billing_log_only_result"]
    );
}

#[tokio::test]
async fn log_only_entry_is_invisible_to_unbilled_sweep() {
    let app = spawn_engine(dec!(10));
    app.engine
        .manager()
        .create_usage_log_only(chat_record("req-admin-sweep").to_usage_log())
        .await
        .unwrap();

    let result = app
        .engine
        .checker()
        .check_unbilled_usage_logs(chrono::Duration::hours(1), false)
        .await
        .unwrap();

    assert_eq!(result.total_checked, 0);
    assert!(result.is_consistent());
}
