mod common;

use billing_engine::services::ReconciliationScheduler;
use common::{spawn_engine_with, test_config};
use rust_decimal_macros::dec;
use std::time::Duration;

#[tokio::test]
async fn scheduler_runs_full_check_until_stopped() {
    let mut config = test_config();
    config.consistency.interval_secs = 3600;
    let app = spawn_engine_with(config, dec!(10), |_, _| {});

    let scheduler = app.engine.start_scheduler();
    assert!(scheduler.is_running());

    let mut waited = 0;
    while app.audit.count("billing_consistency_check") < 2 && waited < 200 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    // first tick fires immediately and runs both sweeps
    assert_eq!(app.audit.count("billing_consistency_check"), 2);

    scheduler.stop().await;
    assert_eq!(app.audit.count("billing_consistency_check"), 2);
}

#[tokio::test]
async fn short_interval_runs_repeatedly() {
    let app = spawn_engine_with(test_config(), dec!(10), |_, _| {});

    let scheduler =
        ReconciliationScheduler::spawn(app.engine.checker().clone(), Duration::from_millis(20));

    let mut waited = 0;
    while app.audit.count("billing_consistency_check") < 6 && waited < 300 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    scheduler.stop().await;

    assert!(app.audit.count("billing_consistency_check") >= 6);
}
