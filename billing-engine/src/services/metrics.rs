//! Metrics module for billing-engine.
//! Prometheus counters for pre-checks, charges, compensation and reconciliation.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_counter_vec, register_histogram_vec, register_int_counter_vec,
    CounterVec, Encoder, HistogramVec, IntCounterVec, TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::OnceLock;

/// Charge path duration histogram
pub static CHARGE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "billing_engine_charge_duration_seconds",
            "Time spent charging a request",
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 30.0]
        ),
        &["operation"]
    )
    .expect("Failed to register CHARGE_DURATION")
});

/// Pre-check outcomes (allowed or denial reason)
pub static PRECHECKS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Charge outcomes by operation
pub static CHARGES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Amount posted to the ledger by entry type and currency
pub static CHARGED_AMOUNT_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Balance rollbacks after a failed ledger write
pub static ROLLBACKS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Best-effort quota consumption failures
pub static QUOTA_CONSUMPTION_FAILURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Compensation tasks by type and terminal status
pub static COMPENSATION_TASKS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Reconciliation findings by check type
pub static CONSISTENCY_ISSUES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Dispatcher job outcomes
pub static DISPATCH_JOBS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    PRECHECKS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_engine_prechecks_total", "Pre-checks by outcome"),
            &["outcome"]
        )
        .expect("Failed to register PRECHECKS_TOTAL")
    });

    CHARGES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_engine_charges_total",
                "Charge attempts by operation and outcome"
            ),
            &["operation", "outcome"]
        )
        .expect("Failed to register CHARGES_TOTAL")
    });

    CHARGED_AMOUNT_TOTAL.get_or_init(|| {
        register_counter_vec!(
            opts!(
                "billing_engine_charged_amount_total",
                "Absolute amount posted to the ledger by entry type and currency"
            ),
            &["entry_type", "currency"]
        )
        .expect("Failed to register CHARGED_AMOUNT_TOTAL")
    });

    ROLLBACKS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_engine_rollbacks_total",
                "Balance rollbacks after ledger write failures"
            ),
            &["outcome"]
        )
        .expect("Failed to register ROLLBACKS_TOTAL")
    });

    QUOTA_CONSUMPTION_FAILURES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_engine_quota_consumption_failures_total",
                "Quota consumption failures after a successful charge"
            ),
            &["quota_type"]
        )
        .expect("Failed to register QUOTA_CONSUMPTION_FAILURES_TOTAL")
    });

    COMPENSATION_TASKS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_engine_compensation_tasks_total",
                "Compensation tasks by type and final status"
            ),
            &["task_type", "status"]
        )
        .expect("Failed to register COMPENSATION_TASKS_TOTAL")
    });

    CONSISTENCY_ISSUES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_engine_consistency_issues_total",
                "Reconciliation findings by check type"
            ),
            &["check_type"]
        )
        .expect("Failed to register CONSISTENCY_ISSUES_TOTAL")
    });

    DISPATCH_JOBS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_engine_dispatch_jobs_total",
                "Post-request billing jobs by kind and outcome"
            ),
            &["job", "outcome"]
        )
        .expect("Failed to register DISPATCH_JOBS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*CHARGE_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_precheck(outcome: &str) {
    if let Some(counter) = PRECHECKS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_charge(operation: &str, outcome: &str) {
    if let Some(counter) = CHARGES_TOTAL.get() {
        counter.with_label_values(&[operation, outcome]).inc();
    }
}

pub fn record_charged_amount(entry_type: &str, currency: &str, amount: Decimal) {
    if let Some(counter) = CHARGED_AMOUNT_TOTAL.get() {
        let value = amount.abs().to_f64().unwrap_or(0.0);
        counter.with_label_values(&[entry_type, currency]).inc_by(value);
    }
}

pub fn record_rollback(outcome: &str) {
    if let Some(counter) = ROLLBACKS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_quota_consumption_failure(quota_type: &str) {
    if let Some(counter) = QUOTA_CONSUMPTION_FAILURES_TOTAL.get() {
        counter.with_label_values(&[quota_type]).inc();
    }
}

pub fn record_compensation_task(task_type: &str, status: &str) {
    if let Some(counter) = COMPENSATION_TASKS_TOTAL.get() {
        counter.with_label_values(&[task_type, status]).inc();
    }
}

pub fn record_consistency_issues(check_type: &str, count: usize) {
    if let Some(counter) = CONSISTENCY_ISSUES_TOTAL.get() {
        counter
            .with_label_values(&[check_type])
            .inc_by(count as u64);
    }
}

pub fn record_dispatch_job(job: &str, outcome: &str) {
    if let Some(counter) = DISPATCH_JOBS_TOTAL.get() {
        counter.with_label_values(&[job, outcome]).inc();
    }
}

pub fn observe_charge_duration(operation: &str, seconds: f64) {
    CHARGE_DURATION
        .with_label_values(&[operation])
        .observe(seconds);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn recorded_metrics_are_exported() {
        init_metrics();
        init_metrics();

        record_charge("process_request", "charged");
        record_charged_amount("usage", "USD", dec!(0.003));
        record_consistency_issues("unbilled_usage_logs", 2);
        observe_charge_duration("process_request", 0.002);

        let output = get_metrics();
        assert!(output.contains("billing_engine_charges_total"));
        assert!(output.contains("billing_engine_charged_amount_total"));
        assert!(output.contains("billing_engine_consistency_issues_total"));
        assert!(output.contains("billing_engine_charge_duration_seconds"));
    }
}
