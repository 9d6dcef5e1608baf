//! Business metrics for the stockpay engine.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `stockpay_reservations_total{outcome}` - Reserve attempts (reserved, rejected)
//! - `stockpay_units_released_total{reason}` - Units returned to stock
//! - `stockpay_units_sold_total` - Units committed to a sale
//! - `stockpay_intents_opened_total{kind}` - Payment intents issued
//! - `stockpay_gateway_failures_total{kind}` - Intent creation failures
//! - `stockpay_settlements_total{outcome}` - Settlement events by outcome
//! - `stockpay_ledger_credits_cents_total{reason}` - Money credited to balances
//! - `stockpay_reconciliation_total{reason}` - Payments parked for manual review
//!
//! ## Gauges
//! - `stockpay_units_available` - Units currently sellable
//!
//! ## Histograms
//! - `stockpay_reaper_sweep_seconds` - Duration of one reaper pass

use metrics::{describe_counter, describe_gauge, describe_histogram};

/// Register descriptions for every engine metric.
///
/// Call once at startup, after installing a recorder.
pub fn register_business_metrics() {
    describe_counter!(
        "stockpay_reservations_total",
        "Reserve attempts by outcome (reserved, rejected)"
    );
    describe_counter!(
        "stockpay_units_released_total",
        "Units returned to stock by reason (removed, cleared, expired, payment_failed)"
    );
    describe_counter!("stockpay_units_sold_total", "Units committed to a sale");
    describe_gauge!("stockpay_units_available", "Units currently sellable");

    describe_counter!(
        "stockpay_intents_opened_total",
        "Payment intents issued by kind (purchase, refill)"
    );
    describe_counter!(
        "stockpay_gateway_failures_total",
        "Intent creation failures by kind (transient, below_minimum, rejected)"
    );
    describe_counter!(
        "stockpay_settlements_total",
        "Settlement events by outcome (applied, duplicate, ignored, rejected)"
    );
    describe_counter!(
        "stockpay_ledger_credits_cents_total",
        "Minor units credited to balances by reason"
    );
    describe_counter!(
        "stockpay_reconciliation_total",
        "Payments parked for manual reconciliation"
    );

    describe_histogram!(
        "stockpay_reaper_sweep_seconds",
        "Duration of one reservation reaper pass"
    );

    tracing::info!("Business metrics registered");
}

/// Record a reserve attempt.
pub fn record_reservation(outcome: &'static str) {
    metrics::counter!("stockpay_reservations_total", "outcome" => outcome).increment(1);
}

/// Record units going back on sale.
pub fn record_units_released(reason: &'static str, count: usize) {
    metrics::counter!("stockpay_units_released_total", "reason" => reason)
        .increment(count as u64);
    tracing::debug!(reason, count, "Recorded units_released metric");
}

/// Record units sold.
pub fn record_units_sold(count: usize) {
    metrics::counter!("stockpay_units_sold_total").increment(count as u64);
}

/// Update the available-units gauge.
#[allow(clippy::cast_precision_loss)]
pub fn update_units_available(available: usize) {
    metrics::gauge!("stockpay_units_available").set(available as f64);
}

/// Record an issued intent.
pub fn record_intent_opened(kind: &'static str) {
    metrics::counter!("stockpay_intents_opened_total", "kind" => kind).increment(1);
}

/// Record a failed intent creation.
pub fn record_gateway_failure(kind: &'static str) {
    metrics::counter!("stockpay_gateway_failures_total", "kind" => kind).increment(1);
}

/// Record a processed settlement event.
pub fn record_settlement(outcome: &'static str) {
    metrics::counter!("stockpay_settlements_total", "outcome" => outcome).increment(1);
}

/// Record money credited to a balance.
pub fn record_ledger_credit(reason: &'static str, amount_cents: u64) {
    metrics::counter!("stockpay_ledger_credits_cents_total", "reason" => reason)
        .increment(amount_cents);
    tracing::debug!(reason, amount_cents, "Recorded ledger_credit metric");
}

/// Record a payment parked for reconciliation.
pub fn record_reconciliation(reason: &'static str) {
    metrics::counter!("stockpay_reconciliation_total", "reason" => reason).increment(1);
}

/// Record the duration of a reaper pass.
pub fn record_reaper_sweep(duration_secs: f64) {
    metrics::histogram!("stockpay_reaper_sweep_seconds").record(duration_secs);
}
