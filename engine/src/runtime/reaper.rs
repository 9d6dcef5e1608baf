//! Reservation reaper.
//!
//! The only component that mutates state without a caller. One
//! [`sweep`](ReservationReaper::sweep) expires stale intents (releasing their
//! baskets), reaps expired baskets and forgets old settlement nonces. Every
//! step is safe to race with checkouts: releasing a Sold unit is a no-op and
//! a basket is only removed under its own lock.

use crate::aggregates::basket::{BasketAggregate, ReapedBasket};
use crate::aggregates::inventory::InventoryStore;
use crate::app::{PaymentIntentManager, SettlementProcessor};
use crate::types::IntentId;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stockpay_core::environment::Clock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What one sweep did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Intents moved to Expired
    pub expired_intents: Vec<IntentId>,
    /// Baskets released
    pub reaped_baskets: Vec<ReapedBasket>,
    /// Dedup entries dropped
    pub pruned_nonces: usize,
}

impl SweepReport {
    /// Nothing to do this time
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expired_intents.is_empty() && self.reaped_baskets.is_empty() && self.pruned_nonces == 0
    }
}

/// Periodic release of expired baskets and intents
pub struct ReservationReaper {
    inventory: Arc<InventoryStore>,
    baskets: Arc<BasketAggregate>,
    intents: Arc<PaymentIntentManager>,
    settlement: Arc<SettlementProcessor>,
    clock: Arc<dyn Clock>,
}

impl ReservationReaper {
    /// Creates a reaper
    #[must_use]
    pub fn new(
        inventory: Arc<InventoryStore>,
        baskets: Arc<BasketAggregate>,
        intents: Arc<PaymentIntentManager>,
        settlement: Arc<SettlementProcessor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inventory,
            baskets,
            intents,
            settlement,
            clock,
        }
    }

    /// One pass at `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let started = Instant::now();

        let expired_intents = self.intents.expire_stale(now).await;
        let reaped_baskets = self.baskets.reap_expired(now);
        let pruned_nonces = self.settlement.prune_dedup(now);

        crate::metrics::update_units_available(self.inventory.available_count());
        crate::metrics::record_reaper_sweep(started.elapsed().as_secs_f64());

        let report = SweepReport {
            expired_intents,
            reaped_baskets,
            pruned_nonces,
        };
        if report.is_empty() {
            debug!("Reaper sweep found nothing to do");
        } else {
            info!(
                expired_intents = report.expired_intents.len(),
                reaped_baskets = report.reaped_baskets.len(),
                pruned_nonces = report.pruned_nonces,
                "Reaper sweep complete"
            );
        }
        report
    }

    /// Run [`sweep`](Self::sweep) every `interval` until shut down.
    #[must_use]
    pub fn spawn(self, interval: Duration) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis(), "Reservation reaper started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Reservation reaper received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep(self.clock.now()).await;
                    }
                }
            }
        });

        ReaperHandle { shutdown_tx, task }
    }
}

/// Running reaper task
pub struct ReaperHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// A receiver other tasks can use to follow the same shutdown signal
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal the reaper and wait up to `timeout` for its current sweep to
    /// finish. Returns `false` if it had to be abandoned.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        let _ = self.shutdown_tx.send(());
        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(())) => {
                info!("Reservation reaper stopped gracefully");
                true
            },
            Ok(Err(e)) => {
                warn!(error = %e, "Reservation reaper task failed");
                false
            },
            Err(_) => {
                warn!("Reservation reaper shutdown timed out");
                false
            },
        }
    }
}
