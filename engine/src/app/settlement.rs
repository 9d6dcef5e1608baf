//! Settlement processor.
//!
//! Applies provider notifications to intents at most once. For each event:
//!
//! 1. Lock the intent. Every event for one intent is serialised here.
//! 2. Acknowledge `(intent, nonce)` pairs already seen as duplicates.
//! 3. Reduce a copy of the intent state and run the fulfillment effects.
//! 4. If fulfillment failed, drop the copy; the intent keeps its prior state
//!    and the nonce stays unseen so a redelivery retries.
//! 5. Otherwise commit the copy and remember the nonce.
//!
//! The dedup check and the state transition happen under the same intent
//! lock, so two workers delivering the same confirmation cannot both apply it.

use crate::aggregates::intent::{
    IgnoreReason, IntentAction, IntentEnvironment, IntentReducer, IntentStatus, OutOfBandReason,
    SettlementEvent, SettlementOutcome,
};
use crate::app::intents::{IntentStore, dispatch};
use crate::error::SettlementError;
use crate::types::{Currency, IntentId, Money, UserId, deadline_after};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Acknowledgement returned to the transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ack {
    /// Intent status changed
    Applied {
        /// New status
        status: IntentStatus,
    },
    /// Same `(intent, nonce)` seen before; nothing done
    Duplicate,
    /// Valid event that changes nothing
    Ignored {
        /// Why
        reason: IgnoreReason,
    },
    /// Money parked for manual reconciliation
    Reconciled {
        /// Amount parked
        amount: Money,
    },
}

impl Ack {
    const fn label(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Duplicate => "duplicate",
            Self::Ignored { .. } => "ignored",
            Self::Reconciled { .. } => "reconciled",
        }
    }
}

/// Why a payment was parked
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationReason {
    /// Arrived when the intent could not take it
    OutOfBand(OutOfBandReason),
    /// Paid in the wrong currency
    CurrencyMismatch,
}

impl ReconciliationReason {
    const fn as_str(&self) -> &'static str {
        match self {
            Self::OutOfBand(reason) => reason.as_str(),
            Self::CurrencyMismatch => "currency_mismatch",
        }
    }
}

/// Payment awaiting manual review
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationItem {
    /// Intent paid
    pub intent: IntentId,
    /// Payer
    pub owner: UserId,
    /// Amount not applied
    pub amount: Money,
    /// Currency reported
    pub currency: Currency,
    /// Why
    pub reason: ReconciliationReason,
    /// Delivery that carried it
    pub nonce: String,
    /// When it was parked
    pub recorded_at: DateTime<Utc>,
}

/// Append-only list of parked payments
#[derive(Debug, Default)]
pub struct ReconciliationLog {
    items: Mutex<Vec<ReconciliationItem>>,
}

impl ReconciliationLog {
    fn record(&self, item: ReconciliationItem) {
        crate::metrics::record_reconciliation(item.reason.as_str());
        tracing::warn!(
            intent = %item.intent,
            owner = %item.owner,
            amount = %item.amount,
            currency = %item.currency,
            reason = item.reason.as_str(),
            "Payment parked for reconciliation"
        );
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(item);
    }

    /// Every parked payment, oldest first
    #[must_use]
    pub fn items(&self) -> Vec<ReconciliationItem> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

type DedupKey = (IntentId, String);

/// Applies settlement events exactly once
pub struct SettlementProcessor {
    intents: Arc<IntentStore>,
    env: IntentEnvironment,
    reducer: IntentReducer,
    seen: Mutex<HashMap<DedupKey, DateTime<Utc>>>,
    dedup_window: TimeDelta,
    reconciliation: ReconciliationLog,
}

impl SettlementProcessor {
    /// Creates a processor
    #[must_use]
    pub fn new(intents: Arc<IntentStore>, env: IntentEnvironment, dedup_window: TimeDelta) -> Self {
        Self {
            intents,
            env,
            reducer: IntentReducer::new(),
            seen: Mutex::new(HashMap::new()),
            dedup_window,
            reconciliation: ReconciliationLog::default(),
        }
    }

    fn seen(&self) -> std::sync::MutexGuard<'_, HashMap<DedupKey, DateTime<Utc>>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one provider notification.
    ///
    /// # Errors
    ///
    /// - [`SettlementError::UnknownIntent`] for an id never issued
    /// - [`SettlementError::ExpiredIntent`] when money arrives for an expired
    ///   or superseded intent; it is parked for reconciliation
    /// - [`SettlementError::CurrencyMismatch`] likewise, for the wrong currency
    /// - [`SettlementError::Fulfillment`] when the side effects failed; the
    ///   intent is unchanged and the event may be redelivered
    #[tracing::instrument(skip(self, event), fields(intent = %event.intent_id, nonce = %event.nonce))]
    pub async fn apply(&self, event: SettlementEvent) -> Result<Ack, SettlementError> {
        let Some(slot) = self.intents.slot(&event.intent_id) else {
            crate::metrics::record_settlement("unknown_intent");
            tracing::warn!("Settlement for unknown intent");
            return Err(SettlementError::UnknownIntent(event.intent_id));
        };
        let mut state = slot.lock().await;

        let key = (event.intent_id.clone(), event.nonce.clone());
        if self.seen().contains_key(&key) {
            crate::metrics::record_settlement(Ack::Duplicate.label());
            tracing::debug!("Duplicate settlement acknowledged");
            return Ok(Ack::Duplicate);
        }

        let mut next = state.clone();
        let feedback = dispatch(
            &self.reducer,
            &mut next,
            IntentAction::ApplySettlement { event: event.clone() },
            &self.env,
        )
        .await;

        let failure = feedback.into_iter().find_map(|action| match action {
            IntentAction::FulfillmentFailed { reason } => Some(reason),
            _ => None,
        });
        if let Some(reason) = failure {
            crate::metrics::record_settlement("fulfillment_failed");
            tracing::error!(%reason, "Fulfillment failed; intent left unchanged");
            return Err(SettlementError::Fulfillment {
                intent: event.intent_id,
                reason,
            });
        }

        *state = next;
        let now = self.env.clock.now();
        self.seen().insert(key, now);

        let intent = &state.intent;
        let result = match state.last_outcome.clone() {
            Some(SettlementOutcome::Applied(status)) => {
                tracing::info!(
                    %status,
                    received = %intent.received_amount,
                    expected = %intent.expected_amount,
                    "Settlement applied"
                );
                Ok(Ack::Applied { status })
            },
            Some(SettlementOutcome::OutOfBand { received, reason }) => {
                self.reconciliation.record(ReconciliationItem {
                    intent: intent.id.clone(),
                    owner: intent.owner,
                    amount: received,
                    currency: event.currency.clone(),
                    reason: ReconciliationReason::OutOfBand(reason),
                    nonce: event.nonce.clone(),
                    recorded_at: now,
                });
                if reason.is_expiry() {
                    Err(SettlementError::ExpiredIntent {
                        intent: intent.id.clone(),
                        received,
                    })
                } else {
                    Ok(Ack::Reconciled { amount: received })
                }
            },
            Some(SettlementOutcome::CurrencyMismatch { expected, received }) => {
                self.reconciliation.record(ReconciliationItem {
                    intent: intent.id.clone(),
                    owner: intent.owner,
                    amount: event.received_amount,
                    currency: received.clone(),
                    reason: ReconciliationReason::CurrencyMismatch,
                    nonce: event.nonce.clone(),
                    recorded_at: now,
                });
                Err(SettlementError::CurrencyMismatch {
                    intent: intent.id.clone(),
                    expected,
                    received,
                })
            },
            Some(SettlementOutcome::Ignored(reason)) => {
                tracing::debug!(reason = reason.as_str(), "Settlement ignored");
                Ok(Ack::Ignored { reason })
            },
            None => Ok(Ack::Ignored {
                reason: IgnoreReason::Informational,
            }),
        };

        crate::metrics::record_settlement(match &result {
            Ok(ack) => ack.label(),
            Err(_) => "rejected",
        });
        result
    }

    /// Forget nonces older than the dedup window. Returns how many.
    ///
    /// Redeliveries after that still hit the sticky-status check.
    pub fn prune_dedup(&self, now: DateTime<Utc>) -> usize {
        let mut seen = self.seen();
        let before = seen.len();
        seen.retain(|_, at| deadline_after(*at, self.dedup_window) > now);
        before - seen.len()
    }

    /// Payments parked for manual review
    #[must_use]
    pub fn reconciliation(&self) -> Vec<ReconciliationItem> {
        self.reconciliation.items()
    }
}
