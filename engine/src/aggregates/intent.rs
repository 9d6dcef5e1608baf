//! Payment intent aggregate.
//!
//! An intent is one request for money: a basket checkout or a balance refill.
//! Its status moves only through [`IntentReducer`], which turns settlement
//! events into state changes plus fulfillment effects (commit the basket,
//! credit the ledger, release reservations). The reducer never touches the
//! stores itself; the caller runs the effects and feeds back the outcome.
//!
//! ```text
//! Pending ──paid ≥ expected──▶ Confirmed | Overpaid
//!    │ ──0 < paid < expected──▶ Partial
//!    │ ──failed/expired/refunded──▶ Failed
//!    │ ──quote window passed──▶ Expired
//!    └ ──newer intent for the basket──▶ Superseded
//! ```
//!
//! Only `Pending` accepts a transition. Every other status is sticky.

use crate::aggregates::ledger::LedgerReason;
use crate::discount::QuoteLine;
use crate::error::FulfillmentError;
use crate::types::{BasketId, Currency, IntentId, Money, UnitId, UserId};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use stockpay_core::{SmallVec, effect::Effect, environment::Clock, reducer::Reducer, smallvec};

// ============================================================================
// Types
// ============================================================================

/// What the money is for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    /// Basket checkout
    Purchase,
    /// Balance top-up
    Refill,
}

impl IntentKind {
    /// Metric label
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Refill => "refill",
        }
    }
}

/// Lifecycle of an intent
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    /// Awaiting payment; the only actionable status
    Pending,
    /// Paid exactly
    Confirmed,
    /// Paid less than expected
    Partial,
    /// Paid more than expected
    Overpaid,
    /// Quote window passed without payment
    Expired,
    /// Provider reported failure
    Failed,
    /// A newer intent took over the basket
    Superseded,
}

impl IntentStatus {
    /// Whether settlement can still change this intent
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Stable label
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Partial => "partial",
            Self::Overpaid => "overpaid",
            Self::Expired => "expired",
            Self::Failed => "failed",
            Self::Superseded => "superseded",
        }
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Basket contents frozen when a purchase intent is opened
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutTerms {
    /// Basket being paid for
    pub basket: BasketId,
    /// Units quoted
    pub units: Vec<UnitId>,
    /// Code applied to the quote, redeemed on success
    pub discount_code: Option<String>,
    /// Per-line prices after reseller discount
    pub lines: Vec<QuoteLine>,
}

/// A request for payment tracked against the gateway
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    /// Gateway-assigned id
    pub id: IntentId,
    /// Purchase or refill
    pub kind: IntentKind,
    /// Payer
    pub owner: UserId,
    /// Quoted amount
    pub expected_amount: Money,
    /// Settlement currency
    pub currency: Currency,
    /// Lifecycle status
    pub status: IntentStatus,
    /// Frozen basket, for purchases
    pub checkout: Option<CheckoutTerms>,
    /// Cumulative amount applied so far
    pub received_amount: Money,
    /// Where the customer pays
    pub pay_address: String,
    /// Issued at
    pub created_at: DateTime<Utc>,
    /// End of the provider quote window
    pub deadline: DateTime<Utc>,
    /// When the intent left `Pending` through a payment or failure
    pub settled_at: Option<DateTime<Utc>>,
}

impl PaymentIntent {
    /// Basket this intent pays for, if any
    #[must_use]
    pub fn related_basket(&self) -> Option<BasketId> {
        self.checkout.as_ref().map(|terms| terms.basket)
    }

    /// Past the quote window
    #[must_use]
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline <= now
    }

    /// Amount above the quote, if any
    #[must_use]
    pub const fn excess(&self) -> Money {
        self.received_amount.saturating_sub(self.expected_amount)
    }
}

/// Status vocabulary of the payment provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    /// Invoice created, nothing seen on chain
    Waiting,
    /// Transaction seen, awaiting confirmations
    Confirming,
    /// Transaction confirmed
    Confirmed,
    /// Provider forwarding funds
    Sending,
    /// Less than the invoice amount arrived
    PartiallyPaid,
    /// Funds delivered
    Finished,
    /// Payment failed
    Failed,
    /// Payment returned to the payer
    Refunded,
    /// Invoice expired at the provider
    Expired,
}

impl ProviderStatus {
    /// Carries a paid amount
    #[must_use]
    pub const fn is_paid(&self) -> bool {
        matches!(self, Self::Confirmed | Self::PartiallyPaid | Self::Finished)
    }

    /// Ends the payment without money
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Refunded | Self::Expired)
    }
}

/// Asynchronous notification from the gateway
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementEvent {
    /// Intent concerned
    pub intent_id: IntentId,
    /// Cumulative amount received so far
    pub received_amount: Money,
    /// Currency of `received_amount`
    pub currency: Currency,
    /// Provider status
    pub reported_status: ProviderStatus,
    /// Provider-assigned delivery id; repeats on redelivery
    pub nonce: String,
}

/// Why an event changed nothing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// Progress notification
    Informational,
    /// Paid status with nothing paid
    ZeroAmount,
    /// Intent already settled with this status
    Settled(IntentStatus),
    /// No money beyond what was already applied
    NoNewFunds,
    /// Command not applicable to the current status
    NotPending,
}

impl IgnoreReason {
    /// Metric label
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Informational => "informational",
            Self::ZeroAmount => "zero_amount",
            Self::Settled(_) => "settled",
            Self::NoNewFunds => "no_new_funds",
            Self::NotPending => "not_pending",
        }
    }
}

/// Why money could not be applied automatically
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutOfBandReason {
    /// Intent already expired
    Expired,
    /// Intent replaced by a newer checkout
    Superseded,
    /// Arrived after the quote window; the intent expires now
    PastDeadline,
    /// More money on an intent already settled as partial
    PartialTopUp,
}

impl OutOfBandReason {
    /// Metric label
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Superseded => "superseded",
            Self::PastDeadline => "past_deadline",
            Self::PartialTopUp => "partial_top_up",
        }
    }

    /// Whether the intent was no longer accepting payment
    #[must_use]
    pub const fn is_expiry(&self) -> bool {
        !matches!(self, Self::PartialTopUp)
    }
}

/// What the last command did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// Status changed
    Applied(IntentStatus),
    /// Acknowledged, nothing changed
    Ignored(IgnoreReason),
    /// Money parked for manual reconciliation
    OutOfBand {
        /// Amount not applied
        received: Money,
        /// Why
        reason: OutOfBandReason,
    },
    /// Paid in the wrong currency; parked for reconciliation
    CurrencyMismatch {
        /// Intent currency
        expected: Currency,
        /// Reported currency
        received: Currency,
    },
}

/// Aggregate state: the intent plus the outcome of the last command
#[derive(Clone, Debug)]
pub struct IntentState {
    /// The intent
    pub intent: PaymentIntent,
    /// Outcome of the last command
    pub last_outcome: Option<SettlementOutcome>,
    /// Fulfillment failure reported back by an effect
    pub last_error: Option<String>,
}

impl IntentState {
    /// Wrap a freshly issued intent
    #[must_use]
    pub const fn new(intent: PaymentIntent) -> Self {
        Self {
            intent,
            last_outcome: None,
            last_error: None,
        }
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Commands, events and effect feedback for a payment intent
#[derive(Clone, Debug)]
pub enum IntentAction {
    // Commands
    /// Apply a provider notification
    ApplySettlement {
        /// The notification
        event: SettlementEvent,
    },
    /// Quote window passed
    Expire,
    /// Void in favour of a newer intent for the same basket
    Supersede {
        /// Replacement intent
        by: IntentId,
    },

    // Events
    /// Payment (or failure) applied
    Settled {
        /// New status
        status: IntentStatus,
        /// Cumulative amount applied
        received: Money,
        /// When
        settled_at: DateTime<Utc>,
    },
    /// Intent expired
    Expired,
    /// Intent voided
    Superseded {
        /// Replacement intent
        by: IntentId,
    },

    // Effect feedback
    /// Fulfillment side effects succeeded
    FulfillmentCompleted,
    /// Fulfillment side effects failed
    FulfillmentFailed {
        /// Failure message
        reason: String,
    },
}

// ============================================================================
// Environment
// ============================================================================

/// Side effects triggered by settlement
///
/// Implementations must be idempotent per intent: a retried effect for the same
/// intent must not commit or credit twice.
pub trait Fulfillment: Send + Sync {
    /// Commit the basket held by `intent`, credit any overpayment, record the
    /// purchase
    fn fulfill_purchase(&self, intent: PaymentIntent) -> BoxFuture<'static, Result<(), FulfillmentError>>;

    /// Credit `amount` to the intent owner, attributed to the intent
    fn credit(
        &self,
        intent: PaymentIntent,
        amount: Money,
        reason: LedgerReason,
    ) -> BoxFuture<'static, Result<(), FulfillmentError>>;

    /// Release the basket held by `intent`, if it still holds one
    fn release_checkout(&self, intent: PaymentIntent) -> BoxFuture<'static, ()>;
}

/// Dependencies of [`IntentReducer`]
#[derive(Clone)]
pub struct IntentEnvironment {
    /// Time source for deadlines and timestamps
    pub clock: Arc<dyn Clock>,
    /// Fulfillment side effects
    pub fulfillment: Arc<dyn Fulfillment>,
}

impl IntentEnvironment {
    /// Creates a new environment
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, fulfillment: Arc<dyn Fulfillment>) -> Self {
        Self { clock, fulfillment }
    }
}

// ============================================================================
// Reducer
// ============================================================================

type Effects = SmallVec<[Effect<IntentAction>; 4]>;

/// Settlement state machine for one intent
#[derive(Clone, Copy, Debug, Default)]
pub struct IntentReducer;

impl IntentReducer {
    /// Creates a new reducer
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn apply_event(state: &mut IntentState, action: &IntentAction) {
        match action {
            IntentAction::Settled {
                status,
                received,
                settled_at,
            } => {
                state.intent.status = *status;
                state.intent.received_amount = *received;
                state.intent.settled_at = Some(*settled_at);
                state.last_outcome = Some(SettlementOutcome::Applied(*status));
                state.last_error = None;
            },
            IntentAction::Expired => {
                state.intent.status = IntentStatus::Expired;
                state.last_outcome = Some(SettlementOutcome::Applied(IntentStatus::Expired));
            },
            IntentAction::Superseded { .. } => {
                state.intent.status = IntentStatus::Superseded;
                state.last_outcome = Some(SettlementOutcome::Applied(IntentStatus::Superseded));
            },
            IntentAction::FulfillmentCompleted => {
                state.last_error = None;
            },
            IntentAction::FulfillmentFailed { reason } => {
                state.last_error = Some(reason.clone());
            },
            // Commands don't modify state
            IntentAction::ApplySettlement { .. }
            | IntentAction::Expire
            | IntentAction::Supersede { .. } => {},
        }
    }

    fn ignore(state: &mut IntentState, reason: IgnoreReason) -> Effects {
        state.last_outcome = Some(SettlementOutcome::Ignored(reason));
        SmallVec::new()
    }

    fn report(fut: BoxFuture<'static, Result<(), FulfillmentError>>) -> Effect<IntentAction> {
        Effect::future(async move {
            Some(match fut.await {
                Ok(()) => IntentAction::FulfillmentCompleted,
                Err(err) => IntentAction::FulfillmentFailed {
                    reason: err.to_string(),
                },
            })
        })
    }

    fn release(env: &IntentEnvironment, intent: &PaymentIntent) -> Effect<IntentAction> {
        if intent.kind == IntentKind::Refill {
            return Effect::None;
        }
        let release = env.fulfillment.release_checkout(intent.clone());
        Effect::future(async move {
            release.await;
            None
        })
    }

    fn settle(
        state: &mut IntentState,
        event: &SettlementEvent,
        env: &IntentEnvironment,
    ) -> Effects {
        let now = env.clock.now();
        let status = event.reported_status;

        if !status.is_paid() && !status.is_failure() {
            return Self::ignore(state, IgnoreReason::Informational);
        }

        if status.is_failure() {
            if !state.intent.status.is_pending() {
                return Self::ignore(state, IgnoreReason::Settled(state.intent.status));
            }
            let failed = IntentAction::Settled {
                status: IntentStatus::Failed,
                received: state.intent.received_amount,
                settled_at: now,
            };
            Self::apply_event(state, &failed);
            return smallvec![Self::release(env, &state.intent)];
        }

        let received = event.received_amount;
        if received.is_zero() {
            return Self::ignore(state, IgnoreReason::ZeroAmount);
        }

        if event.currency != state.intent.currency {
            state.last_outcome = Some(SettlementOutcome::CurrencyMismatch {
                expected: state.intent.currency.clone(),
                received: event.currency.clone(),
            });
            return SmallVec::new();
        }

        match state.intent.status {
            IntentStatus::Expired | IntentStatus::Superseded => {
                let reason = if state.intent.status == IntentStatus::Expired {
                    OutOfBandReason::Expired
                } else {
                    OutOfBandReason::Superseded
                };
                state.last_outcome = Some(SettlementOutcome::OutOfBand { received, reason });
                SmallVec::new()
            },
            IntentStatus::Confirmed | IntentStatus::Overpaid | IntentStatus::Failed => {
                Self::ignore(state, IgnoreReason::Settled(state.intent.status))
            },
            IntentStatus::Partial => {
                let extra = received.saturating_sub(state.intent.received_amount);
                if extra.is_zero() {
                    return Self::ignore(state, IgnoreReason::NoNewFunds);
                }
                state.last_outcome = Some(SettlementOutcome::OutOfBand {
                    received: extra,
                    reason: OutOfBandReason::PartialTopUp,
                });
                SmallVec::new()
            },
            IntentStatus::Pending if state.intent.is_past_deadline(now) => {
                Self::apply_event(state, &IntentAction::Expired);
                state.last_outcome = Some(SettlementOutcome::OutOfBand {
                    received,
                    reason: OutOfBandReason::PastDeadline,
                });
                smallvec![Self::release(env, &state.intent)]
            },
            IntentStatus::Pending => Self::settle_pending(state, received, now, env),
        }
    }

    fn settle_pending(
        state: &mut IntentState,
        received: Money,
        now: DateTime<Utc>,
        env: &IntentEnvironment,
    ) -> Effects {
        let expected = state.intent.expected_amount;
        let status = if received < expected {
            IntentStatus::Partial
        } else if received == expected {
            IntentStatus::Confirmed
        } else {
            IntentStatus::Overpaid
        };

        Self::apply_event(
            state,
            &IntentAction::Settled {
                status,
                received,
                settled_at: now,
            },
        );

        let intent = state.intent.clone();
        let fulfillment = &env.fulfillment;
        match (status, intent.kind) {
            (IntentStatus::Partial, _) => {
                let credit = Self::report(fulfillment.credit(
                    intent.clone(),
                    received,
                    LedgerReason::UnderpaymentCredit,
                ));
                let release = Self::release(env, &intent);
                smallvec![Effect::chain(vec![credit, release])]
            },
            (_, IntentKind::Purchase) => smallvec![Self::report(fulfillment.fulfill_purchase(intent))],
            (_, IntentKind::Refill) => {
                smallvec![Self::report(fulfillment.credit(intent, received, LedgerReason::Refill))]
            },
        }
    }
}

impl Reducer for IntentReducer {
    type State = IntentState;
    type Action = IntentAction;
    type Environment = IntentEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        match action {
            IntentAction::ApplySettlement { event } => Self::settle(state, &event, env),

            IntentAction::Expire => {
                if !state.intent.status.is_pending() {
                    return Self::ignore(state, IgnoreReason::NotPending);
                }
                Self::apply_event(state, &IntentAction::Expired);
                smallvec![Self::release(env, &state.intent)]
            },

            IntentAction::Supersede { by } => {
                if !state.intent.status.is_pending() {
                    return Self::ignore(state, IgnoreReason::NotPending);
                }
                // The replacement holds the basket now; nothing to release.
                Self::apply_event(state, &IntentAction::Superseded { by });
                SmallVec::new()
            },

            event => {
                Self::apply_event(state, &event);
                SmallVec::new()
            },
        }
    }
}
