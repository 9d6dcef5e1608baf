//! Payment intent manager.
//!
//! Opens purchase and refill intents against the gateway and expires the ones
//! whose quote window has passed. The gateway call happens with no lock held:
//! the basket is quoted first, the invoice requested second, and the basket
//! handed to the new intent last, guarded by the quoted revision.

use crate::aggregates::basket::{BasketAggregate, CheckoutSnapshot};
use crate::aggregates::intent::{
    CheckoutTerms, IntentAction, IntentEnvironment, IntentKind, IntentReducer, IntentState,
    IntentStatus, PaymentIntent,
};
use crate::config::EngineConfig;
use crate::error::IntentError;
use crate::payment_gateway::{Invoice, InvoiceRequest, PaymentGateway, PaymentGatewayError};
use crate::retry::{RetryPolicy, retry_with_predicate};
use crate::types::{BasketId, Currency, IntentId, Money, UserId, deadline_after};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use stockpay_core::{executor, reducer::Reducer};
use tokio::sync::Mutex;

/// One intent behind its own async lock
pub type IntentSlot = Arc<Mutex<IntentState>>;

/// Every intent ever issued, keyed by gateway id.
///
/// Settled and expired intents stay so status queries and late payments still
/// resolve; retention beyond process lifetime belongs to a persistence layer.
#[derive(Default)]
pub struct IntentStore {
    intents: RwLock<HashMap<IntentId, IntentSlot>>,
}

impl IntentStore {
    /// Creates an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new intent.
    ///
    /// # Errors
    ///
    /// [`IntentError::DuplicateIntent`] if the id is already on record; the
    /// stored intent is left untouched.
    pub fn insert(&self, intent: PaymentIntent) -> Result<IntentSlot, IntentError> {
        let mut intents = self.intents.write().unwrap_or_else(PoisonError::into_inner);
        match intents.entry(intent.id.clone()) {
            Entry::Occupied(taken) => Err(IntentError::DuplicateIntent(taken.key().clone())),
            Entry::Vacant(slot) => Ok(Arc::clone(
                slot.insert(Arc::new(Mutex::new(IntentState::new(intent)))),
            )),
        }
    }

    /// Lock handle for `id`
    #[must_use]
    pub fn slot(&self, id: &IntentId) -> Option<IntentSlot> {
        self.intents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// All lock handles
    #[must_use]
    pub fn slots(&self) -> Vec<IntentSlot> {
        self.intents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Current copy of an intent
    pub async fn get(&self, id: &IntentId) -> Option<PaymentIntent> {
        let slot = self.slot(id)?;
        let state = slot.lock().await;
        Some(state.intent.clone())
    }
}

/// Reduce `action`, run its effects, and feed every resulting action back in
/// until nothing is left. Returns the feedback actions.
pub(crate) async fn dispatch(
    reducer: &IntentReducer,
    state: &mut IntentState,
    action: IntentAction,
    env: &IntentEnvironment,
) -> Vec<IntentAction> {
    let mut feedback = Vec::new();
    let mut queue = VecDeque::from([action]);
    while let Some(action) = queue.pop_front() {
        let effects = reducer.reduce(state, action, env);
        let produced = executor::run_all(effects).await;
        feedback.extend(produced.iter().cloned());
        queue.extend(produced);
    }
    feedback
}

/// Creates and expires payment intents
pub struct PaymentIntentManager {
    intents: Arc<IntentStore>,
    baskets: Arc<BasketAggregate>,
    gateway: Arc<dyn PaymentGateway>,
    env: IntentEnvironment,
    reducer: IntentReducer,
    retry: RetryPolicy,
    quote_window: TimeDelta,
    min_refill: Money,
}

impl PaymentIntentManager {
    /// Creates the manager
    #[must_use]
    pub fn new(
        intents: Arc<IntentStore>,
        baskets: Arc<BasketAggregate>,
        gateway: Arc<dyn PaymentGateway>,
        env: IntentEnvironment,
        config: &EngineConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            intents,
            baskets,
            gateway,
            env,
            reducer: IntentReducer::new(),
            retry,
            quote_window: config.quote_window(),
            min_refill: config.min_refill(),
        }
    }

    async fn request_invoice(&self, request: InvoiceRequest) -> Result<Invoice, PaymentGatewayError> {
        retry_with_predicate(
            &self.retry,
            || self.gateway.create_invoice(request.clone()),
            PaymentGatewayError::is_transient,
        )
        .await
    }

    fn new_intent(
        &self,
        invoice: Invoice,
        kind: IntentKind,
        owner: UserId,
        checkout: Option<CheckoutTerms>,
    ) -> PaymentIntent {
        let now = self.env.clock.now();
        PaymentIntent {
            id: invoice.intent_id,
            kind,
            owner,
            expected_amount: invoice.amount,
            currency: invoice.currency,
            status: IntentStatus::Pending,
            checkout,
            received_amount: Money::ZERO,
            pay_address: invoice.pay_address,
            created_at: now,
            deadline: deadline_after(now, self.quote_window),
            settled_at: None,
        }
    }

    /// Turn a gateway refusal into an intent error, releasing the quoted
    /// basket when the checkout cannot be retried as-is.
    fn gateway_failed(
        &self,
        user: UserId,
        snapshot: Option<&CheckoutSnapshot>,
        amount: Money,
        err: PaymentGatewayError,
    ) -> IntentError {
        let (kind, release) = match &err {
            PaymentGatewayError::BelowMinimum { .. } => ("below_minimum", false),
            PaymentGatewayError::UnsupportedCurrency { .. } => ("unsupported_currency", false),
            PaymentGatewayError::Rejected { .. } => ("rejected", true),
            PaymentGatewayError::Timeout | PaymentGatewayError::Unavailable { .. } => ("transient", true),
        };
        crate::metrics::record_gateway_failure(kind);
        tracing::warn!(%user, error = %err, kind, "Intent creation failed");

        if release {
            // Only a basket nobody else is paying for goes back on sale.
            if let Some(snapshot) = snapshot.filter(|s| s.pending.is_none()) {
                self.baskets
                    .release_quoted(user, snapshot.basket, snapshot.revision);
            }
        }

        match err {
            PaymentGatewayError::BelowMinimum { minimum } => IntentError::BelowMinimum { amount, minimum },
            other => IntentError::Gateway(other),
        }
    }

    /// Open a purchase intent for the user's live basket.
    ///
    /// Supersedes any intent already holding the basket.
    ///
    /// # Errors
    ///
    /// - [`IntentError::Basket`] if the basket is empty, expired, or changed
    ///   while the invoice was being created
    /// - [`IntentError::StaleBasket`] if `basket_id` is not the live basket
    /// - [`IntentError::BelowMinimum`] for a zero total or the gateway minimum
    /// - [`IntentError::Gateway`] once retries are exhausted; the basket is
    ///   released unless the failure was the currency
    #[tracing::instrument(skip(self))]
    pub async fn open_purchase_intent(
        &self,
        user: UserId,
        basket_id: BasketId,
        currency: Currency,
    ) -> Result<PaymentIntent, IntentError> {
        let snapshot = self.baskets.prepare_checkout(user)?;
        if snapshot.basket != basket_id {
            return Err(IntentError::StaleBasket { requested: basket_id });
        }
        let amount = snapshot.quote.total;
        if amount.is_zero() {
            return Err(IntentError::BelowMinimum {
                amount,
                minimum: Money::from_cents(1),
            });
        }

        let request = InvoiceRequest {
            order_ref: basket_id.to_string(),
            amount,
            currency,
            description: format!("{} item(s)", snapshot.items.len()),
        };
        let invoice = match self.request_invoice(request).await {
            Ok(invoice) => invoice,
            Err(err) => return Err(self.gateway_failed(user, Some(&snapshot), amount, err)),
        };

        let terms = CheckoutTerms {
            basket: snapshot.basket,
            units: snapshot.items.clone(),
            discount_code: snapshot.quote.code.clone(),
            lines: snapshot.quote.lines.clone(),
        };
        let intent = self.new_intent(invoice, IntentKind::Purchase, user, Some(terms));
        let slot = self.register(intent.clone())?;

        let previous = match self.baskets.begin_checkout(
            user,
            snapshot.basket,
            snapshot.revision,
            intent.id.clone(),
            intent.deadline,
        ) {
            Ok(previous) => previous,
            Err(err) => {
                // The invoice exists at the provider; keep it on record so a
                // payment to it is reconciled rather than lost.
                let mut state = slot.lock().await;
                dispatch(
                    &self.reducer,
                    &mut state,
                    IntentAction::Supersede { by: intent.id.clone() },
                    &self.env,
                )
                .await;
                return Err(err.into());
            },
        };

        if let Some(previous) = previous {
            self.supersede(&previous, &intent.id).await;
        }

        crate::metrics::record_intent_opened(IntentKind::Purchase.as_str());
        tracing::info!(
            %user,
            intent = %intent.id,
            amount = %intent.expected_amount,
            currency = %intent.currency,
            "Purchase intent opened"
        );
        Ok(intent)
    }

    /// Open a balance top-up intent.
    ///
    /// # Errors
    ///
    /// [`IntentError::BelowMinimum`] below the configured minimum refill (no
    /// gateway call is made) or the gateway minimum; [`IntentError::Gateway`]
    /// once retries are exhausted.
    #[tracing::instrument(skip(self))]
    pub async fn open_refill_intent(
        &self,
        user: UserId,
        amount: Money,
        currency: Currency,
    ) -> Result<PaymentIntent, IntentError> {
        if amount < self.min_refill {
            return Err(IntentError::BelowMinimum {
                amount,
                minimum: self.min_refill,
            });
        }

        let request = InvoiceRequest {
            order_ref: format!("refill-{user}"),
            amount,
            currency,
            description: "Balance top-up".to_string(),
        };
        let invoice = self
            .request_invoice(request)
            .await
            .map_err(|err| self.gateway_failed(user, None, amount, err))?;

        let intent = self.new_intent(invoice, IntentKind::Refill, user, None);
        self.register(intent.clone())?;

        crate::metrics::record_intent_opened(IntentKind::Refill.as_str());
        tracing::info!(%user, intent = %intent.id, amount = %amount, "Refill intent opened");
        Ok(intent)
    }

    fn register(&self, intent: PaymentIntent) -> Result<IntentSlot, IntentError> {
        self.intents.insert(intent).inspect_err(|err| {
            crate::metrics::record_gateway_failure("duplicate_intent");
            tracing::error!(error = %err, "Gateway reissued an intent id");
        })
    }

    async fn supersede(&self, previous: &IntentId, by: &IntentId) {
        let Some(slot) = self.intents.slot(previous) else {
            return;
        };
        let mut state = slot.lock().await;
        dispatch(
            &self.reducer,
            &mut state,
            IntentAction::Supersede { by: by.clone() },
            &self.env,
        )
        .await;
        tracing::info!(intent = %previous, by = %by, status = %state.intent.status, "Previous intent voided");
    }

    /// Expire every pending intent whose quote window ended at or before
    /// `now`, releasing the baskets of purchase intents. Returns the ids.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Vec<IntentId> {
        let mut expired = Vec::new();
        for slot in self.intents.slots() {
            let mut state = slot.lock().await;
            if !state.intent.status.is_pending() || !state.intent.is_past_deadline(now) {
                continue;
            }
            dispatch(&self.reducer, &mut state, IntentAction::Expire, &self.env).await;
            tracing::info!(intent = %state.intent.id, owner = %state.intent.owner, "Intent expired");
            expired.push(state.intent.id.clone());
        }
        expired
    }

    /// Intent by id
    pub async fn intent(&self, id: &IntentId) -> Option<PaymentIntent> {
        self.intents.get(id).await
    }
}
