//! Settlement side effects against the in-memory stores.

use crate::aggregates::basket::{BasketAggregate, FulfillGuard};
use crate::aggregates::intent::{Fulfillment, PaymentIntent};
use crate::aggregates::ledger::{BalanceLedger, LedgerReason, LedgerRef};
use crate::discount::{DiscountBook, QuoteLine};
use crate::error::FulfillmentError;
use crate::purchases::PurchaseLog;
use crate::types::{Money, UnitId};
use futures::future::BoxFuture;
use std::sync::Arc;
use stockpay_core::environment::Clock;

/// Price paid per unit, from the quoted lines
pub(crate) fn line_prices(lines: &[QuoteLine]) -> impl Fn(UnitId) -> Option<Money> + '_ {
    move |unit| lines.iter().find(|line| line.unit == unit).map(|line| line.net)
}

/// [`Fulfillment`] over the basket aggregate, ledger, discount book and
/// purchase log
#[derive(Clone)]
pub struct StoreFulfillment {
    baskets: Arc<BasketAggregate>,
    ledger: Arc<BalanceLedger>,
    discounts: Arc<DiscountBook>,
    purchases: Arc<PurchaseLog>,
    clock: Arc<dyn Clock>,
}

impl StoreFulfillment {
    /// Creates the fulfillment adapter
    #[must_use]
    pub fn new(
        baskets: Arc<BasketAggregate>,
        ledger: Arc<BalanceLedger>,
        discounts: Arc<DiscountBook>,
        purchases: Arc<PurchaseLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            baskets,
            ledger,
            discounts,
            purchases,
            clock,
        }
    }

    fn complete_purchase(&self, intent: &PaymentIntent) -> Result<(), FulfillmentError> {
        let terms = intent
            .checkout
            .as_ref()
            .ok_or_else(|| FulfillmentError::MissingCheckout(intent.id.clone()))?;
        let now = self.clock.now();

        // Nothing may be committed unless the excess credit will go through.
        let excess = intent.excess();
        if !excess.is_zero() {
            self.ledger.check_credit(intent.owner, excess)?;
        }

        let fulfilled = self
            .baskets
            .fulfill(intent.owner, &FulfillGuard::Intent(intent.id.clone()))?;
        crate::metrics::record_units_sold(fulfilled.units.len());

        if !excess.is_zero() {
            self.ledger.credit(
                intent.owner,
                excess,
                LedgerReason::Overpayment,
                LedgerRef::Intent(intent.id.clone()),
                now,
            )?;
        }

        self.purchases
            .record_sale(intent.owner, &fulfilled.units, line_prices(&terms.lines), now);
        if let Some(code) = &terms.discount_code {
            self.discounts.redeem(code);
        }

        tracing::info!(
            intent = %intent.id,
            user = %intent.owner,
            units = fulfilled.units.len(),
            excess = %excess,
            "Purchase fulfilled"
        );
        Ok(())
    }
}

impl Fulfillment for StoreFulfillment {
    fn fulfill_purchase(&self, intent: PaymentIntent) -> BoxFuture<'static, Result<(), FulfillmentError>> {
        let this = self.clone();
        Box::pin(async move { this.complete_purchase(&intent) })
    }

    fn credit(
        &self,
        intent: PaymentIntent,
        amount: Money,
        reason: LedgerReason,
    ) -> BoxFuture<'static, Result<(), FulfillmentError>> {
        let ledger = Arc::clone(&self.ledger);
        let clock = Arc::clone(&self.clock);
        Box::pin(async move {
            ledger.credit(
                intent.owner,
                amount,
                reason,
                LedgerRef::Intent(intent.id),
                clock.now(),
            )?;
            Ok(())
        })
    }

    fn release_checkout(&self, intent: PaymentIntent) -> BoxFuture<'static, ()> {
        let baskets = Arc::clone(&self.baskets);
        Box::pin(async move {
            baskets.release_checkout(intent.owner, &intent.id);
        })
    }
}
