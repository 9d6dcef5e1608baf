//! Application layer - wires the aggregates together.
//!
//! - [`PaymentIntentManager`]: opens and expires payment intents
//! - [`SettlementProcessor`]: applies provider notifications exactly once
//! - [`StoreFulfillment`]: settlement side effects against the stores
//! - [`Storefront`]: one handle over everything, plus balance checkout and
//!   the query surface used by front-ends

mod fulfillment;
mod intents;
mod settlement;

pub use fulfillment::StoreFulfillment;
pub use intents::{IntentSlot, IntentStore, PaymentIntentManager};
pub use settlement::{Ack, ReconciliationItem, ReconciliationLog, ReconciliationReason, SettlementProcessor};

use crate::aggregates::basket::{BasketAggregate, BasketView, FulfillGuard};
use crate::aggregates::intent::{IntentEnvironment, IntentStatus, PaymentIntent};
use crate::aggregates::inventory::{InventoryStore, StockLevels};
use crate::aggregates::ledger::{BalanceLedger, LedgerEntry, LedgerReason, LedgerRef, Posting};
use crate::config::Config;
use crate::discount::DiscountBook;
use crate::error::{BasketError, CheckoutError};
use crate::payment_gateway::PaymentGateway;
use crate::purchases::{CustomerTier, PurchaseLog, PurchaseRecord};
use crate::runtime::ReservationReaper;
use crate::types::{BasketId, IntentId, Money, UnitId, UserId};
use std::sync::Arc;
use stockpay_core::environment::Clock;
use uuid::Uuid;

/// Result of a balance-funded checkout
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    /// Basket bought
    pub basket: BasketId,
    /// Units now Sold
    pub units: Vec<UnitId>,
    /// Amount debited
    pub total: Money,
    /// Balance afterwards
    pub balance: Money,
}

/// The whole engine behind one handle
pub struct Storefront {
    /// Unit availability
    pub inventory: Arc<InventoryStore>,
    /// Per-user baskets
    pub baskets: Arc<BasketAggregate>,
    /// Discount codes and reseller rates
    pub discounts: Arc<DiscountBook>,
    /// User balances
    pub ledger: Arc<BalanceLedger>,
    /// Sold units per user
    pub purchases: Arc<PurchaseLog>,
    /// Intent creation and expiry
    pub intents: Arc<PaymentIntentManager>,
    /// Provider notifications
    pub settlement: Arc<SettlementProcessor>,
    clock: Arc<dyn Clock>,
}

impl Storefront {
    /// Build every component from `config`.
    #[must_use]
    pub fn new(config: &Config, gateway: Arc<dyn PaymentGateway>, clock: Arc<dyn Clock>) -> Self {
        let inventory = Arc::new(InventoryStore::new());
        let discounts = Arc::new(DiscountBook::new());
        let ledger = Arc::new(BalanceLedger::new());
        let purchases = Arc::new(PurchaseLog::new());
        let baskets = Arc::new(BasketAggregate::new(
            Arc::clone(&inventory),
            Arc::clone(&discounts),
            Arc::clone(&clock),
            config.engine.basket_ttl(),
        ));

        let fulfillment = StoreFulfillment::new(
            Arc::clone(&baskets),
            Arc::clone(&ledger),
            Arc::clone(&discounts),
            Arc::clone(&purchases),
            Arc::clone(&clock),
        );
        let env = IntentEnvironment::new(Arc::clone(&clock), Arc::new(fulfillment));

        let store = Arc::new(IntentStore::new());
        let intents = Arc::new(PaymentIntentManager::new(
            Arc::clone(&store),
            Arc::clone(&baskets),
            gateway,
            env.clone(),
            &config.engine,
            config.gateway.retry_policy(),
        ));
        let settlement = Arc::new(SettlementProcessor::new(
            store,
            env,
            config.engine.dedup_window(),
        ));

        tracing::info!(
            basket_ttl_secs = config.engine.basket_ttl_secs,
            quote_window_secs = config.engine.quote_window_secs,
            "Storefront initialised"
        );

        Self {
            inventory,
            baskets,
            discounts,
            ledger,
            purchases,
            intents,
            settlement,
            clock,
        }
    }

    /// Background sweeper over this storefront's state
    #[must_use]
    pub fn reaper(&self) -> ReservationReaper {
        ReservationReaper::new(
            Arc::clone(&self.inventory),
            Arc::clone(&self.baskets),
            Arc::clone(&self.intents),
            Arc::clone(&self.settlement),
            Arc::clone(&self.clock),
        )
    }

    /// Pay for the live basket from the user's balance.
    ///
    /// The debit, unit commit and basket deletion either all happen or the
    /// debit is refunded with reason `purchase_refund`.
    ///
    /// # Errors
    ///
    /// - [`CheckoutError::Basket`] if the basket is empty, expired, awaiting
    ///   a payment intent, or changed while checking out
    /// - [`CheckoutError::Ledger`] if the balance is short
    #[tracing::instrument(skip(self))]
    pub fn checkout_with_balance(&self, user: UserId) -> Result<Receipt, CheckoutError> {
        let snapshot = self.baskets.prepare_checkout(user)?;
        if let Some(intent) = snapshot.pending {
            return Err(BasketError::CheckoutPending { intent }.into());
        }

        let now = self.clock.now();
        let total = snapshot.quote.total;
        let reference = LedgerRef::Checkout {
            basket: snapshot.basket,
            attempt: Uuid::new_v4(),
        };
        let debited = !total.is_zero()
            && matches!(
                self.ledger
                    .debit(user, total, LedgerReason::Purchase, reference.clone(), now)?,
                Posting::Applied { .. }
            );

        let guard = FulfillGuard::Revision {
            basket: snapshot.basket,
            revision: snapshot.revision,
        };
        let fulfilled = match self.baskets.fulfill(user, &guard) {
            Ok(fulfilled) => fulfilled,
            Err(err) => {
                if debited {
                    if let Err(refund) =
                        self.ledger
                            .credit(user, total, LedgerReason::PurchaseRefund, reference, now)
                    {
                        tracing::error!(%user, error = %refund, "Balance checkout refund failed");
                    }
                }
                tracing::warn!(%user, error = %err, "Balance checkout rolled back");
                return Err(err.into());
            },
        };

        crate::metrics::record_units_sold(fulfilled.units.len());
        self.purchases.record_sale(
            user,
            &fulfilled.units,
            fulfillment::line_prices(&snapshot.quote.lines),
            now,
        );
        if let Some(code) = &snapshot.quote.code {
            self.discounts.redeem(code);
        }

        let balance = self.ledger.balance(user);
        tracing::info!(%user, basket = %snapshot.basket, total = %total, balance = %balance, "Balance checkout completed");
        Ok(Receipt {
            basket: snapshot.basket,
            units: fulfilled.units.iter().map(|unit| unit.id).collect(),
            total,
            balance,
        })
    }

    // ========== Queries ==========

    /// Current balance
    #[must_use]
    pub fn balance(&self, user: UserId) -> Money {
        self.ledger.balance(user)
    }

    /// Ledger history, oldest first
    #[must_use]
    pub fn ledger_entries(&self, user: UserId) -> Vec<LedgerEntry> {
        self.ledger.entries_for(user)
    }

    /// Rendered basket, if the user has a live one
    #[must_use]
    pub fn basket(&self, user: UserId) -> Option<BasketView> {
        self.baskets.view(user)
    }

    /// Intent by id
    pub async fn intent(&self, id: &IntentId) -> Option<PaymentIntent> {
        self.intents.intent(id).await
    }

    /// Intent status by id
    pub async fn intent_status(&self, id: &IntentId) -> Option<IntentStatus> {
        self.intent(id).await.map(|intent| intent.status)
    }

    /// Purchase history
    #[must_use]
    pub fn purchases(&self, user: UserId) -> Vec<PurchaseRecord> {
        self.purchases.history(user)
    }

    /// Loyalty tier
    #[must_use]
    pub fn tier(&self, user: UserId) -> CustomerTier {
        self.purchases.tier(user)
    }

    /// Available units per location and product type
    #[must_use]
    pub fn stock_levels(&self) -> StockLevels {
        self.inventory.stock_levels()
    }

    /// Units currently sellable
    #[must_use]
    pub fn available_count(&self) -> usize {
        self.inventory.available_count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::discount::DiscountCode;
    use crate::error::LedgerError;
    use crate::payment_gateway::MockPaymentGateway;
    use crate::types::{Percentage, Unit, UnitStatus};
    use stockpay_testing::ManualClock;

    fn storefront() -> Storefront {
        Storefront::new(
            &Config::default(),
            MockPaymentGateway::shared(),
            Arc::new(ManualClock::default()),
        )
    }

    fn fund(shop: &Storefront, user: UserId, major: u64) {
        shop.ledger
            .credit(
                user,
                Money::from_major(major),
                LedgerReason::Refill,
                LedgerRef::Intent(IntentId::new(format!("np_seed_{user}"))),
                shop.clock.now(),
            )
            .unwrap();
    }

    #[test]
    fn balance_checkout_debits_and_sells() {
        let shop = storefront();
        let user = UserId::new();
        fund(&shop, user, 100);
        shop.discounts.upsert_code(
            DiscountCode::percentage("SAVE20", Percentage::from_percent(20))
                .with_min_order(Money::from_major(50))
                .with_max_uses(1),
        );
        let unit = shop.inventory.stock(Unit::new("oslo", "flower", Money::from_major(100))).unwrap();
        shop.baskets.add_item(user, unit).unwrap();
        shop.baskets.apply_code(user, "SAVE20").unwrap();

        let receipt = shop.checkout_with_balance(user).unwrap();

        assert_eq!(receipt.total, Money::from_major(80));
        assert_eq!(receipt.balance, Money::from_major(20));
        assert_eq!(shop.inventory.get(unit).unwrap().status, UnitStatus::Sold);
        assert!(shop.basket(user).is_none());
        assert_eq!(shop.purchases(user).len(), 1);
        assert_eq!(shop.discounts.lookup("save20").unwrap().uses_count, 1);
    }

    #[test]
    fn short_balance_leaves_basket_intact() {
        let shop = storefront();
        let user = UserId::new();
        fund(&shop, user, 10);
        let unit = shop.inventory.stock(Unit::new("oslo", "flower", Money::from_major(30))).unwrap();
        shop.baskets.add_item(user, unit).unwrap();

        let err = shop.checkout_with_balance(user).unwrap_err();

        assert!(matches!(
            err,
            CheckoutError::Ledger(LedgerError::InsufficientBalance { .. })
        ));
        assert_eq!(shop.balance(user), Money::from_major(10));
        assert_eq!(shop.inventory.get(unit).unwrap().reserved_by(), Some(user));
    }

    #[test]
    fn free_basket_needs_no_balance() {
        let shop = storefront();
        let user = UserId::new();
        shop.discounts
            .upsert_code(DiscountCode::percentage("FREE", Percentage::from_percent(100)));
        let unit = shop.inventory.stock(Unit::new("oslo", "flower", Money::from_major(30))).unwrap();
        shop.baskets.add_item(user, unit).unwrap();
        shop.baskets.apply_code(user, "free").unwrap();

        let receipt = shop.checkout_with_balance(user).unwrap();

        assert_eq!(receipt.total, Money::ZERO);
        assert!(shop.ledger_entries(user).is_empty());
    }

    #[test]
    fn empty_basket_cannot_check_out() {
        let shop = storefront();
        assert_eq!(
            shop.checkout_with_balance(UserId::new()).unwrap_err(),
            CheckoutError::Basket(BasketError::EmptyBasket)
        );
    }
}
