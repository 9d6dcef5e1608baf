//! Basket aggregate.
//!
//! One live basket per user: reserved units, an optional discount code and a
//! single `expires_at` that also bounds every unit reservation it holds. Each
//! user's basket sits in its own slot mutex; basket locks are always taken
//! before unit locks.
//!
//! Expiry is lazy as well as reaped: every operation first checks
//! `expires_at` and, if it has passed, releases the basket before doing
//! anything else. Editing is refused while a payment intent holds the basket.

use crate::aggregates::inventory::InventoryStore;
use crate::discount::{DiscountBook, DiscountCode, DiscountEngine, PricedItem, Quote};
use crate::error::{BasketError, InventoryError};
use crate::types::{BasketId, IntentId, Money, Unit, UnitId, UserId, deadline_after};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use stockpay_core::environment::Clock;

/// Intent currently allowed to settle the basket
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutHold {
    /// Actionable intent
    pub intent: IntentId,
    /// End of its quote window
    pub deadline: DateTime<Utc>,
}

/// A user's in-progress basket
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Basket {
    /// Identity; a fresh id per basket lifetime
    pub id: BasketId,
    /// Owner
    pub owner: UserId,
    /// Reserved units in the order they were added
    pub items: Vec<UnitId>,
    /// Normalised discount code
    pub discount_code: Option<String>,
    /// Opened at
    pub created_at: DateTime<Utc>,
    /// Released at (unless checked out first)
    pub expires_at: DateTime<Utc>,
    /// Bumped on every edit; a quote is only valid for the revision it saw
    pub revision: u64,
    /// Pending payment, if any
    pub checkout: Option<CheckoutHold>,
}

impl Basket {
    fn open(owner: UserId, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            id: BasketId::new(),
            owner,
            items: Vec::new(),
            discount_code: None,
            created_at: now,
            expires_at,
            revision: 0,
            checkout: None,
        }
    }

    /// Expired once `now` reaches `expires_at`
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Intent holding the basket, if any
    #[must_use]
    pub fn pending_intent(&self) -> Option<&IntentId> {
        self.checkout.as_ref().map(|hold| &hold.intent)
    }

    fn ensure_editable(&self) -> Result<(), BasketError> {
        match &self.checkout {
            Some(hold) => Err(BasketError::CheckoutPending {
                intent: hold.intent.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Everything needed to open a payment for a basket
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckoutSnapshot {
    /// Basket quoted
    pub basket: BasketId,
    /// Revision quoted
    pub revision: u64,
    /// Units quoted
    pub items: Vec<UnitId>,
    /// Priced result
    pub quote: Quote,
    /// Intent already holding the basket, if any
    pub pending: Option<IntentId>,
}

/// Which checkout is allowed to turn the basket into a sale
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FulfillGuard {
    /// The intent currently holding the basket
    Intent(IntentId),
    /// A direct (balance) checkout of exactly this basket revision
    Revision {
        /// Basket quoted
        basket: BasketId,
        /// Revision quoted
        revision: u64,
    },
}

/// A basket turned into a sale
#[derive(Clone, Debug)]
pub struct Fulfilled {
    /// The basket as it was when deleted
    pub basket: Basket,
    /// Units now Sold
    pub units: Vec<Unit>,
}

/// One basket removed by the reaper
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReapedBasket {
    /// Owner
    pub owner: UserId,
    /// Basket removed
    pub basket: BasketId,
    /// Units that went back on sale
    pub released: usize,
}

/// Line of a rendered basket
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasketLine {
    /// Unit
    pub unit: UnitId,
    /// Location key
    pub location_key: String,
    /// Product type
    pub product_type: String,
    /// List price
    pub price: Money,
}

/// Read model for UIs
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasketView {
    /// Basket
    pub id: BasketId,
    /// Lines
    pub lines: Vec<BasketLine>,
    /// Applied code
    pub discount_code: Option<String>,
    /// Expiry
    pub expires_at: DateTime<Utc>,
    /// Intent awaiting payment
    pub pending_intent: Option<IntentId>,
}

type Slot = Arc<Mutex<Option<Basket>>>;

fn lock(slot: &Slot) -> MutexGuard<'_, Option<Basket>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-user baskets over the shared inventory
pub struct BasketAggregate {
    slots: RwLock<HashMap<UserId, Slot>>,
    inventory: Arc<InventoryStore>,
    discounts: Arc<DiscountBook>,
    clock: Arc<dyn Clock>,
    ttl: TimeDelta,
}

impl BasketAggregate {
    /// Creates the aggregate
    #[must_use]
    pub fn new(
        inventory: Arc<InventoryStore>,
        discounts: Arc<DiscountBook>,
        clock: Arc<dyn Clock>,
        ttl: TimeDelta,
    ) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            inventory,
            discounts,
            clock,
            ttl,
        }
    }

    fn slot(&self, user: UserId) -> Slot {
        if let Some(slot) = self.existing_slot(user) {
            return slot;
        }
        Arc::clone(
            self.slots
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(user)
                .or_default(),
        )
    }

    fn existing_slot(&self, user: UserId) -> Option<Slot> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user)
            .cloned()
    }

    fn release_units(&self, basket: &Basket, reason: &'static str) -> usize {
        let released = basket
            .items
            .iter()
            .filter(|unit| self.inventory.release_for(**unit, basket.owner))
            .count();
        crate::metrics::record_units_released(reason, released);
        released
    }

    /// Drop the basket in `current` if it has expired. Returns what was dropped.
    fn settle_expiry(&self, current: &mut Option<Basket>, now: DateTime<Utc>) -> Option<ReapedBasket> {
        if !current.as_ref().is_some_and(|basket| basket.is_expired(now)) {
            return None;
        }
        let basket = current.take()?;
        let released = self.release_units(&basket, "expired");
        tracing::info!(
            user = %basket.owner,
            basket = %basket.id,
            released,
            "Basket expired"
        );
        Some(ReapedBasket {
            owner: basket.owner,
            basket: basket.id,
            released,
        })
    }

    fn quote(
        &self,
        basket: &Basket,
        code: Option<&DiscountCode>,
        now: DateTime<Utc>,
    ) -> Result<Quote, BasketError> {
        let items = basket
            .items
            .iter()
            .map(|id| {
                self.inventory
                    .get(*id)
                    .filter(|unit| unit.reserved_by() == Some(basket.owner))
                    .map(|unit| PricedItem {
                        unit: unit.id,
                        product_type: unit.product_type,
                        price: unit.price,
                    })
                    .ok_or(BasketError::ItemUnavailable(*id))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let reseller = self.discounts.reseller_rates(basket.owner);
        Ok(DiscountEngine::compute(&items, code, reseller.as_ref(), now)?)
    }

    /// Reserve `unit` into the user's basket, opening one if needed.
    ///
    /// Extends the basket (and every unit it holds) to `now + TTL`.
    ///
    /// # Errors
    ///
    /// [`BasketError::ItemUnavailable`] if the unit is taken,
    /// [`BasketError::CheckoutPending`] while a payment holds the basket.
    pub fn add_item(&self, user: UserId, unit: UnitId) -> Result<Basket, BasketError> {
        let now = self.clock.now();
        let slot = self.slot(user);
        let mut current = lock(&slot);
        self.settle_expiry(&mut current, now);
        if let Some(basket) = current.as_ref() {
            basket.ensure_editable()?;
        }

        let expires_at = deadline_after(now, self.ttl);
        self.inventory
            .reserve(unit, user, expires_at)
            .map_err(|err| match err {
                InventoryError::NotAvailable(id) => BasketError::ItemUnavailable(id),
                other => BasketError::Inventory(other),
            })?;

        let basket = current.get_or_insert_with(|| Basket::open(user, now, expires_at));
        basket.items.push(unit);
        basket.expires_at = expires_at;
        basket.revision += 1;
        self.inventory.refresh_hold(&basket.items, user, expires_at);

        tracing::info!(%user, %unit, basket = %basket.id, items = basket.items.len(), "Item added to basket");
        Ok(basket.clone())
    }

    /// Release `unit` and drop it from the basket; no-op if absent.
    ///
    /// # Errors
    ///
    /// [`BasketError::CheckoutPending`] while a payment holds the basket.
    pub fn remove_item(&self, user: UserId, unit: UnitId) -> Result<Option<Basket>, BasketError> {
        let Some(slot) = self.existing_slot(user) else {
            return Ok(None);
        };
        let mut current = lock(&slot);
        self.settle_expiry(&mut current, self.clock.now());
        let Some(basket) = current.as_mut() else {
            return Ok(None);
        };
        basket.ensure_editable()?;

        if let Some(position) = basket.items.iter().position(|id| *id == unit) {
            basket.items.remove(position);
            basket.revision += 1;
            if self.inventory.release_for(unit, user) {
                crate::metrics::record_units_released("removed", 1);
            }
            tracing::info!(%user, %unit, "Item removed from basket");
        }
        Ok(Some(basket.clone()))
    }

    /// Release every unit and delete the basket. Returns the released ids.
    ///
    /// # Errors
    ///
    /// [`BasketError::CheckoutPending`] while a payment holds the basket; the
    /// intent must expire or fail first.
    pub fn clear(&self, user: UserId) -> Result<Vec<UnitId>, BasketError> {
        let Some(slot) = self.existing_slot(user) else {
            return Ok(Vec::new());
        };
        let mut current = lock(&slot);
        self.settle_expiry(&mut current, self.clock.now());
        if let Some(basket) = current.as_ref() {
            basket.ensure_editable()?;
        }
        let Some(basket) = current.take() else {
            return Ok(Vec::new());
        };
        self.release_units(&basket, "cleared");
        tracing::info!(%user, basket = %basket.id, "Basket cleared");
        Ok(basket.items)
    }

    /// Validate `raw` against the basket and attach it.
    ///
    /// # Errors
    ///
    /// [`BasketError::EmptyBasket`], [`BasketError::CheckoutPending`], or
    /// [`BasketError::Discount`] when the code is refused.
    pub fn apply_code(&self, user: UserId, raw: &str) -> Result<Quote, BasketError> {
        let slot = self.existing_slot(user).ok_or(BasketError::EmptyBasket)?;
        let now = self.clock.now();
        let mut current = lock(&slot);
        self.settle_expiry(&mut current, now);
        let basket = current
            .as_mut()
            .filter(|basket| !basket.items.is_empty())
            .ok_or(BasketError::EmptyBasket)?;
        basket.ensure_editable()?;

        let code = self.discounts.resolve(raw)?;
        let quote = self.quote(basket, Some(&code), now)?;
        basket.discount_code = Some(code.code);
        basket.revision += 1;
        Ok(quote)
    }

    /// Detach the discount code.
    ///
    /// # Errors
    ///
    /// [`BasketError::CheckoutPending`] while a payment holds the basket.
    pub fn remove_code(&self, user: UserId) -> Result<(), BasketError> {
        let Some(slot) = self.existing_slot(user) else {
            return Ok(());
        };
        let mut current = lock(&slot);
        self.settle_expiry(&mut current, self.clock.now());
        if let Some(basket) = current.as_mut() {
            basket.ensure_editable()?;
            if basket.discount_code.take().is_some() {
                basket.revision += 1;
            }
        }
        Ok(())
    }

    /// Payable total for the live item set.
    ///
    /// # Errors
    ///
    /// [`BasketError::EmptyBasket`] if there is nothing (left) to buy, or the
    /// attached code is no longer valid.
    pub fn checkout_total(&self, user: UserId) -> Result<Quote, BasketError> {
        self.prepare_checkout(user).map(|snapshot| snapshot.quote)
    }

    /// Quote the basket and capture the revision the quote is valid for.
    ///
    /// # Errors
    ///
    /// Same as [`checkout_total`](Self::checkout_total).
    pub fn prepare_checkout(&self, user: UserId) -> Result<CheckoutSnapshot, BasketError> {
        let slot = self.existing_slot(user).ok_or(BasketError::EmptyBasket)?;
        let now = self.clock.now();
        let mut current = lock(&slot);
        self.settle_expiry(&mut current, now);
        let basket = current
            .as_ref()
            .filter(|basket| !basket.items.is_empty())
            .ok_or(BasketError::EmptyBasket)?;

        let code = basket
            .discount_code
            .as_deref()
            .map(|raw| self.discounts.resolve(raw))
            .transpose()?;
        let quote = self.quote(basket, code.as_ref(), now)?;

        Ok(CheckoutSnapshot {
            basket: basket.id,
            revision: basket.revision,
            items: basket.items.clone(),
            quote,
            pending: basket.pending_intent().cloned(),
        })
    }

    /// Make `intent` the only intent allowed to settle the basket.
    ///
    /// Extends the basket to the intent's deadline. Returns the intent that
    /// held the basket before, which the caller must void.
    ///
    /// # Errors
    ///
    /// [`BasketError::Changed`] if the basket was edited, replaced or expired
    /// since `revision` was quoted.
    pub fn begin_checkout(
        &self,
        user: UserId,
        basket_id: BasketId,
        revision: u64,
        intent: IntentId,
        deadline: DateTime<Utc>,
    ) -> Result<Option<IntentId>, BasketError> {
        let changed = BasketError::Changed { basket: basket_id };
        let slot = self.existing_slot(user).ok_or_else(|| changed.clone())?;
        let mut current = lock(&slot);
        self.settle_expiry(&mut current, self.clock.now());
        let basket = current
            .as_mut()
            .filter(|basket| basket.id == basket_id && basket.revision == revision)
            .ok_or(changed)?;

        let previous = basket
            .checkout
            .replace(CheckoutHold {
                intent: intent.clone(),
                deadline,
            })
            .map(|hold| hold.intent);
        if deadline > basket.expires_at {
            basket.expires_at = deadline;
            self.inventory.refresh_hold(&basket.items, user, deadline);
        }

        tracing::info!(%user, basket = %basket_id, %intent, superseded = ?previous, "Basket checkout started");
        Ok(previous)
    }

    /// Release the basket held by `intent` (payment failed, partial or expired).
    ///
    /// No-op if another intent holds the basket or it is already gone.
    pub fn release_checkout(&self, user: UserId, intent: &IntentId) -> Vec<UnitId> {
        let Some(slot) = self.existing_slot(user) else {
            return Vec::new();
        };
        let mut current = lock(&slot);
        if current.as_ref().and_then(Basket::pending_intent) != Some(intent) {
            self.settle_expiry(&mut current, self.clock.now());
            return Vec::new();
        }
        let Some(basket) = current.take() else {
            return Vec::new();
        };
        self.release_units(&basket, "checkout_released");
        tracing::info!(%user, basket = %basket.id, %intent, "Basket released after unsuccessful payment");
        basket.items
    }

    /// Release a quoted basket whose checkout could not be opened.
    ///
    /// No-op unless the live basket is still exactly the quoted revision and
    /// no intent holds it.
    pub fn release_quoted(&self, user: UserId, basket_id: BasketId, revision: u64) -> Vec<UnitId> {
        let Some(slot) = self.existing_slot(user) else {
            return Vec::new();
        };
        let mut current = lock(&slot);
        let quoted = current.as_ref().is_some_and(|basket| {
            basket.id == basket_id && basket.revision == revision && basket.checkout.is_none()
        });
        if !quoted {
            return Vec::new();
        }
        let Some(basket) = current.take() else {
            return Vec::new();
        };
        self.release_units(&basket, "checkout_failed");
        tracing::warn!(%user, basket = %basket_id, "Basket released after failed checkout");
        basket.items
    }

    /// Commit every unit and delete the basket, atomically with respect to
    /// the reaper and other basket operations.
    ///
    /// # Errors
    ///
    /// [`BasketError::NoCheckout`] if `guard` names an intent that does not
    /// hold the basket, [`BasketError::Changed`] / [`BasketError::EmptyBasket`]
    /// / [`BasketError::CheckoutPending`] for a stale direct checkout, or
    /// [`BasketError::Inventory`] if a unit cannot be committed.
    pub fn fulfill(&self, user: UserId, guard: &FulfillGuard) -> Result<Fulfilled, BasketError> {
        let missing = || match guard {
            FulfillGuard::Intent(intent) => BasketError::NoCheckout {
                intent: intent.clone(),
                user,
            },
            FulfillGuard::Revision { basket, .. } => BasketError::Changed { basket: *basket },
        };

        let slot = self.existing_slot(user).ok_or_else(missing)?;
        let mut current = lock(&slot);

        match guard {
            FulfillGuard::Intent(intent) => {
                let holds = current.as_ref().and_then(Basket::pending_intent) == Some(intent);
                if !holds {
                    return Err(missing());
                }
            },
            FulfillGuard::Revision { basket, revision } => {
                self.settle_expiry(&mut current, self.clock.now());
                let live = current
                    .as_ref()
                    .filter(|live| live.id == *basket && live.revision == *revision)
                    .ok_or_else(missing)?;
                live.ensure_editable()?;
                if live.items.is_empty() {
                    return Err(BasketError::EmptyBasket);
                }
            },
        }

        let basket = current.take().ok_or_else(missing)?;
        match self.inventory.commit_all(&basket.items, user) {
            Ok(units) => {
                tracing::info!(%user, basket = %basket.id, units = units.len(), "Basket fulfilled");
                Ok(Fulfilled { basket, units })
            },
            Err(err) => {
                *current = Some(basket);
                Err(err.into())
            },
        }
    }

    /// Release and delete every basket whose `expires_at` has passed.
    pub fn reap_expired(&self, now: DateTime<Utc>) -> Vec<ReapedBasket> {
        let slots: Vec<Slot> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let reaped: Vec<ReapedBasket> = slots
            .iter()
            .filter_map(|slot| self.settle_expiry(&mut lock(slot), now))
            .collect();
        drop(slots);

        self.prune_idle_slots();
        reaped
    }

    /// Forget users with no basket. A slot another caller still holds a
    /// handle to is kept, so a basket can never land in an orphaned slot.
    fn prune_idle_slots(&self) -> usize {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let before = slots.len();
        slots.retain(|_, slot| {
            Arc::strong_count(slot) > 1 || !slot.try_lock().is_ok_and(|current| current.is_none())
        });
        let pruned = before - slots.len();
        if pruned > 0 {
            tracing::debug!(pruned, "Idle basket slots pruned");
        }
        pruned
    }

    /// The live basket, after lazy expiry
    #[must_use]
    pub fn get(&self, user: UserId) -> Option<Basket> {
        let slot = self.existing_slot(user)?;
        let mut current = lock(&slot);
        self.settle_expiry(&mut current, self.clock.now());
        current.clone()
    }

    /// Render the live basket
    #[must_use]
    pub fn view(&self, user: UserId) -> Option<BasketView> {
        let basket = self.get(user)?;
        let lines = basket
            .items
            .iter()
            .filter_map(|id| self.inventory.get(*id))
            .map(|unit| BasketLine {
                unit: unit.id,
                location_key: unit.location_key,
                product_type: unit.product_type,
                price: unit.price,
            })
            .collect();
        Some(BasketView {
            id: basket.id,
            lines,
            discount_code: basket.discount_code,
            expires_at: basket.expires_at,
            pending_intent: basket.checkout.map(|hold| hold.intent),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::discount::DiscountCode;
    use crate::types::{Percentage, UnitStatus};
    use stockpay_testing::ManualClock;

    struct Fixture {
        clock: Arc<ManualClock>,
        inventory: Arc<InventoryStore>,
        discounts: Arc<DiscountBook>,
        baskets: BasketAggregate,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let inventory = Arc::new(InventoryStore::new());
        let discounts = Arc::new(DiscountBook::new());
        let baskets = BasketAggregate::new(
            Arc::clone(&inventory),
            Arc::clone(&discounts),
            clock.clone(),
            TimeDelta::minutes(15),
        );
        Fixture {
            clock,
            inventory,
            discounts,
            baskets,
        }
    }

    fn stock(fx: &Fixture, price: u64) -> UnitId {
        fx.inventory
            .stock(Unit::new("berlin", "flower", Money::from_major(price)))
            .unwrap()
    }

    #[test]
    fn adding_extends_expiry() {
        let fx = fixture();
        let user = UserId::new();
        let first = stock(&fx, 10);
        let second = stock(&fx, 20);

        let basket = fx.baskets.add_item(user, first).unwrap();
        let opened_until = basket.expires_at;

        fx.clock.advance(TimeDelta::minutes(10));
        let basket = fx.baskets.add_item(user, second).unwrap();

        assert_eq!(basket.items, vec![first, second]);
        assert_eq!(basket.expires_at, opened_until + TimeDelta::minutes(10));
        assert_eq!(
            fx.inventory.get(first).unwrap().reserved_until(),
            Some(basket.expires_at)
        );
    }

    #[test]
    fn unavailable_item_leaves_basket_unchanged() {
        let fx = fixture();
        let unit = stock(&fx, 10);
        fx.baskets.add_item(UserId::new(), unit).unwrap();

        let user = UserId::new();
        let err = fx.baskets.add_item(user, unit).unwrap_err();

        assert_eq!(err, BasketError::ItemUnavailable(unit));
        assert!(fx.baskets.get(user).is_none());
    }

    #[test]
    fn remove_and_clear_release_units() {
        let fx = fixture();
        let user = UserId::new();
        let a = stock(&fx, 10);
        let b = stock(&fx, 10);
        fx.baskets.add_item(user, a).unwrap();
        fx.baskets.add_item(user, b).unwrap();

        fx.baskets.remove_item(user, a).unwrap();
        assert!(fx.inventory.get(a).unwrap().is_available());
        assert!(fx.baskets.remove_item(user, a).unwrap().is_some());

        assert_eq!(fx.baskets.clear(user).unwrap(), vec![b]);
        assert!(fx.inventory.get(b).unwrap().is_available());
        assert!(fx.baskets.get(user).is_none());
    }

    #[test]
    fn checkout_total_applies_code() {
        let fx = fixture();
        let user = UserId::new();
        fx.discounts.upsert_code(
            DiscountCode::percentage("SAVE20", Percentage::from_percent(20))
                .with_min_order(Money::from_major(50)),
        );
        let unit = stock(&fx, 100);
        fx.baskets.add_item(user, unit).unwrap();

        fx.baskets.apply_code(user, "save20").unwrap();

        assert_eq!(fx.baskets.checkout_total(user).unwrap().total, Money::from_major(80));
    }

    #[test]
    fn expired_basket_reads_as_empty_before_the_reaper_runs() {
        let fx = fixture();
        let user = UserId::new();
        let unit = stock(&fx, 10);
        fx.baskets.add_item(user, unit).unwrap();

        fx.clock.advance(TimeDelta::minutes(16));

        assert_eq!(fx.baskets.checkout_total(user).unwrap_err(), BasketError::EmptyBasket);
        assert!(fx.inventory.get(unit).unwrap().is_available());
    }

    #[test]
    fn pending_checkout_blocks_edits() {
        let fx = fixture();
        let user = UserId::new();
        let unit = stock(&fx, 10);
        let basket = fx.baskets.add_item(user, unit).unwrap();
        let intent = IntentId::new("np_1");

        let previous = fx
            .baskets
            .begin_checkout(user, basket.id, basket.revision, intent.clone(), fx.clock.now() + TimeDelta::hours(2))
            .unwrap();
        assert!(previous.is_none());

        assert_eq!(
            fx.baskets.clear(user).unwrap_err(),
            BasketError::CheckoutPending { intent: intent.clone() }
        );
        assert!(matches!(
            fx.baskets.add_item(user, stock(&fx, 5)),
            Err(BasketError::CheckoutPending { .. })
        ));
    }

    #[test]
    fn begin_checkout_rejects_stale_revision() {
        let fx = fixture();
        let user = UserId::new();
        let basket = fx.baskets.add_item(user, stock(&fx, 10)).unwrap();
        fx.baskets.add_item(user, stock(&fx, 10)).unwrap();

        let err = fx
            .baskets
            .begin_checkout(user, basket.id, basket.revision, IntentId::new("np_2"), fx.clock.now())
            .unwrap_err();

        assert_eq!(err, BasketError::Changed { basket: basket.id });
    }

    #[test]
    fn fulfill_by_intent_sells_units_and_deletes_basket() {
        let fx = fixture();
        let user = UserId::new();
        let unit = stock(&fx, 10);
        let basket = fx.baskets.add_item(user, unit).unwrap();
        let intent = IntentId::new("np_3");
        fx.baskets
            .begin_checkout(user, basket.id, basket.revision, intent.clone(), fx.clock.now() + TimeDelta::hours(2))
            .unwrap();

        let wrong = fx.baskets.fulfill(user, &FulfillGuard::Intent(IntentId::new("np_other")));
        assert!(matches!(wrong, Err(BasketError::NoCheckout { .. })));

        let done = fx.baskets.fulfill(user, &FulfillGuard::Intent(intent)).unwrap();
        assert_eq!(done.units[0].status, UnitStatus::Sold);
        assert!(fx.baskets.get(user).is_none());
    }

    #[test]
    fn release_checkout_ignores_other_intents() {
        let fx = fixture();
        let user = UserId::new();
        let unit = stock(&fx, 10);
        let basket = fx.baskets.add_item(user, unit).unwrap();
        let intent = IntentId::new("np_4");
        fx.baskets
            .begin_checkout(user, basket.id, basket.revision, intent.clone(), fx.clock.now() + TimeDelta::hours(2))
            .unwrap();

        assert!(fx.baskets.release_checkout(user, &IntentId::new("np_old")).is_empty());
        assert_eq!(fx.baskets.release_checkout(user, &intent), vec![unit]);
        assert!(fx.inventory.get(unit).unwrap().is_available());
    }

    #[test]
    fn reaper_pass_releases_only_expired_baskets() {
        let fx = fixture();
        let stale_user = UserId::new();
        let fresh_user = UserId::new();
        let stale = stock(&fx, 10);
        let fresh = stock(&fx, 10);

        fx.baskets.add_item(stale_user, stale).unwrap();
        fx.clock.advance(TimeDelta::minutes(10));
        fx.baskets.add_item(fresh_user, fresh).unwrap();
        fx.clock.advance(TimeDelta::minutes(6));

        let reaped = fx.baskets.reap_expired(fx.clock.now());

        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].owner, stale_user);
        assert!(fx.inventory.get(stale).unwrap().is_available());
        assert_eq!(fx.inventory.get(fresh).unwrap().reserved_by(), Some(fresh_user));
    }

    #[test]
    fn reaper_pass_forgets_users_without_a_basket() {
        let fx = fixture();
        let cleared = UserId::new();
        let expired = UserId::new();
        let live = UserId::new();
        fx.baskets.add_item(cleared, stock(&fx, 10)).unwrap();
        fx.baskets.clear(cleared).unwrap();
        fx.baskets.add_item(expired, stock(&fx, 10)).unwrap();
        fx.clock.advance(TimeDelta::minutes(10));
        fx.baskets.add_item(live, stock(&fx, 10)).unwrap();
        fx.clock.advance(TimeDelta::minutes(6));

        let held = fx.baskets.existing_slot(cleared).unwrap();
        fx.baskets.reap_expired(fx.clock.now());
        assert_eq!(fx.baskets.slots.read().unwrap().len(), 2);

        drop(held);
        fx.baskets.reap_expired(fx.clock.now());
        let tracked: Vec<UserId> = fx.baskets.slots.read().unwrap().keys().copied().collect();
        assert_eq!(tracked, vec![live]);

        // A forgotten user starts over with a fresh slot.
        fx.baskets.add_item(cleared, stock(&fx, 10)).unwrap();
        assert_eq!(fx.baskets.get(cleared).unwrap().items.len(), 1);
    }
}
