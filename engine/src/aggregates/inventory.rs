//! Inventory store.
//!
//! The single source of truth for "is this unit sellable right now". Every unit
//! sits behind its own mutex, so reserve/release/commit on one unit serialize
//! while unrelated units never contend. The outer map lock is only held long
//! enough to clone a unit handle.
//!
//! Lifecycle: Available → Reserved → Sold, or Reserved → Available. Sold is
//! terminal; releasing a sold unit is a no-op, which is what lets a reaper pass
//! race a checkout safely.

use crate::error::InventoryError;
use crate::types::{Money, Unit, UnitId, UnitStatus, UserId};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// Proof of a successful reservation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reservation {
    /// Unit reserved
    pub unit: UnitId,
    /// Holder
    pub user: UserId,
    /// Lapses with the owning basket
    pub until: DateTime<Utc>,
    /// List price at reservation time
    pub price: Money,
}

/// Available units grouped by location and product type
pub type StockLevels = BTreeMap<(String, String), usize>;

type UnitHandle = Arc<Mutex<Unit>>;

fn lock(handle: &UnitHandle) -> MutexGuard<'_, Unit> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-unit locked inventory
#[derive(Debug, Default)]
pub struct InventoryStore {
    units: RwLock<HashMap<UnitId, UnitHandle>>,
}

impl InventoryStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, unit: UnitId) -> Option<UnitHandle> {
        self.units
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&unit)
            .cloned()
    }

    fn handles(&self) -> Vec<UnitHandle> {
        self.units
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Add a unit to stock.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::DuplicateUnit`] if the id is taken.
    pub fn stock(&self, unit: Unit) -> Result<UnitId, InventoryError> {
        let id = unit.id;
        let mut units = self.units.write().unwrap_or_else(PoisonError::into_inner);
        if units.contains_key(&id) {
            return Err(InventoryError::DuplicateUnit(id));
        }
        units.insert(id, Arc::new(Mutex::new(unit)));
        tracing::debug!(unit = %id, "Unit stocked");
        Ok(id)
    }

    /// Take an available unit out of stock.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::InvalidTransition`] if the unit is reserved
    /// or sold, [`InventoryError::UnknownUnit`] if it does not exist.
    pub fn withdraw(&self, unit: UnitId) -> Result<Unit, InventoryError> {
        let mut units = self.units.write().unwrap_or_else(PoisonError::into_inner);
        let handle = units.get(&unit).ok_or(InventoryError::UnknownUnit(unit))?;
        let snapshot = {
            let guard = lock(handle);
            if !guard.is_available() {
                return Err(InventoryError::InvalidTransition {
                    unit,
                    from: guard.status.label(),
                    to: "withdrawn",
                });
            }
            guard.clone()
        };
        units.remove(&unit);
        Ok(snapshot)
    }

    /// Reserve `unit` for `user` until `until`.
    ///
    /// Among concurrent callers for one unit exactly one succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::NotAvailable`] unless the unit is Available,
    /// [`InventoryError::UnknownUnit`] if it does not exist.
    pub fn reserve(
        &self,
        unit: UnitId,
        user: UserId,
        until: DateTime<Utc>,
    ) -> Result<Reservation, InventoryError> {
        let handle = self.handle(unit).ok_or(InventoryError::UnknownUnit(unit))?;
        let mut guard = lock(&handle);

        if !guard.is_available() {
            crate::metrics::record_reservation("rejected");
            tracing::debug!(%unit, %user, status = guard.status.label(), "Reserve rejected");
            return Err(InventoryError::NotAvailable(unit));
        }

        guard.status = UnitStatus::Reserved { by: user, until };
        crate::metrics::record_reservation("reserved");
        tracing::debug!(%unit, %user, %until, "Unit reserved");

        Ok(Reservation {
            unit,
            user,
            until,
            price: guard.price,
        })
    }

    /// Reserved → Available. No-op for Available, Sold or unknown units.
    ///
    /// Returns `true` if the unit went back on sale.
    pub fn release(&self, unit: UnitId) -> bool {
        self.release_if(unit, |_| true)
    }

    /// Like [`release`](Self::release), but only if `owner` holds the unit.
    ///
    /// Baskets release through this so a stale basket can never free a unit
    /// someone else has since reserved.
    pub fn release_for(&self, unit: UnitId, owner: UserId) -> bool {
        self.release_if(unit, |holder| holder == owner)
    }

    fn release_if(&self, unit: UnitId, may_release: impl Fn(UserId) -> bool) -> bool {
        let Some(handle) = self.handle(unit) else {
            return false;
        };
        let mut guard = lock(&handle);
        match guard.reserved_by() {
            Some(holder) if may_release(holder) => {
                guard.status = UnitStatus::Available;
                tracing::debug!(%unit, %holder, "Unit released");
                true
            },
            _ => false,
        }
    }

    /// Reserved → Sold.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::InvalidTransition`] if the unit is not
    /// Reserved, [`InventoryError::UnknownUnit`] if it does not exist.
    pub fn commit(&self, unit: UnitId) -> Result<Unit, InventoryError> {
        let handle = self.handle(unit).ok_or(InventoryError::UnknownUnit(unit))?;
        let mut guard = lock(&handle);
        if guard.reserved_by().is_none() {
            return Err(InventoryError::InvalidTransition {
                unit,
                from: guard.status.label(),
                to: "sold",
            });
        }
        guard.status = UnitStatus::Sold;
        crate::metrics::record_units_sold(1);
        Ok(guard.clone())
    }

    /// Commit every unit in `units`, all or nothing.
    ///
    /// Locks are taken in id order, every unit is checked to be reserved by
    /// `owner`, and only then are all of them marked Sold.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure; no unit changes in that case.
    pub fn commit_all(&self, units: &[UnitId], owner: UserId) -> Result<Vec<Unit>, InventoryError> {
        let mut ids = units.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let handles = ids
            .iter()
            .map(|id| self.handle(*id).ok_or(InventoryError::UnknownUnit(*id)))
            .collect::<Result<Vec<_>, _>>()?;
        let mut guards: Vec<MutexGuard<'_, Unit>> = handles.iter().map(lock).collect();

        for guard in &guards {
            if guard.reserved_by() != Some(owner) {
                return Err(InventoryError::InvalidTransition {
                    unit: guard.id,
                    from: guard.status.label(),
                    to: "sold",
                });
            }
        }

        let sold: Vec<Unit> = guards
            .iter_mut()
            .map(|guard| {
                guard.status = UnitStatus::Sold;
                guard.clone()
            })
            .collect();
        drop(guards);

        crate::metrics::record_units_sold(sold.len());
        tracing::info!(%owner, units = sold.len(), "Units sold");
        Ok(sold)
    }

    /// Move the reservation deadline of units `owner` holds.
    pub fn refresh_hold(&self, units: &[UnitId], owner: UserId, until: DateTime<Utc>) {
        for unit in units {
            if let Some(handle) = self.handle(*unit) {
                let mut guard = lock(&handle);
                if guard.reserved_by() == Some(owner) {
                    guard.status = UnitStatus::Reserved { by: owner, until };
                }
            }
        }
    }

    /// Snapshot of one unit
    #[must_use]
    pub fn get(&self, unit: UnitId) -> Option<Unit> {
        self.handle(unit).map(|handle| lock(&handle).clone())
    }

    /// Units currently reserved by `user`, ordered by id
    #[must_use]
    pub fn list_reserved(&self, user: UserId) -> Vec<Unit> {
        let mut reserved: Vec<Unit> = self
            .handles()
            .iter()
            .map(|handle| lock(handle).clone())
            .filter(|unit| unit.reserved_by() == Some(user))
            .collect();
        reserved.sort_by_key(|unit| unit.id);
        reserved
    }

    /// `count(status = Available)`
    #[must_use]
    pub fn available_count(&self) -> usize {
        self.handles()
            .iter()
            .filter(|handle| lock(handle).is_available())
            .count()
    }

    /// Available units by `(location_key, product_type)`
    #[must_use]
    pub fn stock_levels(&self) -> StockLevels {
        let mut levels = StockLevels::new();
        for handle in self.handles() {
            let unit = lock(&handle);
            if unit.is_available() {
                *levels
                    .entry((unit.location_key.clone(), unit.product_type.clone()))
                    .or_default() += 1;
            }
        }
        levels
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use stockpay_core::environment::Clock;
    use stockpay_testing::test_clock;

    fn stocked(store: &InventoryStore, price: u64) -> UnitId {
        store
            .stock(Unit::new("berlin-mitte", "flower", Money::from_major(price)))
            .unwrap()
    }

    fn hold_until() -> DateTime<Utc> {
        test_clock().now() + TimeDelta::minutes(15)
    }

    #[test]
    fn reserve_then_commit() {
        let store = InventoryStore::new();
        let unit = stocked(&store, 100);
        let user = UserId::new();

        let reservation = store.reserve(unit, user, hold_until()).unwrap();
        assert_eq!(reservation.price, Money::from_major(100));
        assert_eq!(store.available_count(), 0);

        let sold = store.commit(unit).unwrap();
        assert_eq!(sold.status, UnitStatus::Sold);
    }

    #[test]
    fn second_reserve_fails() {
        let store = InventoryStore::new();
        let unit = stocked(&store, 10);

        store.reserve(unit, UserId::new(), hold_until()).unwrap();
        let err = store.reserve(unit, UserId::new(), hold_until()).unwrap_err();

        assert_eq!(err, InventoryError::NotAvailable(unit));
    }

    #[test]
    fn commit_requires_a_reservation() {
        let store = InventoryStore::new();
        let unit = stocked(&store, 10);

        let err = store.commit(unit).unwrap_err();
        assert_eq!(
            err,
            InventoryError::InvalidTransition {
                unit,
                from: "available",
                to: "sold"
            }
        );

        store.reserve(unit, UserId::new(), hold_until()).unwrap();
        store.commit(unit).unwrap();
        assert!(matches!(
            store.commit(unit),
            Err(InventoryError::InvalidTransition { from: "sold", .. })
        ));
    }

    #[test]
    fn release_is_idempotent_and_never_touches_sold_units() {
        let store = InventoryStore::new();
        let unit = stocked(&store, 10);
        let user = UserId::new();

        assert!(!store.release(unit));
        store.reserve(unit, user, hold_until()).unwrap();
        assert!(store.release(unit));
        assert!(!store.release(unit));

        store.reserve(unit, user, hold_until()).unwrap();
        store.commit(unit).unwrap();
        assert!(!store.release(unit));
        assert_eq!(store.get(unit).unwrap().status, UnitStatus::Sold);
    }

    #[test]
    fn release_for_checks_the_holder() {
        let store = InventoryStore::new();
        let unit = stocked(&store, 10);
        let holder = UserId::new();

        store.reserve(unit, holder, hold_until()).unwrap();
        assert!(!store.release_for(unit, UserId::new()));
        assert!(store.release_for(unit, holder));
    }

    #[test]
    fn commit_all_is_all_or_nothing() {
        let store = InventoryStore::new();
        let user = UserId::new();
        let mine = stocked(&store, 10);
        let not_mine = stocked(&store, 20);

        store.reserve(mine, user, hold_until()).unwrap();
        store.reserve(not_mine, UserId::new(), hold_until()).unwrap();

        assert!(store.commit_all(&[mine, not_mine], user).is_err());
        assert_eq!(store.get(mine).unwrap().reserved_by(), Some(user));

        let sold = store.commit_all(&[mine], user).unwrap();
        assert_eq!(sold.len(), 1);
    }

    #[test]
    fn stock_levels_only_count_available_units() {
        let store = InventoryStore::new();
        let reserved = stocked(&store, 10);
        stocked(&store, 10);
        store
            .stock(Unit::new("hamburg", "edible", Money::from_major(5)))
            .unwrap();
        store.reserve(reserved, UserId::new(), hold_until()).unwrap();

        let levels = store.stock_levels();
        assert_eq!(levels.get(&("berlin-mitte".into(), "flower".into())), Some(&1));
        assert_eq!(levels.get(&("hamburg".into(), "edible".into())), Some(&1));
    }

    #[test]
    fn withdraw_only_takes_available_units() {
        let store = InventoryStore::new();
        let unit = stocked(&store, 10);
        store.reserve(unit, UserId::new(), hold_until()).unwrap();

        assert!(store.withdraw(unit).is_err());
        store.release(unit);
        assert!(store.withdraw(unit).is_ok());
        assert!(store.get(unit).is_none());
    }
}
