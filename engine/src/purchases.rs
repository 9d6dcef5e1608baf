//! Purchase history and customer tiers.

use crate::types::{Money, PurchaseId, Unit, UnitId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Purchases needed to become [`CustomerTier::Regular`]
pub const REGULAR_THRESHOLD: usize = 5;
/// Purchases needed to become [`CustomerTier::Vip`]
pub const VIP_THRESHOLD: usize = 10;

/// One sold unit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRecord {
    /// Record id
    pub id: PurchaseId,
    /// Buyer
    pub user: UserId,
    /// Unit sold
    pub unit: UnitId,
    /// Product type
    pub product_type: String,
    /// Location key
    pub location_key: String,
    /// Line price after reseller discount
    pub price_paid: Money,
    /// When
    pub purchased_at: DateTime<Utc>,
}

/// Loyalty tier derived from purchase count
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerTier {
    /// Fewer than five purchases
    New,
    /// Five or more
    Regular,
    /// Ten or more
    Vip,
}

impl CustomerTier {
    /// Tier for a purchase count
    #[must_use]
    pub const fn for_count(purchases: usize) -> Self {
        if purchases >= VIP_THRESHOLD {
            Self::Vip
        } else if purchases >= REGULAR_THRESHOLD {
            Self::Regular
        } else {
            Self::New
        }
    }
}

/// Purchase records per user
#[derive(Debug, Default)]
pub struct PurchaseLog {
    records: RwLock<HashMap<UserId, Vec<PurchaseRecord>>>,
}

impl PurchaseLog {
    /// Creates an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every unit of a fulfilled basket.
    ///
    /// `paid` yields the price paid per unit; units it has no price for are
    /// recorded at list price.
    pub fn record_sale(
        &self,
        user: UserId,
        units: &[Unit],
        paid: impl Fn(UnitId) -> Option<Money>,
        at: DateTime<Utc>,
    ) -> Vec<PurchaseRecord> {
        let records: Vec<PurchaseRecord> = units
            .iter()
            .map(|unit| PurchaseRecord {
                id: PurchaseId::new(),
                user,
                unit: unit.id,
                product_type: unit.product_type.clone(),
                location_key: unit.location_key.clone(),
                price_paid: paid(unit.id).unwrap_or(unit.price),
                purchased_at: at,
            })
            .collect();

        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(user)
            .or_default()
            .extend(records.iter().cloned());

        tracing::info!(%user, units = records.len(), "Purchase recorded");
        records
    }

    /// History for `user`, oldest first
    #[must_use]
    pub fn history(&self, user: UserId) -> Vec<PurchaseRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of units bought by `user`
    #[must_use]
    pub fn count(&self, user: UserId) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user)
            .map_or(0, Vec::len)
    }

    /// Loyalty tier of `user`
    #[must_use]
    pub fn tier(&self, user: UserId) -> CustomerTier {
        CustomerTier::for_count(self.count(user))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use stockpay_core::environment::Clock;
    use stockpay_testing::test_clock;

    #[test]
    fn tier_thresholds() {
        assert_eq!(CustomerTier::for_count(0), CustomerTier::New);
        assert_eq!(CustomerTier::for_count(4), CustomerTier::New);
        assert_eq!(CustomerTier::for_count(5), CustomerTier::Regular);
        assert_eq!(CustomerTier::for_count(9), CustomerTier::Regular);
        assert_eq!(CustomerTier::for_count(10), CustomerTier::Vip);
    }

    #[test]
    fn records_price_paid_or_list_price() {
        let log = PurchaseLog::new();
        let user = UserId::new();
        let discounted = Unit::new("paris", "flower", Money::from_major(100));
        let full = Unit::new("paris", "flower", Money::from_major(40));
        let discounted_id = discounted.id;

        let records = log.record_sale(
            user,
            &[discounted, full],
            |id| (id == discounted_id).then_some(Money::from_major(80)),
            test_clock().now(),
        );

        assert_eq!(records[0].price_paid, Money::from_major(80));
        assert_eq!(records[1].price_paid, Money::from_major(40));
        assert_eq!(log.count(user), 2);
        assert_eq!(log.tier(user), CustomerTier::New);
        assert!(log.history(UserId::new()).is_empty());
    }
}
