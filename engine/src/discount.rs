//! Discount computation.
//!
//! [`DiscountEngine::compute`] is pure: the same items, code and reseller rates
//! always produce the same [`Quote`]. Order of application:
//!
//! 1. Reseller rates, per line, for the buyer's product types
//! 2. The discount code, on the post-reseller subtotal
//! 3. Clamp: discounts never push the total below zero
//!
//! [`DiscountBook`] holds the mutable catalogue (codes, reseller flags) and is
//! the only place usage counters change, on successful checkout.

use crate::error::{CodeRejection, DiscountError};
use crate::types::{Money, Percentage, UnitId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Canonical form of a user-entered code
#[must_use]
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Percentage or fixed-amount reduction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscountKind {
    /// Share of the order
    Percentage(Percentage),
    /// Flat amount off
    Fixed(Money),
}

/// A redeemable discount code
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountCode {
    /// Normalised code
    pub code: String,
    /// Reduction
    pub kind: DiscountKind,
    /// Switched on
    pub active: bool,
    /// Usage cap, if any
    pub max_uses: Option<u32>,
    /// Successful checkouts so far
    pub uses_count: u32,
    /// Last instant the code is valid
    pub expires_at: Option<DateTime<Utc>>,
    /// Smallest post-reseller subtotal the code accepts
    pub min_order: Option<Money>,
}

impl DiscountCode {
    /// Percentage code with no limits
    #[must_use]
    pub fn percentage(code: &str, percent: Percentage) -> Self {
        Self::with_kind(code, DiscountKind::Percentage(percent))
    }

    /// Fixed-amount code with no limits
    #[must_use]
    pub fn fixed(code: &str, amount: Money) -> Self {
        Self::with_kind(code, DiscountKind::Fixed(amount))
    }

    fn with_kind(code: &str, kind: DiscountKind) -> Self {
        Self {
            code: normalize_code(code),
            kind,
            active: true,
            max_uses: None,
            uses_count: 0,
            expires_at: None,
            min_order: None,
        }
    }

    /// Require a minimum order
    #[must_use]
    pub const fn with_min_order(mut self, minimum: Money) -> Self {
        self.min_order = Some(minimum);
        self
    }

    /// Cap the number of redemptions
    #[must_use]
    pub const fn with_max_uses(mut self, max_uses: u32) -> Self {
        self.max_uses = Some(max_uses);
        self
    }

    /// Expire the code at `instant`
    #[must_use]
    pub const fn with_expiry(mut self, instant: DateTime<Utc>) -> Self {
        self.expires_at = Some(instant);
        self
    }

    fn reject(&self, reason: CodeRejection) -> DiscountError {
        DiscountError::InvalidCode {
            code: self.code.clone(),
            reason,
        }
    }

    /// Check the code against an order total at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`DiscountError::InvalidCode`] with the first failing rule.
    pub fn validate(&self, order_total: Money, now: DateTime<Utc>) -> Result<(), DiscountError> {
        if !self.active {
            return Err(self.reject(CodeRejection::Inactive));
        }
        if self.expires_at.is_some_and(|expiry| now > expiry) {
            return Err(self.reject(CodeRejection::Expired));
        }
        if self.max_uses.is_some_and(|cap| self.uses_count >= cap) {
            return Err(self.reject(CodeRejection::Exhausted));
        }
        if let Some(minimum) = self.min_order {
            if order_total < minimum {
                return Err(self.reject(CodeRejection::BelowMinimumOrder { minimum }));
            }
        }
        Ok(())
    }

    /// Reduction on `base`, floored to the cent and capped at `base`
    #[must_use]
    pub fn discount_on(&self, base: Money) -> Money {
        match self.kind {
            DiscountKind::Percentage(pct) => pct.portion_of(base),
            DiscountKind::Fixed(amount) => amount.min(base),
        }
    }
}

/// Per-product-type reseller percentages
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResellerRates {
    rates: HashMap<String, Percentage>,
}

impl ResellerRates {
    /// Empty rate card
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the rate for a product type
    #[must_use]
    pub fn with_rate(mut self, product_type: impl Into<String>, rate: Percentage) -> Self {
        self.rates.insert(product_type.into(), rate);
        self
    }

    /// Rate for a product type, if any
    #[must_use]
    pub fn rate_for(&self, product_type: &str) -> Option<Percentage> {
        self.rates.get(product_type).copied()
    }
}

/// One unit as priced for a quote
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricedItem {
    /// Unit
    pub unit: UnitId,
    /// Product type for reseller lookup
    pub product_type: String,
    /// List price
    pub price: Money,
}

/// A quoted line after reseller pricing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteLine {
    /// Unit
    pub unit: UnitId,
    /// List price
    pub price: Money,
    /// Reseller reduction on this line
    pub reseller_discount: Money,
    /// `price - reseller_discount`
    pub net: Money,
}

/// Result of a discount computation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Lines in basket order
    pub lines: Vec<QuoteLine>,
    /// Sum of list prices
    pub subtotal: Money,
    /// Reseller reductions
    pub reseller_discount: Money,
    /// Code reduction
    pub code_discount: Money,
    /// `reseller_discount + code_discount`
    pub discount_amount: Money,
    /// Amount payable
    pub total: Money,
    /// Code applied, normalised
    pub code: Option<String>,
}

/// Pure discount computation
#[derive(Clone, Copy, Debug, Default)]
pub struct DiscountEngine;

impl DiscountEngine {
    /// Compute the payable total for `items`.
    ///
    /// Usage limits are checked but never consumed here; a quote may be
    /// abandoned.
    ///
    /// # Errors
    ///
    /// Returns [`DiscountError::InvalidCode`] if `code` is inactive, expired,
    /// exhausted or the post-reseller subtotal is below its minimum.
    pub fn compute(
        items: &[PricedItem],
        code: Option<&DiscountCode>,
        reseller: Option<&ResellerRates>,
        now: DateTime<Utc>,
    ) -> Result<Quote, DiscountError> {
        let lines: Vec<QuoteLine> = items
            .iter()
            .map(|item| {
                let reseller_discount = reseller
                    .and_then(|rates| rates.rate_for(&item.product_type))
                    .map_or(Money::ZERO, |rate| rate.portion_of(item.price));
                QuoteLine {
                    unit: item.unit,
                    price: item.price,
                    reseller_discount,
                    net: item.price.saturating_sub(reseller_discount),
                }
            })
            .collect();

        let subtotal: Money = lines.iter().map(|line| line.price).sum();
        let reseller_discount: Money = lines.iter().map(|line| line.reseller_discount).sum();
        let after_reseller = subtotal.saturating_sub(reseller_discount);

        let code_discount = match code {
            Some(code) => {
                code.validate(after_reseller, now)?;
                code.discount_on(after_reseller)
            },
            None => Money::ZERO,
        };

        Ok(Quote {
            lines,
            subtotal,
            reseller_discount,
            code_discount,
            discount_amount: reseller_discount.saturating_add(code_discount),
            total: after_reseller.saturating_sub(code_discount),
            code: code.map(|c| c.code.clone()),
        })
    }
}

/// Discount codes and reseller flags
#[derive(Debug, Default)]
pub struct DiscountBook {
    codes: RwLock<HashMap<String, DiscountCode>>,
    resellers: RwLock<HashMap<UserId, ResellerRates>>,
}

impl DiscountBook {
    /// Empty book
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a code
    pub fn upsert_code(&self, code: DiscountCode) {
        tracing::info!(code = %code.code, "Discount code saved");
        self.codes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(code.code.clone(), code);
    }

    /// Switch a code off; returns `false` if unknown
    pub fn deactivate_code(&self, raw: &str) -> bool {
        let mut codes = self.codes.write().unwrap_or_else(PoisonError::into_inner);
        codes.get_mut(&normalize_code(raw)).is_some_and(|code| {
            code.active = false;
            true
        })
    }

    /// Look a code up (case-insensitive)
    #[must_use]
    pub fn lookup(&self, raw: &str) -> Option<DiscountCode> {
        self.codes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&normalize_code(raw))
            .cloned()
    }

    /// Look a code up, turning "unknown" into an error
    ///
    /// # Errors
    ///
    /// Returns [`DiscountError::InvalidCode`] with [`CodeRejection::Unknown`].
    pub fn resolve(&self, raw: &str) -> Result<DiscountCode, DiscountError> {
        self.lookup(raw).ok_or_else(|| DiscountError::InvalidCode {
            code: normalize_code(raw),
            reason: CodeRejection::Unknown,
        })
    }

    /// Count one successful checkout against the code
    pub fn redeem(&self, raw: &str) -> bool {
        let mut codes = self.codes.write().unwrap_or_else(PoisonError::into_inner);
        codes.get_mut(&normalize_code(raw)).is_some_and(|code| {
            code.uses_count = code.uses_count.saturating_add(1);
            tracing::debug!(code = %code.code, uses = code.uses_count, "Discount code redeemed");
            true
        })
    }

    /// Flag `user` as a reseller with `rates`
    pub fn set_reseller(&self, user: UserId, rates: ResellerRates) {
        self.resellers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user, rates);
    }

    /// Remove reseller status; returns `false` if not a reseller
    pub fn revoke_reseller(&self, user: UserId) -> bool {
        self.resellers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&user)
            .is_some()
    }

    /// Rates for `user`, if flagged as a reseller
    #[must_use]
    pub fn reseller_rates(&self, user: UserId) -> Option<ResellerRates> {
        self.resellers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user)
            .cloned()
    }
}
