//! Administrative capabilities.
//!
//! Admin roles are an injected policy queried by capability. Nothing in the
//! reservation or settlement core consults it; only [`AdminConsole`] does.

use crate::aggregates::inventory::{InventoryStore, StockLevels};
use crate::discount::{DiscountBook, DiscountCode, ResellerRates};
use crate::error::AdminError;
use crate::types::{Unit, UnitId, UserId};
use std::collections::HashSet;
use std::sync::Arc;

/// Who holds which admin capability
pub trait AccessPolicy: Send + Sync {
    /// Full administrator
    fn is_primary(&self, user: UserId) -> bool;

    /// Read-only operator
    fn is_secondary(&self, user: UserId) -> bool;
}

/// Fixed admin lists, loaded at startup
#[derive(Debug, Clone, Default)]
pub struct StaticAccessPolicy {
    primary: HashSet<UserId>,
    secondary: HashSet<UserId>,
}

impl StaticAccessPolicy {
    /// Creates a policy from the two admin lists
    #[must_use]
    pub fn new(
        primary: impl IntoIterator<Item = UserId>,
        secondary: impl IntoIterator<Item = UserId>,
    ) -> Self {
        Self {
            primary: primary.into_iter().collect(),
            secondary: secondary.into_iter().collect(),
        }
    }
}

impl AccessPolicy for StaticAccessPolicy {
    fn is_primary(&self, user: UserId) -> bool {
        self.primary.contains(&user)
    }

    fn is_secondary(&self, user: UserId) -> bool {
        self.secondary.contains(&user)
    }
}

/// Stock, discount-code and reseller management behind an [`AccessPolicy`]
pub struct AdminConsole {
    policy: Arc<dyn AccessPolicy>,
    inventory: Arc<InventoryStore>,
    discounts: Arc<DiscountBook>,
}

impl AdminConsole {
    /// Creates a console
    #[must_use]
    pub fn new(
        policy: Arc<dyn AccessPolicy>,
        inventory: Arc<InventoryStore>,
        discounts: Arc<DiscountBook>,
    ) -> Self {
        Self {
            policy,
            inventory,
            discounts,
        }
    }

    fn require_primary(&self, user: UserId, capability: &'static str) -> Result<(), AdminError> {
        if self.policy.is_primary(user) {
            Ok(())
        } else {
            tracing::warn!(%user, capability, "Admin capability denied");
            Err(AdminError::Forbidden { user, capability })
        }
    }

    /// Put units on sale.
    ///
    /// # Errors
    ///
    /// [`AdminError::Forbidden`] unless `caller` is primary;
    /// [`AdminError::Inventory`] if a unit id is already stocked.
    pub fn load_stock(&self, caller: UserId, units: Vec<Unit>) -> Result<Vec<UnitId>, AdminError> {
        self.require_primary(caller, "load stock")?;
        let ids = units
            .into_iter()
            .map(|unit| self.inventory.stock(unit))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::info!(%caller, units = ids.len(), "Stock loaded");
        Ok(ids)
    }

    /// Take an available unit off sale.
    ///
    /// # Errors
    ///
    /// [`AdminError::Forbidden`] unless `caller` is primary;
    /// [`AdminError::Inventory`] if the unit is reserved, sold or unknown.
    pub fn withdraw_unit(&self, caller: UserId, unit: UnitId) -> Result<Unit, AdminError> {
        self.require_primary(caller, "withdraw stock")?;
        Ok(self.inventory.withdraw(unit)?)
    }

    /// Available units per location and product type.
    ///
    /// # Errors
    ///
    /// [`AdminError::Forbidden`] unless `caller` is primary or secondary.
    pub fn view_stock(&self, caller: UserId) -> Result<StockLevels, AdminError> {
        if !self.policy.is_primary(caller) && !self.policy.is_secondary(caller) {
            return Err(AdminError::Forbidden {
                user: caller,
                capability: "view stock",
            });
        }
        Ok(self.inventory.stock_levels())
    }

    /// Create or replace a discount code.
    ///
    /// # Errors
    ///
    /// [`AdminError::Forbidden`] unless `caller` is primary.
    pub fn upsert_code(&self, caller: UserId, code: DiscountCode) -> Result<(), AdminError> {
        self.require_primary(caller, "manage discount codes")?;
        self.discounts.upsert_code(code);
        Ok(())
    }

    /// Switch a discount code off.
    ///
    /// # Errors
    ///
    /// [`AdminError::Forbidden`] unless `caller` is primary;
    /// [`AdminError::UnknownCode`] if there is no such code.
    pub fn deactivate_code(&self, caller: UserId, code: &str) -> Result<(), AdminError> {
        self.require_primary(caller, "manage discount codes")?;
        if self.discounts.deactivate_code(code) {
            Ok(())
        } else {
            Err(AdminError::UnknownCode(code.to_string()))
        }
    }

    /// Flag `user` as a reseller with per-product rates.
    ///
    /// # Errors
    ///
    /// [`AdminError::Forbidden`] unless `caller` is primary.
    pub fn set_reseller(&self, caller: UserId, user: UserId, rates: ResellerRates) -> Result<(), AdminError> {
        self.require_primary(caller, "manage resellers")?;
        self.discounts.set_reseller(user, rates);
        Ok(())
    }

    /// Remove reseller status. Returns whether `user` was a reseller.
    ///
    /// # Errors
    ///
    /// [`AdminError::Forbidden`] unless `caller` is primary.
    pub fn revoke_reseller(&self, caller: UserId, user: UserId) -> Result<bool, AdminError> {
        self.require_primary(caller, "manage resellers")?;
        Ok(self.discounts.revoke_reseller(user))
    }
}
