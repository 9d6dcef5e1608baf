//! Domain types for the stockpay engine.
//!
//! Identifiers, money, percentages and the inventory `Unit` record. Intent,
//! basket and ledger records live next to the components that own them.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_identifier!(
    /// Unique identifier for a sellable inventory unit
    UnitId
);
uuid_identifier!(
    /// Unique identifier for an end-user
    UserId
);
uuid_identifier!(
    /// Unique identifier for a basket (a new one per basket lifetime)
    BasketId
);
uuid_identifier!(
    /// Unique identifier for a purchase record
    PurchaseId
);

/// Gateway-assigned payment intent identifier
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IntentId(String);

impl IntentId {
    /// Wraps a gateway identifier
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Settlement currency ticker, stored lowercase (`btc`, `usdttrc20`, ...)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    /// Normalises a ticker to its lowercase form
    #[must_use]
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_lowercase())
    }

    /// Borrow the ticker
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Currency {
    fn from(code: String) -> Self {
        Self::new(code)
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Money Value Object (minor units to avoid floating point errors)
// ============================================================================

/// Represents money in minor units (cents); never negative
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(u64);

impl Money {
    /// Zero
    pub const ZERO: Self = Self(0);

    /// Creates a `Money` value from minor units
    #[must_use]
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    /// Creates a `Money` value from whole major units
    ///
    /// # Panics
    ///
    /// Panics if `major * 100` overflows. Use `checked_from_major` otherwise.
    #[must_use]
    #[allow(clippy::panic)]
    pub const fn from_major(major: u64) -> Self {
        match major.checked_mul(100) {
            Some(cents) => Self(cents),
            None => panic!("Money::from_major overflow"),
        }
    }

    /// Creates a `Money` value from whole major units with overflow checking
    #[must_use]
    pub const fn checked_from_major(major: u64) -> Option<Self> {
        match major.checked_mul(100) {
            Some(cents) => Some(Self(cents)),
            None => None,
        }
    }

    /// Returns the amount in minor units
    #[must_use]
    pub const fn cents(&self) -> u64 {
        self.0
    }

    /// Checks if the amount is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Adds two amounts with overflow checking
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }

    /// Adds two amounts, saturating at `u64::MAX` cents
    #[must_use]
    pub const fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    /// Subtracts (returns None if the result would be negative)
    #[must_use]
    pub const fn checked_sub(self, other: Self) -> Option<Self> {
        match self.0.checked_sub(other.0) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }

    /// Subtracts, clamping at zero
    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Signed minor units, for ledger deltas
    #[must_use]
    pub fn signed_cents(self) -> Option<i64> {
        i64::try_from(self.0).ok()
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Self::saturating_add)
    }
}

/// A percentage held in basis points, capped at 100%
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Percentage(u32);

impl Percentage {
    const FULL: u32 = 10_000;

    /// Whole percent (`20` → 20%)
    #[must_use]
    pub const fn from_percent(percent: u32) -> Self {
        Self::from_basis_points(percent.saturating_mul(100))
    }

    /// Basis points (`1250` → 12.5%)
    #[must_use]
    pub const fn from_basis_points(bp: u32) -> Self {
        if bp > Self::FULL { Self(Self::FULL) } else { Self(bp) }
    }

    /// Raw basis points
    #[must_use]
    pub const fn basis_points(&self) -> u32 {
        self.0
    }

    /// The share of `amount` this percentage represents, floored to the cent
    #[must_use]
    pub fn portion_of(&self, amount: Money) -> Money {
        let scaled = u128::from(amount.cents()) * u128::from(self.0) / u128::from(Self::FULL);
        // Never exceeds `amount`, so it always fits back into u64.
        Money::from_cents(u64::try_from(scaled).unwrap_or(amount.cents()))
    }
}

impl fmt::Display for Percentage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 100 == 0 {
            write!(f, "{}%", self.0 / 100)
        } else {
            write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
        }
    }
}

/// `now + window`, saturating at the latest representable instant
#[must_use]
pub fn deadline_after(now: DateTime<Utc>, window: TimeDelta) -> DateTime<Utc> {
    now.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ============================================================================
// Inventory unit
// ============================================================================

/// Lifecycle of a unit: Available → Reserved → Sold, or Reserved → Available
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    /// Sellable right now
    Available,
    /// Held in a basket
    Reserved {
        /// Basket owner
        by: UserId,
        /// Mirrors the owning basket's expiry
        until: DateTime<Utc>,
    },
    /// Sold; terminal
    Sold,
}

impl UnitStatus {
    /// Short label for logs and errors
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Reserved { .. } => "reserved",
            Self::Sold => "sold",
        }
    }
}

/// One sellable inventory item
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    /// Identity
    pub id: UnitId,
    /// Where the unit is located (city/district key)
    pub location_key: String,
    /// Product type, used for reseller rates
    pub product_type: String,
    /// List price
    pub price: Money,
    /// Reservation state
    pub status: UnitStatus,
}

impl Unit {
    /// Creates a new available unit
    #[must_use]
    pub fn new(location_key: impl Into<String>, product_type: impl Into<String>, price: Money) -> Self {
        Self {
            id: UnitId::new(),
            location_key: location_key.into(),
            product_type: product_type.into(),
            price,
            status: UnitStatus::Available,
        }
    }

    /// Returns `true` if the unit can be reserved
    #[must_use]
    pub const fn is_available(&self) -> bool {
        matches!(self.status, UnitStatus::Available)
    }

    /// The user holding the reservation, if any
    #[must_use]
    pub const fn reserved_by(&self) -> Option<UserId> {
        match self.status {
            UnitStatus::Reserved { by, .. } => Some(by),
            _ => None,
        }
    }

    /// When the reservation lapses, if reserved
    #[must_use]
    pub const fn reserved_until(&self) -> Option<DateTime<Utc>> {
        match self.status {
            UnitStatus::Reserved { until, .. } => Some(until),
            _ => None,
        }
    }
}
