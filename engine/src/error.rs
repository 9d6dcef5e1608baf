//! Error types for the stockpay engine.
//!
//! One enum per component. Failures are local and typed: a failed operation
//! never leaves partial state behind, so callers can surface or retry them
//! without compensating.

use crate::payment_gateway::PaymentGatewayError;
use crate::types::{BasketId, Currency, IntentId, Money, UnitId, UserId};
use std::fmt;
use thiserror::Error;

/// Inventory store failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InventoryError {
    /// Unit is already reserved or sold
    #[error("Unit {0} is not available")]
    NotAvailable(UnitId),

    /// A transition the unit lifecycle does not allow
    #[error("Unit {unit} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Unit concerned
        unit: UnitId,
        /// Status observed
        from: &'static str,
        /// Status requested
        to: &'static str,
    },

    /// Unit was never stocked
    #[error("Unit {0} does not exist")]
    UnknownUnit(UnitId),

    /// Unit id already present
    #[error("Unit {0} is already stocked")]
    DuplicateUnit(UnitId),
}

/// Why a discount code was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeRejection {
    /// No such code
    Unknown,
    /// Code switched off
    Inactive,
    /// Past its expiry date
    Expired,
    /// `max_uses` reached
    Exhausted,
    /// Order total below the code's minimum
    BelowMinimumOrder {
        /// Minimum order total
        minimum: Money,
    },
}

impl fmt::Display for CodeRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("unknown code"),
            Self::Inactive => f.write_str("code is inactive"),
            Self::Expired => f.write_str("code has expired"),
            Self::Exhausted => f.write_str("usage limit reached"),
            Self::BelowMinimumOrder { minimum } => write!(f, "minimum order is {minimum}"),
        }
    }
}

/// Discount engine failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscountError {
    /// Code cannot be applied
    #[error("Invalid discount code {code}: {reason}")]
    InvalidCode {
        /// Normalised code
        code: String,
        /// Rejection reason
        reason: CodeRejection,
    },
}

/// Basket aggregate failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BasketError {
    /// Reservation lost the race or the unit is sold
    #[error("Item {0} is unavailable")]
    ItemUnavailable(UnitId),

    /// Nothing to check out (or the basket expired)
    #[error("Basket is empty")]
    EmptyBasket,

    /// A payment intent holds the basket
    #[error("Basket is awaiting payment for intent {intent}")]
    CheckoutPending {
        /// Intent holding the basket
        intent: IntentId,
    },

    /// Basket changed or was replaced since it was quoted
    #[error("Basket {basket} changed since it was quoted")]
    Changed {
        /// Basket that was quoted
        basket: BasketId,
    },

    /// Intent no longer holds the basket
    #[error("Intent {intent} does not hold a basket for user {user}")]
    NoCheckout {
        /// Intent that tried to settle
        intent: IntentId,
        /// Basket owner
        user: UserId,
    },

    /// Discount code refused
    #[error(transparent)]
    Discount(#[from] DiscountError),

    /// Inventory refused a transition
    #[error(transparent)]
    Inventory(#[from] InventoryError),
}

/// Payment intent manager failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IntentError {
    /// Basket could not be checked out
    #[error(transparent)]
    Basket(#[from] BasketError),

    /// Amount below the refill or gateway minimum
    #[error("Amount {amount} is below the minimum of {minimum}")]
    BelowMinimum {
        /// Requested amount
        amount: Money,
        /// Minimum accepted
        minimum: Money,
    },

    /// Gateway failed (after retries, for transient failures)
    #[error("Gateway error: {0}")]
    Gateway(#[from] PaymentGatewayError),

    /// Caller quoted a basket that is no longer the user's live basket
    #[error("Basket {requested} is not the live basket")]
    StaleBasket {
        /// Basket requested by the caller
        requested: BasketId,
    },

    /// Gateway issued an id that already belongs to another intent
    #[error("Gateway reissued intent id {0}")]
    DuplicateIntent(IntentId),
}

/// Settlement processor failures. Duplicates are not errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettlementError {
    /// No intent with this id
    #[error("Unknown intent {0}")]
    UnknownIntent(IntentId),

    /// Money arrived after the quote window; held for manual reconciliation
    #[error("Intent {intent} is expired; {received} held for reconciliation")]
    ExpiredIntent {
        /// Intent concerned
        intent: IntentId,
        /// Amount reported by the provider
        received: Money,
    },

    /// Payment reported in another currency
    #[error("Intent {intent} expects {expected}, event reported {received}")]
    CurrencyMismatch {
        /// Intent concerned
        intent: IntentId,
        /// Intent currency
        expected: Currency,
        /// Reported currency
        received: Currency,
    },

    /// Fulfillment side effects failed; the intent kept its prior state
    #[error("Fulfillment of intent {intent} failed: {reason}")]
    Fulfillment {
        /// Intent concerned
        intent: IntentId,
        /// Underlying failure
        reason: String,
    },
}

/// Balance ledger failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Debit larger than the balance
    #[error("Insufficient balance: need {needed}, have {available}")]
    InsufficientBalance {
        /// Amount requested
        needed: Money,
        /// Current balance
        available: Money,
    },

    /// Amount does not fit a signed ledger delta
    #[error("Amount {0} overflows the ledger")]
    Overflow(Money),
}

/// Failures raised while fulfilling a settled intent.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FulfillmentError {
    /// Basket could not be committed or released
    #[error(transparent)]
    Basket(#[from] BasketError),

    /// Ledger refused the credit
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Purchase intent without checkout terms
    #[error("Intent {0} has no checkout attached")]
    MissingCheckout(IntentId),
}

/// Balance-funded checkout failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CheckoutError {
    /// Basket refused the checkout
    #[error(transparent)]
    Basket(#[from] BasketError),

    /// Not enough balance
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Administrative console failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdminError {
    /// Caller lacks the capability
    #[error("User {user} may not {capability}")]
    Forbidden {
        /// Caller
        user: UserId,
        /// Capability requested
        capability: &'static str,
    },

    /// Inventory refused the change
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    /// No such discount code
    #[error("Unknown discount code {0}")]
    UnknownCode(String),
}
