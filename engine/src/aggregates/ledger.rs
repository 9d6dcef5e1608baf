//! Balance ledger.
//!
//! Append-only list of signed entries; a user's balance is the running sum of
//! their entries. Every posting is keyed by `(reference, reason)` and a key is
//! applied at most once, so a credit that is re-attempted for the same intent
//! is a no-op instead of a second payout.

use crate::error::LedgerError;
use crate::types::{BasketId, IntentId, Money, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Why a balance changed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerReason {
    /// Balance top-up paid through the gateway
    Refill,
    /// Excess paid on a purchase intent
    Overpayment,
    /// Short payment kept as balance instead of being lost
    UnderpaymentCredit,
    /// Balance spent on a basket
    Purchase,
    /// Balance purchase rolled back
    PurchaseRefund,
}

impl LedgerReason {
    /// Stable label used in logs and metrics
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Refill => "refill",
            Self::Overpayment => "overpayment",
            Self::UnderpaymentCredit => "underpayment_credit",
            Self::Purchase => "purchase",
            Self::PurchaseRefund => "purchase_refund",
        }
    }
}

impl fmt::Display for LedgerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an entry is attributed to
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerRef {
    /// A payment intent (settlement credits)
    Intent(IntentId),
    /// One balance-funded checkout attempt of a basket
    Checkout {
        /// Basket bought
        basket: BasketId,
        /// Attempt id shared by the debit and its refund
        attempt: Uuid,
    },
}

/// Immutable record of a balance change
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Account holder
    pub user: UserId,
    /// Signed change in minor units
    pub delta: i64,
    /// Why
    pub reason: LedgerReason,
    /// Attribution
    pub reference: LedgerRef,
    /// When the entry was appended
    pub applied_at: DateTime<Utc>,
}

/// Result of a posting
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Posting {
    /// Entry appended; the new balance
    Applied {
        /// Balance after the entry
        balance: Money,
    },
    /// Same `(reference, reason)` was already posted; nothing changed
    AlreadyApplied,
}

#[derive(Debug, Default)]
struct Book {
    entries: Vec<LedgerEntry>,
    balances: HashMap<UserId, Money>,
    applied: HashSet<(LedgerRef, LedgerReason)>,
}

/// Per-user balances backed by an append-only entry list
#[derive(Debug, Default)]
pub struct BalanceLedger {
    book: Mutex<Book>,
}

impl BalanceLedger {
    /// Creates an empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Credit `amount` to `user`, at most once per `(reference, reason)`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Overflow`] if the amount cannot be represented.
    pub fn credit(
        &self,
        user: UserId,
        amount: Money,
        reason: LedgerReason,
        reference: LedgerRef,
        at: DateTime<Utc>,
    ) -> Result<Posting, LedgerError> {
        let delta = amount.signed_cents().ok_or(LedgerError::Overflow(amount))?;
        let mut book = self.book();

        let key = (reference, reason);
        if book.applied.contains(&key) {
            tracing::debug!(%user, reason = %reason, "Ledger credit already applied");
            return Ok(Posting::AlreadyApplied);
        }

        let current = book.balances.get(&user).copied().unwrap_or_default();
        let balance = current
            .checked_add(amount)
            .ok_or(LedgerError::Overflow(amount))?;

        let (reference, reason) = key.clone();
        book.applied.insert(key);
        book.balances.insert(user, balance);
        book.entries.push(LedgerEntry {
            user,
            delta,
            reason,
            reference,
            applied_at: at,
        });
        drop(book);

        crate::metrics::record_ledger_credit(reason.as_str(), amount.cents());
        tracing::info!(%user, amount = %amount, reason = %reason, balance = %balance, "Balance credited");
        Ok(Posting::Applied { balance })
    }

    /// Whether crediting `amount` to `user` would be accepted right now.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Overflow`] if the entry or the resulting balance
    /// cannot be represented.
    pub fn check_credit(&self, user: UserId, amount: Money) -> Result<(), LedgerError> {
        amount.signed_cents().ok_or(LedgerError::Overflow(amount))?;
        self.balance(user)
            .checked_add(amount)
            .ok_or(LedgerError::Overflow(amount))?;
        Ok(())
    }

    /// Debit `amount` from `user`; check and append happen under one lock.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InsufficientBalance`] when the balance is short.
    pub fn debit(
        &self,
        user: UserId,
        amount: Money,
        reason: LedgerReason,
        reference: LedgerRef,
        at: DateTime<Utc>,
    ) -> Result<Posting, LedgerError> {
        let delta = amount.signed_cents().ok_or(LedgerError::Overflow(amount))?;
        let mut book = self.book();

        let key = (reference, reason);
        if book.applied.contains(&key) {
            return Ok(Posting::AlreadyApplied);
        }

        let available = book.balances.get(&user).copied().unwrap_or_default();
        let balance = available
            .checked_sub(amount)
            .ok_or(LedgerError::InsufficientBalance {
                needed: amount,
                available,
            })?;

        let (reference, reason) = key.clone();
        book.applied.insert(key);
        book.balances.insert(user, balance);
        book.entries.push(LedgerEntry {
            user,
            delta: -delta,
            reason,
            reference,
            applied_at: at,
        });
        drop(book);

        tracing::info!(%user, amount = %amount, reason = %reason, balance = %balance, "Balance debited");
        Ok(Posting::Applied { balance })
    }

    /// Current balance
    #[must_use]
    pub fn balance(&self, user: UserId) -> Money {
        self.book().balances.get(&user).copied().unwrap_or_default()
    }

    /// All entries for `user`, oldest first
    #[must_use]
    pub fn entries_for(&self, user: UserId) -> Vec<LedgerEntry> {
        self.book()
            .entries
            .iter()
            .filter(|entry| entry.user == user)
            .cloned()
            .collect()
    }

    /// All entries attributed to `reference`
    #[must_use]
    pub fn entries_referencing(&self, reference: &LedgerRef) -> Vec<LedgerEntry> {
        self.book()
            .entries
            .iter()
            .filter(|entry| &entry.reference == reference)
            .cloned()
            .collect()
    }
}
