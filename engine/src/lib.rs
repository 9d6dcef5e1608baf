//! Stockpay - inventory reservation and payment settlement engine
//!
//! Users reserve finite units into a time-bounded basket, pay for them (or top
//! up a balance) through an asynchronous crypto-payment gateway, and receive
//! the goods once payment is confirmed. The engine guarantees that no unit is
//! sold twice and no payment confirmation is applied twice.
//!
//! # Architecture
//!
//! ```text
//!  ┌───────────────┐  reserve/release/commit  ┌────────────────┐
//!  │BasketAggregate│─────────────────────────▶│ InventoryStore │
//!  └───────────────┘                          └────────────────┘
//!          │ quote (DiscountEngine)                   ▲
//!          ▼                                          │ commit / release
//!  ┌──────────────────────┐   invoice   ┌─────────┐   │
//!  │ PaymentIntentManager │────────────▶│ Gateway │   │
//!  └──────────────────────┘             └─────────┘   │
//!          │ intents                         │ events │
//!          ▼                                 ▼        │
//!  ┌────────────────────────────────────────────────┐ │
//!  │ SettlementProcessor (IntentReducer + dedup)     │─┘
//!  └────────────────────────────────────────────────┘
//!          │ credits
//!          ▼
//!  ┌───────────────┐        ┌───────────────────┐
//!  │ BalanceLedger │        │ ReservationReaper │ (interval sweep)
//!  └───────────────┘        └───────────────────┘
//! ```
//!
//! # Key Properties
//!
//! ## 1. One winner per unit
//!
//! Every unit sits behind its own lock; `reserve` succeeds only from
//! `Available`, so N concurrent buyers of one unit yield exactly one success.
//! No lock is held across a gateway call.
//!
//! ## 2. At-most-once settlement
//!
//! Events are deduplicated on `(intent, nonce)` under the intent's lock, and
//! every status other than `Pending` is sticky. Ledger credits are keyed by
//! `(intent, reason)` so a retried fulfillment cannot pay out twice.
//!
//! ## 3. A single expiry clock
//!
//! A basket's `expires_at` bounds every reservation it holds. Operations check
//! it lazily; the reaper enforces it periodically.
//!
//! # Usage
//!
//! See [`app::Storefront`] for the assembled engine and the `demo` binary for
//! an end-to-end run.

#![forbid(unsafe_code)]

pub mod access;
pub mod aggregates;
pub mod app;
pub mod config;
pub mod discount;
pub mod error;
pub mod metrics;
pub mod payment_gateway;
pub mod purchases;
pub mod retry;
pub mod runtime;
pub mod types;

pub use access::{AccessPolicy, AdminConsole, StaticAccessPolicy};
pub use aggregates::basket::{Basket, BasketAggregate, BasketView};
pub use aggregates::intent::{
    IntentKind, IntentStatus, PaymentIntent, ProviderStatus, SettlementEvent,
};
pub use aggregates::inventory::InventoryStore;
pub use aggregates::ledger::{BalanceLedger, LedgerEntry, LedgerReason, LedgerRef};
pub use app::{Ack, PaymentIntentManager, Receipt, SettlementProcessor, Storefront};
pub use config::Config;
pub use discount::{DiscountCode, DiscountEngine, Quote, ResellerRates};
pub use error::{
    AdminError, BasketError, CheckoutError, DiscountError, IntentError, InventoryError,
    LedgerError, SettlementError,
};
pub use payment_gateway::{MockPaymentGateway, PaymentGateway, PaymentGatewayError};
pub use runtime::{ReaperHandle, ReservationReaper, SweepReport};
pub use types::{BasketId, Currency, IntentId, Money, Percentage, Unit, UnitId, UnitStatus, UserId};
