//! Aggregates: the state owners of the engine.
//!
//! - [`inventory`]: per-unit availability with per-unit locks
//! - [`basket`]: per-user baskets and lazy expiry
//! - [`intent`]: payment intents and the settlement reducer
//! - [`ledger`]: append-only balance ledger
//!
//! Lock order when more than one is held: intent, then basket, then unit.

pub mod basket;
pub mod intent;
pub mod inventory;
pub mod ledger;
