//! Background tasks.

mod reaper;

pub use reaper::{ReaperHandle, ReservationReaper, SweepReport};
