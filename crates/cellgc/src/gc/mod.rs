//! Garbage collection.
//!
//! - [`manager`]: collection policy. Decides when to collect and how many
//!   generations, and keeps the allocation tallies.
//! - [`collector`]: one stop-the-world mark-sweep pass over the chosen
//!   generations.

pub(crate) mod collector;
pub(crate) mod manager;

pub use manager::{GcHook, LEVEL_1_INTERVAL, LEVEL_2_INTERVAL};
