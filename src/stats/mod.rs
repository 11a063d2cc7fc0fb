//! Statistics Aggregation Module
//!
//! One aggregator actor per calendar day (addressed by its ISO date, e.g.
//! `2024-01-06`) buffers typed task events and maintains three rollups:
//! aggregate counters, per-server counters, and 24 hourly buckets.
//!
//! ## Mechanics
//! - **Buffering**: `start`/`complete` events append to an in-memory buffer
//!   and bump counters immediately; recording never blocks on persistence.
//! - **Flushing**: the buffer drains to storage in a single transaction every
//!   10 seconds or once 1,000 events accumulate. Counters are re-persisted on
//!   every flush so recovery after a crash loses at most the unflushed
//!   buffer.
//! - **Day boundary**: a new day selects a new aggregator; the flush loop
//!   clears the hourly map when it first observes hour zero.

pub mod aggregator;
pub mod handlers;
pub mod types;

pub use aggregator::{StatsAggregator, StatsRegistry};

#[cfg(test)]
mod tests;
