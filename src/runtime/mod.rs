//! Cross-cutting runtime utilities shared by every actor.
//!
//! - **`clock`**: a swappable time source so lifecycle logic (staleness,
//!   timeouts, retention) can be driven by a manual clock in tests.
//! - **`storage`**: the per-actor key/value persistence contract and the
//!   in-memory backend that implements it. Each actor owns exactly one
//!   namespace; nothing else ever reads or writes it.
//! - **`ids`**: newtype identifiers for tasks and servers.

pub mod clock;
pub mod ids;
pub mod storage;
