//! Task Lifecycle Module
//!
//! One actor per task id, the integration point the ingress talks to. Each
//! instance owns its task's state machine:
//!
//! ```text
//! PENDING -> PROCESSING -> {COMPLETED, FAILED, TIMEOUT}
//! PENDING -> FAILED            (assignment error)
//! non-terminal -> CANCELLED    (explicit cancel)
//! FAILED/TIMEOUT -> PENDING    (retry, bounded by the retry ceiling)
//! ```
//!
//! Terminal tasks linger for the cleanup-delay window, then purge their
//! storage. Every final terminal transition emits exactly one completion
//! event to the day's stats aggregator.
//!
//! Dispatch is decoupled from state: once a task is marked PROCESSING the
//! backend call runs as a spawned job, and results come back through
//! `update_task` (the worker callback and the synchronous-response path both
//! funnel through it).

pub mod handlers;
pub mod instance;
pub mod pool;
pub mod types;

pub use instance::TaskInstance;
pub use pool::TaskPool;
