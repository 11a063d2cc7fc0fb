//! Server Instance Module
//!
//! One actor per registered backend worker. Each instance owns that worker's
//! runtime state machine, the adaptive health-check loop, and task dispatch
//! over HTTP.
//!
//! ## Responsibilities
//! - **Dispatch**: forwards task requests to the worker's predict endpoint,
//!   enforcing the configured concurrency cap.
//! - **Health**: probes the worker's health endpoint on an adaptive interval
//!   (backs off while healthy, tightens while failing) and verifies the peer
//!   identity on every probe.
//! - **Lifecycle**: degrades after failures, recovers after successes, drains
//!   and clears storage on shutdown, and shuts itself down when idle too long.
//!
//! Instances notify the load balancer and registry fire-and-forget; they
//! never await a call that could come back into them.

pub mod handlers;
pub mod instance;
pub mod pool;
pub mod types;

pub use instance::ServerInstance;
pub use pool::ServerPool;

#[cfg(test)]
mod tests;
