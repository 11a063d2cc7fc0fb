//! Server Registry Module
//!
//! The single source of truth for fleet membership (the conventional
//! "global" actor). Tracks every registered server's configuration, status
//! and heartbeat age, maintains group indexes, and evicts servers that have
//! gone silent past the stale threshold.
//!
//! ## Coupling rules
//! Registration and eviction drive the per-server instances through the
//! pool; the load balancer is only ever *notified* (fire-and-forget
//! rebalance requests). Rebalancing is self-healing, so a lost notification
//! costs nothing but latency.

pub mod handlers;
pub mod service;
pub mod types;

pub use service::ServerRegistry;
