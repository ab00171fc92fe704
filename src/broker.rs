//! The coordination broker
//!
//! Accepts agent sessions on a loopback-bound ephemeral port, owns the
//! registry, channel table, and reservation table, routes records, and
//! reaps sessions whose heartbeats stop.

mod server;
mod state;


pub use server::{Broker, BrokerError};

use std::time::Duration;

/// How often the reaper sweeps the registry.
pub const HEARTBEAT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// An agent whose last heartbeat is older than this is forcibly disconnected.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);
