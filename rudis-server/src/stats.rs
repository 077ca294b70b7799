//! # Server Stats
//!
//! Purpose: Lightweight atomic counters behind the `INFO` reply.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Plain `AtomicU64` counters keep the command
//!    path allocation-free.
//! 2. **Relaxed Ordering**: Counters need eventual consistency only; no
//!    cross-field ordering is promised.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of the counters.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    /// Connections accepted since startup.
    pub connections_total: u64,
    /// Currently open connections.
    pub connections_open: u64,
    /// Commands dispatched since startup.
    pub commands_total: u64,
    /// Error replies produced since startup.
    pub errors_total: u64,
}

/// Thread-safe counter set shared by every connection handler.
#[derive(Debug, Default)]
pub struct ServerStats {
    connections_total: AtomicU64,
    connections_open: AtomicU64,
    commands_total: AtomicU64,
    errors_total: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        ServerStats::default()
    }

    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_open.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_dispatched(&self) {
        self.commands_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_replied(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_open: self.connections_open.load(Ordering::Relaxed),
            commands_total: self.commands_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
        }
    }
}
