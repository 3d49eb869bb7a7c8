//! Server statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Counter atomik yang di-update acceptor dan semua worker
#[derive(Debug, Default)]
pub(crate) struct ServerStats {
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    connections_dropped: AtomicU64,
    connections_active: AtomicU64,
    evictions: AtomicU64,
    idle_evictions: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    accept_errors: AtomicU64,
    callback_panics: AtomicU64,
}

/// Salinan counter pada satu titik waktu
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub connections_dropped: u64,
    pub connections_active: u64,
    pub evictions: u64,
    pub idle_evictions: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub accept_errors: u64,
    pub callback_panics: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.connections_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self, idle: bool) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
        if idle {
            self.idle_evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_callback_panic(&self) {
        self.callback_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            connections_dropped: self.connections_dropped.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            idle_evictions: self.idle_evictions.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            callback_panics: self.callback_panics.load(Ordering::Relaxed),
        }
    }
}
