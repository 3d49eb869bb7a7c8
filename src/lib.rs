//! Sockpool - Embeddable TCP Connection Multiplexer
//!
//! Arsitektur:
//! - Satu acceptor thread, pool IoWorker berukuran tetap
//! - Distribusi round-robin statis berdasarkan urutan kedatangan
//! - Per koneksi: read chunk -> callback aplikasi -> flush FIFO -> idle eviction
//! - Protocol sepenuhnya milik aplikasi lewat callback `on_process`

pub mod config;
pub mod core;
pub mod error;
pub mod network;

pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use network::{
    ClientInfo, ConnectFilter, Connection, ConnectionCallback, ConnectionId, ConnectionWriter,
    EvictReason, Server, ServerStatsSnapshot,
};
