//! Network Layer: acceptor, IoWorker pool, dan connection buffering
//!
//! Alur data:
//! Acceptor -> handoff ring worker[i] -> read ke input buffer ->
//! `on_process` -> `write` ke output queue -> flush di cycle berikutnya ->
//! evict (idle / error / close) -> `on_disconnect`.
//!
//! Threading: satu thread acceptor, satu thread per worker. Callback
//! selalu berjalan di thread worker pemilik koneksi.

mod callback;
mod connection;
mod server;
mod shared;
mod stats;
mod worker;

pub use callback::{ConnectFilter, ConnectionCallback};
pub use connection::{Connection, ConnectionId, ConnectionWriter, EvictReason};
pub use server::Server;
pub use stats::ServerStatsSnapshot;
pub use worker::ClientInfo;
