//! Error types untuk setup dan lifecycle server
//!
//! Error I/O per koneksi (read/write gagal, peer reset, EOF) tidak pernah
//! muncul di sini: semuanya diperlakukan sebagai alasan eviction.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Listening socket gagal di-bind
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// mio Poll / Waker / registrasi gagal
    #[error("poll setup failed: {0}")]
    Poll(#[source] io::Error),

    /// Thread worker atau acceptor gagal di-spawn
    #[error("failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Nilai konfigurasi tidak valid
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
