//! Server configuration

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::{Result, ServerError};

/// Default jumlah bytes yang dibaca per koneksi per cycle
pub const DEFAULT_IO_CHUNK_SIZE: usize = 1024;
/// Default batas diam sebelum koneksi di-evict
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(30_000);
/// Default batas tunggu accept, menentukan seberapa cepat `stop()` terlihat
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_millis(250);
/// Default jeda worker saat tidak ada pekerjaan
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Konfigurasi server
///
/// `io_chunk_size` dan `idle_timeout` hanya nilai awal; keduanya bisa
/// diubah lewat setter `Server` saat pool sudah berjalan.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub workers: usize,
    pub io_chunk_size: usize,
    pub idle_timeout: Duration,
    pub accept_timeout: Duration,
    pub poll_interval: Duration,
    pub tcp_nodelay: bool,
    /// SO_SNDBUF / SO_RCVBUF untuk socket yang diterima (unix saja)
    pub socket_buffer_size: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9999)),
            workers: 1,
            io_chunk_size: DEFAULT_IO_CHUNK_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            tcp_nodelay: true,
            socket_buffer_size: None,
        }
    }
}

impl ServerConfig {
    /// Config default dengan port tertentu
    pub fn with_port(port: u16) -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            ..Self::default()
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn io_chunk_size(mut self, size: usize) -> Self {
        self.io_chunk_size = size;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ServerError::InvalidConfig(
                "worker pool size must be at least 1".into(),
            ));
        }
        if self.io_chunk_size == 0 {
            return Err(ServerError::InvalidConfig(
                "io_chunk_size must be at least 1 byte".into(),
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(ServerError::InvalidConfig("idle_timeout must be non-zero".into()));
        }
        if self.accept_timeout.is_zero() {
            return Err(ServerError::InvalidConfig(
                "accept_timeout must be non-zero".into(),
            ));
        }
        if self.socket_buffer_size == Some(0) {
            return Err(ServerError::InvalidConfig(
                "socket_buffer_size must be non-zero when set".into(),
            ));
        }
        Ok(())
    }
}
