//! Callback seam antara core dan aplikasi
//!
//! Core tidak tahu apa-apa tentang protocol; semua framing / parsing
//! dilakukan aplikasi di dalam callback `on_process`.

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use mio::net::TcpStream;

use super::Connection;

/// Predicate admission, dipanggil sekali per socket sebelum `Connection` dibuat
///
/// `false` berarti socket langsung ditutup tanpa callback apa pun.
pub trait ConnectFilter: Send + Sync {
    fn allowed(&self, stream: &TcpStream, peer: SocketAddr) -> bool;
}

impl<F> ConnectFilter for F
where
    F: Fn(&TcpStream, SocketAddr) -> bool + Send + Sync,
{
    fn allowed(&self, stream: &TcpStream, peer: SocketAddr) -> bool {
        self(stream, peer)
    }
}

/// Callback `on_process` / `on_disconnect`
///
/// Dijalankan di thread worker pemilik koneksi. Callback yang block
/// menahan semua koneksi lain di worker yang sama.
pub type ConnectionCallback = Arc<dyn Fn(&mut Connection) + Send + Sync>;

/// Snapshot callback yang dipakai satu cycle worker / satu accept
#[derive(Clone, Default)]
pub(crate) struct Callbacks {
    pub on_process: Option<ConnectionCallback>,
    pub on_disconnect: Option<ConnectionCallback>,
    pub connect_filter: Option<Arc<dyn ConnectFilter>>,
}

/// Jalankan callback di dalam failure boundary
///
/// Returns `false` jika callback panic.
pub(crate) fn invoke_guarded(callback: &ConnectionCallback, conn: &mut Connection) -> bool {
    panic::catch_unwind(AssertUnwindSafe(|| callback(conn))).is_ok()
}

/// Filter yang panic dianggap menolak koneksi
pub(crate) fn filter_allows(
    filter: &Arc<dyn ConnectFilter>,
    stream: &TcpStream,
    peer: SocketAddr,
) -> Option<bool> {
    panic::catch_unwind(AssertUnwindSafe(|| filter.allowed(stream, peer))).ok()
}
