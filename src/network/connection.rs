//! Connection state dan buffering protocol
//!
//! Input: buffer append-only yang diisi worker, dikonsumsi aplikasi.
//! Output: `ByteQueue` FIFO di belakang `Arc` supaya `write` bisa dipanggil
//! dari thread mana pun; transmisi ke socket selalu dilakukan worker
//! pemilik koneksi pada langkah flush.

use std::fmt;
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::Waker;

use crate::core::ByteQueue;

/// Identitas koneksi, unik per server dan naik monoton
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Alasan koneksi di-evict oleh worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    IdleTimeout,
    PeerClosed,
    ReadError,
    WriteError,
    /// Aplikasi memanggil `close()`
    Requested,
    /// Callback `on_process` panic untuk koneksi ini
    CallbackPanicked,
    /// Server berhenti
    Shutdown,
}

impl fmt::Display for EvictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EvictReason::IdleTimeout => "idle timeout",
            EvictReason::PeerClosed => "peer closed",
            EvictReason::ReadError => "read error",
            EvictReason::WriteError => "write error",
            EvictReason::Requested => "close requested",
            EvictReason::CallbackPanicked => "callback panicked",
            EvictReason::Shutdown => "server shutdown",
        };
        f.write_str(s)
    }
}

/// Hasil satu langkah read
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    Data(usize),
    Empty,
    Closed,
    Failed(io::Error),
}

/// Output side yang di-share dengan `ConnectionWriter`
struct Outbox {
    queue: Mutex<ByteQueue>,
    pending: AtomicBool,
    close_requested: AtomicBool,
    closed: AtomicBool,
    waker: Option<Arc<Waker>>,
}

impl Outbox {
    fn lock(&self) -> MutexGuard<'_, ByteQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut queue = self.lock();
        queue.push(data);
        // Di-set selagi lock dipegang supaya flush tidak bisa menghapusnya
        // di antara push dan store
        self.pending.store(true, Ordering::Release);
    }

    fn wake(&self) {
        if let Some(waker) = &self.waker {
            let _ = waker.wake();
        }
    }
}

/// Per-client state yang dimiliki tepat satu worker
pub struct Connection {
    id: ConnectionId,
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
    remote_address: Option<String>,
    last_activity: Instant,
    input: Vec<u8>,
    input_ready: bool,
    outbox: Arc<Outbox>,
    state: i32,
    evict_reason: Option<EvictReason>,
}

impl Connection {
    /// Bungkus socket yang sudah di-accept
    ///
    /// `waker` milik worker tujuan, dipakai `ConnectionWriter` untuk
    /// membangunkan worker setelah enqueue dari thread lain.
    pub fn new(
        id: ConnectionId,
        stream: TcpStream,
        peer_addr: Option<SocketAddr>,
        waker: Option<Arc<Waker>>,
    ) -> Self {
        let peer_addr = peer_addr.or_else(|| stream.peer_addr().ok());
        Self {
            id,
            stream,
            peer_addr,
            remote_address: peer_addr.map(|addr| addr.ip().to_string()),
            last_activity: Instant::now(),
            input: Vec::new(),
            input_ready: false,
            outbox: Arc::new(Outbox {
                queue: Mutex::new(ByteQueue::new()),
                pending: AtomicBool::new(false),
                close_requested: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                waker,
            }),
            state: 0,
            evict_reason: None,
        }
    }

    #[inline(always)]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Alamat IP peer (tanpa port)
    pub fn remote_address(&self) -> Option<&str> {
        self.remote_address.as_deref()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Lama koneksi diam, diukur terhadap `now`
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Opaque protocol state tag, tidak pernah diinterpretasi core
    pub fn state(&self) -> i32 {
        self.state
    }

    pub fn set_state(&mut self, state: i32) {
        self.state = state;
    }

    // ---- input side ----

    /// Input yang belum dikonsumsi (zero-copy)
    #[inline(always)]
    pub fn readable(&self) -> &[u8] {
        &self.input
    }

    /// Consume n bytes dari depan input buffer
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.input.len());
        self.input.drain(..n);
        if self.input.is_empty() {
            self.input_ready = false;
        }
    }

    /// Ambil seluruh input sekaligus
    pub fn take_input(&mut self) -> Vec<u8> {
        self.input_ready = false;
        std::mem::take(&mut self.input)
    }

    pub fn is_input_ready(&self) -> bool {
        self.input_ready
    }

    pub fn set_input_ready(&mut self, ready: bool) {
        self.input_ready = ready;
    }

    // ---- output side ----

    /// Queue data untuk dikirim pada flush berikutnya
    ///
    /// Tidak pernah block dan tidak menyentuh socket.
    pub fn write(&self, data: &[u8]) {
        self.outbox.enqueue(data);
    }

    pub fn is_output_pending(&self) -> bool {
        self.outbox.pending.load(Ordering::Acquire)
    }

    /// Bytes yang masih menunggu di output queue
    pub fn pending_output(&self) -> usize {
        self.outbox.lock().len()
    }

    /// Minta worker menutup koneksi setelah output yang tertunda di-flush
    pub fn close(&self) {
        self.outbox.close_requested.store(true, Ordering::Release);
    }

    pub fn is_close_requested(&self) -> bool {
        self.outbox.close_requested.load(Ordering::Acquire)
    }

    /// Alasan eviction; hanya terisi saat `on_disconnect` berjalan
    pub fn evict_reason(&self) -> Option<EvictReason> {
        self.evict_reason
    }

    /// Handle `Send + Sync` untuk menulis dari thread lain
    pub fn writer(&self) -> ConnectionWriter {
        ConnectionWriter {
            id: self.id,
            outbox: Arc::clone(&self.outbox),
        }
    }

    // ---- worker side ----

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    #[inline]
    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Baca satu chunk dari socket ke input buffer
    pub(crate) fn fill_input(&mut self, scratch: &mut [u8]) -> ReadOutcome {
        loop {
            match self.stream.read(scratch) {
                Ok(0) => return ReadOutcome::Closed,
                Ok(n) => {
                    self.input.extend_from_slice(&scratch[..n]);
                    self.input_ready = true;
                    self.touch();
                    return ReadOutcome::Data(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::Empty,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return ReadOutcome::Failed(e),
            }
        }
    }

    /// Flush output queue ke socket sebanyak yang diterima kernel
    ///
    /// Sisa partial write tetap di depan queue untuk cycle berikutnya.
    pub(crate) fn flush(&mut self) -> io::Result<usize> {
        if !self.is_output_pending() {
            return Ok(0);
        }

        let written = {
            let mut queue = self.outbox.lock();
            let result = queue.write_to(&mut self.stream);
            if queue.is_empty() {
                self.outbox.pending.store(false, Ordering::Release);
            }
            result?
        };

        if written > 0 {
            self.touch();
        }
        Ok(written)
    }

    /// Tutup socket dan tandai koneksi sudah tidak hidup
    pub(crate) fn shutdown(&mut self, reason: EvictReason) {
        self.outbox.closed.store(true, Ordering::Release);
        self.evict_reason = Some(reason);
        // NotConnected wajar jika peer sudah menutup duluan
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("input_len", &self.input.len())
            .field("output_pending", &self.is_output_pending())
            .field("state", &self.state)
            .finish()
    }
}

/// Handle tulis yang bisa dipindah ke thread lain
///
/// Semua enqueue tetap masuk ke queue FIFO yang sama dengan
/// `Connection::write`, jadi urutan antar-call dipertahankan.
#[derive(Clone)]
pub struct ConnectionWriter {
    id: ConnectionId,
    outbox: Arc<Outbox>,
}

impl ConnectionWriter {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue data dan bangunkan worker pemilik koneksi
    ///
    /// Returns `false` jika koneksi sudah di-evict; data dibuang.
    pub fn write(&self, data: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        self.outbox.enqueue(data);
        self.outbox.wake();
        true
    }

    pub fn close(&self) {
        self.outbox.close_requested.store(true, Ordering::Release);
        self.outbox.wake();
    }

    pub fn is_closed(&self) -> bool {
        self.outbox.closed.load(Ordering::Acquire)
    }

    pub fn is_output_pending(&self) -> bool {
        self.outbox.pending.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ConnectionWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionWriter")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::{TcpListener, TcpStream as StdTcpStream};

    /// Pasangan socket loopback: (koneksi sisi server, client std)
    pub(crate) fn loopback_pair(id: u64) -> (Connection, StdTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = StdTcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, peer) = listener.accept().unwrap();
        server_side.set_nonblocking(true).unwrap();
        let conn = Connection::new(
            ConnectionId(id),
            TcpStream::from_std(server_side),
            Some(peer),
            None,
        );
        (conn, client)
    }

    fn read_until(conn: &mut Connection, want: usize) {
        let mut scratch = [0u8; 64];
        let deadline = Instant::now() + Duration::from_secs(2);
        while conn.readable().len() < want {
            assert!(Instant::now() < deadline, "timed out waiting for input");
            match conn.fill_input(&mut scratch) {
                ReadOutcome::Data(_) | ReadOutcome::Empty => {}
                other => panic!("unexpected read outcome: {:?}", other),
            }
        }
    }

    #[test]
    fn test_remote_address_is_ip_only() {
        let (conn, _client) = loopback_pair(7);
        assert_eq!(conn.id(), ConnectionId(7));
        assert_eq!(conn.remote_address(), Some("127.0.0.1"));
        assert!(conn.peer_addr().is_some());
    }

    #[test]
    fn test_read_appends_and_sets_ready() {
        let (mut conn, mut client) = loopback_pair(1);
        let before = conn.last_activity();

        client.write_all(b"ping").unwrap();
        read_until(&mut conn, 4);

        assert_eq!(conn.readable(), b"ping");
        assert!(conn.is_input_ready());
        assert!(conn.last_activity() >= before);

        conn.consume(2);
        assert_eq!(conn.readable(), b"ng");
        assert!(conn.is_input_ready());

        assert_eq!(conn.take_input(), b"ng".to_vec());
        assert!(!conn.is_input_ready());
    }

    #[test]
    fn test_empty_read_is_not_an_error() {
        let (mut conn, _client) = loopback_pair(1);
        let mut scratch = [0u8; 16];
        assert!(matches!(conn.fill_input(&mut scratch), ReadOutcome::Empty));
    }

    #[test]
    fn test_peer_close_reports_closed() {
        let (mut conn, client) = loopback_pair(1);
        drop(client);

        let mut scratch = [0u8; 16];
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match conn.fill_input(&mut scratch) {
                ReadOutcome::Closed | ReadOutcome::Failed(_) => break,
                _ => assert!(Instant::now() < deadline),
            }
        }
    }

    #[test]
    fn test_write_is_deferred_until_flush() {
        let (mut conn, mut client) = loopback_pair(1);

        conn.write(&[0x41, 0x42]);
        conn.write(&[0x43]);
        assert!(conn.is_output_pending());
        assert_eq!(conn.pending_output(), 3);

        let written = conn.flush().unwrap();
        assert_eq!(written, 3);
        assert!(!conn.is_output_pending());

        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0x41, 0x42, 0x43]);
    }

    #[test]
    fn test_writer_shares_queue_across_threads() {
        let (mut conn, mut client) = loopback_pair(1);
        let writer = conn.writer();

        conn.write(b"a");
        std::thread::spawn(move || {
            assert!(writer.write(b"b"));
        })
        .join()
        .unwrap();
        conn.write(b"c");

        conn.flush().unwrap();
        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn test_writer_refuses_after_shutdown() {
        let (mut conn, _client) = loopback_pair(1);
        let writer = conn.writer();

        conn.shutdown(EvictReason::Requested);

        assert!(writer.is_closed());
        assert!(!writer.write(b"late"));
        assert_eq!(conn.evict_reason(), Some(EvictReason::Requested));
    }

    #[test]
    fn test_close_request_visible_through_writer() {
        let (conn, _client) = loopback_pair(1);
        let writer = conn.writer();
        assert!(!conn.is_close_requested());
        writer.close();
        assert!(conn.is_close_requested());
    }
}
