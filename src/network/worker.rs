//! IoWorker: event loop per thread
//!
//! Setiap cycle:
//! 1. Drain handoff ring dari acceptor ke map koneksi milik worker
//! 2. Untuk setiap koneksi: read -> on_process -> flush -> evict
//! 3. Tunggu di `mio::Poll` (timeout `poll_interval`, atau nol jika masih
//!    ada data yang belum terbaca)
//!
//! Worker berhenti setelah acceptor menutup handoff (bukan saat `stop()`),
//! supaya koneksi yang di-push tepat sebelum stop tetap diambil `close_all`.
//! Output yang tertahan karena socket penuh tidak membuat cycle busy:
//! interest WRITABLE membangunkan poll saat socket bisa ditulis lagi.
//!
//! Map koneksi hanya disentuh thread worker; acceptor tidak pernah
//! memegangnya, jadi insert dan iterasi tidak bisa saling tabrakan.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error, info, trace, warn};

use super::callback::{invoke_guarded, Callbacks};
use super::connection::{Connection, ConnectionId, EvictReason, ReadOutcome};
use super::shared::{RunSignal, ServerShared};
use crate::core::RingBuffer;

/// Kapasitas handoff acceptor -> worker (power of 2)
pub(crate) const HANDOFF_CAPACITY: usize = 1024;

/// Token waker; token koneksi dimulai dari 1
pub(crate) const WAKER_TOKEN: Token = Token(0);

const EVENTS_CAPACITY: usize = 256;

pub(crate) type Handoff = RingBuffer<Connection, HANDOFF_CAPACITY>;

/// Info koneksi yang bisa dibaca dari luar thread worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ConnectionId,
    pub remote_address: Option<String>,
    pub peer_addr: Option<SocketAddr>,
}

/// Daftar koneksi per worker untuk `Server::clients`
///
/// Hanya worker yang menulis; pembaca mendapat snapshot.
#[derive(Debug, Default)]
pub(crate) struct ClientRegistry {
    clients: Mutex<BTreeMap<ConnectionId, ClientInfo>>,
}

impl ClientRegistry {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<ConnectionId, ClientInfo>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, conn: &Connection) {
        self.lock().insert(
            conn.id(),
            ClientInfo {
                id: conn.id(),
                remote_address: conn.remote_address().map(str::to_owned),
                peer_addr: conn.peer_addr(),
            },
        );
    }

    fn remove(&self, id: ConnectionId) {
        self.lock().remove(&id);
    }

    pub fn snapshot(&self) -> Vec<ClientInfo> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Hasil servis satu koneksi dalam satu cycle
enum Step {
    Keep { more_input: bool },
    Evict(EvictReason),
}

pub(crate) struct IoWorker {
    index: usize,
    shared: Arc<ServerShared>,
    run: Arc<RunSignal>,
    handoff: Arc<Handoff>,
    clients: Arc<ClientRegistry>,
    poll: Poll,
    events: Events,
    connections: HashMap<ConnectionId, Connection>,
    // Buffer reuse antar cycle
    scratch: Vec<u8>,
    ids: Vec<ConnectionId>,
}

impl IoWorker {
    pub fn new(
        index: usize,
        shared: Arc<ServerShared>,
        run: Arc<RunSignal>,
        handoff: Arc<Handoff>,
        clients: Arc<ClientRegistry>,
        poll: Poll,
    ) -> Self {
        Self {
            index,
            shared,
            run,
            handoff,
            clients,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            connections: HashMap::new(),
            scratch: Vec::new(),
            ids: Vec::new(),
        }
    }

    /// Loop utama; kembali setelah acceptor selesai dan semua koneksi ditutup
    pub fn run(mut self) {
        info!(worker = self.index, "io worker started");

        while !self.run.is_accept_closed() {
            self.drain_handoff();
            let busy = self.run_cycle(Instant::now());

            let timeout = if busy {
                Duration::ZERO
            } else {
                self.shared.poll_interval()
            };
            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    warn!(worker = self.index, error = %e, "poll failed");
                    std::thread::sleep(timeout);
                }
            }
        }

        self.close_all();
        info!(worker = self.index, "io worker stopped");
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Pindahkan koneksi baru dari acceptor ke map milik worker
    pub fn drain_handoff(&mut self) -> usize {
        let mut taken = 0;
        while let Some(mut conn) = self.handoff.pop() {
            let token = Token((conn.id().0 as usize).wrapping_add(1));
            // Registrasi hanya untuk wakeup lebih cepat; cycle tetap
            // memeriksa semua koneksi, jadi kegagalan di sini tidak fatal
            if let Err(e) = self.poll.registry().register(
                conn.stream_mut(),
                token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                warn!(worker = self.index, conn_id = conn.id().0, error = %e,
                    "failed to register connection with poll");
            }

            debug!(
                worker = self.index,
                conn_id = conn.id().0,
                peer = ?conn.peer_addr(),
                "connection attached"
            );
            self.clients.insert(&conn);
            self.connections.insert(conn.id(), conn);
            taken += 1;
        }
        taken
    }

    /// Satu putaran read / process / flush / evict atas semua koneksi
    ///
    /// Returns `true` jika ada koneksi yang mengisi chunk penuh
    /// (kemungkinan masih ada data di socket).
    pub fn run_cycle(&mut self, now: Instant) -> bool {
        let callbacks = self.shared.callbacks();
        let chunk = self.shared.io_chunk_size();
        let idle_timeout = self.shared.idle_timeout();
        if self.scratch.len() != chunk {
            self.scratch.resize(chunk, 0);
        }

        self.ids.clear();
        self.ids.extend(self.connections.keys().copied());

        let mut busy = false;
        for i in 0..self.ids.len() {
            let id = self.ids[i];
            let Some(conn) = self.connections.get_mut(&id) else {
                continue;
            };

            let step = service(
                conn,
                &mut self.scratch,
                &self.shared,
                &callbacks,
                now,
                idle_timeout,
            );
            match step {
                Step::Keep { more_input } => busy |= more_input,
                Step::Evict(reason) => {
                    self.evict_with(id, reason, &callbacks);
                }
            }
        }

        busy
    }

    /// Evict koneksi; idempotent
    ///
    /// Returns `false` jika koneksi sudah tidak ada di worker ini.
    #[cfg(test)]
    pub fn evict(&mut self, id: ConnectionId, reason: EvictReason) -> bool {
        let callbacks = self.shared.callbacks();
        self.evict_with(id, reason, &callbacks)
    }

    fn evict_with(&mut self, id: ConnectionId, reason: EvictReason, callbacks: &Callbacks) -> bool {
        let Some(mut conn) = self.connections.remove(&id) else {
            return false;
        };

        if let Err(e) = self.poll.registry().deregister(conn.stream_mut()) {
            trace!(worker = self.index, conn_id = id.0, error = %e,
                "failed to deregister connection");
        }
        conn.shutdown(reason);
        self.clients.remove(id);
        self.shared
            .stats
            .record_eviction(reason == EvictReason::IdleTimeout);

        debug!(
            worker = self.index,
            conn_id = id.0,
            peer = ?conn.peer_addr(),
            %reason,
            "connection evicted"
        );

        if let Some(on_disconnect) = &callbacks.on_disconnect {
            if !invoke_guarded(on_disconnect, &mut conn) {
                self.shared.stats.record_callback_panic();
                error!(worker = self.index, conn_id = id.0, "on_disconnect callback panicked");
            }
        }

        true
    }

    /// Dipanggil saat server berhenti: flush terakhir lalu evict semua
    fn close_all(&mut self) {
        self.drain_handoff();
        let callbacks = self.shared.callbacks();
        if !self.connections.is_empty() {
            debug!(worker = self.index, connections = self.len(), "closing remaining connections");
        }

        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            if let Some(conn) = self.connections.get_mut(&id) {
                if let Ok(n) = conn.flush() {
                    self.shared.stats.add_sent(n);
                }
            }
            self.evict_with(id, EvictReason::Shutdown, &callbacks);
        }
    }
}

/// Empat langkah per koneksi, selalu dalam urutan ini
fn service(
    conn: &mut Connection,
    scratch: &mut [u8],
    shared: &ServerShared,
    callbacks: &Callbacks,
    now: Instant,
    idle_timeout: Duration,
) -> Step {
    // 1. Read
    let mut more_input = false;
    match conn.fill_input(scratch) {
        ReadOutcome::Data(n) => {
            shared.stats.add_received(n);
            more_input = n == scratch.len();
            trace!(conn_id = conn.id().0, bytes = n, "read");

            // 2. Notify
            if let Some(on_process) = &callbacks.on_process {
                if !invoke_guarded(on_process, conn) {
                    shared.stats.record_callback_panic();
                    error!(conn_id = conn.id().0, "on_process callback panicked");
                    return Step::Evict(EvictReason::CallbackPanicked);
                }
            }
        }
        ReadOutcome::Empty => {}
        ReadOutcome::Closed => return Step::Evict(EvictReason::PeerClosed),
        ReadOutcome::Failed(e) => {
            debug!(conn_id = conn.id().0, error = %e, "read failed");
            return Step::Evict(EvictReason::ReadError);
        }
    }

    // 3. Flush
    match conn.flush() {
        Ok(n) => {
            if n > 0 {
                shared.stats.add_sent(n);
                trace!(conn_id = conn.id().0, bytes = n, "flushed");
            }
        }
        Err(e) => {
            debug!(conn_id = conn.id().0, error = %e, "write failed");
            return Step::Evict(EvictReason::WriteError);
        }
    }

    // 4. Evict
    if conn.is_close_requested() {
        return Step::Evict(EvictReason::Requested);
    }
    if conn.idle_for(now) > idle_timeout {
        return Step::Evict(EvictReason::IdleTimeout);
    }

    Step::Keep { more_input }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::network::connection::tests::loopback_pair;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn worker_with(config: ServerConfig, callbacks: Callbacks) -> (IoWorker, Arc<Handoff>) {
        let shared = Arc::new(ServerShared::new(&config, callbacks));
        let handoff: Arc<Handoff> = Arc::new(RingBuffer::new());
        let worker = IoWorker::new(
            0,
            shared,
            Arc::new(RunSignal::default()),
            Arc::clone(&handoff),
            Arc::new(ClientRegistry::default()),
            Poll::new().unwrap(),
        );
        (worker, handoff)
    }

    fn counting_disconnect(counter: &Arc<AtomicUsize>) -> Callbacks {
        let counter = Arc::clone(counter);
        Callbacks {
            on_disconnect: Some(Arc::new(move |_conn: &mut Connection| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..Callbacks::default()
        }
    }

    #[test]
    fn test_evict_is_idempotent() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let (mut worker, handoff) =
            worker_with(ServerConfig::default(), counting_disconnect(&disconnects));

        let (conn, _client) = loopback_pair(3);
        handoff.push(conn).unwrap();
        assert_eq!(worker.drain_handoff(), 1);
        assert_eq!(worker.clients.len(), 1);

        assert!(worker.evict(ConnectionId(3), EvictReason::Requested));
        assert!(!worker.evict(ConnectionId(3), EvictReason::Requested));

        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(worker.len(), 0);
        assert_eq!(worker.clients.len(), 0);
    }

    #[test]
    fn test_idle_connection_evicted_after_timeout() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let config = ServerConfig::default().idle_timeout(Duration::from_millis(50));
        let (mut worker, handoff) = worker_with(config, counting_disconnect(&disconnects));

        let (conn, mut client) = loopback_pair(1);
        handoff.push(conn).unwrap();
        worker.drain_handoff();

        // Belum lewat timeout
        worker.run_cycle(Instant::now());
        assert_eq!(worker.len(), 1);

        worker.run_cycle(Instant::now() + Duration::from_millis(200));
        assert_eq!(worker.len(), 0);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);

        // Peer melihat socket tertutup
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
    }

    #[test]
    fn test_cycle_reads_processes_and_flushes() {
        let callbacks = Callbacks {
            on_process: Some(Arc::new(|conn: &mut Connection| {
                let data = conn.take_input();
                conn.write(&data);
            })),
            ..Callbacks::default()
        };
        let (mut worker, handoff) = worker_with(ServerConfig::default(), callbacks);

        let (conn, mut client) = loopback_pair(1);
        handoff.push(conn).unwrap();
        worker.drain_handoff();

        client.write_all(b"echo").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut received = Vec::new();
        while received.len() < 4 {
            assert!(Instant::now() < deadline);
            worker.run_cycle(Instant::now());
            client.set_nonblocking(true).unwrap();
            let mut buf = [0u8; 16];
            if let Ok(n) = client.read(&mut buf) {
                received.extend_from_slice(&buf[..n]);
            }
            client.set_nonblocking(false).unwrap();
        }
        assert_eq!(received, b"echo");
    }

    #[test]
    fn test_chunk_size_bounds_each_read() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let callbacks = {
            let seen = Arc::clone(&seen);
            Callbacks {
                on_process: Some(Arc::new(move |conn: &mut Connection| {
                    seen.lock().unwrap().push(conn.take_input().len());
                })),
                ..Callbacks::default()
            }
        };
        let (mut worker, handoff) = worker_with(ServerConfig::default().io_chunk_size(4), callbacks);

        let (conn, mut client) = loopback_pair(1);
        handoff.push(conn).unwrap();
        worker.drain_handoff();

        client.write_all(&[7u8; 10]).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.lock().unwrap().iter().sum::<usize>() < 10 {
            assert!(Instant::now() < deadline);
            worker.run_cycle(Instant::now());
        }
        assert!(seen.lock().unwrap().iter().all(|&n| n <= 4));
    }

    #[test]
    fn test_panicking_callback_only_evicts_its_connection() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let mut callbacks = counting_disconnect(&disconnects);
        callbacks.on_process = Some(Arc::new(|conn: &mut Connection| {
            if conn.readable().contains(&b'!') {
                panic!("bad input");
            }
            conn.take_input();
        }));
        let (mut worker, handoff) = worker_with(ServerConfig::default(), callbacks);

        let (bad, mut bad_client) = loopback_pair(1);
        let (good, mut good_client) = loopback_pair(2);
        handoff.push(bad).unwrap();
        handoff.push(good).unwrap();
        worker.drain_handoff();

        bad_client.write_all(b"!").unwrap();
        good_client.write_all(b"ok").unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while worker.len() == 2 {
            assert!(Instant::now() < deadline);
            worker.run_cycle(Instant::now());
        }

        assert!(worker.connections.contains_key(&ConnectionId(2)));
        assert!(!worker.connections.contains_key(&ConnectionId(1)));
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(worker.shared.stats.snapshot().callback_panics, 1);
    }

    #[test]
    fn test_unflushed_output_does_not_refresh_idle_clock() {
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let callbacks = {
            let reasons = Arc::clone(&reasons);
            Callbacks {
                on_process: Some(Arc::new(|conn: &mut Connection| {
                    conn.take_input();
                    // Jauh melebihi buffer socket; peer tidak pernah membaca
                    conn.write(&vec![0x5a; 16 * 1024 * 1024]);
                })),
                on_disconnect: Some(Arc::new(move |conn: &mut Connection| {
                    reasons.lock().unwrap().push(conn.evict_reason());
                })),
                ..Callbacks::default()
            }
        };
        let config = ServerConfig::default().idle_timeout(Duration::from_millis(500));
        let (mut worker, handoff) = worker_with(config, callbacks);

        let (conn, mut client) = loopback_pair(1);
        handoff.push(conn).unwrap();
        worker.drain_handoff();
        client.write_all(b"go").unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while worker.shared.stats.snapshot().bytes_sent == 0 {
            assert!(Instant::now() < deadline);
            // Socket penuh bukan alasan untuk cycle busy
            assert!(!worker.run_cycle(Instant::now()));
        }
        assert!(worker.connections[&ConnectionId(1)].is_output_pending());

        // Peer diam dan tidak membaca; hanya waktu yang berjalan
        while worker.len() == 1 {
            assert!(Instant::now() < deadline);
            worker.run_cycle(Instant::now() + Duration::from_secs(2));
        }
        assert_eq!(*reasons.lock().unwrap(), vec![Some(EvictReason::IdleTimeout)]);
        assert_eq!(worker.shared.stats.snapshot().idle_evictions, 1);
        drop(client);
    }

    #[test]
    fn test_panicking_disconnect_callback_is_ignored() {
        let callbacks = Callbacks {
            on_disconnect: Some(Arc::new(|_conn: &mut Connection| {
                panic!("disconnect handler failed");
            })),
            ..Callbacks::default()
        };
        let (mut worker, handoff) = worker_with(ServerConfig::default(), callbacks);

        let (a, _ca) = loopback_pair(1);
        let (b, _cb) = loopback_pair(2);
        handoff.push(a).unwrap();
        handoff.push(b).unwrap();
        worker.drain_handoff();

        assert!(worker.evict(ConnectionId(1), EvictReason::Requested));
        assert_eq!(worker.len(), 1);
        assert_eq!(worker.clients.len(), 1);

        // Worker tetap jalan untuk koneksi lain
        worker.close_all();
        assert_eq!(worker.len(), 0);

        let stats = worker.shared.stats.snapshot();
        assert_eq!(stats.callback_panics, 2);
        assert_eq!(stats.evictions, 2);
    }

    #[test]
    fn test_close_all_disconnects_every_connection_once() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let (mut worker, handoff) =
            worker_with(ServerConfig::default(), counting_disconnect(&disconnects));

        let (a, _ca) = loopback_pair(1);
        let (b, _cb) = loopback_pair(2);
        handoff.push(a).unwrap();
        worker.drain_handoff();
        // b masih di handoff saat shutdown
        handoff.push(b).unwrap();

        worker.close_all();
        assert_eq!(worker.len(), 0);
        assert_eq!(disconnects.load(Ordering::SeqCst), 2);
    }
}
