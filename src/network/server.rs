//! Server: acceptor + pool IoWorker
//!
//! Acceptor berjalan di thread pemanggil `start()`, memakai `mio::Poll`
//! dengan timeout terbatas supaya `stop()` terlihat dalam satu interval
//! `accept_timeout`. Koneksi yang lolos filter dibagikan round-robin
//! lewat handoff ring masing-masing worker.

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, trace, warn};

use super::callback::{filter_allows, Callbacks, ConnectFilter, ConnectionCallback};
use super::connection::{Connection, ConnectionId};
use super::shared::{RunSignal, ServerShared};
use super::stats::ServerStatsSnapshot;
use super::worker::{ClientInfo, ClientRegistry, Handoff, IoWorker, WAKER_TOKEN};
use crate::config::ServerConfig;
use crate::core::RingBuffer;
use crate::error::{Result, ServerError};

const LISTENER_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 128;

/// Round-robin cursor dan id counter, hanya disentuh acceptor
#[derive(Debug)]
pub(crate) struct Dispatcher {
    next_id: u64,
    cursor: usize,
    pool_size: usize,
}

impl Dispatcher {
    pub fn new(pool_size: usize) -> Self {
        Self {
            next_id: 0,
            cursor: 0,
            pool_size: pool_size.max(1),
        }
    }

    /// Id baru dan index worker tujuan. Statis, tidak melihat beban worker.
    pub fn next(&mut self) -> (ConnectionId, usize) {
        let id = ConnectionId(self.next_id);
        let worker = self.cursor;
        self.next_id += 1;
        self.cursor = (self.cursor + 1) % self.pool_size;
        (id, worker)
    }
}

/// State milik acceptor; dikunci selama accept loop berjalan
struct Acceptor {
    listener: TcpListener,
    dispatcher: Dispatcher,
}

/// Sisi acceptor dari satu worker yang sedang berjalan
struct WorkerHandle {
    index: usize,
    handoff: Arc<Handoff>,
    waker: Arc<Waker>,
    thread: JoinHandle<()>,
}

/// TCP server dengan pool IoWorker berukuran tetap
///
/// ```no_run
/// use std::sync::Arc;
/// use sockpool::{Connection, Server, ServerConfig};
///
/// let server = Arc::new(Server::bind(ServerConfig::with_port(7000).workers(4), |conn: &mut Connection| {
///     let data = conn.take_input();
///     conn.write(&data);
/// })?);
/// let handle = server.spawn()?;
/// // ...
/// server.stop();
/// handle.join().ok();
/// # Ok::<(), sockpool::ServerError>(())
/// ```
pub struct Server {
    config: ServerConfig,
    local_addr: SocketAddr,
    shared: Arc<ServerShared>,
    acceptor: Mutex<Acceptor>,
    registries: Vec<Arc<ClientRegistry>>,
}

impl Server {
    /// Bind listening socket; pool belum berjalan sampai `start()`
    pub fn bind<F>(config: ServerConfig, on_process: F) -> Result<Self>
    where
        F: Fn(&mut Connection) + Send + Sync + 'static,
    {
        config.validate()?;

        let listener = StdTcpListener::bind(config.bind_addr).map_err(|source| {
            ServerError::Bind {
                addr: config.bind_addr,
                source,
            }
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let callbacks = Callbacks {
            on_process: Some(Arc::new(on_process)),
            ..Callbacks::default()
        };

        let registries = (0..config.workers)
            .map(|_| Arc::new(ClientRegistry::default()))
            .collect();

        Ok(Self {
            shared: Arc::new(ServerShared::new(&config, callbacks)),
            acceptor: Mutex::new(Acceptor {
                listener: TcpListener::from_std(listener),
                dispatcher: Dispatcher::new(config.workers),
            }),
            registries,
            local_addr,
            config,
        })
    }

    pub fn with_on_disconnect<F>(self, on_disconnect: F) -> Self
    where
        F: Fn(&mut Connection) + Send + Sync + 'static,
    {
        self.set_on_disconnect(on_disconnect);
        self
    }

    pub fn with_connect_filter<F>(self, filter: F) -> Self
    where
        F: Fn(&TcpStream, SocketAddr) -> bool + Send + Sync + 'static,
    {
        self.set_connect_filter(filter);
        self
    }

    // ---- lifecycle ----

    /// Jalankan pool dan accept loop; block sampai `stop()`
    ///
    /// Panggilan kedua saat server sudah berjalan langsung kembali `Ok(())`.
    /// Setelah `stop()`, `start()` berikutnya menunggu run lama selesai
    /// menutup semua koneksinya sebelum accept lagi.
    pub fn start(&self) -> Result<()> {
        let Some(run) = self.shared.try_begin() else {
            debug!(addr = %self.local_addr, "start() ignored, server already running");
            return Ok(());
        };

        // Lock acceptor dipegang run lama sampai semua worker-nya di-join
        let mut acceptor = self
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let result = self.run_pool(&mut acceptor, &run);
        self.shared.finish(&run);
        result
    }

    /// `start()` di background thread
    pub fn spawn(self: &Arc<Self>) -> Result<JoinHandle<Result<()>>> {
        let server = Arc::clone(self);
        thread::Builder::new()
            .name("sockpool-acceptor".into())
            .spawn(move || server.start())
            .map_err(|source| ServerError::Spawn {
                name: "sockpool-acceptor".into(),
                source,
            })
    }

    /// Minta accept loop dan semua worker berhenti (kooperatif)
    pub fn stop(&self) -> &Self {
        if self.shared.is_running() {
            info!(addr = %self.local_addr, "stopping server");
        }
        self.shared.halt();
        self
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn has_stopped(&self) -> bool {
        !self.shared.is_running()
    }

    // ---- accessors ----

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn worker_count(&self) -> usize {
        self.registries.len()
    }

    /// Snapshot koneksi yang dimiliki worker `index`
    pub fn clients(&self, index: usize) -> Option<Vec<ClientInfo>> {
        self.registries.get(index).map(|r| r.snapshot())
    }

    /// Total koneksi yang sedang dipegang semua worker
    pub fn connection_count(&self) -> usize {
        self.registries.iter().map(|r| r.len()).sum()
    }

    pub fn stats(&self) -> ServerStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn io_chunk_size(&self) -> usize {
        self.shared.io_chunk_size()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.shared.idle_timeout()
    }

    // ---- runtime configuration ----

    pub fn set_io_chunk_size(&self, size: usize) -> &Self {
        self.shared.set_io_chunk_size(size);
        self
    }

    pub fn set_idle_timeout(&self, timeout: Duration) -> &Self {
        self.shared.set_idle_timeout(timeout);
        self
    }

    pub fn set_on_process<F>(&self, on_process: F) -> &Self
    where
        F: Fn(&mut Connection) + Send + Sync + 'static,
    {
        let callback: ConnectionCallback = Arc::new(on_process);
        self.shared
            .update_callbacks(|c| c.on_process = Some(callback));
        self
    }

    pub fn set_on_disconnect<F>(&self, on_disconnect: F) -> &Self
    where
        F: Fn(&mut Connection) + Send + Sync + 'static,
    {
        let callback: ConnectionCallback = Arc::new(on_disconnect);
        self.shared
            .update_callbacks(|c| c.on_disconnect = Some(callback));
        self
    }

    pub fn set_connect_filter<F>(&self, filter: F) -> &Self
    where
        F: Fn(&TcpStream, SocketAddr) -> bool + Send + Sync + 'static,
    {
        self.set_filter(filter)
    }

    /// Pasang implementasi `ConnectFilter` apa pun
    pub fn set_filter(&self, filter: impl ConnectFilter + 'static) -> &Self {
        let filter: Arc<dyn ConnectFilter> = Arc::new(filter);
        self.shared
            .update_callbacks(|c| c.connect_filter = Some(filter));
        self
    }

    pub fn clear_connect_filter(&self) -> &Self {
        self.shared.update_callbacks(|c| c.connect_filter = None);
        self
    }

    // ---- internals ----

    fn run_pool(&self, acceptor: &mut Acceptor, run: &Arc<RunSignal>) -> Result<()> {
        let mut poll = Poll::new().map_err(ServerError::Poll)?;
        poll.registry()
            .register(&mut acceptor.listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(ServerError::Poll)?;

        let workers = match self.spawn_workers(run) {
            Ok(workers) => workers,
            Err(e) => {
                if let Err(err) = poll.registry().deregister(&mut acceptor.listener) {
                    debug!(error = %err, "failed to deregister listener");
                }
                return Err(e);
            }
        };

        info!(
            addr = %self.local_addr,
            workers = workers.len(),
            "server listening"
        );

        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        while !run.is_stop_requested() {
            if let Err(e) = poll.poll(&mut events, Some(self.config.accept_timeout)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    warn!(error = %e, "acceptor poll failed");
                    thread::sleep(self.config.accept_timeout);
                }
                continue;
            }
            // Tetap coba accept walau tanpa event: accept yang gagal di cycle
            // sebelumnya tidak akan memicu edge baru
            self.accept_pending(acceptor, run, &workers);
        }

        if let Err(e) = poll.registry().deregister(&mut acceptor.listener) {
            debug!(error = %e, "failed to deregister listener");
        }
        // Tidak ada push lagi setelah ini; worker boleh drain terakhir
        run.close_accept();
        join_workers(workers);
        info!(addr = %self.local_addr, "server stopped");
        Ok(())
    }

    fn spawn_workers(&self, run: &Arc<RunSignal>) -> Result<Vec<WorkerHandle>> {
        let mut workers = Vec::with_capacity(self.registries.len());

        for (index, registry) in self.registries.iter().enumerate() {
            let spawned = Poll::new()
                .and_then(|poll| {
                    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
                    Ok((poll, waker))
                })
                .map_err(ServerError::Poll)
                .and_then(|(poll, waker)| {
                    let handoff: Arc<Handoff> = Arc::new(RingBuffer::new());
                    let worker = IoWorker::new(
                        index,
                        Arc::clone(&self.shared),
                        Arc::clone(run),
                        Arc::clone(&handoff),
                        Arc::clone(registry),
                        poll,
                    );
                    let name = format!("sockpool-io-{index}");
                    thread::Builder::new()
                        .name(name.clone())
                        .spawn(move || worker.run())
                        .map(|thread| WorkerHandle {
                            index,
                            handoff,
                            waker,
                            thread,
                        })
                        .map_err(|source| ServerError::Spawn { name, source })
                });

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    error!(worker = index, error = %e, "failed to start io worker");
                    run.request_stop();
                    run.close_accept();
                    join_workers(workers);
                    return Err(e);
                }
            }
        }

        Ok(workers)
    }

    /// Accept sampai WouldBlock (mio edge-triggered)
    fn accept_pending(&self, acceptor: &mut Acceptor, run: &RunSignal, workers: &[WorkerHandle]) {
        loop {
            if run.is_stop_requested() {
                return;
            }

            match acceptor.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer, &mut acceptor.dispatcher, workers),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.shared.stats.record_accept_error();
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn admit(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        dispatcher: &mut Dispatcher,
        workers: &[WorkerHandle],
    ) {
        let callbacks = self.shared.callbacks();
        if let Some(filter) = &callbacks.connect_filter {
            match filter_allows(filter, &stream, peer) {
                Some(true) => {}
                Some(false) => {
                    self.shared.stats.record_rejected();
                    debug!(%peer, "connection rejected by filter");
                    return;
                }
                None => {
                    self.shared.stats.record_rejected();
                    self.shared.stats.record_callback_panic();
                    error!(%peer, "connect filter panicked, rejecting connection");
                    return;
                }
            }
        }

        if let Err(e) = tune_socket(&stream, &self.config) {
            warn!(%peer, error = %e, "failed to apply socket options");
        }

        let (id, index) = dispatcher.next();
        let worker = &workers[index];
        let conn = Connection::new(id, stream, Some(peer), Some(Arc::clone(&worker.waker)));
        self.hand_off(conn, &worker.handoff, &worker.waker, worker.index);
    }

    /// Push ke handoff worker; jika ring penuh koneksi langsung ditutup
    /// tanpa callback apa pun
    fn hand_off<const N: usize>(
        &self,
        conn: Connection,
        handoff: &RingBuffer<Connection, N>,
        waker: &Waker,
        worker: usize,
    ) -> bool {
        let id = conn.id();
        let peer = conn.peer_addr();

        match handoff.push(conn) {
            Ok(()) => {
                self.shared.stats.record_accepted();
                if let Err(e) = waker.wake() {
                    trace!(worker, error = %e, "failed to wake io worker");
                }
                debug!(conn_id = id.0, worker, ?peer, "connection assigned");
                true
            }
            Err(conn) => {
                self.shared.stats.record_dropped();
                warn!(
                    conn_id = id.0,
                    worker,
                    ?peer,
                    "worker handoff full, dropping connection"
                );
                drop(conn);
                false
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.halt();
    }
}

fn join_workers(workers: Vec<WorkerHandle>) {
    for worker in &workers {
        if let Err(e) = worker.waker.wake() {
            trace!(worker = worker.index, error = %e, "failed to wake io worker");
        }
    }
    for worker in workers {
        if worker.thread.join().is_err() {
            error!(worker = worker.index, "io worker thread panicked");
        }
    }
}

/// TCP_NODELAY dan ukuran buffer kernel untuk socket yang diterima
fn tune_socket(stream: &TcpStream, config: &ServerConfig) -> io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    #[cfg(unix)]
    {
        if let Some(size) = config.socket_buffer_size {
            use std::os::unix::io::AsRawFd;

            let fd = stream.as_raw_fd();
            let optval = libc::c_int::try_from(size).unwrap_or(libc::c_int::MAX);
            for opt in [libc::SO_SNDBUF, libc::SO_RCVBUF] {
                // SAFETY: fd valid selama `stream` hidup, optval berukuran c_int
                let rc = unsafe {
                    libc::setsockopt(
                        fd,
                        libc::SOL_SOCKET,
                        opt,
                        &optval as *const _ as *const libc::c_void,
                        std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                    )
                };
                if rc != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
        }
    }

    Ok(())
}
