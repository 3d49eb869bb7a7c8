//! State yang dibaca bersama oleh acceptor dan semua worker
//!
//! Tunables disimpan sebagai atomics supaya bisa diubah saat pool
//! berjalan. Nilainya best-effort: worker membaca ulang di awal cycle.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use super::callback::Callbacks;
use super::stats::ServerStats;
use crate::config::ServerConfig;

/// Sinyal untuk satu run `start()`; setiap run mendapat yang baru
///
/// `stop_requested` menghentikan accept loop. `accept_closed` baru di-set
/// setelah acceptor selesai push ke handoff, jadi worker yang melihatnya
/// tahu drain terakhir di `close_all` mengambil semua koneksi.
#[derive(Debug, Default)]
pub(crate) struct RunSignal {
    stop_requested: AtomicBool,
    accept_closed: AtomicBool,
}

impl RunSignal {
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub fn close_accept(&self) {
        self.accept_closed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_accept_closed(&self) -> bool {
        self.accept_closed.load(Ordering::Acquire)
    }
}

pub(crate) struct ServerShared {
    run: Mutex<Option<Arc<RunSignal>>>,
    io_chunk_size: AtomicUsize,
    idle_timeout_ms: AtomicU64,
    poll_interval: Duration,
    callbacks: RwLock<Callbacks>,
    pub stats: ServerStats,
}

impl ServerShared {
    pub fn new(config: &ServerConfig, callbacks: Callbacks) -> Self {
        Self {
            run: Mutex::new(None),
            io_chunk_size: AtomicUsize::new(config.io_chunk_size),
            idle_timeout_ms: AtomicU64::new(duration_to_ms(config.idle_timeout)),
            poll_interval: config.poll_interval,
            callbacks: RwLock::new(callbacks),
            stats: ServerStats::new(),
        }
    }

    fn run_slot(&self) -> MutexGuard<'_, Option<Arc<RunSignal>>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.run_slot()
            .as_ref()
            .is_some_and(|run| !run.is_stop_requested())
    }

    /// Pasang run baru; `None` jika run aktif belum di-stop
    ///
    /// Run lama yang sudah di-stop boleh masih shutdown; pemanggil harus
    /// menunggu lock acceptor sebelum mulai.
    pub fn try_begin(&self) -> Option<Arc<RunSignal>> {
        let mut slot = self.run_slot();
        if slot.as_ref().is_some_and(|run| !run.is_stop_requested()) {
            return None;
        }
        let run = Arc::new(RunSignal::default());
        *slot = Some(Arc::clone(&run));
        Some(run)
    }

    /// Minta run aktif berhenti
    pub fn halt(&self) {
        if let Some(run) = self.run_slot().as_ref() {
            run.request_stop();
        }
    }

    /// Kosongkan slot hanya jika masih dipegang `run`
    pub fn finish(&self, run: &Arc<RunSignal>) {
        run.request_stop();
        let mut slot = self.run_slot();
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, run)) {
            *slot = None;
        }
    }

    #[inline]
    pub fn io_chunk_size(&self) -> usize {
        self.io_chunk_size.load(Ordering::Relaxed).max(1)
    }

    pub fn set_io_chunk_size(&self, size: usize) {
        self.io_chunk_size.store(size, Ordering::Relaxed);
    }

    #[inline]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_idle_timeout(&self, timeout: Duration) {
        self.idle_timeout_ms
            .store(duration_to_ms(timeout), Ordering::Relaxed);
    }

    #[inline]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Clone `Arc` callback; lock tidak pernah dipegang saat callback berjalan
    pub fn callbacks(&self) -> Callbacks {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_callbacks(&self, f: impl FnOnce(&mut Callbacks)) {
        let mut guard = self
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut *guard);
    }
}

fn duration_to_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
