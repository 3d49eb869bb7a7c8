//! Lock-Free Single-Producer Single-Consumer (SPSC) Ring Buffer
//!
//! Jalur handoff antara acceptor (producer) dan satu IoWorker (consumer).
//! Lamport Queue dengan memory ordering Acquire/Release, tanpa Mutex.
//! Berbeda dengan versi `Copy`-only, ring ini memindahkan ownership `T`
//! (misalnya `Connection` lengkap dengan socket-nya).

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Slot dalam ring buffer
struct Slot<T> {
    data: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    const fn new() -> Self {
        Self {
            data: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Lock-Free SPSC Ring Buffer
///
/// Head (producer) dan tail (consumer) berada di cache line terpisah
/// untuk menghindari false sharing antara acceptor thread dan worker thread.
#[repr(C)]
pub struct RingBuffer<T, const N: usize> {
    head: CacheLinePadded<AtomicUsize>,
    tail: CacheLinePadded<AtomicUsize>,
    buffer: Box<[Slot<T>]>,
    mask: usize,
}

/// Padding untuk cache line isolation (64 bytes pada x86-64)
#[repr(C, align(64))]
struct CacheLinePadded<T> {
    value: T,
}

impl<T> CacheLinePadded<T> {
    const fn new(value: T) -> Self {
        Self { value }
    }
}

// SAFETY: hanya satu producer yang menulis head dan hanya satu consumer
// yang menulis tail. Slot di antara tail..head hanya disentuh oleh consumer,
// slot di luar range itu hanya disentuh oleh producer.
unsafe impl<T: Send, const N: usize> Send for RingBuffer<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for RingBuffer<T, N> {}

impl<T, const N: usize> Default for RingBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> RingBuffer<T, N> {
    /// Membuat ring buffer baru. N HARUS power of 2.
    ///
    /// # Panics
    /// Panic jika N bukan power of 2 atau N == 0
    pub fn new() -> Self {
        assert!(N > 0 && N.is_power_of_two(), "N must be power of 2");

        let buffer = (0..N).map(|_| Slot::new()).collect::<Vec<_>>();

        Self {
            head: CacheLinePadded::new(AtomicUsize::new(0)),
            tail: CacheLinePadded::new(AtomicUsize::new(0)),
            buffer: buffer.into_boxed_slice(),
            mask: N - 1,
        }
    }

    /// Push value ke buffer (Producer side)
    ///
    /// Jika buffer penuh, value dikembalikan ke caller lewat `Err`
    /// supaya caller bisa menutup / membuang resource-nya sendiri.
    #[inline]
    pub fn push(&self, value: T) -> Result<(), T> {
        let head = self.head.value.load(Ordering::Relaxed);
        let tail = self.tail.value.load(Ordering::Acquire);

        if head.wrapping_sub(tail) >= N {
            return Err(value);
        }

        let slot = &self.buffer[head & self.mask];

        // SAFETY: slot ini berada di luar range tail..head, consumer tidak menyentuhnya
        unsafe {
            (*slot.data.get()).write(value);
        }

        self.head
            .value
            .store(head.wrapping_add(1), Ordering::Release);

        Ok(())
    }

    /// Pop value dari buffer (Consumer side)
    #[inline]
    pub fn pop(&self) -> Option<T> {
        let tail = self.tail.value.load(Ordering::Relaxed);
        let head = self.head.value.load(Ordering::Acquire);

        if tail == head {
            return None;
        }

        let slot = &self.buffer[tail & self.mask];

        // SAFETY: slot sudah ditulis producer (Acquire di atas) dan ownership
        // dipindahkan keluar tepat satu kali sebelum tail maju
        let value = unsafe { (*slot.data.get()).assume_init_read() };

        self.tail
            .value
            .store(tail.wrapping_add(1), Ordering::Release);

        Some(value)
    }

    /// Cek apakah buffer kosong
    #[inline]
    pub fn is_empty(&self) -> bool {
        let tail = self.tail.value.load(Ordering::Acquire);
        let head = self.head.value.load(Ordering::Acquire);
        tail == head
    }

    /// Cek apakah buffer penuh
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= N
    }

    /// Jumlah elemen dalam buffer
    #[inline]
    pub fn len(&self) -> usize {
        let head = self.head.value.load(Ordering::Acquire);
        let tail = self.tail.value.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    /// Kapasitas buffer
    #[inline(always)]
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<T, const N: usize> Drop for RingBuffer<T, N> {
    fn drop(&mut self) {
        // Elemen yang belum di-pop harus di-drop supaya socket ikut tertutup
        while self.pop().is_some() {}
    }
}
