//! FIFO byte queue untuk output yang belum terkirim
//!
//! Append ke belakang dan consume dari depan, keduanya bulk.
//! Backing storage `VecDeque<u8>` sehingga partial write tidak perlu
//! `copy_within` / compact seperti buffer linear.

use std::collections::VecDeque;
use std::io::{self, Write};

/// Kapasitas awal - cukup untuk beberapa response kecil tanpa realloc
const INITIAL_CAPACITY: usize = 4 * 1024;

/// Growable FIFO byte queue
#[derive(Debug, Default)]
pub struct ByteQueue {
    bytes: VecDeque<u8>,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity),
        }
    }

    /// Append data ke belakang queue
    #[inline]
    pub fn push(&mut self, data: &[u8]) {
        self.bytes.extend(data);
    }

    /// View front-to-back dalam dua bagian (ring bisa wrap)
    #[inline]
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        self.bytes.as_slices()
    }

    /// Buang n bytes dari depan (di-clamp ke `len`)
    #[inline]
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.bytes.len());
        self.bytes.drain(..n);
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    /// Tulis sebanyak mungkin bytes dari depan queue ke `writer`
    ///
    /// Berhenti saat queue kosong atau writer mengembalikan `WouldBlock`.
    /// Bytes yang sudah terkirim langsung di-consume, sisanya tetap di
    /// queue dengan urutan yang sama. Returns jumlah bytes yang terkirim.
    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut written = 0;

        while !self.bytes.is_empty() {
            let (front, _) = self.bytes.as_slices();
            match writer.write(front) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "Failed to write to socket",
                    ));
                }
                Ok(n) => {
                    self.consume(n);
                    written += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writer yang menerima paling banyak `max_per_call` bytes lalu
    /// bergantian mengembalikan WouldBlock, meniru socket yang penuh.
    struct ChokedWriter {
        out: Vec<u8>,
        max_per_call: usize,
        block_next: bool,
    }

    impl Write for ChokedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.block_next {
                self.block_next = false;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.block_next = true;
            let n = buf.len().min(self.max_per_call);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_push_and_consume() {
        let mut q = ByteQueue::new();
        q.push(b"hello");
        q.push(b" world");
        assert_eq!(q.len(), 11);

        q.consume(6);
        let (a, b) = q.as_slices();
        assert_eq!([a, b].concat(), b"world");

        q.consume(100);
        assert!(q.is_empty());
    }

    #[test]
    fn test_partial_writes_preserve_order() {
        let mut q = ByteQueue::new();
        q.push(&[0x41, 0x42]);
        q.push(&[0x43]);

        let mut w = ChokedWriter {
            out: Vec::new(),
            max_per_call: 1,
            block_next: false,
        };

        let mut cycles = 0;
        while !q.is_empty() {
            q.write_to(&mut w).unwrap();
            cycles += 1;
            assert!(cycles < 10);
        }

        assert_eq!(w.out, vec![0x41, 0x42, 0x43]);
        assert!(cycles > 1);
    }

    #[test]
    fn test_writes_interleaved_with_flushes() {
        let mut q = ByteQueue::with_capacity(4);
        let mut w = ChokedWriter {
            out: Vec::new(),
            max_per_call: 3,
            block_next: false,
        };

        let mut expected = Vec::new();
        for chunk in 0u8..20 {
            let data = vec![chunk; (chunk as usize % 5) + 1];
            expected.extend_from_slice(&data);
            q.push(&data);
            q.write_to(&mut w).unwrap();
        }
        while !q.is_empty() {
            q.write_to(&mut w).unwrap();
        }

        assert_eq!(w.out, expected);
    }

    #[test]
    fn test_write_zero_is_error() {
        struct Closed;
        impl Write for Closed {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut q = ByteQueue::new();
        q.push(b"x");
        let err = q.write_to(&mut Closed).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_empty_queue_writes_nothing() {
        let mut q = ByteQueue::new();
        let mut out = Vec::new();
        assert_eq!(q.write_to(&mut out).unwrap(), 0);
        assert!(out.is_empty());
    }
}
