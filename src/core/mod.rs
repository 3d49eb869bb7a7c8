//! Core module: struktur data untuk jalur I/O
//!
//! - `RingBuffer`: handoff lock-free SPSC dari acceptor ke worker
//! - `ByteQueue`: FIFO output per koneksi, bulk append / bulk consume

mod byte_queue;
mod ring_buffer;

pub use byte_queue::ByteQueue;
pub use ring_buffer::RingBuffer;
