//! Single-producer single-consumer byte queue in named shared memory.
//!
//! One writer process appends variable length records, one reader process
//! takes them off in FIFO order. The two only share the mapped region: a
//! 40-byte control block followed by the ring storage. No locks are involved;
//! each side owns one cursor and publishes it with release/acquire ordering.
//!
//! ```no_run
//! use shmqueue::ShmQueue;
//!
//! let mut queue = ShmQueue::init("orders_queue_1", 10_240)?;
//! queue.push(b"hello");
//! while let Some(len) = queue.read(|payload| payload.len()) {
//!     println!("element len: {}", len);
//! }
//! # Ok::<(), shmqueue::QueueError>(())
//! ```

pub mod core;
mod errors;
mod queue;
pub mod reader;
pub mod region;
mod stats;
pub mod writer;


pub use crate::core::{ShmemConfig, CONTROL_BLOCK_SIZE, MAX_PAYLOAD_LEN, RECORD_HEADER_SIZE};
pub use errors::QueueError;
pub use queue::ShmQueue;
pub use reader::{QueueReader, ReaderConfig};
pub use region::{HeapRegion, Region, ShmRegion};
pub use stats::QueueStats;
pub use writer::{QueueWriter, WriterConfig};
