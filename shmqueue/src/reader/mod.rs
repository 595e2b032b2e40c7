use std::sync::atomic::Ordering;

use serde_derive::{Deserialize, Serialize};

use super::core::*;
use super::errors::QueueError;
use super::queue::ShmQueue;
use super::region::{Region, ShmRegion};
use super::stats::QueueStats;

#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct ReaderConfig {
    pub shmem: ShmemConfig,
}

/// A validated record at `head`.
#[derive(Copy, Clone, Debug)]
struct Front {
    head: u32,
    header: RecordHeader,
}

impl<R: Region> ShmQueue<R> {
    /// Oldest unread payload, left in place until [`pop`](Self::pop).
    ///
    /// Returns `None` both for an empty queue and for one that was just found
    /// corrupted and reset; [`emergency_resets`](Self::emergency_resets) tells
    /// the two apart.
    pub fn peek(&self) -> Option<&[u8]> {
        let front = self.front()?;
        let offset = front.head + RECORD_HEADER_SIZE as u32;
        // `front` checked the record lies before the limit; the writer does
        // not reuse it until head moves, which needs `&mut self`.
        Some(unsafe { self.bytes(offset, front.header.payload_len) })
    }

    /// Drops the oldest unread record. `false` if there was none.
    pub fn pop(&mut self) -> bool {
        let front = match self.front() {
            Some(v) => v,
            None => return false,
        };
        let len = front.header.record_len();
        let ctl = self.control();
        ctl.out_count.fetch_add(1, Ordering::Relaxed);
        ctl.inuse_bytes.fetch_sub(len as i64, Ordering::Relaxed);
        ctl.head.store((front.head as u64 + len) as u32, Ordering::Release);
        true
    }

    /// Hands the oldest payload to `f`, then pops it.
    pub fn read<F, T>(&mut self, f: F) -> Option<T>
    where
        F: FnOnce(&[u8]) -> T,
    {
        let result = f(self.peek()?);
        self.pop();
        Some(result)
    }

    /// Locates and validates the record at `head`, folding `head` back to 0
    /// when the writer has wrapped.
    fn front(&self) -> Option<Front> {
        let capacity = self.capacity();
        let ctl = self.control();
        let tail = ctl.tail.load(Ordering::Acquire);
        let mut head = ctl.head.load(Ordering::Relaxed);

        if tail >= capacity {
            // Not ours to fix; the writer repairs tail on its next push.
            self.corrupted(head, tail, "tail >= capacity");
            return None;
        }

        // Records may only extend up to the write cursor, except for the
        // stretch between head and the end of the ring once the writer wrapped.
        let mut limit = tail;

        //[0 *** tail ------ head **** capacity]
        if tail < head {
            if head as u64 + RECORD_HEADER_SIZE as u64 > capacity as u64 {
                head = 0;
                ctl.head.store(0, Ordering::Release);
            } else if self.read_header(head).end_of_queue {
                head = 0;
                ctl.head.store(0, Ordering::Release);
            } else {
                limit = capacity;
            }
        }

        if head == tail {
            return None;
        }

        //[0 --- head ***** tail --- capacity]
        if head as u64 + RECORD_HEADER_SIZE as u64 > limit as u64 {
            self.corrupted(head, tail, "header runs past tail");
            self.emergency_reset(tail);
            return None;
        }

        let header = self.read_header(head);
        if !header.has_valid_magic() {
            self.corrupted(head, tail, "wrong magic");
            self.emergency_reset(tail);
            return None;
        }

        if head as u64 + header.record_len() > limit as u64 {
            tracing::error!(
                name = %self.name(),
                head,
                payload_len = header.payload_len,
                tail,
                capacity,
                "shm corrupted! payload runs past tail"
            );
            self.emergency_reset(tail);
            return None;
        }

        Some(Front { head, header })
    }

    fn corrupted(&self, head: u32, tail: u32, reason: &str) {
        tracing::error!(
            name = %self.name(),
            head,
            tail,
            capacity = self.capacity(),
            reason,
            "shm corrupted!"
        );
    }

    /// Drops every unread record by moving `head` onto `tail`.
    fn emergency_reset(&self, tail: u32) {
        let ctl = self.control();
        tracing::error!(
            name = %self.name(),
            head = ctl.head.load(Ordering::Relaxed),
            tail,
            capacity = self.capacity(),
            create_time = ctl.create_time.load(Ordering::Relaxed),
            in_count = ctl.in_count.load(Ordering::Relaxed),
            out_count = ctl.out_count.load(Ordering::Relaxed),
            "shm queue corrupted, do emergency reset"
        );
        ctl.head.store(tail, Ordering::Release);
        self.count_reset();
    }
}

/// Consumer side of a queue.
pub struct QueueReader<R: Region = ShmRegion> {
    queue: ShmQueue<R>,
}

impl QueueReader<ShmRegion> {
    pub fn new(cfg: &ReaderConfig) -> Result<QueueReader, QueueError> {
        let queue = ShmQueue::open(&cfg.shmem)?;
        Ok(QueueReader { queue })
    }
}

impl<R: Region> QueueReader<R> {
    pub fn peek(&self) -> Option<&[u8]> {
        self.queue.peek()
    }

    pub fn pop(&mut self) -> bool {
        self.queue.pop()
    }

    pub fn read<F, T>(&mut self, f: F) -> Option<T>
    where
        F: FnOnce(&[u8]) -> T,
    {
        self.queue.read(f)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn emergency_resets(&self) -> u64 {
        self.queue.emergency_resets()
    }

    pub fn name(&self) -> &str {
        self.queue.name()
    }

    pub fn into_inner(self) -> ShmQueue<R> {
        self.queue
    }
}

impl<R: Region> From<ShmQueue<R>> for QueueReader<R> {
    fn from(queue: ShmQueue<R>) -> Self {
        QueueReader { queue }
    }
}
