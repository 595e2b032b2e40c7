use std::sync::atomic::Ordering;

use serde_derive::{Deserialize, Serialize};

use super::core::*;
use super::errors::QueueError;
use super::queue::ShmQueue;
use super::region::{Region, ShmRegion};
use super::stats::QueueStats;

#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct WriterConfig {
    pub shmem: ShmemConfig,
}

/// Where the next record goes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Placement {
    pub begin: u32,
    pub new_tail: u32,
    /// Offset of an end-of-queue marker to write before wrapping to 0.
    pub sentinel: Option<u32>,
}

/// Finds room for `n` bytes (header included) without letting `tail` catch
/// up with `head`.
///
/// ```text
/// wrapped:    [0 *** tail ------ head **** capacity]
/// unwrapped:  [0 --- head ***** tail --- capacity]
/// ```
#[inline]
pub(crate) fn place(head: u32, tail: u32, capacity: u32, n: u64) -> Option<Placement> {
    let (head64, tail64, capacity64) = (head as u64, tail as u64, capacity as u64);

    if tail < head {
        if tail64 + n < head64 {
            return Some(Placement {
                begin: tail,
                new_tail: (tail64 + n) as u32,
                sentinel: None,
            });
        }
        return None;
    }

    if tail64 + n < capacity64 {
        return Some(Placement {
            begin: tail,
            new_tail: (tail64 + n) as u32,
            sentinel: None,
        });
    }

    // alloc from the beginning, leaving a marker if a header still fits
    if n < head64 {
        let sentinel = (tail64 + RECORD_HEADER_SIZE as u64 <= capacity64).then_some(tail);
        return Some(Placement {
            begin: 0,
            new_tail: n as u32,
            sentinel,
        });
    }
    None
}

impl<R: Region> ShmQueue<R> {
    /// Appends one record. Returns `false` when the ring has no room for it
    /// right now; the caller decides whether to retry, drop or back off.
    pub fn push(&mut self, payload: &[u8]) -> bool {
        if payload.len() > MAX_PAYLOAD_LEN {
            tracing::warn!(name = %self.name(), len = payload.len(), "payload too large for shm queue");
            return false;
        }
        let n = (RECORD_HEADER_SIZE + payload.len()) as u64;
        let placement = match self.allocate(n) {
            Some(v) => v,
            None => return false,
        };

        if let Some(offset) = placement.sentinel {
            let filler = self.capacity() - RECORD_HEADER_SIZE as u32 - offset;
            self.write_header(offset, RecordHeader::sentinel(filler));
        }
        self.write_header(placement.begin, RecordHeader::record(payload.len() as u32));
        self.write_bytes(placement.begin + RECORD_HEADER_SIZE as u32, payload);

        // The record must be complete before the reader can see the new tail.
        let ctl = self.control();
        ctl.in_count.fetch_add(1, Ordering::Relaxed);
        ctl.inuse_bytes.fetch_add(n as i64, Ordering::Relaxed);
        ctl.tail.store(placement.new_tail, Ordering::Release);
        true
    }

    fn allocate(&self, n: u64) -> Option<Placement> {
        let capacity = self.capacity();
        let ctl = self.control();
        let head = ctl.head.load(Ordering::Acquire);
        let mut tail = ctl.tail.load(Ordering::Relaxed);

        if tail >= capacity {
            // Our own cursor, so we can repair it: restart right behind the reader.
            let repaired = if head < capacity { head } else { 0 };
            tracing::error!(
                name = %self.name(), head, tail, capacity,
                "shm corrupted! tail >= capacity, moving tail to {}", repaired
            );
            ctl.tail.store(repaired, Ordering::Release);
            tail = repaired;
        }
        if head >= capacity {
            // The reader folds an out of range head back to 0 on its next peek.
            return None;
        }
        place(head, tail, capacity, n)
    }
}

/// Producer side of a queue.
pub struct QueueWriter<R: Region = ShmRegion> {
    queue: ShmQueue<R>,
}

impl QueueWriter<ShmRegion> {
    pub fn new(cfg: &WriterConfig) -> Result<QueueWriter, QueueError> {
        let queue = ShmQueue::open(&cfg.shmem)?;
        Ok(QueueWriter { queue })
    }
}

impl<R: Region> QueueWriter<R> {
    pub fn push(&mut self, payload: &[u8]) -> bool {
        self.queue.push(payload)
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn name(&self) -> &str {
        self.queue.name()
    }

    pub fn into_inner(self) -> ShmQueue<R> {
        self.queue
    }
}

impl<R: Region> From<ShmQueue<R>> for QueueWriter<R> {
    fn from(queue: ShmQueue<R>) -> Self {
        QueueWriter { queue }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HDR: u64 = RECORD_HEADER_SIZE as u64;

    #[test]
    fn place_in_empty_ring() {
        let p = place(0, 0, 100, HDR + 1).unwrap();
        assert_eq!(p, Placement { begin: 0, new_tail: 9, sentinel: None });
    }

    #[test]
    fn place_never_fills_the_last_byte() {
        // tail + n == capacity would wrap tail to the end of the ring
        assert!(place(0, 0, 100, 99).is_some());
        assert!(place(0, 0, 100, 100).is_none());
    }

    #[test]
    fn place_wrapped_keeps_one_byte_gap() {
        assert_eq!(
            place(50, 10, 100, 39),
            Some(Placement { begin: 10, new_tail: 49, sentinel: None })
        );
        assert_eq!(place(50, 10, 100, 40), None);
    }

    #[test]
    fn place_wraps_with_sentinel() {
        let p = place(56, 84, 100, 28).unwrap();
        assert_eq!(p, Placement { begin: 0, new_tail: 28, sentinel: Some(84) });
    }

    #[test]
    fn place_wraps_without_room_for_sentinel() {
        let p = place(48, 96, 100, 38).unwrap();
        assert_eq!(p, Placement { begin: 0, new_tail: 38, sentinel: None });
    }

    #[test]
    fn place_full_when_wrap_would_reach_head() {
        assert_eq!(place(28, 84, 100, 28), None);
        assert_eq!(place(0, 84, 100, 20), None);
    }

    #[test]
    fn place_exhaustive_small_ring() {
        let capacity = 32u32;
        for head in 0..capacity {
            for tail in 0..capacity {
                for n in HDR..(capacity as u64 + 8) {
                    let p = match place(head, tail, capacity, n) {
                        Some(p) => p,
                        None => continue,
                    };
                    assert!(p.new_tail < capacity, "{} {} {} {:?}", head, tail, n, p);
                    assert_eq!(p.begin as u64 + n, p.new_tail as u64);
                    assert_ne!(p.new_tail, head, "tail must never catch head");
                    if p.begin == head {
                        assert_eq!(head, tail);
                    }
                    if tail < head {
                        assert!(p.new_tail < head);
                        assert_eq!(p.begin, tail);
                    } else if p.begin == 0 && tail != 0 {
                        assert!(p.new_tail < head);
                    }
                    if let Some(s) = p.sentinel {
                        assert_eq!(s, tail);
                        assert!(s + HDR as u32 <= capacity);
                    }
                }
            }
        }
    }
}
