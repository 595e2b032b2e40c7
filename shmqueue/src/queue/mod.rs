use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::*;
use crate::errors::QueueError;
use crate::region::{Region, ShmRegion};
use crate::stats::QueueStats;

/// Single-producer single-consumer byte queue over a [`Region`].
///
/// One process pushes, one process peeks and pops. Nothing here takes a lock:
/// the writer only ever moves `tail`, the reader only ever moves `head`.
pub struct ShmQueue<R: Region = ShmRegion> {
    region: R,
    // Copied once at open time, so a scribbled control block can never steer
    // an access outside the mapping.
    capacity: u32,
    resets: AtomicU64,
}

impl ShmQueue<ShmRegion> {
    /// Attaches to `name`, creating a region of at least `size_hint` bytes if
    /// it does not exist yet.
    pub fn init(name: &str, size_hint: usize) -> Result<Self, QueueError> {
        let cfg = ShmemConfig::builder().name(name).size(size_hint).build()?;
        ShmQueue::open(&cfg)
    }

    pub fn open(cfg: &ShmemConfig) -> Result<Self, QueueError> {
        let region = ShmRegion::open_or_create(cfg).map_err(|e| {
            tracing::error!(name = %cfg.name, error = %e, "open shm queue failed");
            e
        })?;
        ShmQueue::from_region(region)
    }
}

impl<R: Region> ShmQueue<R> {
    /// Initializes the control block if `region` was just created, otherwise
    /// checks it against the mapping size.
    pub fn from_region(region: R) -> Result<Self, QueueError> {
        if region.as_ptr() as usize % std::mem::align_of::<ControlBlock>() != 0 {
            return Err(QueueError::layout(region.name(), "mapping is not 8-byte aligned"));
        }
        if region.len() <= CONTROL_BLOCK_SIZE + RECORD_HEADER_SIZE {
            return Err(QueueError::layout(
                region.name(),
                format!("mapping of {} bytes cannot hold a queue", region.len()),
            ));
        }
        let usable = (region.len() - CONTROL_BLOCK_SIZE).min(u32::MAX as usize) as u32;

        let mut queue = ShmQueue {
            region,
            capacity: 0,
            resets: AtomicU64::new(0),
        };
        if queue.region.is_created() {
            queue.reset_control(usable);
        }

        let capacity = queue.control().capacity.load(Ordering::Acquire);
        if capacity as usize <= RECORD_HEADER_SIZE || capacity > usable {
            return Err(QueueError::layout(
                queue.name(),
                format!("capacity {} does not fit a mapping of {} usable bytes", capacity, usable),
            ));
        }
        queue.capacity = capacity;

        let ctl = queue.control();
        tracing::info!(
            name = %queue.name(),
            head = ctl.head.load(Ordering::Relaxed),
            tail = ctl.tail.load(Ordering::Relaxed),
            capacity,
            create_time = ctl.create_time.load(Ordering::Relaxed),
            in_count = ctl.in_count.load(Ordering::Relaxed),
            out_count = ctl.out_count.load(Ordering::Relaxed),
            created = queue.region.is_created(),
            "open shm queue success"
        );
        Ok(queue)
    }

    /// Clears every previous element. Only called by the creating process.
    fn reset_control(&mut self, capacity: u32) {
        let create_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let ctl = self.control();
        ctl.head.store(0, Ordering::Relaxed);
        ctl.tail.store(0, Ordering::Relaxed);
        ctl.in_count.store(0, Ordering::Relaxed);
        ctl.out_count.store(0, Ordering::Relaxed);
        ctl.inuse_bytes.store(0, Ordering::Relaxed);
        ctl.create_time.store(create_time, Ordering::Relaxed);
        ctl.capacity.store(capacity, Ordering::Release);
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    /// Usable ring bytes, excluding the control block.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn create_time(&self) -> u32 {
        self.control().create_time.load(Ordering::Relaxed)
    }

    /// True when there is nothing `peek` could return. A `tail` outside the
    /// ring counts as empty until the writer repairs it.
    pub fn is_empty(&self) -> bool {
        let ctl = self.control();
        let tail = ctl.tail.load(Ordering::Acquire);
        tail >= self.capacity || ctl.head.load(Ordering::Acquire) == tail
    }

    /// Point-in-time counters. The four fields are read independently.
    pub fn stats(&self) -> QueueStats {
        let ctl = self.control();
        QueueStats {
            in_count: ctl.in_count.load(Ordering::Relaxed),
            out_count: ctl.out_count.load(Ordering::Relaxed),
            capacity: ctl.capacity.load(Ordering::Relaxed) as u64,
            inuse_bytes: ctl.inuse_bytes.load(Ordering::Relaxed),
        }
    }

    /// Emergency resets performed through this handle.
    pub fn emergency_resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    pub(crate) fn count_reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn control(&self) -> &ControlBlock {
        // Alignment and size were checked in `from_region`.
        unsafe { &*(self.region.as_ptr() as *const ControlBlock) }
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        unsafe { self.region.as_ptr().add(CONTROL_BLOCK_SIZE) }
    }

    /// Caller guarantees `offset + RECORD_HEADER_SIZE <= capacity`.
    #[inline]
    pub(crate) fn read_header(&self, offset: u32) -> RecordHeader {
        debug_assert!(offset as usize + RECORD_HEADER_SIZE <= self.capacity as usize);
        let mut bytes = [0u8; RECORD_HEADER_SIZE];
        unsafe {
            ptr::copy_nonoverlapping(
                self.base().add(offset as usize),
                bytes.as_mut_ptr(),
                RECORD_HEADER_SIZE,
            );
        }
        RecordHeader::decode(bytes)
    }

    /// Caller guarantees `offset + RECORD_HEADER_SIZE <= capacity`.
    #[inline]
    pub(crate) fn write_header(&self, offset: u32, header: RecordHeader) {
        debug_assert!(offset as usize + RECORD_HEADER_SIZE <= self.capacity as usize);
        let bytes = header.encode();
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.base().add(offset as usize),
                RECORD_HEADER_SIZE,
            );
        }
    }

    /// Caller guarantees `offset + data.len() <= capacity`.
    #[inline]
    pub(crate) fn write_bytes(&self, offset: u32, data: &[u8]) {
        debug_assert!(offset as usize + data.len() <= self.capacity as usize);
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.base().add(offset as usize), data.len());
        }
    }

    /// Caller guarantees `offset + len <= capacity` and that the writer will
    /// not touch the range while the slice is alive.
    #[inline]
    pub(crate) unsafe fn bytes(&self, offset: u32, len: u32) -> &[u8] {
        debug_assert!(offset as usize + len as usize <= self.capacity as usize);
        slice::from_raw_parts(self.base().add(offset as usize), len as usize)
    }
}
