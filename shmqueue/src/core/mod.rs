//! Binary layout shared by producer and consumer processes.
//!
//! ```text
//! offset 0                                     40
//! ┌──────┬──────┬──────────┬─────────────┬────┬─────┬─────────────┐
//! │ head │ tail │ capacity │ create_time │ in │ out │ inuse_bytes │ ring storage (capacity bytes) ...
//! │  u32 │  u32 │   u32    │     u32     │i64 │ i64 │     i64     │
//! └──────┴──────┴──────────┴─────────────┴────┴─────┴─────────────┘
//! ```
//!
//! Records are written back to back into the ring storage, each one an
//! 8-byte [`RecordHeader`] followed by its payload.

use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicI64, AtomicU32};

use serde_derive::{Deserialize, Serialize};

use crate::errors::QueueError;

/// `'S' 'M' 'R' 'H'` read as a little-endian u32.
pub const RECORD_HEAD_MAGIC: u32 = 0x4852_4d53;

pub const RECORD_HEADER_SIZE: usize = size_of::<u64>();

pub const CONTROL_BLOCK_SIZE: usize = size_of::<ControlBlock>();

/// Payload lengths share a u32 with the end-of-queue flag.
pub const MAX_PAYLOAD_LEN: usize = LENGTH_MASK as usize;

const END_OF_QUEUE_BIT: u32 = 1 << 31;
const LENGTH_MASK: u32 = !END_OF_QUEUE_BIT;

pub const DEFAULT_SHMEM_NAME: &str = "shmqueue";
pub const DEFAULT_SHMEM_SIZE: usize = 10_240;

/// Metadata at offset 0 of every region.
///
/// `tail` and `in_count` belong to the writer, `head` and `out_count` to the
/// reader. `inuse_bytes` is touched by both sides and is only a statistic.
/// `capacity` and `create_time` are written once by the creating process.
#[repr(C)]
pub struct ControlBlock {
    pub head: AtomicU32,
    pub tail: AtomicU32,
    pub capacity: AtomicU32,
    pub create_time: AtomicU32,
    pub in_count: AtomicI64,
    pub out_count: AtomicI64,
    pub inuse_bytes: AtomicI64,
}

const _: () = assert!(size_of::<ControlBlock>() == 40);
const _: () = assert!(align_of::<ControlBlock>() == 8);

/// Decoded form of the 8 bytes in front of every record.
///
/// Encoded as two little-endian u32 words: the magic, then the payload length
/// with the end-of-queue flag in its top bit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub magic: u32,
    pub end_of_queue: bool,
    pub payload_len: u32,
}

impl RecordHeader {
    pub fn record(payload_len: u32) -> Self {
        debug_assert!(payload_len <= LENGTH_MASK);
        RecordHeader {
            magic: RECORD_HEAD_MAGIC,
            end_of_queue: false,
            payload_len,
        }
    }

    /// Marker covering `filler` bytes up to the end of the ring.
    pub fn sentinel(filler: u32) -> Self {
        RecordHeader {
            magic: RECORD_HEAD_MAGIC,
            end_of_queue: true,
            payload_len: filler & LENGTH_MASK,
        }
    }

    #[inline]
    pub fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut word = self.payload_len & LENGTH_MASK;
        if self.end_of_queue {
            word |= END_OF_QUEUE_BIT;
        }
        let mut bytes = [0u8; RECORD_HEADER_SIZE];
        bytes[..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..].copy_from_slice(&word.to_le_bytes());
        bytes
    }

    #[inline]
    pub fn decode(bytes: [u8; RECORD_HEADER_SIZE]) -> Self {
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let word = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        RecordHeader {
            magic,
            end_of_queue: word & END_OF_QUEUE_BIT != 0,
            payload_len: word & LENGTH_MASK,
        }
    }

    #[inline]
    pub fn has_valid_magic(&self) -> bool {
        self.magic == RECORD_HEAD_MAGIC
    }

    /// Header plus payload.
    #[inline]
    pub fn record_len(&self) -> u64 {
        RECORD_HEADER_SIZE as u64 + self.payload_len as u64
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmemConfig {
    /// Name of the POSIX shared memory object, e.g. `orders_queue_1`.
    pub name: String,
    /// Requested region size in bytes. Only used by the process that creates
    /// the object; attaching processes get whatever size already exists.
    pub size: usize,
    /// Keep the object around after the creating process exits.
    pub persist: bool,
}

impl Default for ShmemConfig {
    fn default() -> Self {
        ShmemConfig {
            name: DEFAULT_SHMEM_NAME.to_string(),
            size: DEFAULT_SHMEM_SIZE,
            persist: true,
        }
    }
}

impl ShmemConfig {
    pub fn builder() -> ShmemConfigBuilder {
        ShmemConfigBuilder::default()
    }

    /// Checks the name only. `size` matters solely when the object gets
    /// created, and is checked there.
    pub fn validate(&self) -> Result<(), QueueError> {
        let name = self.name.trim_start_matches('/');
        if name.is_empty() {
            return Err(QueueError::Config("name must not be empty".to_string()));
        }
        if name.contains('/') || name.contains('\0') {
            return Err(QueueError::Config(format!(
                "name {:?} must not contain '/' or NUL",
                self.name
            )));
        }
        Ok(())
    }
}

/// A region must hold the control block and at least one header, and its
/// capacity must be addressable by the u32 cursors.
pub(crate) fn validate_size(size: usize) -> Result<(), QueueError> {
    if size <= CONTROL_BLOCK_SIZE + RECORD_HEADER_SIZE {
        return Err(QueueError::Config(format!(
            "size {} is too small, need more than {} bytes",
            size,
            CONTROL_BLOCK_SIZE + RECORD_HEADER_SIZE
        )));
    }
    if (size - CONTROL_BLOCK_SIZE) as u64 > u32::MAX as u64 {
        return Err(QueueError::Config(format!(
            "size {} leaves a capacity that does not fit in 32 bits",
            size
        )));
    }
    Ok(())
}

#[derive(Default)]
pub struct ShmemConfigBuilder {
    name: Option<String>,
    size: Option<usize>,
    persist: Option<bool>,
}

impl ShmemConfigBuilder {
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = Some(persist);
        self
    }

    pub fn build(self) -> Result<ShmemConfig, QueueError> {
        let defaults = ShmemConfig::default();
        let cfg = ShmemConfig {
            name: self.name.unwrap_or(defaults.name),
            size: self.size.unwrap_or(defaults.size),
            persist: self.persist.unwrap_or(defaults.persist),
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use std::mem::offset_of;

    use super::*;

    #[test]
    fn control_block_layout_is_fixed() {
        assert_eq!(CONTROL_BLOCK_SIZE, 40);
        assert_eq!(offset_of!(ControlBlock, head), 0);
        assert_eq!(offset_of!(ControlBlock, tail), 4);
        assert_eq!(offset_of!(ControlBlock, capacity), 8);
        assert_eq!(offset_of!(ControlBlock, create_time), 12);
        assert_eq!(offset_of!(ControlBlock, in_count), 16);
        assert_eq!(offset_of!(ControlBlock, out_count), 24);
        assert_eq!(offset_of!(ControlBlock, inuse_bytes), 32);
    }

    #[test]
    fn header_wire_format() {
        let bytes = RecordHeader::record(5).encode();
        assert_eq!(bytes, [0x53, 0x4d, 0x52, 0x48, 5, 0, 0, 0]);

        let bytes = RecordHeader::sentinel(3).encode();
        assert_eq!(bytes, [0x53, 0x4d, 0x52, 0x48, 3, 0, 0, 0x80]);
    }

    #[test]
    fn header_flag_does_not_leak_into_length() {
        let max = RecordHeader::record(MAX_PAYLOAD_LEN as u32);
        let decoded = RecordHeader::decode(max.encode());
        assert!(!decoded.end_of_queue);
        assert_eq!(decoded.payload_len as usize, MAX_PAYLOAD_LEN);

        let decoded = RecordHeader::decode(RecordHeader::sentinel(0).encode());
        assert!(decoded.end_of_queue);
        assert_eq!(decoded.payload_len, 0);
        assert_eq!(decoded.record_len(), RECORD_HEADER_SIZE as u64);
    }

    #[test]
    fn zeroed_bytes_are_not_a_valid_record() {
        let decoded = RecordHeader::decode([0u8; RECORD_HEADER_SIZE]);
        assert!(!decoded.has_valid_magic());
    }

    #[test]
    fn builder_applies_defaults() -> Result<(), QueueError> {
        let cfg = ShmemConfig::builder().name("orders").build()?;
        assert_eq!(cfg.name, "orders");
        assert_eq!(cfg.size, DEFAULT_SHMEM_SIZE);
        assert!(cfg.persist);
        Ok(())
    }

    #[test]
    fn builder_rejects_bad_values() {
        assert!(ShmemConfig::builder().name("").build().is_err());
        assert!(ShmemConfig::builder().name("a/b").build().is_err());
        assert!(ShmemConfig::builder().name("/leading_slash").build().is_ok());
    }

    #[test]
    fn builder_accepts_any_size_hint() -> Result<(), QueueError> {
        // an attacher may not know the size, so it is not checked here
        let cfg = ShmemConfig::builder().name("orders").size(0).build()?;
        assert_eq!(cfg.size, 0);
        assert!(validate_size(cfg.size).is_err());
        assert!(validate_size(CONTROL_BLOCK_SIZE + RECORD_HEADER_SIZE).is_err());
        assert!(validate_size(CONTROL_BLOCK_SIZE + RECORD_HEADER_SIZE + 1).is_ok());
        Ok(())
    }
}
