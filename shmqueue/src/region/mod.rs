//! Memory the queue lives in.
//!
//! The queue only needs a contiguous, 8-byte aligned span of bytes and to know
//! whether it is the first user of that span. [`ShmRegion`] provides it from a
//! named POSIX shared memory object, [`HeapRegion`] from private memory.

use std::ffi::CString;
use std::io;
use std::path::Path;

use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::core::{validate_size, ShmemConfig};
use crate::errors::QueueError;

/// Where POSIX shared memory objects show up on Linux.
pub const SHM_DIR: &str = "/dev/shm";

pub trait Region {
    fn name(&self) -> &str;

    /// Start of the span. Stays valid and fixed for the lifetime of `self`.
    fn as_ptr(&self) -> *mut u8;

    fn len(&self) -> usize;

    /// True when this handle brought the memory into existence, so the control
    /// block still has to be initialized.
    fn is_created(&self) -> bool;
}

pub struct ShmRegion {
    name: String,
    shmem: Shmem,
    created: bool,
}

impl ShmRegion {
    /// Attaches to the object named in `cfg`, creating it first if needed.
    ///
    /// Only the create path looks at `cfg.size`, rounded up to the page size.
    pub fn open_or_create(cfg: &ShmemConfig) -> Result<ShmRegion, QueueError> {
        cfg.validate()?;
        let name = bare_name(&cfg.name);

        let exists = Path::new(SHM_DIR).join(name).exists();
        if exists {
            return ShmRegion::attach(name);
        }

        // Not visible under /dev/shm yet the name may still be taken, e.g. by
        // an object we have no permission to see.
        if let Err(e) = unlink(name) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(name, error = %e, "failed to unlink stale shared memory");
            }
        }

        let size = page_align(cfg.size);
        validate_size(size)?;

        match ShmemConf::new().os_id(os_id(name)).size(size).create() {
            Ok(mut shmem) => {
                if cfg.persist {
                    shmem.set_owner(false);
                }
                tracing::debug!(name, size, "created shared memory");
                Ok(ShmRegion {
                    name: name.to_string(),
                    shmem,
                    created: true,
                })
            }
            Err(ShmemError::MappingIdExists) => ShmRegion::attach(name),
            Err(e) => Err(QueueError::on_create(name, size, e)),
        }
    }

    fn attach(name: &str) -> Result<ShmRegion, QueueError> {
        let shmem = ShmemConf::new()
            .os_id(os_id(name))
            .open()
            .map_err(|e| QueueError::on_open(name, e))?;
        tracing::debug!(name, size = shmem.len(), "attached to shared memory");
        Ok(ShmRegion {
            name: name.to_string(),
            shmem,
            created: false,
        })
    }

    /// Unlinks the named object. Processes that still have it mapped keep
    /// their mapping; the next `open_or_create` starts from scratch.
    pub fn remove(name: &str) -> io::Result<()> {
        unlink(bare_name(name))
    }
}

impl Region for ShmRegion {
    fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    fn as_ptr(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }

    #[inline]
    fn len(&self) -> usize {
        self.shmem.len()
    }

    fn is_created(&self) -> bool {
        self.created
    }
}

/// Private zeroed memory with the same contract as a freshly created
/// shared memory object. No page rounding.
pub struct HeapRegion {
    name: String,
    words: *mut [u64],
    len: usize,
}

// The pointer is uniquely owned by the region.
unsafe impl Send for HeapRegion {}

impl HeapRegion {
    pub fn new<S: Into<String>>(name: S, size: usize) -> Result<HeapRegion, QueueError> {
        validate_size(size)?;
        let words = vec![0u64; size.div_ceil(8)].into_boxed_slice();
        Ok(HeapRegion {
            name: name.into(),
            words: Box::into_raw(words),
            len: size,
        })
    }
}

impl Region for HeapRegion {
    fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    fn as_ptr(&self) -> *mut u8 {
        self.words as *mut u64 as *mut u8
    }

    #[inline]
    fn len(&self) -> usize {
        self.len
    }

    fn is_created(&self) -> bool {
        true
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        drop(unsafe { Box::from_raw(self.words) });
    }
}

pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

#[inline]
pub(crate) fn page_align(size: usize) -> usize {
    let page = page_size();
    size.div_ceil(page) * page
}

fn bare_name(name: &str) -> &str {
    name.trim_start_matches('/')
}

fn os_id(name: &str) -> String {
    format!("/{}", name)
}

fn unlink(name: &str) -> io::Result<()> {
    let c_name = CString::new(os_id(name))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
