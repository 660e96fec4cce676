//! Named POSIX shared-memory segments.
//!
//! A [`Segment`] opens (or creates) a `shm_open` object sized to one
//! [`BootstrapBlock`], maps it shared read-write, and runs the bootstrap
//! protocol so that exactly one process constructs the contained structure.
//!
//! Segment lifetime and handle lifetime are deliberately separate: dropping
//! a `Segment` unmaps and closes but leaves the name alive, so the segment
//! survives crashed processes while peers still hold it. Only an explicit
//! [`Segment::destroy`] unlinks the name.

use std::ffi::CString;
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::ops::Deref;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::time::Duration;

use shmkit_primitives::{Backoff, ShmInit, DEFAULT_TIMEOUT};
use tracing::debug;

use crate::block::BootstrapBlock;

/// Options for opening a segment.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// File mode for a newly created shm object.
    pub mode: libc::mode_t,
    /// How long an opener waits for the creator to size the file and for
    /// the bootstrap block to become ready.
    pub ready_timeout: Duration,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            mode: 0o666,
            ready_timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Errors from segment lifecycle operations.
#[derive(Debug)]
pub enum SegmentError {
    /// Names must start with `/` and contain no NUL bytes.
    InvalidName,
    Create(io::Error),
    Open(io::Error),
    Truncate(io::Error),
    Stat(io::Error),
    Map(io::Error),
    Unlink(io::Error),
    /// The creator never sized the file or never published `Ready` within
    /// the configured timeout; it likely crashed mid-bootstrap.
    NotReady,
    /// The existing object's size does not match this block layout.
    SizeMismatch { expected: usize, found: usize },
}

impl fmt::Display for SegmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName => write!(f, "segment names must begin with '/'"),
            Self::Create(e) => write!(f, "shm_open(O_CREAT|O_EXCL) failed: {e}"),
            Self::Open(e) => write!(f, "shm_open failed: {e}"),
            Self::Truncate(e) => write!(f, "ftruncate failed: {e}"),
            Self::Stat(e) => write!(f, "fstat failed: {e}"),
            Self::Map(e) => write!(f, "mmap failed: {e}"),
            Self::Unlink(e) => write!(f, "shm_unlink failed: {e}"),
            Self::NotReady => write!(f, "segment never became ready"),
            Self::SizeMismatch { expected, found } => {
                write!(f, "segment size mismatch: need {expected} bytes, got {found}")
            }
        }
    }
}

impl std::error::Error for SegmentError {}

/// A process-local handle to a named shared segment containing one
/// bootstrap block.
///
/// Dereferences to the contained structure. All structure operations take
/// `&self`, so any number of handles (and processes) may work on the same
/// segment concurrently.
pub struct Segment<T: ShmInit> {
    fd: OwnedFd,
    addr: NonNull<u8>,
    len: usize,
    owner: bool,
    name: CString,
    _marker: PhantomData<BootstrapBlock<T>>,
}

// SAFETY: the mapping is plain shared memory; all synchronization happens
// through the atomics of the contained structure.
unsafe impl<T: ShmInit + Sync> Send for Segment<T> {}
unsafe impl<T: ShmInit + Sync> Sync for Segment<T> {}

impl<T: ShmInit> Segment<T> {
    /// [`Segment::open_with`] under the default configuration.
    pub fn open(name: &str) -> Result<Self, SegmentError> {
        Self::open_with(name, SegmentConfig::default())
    }

    /// Create or attach to the named segment.
    ///
    /// The first process to create the object sizes it and constructs the
    /// contained structure; later openers wait for both before returning.
    pub fn open_with(name: &str, config: SegmentConfig) -> Result<Self, SegmentError> {
        if !name.starts_with('/') || name.len() < 2 {
            return Err(SegmentError::InvalidName);
        }
        let c_name = CString::new(name).map_err(|_| SegmentError::InvalidName)?;
        let len = BootstrapBlock::<T>::mem_usage();

        // SAFETY: c_name is a valid NUL-terminated string.
        let raw_fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                config.mode,
            )
        };

        let (fd, owner) = if raw_fd >= 0 {
            // SAFETY: raw_fd is a freshly opened descriptor we own.
            let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };
            // SAFETY: fd is valid; len is the block size.
            if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
                let e = io::Error::last_os_error();
                // Nobody can use a segment that never got its length; take
                // the half-created name back out of the namespace.
                drop(fd);
                // SAFETY: c_name is valid.
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(SegmentError::Truncate(e));
            }
            debug!(name, bytes = len, "created shared segment");
            (fd, true)
        } else {
            let e = io::Error::last_os_error();
            if e.raw_os_error() != Some(libc::EEXIST) {
                return Err(SegmentError::Create(e));
            }
            // SAFETY: c_name is valid.
            let raw_fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, config.mode) };
            if raw_fd < 0 {
                return Err(SegmentError::Open(io::Error::last_os_error()));
            }
            debug!(name, "opened existing shared segment");
            // SAFETY: raw_fd is a freshly opened descriptor we own.
            (unsafe { OwnedFd::from_raw_fd(raw_fd) }, false)
        };

        if !owner {
            // The creator may still be between shm_open and ftruncate;
            // mapping a short object would fault on first touch.
            wait_for_size(&fd, len, config.ready_timeout)?;
        }

        // SAFETY: fd is a valid shm object of at least len bytes.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let e = io::Error::last_os_error();
            if owner {
                // SAFETY: c_name is valid.
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
            }
            return Err(SegmentError::Map(e));
        }
        let addr = NonNull::new(addr as *mut u8).ok_or_else(|| {
            SegmentError::Map(io::Error::new(io::ErrorKind::Other, "mmap returned NULL"))
        })?;

        let segment = Self {
            fd,
            addr,
            len,
            owner,
            name: c_name,
            _marker: PhantomData,
        };

        if owner {
            // SAFETY: the mapping spans mem_usage() bytes and a fresh shm
            // object is zero-filled.
            unsafe { BootstrapBlock::<T>::create(segment.addr.as_ptr()) };
        } else {
            // SAFETY: same mapping contract; a peer constructs the block.
            let opened = unsafe {
                BootstrapBlock::<T>::open_timeout(segment.addr.as_ptr(), config.ready_timeout)
            };
            if opened.is_none() {
                return Err(SegmentError::NotReady);
            }
        }

        Ok(segment)
    }

    /// Whether this handle created the segment.
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// The segment's name, including the leading `/`.
    pub fn name(&self) -> &str {
        // Constructed from a checked &str in open_with.
        self.name.to_str().unwrap_or("/")
    }

    /// Size of the mapped region in bytes.
    pub fn mem_usage(&self) -> usize {
        self.len
    }

    /// The bootstrap block at the start of the mapping.
    pub fn block(&self) -> &BootstrapBlock<T> {
        // SAFETY: the mapping outlives self and the block was made Ready
        // before open_with returned.
        unsafe { &*(self.addr.as_ptr() as *const BootstrapBlock<T>) }
    }

    /// Unmap, close, and remove the segment name from the namespace.
    ///
    /// Peers that still hold the segment keep their mappings; new opens
    /// will create a fresh segment under the same name.
    pub fn destroy(self) -> Result<(), SegmentError> {
        let name = self.name.clone();
        drop(self);
        // SAFETY: name is a valid NUL-terminated string.
        if unsafe { libc::shm_unlink(name.as_ptr()) } != 0 {
            return Err(SegmentError::Unlink(io::Error::last_os_error()));
        }
        debug!(name = name.to_str().unwrap_or("?"), "unlinked shared segment");
        Ok(())
    }
}

impl<T: ShmInit> Deref for Segment<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.block().get()
    }
}

impl<T: ShmInit> Drop for Segment<T> {
    fn drop(&mut self) {
        // SAFETY: addr/len describe a live mapping created in open_with.
        unsafe {
            libc::munmap(self.addr.as_ptr() as *mut libc::c_void, self.len);
        }
        // fd closes via OwnedFd. The name stays linked on purpose.
        debug!(name = self.name.to_str().unwrap_or("?"), "closed shared segment");
    }
}

/// Wait until the shm object reaches `expected` bytes.
fn wait_for_size(fd: &OwnedFd, expected: usize, timeout: Duration) -> Result<(), SegmentError> {
    let mut backoff = Backoff::new(timeout);
    loop {
        // SAFETY: fd is a valid descriptor; stat is zeroed storage for fstat.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: stat points to writable storage of the right type.
        if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } != 0 {
            return Err(SegmentError::Stat(io::Error::last_os_error()));
        }
        let found = stat.st_size as usize;
        if found == expected {
            return Ok(());
        }
        if found > expected {
            // A different layout already lives under this name.
            return Err(SegmentError::SizeMismatch { expected, found });
        }
        if !backoff.next() {
            return Err(SegmentError::NotReady);
        }
    }
}
