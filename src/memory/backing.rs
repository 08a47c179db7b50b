use std::alloc::Layout;
use std::io;
use std::ptr::NonNull;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackingError {
    #[error("backing allocation of {size} bytes (align {align}) failed: out of memory")]
    OutOfMemory { size: usize, align: usize },
    #[error("anonymous mapping failed: {0}")]
    MapFailed(#[source] io::Error),
    #[error("invalid backing layout: size {size}, align {align}")]
    InvalidLayout { size: usize, align: usize },
}

/// Which release path a [`Backing`] must go down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackingKind {
    /// Global heap (`std::alloc`).
    Heap,
    /// Anonymous private mapping (`mmap`), page aligned.
    Mapped,
    /// Provided by a custom [`BackingOps`] implementation.
    Custom,
}

/// One contiguous region handed out by a [`BackingOps`] implementation.
#[derive(Debug)]
pub struct Backing {
    ptr: NonNull<u8>,
    layout: Layout,
    kind: BackingKind,
}

// Safety: Backing is a uniquely owned region; moving it between threads moves
// ownership of the memory.
unsafe impl Send for Backing {}

impl Backing {
    /// Wrap a region obtained by a custom allocator.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `layout.size()` bytes and
    /// aligned to `layout.align()` until the matching [`BackingOps::release`].
    #[must_use]
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, layout: Layout, kind: BackingKind) -> Self {
        Self { ptr, layout, kind }
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    #[must_use]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> BackingKind {
        self.kind
    }

    /// Whether `addr` falls inside this region.
    #[inline]
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.ptr.as_ptr() as usize;
        addr >= base && addr < base + self.layout.size()
    }
}

/// Byte-allocator capability consumed by the freelist for its per-shard
/// storage. Called only from `init` and teardown, never from push/pop.
pub trait BackingOps {
    /// Allocate `layout.size()` bytes aligned to `layout.align()`.
    ///
    /// `shard` is a locality hint: the shard (and so the CPU) that will own
    /// the region. Implementations may ignore it.
    ///
    /// The freelist zeroes the region itself; implementations need not.
    ///
    /// # Errors
    ///
    /// Returns `BackingError` if the memory cannot be obtained.
    fn allocate(&self, layout: Layout, shard: usize) -> Result<Backing, BackingError>;

    /// Return a region obtained from [`allocate`](BackingOps::allocate).
    ///
    /// # Safety
    /// `backing` must come from this allocator and no pointer into it may be
    /// used afterwards.
    unsafe fn release(&self, backing: Backing);
}

/// Configuration for [`SystemBacking`].
#[derive(Clone, Debug)]
pub struct SystemBackingConfig {
    /// Regions of at least this many bytes are mapped instead of taken from
    /// the heap. Default: one OS page.
    pub mapped_threshold: usize,
}

impl Default for SystemBackingConfig {
    fn default() -> Self {
        Self {
            mapped_threshold: page_size(),
        }
    }
}

/// Default backing: heap for small shard regions, anonymous mappings for
/// large ones.
#[derive(Clone, Debug, Default)]
pub struct SystemBacking {
    config: SystemBackingConfig,
}

impl SystemBacking {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(config: SystemBackingConfig) -> Self {
        Self { config }
    }

    fn alloc_heap(layout: Layout) -> Result<Backing, BackingError> {
        // Safety: callers never pass zero-size layouts (checked in allocate).
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr)
            .map(|ptr| Backing {
                ptr,
                layout,
                kind: BackingKind::Heap,
            })
            .ok_or(BackingError::OutOfMemory {
                size: layout.size(),
                align: layout.align(),
            })
    }
}

impl BackingOps for SystemBacking {
    fn allocate(&self, layout: Layout, _shard: usize) -> Result<Backing, BackingError> {
        if layout.size() == 0 {
            return Err(BackingError::InvalidLayout {
                size: 0,
                align: layout.align(),
            });
        }
        if layout.size() >= self.config.mapped_threshold && layout.align() <= page_size() {
            // Safety: non-zero size checked above.
            if let Some(backing) = unsafe { platform::map(layout)? } {
                return Ok(backing);
            }
        }
        Self::alloc_heap(layout)
    }

    unsafe fn release(&self, backing: Backing) {
        match backing.kind {
            BackingKind::Heap => {
                // Safety: allocated by alloc_heap with this exact layout.
                unsafe { std::alloc::dealloc(backing.ptr.as_ptr(), backing.layout) };
            }
            BackingKind::Mapped => {
                // Safety: mapped by platform::map with this size.
                if let Err(e) = unsafe { platform::unmap(&backing) } {
                    tracing::warn!(size = backing.size(), error = %e, "freelist: munmap failed");
                }
            }
            BackingKind::Custom => {
                debug_assert!(false, "SystemBacking asked to release a custom region");
            }
        }
    }
}

/// Host page size. Falls back to 4096 when it cannot be queried.
#[must_use]
pub fn page_size() -> usize {
    platform::page_size()
}

#[cfg(all(unix, not(any(loom, miri))))]
mod platform {
    use super::{Backing, BackingError, BackingKind};
    use crate::sync::OnceLock;
    use std::alloc::Layout;
    use std::io;
    use std::ptr::NonNull;

    /// Map `layout.size()` zeroed, page-aligned bytes.
    ///
    /// # Safety
    /// `layout.size()` must be non-zero.
    pub(super) unsafe fn map(layout: Layout) -> Result<Option<Backing>, BackingError> {
        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                layout.size(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(BackingError::MapFailed(io::Error::last_os_error()));
        }

        match NonNull::new(ptr.cast::<u8>()) {
            Some(ptr) => Ok(Some(Backing {
                ptr,
                layout,
                kind: BackingKind::Mapped,
            })),
            None => Err(BackingError::MapFailed(io::Error::other("mmap returned null"))),
        }
    }

    /// # Safety
    /// `backing` must have been produced by [`map`].
    pub(super) unsafe fn unmap(backing: &Backing) -> io::Result<()> {
        // Safety: FFI call to munmap.
        if unsafe { libc::munmap(backing.ptr.as_ptr().cast::<libc::c_void>(), backing.size()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn page_size() -> usize {
        static CACHED: OnceLock<usize> = OnceLock::new();
        *CACHED.get_or_init(|| {
            // Safety: FFI call to sysconf.
            let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            usize::try_from(raw).ok().filter(|&p| p > 0).unwrap_or(4096)
        })
    }
}

// ---------------------------------------------------------------------------
// Heap-only fallback
//
// Under `cfg(loom)` / Miri (and on non-unix hosts) nothing is mapped: `map`
// declines and every region comes from the heap. This is enough to check the
// synchronization of the freelist; real mappings are covered by normal builds.
// ---------------------------------------------------------------------------
#[cfg(any(not(unix), loom, miri))]
mod platform {
    use super::{Backing, BackingError};
    use std::alloc::Layout;
    use std::io;

    pub(super) unsafe fn map(_layout: Layout) -> Result<Option<Backing>, BackingError> {
        Ok(None)
    }

    pub(super) unsafe fn unmap(_backing: &Backing) -> io::Result<()> {
        Err(io::Error::other("no mapped regions on this target"))
    }

    pub(super) fn page_size() -> usize {
        4096
    }
}
