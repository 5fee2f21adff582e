//! Protection-controlled page regions and the host memory backend.
//!
//! A [`Region`] names exactly one `TPS_SIZE` mapping. It is not `Clone`, and
//! [`MemoryBackend::release`] consumes it, so the same mapping cannot be
//! released twice through safe code.

use std::fmt;
use std::ptr::NonNull;

use crate::TPS_SIZE;

/// Access permitted on a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protection {
    /// No access. Resting state of every region.
    None,
    Read,
    Write,
    ReadWrite,
}

impl Protection {
    /// Host `PROT_*` flags.
    #[must_use]
    pub const fn as_prot(self) -> libc::c_int {
        match self {
            Self::None => libc::PROT_NONE,
            Self::Read => libc::PROT_READ,
            Self::Write => libc::PROT_WRITE,
            Self::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "PROT_NONE",
            Self::Read => "PROT_READ",
            Self::Write => "PROT_WRITE",
            Self::ReadWrite => "PROT_READ|PROT_WRITE",
        })
    }
}

/// Unique handle to one reserved `TPS_SIZE` mapping.
#[derive(Debug, PartialEq, Eq)]
pub struct Region {
    base: NonNull<u8>,
}

// SAFETY: a Region is an address plus unique ownership of the mapping behind
// it. All access to the bytes goes through the access gate while the owning
// domain's critical section is held.
unsafe impl Send for Region {}
// SAFETY: see above; &Region exposes only the address.
unsafe impl Sync for Region {}

impl Region {
    /// Adopt a mapping.
    ///
    /// # Safety
    ///
    /// `base` must be the start of a live mapping of at least `TPS_SIZE`
    /// bytes, aligned to `TPS_SIZE`, not owned by any other `Region`.
    #[must_use]
    pub unsafe fn from_raw(base: NonNull<u8>) -> Self {
        Self { base }
    }

    /// Give up ownership without releasing the mapping.
    #[must_use]
    pub fn into_raw(self) -> NonNull<u8> {
        self.base
    }

    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[must_use]
    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }
}

/// Host memory operations on whole regions.
///
/// Errors are raw errno values.
pub trait MemoryBackend: Send + Sync {
    /// Reserve a fresh zero-filled `TPS_SIZE` region with no access.
    fn reserve(&self) -> Result<Region, i32>;
    /// Change the protection of the whole region.
    fn protect(&self, region: &Region, protection: Protection) -> Result<(), i32>;
    /// Return the region to the host.
    fn release(&self, region: Region) -> Result<(), i32>;
}

impl<T: MemoryBackend + ?Sized> MemoryBackend for std::sync::Arc<T> {
    fn reserve(&self) -> Result<Region, i32> {
        (**self).reserve()
    }

    fn protect(&self, region: &Region, protection: Protection) -> Result<(), i32> {
        (**self).protect(region, protection)
    }

    fn release(&self, region: Region) -> Result<(), i32> {
        (**self).release(region)
    }
}

impl<T: MemoryBackend + ?Sized> MemoryBackend for Box<T> {
    fn reserve(&self) -> Result<Region, i32> {
        (**self).reserve()
    }

    fn protect(&self, region: &Region, protection: Protection) -> Result<(), i32> {
        (**self).protect(region, protection)
    }

    fn release(&self, region: Region) -> Result<(), i32> {
        (**self).release(region)
    }
}

/// Anonymous private `mmap` regions.
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapBackend;

#[inline]
fn last_host_errno(default_errno: i32) -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(default_errno)
}

impl MemoryBackend for MmapBackend {
    fn reserve(&self) -> Result<Region, i32> {
        // SAFETY: anonymous mapping with a null hint touches no existing memory.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                TPS_SIZE,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(last_host_errno(libc::ENOMEM));
        }
        let base = NonNull::new(ptr.cast::<u8>()).ok_or(libc::ENOMEM)?;
        // SAFETY: mmap returned a fresh page-aligned mapping of TPS_SIZE bytes.
        Ok(unsafe { Region::from_raw(base) })
    }

    fn protect(&self, region: &Region, protection: Protection) -> Result<(), i32> {
        // SAFETY: region owns a live TPS_SIZE mapping.
        let rc = unsafe {
            libc::mprotect(
                region.as_ptr().cast::<libc::c_void>(),
                TPS_SIZE,
                protection.as_prot(),
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(last_host_errno(libc::EINVAL))
        }
    }

    fn release(&self, region: Region) -> Result<(), i32> {
        let base = region.into_raw();
        // SAFETY: ownership of the mapping was just surrendered by the Region.
        let rc = unsafe { libc::munmap(base.as_ptr().cast::<libc::c_void>(), TPS_SIZE) };
        if rc == 0 {
            Ok(())
        } else {
            Err(last_host_errno(libc::EINVAL))
        }
    }
}
