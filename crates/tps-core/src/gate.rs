//! Access gate: bounded copies through temporarily lifted protection.
//!
//! Every region rests at [`Protection::None`]. Each helper here raises the
//! protection just enough for one copy and lowers it again before returning.
//! Callers must hold the owning domain's critical section and must have
//! validated the span with [`check_access`].

use crate::TPS_SIZE;
use crate::error::{Result, TpsError};
use crate::region::{MemoryBackend, Protection, Region};

/// Validate a `length`-byte access at `offset` against a caller buffer of
/// `available` bytes.
pub fn check_access(offset: usize, length: usize, available: usize) -> Result<()> {
    let fits = offset < TPS_SIZE
        && offset
            .checked_add(length)
            .is_some_and(|end| end <= TPS_SIZE);
    if !fits {
        return Err(TpsError::OutOfBounds { offset, length });
    }
    if available < length {
        return Err(TpsError::InvalidBuffer { length, available });
    }
    Ok(())
}

fn set_protection(
    backend: &dyn MemoryBackend,
    region: &Region,
    protection: Protection,
) -> Result<()> {
    backend
        .protect(region, protection)
        .map_err(|errno| TpsError::ProtectionFailure { protection, errno })
}

/// Return `region` to its resting no-access state.
pub fn seal(backend: &dyn MemoryBackend, region: &Region) -> Result<()> {
    set_protection(backend, region, Protection::None)
}

/// Copy `out.len()` bytes at `offset` out of `region`.
pub fn read_into(
    backend: &dyn MemoryBackend,
    region: &Region,
    offset: usize,
    out: &mut [u8],
) -> Result<()> {
    debug_assert!(offset + out.len() <= TPS_SIZE);
    set_protection(backend, region, Protection::Read)?;
    // SAFETY: region is readable for TPS_SIZE bytes and the span was checked
    // against TPS_SIZE. `out` is caller memory, disjoint from the mapping.
    unsafe {
        std::ptr::copy_nonoverlapping(region.as_ptr().add(offset), out.as_mut_ptr(), out.len());
    }
    seal(backend, region)
}

/// Copy `data` into `region` at `offset`, in place.
pub fn write_from(
    backend: &dyn MemoryBackend,
    region: &Region,
    offset: usize,
    data: &[u8],
) -> Result<()> {
    debug_assert!(offset + data.len() <= TPS_SIZE);
    set_protection(backend, region, Protection::Write)?;
    // SAFETY: region is writable for TPS_SIZE bytes and the span was checked.
    unsafe {
        std::ptr::copy_nonoverlapping(data.as_ptr(), region.as_ptr().add(offset), data.len());
    }
    seal(backend, region)
}

/// Duplicate all of `source` into `target`, then apply `data` at `offset` to
/// `target` only.
///
/// On failure both regions are sealed again where the backend allows it and
/// the error is returned; `source` is never written.
pub fn fork_into(
    backend: &dyn MemoryBackend,
    source: &Region,
    target: &Region,
    offset: usize,
    data: &[u8],
) -> Result<()> {
    debug_assert!(offset + data.len() <= TPS_SIZE);
    set_protection(backend, source, Protection::Read)?;
    if let Err(err) = set_protection(backend, target, Protection::Write) {
        reseal_after_failure(backend, source);
        return Err(err);
    }

    // SAFETY: source is readable and target writable for TPS_SIZE bytes; they
    // are distinct mappings, so the copies do not overlap.
    unsafe {
        std::ptr::copy_nonoverlapping(source.as_ptr(), target.as_ptr(), TPS_SIZE);
        std::ptr::copy_nonoverlapping(data.as_ptr(), target.as_ptr().add(offset), data.len());
    }

    let sealed_source = seal(backend, source);
    let sealed_target = seal(backend, target);
    sealed_source.and(sealed_target)
}

/// Best-effort seal on an error path whose original error wins.
fn reseal_after_failure(backend: &dyn MemoryBackend, region: &Region) {
    if seal(backend, region).is_err() {
        // Nothing better to report than the error already in flight.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::MmapBackend;

    #[test]
    fn bounds_cover_offset_and_span() {
        assert_eq!(check_access(0, TPS_SIZE, TPS_SIZE), Ok(()));
        assert_eq!(check_access(TPS_SIZE - 1, 1, 1), Ok(()));
        assert_eq!(check_access(5, 0, 0), Ok(()));
        assert_eq!(
            check_access(TPS_SIZE, 0, 0),
            Err(TpsError::OutOfBounds {
                offset: TPS_SIZE,
                length: 0
            })
        );
        assert_eq!(
            check_access(0, TPS_SIZE + 1, TPS_SIZE + 1),
            Err(TpsError::OutOfBounds {
                offset: 0,
                length: TPS_SIZE + 1
            })
        );
        assert!(matches!(
            check_access(1, usize::MAX, usize::MAX),
            Err(TpsError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn short_buffer_is_invalid() {
        assert_eq!(
            check_access(0, 8, 4),
            Err(TpsError::InvalidBuffer {
                length: 8,
                available: 4
            })
        );
    }

    #[test]
    fn bounds_win_over_short_buffer() {
        assert!(matches!(
            check_access(TPS_SIZE, 8, 0),
            Err(TpsError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn write_then_read_through_gate() {
        let backend = MmapBackend;
        let region = backend.reserve().expect("reserve");

        write_from(&backend, &region, 100, b"gate").expect("write");
        let mut out = [0_u8; 4];
        read_into(&backend, &region, 100, &mut out).expect("read");
        assert_eq!(&out, b"gate");

        backend.release(region).expect("release");
    }

    #[test]
    fn fork_copies_whole_page_and_spares_source() {
        let backend = MmapBackend;
        let source = backend.reserve().expect("source");
        let target = backend.reserve().expect("target");

        write_from(&backend, &source, 0, b"Hello").expect("seed head");
        write_from(&backend, &source, TPS_SIZE - 3, b"end").expect("seed tail");

        fork_into(&backend, &source, &target, 0, b"h").expect("fork");

        let mut head = [0_u8; 5];
        read_into(&backend, &target, 0, &mut head).expect("target head");
        assert_eq!(&head, b"hello");
        let mut tail = [0_u8; 3];
        read_into(&backend, &target, TPS_SIZE - 3, &mut tail).expect("target tail");
        assert_eq!(&tail, b"end");

        read_into(&backend, &source, 0, &mut head).expect("source head");
        assert_eq!(&head, b"Hello");

        backend.release(source).expect("release source");
        backend.release(target).expect("release target");
    }
}
