//! Protection-violation reporting.
//!
//! Accesses to a private storage page outside the access gate trap with
//! `SIGSEGV` (or `SIGBUS`). When [`SignalObserver`] is installed, the handler
//! checks whether the faulting address belongs to a known page, prints a
//! one-line diagnostic if it does, then restores the default disposition and
//! re-raises so the process terminates. There is no recovery path.
//!
//! The handler may run while a domain's critical section is held by the very
//! thread that faulted, so it never locks and never allocates. Known page
//! bases are mirrored into an open-addressed table of atomics (see
//! [`watch`]), which is the only state the handler reads. The table grows
//! under a writer lock and is published through a single pointer, so the
//! handler never waits on a writer.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::TPS_SIZE;
use crate::error::{Result, TpsError};

/// Line written to stderr when a fault hits a private storage page.
pub const VIOLATION_DIAGNOSTIC: &str = "TPS protection error!\n";

/// Capacity of the first watch table. Capacities are powers of two.
const INITIAL_SLOTS: usize = 4096;

const EMPTY: usize = 0;
/// Removed entry; probing continues past it. Never a valid page base.
const TOMBSTONE: usize = 1;

/// Base address of the `TPS_SIZE` page containing `addr`.
#[must_use]
pub const fn page_base(addr: usize) -> usize {
    addr & !(TPS_SIZE - 1)
}

enum Insert {
    Present,
    Reused,
    Claimed,
}

/// Linear-probing set of page bases.
///
/// Only the writer holding [`WRITER`] mutates a table; readers may probe any
/// table that was ever published.
struct WatchTable {
    slots: Box<[AtomicUsize]>,
}

impl WatchTable {
    fn leak(capacity: usize) -> &'static Self {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity).map(|_| AtomicUsize::new(EMPTY)).collect();
        Box::leak(Box::new(Self { slots }))
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn probe(&self, base: usize) -> impl Iterator<Item = &AtomicUsize> {
        let mask = self.capacity() - 1;
        let start = (base / TPS_SIZE) & mask;
        (0..self.capacity()).map(move |i| &self.slots[(start + i) & mask])
    }

    fn contains(&self, base: usize) -> bool {
        for slot in self.probe(base) {
            match slot.load(Ordering::Acquire) {
                current if current == base => return true,
                EMPTY => return false,
                _ => {}
            }
        }
        false
    }

    /// Caller guarantees a free slot exists.
    fn insert(&self, base: usize) -> Insert {
        let mut reusable = None;
        for slot in self.probe(base) {
            match slot.load(Ordering::Acquire) {
                current if current == base => return Insert::Present,
                TOMBSTONE if reusable.is_none() => reusable = Some(slot),
                EMPTY => {
                    return match reusable {
                        Some(tomb) => {
                            tomb.store(base, Ordering::Release);
                            Insert::Reused
                        }
                        None => {
                            slot.store(base, Ordering::Release);
                            Insert::Claimed
                        }
                    };
                }
                _ => {}
            }
        }
        match reusable {
            Some(tomb) => {
                tomb.store(base, Ordering::Release);
                Insert::Reused
            }
            None => Insert::Present,
        }
    }

    fn remove(&self, base: usize) -> bool {
        for slot in self.probe(base) {
            match slot.load(Ordering::Acquire) {
                current if current == base => {
                    slot.store(TOMBSTONE, Ordering::Release);
                    return true;
                }
                EMPTY => return false,
                _ => {}
            }
        }
        false
    }

    fn live(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .filter(|&base| base != EMPTY && base != TOMBSTONE)
    }

    fn clear(&self) {
        for slot in self.slots.iter() {
            slot.store(EMPTY, Ordering::Release);
        }
    }
}

/// Writer-side bookkeeping for the published table.
struct Occupancy {
    table: Option<&'static WatchTable>,
    /// Previously published table of the same capacity, recycled on the next
    /// same-size rebuild.
    spare: Option<&'static WatchTable>,
    live: usize,
    /// Live entries plus tombstones.
    used: usize,
}

impl Occupancy {
    /// Current table, rebuilt first if one more entry would push it past
    /// three-quarters full.
    fn with_room(&mut self) -> &'static WatchTable {
        if let Some(table) = self.table
            && (self.used + 1) * 4 <= table.capacity() * 3
        {
            return table;
        }

        let mut capacity = self.table.map_or(INITIAL_SLOTS, WatchTable::capacity);
        while (self.live + 1) * 2 > capacity {
            capacity *= 2;
        }
        let fresh = match self.spare.take() {
            Some(spare) if spare.capacity() == capacity => {
                spare.clear();
                spare
            }
            _ => WatchTable::leak(capacity),
        };
        if let Some(old) = self.table {
            for base in old.live() {
                fresh.insert(base);
            }
        }
        CURRENT.store(ptr::from_ref(fresh).cast_mut(), Ordering::Release);

        self.spare = self.table.filter(|old| old.capacity() == capacity);
        self.table = Some(fresh);
        self.used = self.live;
        fresh
    }
}

static WRITER: Mutex<Occupancy> = Mutex::new(Occupancy {
    table: None,
    spare: None,
    live: 0,
    used: 0,
});

/// Table the handler probes. Published tables are never freed.
static CURRENT: AtomicPtr<WatchTable> = AtomicPtr::new(ptr::null_mut());

/// Start reporting faults on the page at `base`.
///
/// Returns false only for the null page, which is never watched.
pub fn watch(base: usize) -> bool {
    debug_assert_eq!(base % TPS_SIZE, 0);
    if base == EMPTY {
        return false;
    }
    let mut writer = WRITER.lock();
    match writer.with_room().insert(base) {
        Insert::Present => {}
        Insert::Reused => writer.live += 1,
        Insert::Claimed => {
            writer.live += 1;
            writer.used += 1;
        }
    }
    true
}

/// Stop reporting faults on the page at `base`. Returns whether it was watched.
pub fn unwatch(base: usize) -> bool {
    let mut writer = WRITER.lock();
    let removed = writer.table.is_some_and(|table| table.remove(base));
    if removed {
        writer.live -= 1;
    }
    removed
}

/// Whether `addr` falls inside a watched page. Async-signal-safe.
#[must_use]
pub fn classify_fault(addr: usize) -> bool {
    let base = page_base(addr);
    if base == EMPTY {
        return false;
    }
    let table = CURRENT.load(Ordering::Acquire);
    if table.is_null() {
        return false;
    }
    // SAFETY: published tables are leaked, so the pointer stays valid.
    unsafe { &*table }.contains(base)
}

/// Something that arranges for protection violations to be reported.
///
/// Installation is a one-way, process-wide side effect.
pub trait ViolationObserver: Send + Sync {
    fn install(&self) -> Result<()>;
}

impl<T: ViolationObserver + ?Sized> ViolationObserver for std::sync::Arc<T> {
    fn install(&self) -> Result<()> {
        (**self).install()
    }
}

impl<T: ViolationObserver + ?Sized> ViolationObserver for Box<T> {
    fn install(&self) -> Result<()> {
        (**self).install()
    }
}

/// Observer for hosts without protection traps: installs nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ViolationObserver for NullObserver {
    fn install(&self) -> Result<()> {
        Ok(())
    }
}

/// `SIGSEGV`/`SIGBUS` handler reporting faults on watched pages.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalObserver;

static SIGNAL_OBSERVER_INSTALLED: Mutex<bool> = Mutex::new(false);

impl SignalObserver {
    /// Whether the handler has been installed in this process.
    #[must_use]
    pub fn installed() -> bool {
        *SIGNAL_OBSERVER_INSTALLED.lock()
    }
}

impl ViolationObserver for SignalObserver {
    fn install(&self) -> Result<()> {
        let mut installed = SIGNAL_OBSERVER_INSTALLED.lock();
        if *installed {
            return Ok(());
        }
        for signum in [libc::SIGBUS, libc::SIGSEGV] {
            install_handler(signum)?;
        }
        *installed = true;
        Ok(())
    }
}

type SigInfoHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

fn install_handler(signum: libc::c_int) -> Result<()> {
    let handler: SigInfoHandler = on_protection_fault;
    // SAFETY: a zeroed sigaction is a valid starting point; every field the
    // kernel reads is set below.
    let mut act = unsafe { std::mem::zeroed::<libc::sigaction>() };
    act.sa_sigaction = handler as libc::sighandler_t;
    act.sa_flags = libc::SA_SIGINFO;
    // SAFETY: act.sa_mask is a valid sigset_t owned by this frame.
    unsafe { libc::sigemptyset(&mut act.sa_mask) };

    // SAFETY: act is fully initialized; the old action is not requested.
    let rc = unsafe { libc::sigaction(signum, &act, std::ptr::null_mut()) };
    if rc == 0 {
        Ok(())
    } else {
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EINVAL);
        Err(TpsError::ObserverUnavailable { errno })
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn fault_address(info: *const libc::siginfo_t) -> usize {
    // SAFETY: caller passes the kernel-supplied siginfo of a memory fault.
    unsafe { (*info).si_addr() as usize }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn fault_address(info: *const libc::siginfo_t) -> usize {
    // SAFETY: caller passes the kernel-supplied siginfo of a memory fault.
    unsafe { (*info).si_addr as usize }
}

extern "C" fn on_protection_fault(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    let addr = if info.is_null() {
        0
    } else {
        // SAFETY: SA_SIGINFO handlers receive a valid siginfo pointer.
        unsafe { fault_address(info) }
    };

    if classify_fault(addr) {
        let msg = VIOLATION_DIAGNOSTIC.as_bytes();
        // SAFETY: write(2) is async-signal-safe; msg is a static buffer.
        unsafe {
            libc::write(
                libc::STDERR_FILENO,
                msg.as_ptr().cast::<libc::c_void>(),
                msg.len(),
            );
        }
    }

    // SAFETY: signal(2) and raise(3) are async-signal-safe. With the default
    // disposition restored, the re-raised signal terminates the process.
    unsafe {
        libc::signal(libc::SIGSEGV, libc::SIG_DFL);
        libc::signal(libc::SIGBUS, libc::SIG_DFL);
        libc::raise(signum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Distinct high ranges per test: the table is process-global.
    const AREA: usize = 0x6a00_0000_0000;

    #[test]
    fn page_base_masks_offset() {
        assert_eq!(page_base(AREA + 17), AREA);
        assert_eq!(page_base(AREA + TPS_SIZE - 1), AREA);
        assert_eq!(page_base(AREA + TPS_SIZE), AREA + TPS_SIZE);
    }

    #[test]
    fn watched_page_matches_any_interior_address() {
        let base = AREA + 0x10 * TPS_SIZE;
        assert!(!classify_fault(base + 5));
        assert!(watch(base));
        assert!(classify_fault(base));
        assert!(classify_fault(base + TPS_SIZE - 1));
        assert!(!classify_fault(base + TPS_SIZE));

        assert!(unwatch(base));
        assert!(!classify_fault(base + 5));
        assert!(!unwatch(base));
    }

    #[test]
    fn tombstone_keeps_collision_chain_intact() {
        let table = WatchTable::leak(16);
        let first = AREA + 0x20 * TPS_SIZE;
        let second = first + 16 * TPS_SIZE;

        assert!(matches!(table.insert(first), Insert::Claimed));
        assert!(matches!(table.insert(second), Insert::Claimed));
        assert!(matches!(table.insert(second), Insert::Present));
        assert!(table.remove(first));
        assert!(table.contains(second), "entry past a tombstone is found");
        assert!(!table.contains(first));

        assert!(matches!(table.insert(first), Insert::Reused));
        assert_eq!(table.live().count(), 2);
    }

    #[test]
    fn table_grows_past_initial_capacity() {
        let area = AREA + 0x100_0000 * TPS_SIZE;
        let count = INITIAL_SLOTS * 2;
        for i in 0..count {
            assert!(watch(area + i * TPS_SIZE));
        }
        let capacity = WRITER.lock().table.map_or(0, WatchTable::capacity);
        assert!(capacity > INITIAL_SLOTS, "capacity {capacity}");

        let missing = (0..count)
            .filter(|i| !classify_fault(area + i * TPS_SIZE + 1))
            .count();
        assert_eq!(missing, 0);

        for i in 0..count {
            assert!(unwatch(area + i * TPS_SIZE));
        }
        assert!(!classify_fault(area));
    }

    #[test]
    fn null_page_is_never_watched() {
        assert!(!watch(0));
        assert!(!classify_fault(0));
        assert!(!classify_fault(12));
    }

    #[test]
    fn null_observer_installs_nothing() {
        assert_eq!(NullObserver.install(), Ok(()));
    }
}
