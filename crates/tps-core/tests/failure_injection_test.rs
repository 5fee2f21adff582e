//! Backend failures at every fallible step leave the domain unchanged.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tps_core::{
    CooperativeRuntime, MemoryBackend, MmapBackend, NullObserver, Protection, Region, Tid,
    TpsDomain, TpsError,
};

const NEVER: usize = usize::MAX;

/// Mmap backend that fails the Nth reserve or protect call (0-based).
#[derive(Debug)]
struct FlakyBackend {
    reserves: AtomicUsize,
    protects: AtomicUsize,
    fail_reserve_at: AtomicUsize,
    fail_protect_at: AtomicUsize,
    released: AtomicUsize,
}

impl FlakyBackend {
    fn new() -> Self {
        Self {
            reserves: AtomicUsize::new(0),
            protects: AtomicUsize::new(0),
            fail_reserve_at: AtomicUsize::new(NEVER),
            fail_protect_at: AtomicUsize::new(NEVER),
            released: AtomicUsize::new(0),
        }
    }

    /// Fail the `n`th protect call from now on.
    fn fail_protect_after(&self, n: usize) {
        let seen = self.protects.load(Ordering::SeqCst);
        self.fail_protect_at.store(seen + n, Ordering::SeqCst);
    }

    fn fail_next_reserve(&self) {
        let seen = self.reserves.load(Ordering::SeqCst);
        self.fail_reserve_at.store(seen, Ordering::SeqCst);
    }

    fn heal(&self) {
        self.fail_reserve_at.store(NEVER, Ordering::SeqCst);
        self.fail_protect_at.store(NEVER, Ordering::SeqCst);
    }
}

impl MemoryBackend for FlakyBackend {
    fn reserve(&self) -> Result<Region, i32> {
        let n = self.reserves.fetch_add(1, Ordering::SeqCst);
        if n == self.fail_reserve_at.load(Ordering::SeqCst) {
            return Err(libc::ENOMEM);
        }
        MmapBackend.reserve()
    }

    fn protect(&self, region: &Region, protection: Protection) -> Result<(), i32> {
        let n = self.protects.fetch_add(1, Ordering::SeqCst);
        if n == self.fail_protect_at.load(Ordering::SeqCst) {
            return Err(libc::EACCES);
        }
        MmapBackend.protect(region, protection)
    }

    fn release(&self, region: Region) -> Result<(), i32> {
        self.released.fetch_add(1, Ordering::SeqCst);
        MmapBackend.release(region)
    }
}

const A: Tid = Tid(0xA);
const B: Tid = Tid(0xB);

fn setup() -> (TpsDomain, Arc<CooperativeRuntime>, Arc<FlakyBackend>) {
    let rt = Arc::new(CooperativeRuntime::new(A));
    let backend = Arc::new(FlakyBackend::new());
    let domain = TpsDomain::builder()
        .runtime(Arc::clone(&rt))
        .backend(Arc::clone(&backend))
        .observer(NullObserver)
        .build();
    (domain, rt, backend)
}

#[test]
fn failed_reserve_leaves_no_binding() {
    let (domain, _, backend) = setup();
    backend.fail_next_reserve();
    assert_eq!(
        domain.create(),
        Err(TpsError::AllocationFailure {
            errno: libc::ENOMEM
        })
    );
    assert!(!domain.has_binding(A));
    assert!(!domain.registry_allocated());
    assert_eq!(domain.live_pages(), 0);

    domain.create().expect("retry succeeds");
}

#[test]
fn failed_protect_aborts_read_and_write() {
    let (domain, _, backend) = setup();
    domain.create().expect("create");
    domain.write(0, 3, b"abc").expect("seed");

    backend.fail_protect_after(0);
    let mut buf = [0_u8; 3];
    assert_eq!(
        domain.read(0, 3, &mut buf),
        Err(TpsError::ProtectionFailure {
            protection: Protection::Read,
            errno: libc::EACCES
        })
    );
    assert_eq!(buf, [0; 3], "nothing copied");

    backend.fail_protect_after(0);
    assert!(matches!(
        domain.write(0, 3, b"xyz"),
        Err(TpsError::ProtectionFailure {
            protection: Protection::Write,
            ..
        })
    ));

    backend.heal();
    domain.read(0, 3, &mut buf).expect("read after heal");
    assert_eq!(&buf, b"abc");
    assert_eq!(domain.metrics().protection_failures, 2);
}

/// Fork issues: old -> Read, new -> Write, old -> None, new -> None.
#[test]
fn failed_fork_keeps_binding_and_counts() {
    for failing_step in 0..4 {
        let (domain, rt, backend) = setup();
        domain.create().expect("create");
        domain.write(0, 5, b"Hello").expect("seed");
        rt.switch_to(B);
        domain.clone_from_thread(A).expect("clone");

        let before = domain.snapshot();
        let b_addr = domain.region_addr().expect("shared addr");
        let released_before = backend.released.load(Ordering::SeqCst);

        backend.fail_protect_after(failing_step);
        let err = domain.write(0, 1, b"h").expect_err("fork fails");
        assert!(
            matches!(err, TpsError::ProtectionFailure { .. }),
            "step {failing_step}: {err:?}"
        );
        backend.heal();

        assert_eq!(domain.snapshot(), before, "step {failing_step}");
        assert_eq!(domain.region_addr(), Ok(b_addr), "step {failing_step}");
        assert_eq!(domain.share_count(A), Some(2), "step {failing_step}");
        assert_eq!(
            backend.released.load(Ordering::SeqCst),
            released_before + 1,
            "step {failing_step}: half-built page is returned"
        );
        assert_eq!(domain.metrics().pages_outstanding(), 1);

        let mut buf = [0_u8; 5];
        domain.read(0, 5, &mut buf).expect("b still reads shared page");
        assert_eq!(&buf, b"Hello");

        domain.write(0, 1, b"h").expect("retry forks");
        assert_eq!(domain.share_count(A), Some(1));
        rt.switch_to(A);
        domain.read(0, 5, &mut buf).expect("a read");
        assert_eq!(&buf, b"Hello");
    }
}

#[test]
fn failed_fork_reserve_keeps_sharing() {
    let (domain, rt, backend) = setup();
    domain.create().expect("create");
    rt.switch_to(B);
    domain.clone_from_thread(A).expect("clone");

    backend.fail_next_reserve();
    assert!(matches!(
        domain.write(0, 1, b"x"),
        Err(TpsError::AllocationFailure { .. })
    ));
    assert_eq!(domain.share_count(B), Some(2));
    assert_eq!(domain.live_pages(), 1);
}

#[test]
fn failed_restore_on_destroy_keeps_binding() {
    let (domain, _, backend) = setup();
    domain.create().expect("create");

    backend.fail_protect_after(0);
    assert_eq!(
        domain.destroy(),
        Err(TpsError::ProtectionFailure {
            protection: Protection::ReadWrite,
            errno: libc::EACCES
        })
    );
    assert!(domain.has_binding(A));
    assert_eq!(domain.live_pages(), 1);

    backend.heal();
    domain.destroy().expect("destroy after heal");
    assert_eq!(backend.released.load(Ordering::SeqCst), 1);
}
