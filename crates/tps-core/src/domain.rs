//! The lifecycle API.
//!
//! A [`TpsDomain`] owns one registry and one page arena behind a single
//! critical section. Every operation takes the section for its whole
//! duration, so calls from different threads are totally ordered and never
//! interleave. Nothing inside the section blocks or yields.
//!
//! Fallible steps always run before visible mutation. In particular a
//! copy-on-write fork builds and seals the new page first and only then
//! moves the caller's binding over to it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::config::TpsConfig;
use crate::error::{Result, TpsError};
use crate::fault::{self, SignalObserver, ViolationObserver};
use crate::gate;
use crate::metrics::{MetricsSnapshot, TpsMetrics};
use crate::page::{Page, PageArena, PageHandle, Unshared};
use crate::region::{MemoryBackend, MmapBackend, Protection, Region};
use crate::registry::{Binding, Registry};
use crate::runtime::{PthreadRuntime, ThreadRuntime, Tid};

#[derive(Debug, Default)]
struct DomainState {
    registry: Registry,
    pages: PageArena,
}

impl DomainState {
    fn binding_of(&self, tid: Tid) -> Result<(Binding, &Page)> {
        let binding = self.registry.lookup(tid).ok_or(TpsError::NoBinding(tid))?;
        let page = self
            .pages
            .get(binding.page)
            .ok_or(TpsError::NoBinding(tid))?;
        Ok((binding, page))
    }
}

/// One page of a [`DomainSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageShare {
    pub page: PageHandle,
    /// Base address of the page's region.
    pub base: usize,
    pub share_count: u32,
}

/// Consistent copy of a domain's bindings and pages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainSnapshot {
    /// Ordered by owner.
    pub bindings: Vec<Binding>,
    /// Ordered by arena slot.
    pub pages: Vec<PageShare>,
}

impl DomainSnapshot {
    /// Whether every page's share count equals the number of bindings
    /// referencing it and every binding references a registered page.
    #[must_use]
    pub fn refcounts_balanced(&self) -> bool {
        let pages_match = self.pages.iter().all(|share| {
            let refs = self
                .bindings
                .iter()
                .filter(|b| b.page == share.page)
                .count();
            share.share_count >= 1 && refs == share.share_count as usize
        });
        let bindings_resolve = self
            .bindings
            .iter()
            .all(|b| self.pages.iter().any(|share| share.page == b.page));
        pages_match && bindings_resolve
    }
}

/// Builder for a [`TpsDomain`] with non-default seams.
pub struct DomainBuilder {
    runtime: Box<dyn ThreadRuntime>,
    backend: Box<dyn MemoryBackend>,
    observer: Box<dyn ViolationObserver>,
    config: TpsConfig,
}

impl DomainBuilder {
    #[must_use]
    pub fn runtime(mut self, runtime: impl ThreadRuntime + 'static) -> Self {
        self.runtime = Box::new(runtime);
        self
    }

    #[must_use]
    pub fn backend(mut self, backend: impl MemoryBackend + 'static) -> Self {
        self.backend = Box::new(backend);
        self
    }

    #[must_use]
    pub fn observer(mut self, observer: impl ViolationObserver + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    #[must_use]
    pub fn config(mut self, config: TpsConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn build(self) -> TpsDomain {
        TpsDomain {
            runtime: self.runtime,
            backend: self.backend,
            observer: self.observer,
            config: self.config,
            initialized: AtomicBool::new(false),
            state: Mutex::new(DomainState::default()),
            metrics: TpsMetrics::new(),
        }
    }
}

impl Default for DomainBuilder {
    fn default() -> Self {
        Self {
            runtime: Box::new(PthreadRuntime),
            backend: Box::new(MmapBackend),
            observer: Box::new(SignalObserver),
            config: TpsConfig::default(),
        }
    }
}

impl fmt::Debug for DomainBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A set of thread-private storage bindings sharing one critical section.
pub struct TpsDomain {
    runtime: Box<dyn ThreadRuntime>,
    backend: Box<dyn MemoryBackend>,
    observer: Box<dyn ViolationObserver>,
    config: TpsConfig,
    initialized: AtomicBool,
    state: Mutex<DomainState>,
    metrics: TpsMetrics,
}

impl TpsDomain {
    /// Domain over pthreads, anonymous mappings, and the signal observer.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    #[must_use]
    pub fn with_config(config: TpsConfig) -> Self {
        Self::builder().config(config).build()
    }

    #[must_use]
    pub fn builder() -> DomainBuilder {
        DomainBuilder::default()
    }

    #[must_use]
    pub fn config(&self) -> TpsConfig {
        self.config
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Initialize the domain, optionally installing the violation observer.
    ///
    /// Succeeds once. Installing the observer is irreversible; if it fails the
    /// domain stays uninitialized and `init` may be retried.
    pub fn init(&self, report_faults: bool) -> Result<()> {
        let _section = self.state.lock();
        if self
            .initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TpsError::AlreadyInitialized);
        }
        if report_faults {
            if let Err(err) = self.observer.install() {
                self.initialized.store(false, Ordering::Release);
                return Err(err);
            }
        }
        Ok(())
    }

    /// [`init`](Self::init) with the configured reporting mode.
    pub fn init_from_config(&self) -> Result<()> {
        self.init(self.config.fault_reporting.enabled())
    }

    /// Give the calling thread a fresh zero-filled page.
    pub fn create(&self) -> Result<()> {
        let tid = self.runtime.current_thread();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.registry.contains(tid) {
            return Err(TpsError::DuplicateBinding(tid));
        }

        let region = self.reserve_region(state.pages.len())?;
        let base = region.addr();
        let page = state.pages.insert(region);
        state.registry.insert(tid, page)?;
        Self::watch_page(base);

        TpsMetrics::inc(&self.metrics.creates);
        Ok(())
    }

    /// Drop the calling thread's binding, releasing its page if no other
    /// binding references it.
    pub fn destroy(&self) -> Result<()> {
        let tid = self.runtime.current_thread();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let (binding, page) = state.binding_of(tid)?;
        debug_assert_eq!(
            state.registry.references(binding.page),
            page.share_count() as usize
        );
        if !page.is_shared() {
            // Last reference: open the region up before handing it back.
            self.backend
                .protect(page.region(), Protection::ReadWrite)
                .map_err(|errno| {
                    TpsMetrics::inc(&self.metrics.protection_failures);
                    TpsError::ProtectionFailure {
                        protection: Protection::ReadWrite,
                        errno,
                    }
                })?;
        }

        state.registry.remove(tid)?;
        if let Some(Unshared::Released(region)) = state.pages.unshare(binding.page) {
            self.release_region(region);
        }

        TpsMetrics::inc(&self.metrics.destroys);
        Ok(())
    }

    /// Copy `length` bytes at `offset` of the caller's page into `buffer`.
    pub fn read(&self, offset: usize, length: usize, buffer: &mut [u8]) -> Result<()> {
        self.read_with(offset, length, Some(buffer))
    }

    /// [`read`](Self::read) where `None` stands for a missing buffer, as at
    /// the C boundary.
    pub fn read_with(&self, offset: usize, length: usize, buffer: Option<&mut [u8]>) -> Result<()> {
        let Some(buffer) = buffer else {
            return Err(self.reject(TpsError::InvalidBuffer {
                length,
                available: 0,
            }));
        };
        gate::check_access(offset, length, buffer.len()).map_err(|err| self.reject(err))?;

        let tid = self.runtime.current_thread();
        let state = self.state.lock();
        let (_, page) = state.binding_of(tid)?;
        gate::read_into(&*self.backend, page.region(), offset, &mut buffer[..length])
            .map_err(|err| self.protection_failed(err))?;

        TpsMetrics::inc(&self.metrics.reads);
        Ok(())
    }

    /// Copy `length` bytes of `buffer` into the caller's page at `offset`.
    ///
    /// If the page is shared, the caller first gets a private duplicate;
    /// other sharers keep seeing the old contents.
    pub fn write(&self, offset: usize, length: usize, buffer: &[u8]) -> Result<()> {
        self.write_with(offset, length, Some(buffer))
    }

    /// [`write`](Self::write) where `None` stands for a missing buffer.
    pub fn write_with(&self, offset: usize, length: usize, buffer: Option<&[u8]>) -> Result<()> {
        let Some(buffer) = buffer else {
            return Err(self.reject(TpsError::InvalidBuffer {
                length,
                available: 0,
            }));
        };
        gate::check_access(offset, length, buffer.len()).map_err(|err| self.reject(err))?;
        let data = &buffer[..length];

        let tid = self.runtime.current_thread();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let (binding, page) = state.binding_of(tid)?;

        if !page.is_shared() {
            gate::write_from(&*self.backend, page.region(), offset, data)
                .map_err(|err| self.protection_failed(err))?;
            TpsMetrics::inc(&self.metrics.writes);
            return Ok(());
        }

        let fresh = self.reserve_region(state.pages.len())?;
        if let Err(err) = gate::fork_into(&*self.backend, page.region(), &fresh, offset, data) {
            self.discard_region(fresh);
            return Err(self.protection_failed(err));
        }

        // The new page is complete and sealed. Commit.
        let base = fresh.addr();
        if let Some(Unshared::Released(region)) = state.pages.unshare(binding.page) {
            self.release_region(region);
        }
        let forked = state.pages.insert(fresh);
        state.registry.rebind(tid, forked)?;
        Self::watch_page(base);

        TpsMetrics::inc(&self.metrics.cow_forks);
        TpsMetrics::inc(&self.metrics.writes);
        Ok(())
    }

    /// Bind the calling thread to the page of `target` without copying it.
    pub fn clone_from_thread(&self, target: Tid) -> Result<()> {
        let tid = self.runtime.current_thread();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let source = state
            .registry
            .lookup(target)
            .ok_or(TpsError::NoBinding(target))?;
        if state.registry.contains(tid) {
            return Err(TpsError::DuplicateBinding(tid));
        }
        state
            .pages
            .share(source.page)
            .ok_or(TpsError::NoBinding(target))?;
        state.registry.insert(tid, source.page)?;

        TpsMetrics::inc(&self.metrics.clones);
        Ok(())
    }

    /// Share count of the page bound to `tid`.
    #[must_use]
    pub fn share_count(&self, tid: Tid) -> Option<u32> {
        let state = self.state.lock();
        let binding = state.registry.lookup(tid)?;
        state.pages.share_count(binding.page)
    }

    #[must_use]
    pub fn has_binding(&self, tid: Tid) -> bool {
        self.state.lock().registry.contains(tid)
    }

    /// Base address of the calling thread's page.
    ///
    /// Touching this address directly is a protection violation.
    pub fn region_addr(&self) -> Result<usize> {
        let tid = self.runtime.current_thread();
        let state = self.state.lock();
        let (_, page) = state.binding_of(tid)?;
        Ok(page.region().addr())
    }

    #[must_use]
    pub fn snapshot(&self) -> DomainSnapshot {
        let state = self.state.lock();
        DomainSnapshot {
            bindings: state.registry.bindings(),
            pages: state
                .pages
                .iter()
                .map(|(page, record)| PageShare {
                    page,
                    base: record.region().addr(),
                    share_count: record.share_count(),
                })
                .collect(),
        }
    }

    /// Number of registered pages.
    #[must_use]
    pub fn live_pages(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// Whether the registry currently holds any storage.
    #[must_use]
    pub fn registry_allocated(&self) -> bool {
        self.state.lock().registry.is_allocated()
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn reserve_region(&self, live_pages: usize) -> Result<Region> {
        if self.config.max_pages.is_some_and(|max| live_pages >= max) {
            return Err(TpsError::AllocationFailure {
                errno: libc::ENOMEM,
            });
        }
        let region = self
            .backend
            .reserve()
            .map_err(|errno| TpsError::AllocationFailure { errno })?;
        TpsMetrics::inc(&self.metrics.pages_reserved);
        Ok(region)
    }

    /// Return a region that was never registered.
    fn discard_region(&self, region: Region) {
        match self.backend.release(region) {
            Ok(()) => TpsMetrics::inc(&self.metrics.pages_released),
            Err(_) => TpsMetrics::inc(&self.metrics.release_failures),
        }
    }

    /// Return a region that just left the arena.
    fn release_region(&self, region: Region) {
        fault::unwatch(region.addr());
        self.discard_region(region);
    }

    fn watch_page(base: usize) {
        let watched = fault::watch(base);
        debug_assert!(watched, "page at {base:#x} is not watchable");
    }

    fn reject(&self, err: TpsError) -> TpsError {
        TpsMetrics::inc(&self.metrics.rejected_accesses);
        err
    }

    fn protection_failed(&self, err: TpsError) -> TpsError {
        if matches!(err, TpsError::ProtectionFailure { .. }) {
            TpsMetrics::inc(&self.metrics.protection_failures);
        }
        err
    }
}

impl Default for TpsDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TpsDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TpsDomain")
            .field("config", &self.config)
            .field("initialized", &self.is_initialized())
            .field("metrics", &self.metrics.snapshot())
            .finish_non_exhaustive()
    }
}

impl Drop for TpsDomain {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.registry = Registry::new();
        let regions = state.pages.drain();
        for region in regions {
            if self.backend.protect(&region, Protection::ReadWrite).is_err() {
                TpsMetrics::inc(&self.metrics.protection_failures);
            }
            self.release_region(region);
        }
    }
}
