//! Thread-private storage (TPS).
//!
//! Each thread may own one fixed-size, protection-controlled memory page that
//! other threads cannot see unless they clone it. Cloned pages are shared
//! copy-on-write: the first write by a sharer duplicates the page for that
//! sharer only.
//!
//! The entry point is [`TpsDomain`], which owns the binding registry, the page
//! arena, and the single critical section that serializes every operation.
//! Host-specific pieces sit behind three seams:
//!
//! - [`ThreadRuntime`]: who is the calling thread.
//! - [`MemoryBackend`]: reserve, protect, and release page regions.
//! - [`ViolationObserver`]: report accesses that bypass the access gate.

pub mod config;
pub mod domain;
pub mod error;
#[allow(unsafe_code)]
pub mod fault;
#[allow(unsafe_code)]
pub mod gate;
pub mod metrics;
pub mod page;
#[allow(unsafe_code)]
pub mod region;
pub mod registry;
#[allow(unsafe_code)]
pub mod runtime;
pub mod sem;

/// Size in bytes of every private storage region. Must be a power of two.
pub const TPS_SIZE: usize = 4096;

const _: () = assert!(TPS_SIZE.is_power_of_two());

pub use config::{FaultReporting, TpsConfig};
pub use domain::{DomainBuilder, DomainSnapshot, PageShare, TpsDomain};
pub use error::{Result, TpsError};
pub use fault::{NullObserver, SignalObserver, ViolationObserver};
pub use metrics::{MetricsSnapshot, TpsMetrics};
pub use page::{PageArena, PageHandle};
pub use region::{MemoryBackend, MmapBackend, Protection, Region};
pub use registry::{Binding, Registry};
pub use runtime::{CooperativeRuntime, PthreadRuntime, ThreadRuntime, Tid};
pub use sem::Semaphore;
