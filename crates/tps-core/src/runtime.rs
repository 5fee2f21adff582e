//! Thread identity as seen by a private storage domain.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of a thread owning (or asking for) a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tid(pub u64);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for Tid {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Source of the calling thread's identity.
///
/// Must be callable from any thread and must return the same `Tid` for the
/// same thread for as long as it holds a binding.
pub trait ThreadRuntime: Send + Sync {
    fn current_thread(&self) -> Tid;
}

impl<T: ThreadRuntime + ?Sized> ThreadRuntime for Arc<T> {
    fn current_thread(&self) -> Tid {
        (**self).current_thread()
    }
}

impl<T: ThreadRuntime + ?Sized> ThreadRuntime for Box<T> {
    fn current_thread(&self) -> Tid {
        (**self).current_thread()
    }
}

/// Identity from `pthread_self`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PthreadRuntime;

impl PthreadRuntime {
    /// `pthread_self` of the calling thread.
    #[must_use]
    pub fn self_tid() -> Tid {
        // SAFETY: pthread_self has no preconditions and cannot fail.
        let raw = unsafe { libc::pthread_self() };
        Tid(raw as usize as u64)
    }
}

impl ThreadRuntime for PthreadRuntime {
    fn current_thread(&self) -> Tid {
        Self::self_tid()
    }
}

/// Identity chosen by a user-level scheduler.
///
/// The scheduler calls [`CooperativeRuntime::switch_to`] before resuming a
/// user-level thread; every domain call made afterwards is attributed to it.
#[derive(Debug, Default)]
pub struct CooperativeRuntime {
    running: AtomicU64,
}

impl CooperativeRuntime {
    #[must_use]
    pub const fn new(initial: Tid) -> Self {
        Self {
            running: AtomicU64::new(initial.0),
        }
    }

    /// Mark `tid` as the running thread.
    pub fn switch_to(&self, tid: Tid) {
        self.running.store(tid.0, Ordering::Release);
    }

    #[must_use]
    pub fn running(&self) -> Tid {
        Tid(self.running.load(Ordering::Acquire))
    }
}

impl ThreadRuntime for CooperativeRuntime {
    fn current_thread(&self) -> Tid {
        self.running()
    }
}
