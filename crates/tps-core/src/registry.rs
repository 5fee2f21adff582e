//! Thread-to-page bindings.
//!
//! The backing table is allocated on the first insertion and freed again when
//! the last binding leaves, so an idle domain holds no registry storage.

use std::collections::HashMap;

use crate::error::{Result, TpsError};
use crate::page::PageHandle;
use crate::runtime::Tid;

/// Association between a thread and the page backing its storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub owner: Tid,
    pub page: PageHandle,
}

/// At most one binding per thread.
#[derive(Debug, Default)]
pub struct Registry {
    bindings: Option<HashMap<Tid, PageHandle>>,
}

impl Registry {
    #[must_use]
    pub const fn new() -> Self {
        Self { bindings: None }
    }

    #[must_use]
    pub fn lookup(&self, owner: Tid) -> Option<Binding> {
        let page = *self.bindings.as_ref()?.get(&owner)?;
        Some(Binding { owner, page })
    }

    #[must_use]
    pub fn contains(&self, owner: Tid) -> bool {
        self.lookup(owner).is_some()
    }

    /// Bind `owner` to `page`. Fails if `owner` is already bound.
    pub fn insert(&mut self, owner: Tid, page: PageHandle) -> Result<Binding> {
        let bindings = self.bindings.get_or_insert_with(HashMap::new);
        if bindings.contains_key(&owner) {
            return Err(TpsError::DuplicateBinding(owner));
        }
        bindings.insert(owner, page);
        Ok(Binding { owner, page })
    }

    /// Point an existing binding at another page, returning the previous page.
    pub fn rebind(&mut self, owner: Tid, page: PageHandle) -> Result<PageHandle> {
        let slot = self
            .bindings
            .as_mut()
            .and_then(|bindings| bindings.get_mut(&owner))
            .ok_or(TpsError::NoBinding(owner))?;
        Ok(std::mem::replace(slot, page))
    }

    /// Remove `owner`'s binding, releasing the table once it is empty.
    pub fn remove(&mut self, owner: Tid) -> Result<Binding> {
        let bindings = self.bindings.as_mut().ok_or(TpsError::NoBinding(owner))?;
        let page = bindings
            .remove(&owner)
            .ok_or(TpsError::NoBinding(owner))?;
        if bindings.is_empty() {
            self.bindings = None;
        }
        Ok(Binding { owner, page })
    }

    /// Number of bindings referencing `page`.
    #[must_use]
    pub fn references(&self, page: PageHandle) -> usize {
        self.bindings
            .as_ref()
            .map_or(0, |b| b.values().filter(|&&p| p == page).count())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.as_ref().map_or(0, HashMap::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the backing table currently exists.
    #[must_use]
    pub const fn is_allocated(&self) -> bool {
        self.bindings.is_some()
    }

    /// All bindings, ordered by owner.
    #[must_use]
    pub fn bindings(&self) -> Vec<Binding> {
        let mut out: Vec<Binding> = self
            .bindings
            .iter()
            .flatten()
            .map(|(&owner, &page)| Binding { owner, page })
            .collect();
        out.sort_by_key(|b| b.owner);
        out
    }
}
