//! Generational arena of shared pages.
//!
//! Every page is a [`Region`] plus the number of bindings referencing it.
//! Bindings hold a [`PageHandle`] (slot index + generation) instead of an
//! address, so a handle that outlives its page resolves to nothing rather
//! than to whatever page later reuses the slot.

use crate::region::Region;

/// Reference to a page in a [`PageArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageHandle {
    index: u32,
    generation: u32,
}

impl PageHandle {
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

/// A registered page.
#[derive(Debug)]
pub struct Page {
    region: Region,
    share_count: u32,
}

impl Page {
    #[must_use]
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Number of bindings referencing this page. Always >= 1 while registered.
    #[must_use]
    pub const fn share_count(&self) -> u32 {
        self.share_count
    }

    #[must_use]
    pub const fn is_shared(&self) -> bool {
        self.share_count > 1
    }
}

/// Outcome of dropping one reference to a page.
#[derive(Debug)]
pub enum Unshared {
    /// Other bindings still reference the page.
    Remaining(u32),
    /// That was the last reference; the page left the arena and its region
    /// must be released by the caller.
    Released(Region),
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    page: Option<Page>,
}

/// Fixed-size page records addressed by generational handles.
#[derive(Debug, Default)]
pub struct PageArena {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    live: usize,
}

impl PageArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `region` as a new page with a share count of 1.
    pub fn insert(&mut self, region: Region) -> PageHandle {
        let page = Page {
            region,
            share_count: 1,
        };
        self.live += 1;

        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.page = Some(page);
            return PageHandle {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            page: Some(page),
        });
        PageHandle {
            index,
            generation: 0,
        }
    }

    #[must_use]
    pub fn get(&self, handle: PageHandle) -> Option<&Page> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.page.as_ref()
    }

    fn get_mut(&mut self, handle: PageHandle) -> Option<&mut Page> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.page.as_mut()
    }

    #[must_use]
    pub fn share_count(&self, handle: PageHandle) -> Option<u32> {
        self.get(handle).map(Page::share_count)
    }

    /// Add one reference. Returns the new share count.
    pub fn share(&mut self, handle: PageHandle) -> Option<u32> {
        let page = self.get_mut(handle)?;
        page.share_count = page.share_count.checked_add(1)?;
        Some(page.share_count)
    }

    /// Drop one reference. The last reference removes the page from the arena.
    pub fn unshare(&mut self, handle: PageHandle) -> Option<Unshared> {
        let page = self.get_mut(handle)?;
        if page.share_count > 1 {
            page.share_count -= 1;
            return Some(Unshared::Remaining(page.share_count));
        }

        let slot = &mut self.slots[handle.index as usize];
        let page = slot.page.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(handle.index);
        self.live -= 1;
        Some(Unshared::Released(page.region))
    }

    /// Number of registered pages.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (PageHandle, &Page)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.page.as_ref().map(|page| {
                (
                    PageHandle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    page,
                )
            })
        })
    }

    /// Remove every page regardless of share count, yielding their regions.
    pub fn drain(&mut self) -> Vec<Region> {
        let mut regions = Vec::with_capacity(self.live);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(page) = slot.page.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free_list.push(index as u32);
                regions.push(page.region);
            }
        }
        self.live = 0;
        regions
    }
}
