//! Counting semaphore with a FIFO wait list.
//!
//! Used to hand control between threads in tests and scenarios. A release
//! that finds waiters passes its unit straight to the oldest one, so a late
//! `down` cannot overtake a thread that is already queued.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct State {
    count: usize,
    next_ticket: u64,
    /// Tickets of blocked callers, oldest first.
    waiting: VecDeque<u64>,
    /// Tickets that were handed a unit but have not woken yet.
    granted: Vec<u64>,
}

/// A counting semaphore.
#[derive(Debug, Default)]
pub struct Semaphore {
    state: Mutex<State>,
    wake: Condvar,
}

impl Semaphore {
    /// Create a semaphore holding `count` units.
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            state: Mutex::new(State {
                count,
                ..State::default()
            }),
            wake: Condvar::new(),
        }
    }

    /// Take one unit, blocking while none is available.
    pub fn down(&self) {
        let mut state = self.state.lock();
        if state.count > 0 && state.waiting.is_empty() {
            state.count -= 1;
            return;
        }

        let ticket = state.next_ticket;
        state.next_ticket = state.next_ticket.wrapping_add(1);
        state.waiting.push_back(ticket);
        loop {
            if let Some(pos) = state.granted.iter().position(|&t| t == ticket) {
                state.granted.swap_remove(pos);
                return;
            }
            self.wake.wait(&mut state);
        }
    }

    /// Take one unit if one is available right now.
    pub fn try_down(&self) -> bool {
        let mut state = self.state.lock();
        if state.count > 0 && state.waiting.is_empty() {
            state.count -= 1;
            true
        } else {
            false
        }
    }

    /// Return one unit, waking the oldest waiter if there is one.
    pub fn up(&self) {
        let mut state = self.state.lock();
        match state.waiting.pop_front() {
            Some(ticket) => {
                state.granted.push(ticket);
                drop(state);
                self.wake.notify_all();
            }
            None => state.count += 1,
        }
    }

    /// Available units, or minus the number of blocked callers when none are.
    #[must_use]
    pub fn value(&self) -> isize {
        let state = self.state.lock();
        if state.count > 0 {
            isize::try_from(state.count).unwrap_or(isize::MAX)
        } else {
            -isize::try_from(state.waiting.len()).unwrap_or(isize::MAX)
        }
    }
}
