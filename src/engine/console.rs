//! Console arbiter: a single-slot lock on the controlling terminal.
//!
//! Only one service at a time may own the console; further claimants wait
//! in FIFO order and are granted ownership as the current owner releases.

use std::collections::VecDeque;

use super::ServiceSet;
use crate::service::{ServiceId, ServiceState};

#[derive(Debug)]
pub(crate) struct ConsoleQueue {
    owner: Option<ServiceId>,
    waiters: VecDeque<ServiceId>,
}

impl ConsoleQueue {
    pub(crate) fn new() -> Self {
        Self {
            owner: None,
            waiters: VecDeque::new(),
        }
    }

    pub(crate) fn owner(&self) -> Option<ServiceId> {
        self.owner
    }
}

/// Hand the foreground process group back to the daemon. Best effort; fails
/// harmlessly when there is no controlling terminal.
pub(crate) fn reclaim_terminal() {
    unsafe {
        let _ = libc::tcsetpgrp(0, libc::getpgrp());
    }
}

impl ServiceSet {
    /// Claim the console, or wait in line for it. Ownership is granted
    /// synchronously when the slot is free.
    pub(crate) fn queue_for_console(&mut self, id: ServiceId) {
        if self.console.owner.is_none() && self.console.waiters.is_empty() {
            self.console.owner = Some(id);
            self.acquired_console(id);
        } else if self.console.owner != Some(id) && !self.console.waiters.contains(&id) {
            self.console.waiters.push_back(id);
        }
    }

    /// Give up console ownership; the head waiter (if any) acquires it.
    pub(crate) fn release_console(&mut self, id: ServiceId) {
        if self.console.owner != Some(id) {
            return;
        }
        self.console.owner = None;
        if let Some(next) = self.console.waiters.pop_front() {
            self.console.owner = Some(next);
            self.acquired_console(next);
        }
    }

    /// Remove a waiter whose start was cancelled.
    pub(crate) fn unqueue_console(&mut self, id: ServiceId) {
        self.console.waiters.retain(|&w| w != id);
    }

    fn acquired_console(&mut self, id: ServiceId) {
        if self.rec(id).state != ServiceState::Starting {
            // Got the console but no longer want it.
            self.release_console(id);
        } else if self.start_check_dependencies(id, false) {
            self.all_deps_started(id, true);
        } else {
            self.release_console(id);
        }
    }
}
