// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel online profiling support.
//!
//! This is intended to help measure scheduling latency, time spent inside
//! ISR sections, and the like, as an aid to debugging or optimization work.
//!
//! The kernel does not assume any particular way of getting profiling
//! information out. A target that wants profiling populates an
//! [`EventsTable`] and hands it to [`configure_events_table`] from its
//! startup routine; a typical bare-metal implementation sets and clears
//! GPIOs that an external logic analyzer watches. Keep the handlers fast.

use core::sync::atomic::{AtomicPtr, Ordering};

/// Hooks provided by integration code. If you provide an `EventsTable`, you
/// provide every hook; stub the ones you don't care about with `|| ()`-style
/// empty functions.
pub struct EventsTable {
    /// Called on entry to the scheduler, before a candidate is chosen.
    pub scheduler_enter: fn(),
    /// Called on exit from the scheduler, with the index of the task whose
    /// context is about to be restored.
    pub scheduler_exit: fn(usize),
    /// Called when the outermost ISR section opens.
    pub isr_enter: fn(),
    /// Called when the outermost ISR section closes.
    pub isr_exit: fn(),
    /// Called when a task parks in a wait.
    pub wait_enter: fn(usize),
    /// Called when a parked task is resumed.
    pub wait_exit: fn(usize),
}

/// Supplies the kernel with an events table.
///
/// You can call this more than once if you need to, though that seems odd
/// at first glance.
pub fn configure_events_table(table: &'static EventsTable) {
    EVENTS_TABLE.store(table as *const _ as *mut _, Ordering::Relaxed);
}

/// Internal pointer written by `configure_events_table`. Null means no
/// table. Accesses are `Relaxed` because the table is written once at
/// startup and read many times.
static EVENTS_TABLE: AtomicPtr<EventsTable> =
    AtomicPtr::new(core::ptr::null_mut());

fn table() -> Option<&'static EventsTable> {
    let p = EVENTS_TABLE.load(Ordering::Relaxed);
    if p.is_null() {
        None
    } else {
        // We only write this pointer from a valid `&'static`, and we're
        // handing out a shared reference, so this should be ok...
        unsafe { Some(&*p) }
    }
}

pub(crate) fn event_scheduler_enter() {
    if let Some(t) = table() {
        (t.scheduler_enter)()
    }
}

pub(crate) fn event_scheduler_exit(idx: usize) {
    if let Some(t) = table() {
        (t.scheduler_exit)(idx)
    }
}

pub(crate) fn event_isr_enter() {
    if let Some(t) = table() {
        (t.isr_enter)()
    }
}

pub(crate) fn event_isr_exit() {
    if let Some(t) = table() {
        (t.isr_exit)()
    }
}

pub(crate) fn event_wait_enter(idx: usize) {
    if let Some(t) = table() {
        (t.wait_enter)(idx)
    }
}

pub(crate) fn event_wait_exit(idx: usize) {
    if let Some(t) = table() {
        (t.wait_exit)(idx)
    }
}
