// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and application code.

#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Kernel time, measured in ticks of the HAL tick counter. The tick rate is
/// platform-defined; `TICKS_PER_SECOND` gives the conventional value.
pub type Ticks = u32;

/// Conventional tick rate used when converting to wall-clock units.
pub const TICKS_PER_SECOND: Ticks = 1000;

/// Timeout value meaning "wait forever". Also serves as the "no deadline"
/// sentinel inside the time-notification engine.
pub const INFINITE: Ticks = Ticks::MAX;

/// Timeout value meaning "do not wait at all".
pub const NO_WAIT: Ticks = 0;

/// Indicates priority of a task.
///
/// Priorities are small numbers starting from zero. Numerically lower
/// priorities are more important, so Priority 0 is the most likely to be
/// scheduled, followed by 1, and so forth.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means numerically
/// greater / less important, or more important / numerically smaller.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Default,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
    Serialize,
    Deserialize,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Priority of the idle task. Reserved; application tasks use
    /// numerically smaller values.
    pub const IDLE: Self = Self(255);

    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since lower numbers are more important.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }

    /// Usable as an index into priority-indexed structures.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Names a live kernel object. Handles are dense small integers starting at
/// one; zero is reserved so that `Option<Handle>` can stand in for the null
/// handle without costing space.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Handle(pub core::num::NonZeroU32);

impl Handle {
    /// Fabricates a handle from a table slot index.
    pub fn from_index(index: usize) -> Option<Self> {
        core::num::NonZeroU32::new(index as u32 + 1).map(Self)
    }

    /// Recovers the table slot index this handle names.
    pub fn index(self) -> usize {
        self.0.get() as usize - 1
    }
}

/// Discriminates the classes of kernel object a handle can refer to.
///
/// Lookups that do not care about the class pass `None` in place of a type,
/// which skips the check entirely.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ObjectType {
    Task = 1,
    Mutex = 2,
    Semaphore = 3,
    CountingSemaphore = 4,
    Event = 5,
    Timer = 6,
}

bitflags::bitflags! {
    /// Reasons a task is not eligible to run. A task is ready exactly when
    /// this set is empty.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct BlockingFlags: u8 {
        const SLEEP = 0x01;
        const WAITING = 0x02;
        const IPC = 0x04;
        const SUSPENDED = 0x10;
        const TERMINATING = 0x20;
        const TERMINATED = 0x40;
    }
}

bitflags::bitflags! {
    /// Behavioral flags of a signal (the universal waitable).
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct SignalFlags: u8 {
        /// The signal is currently linked into the deferred-signalization
        /// tree.
        const DEFERRED = 0x01;
        /// Signal state is owned by an external I/O system rather than the
        /// `signaled` counter.
        const USES_IO_SYSTEM = 0x02;
        /// Acquiring decrements the `signaled` counter (semaphores,
        /// auto-reset events) instead of leaving it untouched.
        const DEC_ON_RELEASE = 0x04;
        /// The signal fronts a critical section; acquisition records an
        /// owner association.
        const CRITICAL_SECTION = 0x08;
        /// Critical section in mutual-exclusion mode: the single owner may
        /// re-acquire recursively.
        const MUTUAL_EXCLUSION = 0x10;
        /// The previous owner was terminated while holding the critical
        /// section. Cleared by the next successful acquire, which observes
        /// the advisory.
        const ABANDONED = 0x20;
    }
}

/// Result of a wait-class operation.
///
/// Abandonment is deliberately distinct from both success and failure: the
/// acquisition *happened*, and the advisory tells the caller the protected
/// state may want checking.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum WaitStatus {
    /// The signal at the given index was acquired immediately.
    Acquired(usize),
    /// Acquired, but a previous owner was terminated while holding the
    /// underlying critical section.
    AcquiredAbandoned(usize),
    /// No signal could be acquired; the task has been parked and will be
    /// resumed by the scheduler. Collect the outcome with
    /// `take_wait_result` after resumption.
    Parked,
    /// The wait could not be entered at all.
    Failed(Error),
}

/// Error codes, organized by subsystem. The numeric values are stable and
/// grouped: generic, memory, handle, architecture, OS lifecycle and
/// synchronization.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u16)]
pub enum Error {
    // Generic
    InvalidParameter = 0x0001,
    NotImplemented = 0x0002,

    // Memory management
    NotEnoughMemory = 0x0010,
    InvalidMemoryBlock = 0x0011,

    // Handle management
    CannotAssignNewHandle = 0x0020,
    InvalidHandle = 0x0021,
    NoDefinedIoCtl = 0x0022,

    // Architecture
    CannotInitArchitecture = 0x0080,
    CannotSetPreemptHandler = 0x0081,
    CannotCreateTaskContext = 0x0082,
    CannotReleaseTaskContext = 0x0083,
    TooSmallStackSize = 0x0084,

    // OS lifecycle
    OsAlreadyRunning = 0x0100,
    OsCannotBeRunning = 0x0101,
    AllowedOnlyForTasks = 0x0103,
    ObjectAlreadyExists = 0x0104,
    ObjectCannotBeOpened = 0x0105,
    ObjectCannotBeReleased = 0x0106,
    TaskNotTerminated = 0x0107,
    TaskTerminatedByOther = 0x0108,

    // Waiting
    WaitTimeout = 0x0109,
    WaitAbandoned = 0x010A,
    WaitDeadlock = 0x010B,
    TimerNotStarted = 0x010D,
    DataTransferFailure = 0x0110,
}

impl Error {
    /// Stable numeric code, for logging and for storage in task exit codes.
    pub fn code(self) -> u16 {
        self as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_reads_correctly() {
        assert!(Priority(0).is_more_important_than(Priority(1)));
        assert!(!Priority(7).is_more_important_than(Priority(7)));
        assert!(Priority(7).is_more_important_than(Priority::IDLE));
    }

    #[test]
    fn handle_round_trips_index() {
        let h = Handle::from_index(41).unwrap();
        assert_eq!(h.index(), 41);
        assert_eq!(h.0.get(), 42);
    }

    #[test]
    fn error_codes_stay_grouped() {
        assert_eq!(Error::NotEnoughMemory.code() & 0xFFF0, 0x0010);
        assert_eq!(Error::WaitDeadlock.code(), 0x010B);
    }
}
