// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compile-time system configuration.
//!
//! The kernel takes a single shape fixed at build time; every
//! priority-indexed or capacity-bounded structure is sized from the
//! constants here. Retuning for a target means editing this file (or, in a
//! fancier build, generating it).

use abi::Ticks;

/// Numerically largest priority usable by application tasks; 255 stays
/// reserved for the idle task. Must be in 0..=254.
pub const LOWEST_USED_PRIORITY: u8 = 31;

/// Priority count rounded up to a power of two, which sizes the
/// time-notification search structures.
pub const PRIORITY_COUNT: usize =
    (LOWEST_USED_PRIORITY as usize + 1).next_power_of_two();

/// Maximum number of signals one task can wait on simultaneously (the size
/// of each task's wait-association array).
pub const MAX_WAIT_FOR_OBJECTS: usize = 4;

/// Whether preemption within a priority level is driven by per-task time
/// quanta. When disabled the ready queue rotates on every scheduling pass
/// instead.
pub const USE_TIME_QUANTA: bool = true;

/// Width of one CPU-usage sampling window, in ticks.
pub const STAT_SAMPLE_RATE: Ticks = 100;

/// Arena capacities.
pub const NUM_TASKS: usize = 16;
pub const NUM_OBJECTS: usize = 48;
pub const NUM_HANDLES: usize = 64;
pub const NUM_CHILD_LINKS: usize = 128;

/// Owner-association cells embedded in each critical section. Sized to the
/// task arena so that allocation of a cell can never fail: a critical
/// section has at most one association per task.
pub const CS_OWNER_SLOTS: usize = NUM_TASKS;

/// Stack sizing passed through to the context layer.
pub const DEFAULT_TASK_STACK_SIZE: usize = 0x400;
pub const IDLE_STACK_SIZE: usize = 0x60;
