// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Semaphore objects.
//!
//! Two flavours share this module. The *semaphore* proper is a critical
//! section with arbitrary capacity: ownership is tracked per task, priority
//! inheritance applies, and termination abandons held units. The *counting
//! semaphore* is the classic bare counter -- decrement on acquire, add on
//! release -- with no owner tracking and no inheritance, which is what
//! interrupt-driven producers want.

use abi::{Error, Handle, ObjectType, SignalFlags};

use crate::csec::CritSect;
use crate::kernel::Kernel;
use crate::obj::ObjectKind;

impl Kernel {
    /// Creates a semaphore with `initial` of `max` units available. The
    /// creator owns the difference.
    pub fn create_semaphore(
        &mut self,
        initial: u32,
        max: u32,
    ) -> Result<Handle, Error> {
        if max == 0 || initial > max {
            return self.fail(Error::InvalidParameter);
        }
        if initial != max && (self.current.is_none() || self.in_isr) {
            return self.fail(Error::AllowedOnlyForTasks);
        }

        let obj = self.register_object(
            ObjectKind::CritSect(CritSect::new(max)),
            ObjectType::Semaphore,
        )?;
        self.register_cs(obj, initial, max, false);

        self.objects[obj.0].ready = true;
        self.objects[obj.0].handle.ok_or(Error::InvalidHandle)
    }

    /// Returns `count` units held by the calling task. Yields the count
    /// available before the release.
    pub fn release_semaphore(
        &mut self,
        handle: Handle,
        count: u32,
    ) -> Result<u32, Error> {
        let obj = self.object_by_handle(handle, Some(ObjectType::Semaphore))?;
        let Some(cur) = self.current else {
            return self.fail(Error::AllowedOnlyForTasks);
        };
        self.release_cs(obj, cur, count)
    }

    /// Creates a counting semaphore: no ownership, no inheritance.
    pub fn create_counting_semaphore(
        &mut self,
        initial: u32,
        max: u32,
    ) -> Result<Handle, Error> {
        if max == 0 || initial > max {
            return self.fail(Error::InvalidParameter);
        }

        let obj = self.register_object(
            ObjectKind::CountingSemaphore { max_signaled: max },
            ObjectType::CountingSemaphore,
        )?;
        self.objects[obj.0].signal.flags |= SignalFlags::DEC_ON_RELEASE;
        self.objects[obj.0].signal.signaled = initial;

        self.objects[obj.0].ready = true;
        self.objects[obj.0].handle.ok_or(Error::InvalidHandle)
    }

    /// Adds `count` units, waking waiters in priority order. Fails rather
    /// than exceed the configured maximum. Yields the count available
    /// before the release.
    pub fn release_counting_semaphore(
        &mut self,
        handle: Handle,
        count: u32,
    ) -> Result<u32, Error> {
        if count == 0 {
            return self.fail(Error::InvalidParameter);
        }
        let obj = self
            .object_by_handle(handle, Some(ObjectType::CountingSemaphore))?;
        let max = match self.objects[obj.0].kind {
            ObjectKind::CountingSemaphore { max_signaled } => max_signaled,
            _ => return self.fail(Error::InvalidHandle),
        };
        let previous = self.objects[obj.0].signal.signaled;
        if previous + count > max {
            return self.fail(Error::ObjectCannotBeReleased);
        }
        self.update_signal_state(obj, previous + count);
        Ok(previous)
    }
}
