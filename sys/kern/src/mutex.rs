// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mutex objects: recursive mutual exclusion with priority inheritance.
//!
//! A mutex is the thinnest possible shell over a critical section with
//! capacity one in mutual-exclusion mode. Acquisition happens through the
//! generic wait path (`wait_for_object`).

use abi::{Error, Handle, ObjectType};

use crate::csec::CritSect;
use crate::kernel::Kernel;
use crate::obj::ObjectKind;

impl Kernel {
    /// Creates a mutex. With `initial_owner` the calling task starts out
    /// holding it.
    pub fn create_mutex(&mut self, initial_owner: bool) -> Result<Handle, Error> {
        if initial_owner && (self.current.is_none() || self.in_isr) {
            return self.fail(Error::AllowedOnlyForTasks);
        }

        let obj = self.register_object(
            ObjectKind::CritSect(CritSect::new(1)),
            ObjectType::Mutex,
        )?;
        self.register_cs(obj, if initial_owner { 0 } else { 1 }, 1, true);

        self.objects[obj.0].ready = true;
        self.objects[obj.0].handle.ok_or(Error::InvalidHandle)
    }

    /// Releases one level of ownership. The outermost release hands the
    /// mutex to the most important waiter.
    pub fn release_mutex(&mut self, handle: Handle) -> Result<(), Error> {
        let obj = self.object_by_handle(handle, Some(ObjectType::Mutex))?;
        let Some(cur) = self.current else {
            return self.fail(Error::AllowedOnlyForTasks);
        };
        self.release_cs(obj, cur, 1).map(|_| ())
    }
}
