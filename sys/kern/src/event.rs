// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event objects.
//!
//! A manual-reset event is the bare signal: once set it stays set and
//! releases every waiter until reset. An auto-reset event adds the
//! decrement-on-release flag, so each set releases exactly one waiter and
//! the event falls back to non-signaled by itself.

use abi::{Error, Handle, ObjectType, SignalFlags};

use crate::kernel::Kernel;
use crate::obj::ObjectKind;

impl Kernel {
    pub fn create_event(
        &mut self,
        initial_state: bool,
        manual_reset: bool,
    ) -> Result<Handle, Error> {
        let obj =
            self.register_object(ObjectKind::Plain, ObjectType::Event)?;
        self.objects[obj.0].signal.signaled = u32::from(initial_state);
        if !manual_reset {
            self.objects[obj.0].signal.flags |= SignalFlags::DEC_ON_RELEASE;
        }

        self.objects[obj.0].ready = true;
        self.objects[obj.0].handle.ok_or(Error::InvalidHandle)
    }

    /// Signals the event.
    pub fn set_event(&mut self, handle: Handle) -> Result<(), Error> {
        let obj = self.object_by_handle(handle, Some(ObjectType::Event))?;
        self.update_signal_state(obj, 1);
        Ok(())
    }

    /// Returns the event to the non-signaled state.
    pub fn reset_event(&mut self, handle: Handle) -> Result<(), Error> {
        let obj = self.object_by_handle(handle, Some(ObjectType::Event))?;
        self.update_signal_state(obj, 0);
        Ok(())
    }
}
