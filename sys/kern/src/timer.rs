// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Software timer objects.
//!
//! A timer is a signal driven by a signal-target time notification: when
//! the deadline passes, the scheduler sets the signal and waiters wake
//! through the deferred-signalization path like for any other object.
//! Auto-reset timers (decrement on release) wake one waiter per firing;
//! manual-reset timers stay signaled until rearmed. Periodic timers
//! re-register themselves at fire time, keeping the period anchored to the
//! previous deadline rather than to when the scheduler got around to it.

use abi::{Error, Handle, ObjectType, SignalFlags, Ticks, INFINITE};

use crate::arch;
use crate::kernel::Kernel;
use crate::obj::{ObjIdx, ObjectKind};
use crate::timenotify::{TimeNotify, TnRef};

pub struct TimerState {
    pub notify: TimeNotify,
    pub interval: Ticks,
    pub periodic: bool,
    pub running: bool,
}

impl Kernel {
    pub fn create_timer(&mut self, manual_reset: bool) -> Result<Handle, Error> {
        let obj = self.register_object(
            ObjectKind::Timer(TimerState {
                // Placeholder self-reference; patched below once the object
                // index exists.
                notify: TimeNotify::new(TnRef::Object(ObjIdx(0))),
                interval: 0,
                periodic: false,
                running: false,
            }),
            ObjectType::Timer,
        )?;
        if let ObjectKind::Timer(ts) = &mut self.objects[obj.0].kind {
            ts.notify = TimeNotify::new(TnRef::Object(obj));
        }

        self.objects[obj.0].signal.signaled = 0;
        if !manual_reset {
            self.objects[obj.0].signal.flags |= SignalFlags::DEC_ON_RELEASE;
        }

        self.objects[obj.0].ready = true;
        self.objects[obj.0].handle.ok_or(Error::InvalidHandle)
    }

    /// Arms the timer to fire `interval` ticks from now, once or
    /// periodically. Rearming a running timer restarts it.
    pub fn set_timer(
        &mut self,
        handle: Handle,
        interval: Ticks,
        periodic: bool,
    ) -> Result<(), Error> {
        if interval == 0 || interval == INFINITE {
            return self.fail(Error::InvalidParameter);
        }
        let obj = self.object_by_handle(handle, Some(ObjectType::Timer))?;

        let _lock = arch::lock();
        if let ObjectKind::Timer(ts) = &mut self.objects[obj.0].kind {
            ts.interval = interval;
            ts.periodic = periodic;
            ts.running = true;
        }
        // Arming resets the signal; a stale firing is not observable after
        // a rearm.
        self.update_signal_state(obj, 0);

        let now = arch::tick_count();
        let deadline = if INFINITE - now <= interval {
            INFINITE
        } else {
            now + interval
        };
        self.register_time_notify(TnRef::Object(obj), deadline);
        Ok(())
    }

    /// Disarms the timer without touching its signal state.
    pub fn cancel_timer(&mut self, handle: Handle) -> Result<(), Error> {
        let obj = self.object_by_handle(handle, Some(ObjectType::Timer))?;

        let _lock = arch::lock();
        let running = matches!(
            &self.objects[obj.0].kind,
            ObjectKind::Timer(ts) if ts.running
        );
        if !running {
            return self.fail(Error::TimerNotStarted);
        }
        self.unregister_time_notify(TnRef::Object(obj));
        if let ObjectKind::Timer(ts) = &mut self.objects[obj.0].kind {
            ts.running = false;
        }
        Ok(())
    }

    /// Scheduler callback when a signal-target notification fires: periodic
    /// timers rearm for the next period, one-shot timers stop.
    pub(crate) fn timer_fired(&mut self, obj: ObjIdx, fired_at: Ticks) {
        let ObjectKind::Timer(ts) = &mut self.objects[obj.0].kind else {
            return;
        };
        if !ts.running {
            return;
        }
        if !ts.periodic {
            ts.running = false;
            return;
        }
        let interval = ts.interval;
        let deadline = if INFINITE - fired_at <= interval {
            INFINITE
        } else {
            fired_at + interval
        };
        self.register_time_notify(TnRef::Object(obj), deadline);
    }
}
