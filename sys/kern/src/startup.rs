// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup and shutdown.

use abi::{BlockingFlags, Error, Priority};
use kerncore::avl::{AvlLink, AvlTree};
use kerncore::pqueue::PQueue;

use crate::arch;
use crate::config;
use crate::kernel::Kernel;
use crate::obj::{KObject, ObjIdx, ObjectKind};
use crate::signal::Signal;
use crate::task::{Task, TaskIdx};
use crate::timenotify::TimeNotify;
use crate::timenotify::TnRef;

/// Body of the idle task: let the HAL shed power until the next interrupt.
fn idle_main(_arg: usize) -> u16 {
    loop {
        arch::save_power();
    }
}

impl Kernel {
    /// Prepares the kernel for `start`: builds the idle task and queues it.
    /// Call once, before creating application tasks.
    pub fn init(&mut self) -> Result<(), Error> {
        if self.idle.is_some() {
            return self.fail(Error::OsAlreadyRunning);
        }

        let context = match arch::create_task_context(config::IDLE_STACK_SIZE)
        {
            Ok(c) => c,
            Err(e) => return self.fail(e),
        };

        // The idle task is assembled by hand: it lives below the handle
        // table, so nothing can wait on it, suspend it, or terminate it.
        let epoch = self.stats.calc_time;
        let Some(raw) = self.tasks.insert(Task::new(
            TaskIdx(0),
            context,
            idle_main,
            0,
            Priority::IDLE,
            BlockingFlags::empty(),
            epoch,
        )) else {
            return self.fail(Error::NotEnoughMemory);
        };
        let idle = TaskIdx(raw);
        self.tasks[raw].ready_link = kerncore::pqueue::PqLink::new(idle);
        self.tasks[raw].wait_timeout = TimeNotify::new(TnRef::Task(idle));

        let mut object = KObject {
            otype: abi::ObjectType::Task,
            handle: None,
            ready: true,
            owner_count: 1,
            signal: Signal::new(),
            deferred_link: AvlLink::detached(),
            kind: ObjectKind::Task(idle),
        };
        object.signal.signaled = 0;
        let Some(oraw) = self.objects.insert(object) else {
            self.tasks.remove(raw);
            return self.fail(Error::NotEnoughMemory);
        };
        self.tasks[raw].obj = ObjIdx(oraw);

        self.idle = Some(idle);
        self.make_ready(idle);

        klog!("init: idle task ready");
        Ok(())
    }

    /// Starts scheduling. Every task created so far becomes eligible; the
    /// caller's context is parked and restored when `stop` is called.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.current.is_some() {
            return self.fail(Error::OsAlreadyRunning);
        }
        klog!("start");
        self.stop_requested = false;
        self.start_requested = true;
        self.yield_now();
        Ok(())
    }

    /// Stops scheduling at the next preemption point, returning control to
    /// wherever `start` was called. No task state is torn down; `start`
    /// resumes where things left off.
    pub fn stop(&mut self) {
        klog!("stop requested");
        self.start_requested = false;
        self.stop_requested = true;
        self.yield_now();
    }

    /// Releases everything the kernel owns. Only legal while stopped.
    pub fn deinit(&mut self) -> Result<(), Error> {
        if self.current.is_some() || self.in_isr {
            return self.fail(Error::OsCannotBeRunning);
        }

        // Forget pending deadlines first so object teardown does not walk
        // a queue that references cells being freed.
        self.time_queue = PQueue::new();
        self.notify_slot = [None; config::PRIORITY_COUNT];
        self.notify_min = [abi::INFINITE; 2 * config::PRIORITY_COUNT];
        let live: [Option<u16>; config::NUM_TASKS] = {
            let mut buf = [None; config::NUM_TASKS];
            for (slot, (i, _)) in buf.iter_mut().zip(self.tasks.iter()) {
                *slot = Some(i);
            }
            buf
        };
        for i in live.into_iter().flatten() {
            self.tasks[i].wait_timeout.registered = false;
        }
        let live_objects: [Option<u16>; config::NUM_OBJECTS] = {
            let mut buf = [None; config::NUM_OBJECTS];
            for (slot, (i, _)) in buf.iter_mut().zip(self.objects.iter()) {
                *slot = Some(i);
            }
            buf
        };
        for i in live_objects.into_iter().flatten() {
            if let ObjectKind::Timer(ts) = &mut self.objects[i].kind {
                ts.notify.registered = false;
            }
        }

        // Tear down every remaining object; task objects release their
        // contexts on the way out.
        loop {
            let Some(next) = self.objects.iter().next().map(|(i, _)| i) else {
                break;
            };
            self.delete_object(ObjIdx(next));
        }

        self.children = kerncore::pool::Pool::new();
        self.handles = kerncore::handles::HandleTable::new();
        self.ready = PQueue::new();
        self.deferred = AvlTree::new();
        self.idle = None;
        self.last_quantum_time = 0;
        self.last_quantum_index = 0;

        klog!("deinit complete");
        Ok(())
    }
}
