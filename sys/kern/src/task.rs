// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task descriptors and task management.

use abi::{BlockingFlags, Error, Handle, ObjectType, Priority, Ticks};
use kerncore::avl::{AvlLink, AvlTree};
use kerncore::pool::Pool;
use kerncore::pqueue::{PQueue, PqLink};

use crate::arch;
use crate::config;
use crate::csec::{CsaRef, PathRef};
use crate::kernel::Kernel;
use crate::obj::{ChildRef, ObjIdx, ObjectKind};
use crate::timenotify::{TimeNotify, TnRef};
use crate::wait::WaitRef;

/// Index of a task in the task arena.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TaskIdx(pub u16);

/// Task entry point: receives the creation argument, returns the exit code.
pub type TaskFn = fn(usize) -> u16;

/// Per-task CPU usage accounting: a closed sampling window and the one
/// currently accumulating.
#[derive(Copy, Clone, Debug)]
pub struct UsageStats {
    pub usage_time: Ticks,
    pub usage: u32,
    pub calc_time: Ticks,
    pub calc: u32,
}

impl UsageStats {
    pub(crate) fn new(calc_time: Ticks) -> Self {
        Self {
            usage_time: abi::INFINITE,
            usage: 0,
            calc_time,
            calc: 0,
        }
    }
}

/// Binds a task to one signal it is waiting on; lives in the task's
/// fixed wait array and doubles as the AVL node inside that signal's wait
/// tree.
#[derive(Copy, Clone, Debug)]
pub struct WaitAssoc {
    /// Object whose signal this slot is parked on; `None` while unused.
    pub signal: Option<ObjIdx>,
    pub link: AvlLink<WaitRef>,
}

impl WaitAssoc {
    const EMPTY: Self = Self {
        signal: None,
        link: AvlLink::detached(),
    };
}

/// Internal representation of a task.
pub struct Task {
    /// Object descriptor fronting this task (handle, termination signal).
    pub obj: ObjIdx,
    /// Saved machine state, restored by the HAL when the scheduler picks
    /// this task.
    pub context: arch::TaskContext,
    pub entry: TaskFn,
    pub arg: usize,

    /// Link in the ready-to-run queue, plus whether it is currently linked.
    pub ready_link: PqLink<TaskIdx>,
    pub queued: bool,

    /// Effective priority: the assigned one, possibly boosted by priority
    /// inheritance while this task owns contended critical sections.
    pub priority: Priority,
    pub assigned_priority: Priority,
    /// Worklist link for the priority-path walk.
    pub path_next: Option<PathRef>,

    /// Quantum-tick pair stamped at each scheduling decision; breaks FIFO
    /// ties between equal priorities everywhere priorities are compared.
    pub last_quantum_time: Ticks,
    pub last_quantum_index: u32,
    pub max_quantum: u8,
    pub quantum_counter: u8,

    pub blocking: BlockingFlags,

    pub waiting_for: [WaitAssoc; config::MAX_WAIT_FOR_OBJECTS],
    pub waiting_count: usize,
    /// Index of the signal that satisfied the last wait.
    pub waiting_index: usize,
    /// Why the last wait ended; `None` is a clean acquisition.
    pub wait_exit: Option<Error>,
    /// Deadline registration used for sleeps and wait timeouts.
    pub wait_timeout: TimeNotify,

    /// Critical sections this task owns, ordered by the most important
    /// priority waiting on each, plus an index of the same associations by
    /// object for O(log n) ownership lookups.
    pub owned_cs: PQueue<CsaRef>,
    pub owned_cs_index: AvlTree<CsaRef>,

    /// Objects this task has created or opened, keyed by handle.
    pub children: AvlTree<ChildRef>,

    pub stats: UsageStats,
    pub exit_code: u16,
    pub last_error: Option<Error>,
}

impl Task {
    pub(crate) fn new(
        idx: TaskIdx,
        context: arch::TaskContext,
        entry: TaskFn,
        arg: usize,
        priority: Priority,
        blocking: BlockingFlags,
        stats_epoch: Ticks,
    ) -> Self {
        Self {
            obj: ObjIdx(0), // patched by the creator once the object exists
            context,
            entry,
            arg,
            ready_link: PqLink::new(idx),
            queued: false,
            priority,
            assigned_priority: priority,
            path_next: None,
            last_quantum_time: 0,
            last_quantum_index: 0,
            max_quantum: 1,
            quantum_counter: 1,
            blocking,
            waiting_for: [WaitAssoc::EMPTY; config::MAX_WAIT_FOR_OBJECTS],
            waiting_count: 0,
            waiting_index: 0,
            wait_exit: None,
            wait_timeout: TimeNotify::new(TnRef::Task(idx)),
            owned_cs: PQueue::new(),
            owned_cs_index: AvlTree::new(),
            children: AvlTree::new(),
            stats: UsageStats::new(stats_epoch),
            exit_code: 0,
            last_error: None,
        }
    }
}

/// Orders tasks by effective priority, breaking ties with the quantum-tick
/// pair so that equally-important tasks keep FIFO order by last scheduling
/// time. This is the comparison behind wait trees, the deferred-signal tree,
/// and scheduling decisions.
pub(crate) fn task_cmp(
    tasks: &Pool<Task, { config::NUM_TASKS }>,
    a: TaskIdx,
    b: TaskIdx,
) -> core::cmp::Ordering {
    let ta = &tasks[a.0];
    let tb = &tasks[b.0];
    (ta.priority.0, ta.last_quantum_time, ta.last_quantum_index).cmp(&(
        tb.priority.0,
        tb.last_quantum_time,
        tb.last_quantum_index,
    ))
}

impl Kernel {
    /// Creates a task and makes it ready (or parks it suspended). A stack
    /// size of zero selects the configured default.
    pub fn create_task(
        &mut self,
        entry: TaskFn,
        arg: usize,
        stack_size: usize,
        priority: Priority,
        start_suspended: bool,
    ) -> Result<Handle, Error> {
        if priority.0 > config::LOWEST_USED_PRIORITY {
            return self.fail(Error::InvalidParameter);
        }
        let stack = if stack_size == 0 {
            config::DEFAULT_TASK_STACK_SIZE
        } else {
            stack_size
        };
        let blocking = if start_suspended {
            BlockingFlags::SUSPENDED
        } else {
            BlockingFlags::empty()
        };
        let task = self.spawn_task(entry, arg, stack, priority, blocking)?;
        let handle = self.objects[self.tasks[task.0].obj.0]
            .handle
            .ok_or(Error::InvalidHandle)?;
        self.make_ready(task);
        Ok(handle)
    }

    /// Shared construction path for application tasks and the idle task.
    pub(crate) fn spawn_task(
        &mut self,
        entry: TaskFn,
        arg: usize,
        stack_size: usize,
        priority: Priority,
        blocking: BlockingFlags,
    ) -> Result<TaskIdx, Error> {
        let context = match arch::create_task_context(stack_size) {
            Ok(c) => c,
            Err(e) => return self.fail(e),
        };

        let epoch = self.stats.calc_time;
        // The task's own index feeds its embedded links, so reserve the
        // cell first with a placeholder-free two-step: insert, then patch.
        let Some(raw) = self.tasks.insert(Task::new(
            TaskIdx(0),
            context,
            entry,
            arg,
            priority,
            blocking,
            epoch,
        )) else {
            return self.fail(Error::NotEnoughMemory);
        };
        let idx = TaskIdx(raw);
        self.tasks[raw].ready_link = PqLink::new(idx);
        self.tasks[raw].wait_timeout = TimeNotify::new(TnRef::Task(idx));

        let obj = match self.register_object(ObjectKind::Task(idx), ObjectType::Task)
        {
            Ok(o) => o,
            Err(e) => {
                let mut task = self.tasks.remove(raw);
                if let Some(t) = task.as_mut() {
                    let _ = arch::release_task_context(&mut t.context);
                }
                return Err(e);
            }
        };
        self.tasks[raw].obj = obj;

        // A task object is not signaled until the task terminates.
        self.objects[obj.0].signal.signaled = 0;

        // Fresh quantum-tick stamp: created tasks queue behind their peers.
        self.tasks[raw].last_quantum_time = self.last_quantum_time;
        self.tasks[raw].last_quantum_index = self.last_quantum_index;
        self.last_quantum_index += 1;

        self.objects[obj.0].ready = true;
        Ok(idx)
    }

    /// Terminates the calling task. Does nothing when no task is current or
    /// an ISR section is open.
    pub fn exit_task(&mut self, exit_code: u16) {
        let Some(cur) = self.current else { return };
        if self.in_isr {
            return;
        }

        self.release_task_resources(cur);

        let _lock = arch::lock();
        self.tasks[cur.0].exit_code = exit_code;
        self.tasks[cur.0].blocking |= BlockingFlags::TERMINATED;

        // The task object becomes signaled, waking joiners.
        let obj = self.tasks[cur.0].obj;
        self.update_signal_state(obj, 1);

        // Once off the ready queue the task will never run again.
        self.make_not_ready(cur);
    }

    /// Terminates another task: cancels whatever it is blocked on, releases
    /// everything it owns (abandoning its critical sections), and marks it
    /// terminated.
    pub fn terminate_task(&mut self, handle: Handle) -> Result<(), Error> {
        if let Some(cur) = self.current {
            if !self.in_isr
                && self.objects[self.tasks[cur.0].obj.0].handle == Some(handle)
            {
                self.exit_task(Error::TaskTerminatedByOther.code());
                return Ok(());
            }
        }

        let obj = self.object_by_handle(handle, Some(ObjectType::Task))?;
        let task = self.task_of(obj);

        let _lock = arch::lock();

        // Freeze the victim before touching its resources.
        self.tasks[task.0].blocking |= BlockingFlags::TERMINATING;
        self.make_not_ready(task);

        if self.tasks[task.0].blocking.contains(BlockingFlags::WAITING) {
            self.make_not_waiting(task);
        }
        if self.tasks[task.0].blocking.contains(BlockingFlags::SLEEP) {
            self.unregister_time_notify(TnRef::Task(task));
        }

        self.release_task_resources(task);

        self.tasks[task.0].exit_code = Error::TaskTerminatedByOther.code();
        self.tasks[task.0].blocking |= BlockingFlags::TERMINATED;
        self.update_signal_state(obj, 1);
        Ok(())
    }

    pub fn suspend_task(&mut self, handle: Handle) -> Result<(), Error> {
        let obj = self.object_by_handle(handle, Some(ObjectType::Task))?;
        let task = self.task_of(obj);
        let _lock = arch::lock();
        self.tasks[task.0].blocking |= BlockingFlags::SUSPENDED;
        self.make_not_ready(task);
        Ok(())
    }

    pub fn resume_task(&mut self, handle: Handle) -> Result<(), Error> {
        let obj = self.object_by_handle(handle, Some(ObjectType::Task))?;
        let task = self.task_of(obj);
        let _lock = arch::lock();
        self.tasks[task.0].blocking -= BlockingFlags::SUSPENDED;
        self.make_ready(task);
        Ok(())
    }

    /// Reports a task's current *effective* priority -- the value the
    /// scheduler actually uses, inheritance included.
    pub fn task_priority(&mut self, handle: Handle) -> Result<Priority, Error> {
        let obj = self.object_by_handle(handle, Some(ObjectType::Task))?;
        let task = self.task_of(obj);
        Ok(self.tasks[task.0].priority)
    }

    /// Changes a task's assigned priority. If the change makes some other
    /// task the most important runnable one, the scheduler runs.
    pub fn set_task_priority(
        &mut self,
        handle: Handle,
        priority: Priority,
    ) -> Result<(), Error> {
        if priority.0 > config::LOWEST_USED_PRIORITY {
            return self.fail(Error::InvalidParameter);
        }
        let obj = self.object_by_handle(handle, Some(ObjectType::Task))?;
        let task = self.task_of(obj);

        let _lock = arch::lock();
        self.tasks[task.0].assigned_priority = priority;
        if self.change_task_priority(task, priority) {
            // The task's effective priority moved; its boosts may need to
            // ripple along the ownership graph.
            self.priority_path(PathRef::Task(task));
            self.reschedule_if_higher_priority();
        }
        Ok(())
    }

    pub fn task_quantum(&mut self, handle: Handle) -> Result<u8, Error> {
        let obj = self.object_by_handle(handle, Some(ObjectType::Task))?;
        let task = self.task_of(obj);
        Ok(self.tasks[task.0].max_quantum)
    }

    /// Sets the number of time quanta the task gets per scheduling round.
    /// Applies immediately, preserving however much of the current round has
    /// already been consumed.
    pub fn set_task_quantum(
        &mut self,
        handle: Handle,
        quantum: u8,
    ) -> Result<(), Error> {
        if quantum == 0 {
            return self.fail(Error::InvalidParameter);
        }
        let obj = self.object_by_handle(handle, Some(ObjectType::Task))?;
        let task = self.task_of(obj);

        let _lock = arch::lock();
        let t = &mut self.tasks[task.0];
        let used = t.max_quantum - t.quantum_counter;
        t.max_quantum = quantum;
        t.quantum_counter = quantum.saturating_sub(used);
        Ok(())
    }

    /// Handle of the calling task, when there is one.
    pub fn task_handle(&self) -> Option<Handle> {
        let cur = self.current?;
        if self.in_isr {
            return None;
        }
        self.objects[self.tasks[cur.0].obj.0].handle
    }

    /// Exit code of a terminated task.
    pub fn task_exit_code(&mut self, handle: Handle) -> Result<u16, Error> {
        let obj = self.object_by_handle(handle, Some(ObjectType::Task))?;
        let task = self.task_of(obj);
        if !self.tasks[task.0]
            .blocking
            .contains(BlockingFlags::TERMINATED)
        {
            return self.fail(Error::TaskNotTerminated);
        }
        Ok(self.tasks[task.0].exit_code)
    }

    /// CPU usage of one task over the last closed sampling window, as a
    /// (task, total) pair of sample counts.
    pub fn task_stat(&mut self, handle: Handle) -> Result<(u32, u32), Error> {
        let obj = self.object_by_handle(handle, Some(ObjectType::Task))?;
        let task = self.task_of(obj);
        let t = &self.tasks[task.0];
        let cpu = if t.stats.usage_time == self.stats.usage_time {
            t.stats.usage
        } else if t.stats.calc_time == self.stats.usage_time {
            t.stats.calc
        } else {
            0
        };
        Ok((cpu, self.stats.usage))
    }

    /// Resolves a task object to its arena index.
    pub(crate) fn task_of(&self, obj: ObjIdx) -> TaskIdx {
        match self.objects[obj.0].kind {
            ObjectKind::Task(t) => t,
            _ => panic!("object {} is not a task", obj.0),
        }
    }
}
