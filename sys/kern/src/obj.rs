// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel object descriptors: registration, handle resolution, ownership
//! and deferred deletion.
//!
//! Every kernel object -- a task, a mutex, an event -- is fronted by a
//! `KObject` carrying its handle, its signal, and an owner count. Opening an
//! object links it into the opener's child set; an object is deleted when
//! its last owner closes it (tasks only once they have also terminated).

use core::cmp::Ordering;

use abi::{BlockingFlags, Error, Handle, ObjectType, SignalFlags};
use kerncore::avl::{AvlLink, AvlStore};
use kerncore::pool::Pool;

use crate::arch;
use crate::config;
use crate::csec::CritSect;
use crate::kernel::Kernel;
use crate::signal::Signal;
use crate::task::TaskIdx;
use crate::timer::TimerState;

/// Index of an object in the object arena.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ObjIdx(pub u16);

/// Class-specific payload of an object.
pub enum ObjectKind {
    Task(TaskIdx),
    /// Mutex or semaphore: a signal fronting a critical section.
    CritSect(CritSect),
    /// Event: the bare signal is the whole object.
    Plain,
    /// Counting semaphore: a bare decrement-on-release signal with a cap.
    CountingSemaphore { max_signaled: u32 },
    Timer(TimerState),
}

/// Object descriptor.
pub struct KObject {
    pub otype: ObjectType,
    /// Public handle; the idle task has none.
    pub handle: Option<Handle>,
    /// Set once the object is fully constructed. Handles resolve only to
    /// ready objects.
    pub ready: bool,
    pub owner_count: u32,
    pub signal: Signal,
    /// Node positioning this object's signal in the deferred-signalization
    /// tree.
    pub deferred_link: AvlLink<ObjIdx>,
    pub kind: ObjectKind,
}

impl KObject {
    /// The critical section of a mutex/semaphore object.
    pub(crate) fn cs(&self) -> &CritSect {
        match &self.kind {
            ObjectKind::CritSect(cs) => cs,
            _ => panic!("object has no critical section"),
        }
    }

    pub(crate) fn cs_mut(&mut self) -> &mut CritSect {
        match &mut self.kind {
            ObjectKind::CritSect(cs) => cs,
            _ => panic!("object has no critical section"),
        }
    }

    /// Whether the signal fronts a critical section.
    pub(crate) fn has_cs(&self) -> bool {
        matches!(self.kind, ObjectKind::CritSect(_))
    }
}

/// Index of a child link cell.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChildRef(pub u16);

/// One entry in a task's set of opened objects, keyed by handle.
pub struct ChildLink {
    pub object: ObjIdx,
    pub handle: Handle,
    pub link: AvlLink<ChildRef>,
}

/// Store for the per-task child trees.
pub(crate) struct ChildStore<'a> {
    pub children: &'a mut Pool<ChildLink, { config::NUM_CHILD_LINKS }>,
}

impl AvlStore for ChildStore<'_> {
    type Node = ChildRef;

    fn link(&self, n: ChildRef) -> &AvlLink<ChildRef> {
        &self.children[n.0].link
    }

    fn link_mut(&mut self, n: ChildRef) -> &mut AvlLink<ChildRef> {
        &mut self.children[n.0].link
    }

    fn order(&self, a: ChildRef, b: ChildRef) -> Ordering {
        self.children[a.0]
            .handle
            .index()
            .cmp(&self.children[b.0].handle.index())
    }
}

impl Kernel {
    /// Registers a new object: arena slot, handle, and an open by the
    /// calling task (or a standing owner count of one when no task is
    /// current). The object is returned not yet ready; the caller finishes
    /// construction and sets `ready`.
    pub(crate) fn register_object(
        &mut self,
        kind: ObjectKind,
        otype: ObjectType,
    ) -> Result<ObjIdx, Error> {
        let object = KObject {
            otype,
            handle: None,
            ready: false,
            owner_count: 0,
            signal: Signal::new(),
            deferred_link: AvlLink::detached(),
            kind,
        };
        let Some(raw) = self.objects.insert(object) else {
            return self.fail(Error::NotEnoughMemory);
        };
        let obj = ObjIdx(raw);

        let Some(slot) = self.handles.alloc(otype as u8, obj) else {
            self.objects.remove(raw);
            return self.fail(Error::CannotAssignNewHandle);
        };
        let handle = Handle::from_index(slot).ok_or(Error::InvalidHandle)?;
        self.objects[raw].handle = Some(handle);

        if self.current.is_none() || self.in_isr {
            self.objects[raw].owner_count = 1;
        } else if let Err(e) = self.open_object(obj) {
            self.handles.release(slot);
            self.objects.remove(raw);
            return Err(e);
        }
        Ok(obj)
    }

    /// Makes `obj` a child of the calling task and bumps its owner count.
    /// Opening an object twice from the same task is idempotent.
    pub(crate) fn open_object(&mut self, obj: ObjIdx) -> Result<(), Error> {
        let Some(cur) = self.current else {
            return self.fail(Error::AllowedOnlyForTasks);
        };
        let handle = self.objects[obj.0].handle.ok_or(Error::InvalidHandle)?;

        let Some(cell) = self.children.insert(ChildLink {
            object: obj,
            handle,
            link: AvlLink::detached(),
        }) else {
            return self.fail(Error::NotEnoughMemory);
        };

        let _lock = arch::lock();
        let mut tree = self.tasks[cur.0].children;
        let inserted = tree.insert(
            &mut ChildStore {
                children: &mut self.children,
            },
            ChildRef(cell),
        );
        self.tasks[cur.0].children = tree;

        match inserted {
            Ok(()) => {
                self.objects[obj.0].owner_count += 1;
            }
            Err(_already) => {
                // Already opened; the fresh cell is not needed.
                self.children.remove(cell);
            }
        }
        Ok(())
    }

    /// Resolves a handle to a live, ready object of the expected type
    /// (`None` ignores the type).
    pub(crate) fn object_by_handle(
        &mut self,
        handle: Handle,
        otype: Option<ObjectType>,
    ) -> Result<ObjIdx, Error> {
        let found = self
            .handles
            .get(handle.index(), otype.map(|t| t as u8))
            .copied();
        let Some(obj) = found else {
            return self.fail(Error::InvalidHandle);
        };
        if !self.objects[obj.0].ready {
            return self.fail(Error::InvalidHandle);
        }
        Ok(obj)
    }

    /// Opens an object by handle on behalf of the calling task; any type.
    pub fn open_by_handle(&mut self, handle: Handle) -> Result<(), Error> {
        let obj = self.object_by_handle(handle, None)?;
        self.open_object(obj)
    }

    /// Closes the calling task's reference to the object behind `handle`.
    pub fn close_handle(&mut self, handle: Handle) -> Result<(), Error> {
        let Some(cur) = self.current else {
            return self.fail(Error::AllowedOnlyForTasks);
        };
        if self.in_isr {
            return self.fail(Error::AllowedOnlyForTasks);
        }
        let obj = self.object_by_handle(handle, None)?;
        self.close_object(obj, cur)
    }

    /// Drops `task`'s reference to `obj`: unlinks the child entry, releases
    /// any critical-section ownership (marking it abandoned), and deletes
    /// the object when the owner count reaches zero.
    pub(crate) fn close_object(
        &mut self,
        obj: ObjIdx,
        task: TaskIdx,
    ) -> Result<(), Error> {
        let handle = self.objects[obj.0].handle.ok_or(Error::InvalidHandle)?;

        let tree = self.tasks[task.0].children;
        let store = ChildStore {
            children: &mut self.children,
        };
        let found = tree.search_by(&store, |n| {
            handle.index().cmp(&store.children[n.0].handle.index())
        });
        let Some(node) = found else {
            return self.fail(Error::InvalidHandle);
        };

        let mut tree = tree;
        tree.remove(
            &mut ChildStore {
                children: &mut self.children,
            },
            node,
        );
        self.tasks[task.0].children = tree;
        self.children.remove(node.0);

        // If the task owns the object's critical section, the close
        // abandons it: the section is released in full and the next
        // acquirer sees the advisory.
        if self.objects[obj.0].has_cs() {
            if let Some(cell) = self.find_cs_assoc(obj, task) {
                let count = self.objects[obj.0].cs().owners[cell].count;
                self.objects[obj.0].signal.flags |= SignalFlags::ABANDONED;
                let _ = self.release_cs(obj, task, count);
            }
        }

        self.objects[obj.0].owner_count -= 1;
        if self.objects[obj.0].owner_count == 0 {
            let deletable = match self.objects[obj.0].kind {
                ObjectKind::Task(t) => self.tasks[t.0]
                    .blocking
                    .contains(BlockingFlags::TERMINATED),
                _ => true,
            };
            if deletable {
                self.delete_object(obj);
            }
        }
        Ok(())
    }

    /// Tears an object down: frees its context (tasks), its handle, and its
    /// arena slot.
    pub(crate) fn delete_object(&mut self, obj: ObjIdx) {
        self.objects[obj.0].ready = false;

        if let ObjectKind::Task(t) = self.objects[obj.0].kind {
            if let Some(task) = self.tasks.get_mut(t.0) {
                let _ = arch::release_task_context(&mut task.context);
            }
            self.tasks.remove(t.0);
        }
        let timer_registered = matches!(
            &self.objects[obj.0].kind,
            ObjectKind::Timer(ts) if ts.notify.registered
        );
        if timer_registered {
            self.unregister_time_notify(crate::timenotify::TnRef::Object(obj));
        }

        if let Some(handle) = self.objects[obj.0].handle {
            self.handles.release(handle.index());
        }
        self.objects.remove(obj.0);
    }

    /// Releases everything a terminating task holds: every owned critical
    /// section (abandoned), then every opened object.
    pub(crate) fn release_task_resources(&mut self, task: TaskIdx) {
        // Owned critical sections, most contended first.
        loop {
            let Some(assoc) = self.tasks[task.0].owned_cs.front() else {
                break;
            };
            let count = self.objects[assoc.obj.0].cs().owners[assoc.cell].count;
            self.objects[assoc.obj.0].signal.flags |= SignalFlags::ABANDONED;
            let _ = self.release_cs(assoc.obj, task, count);
        }

        // Children: closing may cascade into deletion.
        loop {
            let Some(node) = self.tasks[task.0].children.first() else {
                break;
            };
            let obj = self.children[node.0].object;
            let _ = self.close_object(obj, task);
        }
    }
}
