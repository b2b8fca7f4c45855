// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Object and task lifecycle: handles, ownership, deferred deletion, error
//! reporting, and the kernel heap service.

mod common;

use std::ptr::NonNull;

use abi::{Error, Priority, WaitStatus, INFINITE};
use common::{noop_task, Sim};

#[test]
fn task_creation_validates_arguments() {
    let mut sim = Sim::boot();

    let e = sim
        .k
        .create_task(noop_task, 0, 0, Priority(255), false)
        .unwrap_err();
    assert_eq!(e, Error::InvalidParameter);

    // Undersized stacks are refused by the context layer.
    let e = sim
        .k
        .create_task(noop_task, 0, 16, Priority(5), false)
        .unwrap_err();
    assert_eq!(e, Error::TooSmallStackSize);
    assert_eq!(sim.k.last_error(), Some(Error::TooSmallStackSize));
}

#[test]
fn suspended_creation_keeps_a_task_parked() {
    let mut sim = Sim::boot();
    let t = sim
        .k
        .create_task(noop_task, 0, 0, Priority(5), true)
        .unwrap();
    sim.start();
    sim.expect_idle();

    sim.k.resume_task(t).unwrap();
    sim.settle();
    sim.expect_current(t);
}

#[test]
fn exit_codes_are_readable_after_termination_only() {
    let mut sim = Sim::boot();
    let worker = sim
        .k
        .create_task(noop_task, 0, 0, Priority(5), false)
        .unwrap();
    let parent = sim
        .k
        .create_task(noop_task, 0, 0, Priority(7), false)
        .unwrap();
    sim.start();

    sim.expect_current(worker);
    assert_eq!(
        sim.k.task_exit_code(worker),
        Err(Error::TaskNotTerminated)
    );

    // The worker finishes with a code of its choosing.
    sim.k.exit_task(42);
    sim.settle();
    sim.expect_current(parent);
    assert_eq!(sim.k.task_exit_code(worker).unwrap(), 42);
}

#[test]
fn handles_are_type_checked() {
    let mut sim = Sim::boot();
    let t = sim
        .k
        .create_task(noop_task, 0, 0, Priority(5), false)
        .unwrap();
    sim.start();
    sim.expect_current(t);

    let m = sim.k.create_mutex(false).unwrap();
    assert_eq!(sim.k.set_event(m), Err(Error::InvalidHandle));
    assert_eq!(sim.k.resume_task(m), Err(Error::InvalidHandle));
    // The generic wait path takes any waitable.
    assert_eq!(sim.k.wait_for_object(m, INFINITE), WaitStatus::Acquired(0));
}

#[test]
fn closing_the_last_handle_deletes_the_object() {
    let mut sim = Sim::boot();
    let t = sim
        .k
        .create_task(noop_task, 0, 0, Priority(5), false)
        .unwrap();
    sim.start();
    sim.expect_current(t);

    let e = sim.k.create_event(true, true).unwrap();
    assert_eq!(sim.k.wait_for_object(e, INFINITE), WaitStatus::Acquired(0));

    sim.k.close_handle(e).unwrap();
    assert_eq!(sim.k.set_event(e), Err(Error::InvalidHandle));
    match sim.k.wait_for_object(e, INFINITE) {
        WaitStatus::Failed(err) => assert_eq!(err, Error::InvalidHandle),
        other => panic!("stale handle usable: {other:?}"),
    }
}

#[test]
fn opening_keeps_an_object_alive_past_its_creator() {
    let mut sim = Sim::boot();
    let creator = sim
        .k
        .create_task(noop_task, 0, 0, Priority(5), false)
        .unwrap();
    let survivor = sim
        .k
        .create_task(noop_task, 0, 0, Priority(7), false)
        .unwrap();
    sim.start();

    sim.expect_current(creator);
    let e = sim.k.create_event(false, true).unwrap();
    sim.k.sleep(10).unwrap();
    sim.settle();

    sim.expect_current(survivor);
    sim.k.open_by_handle(e).unwrap();
    sim.k.terminate_task(creator).unwrap();

    // The creator's close did not delete the event; ours will.
    sim.k.set_event(e).unwrap();
    sim.k.close_handle(e).unwrap();
    assert_eq!(sim.k.set_event(e), Err(Error::InvalidHandle));
}

#[test]
fn last_error_is_task_local() {
    let mut sim = Sim::boot();
    let t1 = sim
        .k
        .create_task(noop_task, 0, 0, Priority(5), false)
        .unwrap();
    let t2 = sim
        .k
        .create_task(noop_task, 0, 0, Priority(6), false)
        .unwrap();
    sim.start();

    sim.expect_current(t1);
    assert_eq!(sim.k.last_error(), None);
    let _ = sim.k.set_task_quantum(t1, 0);
    assert_eq!(sim.k.last_error(), Some(Error::InvalidParameter));

    // The other task's slot is untouched.
    sim.suspend_current();
    sim.expect_current(t2);
    assert_eq!(sim.k.last_error(), None);
}

#[test]
fn lifecycle_guards_hold() {
    let mut sim = Sim::boot();
    sim.start();

    // Start twice: refused.
    assert_eq!(sim.k.start(), Err(Error::OsAlreadyRunning));
    // Deinit while running: refused.
    assert_eq!(sim.k.deinit(), Err(Error::OsCannotBeRunning));

    // Stop returns control; the kernel can then be torn down.
    sim.k.stop();
    sim.settle();
    assert!(sim.k.current_task().is_none());
    sim.k.deinit().unwrap();

    // A fresh init/start cycle works after deinit.
    sim.k.init().unwrap();
    sim.k.start().unwrap();
    sim.settle();
    assert!(sim.k.current_task().is_some());
}

#[test]
fn stop_preserves_task_state_for_restart() {
    let mut sim = Sim::boot();
    let t = sim
        .k
        .create_task(noop_task, 0, 0, Priority(5), false)
        .unwrap();
    sim.start();
    sim.expect_current(t);

    sim.k.stop();
    sim.settle();
    assert_eq!(sim.k.current_task(), None);

    // Everything still there on restart.
    sim.k.start().unwrap();
    sim.settle();
    sim.expect_current(t);
}

#[test]
fn kernel_heap_serves_and_polices_blocks() {
    let mut sim = Sim::boot();
    let t = sim
        .k
        .create_task(noop_task, 0, 0, Priority(5), false)
        .unwrap();
    sim.start();
    sim.expect_current(t);

    // Give the kernel a heap region (leaked so it outlives the kernel).
    #[repr(C, align(16))]
    struct Region([u8; 4096]);
    let region: &'static mut Region = Box::leak(Box::new(Region([0; 4096])));
    let base = NonNull::new(region.0.as_mut_ptr()).unwrap();
    unsafe { sim.k.mem_init(base, 4096).unwrap() };

    let info = sim.k.mem_info();
    assert_eq!(info.total, 4096);
    let initial_free = info.free;

    let a = sim.k.mem_alloc(100).unwrap();
    let b = sim.k.mem_alloc(200).unwrap();
    assert!(sim.k.mem_info().free < initial_free);

    sim.k.mem_free(a).unwrap();
    sim.k.mem_free(b).unwrap();
    assert_eq!(sim.k.mem_info().free, initial_free);

    // Failures surface through the error taxonomy and last-error.
    assert_eq!(sim.k.mem_alloc(0), Err(Error::InvalidParameter));
    assert_eq!(sim.k.mem_alloc(1 << 20), Err(Error::NotEnoughMemory));
    assert_eq!(sim.k.mem_free(a), Err(Error::InvalidMemoryBlock));
    assert_eq!(sim.k.last_error(), Some(Error::InvalidMemoryBlock));
}
