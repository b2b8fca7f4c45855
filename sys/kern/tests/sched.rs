// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduling behaviour: priority respect, round-robin fairness, quantum
//! handling, and priority-change positioning.

mod common;

use abi::{Priority, WaitStatus, INFINITE, NO_WAIT};
use common::{noop_task, Sim};

#[test]
fn boot_runs_idle_when_nothing_else_is_ready() {
    let mut sim = Sim::boot();
    sim.start();
    sim.expect_idle();
    sim.ticks(5);
    sim.expect_idle();
}

#[test]
fn highest_priority_ready_task_runs() {
    let mut sim = Sim::boot();
    let lo = sim
        .k
        .create_task(noop_task, 0, 0, Priority(9), false)
        .unwrap();
    let hi = sim
        .k
        .create_task(noop_task, 0, 0, Priority(2), false)
        .unwrap();
    sim.start();
    sim.expect_current(hi);

    // The more important task keeps the CPU across ticks.
    sim.ticks(10);
    sim.expect_current(hi);

    // Once it parks, the less important one runs.
    sim.suspend_current();
    sim.expect_current(lo);
}

// Seed scenario: task A computes at priority 5 while task B, more
// important, sits on an event. Setting the event preempts A within a couple
// of ticks; when B waits again, A resumes.
#[test]
fn event_preempts_lower_priority_compute_task() {
    let mut sim = Sim::boot();
    let a = sim
        .k
        .create_task(noop_task, 0, 0, Priority(5), false)
        .unwrap();
    let b = sim
        .k
        .create_task(noop_task, 0, 0, Priority(3), false)
        .unwrap();
    sim.start();

    // B runs first and blocks on its event.
    sim.expect_current(b);
    let event = sim.k.create_event(false, false).unwrap();
    assert_eq!(sim.k.wait_for_object(event, INFINITE), WaitStatus::Parked);
    sim.settle();

    // A computes undisturbed.
    for _ in 0..100 {
        sim.tick();
        sim.expect_current(a);
    }

    // Setting the event hands the CPU to B promptly.
    sim.k.set_event(event).unwrap();
    let latency = sim.ticks_until_running(b, 2);
    assert!(latency <= 2);
    assert_eq!(sim.k.take_wait_result(), WaitStatus::Acquired(0));

    // B parks again; A picks up where it left off.
    assert_eq!(sim.k.wait_for_object(event, INFINITE), WaitStatus::Parked);
    sim.settle();
    sim.expect_current(a);
}

#[test]
fn round_robin_shares_a_priority_level() {
    let mut sim = Sim::boot();
    let mut peers = Vec::new();
    for _ in 0..3 {
        peers.push(
            sim.k
                .create_task(noop_task, 0, 0, Priority(4), false)
                .unwrap(),
        );
    }
    sim.start();

    // Record who runs over a window; with quantum 1, every peer must get
    // the CPU within |S| ticks of any point (fairness bound |S| * Q).
    let mut history = Vec::new();
    for _ in 0..12 {
        history.push(sim.current().unwrap());
        sim.tick();
    }
    for window in history.windows(3) {
        for p in &peers {
            assert!(
                window.contains(p),
                "task starved within a round-robin window: {history:?}"
            );
        }
    }
}

#[test]
fn quantum_gives_consecutive_ticks() {
    let mut sim = Sim::boot();
    let a = sim
        .k
        .create_task(noop_task, 0, 0, Priority(4), false)
        .unwrap();
    let b = sim
        .k
        .create_task(noop_task, 0, 0, Priority(4), false)
        .unwrap();
    sim.k.set_task_quantum(a, 3).unwrap();
    sim.start();

    // Runs of `a` must come in bursts of three ticks; `b` singly.
    let mut history = Vec::new();
    for _ in 0..16 {
        history.push(sim.current().unwrap());
        sim.tick();
    }
    let mut i = 0;
    while i < history.len() {
        let who = history[i];
        let mut run = 0;
        while i < history.len() && history[i] == who {
            run += 1;
            i += 1;
        }
        if i < history.len() {
            // Completed run: check burst length.
            let expect = if who == a { 3 } else { 1 };
            assert_eq!(run, expect, "history: {history:?}");
        }
    }
}

#[test]
fn woken_task_beats_equal_priority_peers() {
    let mut sim = Sim::boot();
    let _a = sim
        .k
        .create_task(noop_task, 0, 0, Priority(6), false)
        .unwrap();
    let _b = sim
        .k
        .create_task(noop_task, 0, 0, Priority(6), false)
        .unwrap();
    let c = sim
        .k
        .create_task(noop_task, 0, 0, Priority(6), false)
        .unwrap();
    sim.start();

    // Run until C is current, then put it to sleep; A and B share the CPU
    // meanwhile.
    sim.ticks_until_running(c, 5);
    sim.k.sleep(7).unwrap();
    sim.settle();
    assert_ne!(sim.current(), Some(c));

    // At wake-up, C runs ahead of the already-ready peers.
    let woke_after = sim.ticks_until_running(c, 10);
    assert!(woke_after <= 8, "woken too late: {woke_after}");
}

#[test]
fn priority_change_repositions_among_peers() {
    let mut sim = Sim::boot();
    let x = sim
        .k
        .create_task(noop_task, 0, 0, Priority(5), false)
        .unwrap();
    let _y = sim
        .k
        .create_task(noop_task, 0, 0, Priority(5), false)
        .unwrap();
    let z = sim
        .k
        .create_task(noop_task, 0, 0, Priority(7), false)
        .unwrap();
    sim.start();
    sim.expect_current(x);

    // Promoting Z into the running priority group puts it at the front:
    // it runs before the peer that was already queued.
    sim.k.set_task_priority(z, Priority(5)).unwrap();
    sim.tick();
    sim.expect_current(z);

    // Demoting Z back pushes it behind the group again.
    sim.k.set_task_priority(z, Priority(7)).unwrap();
    sim.settle();
    for _ in 0..6 {
        assert_ne!(sim.current(), Some(z));
        sim.tick();
    }
}

#[test]
fn zero_timeout_wait_does_not_block() {
    let mut sim = Sim::boot();
    let t = sim
        .k
        .create_task(noop_task, 0, 0, Priority(5), false)
        .unwrap();
    sim.start();
    sim.expect_current(t);

    let event = sim.k.create_event(false, false).unwrap();
    match sim.k.wait_for_object(event, NO_WAIT) {
        WaitStatus::Failed(e) => assert_eq!(e, abi::Error::WaitTimeout),
        other => panic!("expected immediate timeout, got {other:?}"),
    }
    // Still running; nothing was parked.
    sim.expect_current(t);
}

#[test]
fn cpu_statistics_attribute_samples() {
    let mut sim = Sim::boot();
    let t = sim
        .k
        .create_task(noop_task, 0, 0, Priority(5), false)
        .unwrap();
    sim.start();
    sim.expect_current(t);

    // Busy task the whole window: usage equals the total.
    sim.ticks(250);
    let (cpu, total) = sim.k.system_stat();
    assert!(total > 0);
    assert_eq!(cpu, total);
    let (task_cpu, task_total) = sim.k.task_stat(t).unwrap();
    assert_eq!(task_cpu, task_total);

    // Park it; the next windows belong to idle.
    sim.suspend_current();
    sim.ticks(250);
    let (cpu, total) = sim.k.system_stat();
    assert!(total > 0);
    assert_eq!(cpu, 0, "idle time misattributed as load");
}
