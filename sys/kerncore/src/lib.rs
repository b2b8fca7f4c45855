// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pure data structures backing the Vela kernel.
//!
//! Everything in this crate is independent of the kernel's global state and of
//! any particular target, so it can be developed and tested on the host. The
//! kernel proper lives in the `kern` crate and instantiates these structures
//! over its arenas.
//!
//! The ordered collections (`avl`, `pqueue`) are *intrusive by index*: the
//! link cells live inside the objects being collected, and the collection
//! operates on small copyable node handles through a store trait, never on
//! pointers. The allocators (`heap`, `pool`) own their storage outright.

// Allow std-y things to be used in test. Note that this attribute is a bit of
// a trap for the programmer, because rust-analyzer by default seems to build
// things with test set. This means it's easy to introduce code incompatible
// with no_std without your editor hassling you about it. Beware.
#![cfg_attr(not(test), no_std)]

pub mod avl;
pub mod handles;
pub mod heap;
pub mod pool;
pub mod pqueue;
