// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Kernel-internal routines return `Result<_, abi::Error>` and propagate
//! with `?`; the public entry points additionally record each failure as
//! the last error (task-local or global, see `Kernel::set_last_error`)
//! before surfacing it, which is the error channel application code polls.

use abi::Error;
use kerncore::heap::HeapError;

/// Maps allocator failures onto the public error taxonomy.
pub(crate) fn heap_error(e: HeapError) -> Error {
    match e {
        HeapError::InvalidParameter => Error::InvalidParameter,
        HeapError::NotEnoughMemory => Error::NotEnoughMemory,
        HeapError::InvalidBlock => Error::InvalidMemoryBlock,
    }
}
