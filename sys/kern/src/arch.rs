// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture / HAL bindings.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all port-specific types and functions show up right here in the
//! `arch` module, magically tailored for the current target.
//!
//! For this to work, each port module must define the same set of names:
//! `TaskContext`, `create_task_context`, `release_task_context`, `lock`,
//! `tick_count`, `save_power`, and `klog_impl`.
//!
//! The heavy lifting -- interrupt entry, the CPU context save/restore pair,
//! installing the scheduler as the tick handler -- belongs to the HAL that
//! embeds this kernel, not to this crate. A bare-metal integration provides
//! its own port module alongside its HAL; the port shipped here is the
//! hosted one used for development and the test suite.

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        compile_error!("bare-metal builds must supply a HAL port; \
                        see the arch module docs");
    } else {
        pub mod hosted;
        pub use hosted::*;
    }
}
