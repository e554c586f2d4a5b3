// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Core of a simulated VM fleet.
//!
//! This crate owns the authoritative record of every simulated VM and the
//! rules for moving VMs through their lifecycle. It performs no I/O of its
//! own: callers hand it a fleet at construction and drive it through the
//! [`Registry`] operations.

mod driver;
pub mod registry;
pub mod vm;

pub use registry::{
    CompletionError, DelayError, PendingTransition, Registry, RegistryError,
    TransitionDelays, MAX_TRANSITION_DELAY,
};
pub use vm::{default_fleet, TransitionError, Vm, VmId, VmState};
