// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The simulated VM record and the rule governing its lifecycle.
//!
//! A [`Vm`] is a plain value: changing its state produces a new value through
//! [`Vm::with_state`], which only permits moves along the fixed lifecycle
//!
//! ```text
//! Stopped -> Starting -> Running -> Stopping -> Stopped
//! ```
//!
//! Requests to "move" a VM into the state it already occupies succeed without
//! changing anything. Nothing in this module knows about storage or locking;
//! see [`crate::registry`] for that.

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a VM within a fleet.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
)]
#[serde(transparent)]
pub struct VmId(pub u32);

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for VmId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// The lifecycle state of a simulated VM.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
    strum::Display,
    strum::EnumIter,
)]
pub enum VmState {
    /// The VM is powered off. This is the only state from which it may be
    /// launched.
    #[default]
    Stopped,

    /// The VM has been asked to launch and is waiting for its simulated boot
    /// to complete.
    Starting,

    /// The VM is online.
    Running,

    /// The VM has been asked to stop and is waiting for its simulated
    /// shutdown to complete.
    Stopping,
}

impl VmState {
    /// Returns the only state a VM in this state may move to.
    pub const fn successor(self) -> VmState {
        match self {
            VmState::Stopped => VmState::Starting,
            VmState::Starting => VmState::Running,
            VmState::Running => VmState::Stopping,
            VmState::Stopping => VmState::Stopped,
        }
    }
}

/// A request to move a VM between two states that the lifecycle forbids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("illegal transition from {from} to {to}")]
pub struct TransitionError {
    pub from: VmState,
    pub to: VmState,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

fn is_zero_clock(value: &f32) -> bool {
    *value == 0.0
}

/// A simulated virtual machine: its (fake) hardware and its lifecycle state.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema,
)]
pub struct Vm {
    /// Number of processors.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub vcpus: u32,

    /// Frequency of one processor, in MHz.
    #[serde(default, skip_serializing_if = "is_zero_clock")]
    pub clock: f32,

    /// Amount of memory, in MB.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ram: u32,

    /// Amount of persistent storage, in GB.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub storage: u32,

    /// Network device speed, in Gb/s.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub network: u32,

    #[serde(default)]
    pub state: VmState,
}

impl Vm {
    /// Returns a copy of this VM in state `target`, or an error if the
    /// lifecycle does not allow moving there from the current state.
    ///
    /// Asking for the current state is a successful no-op.
    pub fn with_state(self, target: VmState) -> Result<Vm, TransitionError> {
        if target == self.state {
            return Ok(self);
        }
        if self.state.successor() != target {
            return Err(TransitionError { from: self.state, to: target });
        }
        Ok(Vm { state: target, ..self })
    }
}

/// The fleet generated when no persisted fleet is available.
pub fn default_fleet() -> BTreeMap<VmId, Vm> {
    #[rustfmt::skip]
    let vms = [
        Vm { vcpus: 1, clock: 1500.0, ram: 4096, storage: 128, network: 1000, state: VmState::Stopped },
        Vm { vcpus: 4, clock: 3600.0, ram: 32768, storage: 512, network: 10000, state: VmState::Stopped },
        Vm { vcpus: 2, clock: 2200.0, ram: 8192, storage: 256, network: 1000, state: VmState::Stopped },
    ];

    (0..).map(VmId).zip(vms).collect()
}
