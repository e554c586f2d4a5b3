// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The task that completes deferred (second-phase) VM transitions.
//!
//! Registry operations that start a transition send the driver a
//! [`ScheduledTransition`] naming the VM, the state it should settle in, and
//! how long to wait. The driver parks these in a timer wheel and, as each one
//! expires, applies it to the VM table through the same mutation path the
//! registry uses. The VM is re-read at that point, so a completion whose VM
//! was deleted or moved elsewhere in the meantime is rejected rather than
//! applied.
//!
//! The driver exits once every sender for its command channel is dropped.
//! Completions still waiting at that point are discarded, which their
//! [`crate::PendingTransition`] handles observe as cancellation.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use slog::{debug, info, warn, Logger};
use tokio::sync::{mpsc, oneshot};
use tokio_util::time::DelayQueue;

use crate::registry::{RegistryError, VmTable};
use crate::vm::{Vm, VmId, VmState};

pub(crate) type CompletionTx = oneshot::Sender<Result<Vm, RegistryError>>;

/// A request to settle VM `id` in state `target` once `delay` has elapsed.
#[derive(Debug)]
pub(crate) struct ScheduledTransition {
    pub id: VmId,
    pub target: VmState,
    pub delay: Duration,
    pub done: CompletionTx,
}

pub(crate) async fn run(
    table: Arc<VmTable>,
    mut commands: mpsc::UnboundedReceiver<ScheduledTransition>,
    log: Logger,
) {
    let mut pending = DelayQueue::new();

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    info!(log, "transition driver exiting";
                          "discarded" => pending.len());
                    return;
                };

                debug!(log, "scheduling deferred transition";
                       "vm" => %command.id,
                       "target" => %command.target,
                       "delay" => ?command.delay);
                let delay = command.delay;
                pending.insert(command, delay);
            }

            Some(expired) = pending.next(), if !pending.is_empty() => {
                let ScheduledTransition { id, target, done, .. } =
                    expired.into_inner();

                let result = table.settle(id, target);
                match &result {
                    Ok(_) => {
                        info!(log, "completed deferred transition";
                              "vm" => %id,
                              "state" => %target);
                    }
                    Err(e) => {
                        warn!(log, "dropping deferred transition";
                              "vm" => %id,
                              "target" => %target,
                              "error" => %e);
                    }
                }

                // Nobody may be waiting for this outcome.
                let _ = done.send(result);
            }
        }
    }
}
