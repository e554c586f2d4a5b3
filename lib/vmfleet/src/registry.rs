// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The concurrency-safe registry of simulated VMs.
//!
//! The registry keeps every VM in a single table guarded by a reader/writer
//! lock. Reads (`list`, `inspect`) share the lock; every write (`launch`,
//! `stop`, `delete`, and each deferred completion) holds it exclusively, so
//! writes to a given VM are totally ordered by lock acquisition.
//!
//! Launching and stopping are two-phase. The first phase moves the VM into its
//! ongoing state (`Starting` or `Stopping`) before the call returns. The
//! second phase, which settles the VM in `Running` or `Stopped`, is scheduled
//! on the registry's transition driver (see [`crate::driver`]) and happens
//! after the configured delay.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use slog::{error, info, o, warn, Logger};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::driver::{self, ScheduledTransition};
use crate::vm::{TransitionError, Vm, VmId, VmState};

/// Default simulated time for a VM to boot.
pub const DEFAULT_START_DELAY: Duration = Duration::from_secs(10);

/// Default simulated time for a VM to shut down.
pub const DEFAULT_STOP_DELAY: Duration = Duration::from_secs(5);

/// Longest delay the transition driver accepts for a second phase.
pub const MAX_TRANSITION_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// How long the second phase of each two-phase transition takes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionDelays {
    /// Time between a VM entering `Starting` and it entering `Running`.
    pub start: Duration,

    /// Time between a VM entering `Stopping` and it entering `Stopped`.
    pub stop: Duration,
}

impl Default for TransitionDelays {
    fn default() -> Self {
        Self { start: DEFAULT_START_DELAY, stop: DEFAULT_STOP_DELAY }
    }
}

impl TransitionDelays {
    /// Checks that both delays are at most [`MAX_TRANSITION_DELAY`].
    pub fn validate(&self) -> Result<(), DelayError> {
        for (phase, delay) in [("start", self.start), ("stop", self.stop)] {
            if delay > MAX_TRANSITION_DELAY {
                return Err(DelayError { phase, delay });
            }
        }
        Ok(())
    }

    fn clamped(self) -> Self {
        Self {
            start: self.start.min(MAX_TRANSITION_DELAY),
            stop: self.stop.min(MAX_TRANSITION_DELAY),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error(
    "{phase} delay of {delay:?} exceeds the maximum of {max:?}",
    max = MAX_TRANSITION_DELAY
)]
pub struct DelayError {
    pub phase: &'static str,
    pub delay: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("VM with id {0} not found")]
    NotFound(VmId),

    #[error(transparent)]
    IllegalTransition(#[from] TransitionError),

    #[error("transition driver is not running")]
    DriverUnavailable,
}

/// Reasons the second phase of a transition did not happen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum CompletionError {
    #[error("transition of VM {id} to {target} was rejected: {source}")]
    Rejected { id: VmId, target: VmState, source: RegistryError },

    #[error("transition of VM {id} to {target} was cancelled")]
    Cancelled { id: VmId, target: VmState },
}

/// The VM table shared between the registry and its transition driver.
pub(crate) struct VmTable {
    vms: RwLock<BTreeMap<VmId, Vm>>,
}

impl VmTable {
    fn new(vms: BTreeMap<VmId, Vm>) -> Self {
        Self { vms: RwLock::new(vms) }
    }

    fn snapshot(&self) -> BTreeMap<VmId, Vm> {
        self.vms.read().unwrap().clone()
    }

    fn get(&self, id: VmId) -> Option<Vm> {
        self.vms.read().unwrap().get(&id).copied()
    }

    fn remove(&self, id: VmId) -> Option<Vm> {
        self.vms.write().unwrap().remove(&id)
    }

    /// Applies `rule` to the current value of VM `id` and stores the result.
    ///
    /// Every change of a VM's state goes through here, and `rule` runs with
    /// the table locked. If the VM is absent or `rule` refuses the change, the
    /// table is left untouched.
    fn apply<F>(&self, id: VmId, rule: F) -> Result<Vm, RegistryError>
    where
        F: FnOnce(Vm) -> Result<Vm, RegistryError>,
    {
        let mut vms = self.vms.write().unwrap();
        let slot = vms.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        let updated = rule(*slot)?;
        *slot = updated;
        Ok(updated)
    }

    /// First phase: moves VM `id` into `ongoing`, which must be a real move
    /// out of the VM's current state.
    ///
    /// `schedule` is called once the move is known to be legal; the move is
    /// only stored if it succeeds.
    fn begin<F>(
        &self,
        id: VmId,
        ongoing: VmState,
        schedule: F,
    ) -> Result<Vm, RegistryError>
    where
        F: FnOnce() -> Result<(), RegistryError>,
    {
        self.apply(id, |vm| {
            if vm.state == ongoing {
                let err = TransitionError { from: vm.state, to: ongoing };
                return Err(err.into());
            }
            let updated = vm.with_state(ongoing)?;
            schedule()?;
            Ok(updated)
        })
    }

    /// Second phase: settles VM `id` in `target` if the VM, as it is now,
    /// may move there.
    pub(crate) fn settle(
        &self,
        id: VmId,
        target: VmState,
    ) -> Result<Vm, RegistryError> {
        self.apply(id, |vm| Ok(vm.with_state(target)?))
    }
}

/// A handle on the second phase of a launch or stop.
///
/// Dropping the handle does not affect the transition.
#[derive(Debug)]
pub struct PendingTransition {
    id: VmId,
    target: VmState,
    outcome: oneshot::Receiver<Result<Vm, RegistryError>>,
}

impl PendingTransition {
    pub fn id(&self) -> VmId {
        self.id
    }

    /// The state the VM is expected to settle in.
    pub fn target(&self) -> VmState {
        self.target
    }

    /// Waits for the deferred transition to fire and returns the VM as it was
    /// stored.
    pub async fn wait(self) -> Result<Vm, CompletionError> {
        let Self { id, target, outcome } = self;
        match outcome.await {
            Ok(Ok(vm)) => Ok(vm),
            Ok(Err(source)) => {
                Err(CompletionError::Rejected { id, target, source })
            }
            Err(_) => Err(CompletionError::Cancelled { id, target }),
        }
    }
}

/// The authoritative, concurrency-safe collection of simulated VMs.
pub struct Registry {
    table: Arc<VmTable>,
    scheduler: mpsc::UnboundedSender<ScheduledTransition>,
    driver: JoinHandle<()>,
    delays: TransitionDelays,
    log: Logger,
}

impl Registry {
    /// Creates a registry holding `vms` and starts its transition driver.
    ///
    /// Delays longer than [`MAX_TRANSITION_DELAY`] are cut down to it.
    ///
    /// # Panics
    ///
    /// Panics if called outside the context of a tokio runtime.
    pub fn new(
        vms: BTreeMap<VmId, Vm>,
        delays: TransitionDelays,
        log: Logger,
    ) -> Self {
        if let Err(e) = delays.validate() {
            warn!(log, "clamping transition delay"; "error" => %e);
        }
        let delays = delays.clamped();
        info!(log, "creating VM registry";
              "vms" => vms.len(),
              "start_delay" => ?delays.start,
              "stop_delay" => ?delays.stop);

        let table = Arc::new(VmTable::new(vms));
        let (scheduler, commands) = mpsc::unbounded_channel();
        let driver = tokio::spawn(driver::run(
            table.clone(),
            commands,
            log.new(o!("component" => "transition-driver")),
        ));

        Self { table, scheduler, driver, delays, log }
    }

    pub fn delays(&self) -> TransitionDelays {
        self.delays
    }

    /// Returns a copy of every VM, ordered by ID. Later changes to the
    /// registry are not reflected in the copy.
    pub fn list(&self) -> BTreeMap<VmId, Vm> {
        self.table.snapshot()
    }

    /// Returns VM `id`, or `None` if there is no such VM.
    pub fn inspect(&self, id: VmId) -> Option<Vm> {
        self.table.get(id)
    }

    /// Moves a stopped VM to `Starting` and schedules it to reach `Running`
    /// after the start delay.
    pub fn launch(
        &self,
        id: VmId,
    ) -> Result<PendingTransition, RegistryError> {
        let delay = self.delays.start;
        self.two_phase(id, VmState::Starting, VmState::Running, delay)
    }

    /// Moves a running VM to `Stopping` and schedules it to reach `Stopped`
    /// after the stop delay.
    pub fn stop(
        &self,
        id: VmId,
    ) -> Result<PendingTransition, RegistryError> {
        let delay = self.delays.stop;
        self.two_phase(id, VmState::Stopping, VmState::Stopped, delay)
    }

    /// Removes VM `id`. Returns whether there was anything to remove.
    ///
    /// Deferred transitions already scheduled for the VM are not cancelled;
    /// they are rejected when they fire.
    pub fn delete(&self, id: VmId) -> bool {
        let removed = self.table.remove(id);
        if let Some(vm) = removed {
            info!(self.log, "deleted VM"; "vm" => %id, "state" => %vm.state);
        }
        removed.is_some()
    }

    /// Stops the transition driver and waits for it to exit. Deferred
    /// transitions that have not fired yet are cancelled.
    pub async fn shutdown(self) {
        let Self { scheduler, driver, log, .. } = self;
        drop(scheduler);
        if let Err(e) = driver.await {
            error!(log, "transition driver failed"; "error" => %e);
        }
    }

    fn two_phase(
        &self,
        id: VmId,
        ongoing: VmState,
        target: VmState,
        delay: Duration,
    ) -> Result<PendingTransition, RegistryError> {
        let (done, outcome) = oneshot::channel();
        let command = ScheduledTransition { id, target, delay, done };
        let schedule = || {
            self.scheduler
                .send(command)
                .map_err(|_| RegistryError::DriverUnavailable)
        };

        let vm = self.table.begin(id, ongoing, schedule).map_err(|e| {
            if e == RegistryError::DriverUnavailable {
                error!(self.log, "cannot schedule VM transition";
                       "vm" => %id,
                       "target" => %target);
            }
            e
        })?;
        info!(self.log, "VM transition started";
              "vm" => %id,
              "state" => %vm.state,
              "target" => %target);

        Ok(PendingTransition { id, target, outcome })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::vm::default_fleet;

    const GOOD_ID: VmId = VmId(1);
    const BAD_ID: VmId = VmId(10000);

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn short_delays() -> TransitionDelays {
        TransitionDelays {
            start: Duration::from_millis(10),
            stop: Duration::from_millis(5),
        }
    }

    fn registry_with(state: VmState) -> Registry {
        let mut vms = default_fleet();
        vms.get_mut(&GOOD_ID).unwrap().state = state;
        Registry::new(vms, short_delays(), test_logger())
    }

    #[tokio::test]
    async fn list_returns_the_fleet() {
        let registry = registry_with(VmState::Stopped);
        assert_eq!(registry.list(), default_fleet());
    }

    #[tokio::test]
    async fn list_is_a_snapshot() {
        let registry = registry_with(VmState::Stopped);
        let before = registry.list();

        registry.launch(GOOD_ID).unwrap();
        assert!(registry.delete(VmId(0)));

        assert_eq!(before, default_fleet());
        assert_ne!(registry.list(), before);
    }

    #[tokio::test]
    async fn inspect_finds_vms_by_id() {
        let registry = registry_with(VmState::Stopped);
        assert_eq!(registry.inspect(GOOD_ID), Some(default_fleet()[&GOOD_ID]));
        assert_eq!(registry.inspect(BAD_ID), None);
    }

    #[tokio::test]
    async fn sparse_ids_are_absent() {
        let mut vms = default_fleet();
        vms.remove(&VmId(1));
        let registry = Registry::new(vms, short_delays(), test_logger());

        assert_eq!(registry.inspect(VmId(1)), None);
        assert!(registry.inspect(VmId(2)).is_some());
        assert_eq!(
            registry.launch(VmId(1)).unwrap_err(),
            RegistryError::NotFound(VmId(1))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn launch_starts_then_runs() {
        let registry = registry_with(VmState::Stopped);
        let delays = registry.delays();

        let pending = registry.launch(GOOD_ID).unwrap();
        assert_eq!(pending.target(), VmState::Running);
        assert_eq!(registry.inspect(GOOD_ID).unwrap().state, VmState::Starting);

        tokio::time::sleep(delays.start - Duration::from_millis(1)).await;
        assert_eq!(registry.inspect(GOOD_ID).unwrap().state, VmState::Starting);

        let vm = pending.wait().await.unwrap();
        assert_eq!(vm.state, VmState::Running);
        assert_eq!(registry.inspect(GOOD_ID), Some(vm));
    }

    #[tokio::test]
    async fn launch_unknown_vm_is_not_found() {
        let registry = registry_with(VmState::Stopped);
        let err = registry.launch(BAD_ID).unwrap_err();
        assert_eq!(err, RegistryError::NotFound(BAD_ID));
        assert_eq!(err.to_string(), "VM with id 10000 not found");
    }

    #[tokio::test]
    async fn launch_requires_a_stopped_vm() {
        for state in [VmState::Starting, VmState::Running, VmState::Stopping] {
            let registry = registry_with(state);
            let err = registry.launch(GOOD_ID).unwrap_err();
            assert_eq!(
                err,
                RegistryError::IllegalTransition(TransitionError {
                    from: state,
                    to: VmState::Starting,
                })
            );
            assert_eq!(registry.inspect(GOOD_ID).unwrap().state, state);
        }
    }

    #[tokio::test]
    async fn launch_running_vm_names_both_states() {
        let registry = registry_with(VmState::Running);
        let err = registry.launch(GOOD_ID).unwrap_err();
        assert_eq!(
            err.to_string(),
            "illegal transition from Running to Starting"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_stops_then_halts() {
        let registry = registry_with(VmState::Running);

        let pending = registry.stop(GOOD_ID).unwrap();
        assert_eq!(registry.inspect(GOOD_ID).unwrap().state, VmState::Stopping);

        let vm = pending.wait().await.unwrap();
        assert_eq!(vm.state, VmState::Stopped);
        assert_eq!(registry.inspect(GOOD_ID).unwrap().state, VmState::Stopped);
    }

    #[tokio::test]
    async fn stop_unknown_vm_is_not_found() {
        let registry = registry_with(VmState::Running);
        assert_eq!(
            registry.stop(BAD_ID).unwrap_err(),
            RegistryError::NotFound(BAD_ID)
        );
    }

    #[tokio::test]
    async fn stop_requires_a_running_vm() {
        for state in [VmState::Stopped, VmState::Starting, VmState::Stopping] {
            let registry = registry_with(state);
            assert_eq!(
                registry.stop(GOOD_ID).unwrap_err(),
                RegistryError::IllegalTransition(TransitionError {
                    from: state,
                    to: VmState::Stopping,
                })
            );
            assert_eq!(registry.inspect(GOOD_ID).unwrap().state, state);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_cycle() {
        let registry = registry_with(VmState::Stopped);

        registry.launch(GOOD_ID).unwrap().wait().await.unwrap();
        registry.stop(GOOD_ID).unwrap().wait().await.unwrap();
        let vm = registry.launch(GOOD_ID).unwrap().wait().await.unwrap();

        assert_eq!(vm, Vm { state: VmState::Running, ..default_fleet()[&GOOD_ID] });
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_delays_are_clamped() {
        let delays = TransitionDelays {
            start: Duration::from_millis(u64::MAX),
            stop: Duration::from_millis(5),
        };
        let err = delays.validate().unwrap_err();
        assert_eq!(err.phase, "start");
        assert!(err.to_string().starts_with("start delay of "));

        let mut vms = default_fleet();
        vms.get_mut(&VmId(2)).unwrap().state = VmState::Running;
        let registry = Registry::new(vms, delays, test_logger());
        assert_eq!(registry.delays().start, MAX_TRANSITION_DELAY);

        // The driver survives the long launch and keeps serving others.
        let launching = registry.launch(VmId(0)).unwrap();
        assert_eq!(launching.id(), VmId(0));
        let vm = registry.stop(VmId(2)).unwrap().wait().await.unwrap();
        assert_eq!(vm.state, VmState::Stopped);
        assert_eq!(registry.inspect(VmId(0)).unwrap().state, VmState::Starting);
    }

    #[test]
    fn delays_within_bounds_are_valid() {
        assert!(TransitionDelays::default().validate().is_ok());
        let at_max = TransitionDelays {
            start: MAX_TRANSITION_DELAY,
            stop: MAX_TRANSITION_DELAY,
        };
        assert!(at_max.validate().is_ok());
        let too_long = TransitionDelays {
            stop: MAX_TRANSITION_DELAY + Duration::from_millis(1),
            ..at_max
        };
        assert_eq!(too_long.validate().unwrap_err().phase, "stop");
    }

    #[tokio::test]
    async fn transitions_are_refused_without_a_driver() {
        let mut vms = default_fleet();
        vms.get_mut(&VmId(2)).unwrap().state = VmState::Running;
        let mut registry = Registry::new(vms, short_delays(), test_logger());

        registry.driver.abort();
        assert!((&mut registry.driver).await.unwrap_err().is_cancelled());

        assert_eq!(
            registry.launch(VmId(0)).unwrap_err(),
            RegistryError::DriverUnavailable
        );
        assert_eq!(
            registry.stop(VmId(2)).unwrap_err(),
            RegistryError::DriverUnavailable
        );
        assert_eq!(registry.inspect(VmId(0)).unwrap().state, VmState::Stopped);
        assert_eq!(registry.inspect(VmId(2)).unwrap().state, VmState::Running);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let registry = registry_with(VmState::Stopped);
        assert!(registry.delete(GOOD_ID));
        assert!(!registry.delete(GOOD_ID));
        assert_eq!(registry.inspect(GOOD_ID), None);
    }

    #[tokio::test]
    async fn delete_on_empty_registry() {
        let registry =
            Registry::new(BTreeMap::new(), short_delays(), test_logger());
        assert!(!registry.delete(VmId(999)));
    }

    #[tokio::test(start_paused = true)]
    async fn completion_for_deleted_vm_is_rejected() {
        let registry = registry_with(VmState::Stopped);

        let pending = registry.launch(GOOD_ID).unwrap();
        assert!(registry.delete(GOOD_ID));

        assert_eq!(
            pending.wait().await.unwrap_err(),
            CompletionError::Rejected {
                id: GOOD_ID,
                target: VmState::Running,
                source: RegistryError::NotFound(GOOD_ID),
            }
        );
        assert_eq!(registry.inspect(GOOD_ID), None);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_still_completes() {
        let registry = registry_with(VmState::Stopped);
        drop(registry.launch(GOOD_ID).unwrap());

        tokio::time::sleep(registry.delays().start * 2).await;
        assert_eq!(registry.inspect(GOOD_ID).unwrap().state, VmState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_transitions() {
        let mut vms = default_fleet();
        vms.get_mut(&VmId(2)).unwrap().state = VmState::Running;
        let registry = Registry::new(vms, short_delays(), test_logger());

        let launching = registry.launch(VmId(0)).unwrap();
        let stopping = registry.stop(VmId(2)).unwrap();
        registry.shutdown().await;

        assert_eq!(
            launching.wait().await.unwrap_err(),
            CompletionError::Cancelled { id: VmId(0), target: VmState::Running }
        );
        assert_eq!(
            stopping.wait().await.unwrap_err(),
            CompletionError::Cancelled { id: VmId(2), target: VmState::Stopped }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_launches_admit_exactly_one() {
        let registry = Arc::new(registry_with(VmState::Stopped));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.launch(GOOD_ID) })
            })
            .collect();

        let mut launched = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => launched += 1,
                Err(e) => assert_eq!(
                    e,
                    RegistryError::IllegalTransition(TransitionError {
                        from: VmState::Starting,
                        to: VmState::Starting,
                    })
                ),
            }
        }
        assert_eq!(launched, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_mixed_writers_serialize() {
        let delays = TransitionDelays {
            start: Duration::from_secs(3600),
            stop: Duration::from_secs(3600),
        };
        let registry =
            Arc::new(Registry::new(default_fleet(), delays, test_logger()));

        enum Outcome {
            Launched(Result<(), RegistryError>),
            Stopped(Result<(), RegistryError>),
            Deleted(bool),
        }

        let tasks: Vec<_> = (0..48)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    match i % 3 {
                        0 => Outcome::Launched(
                            registry.launch(GOOD_ID).map(|_| ()),
                        ),
                        1 => Outcome::Stopped(
                            registry.stop(GOOD_ID).map(|_| ()),
                        ),
                        _ => Outcome::Deleted(registry.delete(GOOD_ID)),
                    }
                })
            })
            .collect();

        let (mut launched, mut deleted) = (0, 0);
        for task in tasks {
            match task.await.unwrap() {
                Outcome::Launched(Ok(())) => launched += 1,
                Outcome::Launched(Err(_)) => {}
                // A VM that starts out stopped can never be stopped again
                // before its launch completes.
                Outcome::Stopped(res) => assert!(res.is_err()),
                Outcome::Deleted(true) => deleted += 1,
                Outcome::Deleted(false) => {}
            }
        }

        assert!(launched <= 1);
        assert_eq!(deleted, 1);
        assert_eq!(registry.inspect(GOOD_ID), None);

        // The rest of the fleet is untouched.
        let mut expected = default_fleet();
        expected.remove(&GOOD_ID);
        assert_eq!(registry.list(), expected);
    }
}
