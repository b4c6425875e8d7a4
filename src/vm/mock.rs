//! Mock VM and hypervisor for testing

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::VmSpec;
use crate::vm::{Hypervisor, StateChanges, VirtualMachine, VmError, VmState};
use crate::{Error, Result};

/// How a [`MockMachine`] reacts to lifecycle calls.
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// `start` fails.
    pub fail_start: bool,
    /// `request_stop` declines with `Ok(false)`.
    pub refuse_stop: bool,
    /// `request_stop` fails.
    pub fail_request_stop: bool,
    /// Guest powers off this long after an accepted `request_stop`.
    /// `None` means the guest ignores the request.
    pub stop_after_request: Option<Duration>,
    /// `stop` fails.
    pub fail_stop: bool,
    /// With `fail_stop`, the VM still ends up stopped.
    pub stopped_despite_stop_error: bool,
}

struct Shared {
    state: Mutex<VmState>,
    events: Mutex<Option<mpsc::UnboundedSender<VmState>>>,
    behavior: MockBehavior,
    start_calls: AtomicUsize,
    request_stop_calls: AtomicUsize,
    stop_calls: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn set_state(&self, state: VmState) {
        *lock(&self.state) = state;
        if let Some(tx) = lock(&self.events).as_ref() {
            let _ = tx.send(state);
        }
    }
}

/// Scriptable in-memory VM.
pub struct MockMachine {
    shared: Arc<Shared>,
    events: Option<StateChanges>,
}

/// Test-side view of a [`MockMachine`] that outlives moving the machine
/// into a supervisor.
#[derive(Clone)]
pub struct MockController {
    shared: Arc<Shared>,
}

impl MockMachine {
    pub fn new(behavior: MockBehavior) -> (Self, MockController) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(VmState::NotStarted),
            events: Mutex::new(Some(tx)),
            behavior,
            start_calls: AtomicUsize::new(0),
            request_stop_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        });
        let controller = MockController {
            shared: Arc::clone(&shared),
        };
        (
            Self {
                shared,
                events: Some(rx),
            },
            controller,
        )
    }
}

impl MockController {
    /// Report a state change, as the hypervisor would (e.g. guest poweroff).
    pub fn set_state(&self, state: VmState) {
        self.shared.set_state(state);
    }

    pub fn state(&self) -> VmState {
        *lock(&self.shared.state)
    }

    /// Drop the notification sender; the receiver sees the stream end.
    pub fn close_notifications(&self) {
        lock(&self.shared.events).take();
    }

    pub fn start_calls(&self) -> usize {
        self.shared.start_calls.load(Ordering::SeqCst)
    }

    pub fn request_stop_calls(&self) -> usize {
        self.shared.request_stop_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.shared.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl VirtualMachine for MockMachine {
    fn state(&self) -> VmState {
        *lock(&self.shared.state)
    }

    fn state_changes(&mut self) -> Option<StateChanges> {
        self.events.take()
    }

    async fn start(&mut self) -> std::result::Result<(), VmError> {
        self.shared.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.state() != VmState::NotStarted {
            return Err(VmError::InvalidState(self.state()));
        }
        if self.shared.behavior.fail_start {
            return Err(VmError::Start("mock start failure".into()));
        }
        self.shared.set_state(VmState::Starting);
        self.shared.set_state(VmState::Running);
        Ok(())
    }

    async fn request_stop(&mut self) -> std::result::Result<bool, VmError> {
        self.shared.request_stop_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = &self.shared.behavior;
        if behavior.fail_request_stop {
            return Err(VmError::RequestStop("mock request stop failure".into()));
        }
        if behavior.refuse_stop {
            return Ok(false);
        }

        self.shared.set_state(VmState::Stopping);
        if let Some(delay) = behavior.stop_after_request {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                shared.set_state(VmState::Stopped);
            });
        }
        Ok(true)
    }

    async fn stop(&mut self) -> std::result::Result<(), VmError> {
        self.shared.stop_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = &self.shared.behavior;
        if behavior.fail_stop {
            if behavior.stopped_despite_stop_error {
                self.shared.set_state(VmState::Stopped);
            }
            return Err(VmError::Stop("mock stop failure".into()));
        }
        self.shared.set_state(VmState::Stopped);
        Ok(())
    }
}

/// Hypervisor that hands out [`MockMachine`]s for any descriptor type.
pub struct MockHypervisor<D> {
    behavior: MockBehavior,
    fail_create: bool,
    created: Mutex<Vec<MockController>>,
    _descriptor: PhantomData<fn(&D)>,
}

impl<D> MockHypervisor<D> {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            fail_create: false,
            created: Mutex::new(Vec::new()),
            _descriptor: PhantomData,
        }
    }

    /// Make `create` fail, as a configuration validation error would.
    pub fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::new(MockBehavior::default())
        }
    }

    /// Controller of the most recently created machine.
    pub fn last_machine(&self) -> Option<MockController> {
        lock(&self.created).last().cloned()
    }

    pub fn created_count(&self) -> usize {
        lock(&self.created).len()
    }
}

impl<D> Hypervisor for MockHypervisor<D> {
    type Descriptor = D;
    type Machine = MockMachine;

    fn create(&self, spec: &VmSpec<'_, D>) -> Result<MockMachine> {
        if self.fail_create {
            return Err(Error::Hypervisor(format!(
                "failed to validate config for '{}'",
                spec.name
            )));
        }
        let (machine, controller) = MockMachine::new(self.behavior.clone());
        lock(&self.created).push(controller);
        Ok(machine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_reports_transitions() {
        let (mut vm, ctl) = MockMachine::new(MockBehavior::default());
        let mut events = vm.state_changes().unwrap();
        assert!(vm.state_changes().is_none());

        vm.start().await.unwrap();
        assert_eq!(events.recv().await, Some(VmState::Starting));
        assert_eq!(events.recv().await, Some(VmState::Running));
        assert_eq!(ctl.start_calls(), 1);

        assert!(matches!(vm.start().await, Err(VmError::InvalidState(VmState::Running))));
    }

    #[tokio::test(start_paused = true)]
    async fn guest_stops_after_request() {
        let (mut vm, ctl) = MockMachine::new(MockBehavior {
            stop_after_request: Some(Duration::from_secs(2)),
            ..MockBehavior::default()
        });
        let mut events = vm.state_changes().unwrap();
        vm.start().await.unwrap();

        assert!(vm.request_stop().await.unwrap());
        let mut seen = Vec::new();
        while let Some(state) = events.recv().await {
            seen.push(state);
            if state == VmState::Stopped {
                break;
            }
        }
        assert_eq!(seen.last(), Some(&VmState::Stopped));
        assert_eq!(ctl.state(), VmState::Stopped);
    }

    #[tokio::test]
    async fn stop_failure_can_leave_vm_stopped() {
        let (mut vm, ctl) = MockMachine::new(MockBehavior {
            fail_stop: true,
            stopped_despite_stop_error: true,
            ..MockBehavior::default()
        });
        vm.start().await.unwrap();
        assert!(vm.stop().await.is_err());
        assert_eq!(ctl.state(), VmState::Stopped);
        assert_eq!(ctl.stop_calls(), 1);
    }
}
