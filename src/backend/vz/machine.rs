//! [`VirtualMachine`] implementation on `VZVirtualMachine`.
//!
//! ## Queue discipline
//!
//! Every operation on a `VZVirtualMachine` must happen on the dispatch
//! queue it was created with. Each call here dispatches a block onto that
//! serial queue and waits for the result on a std channel, inside
//! `block_in_place` so the tokio worker is not starved.
//!
//! ## State changes
//!
//! After a successful start, a watcher thread polls the VM state on the
//! queue every [`STATE_POLL_INTERVAL`] and emits each change once. It exits
//! after emitting a terminal state, or when the receiver is gone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use block2::RcBlock;
use dispatch2::{DispatchQueue, DispatchQueueAttr, DispatchRetained};
use objc2::rc::Retained;
use objc2::AnyThread;
use objc2_foundation::NSError;
use objc2_virtualization::{VZVirtualMachine, VZVirtualMachineState};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vmnet_broker::XpcObject;

use super::config;
use crate::backend::vmnet::VmnetNetwork;
use crate::config::VmSpec;
use crate::vm::{Hypervisor, StateChanges, VirtualMachine, VmError, VmState};
use crate::Result;

pub const STATE_POLL_INTERVAL: Duration = Duration::from_millis(200);

const QUEUE_TIMEOUT: Duration = Duration::from_secs(5);
const START_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Wrapper to assert `Send + Sync` for `Retained<VZVirtualMachine>`.
///
/// # Safety
///
/// The VM is only ever touched from blocks dispatched onto its own serial
/// queue.
struct SendSyncVm(Retained<VZVirtualMachine>);
unsafe impl Send for SendSyncVm {}
unsafe impl Sync for SendSyncVm {}

/// Builds VMs on Apple's Virtualization.framework.
#[derive(Debug, Default)]
pub struct VzHypervisor;

impl VzHypervisor {
    pub fn new() -> Self {
        Self
    }
}

impl Hypervisor for VzHypervisor {
    type Descriptor = XpcObject;
    type Machine = VzMachine;

    fn create(&self, spec: &VmSpec<'_, XpcObject>) -> Result<VzMachine> {
        info!(
            "VzHypervisor: creating VM '{}' (memory={}MB, cpus={}, mac={})",
            spec.name,
            spec.memory_bytes / (1024 * 1024),
            spec.cpus,
            spec.mac
        );
        let network = VmnetNetwork::from_serialization(spec.network)?;
        let vm_config = config::build_configuration(spec, &network)?;

        let queue = DispatchQueue::new("com.github.vmnet-launcher.vz", DispatchQueueAttr::SERIAL);
        let vm = unsafe {
            VZVirtualMachine::initWithConfiguration_queue(
                VZVirtualMachine::alloc(),
                &vm_config,
                &queue,
            )
        };
        Ok(VzMachine::new(vm, queue, network))
    }
}

/// A `VZVirtualMachine` and the dispatch queue it lives on.
pub struct VzMachine {
    vm: Arc<SendSyncVm>,
    queue: DispatchRetained<DispatchQueue>,
    events_tx: mpsc::UnboundedSender<VmState>,
    events: Option<StateChanges>,
    started: Arc<AtomicBool>,
    last_state: Arc<Mutex<VmState>>,
    watcher_stop: Arc<AtomicBool>,
    _network: VmnetNetwork,
}

impl VzMachine {
    fn new(
        vm: Retained<VZVirtualMachine>,
        queue: DispatchRetained<DispatchQueue>,
        network: VmnetNetwork,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            vm: Arc::new(SendSyncVm(vm)),
            queue,
            events_tx,
            events: Some(events),
            started: Arc::new(AtomicBool::new(false)),
            last_state: Arc::new(Mutex::new(VmState::NotStarted)),
            watcher_stop: Arc::new(AtomicBool::new(false)),
            _network: network,
        }
    }

    /// Run `f` with the VM on its queue and wait for the result.
    fn on_queue<R, F>(&self, f: F) -> std::result::Result<R, String>
    where
        R: Send + 'static,
        F: FnOnce(&VZVirtualMachine) -> R + Send + 'static,
    {
        on_queue(&self.vm, &self.queue, f)
    }

    /// Run an operation that reports through a completion handler.
    fn complete_on_queue<F>(&self, op: F, timeout: Duration) -> std::result::Result<(), String>
    where
        F: FnOnce(&VZVirtualMachine, &RcBlock<dyn Fn(*mut NSError)>) + Send + 'static,
    {
        let (tx, rx) = std::sync::mpsc::channel::<std::result::Result<(), String>>();
        let vm = Arc::clone(&self.vm);
        self.queue.exec_async(move || {
            let tx = Mutex::new(Some(tx));
            let handler = RcBlock::new(move |err: *mut NSError| {
                let result = if err.is_null() {
                    Ok(())
                } else {
                    Err(unsafe { &*err }.localizedDescription().to_string())
                };
                let sender = tx.lock().unwrap_or_else(|p| p.into_inner()).take();
                if let Some(tx) = sender {
                    let _ = tx.send(result);
                }
            });
            op(&vm.0, &handler);
        });

        rx.recv_timeout(timeout)
            .map_err(|_| format!("timed out after {:?}", timeout))?
    }

    fn spawn_watcher(&self) {
        let vm = Arc::clone(&self.vm);
        let queue = self.queue.clone();
        let tx = self.events_tx.clone();
        let stop = Arc::clone(&self.watcher_stop);
        let last = Arc::clone(&self.last_state);

        let spawned = std::thread::Builder::new()
            .name("vz-state".into())
            .spawn(move || {
                let mut previous = VmState::NotStarted;
                while !stop.load(Ordering::SeqCst) {
                    match on_queue(&vm, &queue, |vm| unsafe { vm.state() }) {
                        Ok(raw) => {
                            let state = fold_state(raw, true);
                            if state != previous {
                                debug!(%state, "VZ state changed");
                                *last.lock().unwrap_or_else(|p| p.into_inner()) = state;
                                if tx.send(state).is_err() {
                                    break;
                                }
                                previous = state;
                                if state.is_terminal() {
                                    break;
                                }
                            }
                        }
                        Err(e) => warn!("VZ state poll failed: {}", e),
                    }
                    std::thread::sleep(STATE_POLL_INTERVAL);
                }
                debug!("VZ state watcher exiting");
            });
        if let Err(e) = spawned {
            warn!("Failed to spawn VZ state watcher: {}", e);
        }
    }
}

fn on_queue<R, F>(
    vm: &Arc<SendSyncVm>,
    queue: &DispatchRetained<DispatchQueue>,
    f: F,
) -> std::result::Result<R, String>
where
    R: Send + 'static,
    F: FnOnce(&VZVirtualMachine) -> R + Send + 'static,
{
    let (tx, rx) = std::sync::mpsc::channel();
    let vm = Arc::clone(vm);
    queue.exec_async(move || {
        let _ = tx.send(f(&vm.0));
    });
    rx.recv_timeout(QUEUE_TIMEOUT)
        .map_err(|_| "VZ queue did not respond".to_string())
}

/// Collapse the framework's states onto [`VmState`].
///
/// The framework reports `Stopped` before the first start; that is
/// `NotStarted` here. Pause and save/restore states count as running.
fn fold_state(state: VZVirtualMachineState, started: bool) -> VmState {
    if state == VZVirtualMachineState::Stopped {
        if started {
            VmState::Stopped
        } else {
            VmState::NotStarted
        }
    } else if state == VZVirtualMachineState::Starting {
        VmState::Starting
    } else if state == VZVirtualMachineState::Stopping {
        VmState::Stopping
    } else if state == VZVirtualMachineState::Error {
        VmState::Error
    } else {
        VmState::Running
    }
}

#[async_trait::async_trait]
impl VirtualMachine for VzMachine {
    fn state(&self) -> VmState {
        let started = self.started.load(Ordering::SeqCst);
        match self.on_queue(|vm| unsafe { vm.state() }) {
            Ok(raw) => fold_state(raw, started),
            Err(e) => {
                warn!("VZ state query failed: {}", e);
                *self.last_state.lock().unwrap_or_else(|p| p.into_inner())
            }
        }
    }

    fn state_changes(&mut self) -> Option<StateChanges> {
        self.events.take()
    }

    async fn start(&mut self) -> std::result::Result<(), VmError> {
        tokio::task::block_in_place(|| {
            info!("VzMachine: starting VM");
            self.started.store(true, Ordering::SeqCst);
            self.complete_on_queue(
                |vm, handler| unsafe { vm.startWithCompletionHandler(handler) },
                START_TIMEOUT,
            )
            .map_err(VmError::Start)?;

            info!("VzMachine: VM started");
            self.spawn_watcher();
            Ok(())
        })
    }

    async fn request_stop(&mut self) -> std::result::Result<bool, VmError> {
        tokio::task::block_in_place(|| {
            let result = self
                .on_queue(|vm| unsafe {
                    if !vm.canRequestStop() {
                        return Ok(false);
                    }
                    vm.requestStopWithError()
                        .map(|()| true)
                        .map_err(|e| e.localizedDescription().to_string())
                })
                .map_err(VmError::RequestStop)?;
            result.map_err(VmError::RequestStop)
        })
    }

    async fn stop(&mut self) -> std::result::Result<(), VmError> {
        tokio::task::block_in_place(|| {
            info!("VzMachine: stopping VM");
            self.complete_on_queue(
                |vm, handler| unsafe { vm.stopWithCompletionHandler(handler) },
                STOP_TIMEOUT,
            )
            .map_err(VmError::Stop)
        })
    }
}

impl Drop for VzMachine {
    fn drop(&mut self) {
        self.watcher_stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_initial_stopped_is_not_started() {
        assert_eq!(
            fold_state(VZVirtualMachineState::Stopped, false),
            VmState::NotStarted
        );
        assert_eq!(
            fold_state(VZVirtualMachineState::Stopped, true),
            VmState::Stopped
        );
    }

    #[test]
    fn fold_transitional_states() {
        assert_eq!(fold_state(VZVirtualMachineState::Paused, true), VmState::Running);
        assert_eq!(fold_state(VZVirtualMachineState::Resuming, true), VmState::Running);
        assert_eq!(fold_state(VZVirtualMachineState::Stopping, true), VmState::Stopping);
        assert_eq!(fold_state(VZVirtualMachineState::Error, true), VmState::Error);
    }
}
