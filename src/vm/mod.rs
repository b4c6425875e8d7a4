//! Hypervisor-facing VM abstraction.
//!
//! [`VirtualMachine`] is the runtime handle the supervisor drives;
//! [`Hypervisor`] builds one from a [`VmSpec`]. Platform implementations
//! live in [`crate::backend`]; [`mock`] provides scriptable doubles.

pub mod mock;

use std::fmt;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::VmSpec;

/// Lifecycle state reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl VmState {
    /// `Stopped` and `Error` are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, VmState::Stopped | VmState::Error)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::NotStarted => "not-started",
            VmState::Starting => "starting",
            VmState::Running => "running",
            VmState::Stopping => "stopping",
            VmState::Stopped => "stopped",
            VmState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Errors from hypervisor operations on a VM.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("{0}")]
    Start(String),

    #[error("{0}")]
    RequestStop(String),

    #[error("{0}")]
    Stop(String),

    #[error("operation not valid in state {0}")]
    InvalidState(VmState),
}

/// Stream of state changes, in the order the hypervisor reported them.
pub type StateChanges = mpsc::UnboundedReceiver<VmState>;

/// A VM runtime handle.
///
/// Owned by exactly one supervisor; none of the methods are expected to be
/// called concurrently.
#[async_trait::async_trait]
pub trait VirtualMachine: Send {
    /// Current lifecycle state.
    fn state(&self) -> VmState;

    /// Take the state-change notification source. Only the first call
    /// returns `Some`.
    fn state_changes(&mut self) -> Option<StateChanges>;

    /// Boot the VM.
    async fn start(&mut self) -> Result<(), VmError>;

    /// Ask the guest to shut down.
    ///
    /// `Ok(false)` means the request was declined without an error (the
    /// guest cannot be asked right now).
    async fn request_stop(&mut self) -> Result<bool, VmError>;

    /// Stop the VM immediately, without guest cooperation.
    async fn stop(&mut self) -> Result<(), VmError>;
}

/// Builds VMs for one kind of broker network descriptor.
pub trait Hypervisor {
    type Descriptor;
    type Machine: VirtualMachine;

    /// Build and validate a VM. The VM is not started.
    fn create(&self, spec: &VmSpec<'_, Self::Descriptor>) -> crate::Result<Self::Machine>;
}
