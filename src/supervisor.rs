//! VM lifecycle supervisor.
//!
//! Starts a VM, waits for either the guest to stop or a termination
//! signal, then stops the guest: first by asking it to shut down, and if
//! that is declined, fails, or takes longer than the stop timeout, by
//! stopping the VM hard.
//!
//! ```text
//!            start ok
//!   Idle ───────────────► Monitoring ──── guest stopped ────────────► Done
//!    │                        │
//!    │ start failed           │ SIGINT / SIGTERM
//!    ▼                        ▼
//!  Failed ◄── error ── GracefulStopping ── guest stopped ───────────► Done
//!                             │
//!                             │ refused / request failed / timeout
//!                             ▼
//!                        HardStopping ──── stopped ──────────────────► Done
//!                             │
//!                             └─────────── stop failed ──────────────► Failed
//! ```
//!
//! The event loop is a single `tokio::select!` over the VM's state changes,
//! the termination signals, and (while stopping) the stop timeout. State
//! changes are polled first so that a guest poweroff racing with the timer
//! is never reported as a timeout.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::signals::TerminationSignal;
use crate::vm::{StateChanges, VirtualMachine, VmError, VmState};

/// How long a graceful stop may take before escalating to a hard stop.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the supervisor is in the VM lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Monitoring,
    GracefulStopping,
    HardStopping(HardStopReason),
    Done,
    Failed,
}

impl SupervisorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SupervisorState::Done | SupervisorState::Failed)
    }
}

/// Why a graceful stop escalated to a hard stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardStopReason {
    /// The VM declined the stop request.
    Refused,
    /// The stop request returned an error.
    RequestFailed(String),
    /// The guest did not stop within the timeout.
    Timeout(Duration),
}

impl fmt::Display for HardStopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardStopReason::Refused => write!(f, "The guest cannot stop gracefully"),
            HardStopReason::RequestFailed(e) => write!(f, "Failed to stop guest gracefully: {}", e),
            HardStopReason::Timeout(t) => {
                write!(f, "Timeout stopping guest gracefully after {:?}", t)
            }
        }
    }
}

/// Input to the supervisor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    TerminationRequested(TerminationSignal),
    StateChanged(VmState),
}

/// How the VM ended up stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopPath {
    /// The guest powered off on its own.
    GuestInitiated,
    /// The guest honoured a stop request.
    Graceful,
    /// The VM was stopped hard.
    Forced(HardStopReason),
}

/// Successful end of a supervised run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub path: StopPath,
    /// Signal that triggered the stop, if any.
    pub signal: Option<TerminationSignal>,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to start vm: {0}")]
    Start(#[source] VmError),

    #[error("The guest stopped with an error")]
    Guest,

    #[error("{reason}; failed to stop guest: {source}")]
    HardStop {
        reason: HardStopReason,
        #[source]
        source: VmError,
    },

    #[error("State notifications ended while the vm was {0}")]
    NotificationsClosed(VmState),

    #[error("State notifications were already taken from this vm")]
    NoNotifications,
}

impl SupervisorError {
    pub fn phase(&self) -> &'static str {
        match self {
            SupervisorError::Start(_) | SupervisorError::NoNotifications => "start",
            SupervisorError::Guest | SupervisorError::NotificationsClosed(_) => "monitor",
            SupervisorError::HardStop { .. } => "hard-stop",
        }
    }
}

enum Monitored {
    GuestStopped,
    Signalled(TerminationSignal),
}

enum Graceful {
    Stopped,
    Escalate(HardStopReason),
}

/// Drives one VM from start to a terminal state.
pub struct Supervisor<M> {
    vm: M,
    state: SupervisorState,
    stop_timeout: Duration,
}

impl<M: VirtualMachine> Supervisor<M> {
    pub fn new(vm: M) -> Self {
        Self {
            vm,
            state: SupervisorState::Idle,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Start the VM and supervise it until it stops.
    ///
    /// Consumes the supervisor: `Done` and `Failed` are final.
    pub async fn run(
        mut self,
        mut signals: mpsc::UnboundedReceiver<TerminationSignal>,
    ) -> Result<Outcome, SupervisorError> {
        match self.drive(&mut signals).await {
            Ok(outcome) => {
                self.transition(SupervisorState::Done);
                Ok(outcome)
            }
            Err(err) => {
                self.transition(SupervisorState::Failed);
                debug!(phase = err.phase(), "Supervisor failed: {}", err);
                Err(err)
            }
        }
    }

    async fn drive(
        &mut self,
        signals: &mut mpsc::UnboundedReceiver<TerminationSignal>,
    ) -> Result<Outcome, SupervisorError> {
        let mut states = self
            .vm
            .state_changes()
            .ok_or(SupervisorError::NoNotifications)?;

        info!("Starting vm");
        self.vm.start().await.map_err(SupervisorError::Start)?;
        self.transition(SupervisorState::Monitoring);

        let signal = match self.monitor(&mut states, signals).await? {
            Monitored::GuestStopped => {
                return Ok(Outcome {
                    path: StopPath::GuestInitiated,
                    signal: None,
                })
            }
            Monitored::Signalled(signal) => signal,
        };

        self.transition(SupervisorState::GracefulStopping);
        let path = match self.stop_gracefully(&mut states, signals).await? {
            Graceful::Stopped => StopPath::Graceful,
            Graceful::Escalate(reason) => {
                self.transition(SupervisorState::HardStopping(reason.clone()));
                self.hard_stop(reason).await?
            }
        };

        Ok(Outcome {
            path,
            signal: Some(signal),
        })
    }

    async fn monitor(
        &mut self,
        states: &mut StateChanges,
        signals: &mut mpsc::UnboundedReceiver<TerminationSignal>,
    ) -> Result<Monitored, SupervisorError> {
        let mut signals_open = true;
        loop {
            let event = tokio::select! {
                biased;
                state = states.recv() => match state {
                    Some(state) => SupervisorEvent::StateChanged(state),
                    None => return self.notifications_closed().map(|()| Monitored::GuestStopped),
                },
                signal = signals.recv(), if signals_open => match signal {
                    Some(signal) => SupervisorEvent::TerminationRequested(signal),
                    None => {
                        debug!("Termination signal source closed");
                        signals_open = false;
                        continue;
                    }
                },
            };

            match event {
                SupervisorEvent::StateChanged(VmState::Stopped) => {
                    info!("The guest stopped");
                    return Ok(Monitored::GuestStopped);
                }
                SupervisorEvent::StateChanged(VmState::Error) => {
                    return Err(SupervisorError::Guest);
                }
                SupervisorEvent::StateChanged(state) => {
                    debug!(%state, "VM state changed");
                }
                SupervisorEvent::TerminationRequested(signal) => {
                    info!("Received signal {}", signal);
                    return Ok(Monitored::Signalled(signal));
                }
            }
        }
    }

    async fn stop_gracefully(
        &mut self,
        states: &mut StateChanges,
        signals: &mut mpsc::UnboundedReceiver<TerminationSignal>,
    ) -> Result<Graceful, SupervisorError> {
        info!("Stopping guest gracefully");
        match self.vm.request_stop().await {
            Ok(true) => {}
            Ok(false) => return Ok(Graceful::Escalate(HardStopReason::Refused)),
            Err(e) => return Ok(Graceful::Escalate(HardStopReason::RequestFailed(e.to_string()))),
        }

        info!("Waiting until guest is stopped");
        let timeout = tokio::time::sleep(self.stop_timeout);
        tokio::pin!(timeout);

        let mut states_open = true;
        let mut signals_open = true;
        loop {
            tokio::select! {
                biased;
                state = states.recv(), if states_open => match state {
                    Some(VmState::Stopped) => {
                        info!("The guest stopped");
                        return Ok(Graceful::Stopped);
                    }
                    Some(VmState::Error) => return Err(SupervisorError::Guest),
                    Some(state) => debug!(%state, "VM state changed"),
                    None => {
                        if self.vm.state() == VmState::Stopped {
                            return Ok(Graceful::Stopped);
                        }
                        warn!("State notifications ended while stopping");
                        states_open = false;
                    }
                },
                signal = signals.recv(), if signals_open => match signal {
                    Some(signal) => info!("Received signal {} while stopping, ignoring", signal),
                    None => signals_open = false,
                },
                () = &mut timeout => {
                    return Ok(Graceful::Escalate(HardStopReason::Timeout(self.stop_timeout)));
                }
            }
        }
    }

    async fn hard_stop(&mut self, reason: HardStopReason) -> Result<StopPath, SupervisorError> {
        warn!("{}, stopping guest", reason);
        match self.vm.stop().await {
            Ok(()) => {}
            Err(e) if self.vm.state() == VmState::Stopped => {
                debug!("Stop returned an error but the vm is stopped: {}", e);
            }
            Err(source) => return Err(SupervisorError::HardStop { reason, source }),
        }
        info!("The guest was stopped");
        Ok(StopPath::Forced(reason))
    }

    fn notifications_closed(&self) -> Result<(), SupervisorError> {
        match self.vm.state() {
            VmState::Stopped => Ok(()),
            state => Err(SupervisorError::NotificationsClosed(state)),
        }
    }

    fn transition(&mut self, next: SupervisorState) {
        debug!(from = ?self.state, to = ?next, "Supervisor transition");
        self.state = next;
    }
}
