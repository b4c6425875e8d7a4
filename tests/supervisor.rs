//! Supervisor lifecycle tests against the mock VM.
//!
//! Timeout scenarios run on tokio's paused clock, so the 10 s default stop
//! timeout elapses instantly.

use std::time::Duration;

use tokio::sync::mpsc;
use vmnet_launcher::signals::TerminationSignal;
use vmnet_launcher::supervisor::{
    HardStopReason, StopPath, Supervisor, SupervisorError, DEFAULT_STOP_TIMEOUT,
};
use vmnet_launcher::vm::mock::{MockBehavior, MockController, MockMachine};
use vmnet_launcher::VmState;

fn machine(behavior: MockBehavior) -> (MockMachine, MockController) {
    MockMachine::new(behavior)
}

async fn wait_for_state(ctl: &MockController, state: VmState) {
    while ctl.state() != state {
        tokio::task::yield_now().await;
    }
}

// =============================================================================
// GUEST-INITIATED STOP
// =============================================================================

/// A guest that powers off on its own is never asked to stop.
#[tokio::test]
async fn test_guest_poweroff_needs_no_stop_calls() {
    let (vm, ctl) = machine(MockBehavior::default());
    let (_tx, rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(Supervisor::new(vm).run(rx));
    wait_for_state(&ctl, VmState::Running).await;
    ctl.set_state(VmState::Stopped);

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome.path, StopPath::GuestInitiated);
    assert_eq!(ctl.start_calls(), 1);
    assert_eq!(ctl.request_stop_calls(), 0);
    assert_eq!(ctl.stop_calls(), 0);
}

/// Transitional states while monitoring are only observed.
#[tokio::test]
async fn test_intermediate_states_are_ignored() {
    let (vm, ctl) = machine(MockBehavior::default());
    let (_tx, rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(Supervisor::new(vm).run(rx));
    wait_for_state(&ctl, VmState::Running).await;
    ctl.set_state(VmState::Stopping);
    ctl.set_state(VmState::Running);
    ctl.set_state(VmState::Stopped);

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome.path, StopPath::GuestInitiated);
}

/// Notifications ending after the VM stopped still count as a clean stop.
#[tokio::test]
async fn test_closed_notifications_after_stop_is_done() {
    let (vm, ctl) = machine(MockBehavior::default());
    let (_tx, rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(Supervisor::new(vm).run(rx));
    wait_for_state(&ctl, VmState::Running).await;
    ctl.close_notifications();
    ctl.set_state(VmState::Stopped);

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome.path, StopPath::GuestInitiated);
}

// =============================================================================
// GRACEFUL STOP
// =============================================================================

/// Signal, accepted request, guest stops inside the window: no hard stop.
#[tokio::test(start_paused = true)]
async fn test_graceful_stop_within_timeout() {
    let (vm, ctl) = machine(MockBehavior {
        stop_after_request: Some(Duration::from_secs(3)),
        ..MockBehavior::default()
    });
    let (tx, rx) = mpsc::unbounded_channel();
    tx.send(TerminationSignal::Interrupt).unwrap();

    let outcome = Supervisor::new(vm).run(rx).await.unwrap();
    assert_eq!(outcome.path, StopPath::Graceful);
    assert_eq!(outcome.signal, Some(TerminationSignal::Interrupt));
    assert_eq!(ctl.request_stop_calls(), 1);
    assert_eq!(ctl.stop_calls(), 0);
}

/// A second signal while stopping neither re-requests nor escalates.
#[tokio::test(start_paused = true)]
async fn test_second_signal_is_ignored() {
    let (vm, ctl) = machine(MockBehavior {
        stop_after_request: Some(Duration::from_secs(5)),
        ..MockBehavior::default()
    });
    let (tx, rx) = mpsc::unbounded_channel();
    tx.send(TerminationSignal::Interrupt).unwrap();
    tx.send(TerminationSignal::Interrupt).unwrap();
    tx.send(TerminationSignal::Terminate).unwrap();

    let outcome = Supervisor::new(vm).run(rx).await.unwrap();
    assert_eq!(outcome.path, StopPath::Graceful);
    assert_eq!(ctl.request_stop_calls(), 1);
    assert_eq!(ctl.stop_calls(), 0);
}

/// A guest stopping just before the deadline is not escalated.
#[tokio::test(start_paused = true)]
async fn test_stop_just_before_deadline_is_graceful() {
    let timeout = Duration::from_secs(2);
    let (vm, ctl) = machine(MockBehavior {
        stop_after_request: Some(timeout - Duration::from_millis(1)),
        ..MockBehavior::default()
    });
    let (tx, rx) = mpsc::unbounded_channel();
    tx.send(TerminationSignal::Terminate).unwrap();

    let outcome = Supervisor::new(vm)
        .with_stop_timeout(timeout)
        .run(rx)
        .await
        .unwrap();
    assert_eq!(outcome.path, StopPath::Graceful);
    assert_eq!(ctl.stop_calls(), 0);
}

// =============================================================================
// HARD STOP
// =============================================================================

/// No stop report within the window: exactly one hard stop, then done.
#[tokio::test(start_paused = true)]
async fn test_timeout_escalates_to_hard_stop() {
    let (vm, ctl) = machine(MockBehavior::default());
    let (tx, rx) = mpsc::unbounded_channel();
    tx.send(TerminationSignal::Terminate).unwrap();

    let started = tokio::time::Instant::now();
    let outcome = Supervisor::new(vm).run(rx).await.unwrap();
    assert_eq!(
        outcome.path,
        StopPath::Forced(HardStopReason::Timeout(DEFAULT_STOP_TIMEOUT))
    );
    assert!(started.elapsed() >= DEFAULT_STOP_TIMEOUT);
    assert_eq!(ctl.request_stop_calls(), 1);
    assert_eq!(ctl.stop_calls(), 1);
}

/// Hard stop failing on a VM that is still up fails the run.
#[tokio::test(start_paused = true)]
async fn test_failed_hard_stop_fails() {
    let (vm, ctl) = machine(MockBehavior {
        fail_stop: true,
        ..MockBehavior::default()
    });
    let (tx, rx) = mpsc::unbounded_channel();
    tx.send(TerminationSignal::Terminate).unwrap();

    let err = Supervisor::new(vm).run(rx).await.unwrap_err();
    assert!(matches!(
        err,
        SupervisorError::HardStop {
            reason: HardStopReason::Timeout(_),
            ..
        }
    ));
    assert_eq!(err.phase(), "hard-stop");
    assert_eq!(ctl.stop_calls(), 1);
}

/// Hard stop erroring on a VM that already reports stopped is still done.
#[tokio::test(start_paused = true)]
async fn test_failed_hard_stop_on_stopped_vm_is_done() {
    let (vm, ctl) = machine(MockBehavior {
        fail_stop: true,
        stopped_despite_stop_error: true,
        ..MockBehavior::default()
    });
    let (tx, rx) = mpsc::unbounded_channel();
    tx.send(TerminationSignal::Terminate).unwrap();

    let outcome = Supervisor::new(vm).run(rx).await.unwrap();
    assert!(matches!(outcome.path, StopPath::Forced(_)));
    assert_eq!(ctl.stop_calls(), 1);
}

/// A declined request goes straight to hard stop, without waiting.
#[tokio::test(start_paused = true)]
async fn test_refused_request_skips_timeout() {
    let (vm, ctl) = machine(MockBehavior {
        refuse_stop: true,
        ..MockBehavior::default()
    });
    let (tx, rx) = mpsc::unbounded_channel();
    tx.send(TerminationSignal::Interrupt).unwrap();

    let started = tokio::time::Instant::now();
    let outcome = Supervisor::new(vm).run(rx).await.unwrap();
    assert_eq!(outcome.path, StopPath::Forced(HardStopReason::Refused));
    assert!(started.elapsed() < DEFAULT_STOP_TIMEOUT);
    assert_eq!(ctl.request_stop_calls(), 1);
    assert_eq!(ctl.stop_calls(), 1);
}

/// A failing request carries its detail into the hard-stop reason.
#[tokio::test(start_paused = true)]
async fn test_request_error_escalates_with_detail() {
    let (vm, ctl) = machine(MockBehavior {
        fail_request_stop: true,
        ..MockBehavior::default()
    });
    let (tx, rx) = mpsc::unbounded_channel();
    tx.send(TerminationSignal::Interrupt).unwrap();

    let outcome = Supervisor::new(vm).run(rx).await.unwrap();
    match outcome.path {
        StopPath::Forced(HardStopReason::RequestFailed(detail)) => {
            assert!(detail.contains("mock request stop failure"))
        }
        other => panic!("unexpected stop path: {:?}", other),
    }
    assert_eq!(ctl.stop_calls(), 1);
}

// =============================================================================
// FAILURES
// =============================================================================

/// A VM that fails to start is never asked to stop.
#[tokio::test]
async fn test_start_failure_touches_nothing_else() {
    let (vm, ctl) = machine(MockBehavior {
        fail_start: true,
        ..MockBehavior::default()
    });
    let (tx, rx) = mpsc::unbounded_channel();
    tx.send(TerminationSignal::Interrupt).unwrap();

    let err = Supervisor::new(vm).run(rx).await.unwrap_err();
    assert!(matches!(err, SupervisorError::Start(_)));
    assert_eq!(ctl.request_stop_calls(), 0);
    assert_eq!(ctl.stop_calls(), 0);
}

/// An error state during a graceful stop fails the run.
#[tokio::test]
async fn test_error_while_stopping_fails() {
    let (vm, ctl) = machine(MockBehavior::default());
    let (tx, rx) = mpsc::unbounded_channel();

    let supervisor = Supervisor::new(vm).with_stop_timeout(Duration::from_secs(60));
    let task = tokio::spawn(supervisor.run(rx));
    wait_for_state(&ctl, VmState::Running).await;
    tx.send(TerminationSignal::Terminate).unwrap();
    wait_for_state(&ctl, VmState::Stopping).await;
    ctl.set_state(VmState::Error);

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, SupervisorError::Guest));
    assert_eq!(ctl.stop_calls(), 0);
}
