//! Termination signal delivery.
//!
//! The supervisor consumes signals as events from a channel rather than
//! through a process-wide handler:
//!
//! - `SIGINT` (Ctrl-C in the terminal)
//! - `SIGTERM` (default kill signal)
//!
//! Every delivery is forwarded, so a second Ctrl-C reaches the supervisor
//! too; what it does with it is up to the supervisor.

use std::fmt;

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationSignal::Interrupt => f.write_str("SIGINT"),
            TerminationSignal::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Install listeners for `SIGINT` and `SIGTERM` and forward each delivery
/// into the returned channel.
///
/// Must be called from within a tokio runtime. Returns `Err` if signal
/// registration fails. The forwarding task ends when the receiver is
/// dropped.
#[cfg(unix)]
pub fn listen() -> std::io::Result<mpsc::UnboundedReceiver<TerminationSignal>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let signal = tokio::select! {
                Some(()) = sigint.recv() => TerminationSignal::Interrupt,
                Some(()) = sigterm.recv() => TerminationSignal::Terminate,
                _ = tx.closed() => break,
                else => break,
            };
            if tx.send(signal).is_err() {
                break;
            }
        }
    });

    Ok(rx)
}

/// Forward Ctrl-C deliveries into the returned channel.
#[cfg(not(unix))]
pub fn listen() -> std::io::Result<mpsc::UnboundedReceiver<TerminationSignal>> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(TerminationSignal::Interrupt).is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names() {
        assert_eq!(TerminationSignal::Interrupt.to_string(), "SIGINT");
        assert_eq!(TerminationSignal::Terminate.to_string(), "SIGTERM");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn forwards_sigterm() {
        let mut rx = listen().unwrap();
        unsafe {
            libc::kill(libc::getpid(), libc::SIGTERM);
        }
        let signal = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(signal, Some(TerminationSignal::Terminate));
    }
}
