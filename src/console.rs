//! Host terminal mode for the guest serial console.
//!
//! The guest's console is wired to stdin/stdout. Line buffering, echo and
//! CR-to-NL translation are turned off for the duration of the run so
//! keystrokes reach the guest unchanged, and the saved mode is restored
//! afterwards.

use std::os::fd::AsFd;

use rustix::termios::{self, InputModes, LocalModes, OptionalActions, Termios};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Terminal mode captured before entering raw mode.
#[derive(Debug, Clone)]
pub struct SavedMode(Termios);

/// Switch `fd` to raw-ish mode and return the previous mode.
///
/// Clears `ICRNL` on input, and `ICANON` and `ECHO` on the local modes.
/// The change is applied immediately.
pub fn enter_raw_mode<Fd: AsFd>(fd: Fd) -> std::io::Result<SavedMode> {
    let original = termios::tcgetattr(&fd)?;
    let raw = raw_termios(&original);
    termios::tcsetattr(&fd, OptionalActions::Now, &raw)?;
    Ok(SavedMode(original))
}

/// Restore a previously saved mode, discarding unread input.
pub fn restore_mode<Fd: AsFd>(fd: Fd, saved: &SavedMode) -> std::io::Result<()> {
    termios::tcsetattr(&fd, OptionalActions::Flush, &saved.0)?;
    Ok(())
}

fn raw_termios(original: &Termios) -> Termios {
    let mut raw = original.clone();
    raw.input_modes.remove(InputModes::ICRNL);
    raw.local_modes.remove(LocalModes::ICANON | LocalModes::ECHO);
    raw
}

/// Raw mode scoped to a value. Dropping it restores the terminal.
pub struct RawConsole<Fd: AsFd> {
    fd: Fd,
    saved: Option<SavedMode>,
}

impl<Fd: AsFd> RawConsole<Fd> {
    pub fn enter(fd: Fd) -> Result<Self> {
        let saved = enter_raw_mode(&fd)
            .map_err(|e| Error::Console(format!("failed to enter raw mode: {}", e)))?;
        debug!("Console in raw mode");
        Ok(Self {
            fd,
            saved: Some(saved),
        })
    }

    /// Like [`RawConsole::enter`], but leaves non-terminals alone.
    pub fn enter_if_terminal(fd: Fd) -> Result<Option<Self>> {
        if !termios::isatty(&fd) {
            debug!("Console is not a terminal, keeping mode");
            return Ok(None);
        }
        Self::enter(fd).map(Some)
    }

    /// Restore the saved mode, reporting failure.
    pub fn restore(mut self) -> Result<()> {
        match self.saved.take() {
            Some(saved) => restore_mode(&self.fd, &saved)
                .map_err(|e| Error::Console(format!("failed to restore terminal mode: {}", e))),
            None => Ok(()),
        }
    }
}

impl<Fd: AsFd> Drop for RawConsole<Fd> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            if let Err(e) = restore_mode(&self.fd, &saved) {
                warn!("Failed to restore terminal mode: {}", e);
            }
        }
    }
}
