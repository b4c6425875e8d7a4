//! Error types for vmnet-launcher

use thiserror::Error;

use crate::supervisor::SupervisorError;

/// Result type alias using vmnet-launcher Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while launching a VM
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Broker protocol errors
    #[error("Broker error: ({}) {}", .0.code(), .0.message())]
    Broker(#[from] vmnet_broker::BrokerError),

    /// Hypervisor construction or validation errors
    #[error("Hypervisor error: {0}")]
    Hypervisor(String),

    /// Console (terminal mode) errors
    #[error("Console error: {0}")]
    Console(String),

    /// Lifecycle errors once the VM exists
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The host cannot run this VM at all
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Phase that failed, for the single diagnostic printed on exit.
    pub fn phase(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Broker(_) => "broker",
            Error::Hypervisor(_) | Error::Unsupported(_) => "hypervisor",
            Error::Console(_) => "console",
            Error::Supervisor(err) => err.phase(),
            Error::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmnet_broker::BrokerError;

    #[test]
    fn broker_error_keeps_status() {
        let err = Error::from(BrokerError::NotFound);
        assert_eq!(err.to_string(), "Broker error: (5) Network name not found");
        assert_eq!(err.phase(), "broker");
    }

    #[test]
    fn phases() {
        assert_eq!(Error::Config("x".into()).phase(), "config");
        assert_eq!(Error::Hypervisor("x".into()).phase(), "hypervisor");
        assert_eq!(Error::Unsupported("x".into()).phase(), "hypervisor");
    }
}
