//! Wire contract between clients and the vmnet-broker service.
//!
//! ## Request
//!
//! A dictionary with two string keys:
//!
//! | key            | value                         |
//! |----------------|-------------------------------|
//! | `command`      | `"get"` or `"acquire"`        |
//! | `network_name` | name of a configured network  |
//!
//! ## Reply
//!
//! A dictionary with exactly one of:
//!
//! - `network`: the serialized network, consumed by the hypervisor.
//! - `error`: a status code (see [`crate::status`]). Older brokers send a
//!   nested dictionary with `code` and `message` keys instead of a bare
//!   integer; transports accept both.

use tracing::warn;

use crate::status::{BrokerError, SUCCESS};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// The broker's Mach service name.
pub const MACH_SERVICE_NAME: &str = "com.github.nirs.vmnet-broker";

pub const REQUEST_COMMAND: &str = "command";
pub const REQUEST_NETWORK_NAME: &str = "network_name";

pub const REPLY_NETWORK: &str = "network";
pub const REPLY_ERROR: &str = "error";

pub const ERROR_CODE: &str = "code";
pub const ERROR_MESSAGE: &str = "message";

/// Longest network name the broker accepts, in bytes.
pub const MAX_NETWORK_NAME_LEN: usize = 255;

/// Network served when the caller does not name one.
pub const DEFAULT_NETWORK: &str = "shared";

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Broker command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Session-scoped network, valid while this process keeps its connection.
    Get,
    /// Shared lease on a named network, instantiated on first use.
    Acquire,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Get => "get",
            Command::Acquire => "acquire",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "get" => Some(Command::Get),
            "acquire" => Some(Command::Acquire),
            _ => None,
        }
    }
}

/// A single request to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRequest {
    pub command: Command,
    pub network_name: String,
}

impl BrokerRequest {
    pub fn new(command: Command, network_name: impl Into<String>) -> Self {
        Self {
            command,
            network_name: network_name.into(),
        }
    }
}

/// Check a network name before it is put on the wire.
///
/// Names must be non-empty, at most [`MAX_NETWORK_NAME_LEN`] bytes, and free
/// of NUL and other control characters (the name travels as a C string).
pub fn validate_network_name(name: &str) -> Result<(), BrokerError> {
    if name.is_empty()
        || name.len() > MAX_NETWORK_NAME_LEN
        || name.chars().any(char::is_control)
    {
        return Err(BrokerError::InvalidRequest);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Reply
// ---------------------------------------------------------------------------

/// A reply as decoded by a transport.
///
/// Transports only classify what came back; mapping to a status is done by
/// [`Reply::into_result`] so every transport reports failures the same way.
#[derive(Debug)]
pub enum Reply<D> {
    /// The `network` key was present.
    Network(D),
    /// The `error` key carried this raw value.
    Status(i64),
    /// The message never reached the broker, or the connection failed.
    Transport(String),
    /// The reply was not a dictionary, or lacked both keys.
    Malformed(String),
}

impl<D> Reply<D> {
    pub fn into_result(self) -> Result<D, BrokerError> {
        match self {
            Reply::Network(descriptor) => Ok(descriptor),
            Reply::Status(raw) => Err(decode_status(raw)),
            Reply::Transport(reason) => {
                warn!("failed to send message to broker: {}", reason);
                Err(BrokerError::XpcFailure)
            }
            Reply::Malformed(reason) => {
                warn!("broker returned invalid reply: {}", reason);
                Err(BrokerError::InvalidReply)
            }
        }
    }
}

/// Map the raw `error` field of a reply to a status.
///
/// A success code or a value outside the `u32` range cannot be an error
/// status, so the reply itself is invalid.
pub fn decode_status(raw: i64) -> BrokerError {
    match u32::try_from(raw) {
        Ok(SUCCESS) | Err(_) => {
            warn!("broker returned invalid status {}", raw);
            BrokerError::InvalidReply
        }
        Ok(code) => BrokerError::from_code(code),
    }
}
