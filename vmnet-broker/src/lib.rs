//! Client for the vmnet-broker service.
//!
//! vmnet-broker is a privileged launchd daemon that owns shared vmnet
//! networks. Unprivileged processes ask it for a network by name and get
//! back a serialized network that Virtualization.framework can attach a VM
//! to.
//!
//! ```no_run
//! # #[cfg(target_os = "macos")]
//! # fn main() -> Result<(), vmnet_broker::BrokerError> {
//! use vmnet_broker::{BrokerClient, XpcTransport};
//!
//! let client = BrokerClient::new(XpcTransport::new());
//! let session = client.acquire_network("shared")?;
//! let serialization = session.raw();
//! // ... create the VM network attachment from `serialization` ...
//! # let _ = serialization;
//! session.release();
//! # Ok(())
//! # }
//! # #[cfg(not(target_os = "macos"))]
//! # fn main() {}
//! ```
//!
//! The crate is split into:
//!
//! - [`status`]: the broker's status codes and their fixed messages
//! - [`protocol`]: request/reply keys and reply classification
//! - [`client`]: [`BrokerClient`] and [`BrokerSession`] over a [`Transport`]
//! - [`memory`]: an in-process broker implementing the same contract, with
//!   one [`MemoryConnection`] per client
//! - `xpc` (macOS): the real transport

pub mod client;
pub mod memory;
pub mod protocol;
pub mod status;

#[cfg(target_os = "macos")]
pub mod xpc;

pub use client::{BrokerClient, BrokerSession, LeaseMode, Transport};
pub use memory::{MemoryBroker, MemoryConnection, MemoryNetwork};
pub use protocol::{BrokerRequest, Command, Reply, DEFAULT_NETWORK};
pub use status::BrokerError;

#[cfg(target_os = "macos")]
pub use xpc::{XpcObject, XpcTransport};
