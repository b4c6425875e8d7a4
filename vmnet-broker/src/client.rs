//! Broker session client.
//!
//! [`BrokerClient`] sends one request per call over a [`Transport`] and
//! wraps the returned descriptor in a [`BrokerSession`]. The session owns the
//! descriptor: it can be borrowed with [`BrokerSession::raw`] while the
//! session is alive, and [`BrokerSession::release`] consumes the session, so
//! a released descriptor can never be handed to a VM.
//!
//! The broker keeps a network only while the client's connection is open, so
//! a session also borrows the client it came from and cannot outlive it.

use std::fmt;
use std::marker::PhantomData;

use tracing::{debug, info};

use crate::protocol::{validate_network_name, BrokerRequest, Command, Reply};
use crate::status::{BrokerError, StatusDisplay};

/// A way to deliver a request to the broker and bring back its reply.
///
/// Implementations perform exactly one blocking round trip per call and
/// never retry.
pub trait Transport {
    /// Opaque serialized network returned by the broker.
    type Descriptor;

    fn round_trip(&self, request: &BrokerRequest) -> Reply<Self::Descriptor>;
}

impl<T: Transport + ?Sized> Transport for &T {
    type Descriptor = T::Descriptor;

    fn round_trip(&self, request: &BrokerRequest) -> Reply<Self::Descriptor> {
        (**self).round_trip(request)
    }
}

/// How long the broker keeps the network for us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeaseMode {
    /// Valid while this process holds its broker connection.
    Session,
    /// Reference-counted lease on a shared network, dropped by the broker
    /// when this process exits.
    #[default]
    Shared,
}

impl LeaseMode {
    pub fn command(&self) -> Command {
        match self {
            LeaseMode::Session => Command::Get,
            LeaseMode::Shared => Command::Acquire,
        }
    }
}

impl fmt::Display for LeaseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseMode::Session => f.write_str("session"),
            LeaseMode::Shared => f.write_str("shared"),
        }
    }
}

/// Client for the vmnet-broker service.
pub struct BrokerClient<T> {
    transport: T,
}

impl<T: Transport> BrokerClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Get a session-scoped network.
    ///
    /// The descriptor stays valid while this client's connection is open.
    pub fn start_session(
        &self,
        network_name: &str,
    ) -> Result<BrokerSession<'_, T::Descriptor>, BrokerError> {
        self.open(network_name, LeaseMode::Session)
    }

    /// Acquire a shared lease on a configured network, instantiating it if
    /// needed.
    ///
    /// The broker keeps the network alive while at least one process holds
    /// a lease; ours is dropped when this process terminates.
    pub fn acquire_network(
        &self,
        network_name: &str,
    ) -> Result<BrokerSession<'_, T::Descriptor>, BrokerError> {
        self.open(network_name, LeaseMode::Shared)
    }

    /// Request `network_name` with the given lease mode.
    pub fn open(
        &self,
        network_name: &str,
        mode: LeaseMode,
    ) -> Result<BrokerSession<'_, T::Descriptor>, BrokerError> {
        validate_network_name(network_name)?;

        let request = BrokerRequest::new(mode.command(), network_name);
        debug!(
            network = network_name,
            command = request.command.as_str(),
            "sending broker request"
        );

        match self.transport.round_trip(&request).into_result() {
            Ok(descriptor) => {
                info!(network = network_name, mode = %mode, "acquired network from broker");
                Ok(BrokerSession {
                    network_name: network_name.to_string(),
                    mode,
                    descriptor,
                    _client: PhantomData,
                })
            }
            Err(err) => {
                debug!(
                    network = network_name,
                    status = %StatusDisplay(err),
                    "broker request failed"
                );
                Err(err)
            }
        }
    }
}

/// A network handed out by the broker.
///
/// Dropping the session releases the descriptor; [`release`](Self::release)
/// does the same explicitly at a chosen point. The broker itself drops its
/// hold when the client's connection closes, which the borrow on the client
/// orders after the session:
///
/// ```compile_fail
/// use vmnet_broker::{BrokerClient, MemoryBroker};
///
/// let broker = MemoryBroker::new();
/// let session = {
///     let client = BrokerClient::new(broker.connect());
///     client.start_session("shared").unwrap()
/// };
/// println!("{:?}", session.raw());
/// ```
pub struct BrokerSession<'c, D> {
    network_name: String,
    mode: LeaseMode,
    descriptor: D,
    _client: PhantomData<&'c ()>,
}

impl<D> BrokerSession<'_, D> {
    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    pub fn mode(&self) -> LeaseMode {
        self.mode
    }

    /// Borrow the serialized network for the hypervisor's network attachment.
    pub fn raw(&self) -> &D {
        &self.descriptor
    }

    /// Release the descriptor.
    ///
    /// Over XPC this drops our reference to the serialization; the broker
    /// counts the lease until the client's connection closes.
    pub fn release(self) {
        drop(self);
    }
}

impl<D> Drop for BrokerSession<'_, D> {
    fn drop(&mut self) {
        debug!(network = %self.network_name, mode = %self.mode, "releasing broker session");
    }
}

impl<D> fmt::Debug for BrokerSession<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSession")
            .field("network_name", &self.network_name)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
