//! In-process broker for tests and for development on hosts without XPC.
//!
//! [`MemoryBroker`] follows the broker's contract: only configured networks
//! are served, a network is instantiated on its first request and shared by
//! later ones, and it is torn down when its last lease ends. A lease ends when
//! its descriptor is dropped or when the [`MemoryConnection`] that obtained
//! it closes, as the broker does when a client process exits.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::client::Transport;
use crate::protocol::{validate_network_name, BrokerRequest, Reply};
use crate::BrokerError;

/// Networks every broker ships with.
pub const BUILTIN_NETWORKS: [&str; 2] = ["shared", "host"];

#[derive(Default)]
struct Registry {
    configured: HashSet<String>,
    denied: HashSet<String>,
    instances: HashMap<String, Instance>,
    leases: HashMap<u64, Lease>,
    next_id: u64,
    fail_status: Option<i64>,
    disconnected: bool,
    requests: usize,
}

struct Instance {
    id: u64,
    holds: usize,
}

struct Lease {
    connection: u64,
    network: String,
    instance_id: u64,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn end_lease(&mut self, lease_id: u64) {
        let Some(lease) = self.leases.remove(&lease_id) else {
            return;
        };
        let remove = match self.instances.get_mut(&lease.network) {
            Some(instance) if instance.id == lease.instance_id => {
                instance.holds = instance.holds.saturating_sub(1);
                instance.holds == 0
            }
            _ => false,
        };
        if remove {
            self.instances.remove(&lease.network);
            info!(network = %lease.network, instance = lease.instance_id, "deleted network");
        }
    }

    fn close_connection(&mut self, connection: u64) {
        let leases: Vec<u64> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        if !leases.is_empty() {
            debug!(connection, leases = leases.len(), "connection closed with leases");
        }
        for lease_id in leases {
            self.end_lease(lease_id);
        }
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An in-memory broker.
///
/// Clients talk to it through a [`MemoryConnection`] from
/// [`connect`](Self::connect); the broker handle itself is for setup and
/// inspection.
#[derive(Clone)]
pub struct MemoryBroker {
    registry: Arc<Mutex<Registry>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Broker serving the [`BUILTIN_NETWORKS`].
    pub fn new() -> Self {
        Self::with_networks(BUILTIN_NETWORKS)
    }

    pub fn with_networks<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Registry {
            configured: names.into_iter().map(Into::into).collect(),
            next_id: 1,
            ..Registry::default()
        };
        Self {
            registry: Arc::new(Mutex::new(registry)),
        }
    }

    /// Open a client connection.
    pub fn connect(&self) -> MemoryConnection {
        let id = lock(&self.registry).next_id();
        MemoryConnection {
            id,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Refuse requests for `name` with `NOT_ALLOWED`.
    pub fn deny(&self, name: impl Into<String>) {
        lock(&self.registry).denied.insert(name.into());
    }

    /// Answer every request with this raw status until cleared.
    pub fn fail_with_status(&self, status: Option<i64>) {
        lock(&self.registry).fail_status = status;
    }

    /// Simulate an unreachable broker.
    pub fn set_disconnected(&self, disconnected: bool) {
        lock(&self.registry).disconnected = disconnected;
    }

    /// Number of live leases on `name`.
    pub fn holds(&self, name: &str) -> usize {
        lock(&self.registry)
            .instances
            .get(name)
            .map_or(0, |instance| instance.holds)
    }

    pub fn is_instantiated(&self, name: &str) -> bool {
        lock(&self.registry).instances.contains_key(name)
    }

    /// Requests received so far, including failed ones.
    pub fn request_count(&self) -> usize {
        lock(&self.registry).requests
    }
}

/// A client's connection to a [`MemoryBroker`].
///
/// Dropping it ends every lease obtained through it.
pub struct MemoryConnection {
    id: u64,
    registry: Arc<Mutex<Registry>>,
}

impl Transport for MemoryConnection {
    type Descriptor = MemoryNetwork;

    fn round_trip(&self, request: &BrokerRequest) -> Reply<MemoryNetwork> {
        let mut registry = lock(&self.registry);
        registry.requests += 1;

        if registry.disconnected {
            return Reply::Transport("Connection invalid".into());
        }
        if let Some(status) = registry.fail_status {
            return Reply::Status(status);
        }

        let name = request.network_name.as_str();
        if let Err(err) = validate_network_name(name) {
            return Reply::Status(i64::from(err.code()));
        }
        if registry.denied.contains(name) {
            return Reply::Status(i64::from(BrokerError::NotAllowed.code()));
        }
        if !registry.configured.contains(name) {
            debug!(network = name, "network not found");
            return Reply::Status(i64::from(BrokerError::NotFound.code()));
        }

        let existing = registry.instances.get_mut(name).map(|instance| {
            instance.holds += 1;
            instance.id
        });
        let instance_id = match existing {
            Some(id) => id,
            None => {
                let id = registry.next_id();
                info!(network = name, instance = id, "created network");
                registry
                    .instances
                    .insert(name.to_string(), Instance { id, holds: 1 });
                id
            }
        };
        let lease_id = registry.next_id();
        registry.leases.insert(
            lease_id,
            Lease {
                connection: self.id,
                network: name.to_string(),
                instance_id,
            },
        );

        Reply::Network(MemoryNetwork {
            name: name.to_string(),
            instance_id,
            lease_id,
            registry: Arc::clone(&self.registry),
        })
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        lock(&self.registry).close_connection(self.id);
    }
}

/// Descriptor handed out by a [`MemoryConnection`].
pub struct MemoryNetwork {
    name: String,
    instance_id: u64,
    lease_id: u64,
    registry: Arc<Mutex<Registry>>,
}

impl MemoryNetwork {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifies the network instance; equal for descriptors that share it.
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("name", &self.name)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

impl Drop for MemoryNetwork {
    fn drop(&mut self) {
        lock(&self.registry).end_lease(self.lease_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BrokerClient;

    #[test]
    fn shared_lease_is_reference_counted() {
        let broker = MemoryBroker::new();
        let client = BrokerClient::new(broker.connect());

        let first = client.acquire_network("shared").unwrap();
        let second = client.acquire_network("shared").unwrap();
        assert_eq!(first.raw().instance_id(), second.raw().instance_id());
        assert_eq!(broker.holds("shared"), 2);

        first.release();
        assert_eq!(broker.holds("shared"), 1);
        assert!(broker.is_instantiated("shared"));

        drop(second);
        assert!(!broker.is_instantiated("shared"));
    }

    #[test]
    fn networks_are_independent() {
        let broker = MemoryBroker::new();
        let client = BrokerClient::new(broker.connect());

        let shared = client.acquire_network("shared").unwrap();
        let host = client.start_session("host").unwrap();
        assert_ne!(shared.raw().instance_id(), host.raw().instance_id());
        assert_eq!(host.raw().name(), "host");
    }

    #[test]
    fn recreated_network_gets_new_instance() {
        let broker = MemoryBroker::new();
        let client = BrokerClient::new(broker.connect());

        let first = client.acquire_network("shared").unwrap().raw().instance_id();
        let second = client.acquire_network("shared").unwrap().raw().instance_id();
        assert_ne!(first, second);
    }

    #[test]
    fn unknown_network_is_not_found() {
        let client = BrokerClient::new(MemoryBroker::new().connect());
        for result in [
            client.start_session("nope"),
            client.acquire_network("nope"),
        ] {
            let err = result.unwrap_err();
            assert_eq!(err, BrokerError::NotFound);
            assert_eq!(err.message(), "Network name not found");
        }
    }

    #[test]
    fn denied_and_failing_broker() {
        let broker = MemoryBroker::new();
        let client = BrokerClient::new(broker.connect());

        broker.deny("host");
        assert_eq!(
            client.acquire_network("host").unwrap_err(),
            BrokerError::NotAllowed
        );

        broker.fail_with_status(Some(6));
        assert_eq!(
            client.acquire_network("shared").unwrap_err(),
            BrokerError::CreateFailure
        );

        broker.fail_with_status(None);
        broker.set_disconnected(true);
        assert_eq!(
            client.acquire_network("shared").unwrap_err(),
            BrokerError::XpcFailure
        );
        assert_eq!(broker.request_count(), 3);
        assert!(!broker.is_instantiated("shared"));
    }

    #[test]
    fn closing_connection_ends_its_leases() {
        let broker = MemoryBroker::new();
        let first = BrokerClient::new(broker.connect());
        let second = BrokerClient::new(broker.connect());

        // Leaked descriptors stand in for a client that never releases.
        std::mem::forget(first.start_session("host").unwrap());
        std::mem::forget(first.acquire_network("shared").unwrap());
        let kept = second.acquire_network("shared").unwrap();
        assert_eq!(broker.holds("shared"), 2);

        drop(first);
        assert_eq!(broker.holds("host"), 0);
        assert!(!broker.is_instantiated("host"));
        assert_eq!(broker.holds("shared"), 1);

        drop(kept);
        assert!(!broker.is_instantiated("shared"));
    }
}
