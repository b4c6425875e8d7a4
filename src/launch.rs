//! Launch orchestration.
//!
//! Config → broker session → VM spec → VM → supervisor → release. The
//! session is released on every path once it has been opened, and the
//! console is restored before the session is released.

use std::time::Duration;

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vmnet_broker::{BrokerClient, BrokerSession, LeaseMode, Transport};

use crate::config::VmConfig;
use crate::console::RawConsole;
use crate::signals::TerminationSignal;
use crate::supervisor::{Outcome, Supervisor, SupervisorError, DEFAULT_STOP_TIMEOUT};
use crate::vm::Hypervisor;
use crate::Result;

/// Options for one launch, usually from the command line.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// VM name, used for logs.
    pub name: String,
    /// Overrides the config's network.
    pub network: Option<String>,
    pub lease: LeaseMode,
    pub stop_timeout: Duration,
    /// Put the host terminal in raw mode while the VM runs.
    pub raw_console: bool,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            network: None,
            lease: LeaseMode::default(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            raw_console: true,
        }
    }
}

/// Run one VM to completion on the given broker and hypervisor.
pub async fn launch<T, H>(
    client: &BrokerClient<T>,
    hypervisor: &H,
    config: &VmConfig,
    options: &LaunchOptions,
    signals: mpsc::UnboundedReceiver<TerminationSignal>,
) -> Result<Outcome>
where
    T: Transport,
    H: Hypervisor<Descriptor = T::Descriptor>,
{
    let network = options.network.as_deref().unwrap_or(&config.network);
    let session = blocking(|| client.open(network, options.lease))?;

    let result = run_session(&session, hypervisor, config, options, signals).await;

    session.release();
    result
}

async fn run_session<D, H>(
    session: &BrokerSession<'_, D>,
    hypervisor: &H,
    config: &VmConfig,
    options: &LaunchOptions,
    signals: mpsc::UnboundedReceiver<TerminationSignal>,
) -> Result<Outcome>
where
    H: Hypervisor<Descriptor = D>,
{
    let spec = config.to_spec(&options.name, session.raw())?;
    let vm = hypervisor.create(&spec)?;

    let console = if options.raw_console {
        RawConsole::enter_if_terminal(std::io::stdin())?
    } else {
        None
    };

    let result = Supervisor::new(vm)
        .with_stop_timeout(options.stop_timeout)
        .run(signals)
        .await;

    let restored = match console {
        Some(console) => console.restore(),
        None => Ok(()),
    };

    let outcome = finish(result, restored)?;
    info!(path = ?outcome.path, "VM '{}' finished", options.name);
    Ok(outcome)
}

/// The lifecycle result wins over a console restore failure.
fn finish(
    result: std::result::Result<Outcome, SupervisorError>,
    restored: Result<()>,
) -> Result<Outcome> {
    match (result, restored) {
        (Ok(outcome), Ok(())) => Ok(outcome),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(())) => Err(err.into()),
        (Err(err), Err(console)) => {
            warn!("{}", console);
            Err(err.into())
        }
    }
}

/// Run a blocking broker round trip without stalling the other tasks on
/// this worker. Current-thread runtimes cannot hand the worker off.
fn blocking<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(f),
        _ => f(),
    }
}

/// Launch on this host's broker and hypervisor.
#[cfg(target_os = "macos")]
pub async fn launch_on_host(config: &VmConfig, options: &LaunchOptions) -> Result<Outcome> {
    use crate::backend::vz::VzHypervisor;
    use vmnet_broker::XpcTransport;

    let signals = crate::signals::listen()?;
    let client = BrokerClient::new(XpcTransport::new());
    let hypervisor = VzHypervisor::new();
    debug!("Launching on Virtualization.framework");
    launch(&client, &hypervisor, config, options, signals).await
}

/// Launch on this host's broker and hypervisor.
#[cfg(not(target_os = "macos"))]
pub async fn launch_on_host(_config: &VmConfig, _options: &LaunchOptions) -> Result<Outcome> {
    debug!("No hypervisor backend for this host");
    Err(crate::Error::Unsupported(
        "vmnet-launcher requires macOS (Virtualization.framework and vmnet-broker)".into(),
    ))
}
