use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use vmnet_broker::LeaseMode;

use vmnet_launcher::config::{load_config, resolve_config_path, DEFAULT_VMS_DIR};
use vmnet_launcher::launch::{launch_on_host, LaunchOptions};
use vmnet_launcher::{Outcome, Result};

/// Run a Linux VM attached to a vmnet-broker network.
#[derive(Debug, Parser)]
#[command(name = "vmnet-launcher", version, about)]
struct Args {
    /// VM name (looked up under --vms-dir) or path to a config file
    vm: String,

    /// Network to attach to, overriding the config
    #[arg(long, env = "VMNET_LAUNCHER_NETWORK")]
    network: Option<String>,

    /// Use a session network instead of a shared lease
    #[arg(long)]
    session: bool,

    /// How long to wait for the guest to stop before stopping it hard
    #[arg(
        long,
        default_value = "10s",
        value_parser = humantime::parse_duration,
        env = "VMNET_LAUNCHER_STOP_TIMEOUT"
    )]
    stop_timeout: Duration,

    /// Keep the terminal in cooked mode
    #[arg(long)]
    no_raw: bool,

    /// Directory holding named VMs
    #[arg(long, default_value = DEFAULT_VMS_DIR, env = "VMNET_LAUNCHER_VMS_DIR")]
    vms_dir: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(outcome) => {
            info!(path = ?outcome.path, "VM stopped");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(phase = err.phase(), "{}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<Outcome> {
    let path = resolve_config_path(&args.vm, &args.vms_dir);
    let config = load_config(&path)?;
    info!("Loaded config from {}", path.display());

    let options = LaunchOptions {
        name: args.vm,
        network: args.network,
        lease: if args.session {
            LeaseMode::Session
        } else {
            LeaseMode::Shared
        },
        stop_timeout: args.stop_timeout,
        raw_console: !args.no_raw,
    };
    launch_on_host(&config, &options).await
}
