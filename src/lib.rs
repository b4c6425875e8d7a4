//! vmnet-launcher: run one Linux VM on a vmnet-broker network
//!
//! The launcher acquires a shared network from `vmnet-broker`, builds a
//! Virtualization.framework VM attached to it, and supervises the VM until
//! it stops. `SIGINT`/`SIGTERM` ask the guest to shut down; if it declines,
//! fails, or takes too long, the VM is stopped hard.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use vmnet_launcher::config::load_config;
//! use vmnet_launcher::launch::{launch_on_host, LaunchOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = load_config(Path::new(".vms/ubuntu/config.json"))?;
//!     let options = LaunchOptions {
//!         name: "ubuntu".into(),
//!         ..LaunchOptions::default()
//!     };
//!
//!     let outcome = launch_on_host(&config, &options).await?;
//!     println!("stopped: {:?}", outcome.path);
//!     Ok(())
//! }
//! ```
//!
//! The pieces are usable on their own: [`supervisor::Supervisor`] drives
//! any [`vm::VirtualMachine`], and [`launch::launch`] accepts any broker
//! transport and [`vm::Hypervisor`], which is how the tests run without
//! macOS.

pub mod backend;
pub mod config;
pub mod console;
pub mod error;
pub mod launch;
pub mod signals;
pub mod supervisor;
pub mod vm;

pub use error::{Error, Result};
pub use supervisor::{Outcome, StopPath, Supervisor};
pub use vm::{Hypervisor, VirtualMachine, VmState};
