//! macOS Virtualization.framework backend.
//!
//! ## Architecture
//!
//! - **Boot**: `VZLinuxBootLoader` with kernel, optional initrd, and cmdline
//! - **Disks**: one `VZVirtioBlockDeviceConfiguration` per configured disk
//! - **Networking**: `VZVmnetNetworkDeviceAttachment` on the network the
//!   broker handed out
//! - **Console**: virtio console serial port on stdin/stdout

pub mod config;
mod machine;

pub use machine::{VzHypervisor, VzMachine, STATE_POLL_INTERVAL};
