//! Hypervisor backends.
//!
//! Platform-specific backends:
//! - **macOS**: [`VzHypervisor`](vz::VzHypervisor), Apple Virtualization.framework
//!
//! Other hosts have no backend; [`crate::vm::mock`] stands in for tests.

pub mod vmnet;

#[cfg(target_os = "macos")]
pub mod vz;
