//! vmnet status codes and network objects.
//!
//! The broker hands out a serialized network; on macOS it is turned back
//! into a live `vmnet_network_ref` here before being attached to the VM.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// `vmnet_return_t` values.
pub const VMNET_SUCCESS: u32 = 1000;
pub const VMNET_FAILURE: u32 = 1001;
pub const VMNET_MEM_FAILURE: u32 = 1002;
pub const VMNET_INVALID_ARGUMENT: u32 = 1003;
pub const VMNET_SETUP_INCOMPLETE: u32 = 1004;
pub const VMNET_INVALID_ACCESS: u32 = 1005;
pub const VMNET_PACKET_TOO_BIG: u32 = 1006;
pub const VMNET_BUFFER_EXHAUSTED: u32 = 1007;
pub const VMNET_TOO_MANY_PACKETS: u32 = 1008;
pub const VMNET_SHARING_SERVICE_BUSY: u32 = 1009;
pub const VMNET_NOT_AUTHORIZED: u32 = 1010;

/// Symbolic name of a vmnet status, for diagnostics.
pub fn vmnet_strerror(status: u32) -> &'static str {
    match status {
        VMNET_SUCCESS => "VMNET_SUCCESS",
        VMNET_FAILURE => "VMNET_FAILURE",
        VMNET_MEM_FAILURE => "VMNET_MEM_FAILURE",
        VMNET_INVALID_ARGUMENT => "VMNET_INVALID_ARGUMENT",
        VMNET_SETUP_INCOMPLETE => "VMNET_SETUP_INCOMPLETE",
        VMNET_INVALID_ACCESS => "VMNET_INVALID_ACCESS",
        VMNET_PACKET_TOO_BIG => "VMNET_PACKET_TOO_BIG",
        VMNET_BUFFER_EXHAUSTED => "VMNET_BUFFER_EXHAUSTED",
        VMNET_TOO_MANY_PACKETS => "VMNET_TOO_MANY_PACKETS",
        VMNET_SHARING_SERVICE_BUSY => "VMNET_SHARING_SERVICE_BUSY",
        VMNET_NOT_AUTHORIZED => "VMNET_NOT_AUTHORIZED",
        _ => "(unknown status)",
    }
}

/// Addressing of a vmnet network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkInfo {
    pub subnet: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub ipv6_prefix: Ipv6Addr,
    pub ipv6_prefix_len: u8,
}

impl NetworkInfo {
    /// From `in_addr`/`in6_addr` contents, which are in network byte order.
    pub fn from_raw(subnet: [u8; 4], mask: [u8; 4], ipv6_prefix: [u8; 16], prefix_len: u8) -> Self {
        Self {
            subnet: Ipv4Addr::from(subnet),
            mask: Ipv4Addr::from(mask),
            ipv6_prefix: Ipv6Addr::from(ipv6_prefix),
            ipv6_prefix_len: prefix_len,
        }
    }
}

impl fmt::Display for NetworkInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "subnet {} mask {} ipv6 prefix {}/{}",
            self.subnet, self.mask, self.ipv6_prefix, self.ipv6_prefix_len
        )
    }
}

#[cfg(target_os = "macos")]
pub use network::VmnetNetwork;

#[cfg(target_os = "macos")]
mod network {
    use std::ffi::c_void;
    use std::ptr::NonNull;

    use vmnet_broker::xpc::{xpc_object_t, XpcObject};

    use tracing::info;

    use super::{vmnet_strerror, NetworkInfo, VMNET_SUCCESS};
    use crate::{Error, Result};

    #[repr(C)]
    struct InAddr {
        s_addr: u32,
    }

    #[repr(C, align(4))]
    struct In6Addr {
        s6_addr: [u8; 16],
    }

    #[link(name = "vmnet", kind = "framework")]
    extern "C" {
        fn vmnet_network_create_with_serialization(
            serialization: xpc_object_t,
            status: *mut u32,
        ) -> *mut c_void;
        fn vmnet_network_get_ipv4_subnet(
            network: *mut c_void,
            subnet: *mut InAddr,
            mask: *mut InAddr,
        );
        fn vmnet_network_get_ipv6_prefix(
            network: *mut c_void,
            prefix: *mut In6Addr,
            prefix_len: *mut u8,
        );
    }

    #[link(name = "CoreFoundation", kind = "framework")]
    extern "C" {
        fn CFRelease(cf: *const c_void);
    }

    /// Owned `vmnet_network_ref`, released on drop.
    pub struct VmnetNetwork(NonNull<c_void>);

    // The network is an immutable CoreFoundation object; retain/release are
    // thread-safe.
    unsafe impl Send for VmnetNetwork {}
    unsafe impl Sync for VmnetNetwork {}

    impl VmnetNetwork {
        /// Recreate a network from the broker's serialization.
        pub fn from_serialization(serialization: &XpcObject) -> Result<Self> {
            let mut status = VMNET_SUCCESS;
            let raw = unsafe {
                vmnet_network_create_with_serialization(serialization.as_raw(), &mut status)
            };
            match NonNull::new(raw) {
                Some(ptr) if status == VMNET_SUCCESS => {
                    let network = Self(ptr);
                    info!("Attached network: {}", network.info());
                    Ok(network)
                }
                Some(ptr) => {
                    unsafe { CFRelease(ptr.as_ptr()) };
                    Err(network_error(status))
                }
                None => Err(network_error(status)),
            }
        }

        pub fn as_ptr(&self) -> *mut c_void {
            self.0.as_ptr()
        }

        pub fn info(&self) -> NetworkInfo {
            let mut subnet = InAddr { s_addr: 0 };
            let mut mask = InAddr { s_addr: 0 };
            let mut prefix = In6Addr { s6_addr: [0; 16] };
            let mut prefix_len = 0u8;
            unsafe {
                vmnet_network_get_ipv4_subnet(self.as_ptr(), &mut subnet, &mut mask);
                vmnet_network_get_ipv6_prefix(self.as_ptr(), &mut prefix, &mut prefix_len);
            }
            NetworkInfo::from_raw(
                subnet.s_addr.to_ne_bytes(),
                mask.s_addr.to_ne_bytes(),
                prefix.s6_addr,
                prefix_len,
            )
        }
    }

    fn network_error(status: u32) -> Error {
        Error::Hypervisor(format!(
            "failed to create network from serialization: ({}) {}",
            status,
            vmnet_strerror(status)
        ))
    }

    impl Drop for VmnetNetwork {
        fn drop(&mut self) {
            unsafe { CFRelease(self.0.as_ptr()) };
        }
    }
}
