//! Mapping from [`VmSpec`] to a `VZVirtualMachineConfiguration`.
//!
//! The VM gets a Linux boot loader, one virtio block device per disk (in
//! config order), one virtio network device attached to the broker's vmnet
//! network, and a virtio console on the host's stdin/stdout.

use std::path::Path;

use objc2::rc::{Allocated, Retained};
use objc2::runtime::{AnyClass, AnyObject};
use objc2::{msg_send, AnyThread};
use objc2_foundation::{NSArray, NSFileHandle, NSString, NSURL};
use objc2_virtualization::*;
use tracing::debug;
use vmnet_broker::XpcObject;

use crate::backend::vmnet::VmnetNetwork;
use crate::config::{DiskConfig, VmSpec};
use crate::{Error, Result};

/// Build and validate the configuration.
///
/// `network` must outlive the VM built from the configuration.
pub fn build_configuration(
    spec: &VmSpec<'_, XpcObject>,
    network: &VmnetNetwork,
) -> Result<Retained<VZVirtualMachineConfiguration>> {
    check_limits(spec.cpus, spec.memory_bytes)?;

    let boot_loader = boot_loader(spec)?;
    let storage = spec
        .disks
        .iter()
        .map(storage_device)
        .collect::<Result<Vec<_>>>()?;
    let net = network_device(spec, network)?;
    let serial = serial_port();

    let config = unsafe { VZVirtualMachineConfiguration::new() };
    unsafe {
        config.setBootLoader(Some(&boot_loader));
        config.setCPUCount(spec.cpus);
        config.setMemorySize(spec.memory_bytes);
        config.setStorageDevices(&NSArray::from_retained_slice(&storage));
        config.setNetworkDevices(&NSArray::from_retained_slice(&[net]));
        config.setSerialPorts(&NSArray::from_retained_slice(&[serial]));
    }

    unsafe { config.validateWithError() }.map_err(|e| {
        Error::Hypervisor(format!(
            "failed to validate config: {}",
            e.localizedDescription()
        ))
    })?;
    Ok(config)
}

/// Reject CPU and memory sizes outside what the framework supports.
pub fn check_limits(cpus: usize, memory_bytes: u64) -> Result<()> {
    let (min_cpus, max_cpus) = unsafe {
        (
            VZVirtualMachineConfiguration::minimumAllowedCPUCount(),
            VZVirtualMachineConfiguration::maximumAllowedCPUCount(),
        )
    };
    if cpus < min_cpus || cpus > max_cpus {
        return Err(Error::Config(format!(
            "cpus must be between {} and {}, got {}",
            min_cpus, max_cpus, cpus
        )));
    }

    let (min_mem, max_mem) = unsafe {
        (
            VZVirtualMachineConfiguration::minimumAllowedMemorySize(),
            VZVirtualMachineConfiguration::maximumAllowedMemorySize(),
        )
    };
    if memory_bytes < min_mem || memory_bytes > max_mem {
        return Err(Error::Config(format!(
            "memory must be between {} and {} bytes, got {}",
            min_mem, max_mem, memory_bytes
        )));
    }
    Ok(())
}

fn file_url(path: &Path) -> Result<Retained<NSURL>> {
    let path = path
        .to_str()
        .ok_or_else(|| Error::Config(format!("path is not valid UTF-8: {}", path.display())))?;
    Ok(NSURL::fileURLWithPath(&NSString::from_str(path)))
}

fn boot_loader(spec: &VmSpec<'_, XpcObject>) -> Result<Retained<VZBootLoader>> {
    let kernel = file_url(&spec.boot.kernel)?;
    let loader =
        unsafe { VZLinuxBootLoader::initWithKernelURL(VZLinuxBootLoader::alloc(), &kernel) };
    if let Some(initrd) = &spec.boot.initrd {
        let initrd = file_url(initrd)?;
        unsafe { loader.setInitialRamdiskURL(Some(&initrd)) };
    }
    unsafe { loader.setCommandLine(&NSString::from_str(&spec.boot.cmdline)) };
    debug!("VZ kernel cmdline = {}", spec.boot.cmdline);
    Ok(Retained::into_super(loader))
}

fn storage_device(disk: &DiskConfig) -> Result<Retained<VZStorageDeviceConfiguration>> {
    let url = file_url(&disk.path)?;
    let attachment = unsafe {
        VZDiskImageStorageDeviceAttachment::initWithURL_readOnly_error(
            VZDiskImageStorageDeviceAttachment::alloc(),
            &url,
            disk.readonly,
        )
    }
    .map_err(|e| {
        Error::Hypervisor(format!(
            "failed to create disk image from '{}': {}",
            disk.path.display(),
            e.localizedDescription()
        ))
    })?;
    let device = unsafe {
        VZVirtioBlockDeviceConfiguration::initWithAttachment(
            VZVirtioBlockDeviceConfiguration::alloc(),
            &attachment,
        )
    };
    debug!(path = %disk.path.display(), readonly = disk.readonly, "VZ disk");
    Ok(Retained::into_super(device))
}

fn network_device(
    spec: &VmSpec<'_, XpcObject>,
    network: &VmnetNetwork,
) -> Result<Retained<VZNetworkDeviceConfiguration>> {
    let mac = unsafe {
        VZMACAddress::initWithString(
            VZMACAddress::alloc(),
            &NSString::from_str(&spec.mac.to_string()),
        )
    }
    .ok_or_else(|| Error::Config(format!("invalid MAC address: {}", spec.mac)))?;

    let attachment = vmnet_attachment(network)?;
    let device = unsafe { VZVirtioNetworkDeviceConfiguration::new() };
    unsafe {
        device.setAttachment(Some(&attachment));
        device.setMACAddress(&mac);
    }
    Ok(Retained::into_super(device))
}

/// `VZVmnetNetworkDeviceAttachment` is looked up at runtime; it only exists
/// on hosts whose Virtualization.framework supports vmnet networks.
fn vmnet_attachment(network: &VmnetNetwork) -> Result<Retained<VZNetworkDeviceAttachment>> {
    let class = AnyClass::get(c"VZVmnetNetworkDeviceAttachment").ok_or_else(|| {
        Error::Unsupported("VZVmnetNetworkDeviceAttachment is not available on this host".into())
    })?;
    let attachment: Option<Retained<AnyObject>> = unsafe {
        let allocated: Allocated<AnyObject> = msg_send![class, alloc];
        msg_send![allocated, initWithNetwork: network.as_ptr()]
    };
    let attachment = attachment
        .ok_or_else(|| Error::Hypervisor("failed to create vmnet network attachment".into()))?;
    // Safety: instances of this class are VZNetworkDeviceAttachment subclasses.
    Ok(unsafe { Retained::cast_unchecked(attachment) })
}

fn serial_port() -> Retained<VZSerialPortConfiguration> {
    let attachment = unsafe {
        VZFileHandleSerialPortAttachment::initWithFileHandleForReading_fileHandleForWriting(
            VZFileHandleSerialPortAttachment::alloc(),
            Some(&NSFileHandle::fileHandleWithStandardInput()),
            Some(&NSFileHandle::fileHandleWithStandardOutput()),
        )
    };
    let port = unsafe { VZVirtioConsoleDeviceSerialPortConfiguration::new() };
    unsafe { port.setAttachment(Some(&attachment)) };
    Retained::into_super(port)
}
