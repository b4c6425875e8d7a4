//! VM configuration files.
//!
//! A VM is described by a JSON or YAML file, usually kept at
//! `.vms/<name>/config.json`:
//!
//! ```json
//! {
//!   "cpus": 2,
//!   "memory": 2048,
//!   "mac": "92:c1:a2:40:6e:01",
//!   "bootloader": {"kernel": "vmlinuz", "initrd": "initrd"},
//!   "disks": [
//!     {"path": "disk.img", "readonly": false},
//!     {"path": "cidata.iso", "readonly": true}
//!   ]
//! }
//! ```
//!
//! Relative paths are resolved against the directory holding the file.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Directory searched for named VMs.
pub const DEFAULT_VMS_DIR: &str = ".vms";

/// Kernel command line used when the config does not set one.
pub const DEFAULT_CMDLINE: &str = "console=hvc0 root=LABEL=cloudimg-rootfs";

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    #[serde(alias = "Cpus")]
    pub cpus: usize,
    /// Memory size in MiB.
    #[serde(alias = "Memory")]
    pub memory: u64,
    #[serde(alias = "Mac")]
    pub mac: String,
    /// Broker network to attach to.
    #[serde(default = "default_network", alias = "Network")]
    pub network: String,
    #[serde(alias = "Bootloader")]
    pub bootloader: BootloaderConfig,
    #[serde(alias = "Disks")]
    pub disks: Vec<DiskConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootloaderConfig {
    #[serde(alias = "Kernel")]
    pub kernel: PathBuf,
    #[serde(default, alias = "Initrd")]
    pub initrd: Option<PathBuf>,
    #[serde(default = "default_cmdline", alias = "Cmdline")]
    pub cmdline: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskConfig {
    #[serde(alias = "Path")]
    pub path: PathBuf,
    #[serde(default, alias = "Readonly", alias = "read_only")]
    pub readonly: bool,
}

fn default_network() -> String {
    vmnet_broker::DEFAULT_NETWORK.to_string()
}

fn default_cmdline() -> String {
    DEFAULT_CMDLINE.to_string()
}

/// Turn the CLI argument into a config file path.
///
/// Anything that looks like a path (has a config extension, a separator,
/// or names an existing file) is used as is. Otherwise it is a VM name
/// looked up under `vms_dir`.
pub fn resolve_config_path(vm: &str, vms_dir: &Path) -> PathBuf {
    let candidate = Path::new(vm);
    if has_config_extension(candidate) || vm.contains(std::path::MAIN_SEPARATOR) || candidate.is_file()
    {
        return candidate.to_path_buf();
    }

    let dir = vms_dir.join(vm);
    let json = dir.join("config.json");
    if json.exists() {
        return json;
    }
    for ext in ["yaml", "yml"] {
        let path = dir.join(format!("config.{}", ext));
        if path.exists() {
            return path;
        }
    }
    json
}

fn has_config_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            ext.eq_ignore_ascii_case("json")
                || ext.eq_ignore_ascii_case("yaml")
                || ext.eq_ignore_ascii_case("yml")
        })
        .unwrap_or(false)
}

/// Load, resolve and validate a VM config.
pub fn load_config(path: &Path) -> Result<VmConfig> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read config from '{}': {}", path.display(), e)))?;

    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
        .unwrap_or(false);

    let mut config: VmConfig = if is_yaml {
        serde_yaml::from_str(&raw).map_err(|e| {
            Error::Config(format!("failed to parse config from '{}': {}", path.display(), e))
        })?
    } else {
        serde_json::from_str(&raw).map_err(|e| {
            Error::Config(format!("failed to parse config from '{}': {}", path.display(), e))
        })?
    };

    if let Some(base) = path.parent() {
        config.resolve_paths(base);
    }
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &VmConfig) -> Result<()> {
    if config.cpus == 0 {
        return Err(Error::Config("cpus must be at least 1".into()));
    }
    if config.memory == 0 {
        return Err(Error::Config("memory must be at least 1 MiB".into()));
    }
    if config.memory.checked_mul(MIB).is_none() {
        return Err(Error::Config(format!("memory {} MiB is too large", config.memory)));
    }
    if config.bootloader.kernel.as_os_str().is_empty() {
        return Err(Error::Config("bootloader.kernel cannot be empty".into()));
    }
    if config.disks.is_empty() {
        return Err(Error::Config("at least one disk is required".into()));
    }
    if let Some(disk) = config.disks.iter().find(|d| d.path.as_os_str().is_empty()) {
        return Err(Error::Config(format!("disk path cannot be empty: {:?}", disk)));
    }
    config.mac.parse::<MacAddress>()?;
    Ok(())
}

impl VmConfig {
    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() && !p.as_os_str().is_empty() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.bootloader.kernel);
        if let Some(initrd) = self.bootloader.initrd.as_mut() {
            resolve(initrd);
        }
        for disk in &mut self.disks {
            resolve(&mut disk.path);
        }
    }

    /// Memory size in bytes.
    pub fn memory_bytes(&self) -> u64 {
        self.memory.saturating_mul(MIB)
    }

    /// Build the immutable launch description, borrowing the broker network.
    pub fn to_spec<'n, D>(&self, name: &str, network: &'n D) -> Result<VmSpec<'n, D>> {
        validate_config(self)?;
        Ok(VmSpec {
            name: name.to_string(),
            cpus: self.cpus,
            memory_bytes: self.memory_bytes(),
            boot: self.bootloader.clone(),
            disks: self.disks.clone(),
            mac: self.mac.parse()?,
            network,
        })
    }
}

/// Everything the hypervisor needs to build one VM.
///
/// The network descriptor is borrowed from the live broker session, so the
/// spec cannot outlive the session.
#[derive(Debug)]
pub struct VmSpec<'n, D> {
    pub name: String,
    pub cpus: usize,
    pub memory_bytes: u64,
    pub boot: BootloaderConfig,
    pub disks: Vec<DiskConfig>,
    pub mac: MacAddress,
    pub network: &'n D,
}

/// An Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_unicast(&self) -> bool {
        self.0[0] & 0x01 == 0
    }

    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("failed to parse MAC address '{}'", s));

        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }

        let mac = MacAddress(octets);
        if !mac.is_unicast() {
            return Err(Error::Config(format!("MAC address '{}' is not unicast", s)));
        }
        Ok(mac)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "cpus": 2,
        "memory": 1024,
        "mac": "92:c1:a2:40:6e:01",
        "bootloader": {"kernel": "vmlinuz", "initrd": "initrd"},
        "disks": [
            {"path": "disk.img", "readonly": false},
            {"path": "/abs/cidata.iso", "readonly": true}
        ]
    }"#;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn loads_json_and_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "config.json", SAMPLE);

        let config = load_config(&path).unwrap();
        assert_eq!(config.cpus, 2);
        assert_eq!(config.memory_bytes(), 1024 * 1024 * 1024);
        assert_eq!(config.network, "shared");
        assert_eq!(config.bootloader.cmdline, DEFAULT_CMDLINE);
        assert_eq!(config.bootloader.kernel, dir.path().join("vmlinuz"));
        assert_eq!(config.bootloader.initrd, Some(dir.path().join("initrd")));
        assert_eq!(config.disks[0].path, dir.path().join("disk.img"));
        assert_eq!(config.disks[1].path, PathBuf::from("/abs/cidata.iso"));
        assert!(config.disks[1].readonly);
    }

    #[test]
    fn accepts_capitalised_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let body = r#"{
            "Cpus": 1, "Memory": 512, "Mac": "02:00:00:00:00:01",
            "Bootloader": {"Kernel": "/k", "Initrd": "/i"},
            "Disks": [{"Path": "/d", "Readonly": true}]
        }"#;
        let config = load_config(&write(dir.path(), "vm.json", body)).unwrap();
        assert_eq!(config.cpus, 1);
        assert!(config.disks[0].readonly);
    }

    #[test]
    fn loads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let body = "cpus: 4\nmemory: 256\nmac: \"02:00:00:00:00:02\"\nnetwork: host\n\
                    bootloader:\n  kernel: /k\n  cmdline: console=hvc0\n\
                    disks:\n  - path: /d\n";
        let config = load_config(&write(dir.path(), "vm.yaml", body)).unwrap();
        assert_eq!(config.network, "host");
        assert_eq!(config.bootloader.cmdline, "console=hvc0");
        assert!(!config.disks[0].readonly);
    }

    #[test]
    fn rejects_invalid_configs() {
        let base: VmConfig = serde_json::from_str(SAMPLE).unwrap();
        validate_config(&base).unwrap();

        let mut no_cpus = base.clone();
        no_cpus.cpus = 0;
        assert!(matches!(validate_config(&no_cpus), Err(Error::Config(_))));

        let mut no_memory = base.clone();
        no_memory.memory = 0;
        assert!(validate_config(&no_memory).is_err());

        let mut no_disks = base.clone();
        no_disks.disks.clear();
        assert!(validate_config(&no_disks).is_err());

        let mut bad_mac = base;
        bad_mac.mac = "not-a-mac".into();
        assert!(validate_config(&bad_mac).is_err());
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = load_config(Path::new("/nonexistent/config.json")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("/nonexistent/config.json"));
    }

    #[test]
    fn resolves_names_and_paths() {
        let dir = tempfile::tempdir().unwrap();
        let vms = dir.path().join(".vms");
        fs::create_dir_all(vms.join("alpine")).unwrap();
        write(&vms.join("alpine"), "config.yaml", "");

        assert_eq!(
            resolve_config_path("alpine", &vms),
            vms.join("alpine").join("config.yaml")
        );
        assert_eq!(
            resolve_config_path("ubuntu", &vms),
            vms.join("ubuntu").join("config.json")
        );
        assert_eq!(
            resolve_config_path("my-vm.json", &vms),
            PathBuf::from("my-vm.json")
        );
    }

    #[test]
    fn mac_address_parsing() {
        let mac: MacAddress = "92:C1:a2:40:6e:01".parse().unwrap();
        assert_eq!(mac.octets(), [0x92, 0xc1, 0xa2, 0x40, 0x6e, 0x01]);
        assert_eq!(mac.to_string(), "92:c1:a2:40:6e:01");
        assert!(mac.is_locally_administered());

        assert!("92:c1:a2:40:6e".parse::<MacAddress>().is_err());
        assert!("92:c1:a2:40:6e:01:02".parse::<MacAddress>().is_err());
        assert!("92:c1:a2:40:6e:zz".parse::<MacAddress>().is_err());
        assert!("921:c:a2:40:6e:01".parse::<MacAddress>().is_err());
        // Multicast
        assert!("01:00:5e:00:00:01".parse::<MacAddress>().is_err());
    }

    #[test]
    fn mac_address_octets_are_hex_digits_only() {
        for mac in ["+2:00:00:00:00:01", "02:00:00:00:00:+1", "02:-0:00:00:00:01", " 2:00:00:00:00:01"] {
            let err = mac.parse::<MacAddress>().unwrap_err();
            assert!(err.to_string().contains(mac), "{}", err);
        }
    }

    #[test]
    fn spec_borrows_network() {
        let config: VmConfig = serde_json::from_str(SAMPLE).unwrap();
        let network = String::from("serialized");
        let spec = config.to_spec("test", &network).unwrap();
        assert_eq!(spec.network, "serialized");
        assert_eq!(spec.cpus, 2);
        assert_eq!(spec.disks.len(), 2);
        assert_eq!(spec.mac.to_string(), "92:c1:a2:40:6e:01");
    }
}
