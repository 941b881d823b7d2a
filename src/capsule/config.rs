//! Capsule configuration.

use crate::constants::{MAX_HOSTNAME_LEN, valid_name};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A bind mount into the capsule rootfs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: PathBuf,
    /// Target path relative to the rootfs.
    pub target: PathBuf,
    #[serde(default)]
    pub readonly: bool,
}

/// A host-to-capsule port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host: u16,
    pub capsule: u16,
}

impl PortMapping {
    /// Parses the `host:capsule` string form.
    pub fn parse(s: &str) -> Result<Self> {
        let (host, capsule) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidConfiguration(format!("port mapping '{s}' must be host:capsule")))?;
        Ok(Self {
            host: host
                .parse()
                .map_err(|_| Error::InvalidConfiguration(format!("bad host port '{host}'")))?,
            capsule: capsule
                .parse()
                .map_err(|_| Error::InvalidConfiguration(format!("bad capsule port '{capsule}'")))?,
        })
    }
}

/// A device passed through to the capsule.
///
/// Devices are exclusive by default; a `shared` device may be attached
/// to several capsules on the same node concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub path: PathBuf,
    #[serde(default)]
    pub shared: bool,
}

/// Resource caps applied through the capsule's cgroup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU cores granted (fractional allowed).
    pub cpu_cores: f64,
    /// Memory cap in bytes. Zero is forbidden.
    pub memory_bytes: u64,
    /// Storage reservation in bytes, tracked by the scheduler.
    pub storage_bytes: u64,
    /// Cap on the number of processes.
    pub pids_max: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_cores: 1.0,
            memory_bytes: 256 * 1024 * 1024,
            storage_bytes: 1024 * 1024 * 1024,
            pids_max: 4096,
        }
    }
}

/// Full description of a capsule to create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapsuleConfig {
    /// Human name (service name + replica suffix under Surge).
    pub name: String,
    /// Hostname inside the UTS namespace; defaults to the capsule id.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Entrypoint argv.
    pub command: Vec<String>,
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
    #[serde(default)]
    pub resources: ResourceLimits,
    /// Map to an unprivileged outside identity via a user namespace.
    #[serde(default)]
    pub rootless: bool,
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("/")
}

fn default_user() -> String {
    "root".to_string()
}

impl CapsuleConfig {
    /// Minimal config running `command` under `name`.
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            hostname: None,
            command,
            working_dir: default_working_dir(),
            user: default_user(),
            env: BTreeMap::new(),
            mounts: Vec::new(),
            ports: Vec::new(),
            devices: Vec::new(),
            resources: ResourceLimits::default(),
            rootless: false,
        }
    }

    /// Rejects configurations before any kernel object is created.
    pub fn validate(&self) -> Result<()> {
        if !valid_name(&self.name) {
            return Err(Error::InvalidConfiguration(format!(
                "capsule name '{}' contains invalid characters",
                self.name
            )));
        }
        if self.command.is_empty() {
            return Err(Error::InvalidConfiguration("empty command".to_string()));
        }
        if let Some(hostname) = &self.hostname {
            if hostname.len() > MAX_HOSTNAME_LEN {
                return Err(Error::InvalidConfiguration(format!(
                    "hostname exceeds {MAX_HOSTNAME_LEN} bytes"
                )));
            }
            if hostname.is_empty() {
                return Err(Error::InvalidConfiguration("empty hostname".to_string()));
            }
        }
        // A zero memory cap would OOM-kill the init process on spawn.
        if self.resources.memory_bytes == 0 {
            return Err(Error::InvalidConfiguration(
                "memory limit of zero is forbidden".to_string(),
            ));
        }
        if self.resources.cpu_cores <= 0.0 {
            return Err(Error::InvalidConfiguration(
                "cpu allocation must be positive".to_string(),
            ));
        }
        for mount in &self.mounts {
            if !mount.target.is_absolute() {
                return Err(Error::InvalidConfiguration(format!(
                    "mount target {} must be absolute",
                    mount.target.display()
                )));
            }
        }
        Ok(())
    }
}
