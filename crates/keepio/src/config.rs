// SPDX-License-Identifier: Apache-2.0

//! Configuration of the device layer
//!
//! The configuration is read by the host-side loader, so failures are reported with
//! [`anyhow`] context instead of an errno.

use crate::log::Level;
use crate::table::{DevId, DEVID_ENCLAVE_FILESYSTEM, DEVID_HOST_FILESYSTEM};

use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context};
use postern::item::{epoll, fs, resolver, socket, HEADER_SIZE};
use postern::MAX_ARENA_SIZE;
use serde::{Deserialize, Serialize};

/// Configuration file template
pub const CONFIG_TEMPLATE: &str = r#"## Configuration of the enclave I/O devices

## Log level: "trace", "debug", "info", "warn" or "error"
# log = "info"

## Maximum number of open file descriptors, stdio included
# fd_limit = 1024

## Arena capacities in bytes, header included
# [arenas]
# fs = 73816
# socket = 65732
# epoll = 4184
# resolver = 4184

## The enclave filesystem as root
[[mounts]]
device = "enclave-fs"
source = "/"
target = "/"

## The host filesystem, read-only
[[mounts]]
device = "host-fs"
source = "/"
target = "/host"
readonly = true

## Static entries of the enclave resolver
# [[hosts]]
# name = "db.internal"
# addr = "10.0.0.2"
"#;

const fn default_fd_limit() -> usize {
    1024
}

fn default_mounts() -> Vec<Mount> {
    vec![
        Mount {
            device: DeviceName::EnclaveFs,
            source: "/".into(),
            target: "/".into(),
            readonly: false,
        },
        Mount {
            device: DeviceName::HostFs,
            source: "/".into(),
            target: "/host".into(),
            readonly: true,
        },
    ]
}

/// A mountable device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum DeviceName {
    /// The in-enclave filesystem
    #[serde(rename = "enclave-fs")]
    EnclaveFs,
    /// The host filesystem, proxied to the host
    #[serde(rename = "host-fs")]
    HostFs,
}

impl DeviceName {
    /// Returns the well-known id of the device.
    pub const fn id(self) -> DevId {
        match self {
            Self::EnclaveFs => DEVID_ENCLAVE_FILESYSTEM,
            Self::HostFs => DEVID_HOST_FILESYSTEM,
        }
    }
}

/// A mount performed at initialization
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Mount {
    /// The device to mount
    pub device: DeviceName,

    /// The device-relative directory to expose
    #[serde(default = "root")]
    pub source: String,

    /// The absolute mount point
    pub target: String,

    /// Whether mutating operations are refused with `EROFS`
    #[serde(default)]
    pub readonly: bool,
}

fn root() -> String {
    "/".into()
}

/// Arena capacities per device family, in bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Arenas {
    /// Filesystem arena
    pub fs: usize,
    /// Socket arena
    pub socket: usize,
    /// Epoll arena
    pub epoll: usize,
    /// Resolver arena
    pub resolver: usize,
}

impl Default for Arenas {
    fn default() -> Self {
        Self {
            fs: fs::DEFAULT_ARENA_SIZE,
            socket: socket::DEFAULT_ARENA_SIZE,
            epoll: epoll::DEFAULT_ARENA_SIZE,
            resolver: resolver::DEFAULT_ARENA_SIZE,
        }
    }
}

/// A static entry of the enclave resolver
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HostEntry {
    /// Host name, matched case-insensitively
    pub name: String,
    /// Address the name resolves to
    pub addr: IpAddr,
}

/// The configuration of the device layer
///
/// # Examples
///
/// ```
/// use keepio::Config;
///
/// let config: Config = r#"
/// fd_limit = 64
///
/// [[mounts]]
/// device = "enclave-fs"
/// target = "/"
/// "#
/// .parse()
/// .unwrap();
///
/// assert_eq!(config.fd_limit, 64);
/// assert_eq!(config.mounts.len(), 1);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The log level
    #[serde(default)]
    pub log: Level,

    /// The maximum number of open file descriptors
    #[serde(default = "default_fd_limit")]
    pub fd_limit: usize,

    /// Arena capacities
    #[serde(default)]
    pub arenas: Arenas,

    /// Mounts performed at initialization, in order
    #[serde(default = "default_mounts")]
    pub mounts: Vec<Mount>,

    /// Static entries of the enclave resolver
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: Level::default(),
            fd_limit: default_fd_limit(),
            arenas: Arenas::default(),
            mounts: default_mounts(),
            hosts: vec![],
        }
    }
}

impl FromStr for Config {
    type Err = toml::de::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s)
    }
}

impl Config {
    /// Reads and validates the configuration at `path`.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file `{}`", path.display()))?;
        let config: Self = text
            .parse()
            .with_context(|| format!("failed to parse config file `{}`", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values serde cannot.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.fd_limit <= 3 {
            bail!("`fd_limit` must leave room beyond stdio, got {}", self.fd_limit);
        }

        let arenas = [
            ("fs", self.arenas.fs),
            ("socket", self.arenas.socket),
            ("epoll", self.arenas.epoll),
            ("resolver", self.arenas.resolver),
        ];
        for (name, size) in arenas {
            if size <= HEADER_SIZE || size > MAX_ARENA_SIZE {
                let min = HEADER_SIZE + 1;
                bail!("`arenas.{name}` must be in {min}..={MAX_ARENA_SIZE}, got {size}");
            }
        }

        for mount in &self.mounts {
            for path in [&mount.source, &mount.target] {
                if !path.starts_with('/') {
                    bail!("mount path `{path}` is not absolute");
                }
            }
        }
        for (i, mount) in self.mounts.iter().enumerate() {
            if self.mounts[..i].iter().any(|m| m.target == mount.target) {
                bail!("`{}` is mounted more than once", mount.target);
            }
        }

        for host in &self.hosts {
            if host.name.is_empty() || host.name.contains(char::is_whitespace) {
                bail!("invalid host name `{}`", host.name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template() {
        let config: Config = CONFIG_TEMPLATE.parse().unwrap();
        config.validate().unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn empty_is_default() {
        let config: Config = "".parse().unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn full() {
        const CONFIG: &str = r#"
log = "trace"
fd_limit = 16

[arenas]
resolver = 65536

[[mounts]]
device = "enclave-fs"
target = "/"

[[mounts]]
device = "host-fs"
source = "/srv/data"
target = "/data"

[[hosts]]
name = "db.internal"
addr = "10.0.0.2"

[[hosts]]
name = "v6.internal"
addr = "fd00::1"
"#;

        let config: Config = CONFIG.parse().unwrap();
        config.validate().unwrap();
        assert_eq!(config.log, Level::Trace);
        assert_eq!(config.fd_limit, 16);
        assert_eq!(config.arenas.resolver, 65536);
        assert_eq!(config.arenas.fs, fs::DEFAULT_ARENA_SIZE);
        assert_eq!(config.mounts[0].source, "/");
        assert_eq!(
            config.mounts[1],
            Mount {
                device: DeviceName::HostFs,
                source: "/srv/data".into(),
                target: "/data".into(),
                readonly: false,
            }
        );
        assert_eq!(config.hosts[1].addr, "fd00::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn unknown_fields() {
        assert!("verbose = true".parse::<Config>().is_err());

        const CONFIG: &str = r#"
[[mounts]]
device = "enclave-fs"
target = "/"
flags = 1
"#;
        assert!(CONFIG.parse::<Config>().is_err());

        const DEVICE: &str = r#"
[[mounts]]
device = "tmpfs"
target = "/"
"#;
        assert!(DEVICE.parse::<Config>().is_err());
    }

    #[test]
    fn invalid() {
        let mut config = Config {
            fd_limit: 3,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.fd_limit = 8;
        config.arenas.epoll = HEADER_SIZE;
        assert!(config.validate().is_err());

        config.arenas = Arenas::default();
        config.mounts[1].target = "host".into();
        assert!(config.validate().is_err());

        config.mounts[1].target = "/".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load() {
        let path = std::env::temp_dir().join(format!("keepio-{}.toml", std::process::id()));
        std::fs::write(&path, "fd_limit = 32\n").unwrap();
        let config = Config::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.fd_limit, 32);

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}
