//! Local path discovery

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::IpAddr;

use crate::config::Config;

/// One local network path a listener can bind to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalPath {
    /// Interface name, or the address itself for static paths
    pub name: String,
    pub ip: IpAddr,
}

impl LocalPath {
    pub fn new(name: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            name: name.into(),
            ip,
        }
    }
}

impl fmt::Display for LocalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.ip)
    }
}

/// Produces the ordered list of local paths for one initiation
pub trait PathEnumerator: Send + Sync {
    fn enumerate(&self) -> io::Result<Vec<LocalPath>>;
}

/// Paths taken from the host's network interfaces
#[derive(Debug, Clone)]
pub struct HostInterfaces {
    include_loopback: bool,
    enable_ipv6: bool,
}

impl HostInterfaces {
    pub fn new(include_loopback: bool, enable_ipv6: bool) -> Self {
        Self {
            include_loopback,
            enable_ipv6,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.include_loopback, config.enable_ipv6)
    }

    fn accepts(&self, ip: IpAddr, loopback: bool) -> bool {
        if loopback && !self.include_loopback {
            return false;
        }
        match ip {
            IpAddr::V4(v4) => !v4.is_unspecified() && !v4.is_multicast(),
            // Link-local v6 needs a scope id to bind
            IpAddr::V6(v6) => {
                self.enable_ipv6
                    && !v6.is_unspecified()
                    && !v6.is_multicast()
                    && (v6.segments()[0] & 0xffc0) != 0xfe80
            }
        }
    }
}

impl Default for HostInterfaces {
    fn default() -> Self {
        Self::new(false, true)
    }
}

impl PathEnumerator for HostInterfaces {
    fn enumerate(&self) -> io::Result<Vec<LocalPath>> {
        let interfaces = if_addrs::get_if_addrs()?;
        let mut seen = HashSet::new();

        let paths: Vec<LocalPath> = interfaces
            .into_iter()
            .filter(|iface| self.accepts(iface.ip(), iface.is_loopback()))
            .filter(|iface| seen.insert(iface.ip()))
            .map(|iface| LocalPath::new(iface.name.clone(), iface.ip()))
            .collect();

        tracing::debug!(count = paths.len(), "Enumerated host interfaces");
        Ok(paths)
    }
}

/// A fixed list of addresses, in the given order
#[derive(Debug, Clone, Default)]
pub struct StaticPaths {
    paths: Vec<LocalPath>,
}

impl StaticPaths {
    pub fn new(paths: Vec<LocalPath>) -> Self {
        Self { paths }
    }

    pub fn from_addresses(addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        let mut seen = HashSet::new();
        let paths = addresses
            .into_iter()
            .filter(|ip| seen.insert(*ip))
            .map(|ip| LocalPath::new(ip.to_string(), ip))
            .collect();
        Self { paths }
    }
}

impl PathEnumerator for StaticPaths {
    fn enumerate(&self) -> io::Result<Vec<LocalPath>> {
        Ok(self.paths.clone())
    }
}
