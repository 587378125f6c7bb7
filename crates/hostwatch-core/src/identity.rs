//! Worker identity: which host a registry row belongs to.
//!
//! The identity is `<hostname>-<last octet>` where the octet comes from the
//! first up, non-loopback IPv4 address in a private range. Hosts without
//! such an address get octet `0`.

use std::fmt;
use std::net::Ipv4Addr;

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use tracing::warn;

/// Identity of the local worker host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerIdentity {
    name: String,
}

impl WorkerIdentity {
    /// Resolve the identity from the hostname and network interfaces.
    pub fn detect() -> Self {
        let host = hostname().unwrap_or_else(|| "unknown".to_owned());
        let addrs = interface_ipv4_addrs();
        let name = worker_name(&host, &addrs);
        if name.ends_with("-0") {
            warn!(worker = %name, "no private IPv4 address found for worker identity");
        }
        Self { name }
    }

    /// A fixed identity, for tests and explicit overrides.
    pub fn fixed(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Build `<host>-<octet>` from the first address in a private prefix.
///
/// `addrs` must already exclude down and loopback interfaces.
pub fn worker_name(host: &str, addrs: &[Ipv4Addr]) -> String {
    let octet = addrs
        .iter()
        .find(|a| is_worker_range(a))
        .map(|a| a.octets()[3].to_string())
        .unwrap_or_else(|| "0".to_owned());
    format!("{host}-{octet}")
}

fn is_worker_range(addr: &Ipv4Addr) -> bool {
    let [a, b, _, _] = addr.octets();
    !addr.is_loopback() && (a == 10 || a == 172 || (a == 192 && b == 168))
}

fn hostname() -> Option<String> {
    match nix::unistd::gethostname() {
        Ok(name) => {
            let name = name.to_string_lossy().into_owned();
            (!name.is_empty()).then_some(name)
        }
        Err(e) => {
            warn!(error = %e, "gethostname failed");
            None
        }
    }
}

/// IPv4 addresses of interfaces that are up and not loopback, in kernel
/// enumeration order.
fn interface_ipv4_addrs() -> Vec<Ipv4Addr> {
    let interfaces = match getifaddrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            warn!(error = %e, "getifaddrs failed");
            return Vec::new();
        }
    };
    interfaces
        .filter(|ifa| ifa.flags.contains(InterfaceFlags::IFF_UP))
        .filter(|ifa| !ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK))
        .filter_map(|ifa| {
            let sin = ifa.address.as_ref()?.as_sockaddr_in()?;
            Some(Ipv4Addr::from(sin.ip()))
        })
        .collect()
}
