use regex::Regex;
use std::{
    fmt,
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs},
    sync::LazyLock,
};

use crate::error::ClientError;

/// Host used when the caller does not supply one.
pub const DEFAULT_HOST: &str = "127.0.0.1";

// four dot-separated groups of one to three digits, each 0-255
static IPV4_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(([01]?\d\d?|2[0-4]\d|25[0-5])\.){3}([01]?\d\d?|2[0-4]\d|25[0-5])$")
        .expect("IPv4 pattern is valid")
});

/// A host address after validation.
///
/// Validation is advisory: a string that is not a dotted-quad IPv4 address is kept
/// as a symbolic name and resolved when a connection is made.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostAddress {
    /// A dotted-quad IPv4 address, usable without name resolution.
    Ipv4(Ipv4Addr),
    /// Any other host string, e.g. `"localhost"`.
    Symbolic(String),
}

impl HostAddress {
    /// Whether the host can be connected to without name resolution.
    pub fn is_ipv4(&self) -> bool {
        matches!(self, HostAddress::Ipv4(_))
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostAddress::Ipv4(ip) => write!(f, "{ip}"),
            HostAddress::Symbolic(name) => f.write_str(name),
        }
    }
}

/// Validates a host string against the dotted-quad IPv4 grammar.
///
/// Never fails: non-matching input is flagged as [`HostAddress::Symbolic`].
pub fn validate(host: &str) -> HostAddress {
    if IPV4_PATTERN.is_match(host) {
        let mut octets = [0u8; 4];
        for (octet, group) in octets.iter_mut().zip(host.split('.')) {
            match group.parse::<u8>() {
                Ok(value) => *octet = value,
                Err(_) => return HostAddress::Symbolic(host.to_string()),
            }
        }
        HostAddress::Ipv4(Ipv4Addr::from(octets))
    } else {
        log::debug!("{host} is not an IPv4 address, treating it as a host name");
        HostAddress::Symbolic(host.to_string())
    }
}

/// The inference service address a client talks to. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    host: HostAddress,
    port: u16,
}

impl Endpoint {
    /// Builds an endpoint, falling back to [`DEFAULT_HOST`] for an empty host.
    ///
    /// Surrounding whitespace is trimmed before [`validate`] runs, so `" 10.0.0.2"`
    /// yields an IPv4 host here while `validate(" 10.0.0.2")` on its own does not.
    pub fn new(host: &str, port: u16) -> Result<Self, ClientError> {
        if port == 0 {
            return Err(ClientError::InvalidPort(port));
        }
        let host = host.trim();
        let host = if host.is_empty() { DEFAULT_HOST } else { host };
        Ok(Self {
            host: validate(host),
            port,
        })
    }

    /// The validated host.
    pub fn host(&self) -> &HostAddress {
        &self.host
    }

    /// The port, always in `1..=65535`.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolves the endpoint to a socket address.
    ///
    /// IPv4 hosts are used directly; symbolic hosts go through name resolution.
    pub fn socket_addr(&self) -> Result<SocketAddr, ClientError> {
        match &self.host {
            HostAddress::Ipv4(ip) => Ok(SocketAddr::from((*ip, self.port))),
            HostAddress::Symbolic(name) => (name.as_str(), self.port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| ClientError::Unresolved(name.clone())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
