//! Address, port and protocol values shared by the port forwarding and NAT APIs.

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid host and port '{0}'")]
    HostAndPort(String),
    #[error("No port given in '{0}'")]
    MissingPort(String),
    #[error("Unknown protocol '{0}'")]
    Protocol(String),
    #[error("Invalid CIDR '{0}'")]
    Cidr(String),
    #[error("Invalid port range {0}-{1}")]
    PortRange(u16, u16),
}

/// A host (name or IP literal) with an optional port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAndPort {
    host: String,
    port: Option<u16>,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
        }
    }

    pub fn from_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn require_port(&self) -> Result<u16, ParseError> {
        self.port
            .ok_or_else(|| ParseError::MissingPort(self.to_string()))
    }
}

impl FromStr for HostAndPort {
    type Err = ParseError;

    /// Accepts `host`, `host:port`, `[v6]`, `[v6]:port` and bare IPv6 literals.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::HostAndPort(s.to_owned());
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            match tail {
                "" => (host, None),
                _ => (host, Some(tail.strip_prefix(':').ok_or_else(invalid)?)),
            }
        } else {
            match s.split_once(':') {
                // More than one colon without brackets can only be an IPv6 literal
                Some((_, tail)) if tail.contains(':') => (s, None),
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port
            .map(|p| p.parse::<u16>().map_err(|_| invalid()))
            .transpose()?;
        Ok(Self {
            host: host.to_owned(),
            port,
        })
    }
}

impl Display for HostAndPort {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let bracket = self.host.contains(':');
        match (bracket, self.port) {
            (true, Some(port)) => write!(f, "[{}]:{}", self.host, port),
            (false, Some(port)) => write!(f, "{}:{}", self.host, port),
            (_, None) => f.write_str(&self.host),
        }
    }
}

impl Serialize for HostAndPort {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    All,
}

impl FromStr for Protocol {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "TCP" => Ok(Self::Tcp),
            "UDP" => Ok(Self::Udp),
            "ICMP" => Ok(Self::Icmp),
            "ALL" => Ok(Self::All),
            _ => Err(ParseError::Protocol(s.to_owned())),
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Icmp => "ICMP",
            Self::All => "ALL",
        })
    }
}

/// An IP network in CIDR notation, used to restrict who may reach an opened port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr(IpNet);

impl Cidr {
    /// `0.0.0.0/0`
    pub fn universal() -> Self {
        Self(IpNet::V4(Ipv4Net::default()))
    }

    pub fn new(address: IpAddr, prefix: u8) -> Result<Self, ParseError> {
        IpNet::new(address, prefix)
            .map(Self)
            .map_err(|_| ParseError::Cidr(format!("{address}/{prefix}")))
    }

    pub fn address(&self) -> IpAddr {
        self.0.addr()
    }

    pub fn prefix(&self) -> u8 {
        self.0.prefix_len()
    }

    pub fn network(&self) -> IpNet {
        self.0
    }

    pub fn contains(&self, address: IpAddr) -> bool {
        self.0.contains(&address)
    }
}

impl From<IpNet> for Cidr {
    fn from(network: IpNet) -> Self {
        Self(network)
    }
}

impl FromStr for Cidr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IpNet::from_str(s)
            .map(Self)
            .map_err(|_| ParseError::Cidr(s.to_owned()))
    }
}

impl Display for Cidr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// An inclusive range of ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, ParseError> {
        if start > end {
            return Err(ParseError::PortRange(start, end));
        }
        Ok(Self { start, end })
    }

    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

impl Display for PortRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}
