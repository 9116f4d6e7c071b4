//! Connection targets: host, port, local interface and family preference.

use std::{
  fmt,
  net::{IpAddr, SocketAddr},
  str::FromStr,
};

use crate::error::{Error, Result};

/// Address family of a candidate or local address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
  /// IPv4.
  V4,
  /// IPv6.
  V6,
}

impl Family {
  /// Family of `addr`.
  pub fn of(addr: &SocketAddr) -> Family {
    Family::of_ip(&addr.ip())
  }

  /// Family of `ip`.
  pub fn of_ip(ip: &IpAddr) -> Family {
    match ip {
      IpAddr::V4(_) => Family::V4,
      IpAddr::V6(_) => Family::V6,
    }
  }

  /// The family that is not `self`.
  pub fn other(self) -> Family {
    match self {
      Family::V4 => Family::V6,
      Family::V6 => Family::V4,
    }
  }
}

impl fmt::Display for Family {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Family::V4 => "IPv4",
      Family::V6 => "IPv6",
    })
  }
}

/// Which families may be used, and which one is tried first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Families {
  /// Allow IPv4 addresses.
  pub ipv4: bool,
  /// Allow IPv6 addresses.
  pub ipv6: bool,
  /// Tried first when both resolve.
  pub preferred: Family,
}

impl Default for Families {
  fn default() -> Self {
    Families { ipv4: true, ipv6: true, preferred: Family::V4 }
  }
}

impl Families {
  /// IPv4 only.
  pub fn ipv4_only() -> Self {
    Families { ipv4: true, ipv6: false, preferred: Family::V4 }
  }

  /// IPv6 only.
  pub fn ipv6_only() -> Self {
    Families { ipv4: false, ipv6: true, preferred: Family::V6 }
  }

  /// Both families, `family` first.
  pub fn prefer(family: Family) -> Self {
    Families { preferred: family, ..Families::default() }
  }

  /// Whether `family` is enabled.
  pub fn allows(&self, family: Family) -> bool {
    match family {
      Family::V4 => self.ipv4,
      Family::V6 => self.ipv6,
    }
  }

  /// Enabled families, preferred first.
  pub fn ordered(&self) -> impl Iterator<Item = Family> {
    let families = *self;
    [families.preferred, families.preferred.other()]
      .into_iter()
      .filter(move |family| families.allows(*family))
  }
}

/// The local side a connection is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interface {
  /// Any local address; only the port is fixed.
  Any,
  /// An interface name such as `eth0`, or `localhost`/`loopback`.
  Name(String),
  /// A literal local address.
  Addr(IpAddr),
}

/// Parsed form of an interface string, optionally suffixed with `:port`.
///
/// ```
/// use lio_socket::{Interface, InterfaceSpec};
///
/// let spec: InterfaceSpec = "eth0:5000".parse().unwrap();
/// assert_eq!(spec.interface, Interface::Name("eth0".into()));
/// assert_eq!(spec.port, 5000);
///
/// let spec: InterfaceSpec = "[fe80::1]:7".parse().unwrap();
/// assert_eq!(spec.interface, Interface::Addr("fe80::1".parse().unwrap()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSpec {
  /// Interface or address to bind.
  pub interface: Interface,
  /// Local port, `0` for an ephemeral one.
  pub port: u16,
}

impl FromStr for InterfaceSpec {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let s = s.trim();
    if s.is_empty() {
      return Err(Error::invalid("interface must not be empty"));
    }

    if let Ok(ip) = s.parse::<IpAddr>() {
      return Ok(InterfaceSpec { interface: Interface::Addr(ip), port: 0 });
    }
    if let Ok(addr) = s.parse::<SocketAddr>() {
      return Ok(InterfaceSpec {
        interface: Interface::Addr(addr.ip()),
        port: addr.port(),
      });
    }

    let Some((name, port)) = s.rsplit_once(':') else {
      return Ok(InterfaceSpec { interface: Interface::Name(s.into()), port: 0 });
    };

    let port = port
      .parse::<u16>()
      .map_err(|_| Error::invalid(format!("malformed local port in {s:?}")))?;
    let name = name.trim_start_matches('[').trim_end_matches(']');
    let interface = if name.is_empty() {
      Interface::Any
    } else if let Ok(ip) = name.parse::<IpAddr>() {
      Interface::Addr(ip)
    } else if name.contains(':') {
      return Err(Error::invalid(format!("malformed interface {s:?}")));
    } else {
      Interface::Name(name.into())
    };

    Ok(InterfaceSpec { interface, port })
  }
}

/// Where a [`Channel`](crate::Channel) connects to.
///
/// ```
/// use lio_socket::{Endpoint, Families, Family};
///
/// let endpoint = Endpoint::new("example.com", 443)
///   .with_families(Families::prefer(Family::V6));
/// assert_eq!(endpoint.port(), 443);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
  host: String,
  port: u16,
  interface: Option<InterfaceSpec>,
  families: Families,
}

impl Endpoint {
  /// `host` may be a domain name, an IP literal, or `localhost`/`loopback`.
  pub fn new(host: impl Into<String>, port: u16) -> Self {
    Endpoint {
      host: host.into(),
      port,
      interface: None,
      families: Families::default(),
    }
  }

  /// Bind outgoing connections to `interface` first.
  pub fn with_interface(mut self, interface: InterfaceSpec) -> Self {
    self.interface = Some(interface);
    self
  }

  /// Parses `interface` (see [`InterfaceSpec`]) and binds to it.
  pub fn with_interface_str(self, interface: &str) -> Result<Self> {
    Ok(self.with_interface(interface.parse()?))
  }

  pub fn with_families(mut self, families: Families) -> Self {
    self.families = families;
    self
  }

  pub fn host(&self) -> &str {
    &self.host
  }

  pub fn port(&self) -> u16 {
    self.port
  }

  pub fn interface(&self) -> Option<&InterfaceSpec> {
    self.interface.as_ref()
  }

  pub fn families(&self) -> Families {
    self.families
  }
}
