//! Endpoint to candidate address resolution.
//!
//! Candidates come out grouped by family: every address of the preferred
//! family in resolver order, then the other family's in resolver order.
//! Addresses of disabled families are dropped.

use std::{
  io,
  net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
};

use tracing::{debug, trace};

use crate::{
  endpoint::{Endpoint, Families, Family, Interface, InterfaceSpec},
  error::{Error, Result},
  net_utils,
};

/// One resolved address a connection can be attempted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Candidate(SocketAddr);

impl Candidate {
  pub fn new(addr: SocketAddr) -> Self {
    Candidate(addr)
  }

  pub fn addr(&self) -> SocketAddr {
    self.0
  }

  pub fn family(&self) -> Family {
    Family::of(&self.0)
  }
}

impl From<SocketAddr> for Candidate {
  fn from(addr: SocketAddr) -> Self {
    Candidate(addr)
  }
}

fn is_loopback_alias(host: &str) -> bool {
  host.eq_ignore_ascii_case("localhost") || host.eq_ignore_ascii_case("loopback")
}

fn loopback(family: Family) -> IpAddr {
  match family {
    Family::V4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
    Family::V6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
  }
}

pub(crate) fn unspecified(family: Family) -> IpAddr {
  match family {
    Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
  }
}

/// Resolves `endpoint` into ordered connection candidates.
///
/// `localhost` and `loopback` map straight to `127.0.0.1` and `::1` without
/// a lookup. IP literals (optionally bracketed) are used as-is. Anything else
/// goes through the system resolver.
pub fn resolve(endpoint: &Endpoint) -> Result<Vec<Candidate>> {
  let host = endpoint.host().trim();
  if host.is_empty() {
    return Err(Error::invalid("host must not be empty"));
  }
  let port = endpoint.port();

  let found: Vec<SocketAddr> = if is_loopback_alias(host) {
    [Family::V4, Family::V6]
      .into_iter()
      .map(|family| SocketAddr::new(loopback(family), port))
      .collect()
  } else if let Ok(ip) =
    host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>()
  {
    vec![SocketAddr::new(ip, port)]
  } else {
    (host, port)
      .to_socket_addrs()
      .map_err(|source| Error::Resolution { host: host.into(), source })?
      .collect()
  };
  trace!(host, ?found, "resolver returned");

  let candidates = order(found, endpoint.families());
  if candidates.is_empty() {
    return Err(Error::Resolution {
      host: host.into(),
      source: io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        "no usable address for the enabled families",
      ),
    });
  }

  debug!(host, port, candidates = candidates.len(), "resolved endpoint");
  Ok(candidates)
}

/// Stable partition by family preference, dropping disabled families and
/// duplicates.
pub(crate) fn order(
  addrs: impl IntoIterator<Item = SocketAddr>,
  families: Families,
) -> Vec<Candidate> {
  let mut unique: Vec<SocketAddr> = Vec::new();
  for addr in addrs {
    if !unique.contains(&addr) {
      unique.push(addr);
    }
  }

  families
    .ordered()
    .flat_map(|family| {
      unique
        .iter()
        .filter(move |addr| Family::of(addr) == family)
        .map(|addr| Candidate(*addr))
    })
    .collect()
}

/// Local address to bind before connecting to a `family` candidate.
pub(crate) fn resolve_interface(
  spec: &InterfaceSpec,
  family: Family,
) -> Result<SocketAddr> {
  let ip = match &spec.interface {
    Interface::Any => unspecified(family),
    Interface::Addr(ip) if Family::of_ip(ip) == family => *ip,
    Interface::Addr(ip) => {
      return Err(Error::invalid(format!(
        "interface address {ip} cannot reach an {family} candidate"
      )));
    }
    Interface::Name(name) if is_loopback_alias(name) => loopback(family),
    Interface::Name(name) => {
      let addrs = net_utils::interface_addrs(name)?;
      let Some(mut addr) =
        addrs.into_iter().find(|addr| Family::of(addr) == family)
      else {
        return Err(Error::invalid(format!(
          "interface {name} has no {family} address"
        )));
      };
      addr.set_port(spec.port);
      return Ok(addr);
    }
  };

  Ok(SocketAddr::new(ip, spec.port))
}
