//! Multi-address connection establishment under one aggregate deadline.

use std::{io, os::fd::AsFd};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace};

use crate::{
  deadline::Deadline,
  endpoint::InterfaceSpec,
  error::{Error, Result},
  net_utils,
  readiness::{Interest, Readiness},
  resolve::{Candidate, resolve_interface},
};

/// Everything one connect sequence needs besides the candidates.
pub(crate) struct Establish<'a> {
  pub(crate) interface: Option<&'a InterfaceSpec>,
  pub(crate) segment_size: Option<u32>,
  pub(crate) deadline: Deadline,
  pub(crate) readiness: &'a Readiness,
  pub(crate) cancelled: &'a dyn Fn() -> bool,
}

impl Establish<'_> {
  /// Tries `candidates` in order and returns the first connected socket.
  ///
  /// The deadline is shared by all attempts: each one gets whatever time the
  /// previous attempts left over. Once it has passed no further candidate is
  /// tried.
  pub(crate) fn run(&self, candidates: &[Candidate]) -> Result<Socket> {
    let mut last_failure = None;

    for candidate in candidates {
      trace!(addr = %candidate.addr(), "attempting connection");
      match self.attempt(candidate) {
        Ok(socket) => {
          debug!(addr = %candidate.addr(), "connected");
          return Ok(socket);
        }
        Err(Error::Closed) => return Err(Error::Closed),
        Err(err) => {
          debug!(addr = %candidate.addr(), %err, "connection attempt failed");
          last_failure = Some(io::Error::from(err));
        }
      }

      if self.deadline.expired() {
        break;
      }
    }

    Err(Error::Connection(last_failure.unwrap_or_else(|| {
      io::Error::new(io::ErrorKind::AddrNotAvailable, "no candidate addresses")
    })))
  }

  fn attempt(&self, candidate: &Candidate) -> Result<Socket> {
    let addr = candidate.addr();
    let socket =
      Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    net_utils::suppress_sigpipe(&socket)?;

    if let Some(mss) = self.segment_size {
      net_utils::set_segment_size(&socket, mss).map_err(Error::Config)?;
    }
    if let Some(interface) = self.interface {
      let local = resolve_interface(interface, candidate.family())?;
      trace!(%local, "binding before connect");
      socket.bind(&local.into())?;
    }

    match socket.connect(&addr.into()) {
      Ok(()) => return Ok(socket),
      Err(err)
        if err.raw_os_error() == Some(libc::EINPROGRESS)
          || err.kind() == io::ErrorKind::WouldBlock
          || err.kind() == io::ErrorKind::Interrupted => {}
      Err(err) => return Err(Error::Io(err)),
    }

    self.readiness.wait(
      socket.as_fd(),
      Interest::Write,
      &self.deadline,
      self.cancelled,
    )?;

    match socket.take_error()? {
      Some(err) => Err(Error::Io(err)),
      None => Ok(socket),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{
    net::{SocketAddr, TcpListener},
    time::{Duration, Instant},
  };

  static NOT_CANCELLED: fn() -> bool = || false;

  fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
  }

  fn establish<'a>(
    readiness: &'a Readiness,
    timeout: Option<Duration>,
  ) -> Establish<'a> {
    Establish {
      interface: None,
      segment_size: None,
      deadline: Deadline::after(timeout),
      readiness,
      cancelled: &NOT_CANCELLED,
    }
  }

  #[test]
  fn falls_back_to_next_candidate() {
    let readiness = Readiness::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let refused = closed_port();
    let open = listener.local_addr().unwrap();

    let socket = establish(&readiness, Some(Duration::from_secs(5)))
      .run(&[Candidate::new(refused), Candidate::new(open)])
      .unwrap();
    let peer = socket.peer_addr().unwrap().as_socket().unwrap();
    assert_eq!(peer, open);
  }

  #[test]
  fn stops_at_first_success() {
    let readiness = Readiness::new().unwrap();
    let first = TcpListener::bind("127.0.0.1:0").unwrap();
    let second = TcpListener::bind("127.0.0.1:0").unwrap();
    second.set_nonblocking(true).unwrap();

    establish(&readiness, None)
      .run(&[
        Candidate::new(first.local_addr().unwrap()),
        Candidate::new(second.local_addr().unwrap()),
      ])
      .unwrap();
    first.accept().unwrap();
    assert!(second.accept().is_err());
  }

  #[test]
  fn all_candidates_failing_reports_last_error() {
    let readiness = Readiness::new().unwrap();
    let err = establish(&readiness, Some(Duration::from_secs(5)))
      .run(&[Candidate::new(closed_port()), Candidate::new(closed_port())])
      .unwrap_err();
    match err {
      Error::Connection(source) => {
        assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused)
      }
      other => panic!("unexpected error: {other:?}"),
    }
  }

  #[test]
  fn no_candidates_is_a_connection_error() {
    let readiness = Readiness::new().unwrap();
    let err = establish(&readiness, None).run(&[]).unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
  }

  #[test]
  fn cancelled_attempt_reports_closed() {
    let readiness = Readiness::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let start = Instant::now();
    let err = Establish { cancelled: &|| true, ..establish(&readiness, None) }
      .run(&[Candidate::new(listener.local_addr().unwrap())]);
    // A loopback connect may complete immediately; if it had to wait, the
    // cancellation must have stopped it.
    if let Err(err) = err {
      assert!(matches!(err, Error::Closed));
    }
    assert!(start.elapsed() < Duration::from_secs(5));
  }

  #[test]
  fn binds_requested_local_port() {
    let readiness = Readiness::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let local_port = closed_port().port();
    let interface: InterfaceSpec =
      format!("127.0.0.1:{local_port}").parse().unwrap();

    let socket = Establish {
      interface: Some(&interface),
      ..establish(&readiness, Some(Duration::from_secs(5)))
    }
    .run(&[Candidate::new(listener.local_addr().unwrap())])
    .unwrap();
    let local = socket.local_addr().unwrap().as_socket().unwrap();
    assert_eq!(local.port(), local_port);
  }

  #[test]
  fn applies_segment_size_before_connect() {
    let readiness = Readiness::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let socket = Establish {
      segment_size: Some(1200),
      ..establish(&readiness, Some(Duration::from_secs(5)))
    }
    .run(&[Candidate::new(listener.local_addr().unwrap())])
    .unwrap();
    let mss = net_utils::segment_size(&socket).unwrap();
    assert!(mss > 0 && mss <= 1200, "mss = {mss}");
  }
}
