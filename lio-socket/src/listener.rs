//! Accepting side: one listening socket per enabled family on a shared port.

use std::{
  io,
  net::SocketAddr,
  os::fd::{AsFd, AsRawFd, BorrowedFd},
  time::Duration,
};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};

use crate::{
  channel::Channel,
  deadline::Deadline,
  endpoint::{Families, Family},
  error::{Error, Result},
  readiness::{Interest, Readiness},
  resolve::unspecified,
};

const BACKLOG: i32 = 128;

/// Listens on a port for every enabled family and hands out accepted
/// connections as [`Channel`]s.
///
/// With both families enabled the IPv6 socket is made v6-only, so the two
/// sockets split the traffic between them instead of the IPv6 one also
/// taking IPv4-mapped connections.
///
/// ```no_run
/// use std::time::Duration;
/// use lio_socket::{Families, Listener};
///
/// # fn main() -> lio_socket::Result<()> {
/// let listener = Listener::bind(0, Families::default())?
///   .with_timeout(Some(Duration::from_secs(5)));
/// let channel = listener.accept()?;
/// let greeting = channel.read_available()?;
/// channel.write_all(&greeting)?;
/// # Ok(())
/// # }
/// ```
pub struct Listener {
  sockets: Vec<(Family, Socket)>,
  readiness: Readiness,
  /// Held for the whole of an `accept`; the sockets can only be registered
  /// with `readiness` once at a time.
  accepting: Mutex<()>,
  timeout: Option<Duration>,
}

impl Listener {
  /// Binds `port` (`0` picks one) on the unspecified address of every
  /// enabled family, preferred family first.
  ///
  /// When a later family cannot be bound, for example on a host without
  /// IPv6, it is skipped with a warning as long as one socket is bound.
  pub fn bind(port: u16, families: Families) -> Result<Self> {
    let mut sockets: Vec<(Family, Socket)> = Vec::new();
    let dual = families.ipv4 && families.ipv6;

    for family in families.ordered() {
      let port = match sockets.first() {
        Some((_, first)) if port == 0 => local_port(first)?,
        _ => port,
      };
      match listen(family, port, dual) {
        Ok(socket) => {
          debug!(%family, port = local_port(&socket)?, "listening");
          sockets.push((family, socket));
        }
        Err(err) if !sockets.is_empty() => {
          warn!(%family, port, %err, "skipping family that cannot be bound");
        }
        Err(err) => return Err(err),
      }
    }

    if sockets.is_empty() {
      return Err(Error::invalid("no address family enabled"));
    }
    Ok(Listener {
      sockets,
      readiness: Readiness::new()?,
      accepting: Mutex::new(()),
      timeout: None,
    })
  }

  /// Timeout for [`accept`](Self::accept), also handed to every accepted
  /// channel.
  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.timeout
  }

  /// The port every socket is bound to.
  pub fn port(&self) -> Result<u16> {
    match self.sockets.first() {
      Some((_, socket)) => local_port(socket),
      None => Err(Error::Closed),
    }
  }

  pub fn local_addrs(&self) -> Result<Vec<SocketAddr>> {
    self.sockets.iter().map(|(_, socket)| local_addr(socket)).collect()
  }

  /// Waits for a connection on any of the listening sockets.
  ///
  /// One `accept` runs at a time; a concurrent caller gets [`Error::Busy`].
  pub fn accept(&self) -> Result<Channel> {
    let _accepting = self.accepting.try_lock().ok_or(Error::Busy)?;
    let deadline = Deadline::after(self.timeout);
    let fds: Vec<BorrowedFd<'_>> =
      self.sockets.iter().map(|(_, socket)| socket.as_fd()).collect();

    loop {
      let ready =
        self.readiness.wait_any(&fds, Interest::Read, &deadline, &|| false)?;
      let (family, socket) = &self.sockets[ready];

      match socket.accept() {
        Ok((stream, peer)) => {
          debug!(
            %family,
            fd = stream.as_raw_fd(),
            peer = ?peer.as_socket(),
            "accepted connection"
          );
          return Channel::from_socket(stream, self.timeout);
        }
        // Another process may have taken the connection first.
        Err(err)
          if err.kind() == io::ErrorKind::WouldBlock
            || err.kind() == io::ErrorKind::Interrupted
            || err.kind() == io::ErrorKind::ConnectionAborted =>
        {
          trace!(%family, %err, "accept retry");
        }
        Err(err) => return Err(Error::Io(err)),
      }
    }
  }
}

fn listen(family: Family, port: u16, dual: bool) -> Result<Socket> {
  let domain = match family {
    Family::V4 => Domain::IPV4,
    Family::V6 => Domain::IPV6,
  };
  let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
  socket.set_reuse_address(true)?;
  if family == Family::V6 && dual {
    socket.set_only_v6(true)?;
  }
  socket.set_nonblocking(true)?;
  socket.bind(&SocketAddr::new(unspecified(family), port).into())?;
  socket.listen(BACKLOG)?;
  Ok(socket)
}

fn local_addr(socket: &Socket) -> Result<SocketAddr> {
  socket.local_addr()?.as_socket().ok_or_else(|| {
    Error::Io(io::Error::new(
      io::ErrorKind::InvalidData,
      "listening socket has no IP address",
    ))
  })
}

fn local_port(socket: &Socket) -> Result<u16> {
  local_addr(socket).map(|addr| addr.port())
}
