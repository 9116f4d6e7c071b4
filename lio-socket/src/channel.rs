//! The buffered TCP channel.
//!
//! A [`Channel`] owns one socket and one [`SegmentBuffer`]. Blocking calls
//! take the I/O lock with `try_lock`, so a second caller gets
//! [`Error::Busy`] instead of waiting its turn. [`Channel::close`] is the one
//! call that may run alongside a blocked operation: it flips the state to
//! closed first, wakes the readiness wait, and only then takes the lock to
//! release the socket.

use std::{
  fmt,
  io::{self, Read},
  net::{Shutdown, SocketAddr},
  os::fd::{AsFd, AsRawFd, OwnedFd, RawFd},
  sync::{
    OnceLock,
    atomic::{AtomicI32, AtomicU8, AtomicUsize, Ordering},
  },
  time::Duration,
};

use parking_lot::Mutex;
use socket2::Socket;
use tracing::{debug, trace};

use crate::{
  buf::{DEFAULT_SEGMENT_SIZE, SegmentBuffer},
  deadline::Deadline,
  endpoint::Endpoint,
  error::{Error, Result},
  establish::Establish,
  net_utils::{self, SEND_FLAGS},
  readiness::{Interest, Readiness},
  resolve::resolve,
};

/// Lifecycle of a [`Channel`].
///
/// ```text
/// Disconnected -> Connecting -> Connected -> ShutDown
///       ^              |            |           |
///       +--------------+            +-----------+--> Disconnected (peer gone)
///
/// any state -> Closed (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
  /// No connection. Either never connected, or the last connect failed, or
  /// the peer went away. In the last case bytes that arrived before the peer
  /// left can still be read.
  Disconnected,
  /// A `connect` is in progress.
  Connecting,
  /// Reads and writes are possible.
  Connected,
  /// The write half is shut down; buffered and in-flight inbound bytes can
  /// still be read.
  ShutDown,
  /// Released. Every further operation fails with [`Error::Closed`].
  Closed,
}

impl ChannelState {
  fn from_u8(raw: u8) -> Self {
    match raw {
      0 => ChannelState::Disconnected,
      1 => ChannelState::Connecting,
      2 => ChannelState::Connected,
      3 => ChannelState::ShutDown,
      _ => ChannelState::Closed,
    }
  }
}

struct StateCell(AtomicU8);

impl StateCell {
  fn new(state: ChannelState) -> Self {
    StateCell(AtomicU8::new(state as u8))
  }

  fn get(&self) -> ChannelState {
    ChannelState::from_u8(self.0.load(Ordering::Acquire))
  }

  fn transition(&self, from: ChannelState, to: ChannelState) -> bool {
    let moved = self
      .0
      .compare_exchange(
        from as u8,
        to as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
      )
      .is_ok();
    if moved {
      trace!(?from, ?to, "channel state");
    }
    moved
  }

  fn replace(&self, to: ChannelState) -> ChannelState {
    ChannelState::from_u8(self.0.swap(to as u8, Ordering::AcqRel))
  }
}

/// Everything a blocking call needs exclusive access to.
#[derive(Default)]
struct Io {
  socket: Option<Socket>,
  buffer: Option<SegmentBuffer>,
  /// Segment size requested before there was a socket to apply it to.
  pending_segment: Option<u32>,
}

impl Io {
  fn release(&mut self) {
    // Dropping the socket closes the descriptor.
    self.socket = None;
    self.buffer = None;
  }
}

#[derive(Debug, Clone, Copy)]
struct Addrs {
  local: Option<SocketAddr>,
  peer: Option<SocketAddr>,
}

/// A synchronous TCP connection with a segment-sized receive buffer and a
/// per-call deadline.
///
/// Every blocking call anchors the configured timeout at its own start. A
/// call that times out leaves the channel usable and keeps every byte it
/// already received buffered for the next read.
///
/// ```no_run
/// use std::time::Duration;
/// use lio_socket::{CRLF, Channel, Endpoint};
///
/// # fn main() -> lio_socket::Result<()> {
/// let endpoint = Endpoint::new("localhost", 8080);
/// let channel = Channel::new(endpoint, Some(Duration::from_secs(5)))?;
/// channel.connect()?;
/// channel.write_all(b"HELLO\r\n")?;
/// let line = channel.read_until(CRLF)?;
/// let body = channel.read_exact(16)?;
/// channel.close()?;
/// # Ok(())
/// # }
/// ```
pub struct Channel {
  endpoint: Option<Endpoint>,
  state: StateCell,
  io: Mutex<Io>,
  readiness: Readiness,
  timeout: Mutex<Option<Duration>>,
  segment_size: AtomicUsize,
  raw_fd: AtomicI32,
  addrs: OnceLock<Addrs>,
  last_error: Mutex<Option<String>>,
}

impl Channel {
  /// An unconnected channel for `endpoint`.
  ///
  /// `timeout` bounds every blocking call; `None` lets them block forever and
  /// `Some(Duration::ZERO)` makes each wait a single readiness check.
  pub fn new(endpoint: Endpoint, timeout: Option<Duration>) -> Result<Self> {
    Self::with_state(Some(endpoint), ChannelState::Disconnected, timeout)
  }

  /// Wraps an already connected stream socket, such as one returned by
  /// `accept(2)`.
  pub fn from_fd(
    fd: impl Into<OwnedFd>,
    timeout: Option<Duration>,
  ) -> Result<Self> {
    let socket = Socket::from(fd.into());
    if socket.peer_addr().is_err() {
      return Err(Error::invalid("descriptor is not a connected socket"));
    }
    Self::from_socket(socket, timeout)
  }

  pub(crate) fn from_socket(
    socket: Socket,
    timeout: Option<Duration>,
  ) -> Result<Self> {
    socket.set_nonblocking(true)?;
    net_utils::suppress_sigpipe(&socket)?;

    let channel = Self::with_state(None, ChannelState::Connected, timeout)?;
    channel.adopt(&mut channel.io.lock(), socket)?;
    Ok(channel)
  }

  fn with_state(
    endpoint: Option<Endpoint>,
    state: ChannelState,
    timeout: Option<Duration>,
  ) -> Result<Self> {
    Ok(Channel {
      endpoint,
      state: StateCell::new(state),
      io: Mutex::new(Io::default()),
      readiness: Readiness::new()?,
      timeout: Mutex::new(timeout),
      segment_size: AtomicUsize::new(DEFAULT_SEGMENT_SIZE),
      raw_fd: AtomicI32::new(-1),
      addrs: OnceLock::new(),
      last_error: Mutex::new(None),
    })
  }

  /// Connects using the channel's configured timeout as the aggregate
  /// deadline for every candidate address.
  pub fn connect(&self) -> Result<()> {
    let timeout = self.timeout();
    self.record(self.connect_within(timeout))
  }

  /// Like [`connect`](Self::connect), with an explicit aggregate deadline.
  pub fn connect_with_timeout(&self, timeout: Duration) -> Result<()> {
    self.record(self.connect_within(Some(timeout)))
  }

  fn connect_within(&self, timeout: Option<Duration>) -> Result<()> {
    use ChannelState::{Connected, Connecting, Disconnected};

    self.expect_state(Disconnected)?;
    let Some(endpoint) = &self.endpoint else {
      return Err(Error::Closed);
    };
    let mut io = self.io.try_lock().ok_or(Error::Busy)?;
    if io.socket.is_some() {
      // The peer went away; this channel has to be closed, not reused.
      return Err(Error::Closed);
    }
    if !self.state.transition(Disconnected, Connecting) {
      return Err(Error::Closed);
    }

    debug!(
      host = endpoint.host(),
      port = endpoint.port(),
      ?timeout,
      "connecting"
    );
    let established = Establish {
      interface: endpoint.interface(),
      segment_size: io.pending_segment,
      deadline: Deadline::after(timeout),
      readiness: &self.readiness,
      cancelled: &|| self.is_closing(),
    };
    let outcome = resolve(endpoint)
      .and_then(|candidates| established.run(&candidates))
      .and_then(|socket| self.adopt(&mut io, socket));

    match outcome {
      Ok(()) if self.state.transition(Connecting, Connected) => Ok(()),
      Ok(()) => {
        io.release();
        Err(Error::Closed)
      }
      Err(err) => {
        self.state.transition(Connecting, Disconnected);
        Err(err)
      }
    }
  }

  /// Installs a connected socket and a buffer sized for its segment size.
  fn adopt(&self, io: &mut Io, socket: Socket) -> Result<()> {
    let segment = match io.pending_segment.take() {
      Some(requested) => requested as usize,
      None => net_utils::segment_size(&socket)
        .ok()
        .filter(|mss| *mss > 0)
        .map_or(DEFAULT_SEGMENT_SIZE, |mss| mss as usize),
    };
    let buffer = SegmentBuffer::new(segment).map_err(Error::Config)?;

    self.addrs.get_or_init(|| Addrs {
      local: socket.local_addr().ok().and_then(|addr| addr.as_socket()),
      peer: socket.peer_addr().ok().and_then(|addr| addr.as_socket()),
    });
    self.raw_fd.store(socket.as_raw_fd(), Ordering::Release);
    self.segment_size.store(segment, Ordering::Release);
    debug!(
      fd = socket.as_raw_fd(),
      segment,
      capacity = buffer.capacity(),
      "socket adopted"
    );

    io.socket = Some(socket);
    io.buffer = Some(buffer);
    Ok(())
  }

  /// Returns exactly `n` bytes.
  ///
  /// On [`Error::Timeout`] or [`Error::Closed`] nothing already received is
  /// dropped; a later call sees it first, even after the peer has gone.
  pub fn read_exact(&self, n: usize) -> Result<Vec<u8>> {
    self.record(self.read_with(|buffer, fill| buffer.read_exact(n, fill)))
  }

  /// Returns everything up to and including the first `separator`, leaving
  /// whatever follows it buffered.
  ///
  /// An empty separator fails with [`Error::InvalidArgument`] without
  /// touching the socket.
  pub fn read_until(&self, separator: &[u8]) -> Result<Vec<u8>> {
    if separator.is_empty() {
      return self.record(Err(Error::invalid("separator must not be empty")));
    }
    self.record(
      self.read_with(|buffer, fill| buffer.read_until(separator, fill)),
    )
  }

  /// Returns every buffered byte, or if there are none, whatever the next
  /// delivery brings.
  pub fn read_available(&self) -> Result<Vec<u8>> {
    self.record(self.read_with(|buffer, fill| buffer.read_available(fill)))
  }

  fn read_with<T>(
    &self,
    op: impl FnOnce(
      &mut SegmentBuffer,
      &mut dyn FnMut(&mut [u8]) -> Result<usize>,
    ) -> Result<T>,
  ) -> Result<T> {
    let peer_gone = match self.state.get() {
      ChannelState::Connected | ChannelState::ShutDown => false,
      // The socket is kept after the peer goes away so whatever it sent
      // before that can still be read out of the buffer.
      ChannelState::Disconnected => true,
      state => return Err(self.not_connected(state)),
    };
    let mut io = self.io.try_lock().ok_or(Error::Busy)?;
    let Io { socket: Some(socket), buffer: Some(buffer), .. } = &mut *io else {
      return Err(Error::Closed);
    };
    if peer_gone {
      return op(buffer, &mut |_: &mut [u8]| -> Result<usize> {
        Err(Error::Closed)
      });
    }

    let deadline = Deadline::after(self.timeout());
    let result =
      op(buffer, &mut |spare: &mut [u8]| self.receive(socket, &deadline, spare));
    self.disconnect_on_fatal(&result);
    result
  }

  /// One delivery from the socket into `spare`.
  fn receive(
    &self,
    socket: &Socket,
    deadline: &Deadline,
    spare: &mut [u8],
  ) -> Result<usize> {
    loop {
      match (&*socket).read(spare) {
        Ok(0) => {
          debug!(fd = socket.as_raw_fd(), "peer closed connection");
          return Err(Error::Closed);
        }
        Ok(n) => {
          trace!(fd = socket.as_raw_fd(), n, "received");
          return Ok(n);
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
          self.readiness.wait(socket.as_fd(), Interest::Read, deadline, &|| {
            self.is_closing()
          })?;
        }
        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
        Err(err) => return Err(Error::Io(err)),
      }
    }
  }

  /// Sends every byte of `bytes`.
  ///
  /// Fails with [`Error::Timeout`] if the deadline passes with bytes still
  /// unsent. How many were sent before that is not reported.
  pub fn write_all(&self, bytes: &[u8]) -> Result<()> {
    self.record(self.send_all(bytes))
  }

  fn send_all(&self, bytes: &[u8]) -> Result<()> {
    self.expect_state(ChannelState::Connected)?;
    let io = self.io.try_lock().ok_or(Error::Busy)?;
    let Some(socket) = io.socket.as_ref() else {
      return Err(Error::Closed);
    };

    let deadline = Deadline::after(self.timeout());
    let mut sent = 0;
    let result = loop {
      if sent == bytes.len() {
        break Ok(());
      }
      match socket.send_with_flags(&bytes[sent..], SEND_FLAGS) {
        Ok(0) => break Err(Error::Io(io::ErrorKind::WriteZero.into())),
        Ok(n) => {
          trace!(fd = socket.as_raw_fd(), n, "sent");
          sent += n;
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
          if let Err(err) =
            self.readiness.wait(socket.as_fd(), Interest::Write, &deadline, &|| {
              self.is_closing()
            })
          {
            break Err(err);
          }
        }
        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
          debug!(fd = socket.as_raw_fd(), "peer closed connection");
          break Err(Error::Closed);
        }
        Err(err) => break Err(Error::Io(err)),
      }
    };
    self.disconnect_on_fatal(&result);
    result
  }

  /// Shuts down the write half. Reads keep draining inbound data until the
  /// peer closes.
  pub fn shutdown(&self) -> Result<()> {
    self.record(self.shutdown_write())
  }

  fn shutdown_write(&self) -> Result<()> {
    match self.state.get() {
      ChannelState::ShutDown => return Ok(()),
      ChannelState::Connected => {}
      state => return Err(self.not_connected(state)),
    }
    let io = self.io.try_lock().ok_or(Error::Busy)?;
    let socket = io.socket.as_ref().ok_or(Error::Closed)?;
    socket.shutdown(Shutdown::Write)?;
    if !self.state.transition(ChannelState::Connected, ChannelState::ShutDown) {
      return Err(Error::Closed);
    }
    debug!(fd = socket.as_raw_fd(), "write half shut down");
    Ok(())
  }

  /// Releases the socket and the buffer.
  ///
  /// Safe to call from another thread while a read, write or connect is
  /// blocked; that call returns [`Error::Closed`]. Closing twice fails with
  /// [`Error::Closed`].
  pub fn close(&self) -> Result<()> {
    let previous = self.state.replace(ChannelState::Closed);
    if previous == ChannelState::Closed {
      return Err(Error::Closed);
    }
    self.readiness.wake();

    let mut io = self.io.lock();
    io.release();
    self.raw_fd.store(-1, Ordering::Release);
    debug!(?previous, "channel closed");
    Ok(())
  }

  /// Current segment size. Before a connection exists this is the pending
  /// request, or [`DEFAULT_SEGMENT_SIZE`].
  pub fn segment_size(&self) -> usize {
    self.segment_size.load(Ordering::Acquire)
  }

  /// Sets the socket's maximum segment size and resizes the buffer to match.
  ///
  /// Unread bytes move to the new buffer. If the socket rejects the value,
  /// the old buffer stays in place and [`Error::Config`] is returned. Before
  /// connecting, the value is remembered and applied to every candidate
  /// socket.
  pub fn set_segment_size(&self, size: usize) -> Result<()> {
    self.record(self.resegment(size))
  }

  fn resegment(&self, size: usize) -> Result<()> {
    if size == 0 {
      return Err(Error::invalid("segment size must be positive"));
    }
    let mss = u32::try_from(size).map_err(|_| {
      Error::invalid(format!("segment size {size} is too large"))
    })?;
    if self.state.get() == ChannelState::Closed {
      return Err(Error::Closed);
    }

    let mut io = self.io.try_lock().ok_or(Error::Busy)?;
    let Io { socket, buffer, pending_segment } = &mut *io;
    match (socket.as_ref(), buffer.as_ref()) {
      (Some(socket), Some(current)) => {
        let next = current.resegment(size).map_err(Error::Config)?;
        net_utils::set_segment_size(socket, mss).map_err(Error::Config)?;
        debug!(
          fd = socket.as_raw_fd(),
          from = current.segment_size(),
          to = size,
          carried = next.unread().len(),
          capacity = next.capacity(),
          "segment size changed"
        );
        *buffer = Some(next);
      }
      _ => {
        debug!(size, "segment size recorded for next connect");
        *pending_segment = Some(mss);
      }
    }
    self.segment_size.store(size, Ordering::Release);
    Ok(())
  }

  /// Timeout applied to each blocking call.
  pub fn timeout(&self) -> Option<Duration> {
    *self.timeout.lock()
  }

  /// Takes effect from the next blocking call on.
  pub fn set_timeout(&self, timeout: Option<Duration>) {
    *self.timeout.lock() = timeout;
  }

  pub fn state(&self) -> ChannelState {
    self.state.get()
  }

  /// Whether the channel is [`ChannelState::Connected`]. A channel whose
  /// write half is shut down is not.
  pub fn is_connected(&self) -> bool {
    self.state.get() == ChannelState::Connected
  }

  /// Endpoint this channel connects to; `None` for a wrapped descriptor.
  pub fn endpoint(&self) -> Option<&Endpoint> {
    self.endpoint.as_ref()
  }

  /// Host as given in the endpoint, or the peer's address for a wrapped
  /// descriptor.
  pub fn host(&self) -> Option<String> {
    match &self.endpoint {
      Some(endpoint) => Some(endpoint.host().to_owned()),
      None => self.peer_addr().map(|addr| addr.ip().to_string()),
    }
  }

  pub fn port(&self) -> Option<u16> {
    match &self.endpoint {
      Some(endpoint) => Some(endpoint.port()),
      None => self.peer_addr().map(|addr| addr.port()),
    }
  }

  /// Remote address of the connection, once one was made.
  pub fn peer_addr(&self) -> Option<SocketAddr> {
    self.addrs.get().and_then(|addrs| addrs.peer)
  }

  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.addrs.get().and_then(|addrs| addrs.local)
  }

  /// The socket descriptor while the channel holds one.
  pub fn raw_fd(&self) -> Option<RawFd> {
    Some(self.raw_fd.load(Ordering::Acquire)).filter(|fd| *fd >= 0)
  }

  /// Start and length of the receive buffer's allocation.
  ///
  /// The pointer stays valid until the next [`set_segment_size`], a read
  /// that has to grow the buffer, or [`close`]. Bytes in it are only
  /// meaningful while no read is running.
  ///
  /// [`set_segment_size`]: Self::set_segment_size
  /// [`close`]: Self::close
  pub fn raw_buffer(&self) -> Result<(*mut u8, usize)> {
    let mut io = self.io.try_lock().ok_or(Error::Busy)?;
    let buffer = io.buffer.as_mut().ok_or(Error::Closed)?;
    Ok(buffer.raw_parts())
  }

  /// Message of the most recent failed call, for diagnostics only.
  pub fn last_error(&self) -> Option<String> {
    self.last_error.lock().clone()
  }

  fn record<T>(&self, result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
      *self.last_error.lock() = Some(err.to_string());
    }
    result
  }

  fn is_closing(&self) -> bool {
    self.state.get() == ChannelState::Closed
  }

  fn expect_state(&self, expected: ChannelState) -> Result<()> {
    match self.state.get() {
      state if state == expected => Ok(()),
      ChannelState::Connecting => Err(Error::Busy),
      ChannelState::Connected | ChannelState::ShutDown
        if expected == ChannelState::Disconnected =>
      {
        Err(Error::AlreadyConnected)
      }
      state => Err(self.not_connected(state)),
    }
  }

  fn not_connected(&self, state: ChannelState) -> Error {
    trace!(?state, "operation needs a connected channel");
    Error::Closed
  }

  fn disconnect_on_fatal<T>(&self, result: &Result<T>) {
    let Err(err) = result else { return };
    if !err.is_fatal() || self.is_closing() {
      return;
    }
    let moved = self
      .state
      .transition(ChannelState::Connected, ChannelState::Disconnected)
      || self
        .state
        .transition(ChannelState::ShutDown, ChannelState::Disconnected);
    if moved {
      debug!(%err, "channel disconnected");
    }
  }
}

impl fmt::Debug for Channel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Channel")
      .field("endpoint", &self.endpoint)
      .field("state", &self.state())
      .field("fd", &self.raw_fd())
      .field("segment_size", &self.segment_size())
      .field("timeout", &self.timeout())
      .finish_non_exhaustive()
  }
}
