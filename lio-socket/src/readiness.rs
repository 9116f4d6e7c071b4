//! Deadline-bounded readiness waits.
//!
//! Every blocking step (a connect in progress, a read that needs more bytes,
//! a write that needs more room, an accept) ends up here. The wait goes
//! through a [`polling::Poller`], so it is a real multiplexed wait on
//! epoll/kqueue/event ports rather than a spin. The poller's `notify` is
//! what lets [`Channel::close`](crate::Channel::close) on another thread cut
//! a wait short.

use std::{
  io,
  os::fd::{AsRawFd, BorrowedFd},
};

use polling::{Event, Events, Poller};
use tracing::warn;

use crate::{
  deadline::Deadline,
  error::{Error, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
  Read,
  Write,
}

impl Interest {
  fn event(self, key: usize) -> Event {
    match self {
      Interest::Read => Event::readable(key),
      Interest::Write => Event::writable(key),
    }
  }
}

pub(crate) struct Readiness {
  poller: Poller,
}

/// Interests added for one wait, removed again on every exit path.
struct Registration<'a> {
  poller: &'a Poller,
  sources: &'a [BorrowedFd<'a>],
}

impl<'a> Registration<'a> {
  fn add(
    poller: &'a Poller,
    sources: &'a [BorrowedFd<'a>],
    interest: Interest,
  ) -> io::Result<Self> {
    let mut registration = Registration { poller, sources: &sources[..0] };
    for (key, source) in sources.iter().enumerate() {
      // SAFETY: the source outlives this registration, which deletes it from
      // the poller on drop.
      unsafe { poller.add(source.as_raw_fd(), interest.event(key)) }?;
      registration.sources = &sources[..=key];
    }
    Ok(registration)
  }
}

impl Drop for Registration<'_> {
  fn drop(&mut self) {
    for source in self.sources {
      if let Err(err) = self.poller.delete(source) {
        warn!(fd = source.as_raw_fd(), %err, "failed to deregister source");
      }
    }
  }
}

impl Readiness {
  pub(crate) fn new() -> io::Result<Self> {
    Ok(Readiness { poller: Poller::new()? })
  }

  /// Interrupts a wait in progress on another thread, or the next one to
  /// start.
  pub(crate) fn wake(&self) {
    if let Err(err) = self.poller.notify() {
      warn!(%err, "failed to wake readiness wait");
    }
  }

  /// Blocks until `source` is ready for `interest`.
  pub(crate) fn wait(
    &self,
    source: BorrowedFd<'_>,
    interest: Interest,
    deadline: &Deadline,
    cancelled: &dyn Fn() -> bool,
  ) -> Result<()> {
    self.wait_any(&[source], interest, deadline, cancelled).map(|_| ())
  }

  /// Blocks until any of `sources` is ready for `interest` and returns its
  /// index.
  ///
  /// Fails with [`Error::Timeout`] once `deadline` passes without readiness
  /// (a zero deadline checks exactly once), and with [`Error::Closed`] as
  /// soon as `cancelled` reports true after a wakeup.
  pub(crate) fn wait_any(
    &self,
    sources: &[BorrowedFd<'_>],
    interest: Interest,
    deadline: &Deadline,
    cancelled: &dyn Fn() -> bool,
  ) -> Result<usize> {
    if cancelled() {
      return Err(Error::Closed);
    }
    let _registration = Registration::add(&self.poller, sources, interest)?;
    let mut events = Events::new();

    loop {
      events.clear();
      match self.poller.wait(&mut events, deadline.remaining()) {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
        Err(err) => return Err(Error::Io(err)),
      }

      if cancelled() {
        return Err(Error::Closed);
      }
      if let Some(event) = events.iter().next() {
        return Ok(event.key);
      }
      if deadline.expired() {
        return Err(Error::Timeout);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{
    io::Write,
    net::{TcpListener, TcpStream},
    os::fd::AsFd,
    sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
  };

  fn pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
  }

  #[test]
  fn zero_deadline_checks_once() {
    let readiness = Readiness::new().unwrap();
    let (client, _server) = pair();
    let start = Instant::now();
    let deadline = Deadline::after(Some(Duration::ZERO));
    let err = readiness
      .wait(client.as_fd(), Interest::Read, &deadline, &|| false)
      .unwrap_err();
    assert!(err.is_timeout());
    assert!(start.elapsed() < Duration::from_secs(1));
  }

  #[test]
  fn zero_deadline_sees_ready_source() {
    let readiness = Readiness::new().unwrap();
    let (client, _server) = pair();
    let deadline = Deadline::after(Some(Duration::ZERO));
    readiness.wait(client.as_fd(), Interest::Write, &deadline, &|| false).unwrap();
  }

  #[test]
  fn times_out_after_deadline() {
    let readiness = Readiness::new().unwrap();
    let (client, _server) = pair();
    let start = Instant::now();
    let deadline = Deadline::after(Some(Duration::from_millis(50)));
    let err = readiness
      .wait(client.as_fd(), Interest::Read, &deadline, &|| false)
      .unwrap_err();
    assert!(err.is_timeout());
    assert!(start.elapsed() >= Duration::from_millis(50));
  }

  #[test]
  fn becomes_readable() {
    let readiness = Readiness::new().unwrap();
    let (client, mut server) = pair();
    server.write_all(b"x").unwrap();
    let deadline = Deadline::after(Some(Duration::from_secs(5)));
    readiness.wait(client.as_fd(), Interest::Read, &deadline, &|| false).unwrap();
  }

  #[test]
  fn reports_which_source_is_ready() {
    let readiness = Readiness::new().unwrap();
    let (quiet, _quiet_peer) = pair();
    let (loud, mut loud_peer) = pair();
    loud_peer.write_all(b"x").unwrap();
    let deadline = Deadline::after(Some(Duration::from_secs(5)));
    let index = readiness
      .wait_any(&[quiet.as_fd(), loud.as_fd()], Interest::Read, &deadline, &|| false)
      .unwrap();
    assert_eq!(index, 1);
  }

  #[test]
  fn wake_cancels_unbounded_wait() {
    let readiness = Arc::new(Readiness::new().unwrap());
    let cancelled = Arc::new(AtomicBool::new(false));
    let (client, _server) = pair();

    let waiter = {
      let readiness = readiness.clone();
      let cancelled = cancelled.clone();
      thread::spawn(move || {
        readiness.wait(client.as_fd(), Interest::Read, &Deadline::never(), &|| {
          cancelled.load(Ordering::SeqCst)
        })
      })
    };

    thread::sleep(Duration::from_millis(50));
    cancelled.store(true, Ordering::SeqCst);
    readiness.wake();
    assert!(matches!(waiter.join().unwrap(), Err(Error::Closed)));
  }

  #[test]
  fn source_can_be_waited_on_again() {
    let readiness = Readiness::new().unwrap();
    let (client, _server) = pair();
    let deadline = Deadline::after(Some(Duration::ZERO));
    for _ in 0..3 {
      readiness.wait(client.as_fd(), Interest::Write, &deadline, &|| false).unwrap();
    }
  }
}
