//! Error types returned by every channel operation.
//!
//! Each call reports its own outcome through [`Result`]. A [`Channel`]
//! additionally keeps a copy of the last failure message for diagnostics
//! (see [`Channel::last_error`]), but that copy is never the way to detect
//! failure.
//!
//! [`Channel`]: crate::Channel
//! [`Channel::last_error`]: crate::Channel::last_error

use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by resolution, connection and buffered I/O.
#[derive(Debug, Error)]
pub enum Error {
  /// The endpoint yielded no usable address.
  #[error("could not resolve {host}: {source}")]
  Resolution {
    /// Host as given in the endpoint.
    host: String,
    /// Underlying lookup failure.
    #[source]
    source: io::Error,
  },

  /// Every candidate address failed or the aggregate deadline ran out.
  ///
  /// Carries the failure of the last attempt.
  #[error("connection failed: {0}")]
  Connection(#[source] io::Error),

  /// The deadline elapsed before the operation completed.
  ///
  /// The channel stays usable and nothing buffered is lost.
  #[error("operation timed out")]
  Timeout,

  /// The channel was closed locally, the peer closed the connection, or the
  /// operation needs a state the channel is not in.
  #[error("channel closed")]
  Closed,

  /// Unclassified transport failure.
  #[error("I/O error: {0}")]
  Io(#[from] io::Error),

  /// A caller-supplied argument was rejected before any I/O took place.
  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  /// The socket rejected an option, or a buffer could not be allocated.
  #[error("configuration rejected: {0}")]
  Config(#[source] io::Error),

  /// Another blocking operation is already running on this channel.
  #[error("another operation is in progress on this channel")]
  Busy,

  /// `connect` was called on a channel that is already connected.
  #[error("channel is already connected")]
  AlreadyConnected,
}

impl Error {
  pub(crate) fn invalid(msg: impl Into<String>) -> Self {
    Error::InvalidArgument(msg.into())
  }

  /// Returns `true` for [`Error::Timeout`].
  #[must_use]
  pub fn is_timeout(&self) -> bool {
    matches!(self, Error::Timeout)
  }

  /// Returns `true` if the channel can no longer carry data after this error
  /// and must be closed.
  #[must_use]
  pub fn is_fatal(&self) -> bool {
    matches!(self, Error::Closed | Error::Io(_))
  }

  /// The closest [`io::ErrorKind`] for this error.
  pub fn kind(&self) -> io::ErrorKind {
    match self {
      Error::Resolution { source, .. } => source.kind(),
      Error::Connection(err) | Error::Io(err) | Error::Config(err) => {
        err.kind()
      }
      Error::Timeout => io::ErrorKind::TimedOut,
      Error::Closed => io::ErrorKind::NotConnected,
      Error::InvalidArgument(_) => io::ErrorKind::InvalidInput,
      Error::Busy => io::ErrorKind::ResourceBusy,
      Error::AlreadyConnected => io::ErrorKind::AlreadyExists,
    }
  }
}

impl From<Error> for io::Error {
  fn from(err: Error) -> Self {
    match err {
      Error::Io(err) => err,
      other => io::Error::new(other.kind(), other),
    }
  }
}
