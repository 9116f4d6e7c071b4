//! # lio-socket - Buffered, Deadline-Bounded TCP Channels
//!
//! Synchronous TCP connections for implementing line- and length-framed
//! protocols. A [`Channel`] resolves an [`Endpoint`], tries every candidate
//! address under one aggregate deadline, and then serves reads out of a
//! page-aligned buffer sized in whole TCP segments.
//!
//! ## Features
//! - **Exact-length and delimiter reads** ([`Channel::read_exact`],
//!   [`Channel::read_until`]) that never lose bytes on a timeout.
//! - **Per-call deadlines**: the configured timeout is anchored at the start
//!   of every blocking call. A zero timeout is a single readiness check.
//! - **Multi-address connect** with a family preference and an optional
//!   local interface/port to bind first.
//! - **Cross-thread close**: [`Channel::close`] unblocks a read, write or
//!   connect waiting on another thread.
//! - **Segment size tuning** that resizes the buffer without dropping unread
//!   data.
//!
//! ## Platform support
//!
//! | Platform   | Readiness         | Status |
//! |------------|-------------------|--------|
//! | Linux      | epoll             | Yes    |
//! | macOS      | kqueue            | Yes    |
//! | Other Unix | poll/event ports  | Yes    |
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use lio_socket::{CRLF, Channel, Endpoint};
//!
//! fn main() -> lio_socket::Result<()> {
//!   let endpoint = Endpoint::new("localhost", 2525);
//!   let channel = Channel::new(endpoint, Some(Duration::from_secs(10)))?;
//!   channel.connect()?;
//!
//!   let banner = channel.read_until(CRLF)?;
//!   println!("{}", String::from_utf8_lossy(&banner));
//!
//!   channel.write_all(b"QUIT\r\n")?;
//!   channel.close()
//! }
//! ```
//!
//! ## Threading
//!
//! A channel runs one blocking operation at a time. A second thread that
//! calls into a busy channel gets [`Error::Busy`] straight away. Separate
//! channels share nothing.
//!
//! ## Error Handling
//!
//! Every operation returns [`Result`]. [`Error::Timeout`] leaves the channel
//! usable; [`Error::Closed`] and [`Error::Io`] mean it has to be closed.

#[macro_use]
mod macros;

mod buf;
mod channel;
mod deadline;
mod endpoint;
mod error;
mod establish;
mod listener;
mod net_utils;
mod readiness;
mod resolve;

pub use buf::{DEFAULT_SEGMENT_SIZE, MAX_BUFFER_SIZE, MIN_BUFFER_SIZE};
pub use channel::{Channel, ChannelState};
pub use endpoint::{Endpoint, Families, Family, Interface, InterfaceSpec};
pub use error::{Error, Result};
pub use listener::Listener;
pub use resolve::{Candidate, resolve};

/// Carriage return and line feed.
pub const CRLF: &[u8] = b"\r\n";
/// Carriage return.
pub const CR: &[u8] = b"\r";
/// Line feed.
pub const LF: &[u8] = b"\n";
/// A single zero byte.
pub const NUL: &[u8] = b"\0";
