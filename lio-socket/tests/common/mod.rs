#![allow(dead_code)]

use std::{
  net::{TcpListener, TcpStream},
  sync::Once,
  time::Duration,
};

use lio_socket::{Channel, Endpoint};
use tracing_subscriber::EnvFilter;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Installs a test-writer subscriber once; `RUST_LOG=lio_socket=trace` shows
/// the channel's events.
pub fn init_tracing() {
  static INIT: Once = Once::new();
  INIT.call_once(|| {
    let _ = tracing_subscriber::fmt()
      .with_env_filter(EnvFilter::from_default_env())
      .with_test_writer()
      .try_init();
  });
}

/// A channel connected to a plain std stream on loopback.
pub fn pair() -> (Channel, TcpStream) {
  pair_with_timeout(Some(TIMEOUT))
}

pub fn pair_with_timeout(timeout: Option<Duration>) -> (Channel, TcpStream) {
  init_tracing();
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let port = listener.local_addr().unwrap().port();

  let channel = Channel::new(Endpoint::new("127.0.0.1", port), timeout).unwrap();
  channel.connect().unwrap();
  let (peer, _) = listener.accept().unwrap();
  peer.set_nodelay(true).unwrap();
  (channel, peer)
}

/// A loopback port nothing is listening on.
pub fn closed_port() -> u16 {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  listener.local_addr().unwrap().port()
}
