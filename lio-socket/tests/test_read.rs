mod common;

use std::{
  io::Write,
  net::TcpStream,
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use lio_socket::{CRLF, Error, LF};
use proptest::prelude::*;

use common::{pair, pair_with_timeout};

fn trickle(mut peer: TcpStream, chunks: Vec<Vec<u8>>) -> JoinHandle<()> {
  thread::spawn(move || {
    for chunk in chunks {
      peer.write_all(&chunk).unwrap();
      peer.flush().unwrap();
      thread::sleep(Duration::from_micros(200));
    }
    // Keep the connection open until the reader is done.
    thread::sleep(Duration::from_millis(200));
  })
}

#[test]
fn read_exact_across_fragmented_writes() {
  let (channel, peer) = pair();
  let chunks = [&b"he"[..], b"l", b"lo, w", b"orld"];
  let writer = trickle(peer, chunks.map(<[u8]>::to_vec).to_vec());

  assert_eq!(channel.read_exact(5).unwrap(), b"hello");
  assert_eq!(channel.read_exact(7).unwrap(), b", world");
  writer.join().unwrap();
}

#[test]
fn read_exact_zero_returns_empty() {
  let (channel, _peer) = pair();
  assert_eq!(channel.read_exact(0).unwrap(), b"");
}

#[test]
fn read_until_byte_by_byte_separator() {
  let (channel, peer) = pair();
  let chunks = b"EHLO example.org\r\n".iter().map(|b| vec![*b]).collect();
  let writer = trickle(peer, chunks);

  assert_eq!(channel.read_until(CRLF).unwrap(), b"EHLO example.org\r\n");
  writer.join().unwrap();
}

#[test]
fn read_until_leaves_trailing_bytes_buffered() {
  let (channel, mut peer) = pair();
  peer.write_all(b"first\nsecond\nthird").unwrap();

  assert_eq!(channel.read_until(LF).unwrap(), b"first\n");
  assert_eq!(channel.read_until(LF).unwrap(), b"second\n");
  assert_eq!(channel.read_exact(5).unwrap(), b"third");
}

#[test]
fn read_until_empty_separator_is_rejected() {
  let (channel, mut peer) = pair();
  peer.write_all(b"data").unwrap();

  let err = channel.read_until(b"").unwrap_err();
  assert!(matches!(err, Error::InvalidArgument(_)));
  assert_eq!(channel.read_exact(4).unwrap(), b"data");
}

#[test]
fn timeout_keeps_partial_read() {
  let timeout = Duration::from_millis(200);
  let (channel, mut peer) = pair_with_timeout(Some(timeout));
  peer.write_all(b"abc").unwrap();

  let start = Instant::now();
  let err = channel.read_exact(5).unwrap_err();
  assert!(err.is_timeout());
  assert!(start.elapsed() >= timeout);
  assert!(channel.is_connected());

  peer.write_all(b"de").unwrap();
  assert_eq!(channel.read_exact(2).unwrap(), b"ab");
  assert_eq!(channel.read_exact(3).unwrap(), b"cde");
}

#[test]
fn read_until_timeout_keeps_scanned_bytes() {
  let timeout = Duration::from_millis(100);
  let (channel, mut peer) = pair_with_timeout(Some(timeout));
  peer.write_all(b"no terminator yet").unwrap();
  assert!(channel.read_until(CRLF).unwrap_err().is_timeout());

  peer.write_all(b"\r\nnext").unwrap();
  assert_eq!(channel.read_until(CRLF).unwrap(), b"no terminator yet\r\n");
  assert_eq!(channel.read_exact(4).unwrap(), b"next");
}

#[test]
fn zero_timeout_checks_once() {
  let (channel, mut peer) = pair_with_timeout(Some(Duration::ZERO));

  let start = Instant::now();
  assert!(channel.read_exact(1).unwrap_err().is_timeout());
  assert!(start.elapsed() < Duration::from_secs(1));

  peer.write_all(b"x").unwrap();
  thread::sleep(Duration::from_millis(50));
  assert_eq!(channel.read_exact(1).unwrap(), b"x");
}

#[test]
fn timeout_change_applies_to_next_call() {
  let (channel, mut peer) = pair_with_timeout(None);
  channel.set_timeout(Some(Duration::from_millis(50)));
  assert_eq!(channel.timeout(), Some(Duration::from_millis(50)));
  assert!(channel.read_exact(1).unwrap_err().is_timeout());

  peer.write_all(b"ok").unwrap();
  assert_eq!(channel.read_exact(2).unwrap(), b"ok");
}

#[test]
fn read_available_returns_buffered_first() {
  let (channel, mut peer) = pair();
  peer.write_all(b"line\nrest").unwrap();

  assert_eq!(channel.read_until(LF).unwrap(), b"line\n");
  let mut rest = channel.read_available().unwrap();
  while rest.len() < 4 {
    rest.extend(channel.read_available().unwrap());
  }
  assert_eq!(rest, b"rest");
}

#[test]
fn large_message_grows_buffer() {
  let (channel, peer) = pair();
  let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
  let chunks = payload.chunks(8192).map(<[u8]>::to_vec).collect();
  let writer = trickle(peer, chunks);

  assert_eq!(channel.read_exact(payload.len()).unwrap(), payload);
  writer.join().unwrap();
}

proptest! {
  #![proptest_config(ProptestConfig::with_cases(16))]

  #[test]
  fn read_exact_any_write_pattern(
    payload in proptest::collection::vec(any::<u8>(), 1..2048),
    cuts in proptest::collection::vec(1usize..256, 1..16),
  ) {
    let (channel, peer) = pair();
    let mut chunks = Vec::new();
    let mut rest = &payload[..];
    for cut in cuts.iter().cycle() {
      if rest.is_empty() {
        break;
      }
      let (head, tail) = rest.split_at((*cut).min(rest.len()));
      chunks.push(head.to_vec());
      rest = tail;
    }
    let writer = trickle(peer, chunks);

    prop_assert_eq!(channel.read_exact(payload.len()).unwrap(), payload);
    writer.join().unwrap();
  }

  #[test]
  fn read_until_any_write_pattern(
    head in proptest::collection::vec(b'a'..=b'z', 0..512),
    tail in proptest::collection::vec(b'a'..=b'z', 1..64),
    cut in 1usize..32,
  ) {
    let (channel, peer) = pair();
    let mut stream = head.clone();
    stream.extend_from_slice(b"\r\n\r\n");
    stream.extend_from_slice(&tail);
    let chunks = stream.chunks(cut).map(<[u8]>::to_vec).collect();
    let writer = trickle(peer, chunks);

    let mut expected = head.clone();
    expected.extend_from_slice(b"\r\n\r\n");
    prop_assert_eq!(channel.read_until(b"\r\n\r\n").unwrap(), expected);
    prop_assert_eq!(channel.read_exact(tail.len()).unwrap(), tail);
    writer.join().unwrap();
  }
}
