//! Page-aligned receive buffer and the exact-length / delimiter read engine.
//!
//! The engine never talks to a socket itself. Reads that need more bytes call
//! a `fill` closure with the spare region of the buffer; the closure blocks
//! until at least one byte arrives (or fails), and returns how many bytes it
//! wrote. Everything committed to the buffer stays there until a read
//! completes, so a failed or timed out read never loses data.
//!
//! # Layout
//!
//! ```text
//! 0          consumed            filled              capacity
//! |----------|===================|-------------------|
//!   already     unread bytes         spare room
//!   returned
//! ```
//!
//! Invariant: `0 <= consumed <= filled <= capacity`.

use std::{
  alloc::{self, Layout},
  io,
  ptr::NonNull,
  slice,
};

use crate::{
  error::{Error, Result},
  net_utils::page_size,
};

/// Segment size assumed until the kernel reports one.
pub const DEFAULT_SEGMENT_SIZE: usize = 1460;

/// Smallest buffer ever allocated, regardless of segment size.
pub const MIN_BUFFER_SIZE: usize = 16 * 1024;

/// Capacity past which a read stops growing the buffer.
///
/// A `read_exact` longer than this, or a `read_until` whose separator has not
/// shown up within this many bytes, fails with [`Error::Config`]. The bytes
/// received so far stay buffered and the connection stays usable.
pub const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Smallest multiple of `segment` that is at least `MIN_BUFFER_SIZE` and at
/// least `at_least`.
pub(crate) fn buffer_capacity(segment: usize, at_least: usize) -> usize {
  let segment = segment.max(1);
  at_least.max(MIN_BUFFER_SIZE).div_ceil(segment) * segment
}

/// Zeroed heap memory aligned to a page boundary.
struct AlignedBuf {
  ptr: NonNull<u8>,
  layout: Layout,
  len: usize,
}

// SAFETY: AlignedBuf uniquely owns its allocation.
unsafe impl Send for AlignedBuf {}
// SAFETY: shared access only hands out `&[u8]`.
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
  fn new(len: usize) -> io::Result<Self> {
    let page = page_size();
    let size = len.max(1).div_ceil(page) * page;
    let layout = Layout::from_size_align(size, page)
      .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

    // SAFETY: layout has a non-zero size.
    let ptr = unsafe { alloc::alloc_zeroed(layout) };
    let ptr =
      NonNull::new(ptr).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;

    Ok(AlignedBuf { ptr, layout, len })
  }

  fn as_slice(&self) -> &[u8] {
    // SAFETY: `len <= layout.size()` and the memory was zero-initialised.
    unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
  }

  fn as_mut_slice(&mut self) -> &mut [u8] {
    // SAFETY: as above, and `&mut self` guarantees exclusivity.
    unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
  }
}

impl Drop for AlignedBuf {
  fn drop(&mut self) {
    // SAFETY: allocated in `new` with this exact layout.
    unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
  }
}

/// The channel's receive buffer, sized in whole segments.
pub(crate) struct SegmentBuffer {
  mem: AlignedBuf,
  segment: usize,
  limit: usize,
  consumed: usize,
  filled: usize,
}

impl SegmentBuffer {
  pub(crate) fn new(segment: usize) -> io::Result<Self> {
    Self::with_capacity(segment, 0)
  }

  fn with_capacity(segment: usize, at_least: usize) -> io::Result<Self> {
    let segment = segment.max(1);
    let mem = AlignedBuf::new(buffer_capacity(segment, at_least))?;
    Ok(SegmentBuffer {
      mem,
      segment,
      limit: MAX_BUFFER_SIZE,
      consumed: 0,
      filled: 0,
    })
  }

  pub(crate) fn segment_size(&self) -> usize {
    self.segment
  }

  pub(crate) fn capacity(&self) -> usize {
    self.mem.len
  }

  /// Bytes received but not yet returned to a caller.
  pub(crate) fn unread(&self) -> &[u8] {
    &self.mem.as_slice()[self.consumed..self.filled]
  }

  /// Start pointer and capacity of the whole allocation.
  pub(crate) fn raw_parts(&mut self) -> (*mut u8, usize) {
    (self.mem.ptr.as_ptr(), self.mem.len)
  }

  /// A new buffer sized for `segment`, carrying over every unread byte at
  /// offset zero. `self` is left untouched so the caller decides whether to
  /// swap.
  pub(crate) fn resegment(&self, segment: usize) -> io::Result<SegmentBuffer> {
    let unread = self.unread();
    let mut next = Self::with_capacity(segment, unread.len())?;
    next.limit = self.limit;
    next.mem.as_mut_slice()[..unread.len()].copy_from_slice(unread);
    next.filled = unread.len();
    Ok(next)
  }

  fn take(&mut self, n: usize) -> Vec<u8> {
    let out = self.unread()[..n].to_vec();
    self.consumed += n;
    if self.consumed == self.filled {
      self.consumed = 0;
      self.filled = 0;
    }
    out
  }

  /// Room for the next delivery, at most one segment long and never empty.
  ///
  /// Compacts unread bytes to the front when the tail is full, and grows the
  /// allocation when the unread region itself fills it, up to `limit`.
  fn spare(&mut self) -> io::Result<&mut [u8]> {
    if self.filled == self.capacity() {
      if self.consumed > 0 {
        self.mem.as_mut_slice().copy_within(self.consumed..self.filled, 0);
        self.filled -= self.consumed;
        self.consumed = 0;
      } else if self.capacity() >= self.limit {
        return Err(io::Error::new(
          io::ErrorKind::OutOfMemory,
          format!("receive buffer is full at {} bytes", self.capacity()),
        ));
      } else {
        let target = (self.capacity() * 2).min(self.limit);
        let mut grown = Self::with_capacity(self.segment, target)?;
        grown.limit = self.limit;
        grown.mem.as_mut_slice()[..self.filled].copy_from_slice(self.unread());
        grown.filled = self.filled;
        *self = grown;
      }
    }

    let end = (self.filled + self.segment).min(self.capacity());
    Ok(&mut self.mem.as_mut_slice()[self.filled..end])
  }

  /// Runs one `fill` and commits whatever it delivered.
  ///
  /// Running out of room is a [`Error::Config`] failure, not an I/O one: the
  /// socket is still fine.
  fn fill_once<F>(&mut self, fill: &mut F) -> Result<()>
  where
    F: FnMut(&mut [u8]) -> Result<usize>,
  {
    let spare = self.spare().map_err(Error::Config)?;
    let room = spare.len();
    let read = fill(spare)?;
    self.filled += read.min(room);
    Ok(())
  }

  /// Returns exactly `n` bytes, filling as many times as needed.
  pub(crate) fn read_exact<F>(&mut self, n: usize, mut fill: F) -> Result<Vec<u8>>
  where
    F: FnMut(&mut [u8]) -> Result<usize>,
  {
    while self.filled - self.consumed < n {
      self.fill_once(&mut fill)?;
    }
    Ok(self.take(n))
  }

  /// Returns everything up to and including the first `separator`.
  ///
  /// Only the last `separator.len() - 1` bytes of what was already scanned
  /// are looked at again after each delivery, which is enough to catch a
  /// separator split across deliveries.
  pub(crate) fn read_until<F>(
    &mut self,
    separator: &[u8],
    mut fill: F,
  ) -> Result<Vec<u8>>
  where
    F: FnMut(&mut [u8]) -> Result<usize>,
  {
    if separator.is_empty() {
      return Err(Error::invalid("separator must not be empty"));
    }

    let mut scanned: usize = 0;
    loop {
      let unread = self.unread();
      let from = scanned.saturating_sub(separator.len() - 1);
      if let Some(at) = find(&unread[from..], separator) {
        return Ok(self.take(from + at + separator.len()));
      }
      scanned = unread.len();
      self.fill_once(&mut fill)?;
    }
  }

  /// Returns all buffered bytes, filling once first if there are none.
  pub(crate) fn read_available<F>(&mut self, mut fill: F) -> Result<Vec<u8>>
  where
    F: FnMut(&mut [u8]) -> Result<usize>,
  {
    if self.filled == self.consumed {
      self.fill_once(&mut fill)?;
    }
    let len = self.filled - self.consumed;
    Ok(self.take(len))
  }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
  haystack.windows(needle.len()).position(|window| window == needle)
}
