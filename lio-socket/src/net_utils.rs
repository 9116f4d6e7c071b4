use std::{
  ffi::CStr,
  io, mem,
  net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
  os::fd::AsRawFd,
  ptr,
  sync::OnceLock,
};

/// Flags passed to every `send(2)` so a vanished peer surfaces as `EPIPE`
/// instead of a process-wide `SIGPIPE`.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) const SEND_FLAGS: libc::c_int = 0;

/// Reads an IPv4/IPv6 address out of a libc `sockaddr`.
///
/// # Safety
///
/// `addr` must be null or point to a valid socket address whose size matches
/// its `sa_family`.
pub(crate) unsafe fn libc_sockaddr_into_std(
  addr: *const libc::sockaddr,
) -> Option<SocketAddr> {
  if addr.is_null() {
    return None;
  }

  // SAFETY: non-null and valid per the caller.
  let family = unsafe { ptr::read_unaligned(addr) }.sa_family;

  if family == libc::AF_INET as libc::sa_family_t {
    // SAFETY: family is AF_INET so the storage holds a sockaddr_in.
    let sin = unsafe { ptr::read_unaligned(addr.cast::<libc::sockaddr_in>()) };
    let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
    Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
  } else if family == libc::AF_INET6 as libc::sa_family_t {
    // SAFETY: family is AF_INET6 so the storage holds a sockaddr_in6.
    let sin6 =
      unsafe { ptr::read_unaligned(addr.cast::<libc::sockaddr_in6>()) };
    Some(SocketAddr::V6(SocketAddrV6::new(
      Ipv6Addr::from(sin6.sin6_addr.s6_addr),
      u16::from_be(sin6.sin6_port),
      sin6.sin6_flowinfo,
      sin6.sin6_scope_id,
    )))
  } else {
    None
  }
}

/// Owns a list returned by `getifaddrs(3)`.
struct IfAddrs(*mut libc::ifaddrs);

impl Drop for IfAddrs {
  fn drop(&mut self) {
    if !self.0.is_null() {
      // SAFETY: pointer came from a successful getifaddrs call.
      unsafe { libc::freeifaddrs(self.0) };
    }
  }
}

/// All IPv4 and IPv6 addresses configured on the interface called `name`,
/// in the order the system lists them. Ports are zero.
pub(crate) fn interface_addrs(name: &str) -> io::Result<Vec<SocketAddr>> {
  let mut head: *mut libc::ifaddrs = ptr::null_mut();
  syscall!(getifaddrs(&mut head))?;
  let list = IfAddrs(head);

  let mut found = Vec::new();
  let mut cursor = list.0;
  while !cursor.is_null() {
    // SAFETY: every node stays valid until `list` is dropped.
    let entry = unsafe { &*cursor };
    cursor = entry.ifa_next;

    if entry.ifa_name.is_null() {
      continue;
    }
    // SAFETY: ifa_name is a NUL terminated string owned by the list.
    let entry_name = unsafe { CStr::from_ptr(entry.ifa_name) };
    if entry_name.to_bytes() != name.as_bytes() {
      continue;
    }
    // SAFETY: ifa_addr is null or a valid sockaddr for its family.
    if let Some(addr) = unsafe { libc_sockaddr_into_std(entry.ifa_addr) } {
      found.push(addr);
    }
  }

  Ok(found)
}

/// Current `TCP_MAXSEG` of the socket.
pub(crate) fn segment_size(fd: &impl AsRawFd) -> io::Result<u32> {
  let mut value: libc::c_int = 0;
  let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
  syscall!(getsockopt(
    fd.as_raw_fd(),
    libc::IPPROTO_TCP,
    libc::TCP_MAXSEG,
    (&mut value as *mut libc::c_int).cast(),
    &mut len,
  ))?;
  Ok(value.max(0) as u32)
}

pub(crate) fn set_segment_size(fd: &impl AsRawFd, mss: u32) -> io::Result<()> {
  let value = libc::c_int::try_from(mss)
    .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
  syscall!(setsockopt(
    fd.as_raw_fd(),
    libc::IPPROTO_TCP,
    libc::TCP_MAXSEG,
    (&value as *const libc::c_int).cast(),
    mem::size_of::<libc::c_int>() as libc::socklen_t,
  ))?;
  Ok(())
}

/// Apple platforms have no `MSG_NOSIGNAL`; the socket option does the same.
#[cfg(target_vendor = "apple")]
pub(crate) fn suppress_sigpipe(fd: &impl AsRawFd) -> io::Result<()> {
  let one: libc::c_int = 1;
  syscall!(setsockopt(
    fd.as_raw_fd(),
    libc::SOL_SOCKET,
    libc::SO_NOSIGPIPE,
    (&one as *const libc::c_int).cast(),
    mem::size_of::<libc::c_int>() as libc::socklen_t,
  ))?;
  Ok(())
}

#[cfg(not(target_vendor = "apple"))]
pub(crate) fn suppress_sigpipe(_fd: &impl AsRawFd) -> io::Result<()> {
  Ok(())
}

/// Size of a memory page, falling back to 4 KiB if `sysconf` can't tell.
pub(crate) fn page_size() -> usize {
  static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
  *PAGE_SIZE.get_or_init(|| {
    syscall!(sysconf(libc::_SC_PAGESIZE))
      .ok()
      .and_then(|size| usize::try_from(size).ok())
      .filter(|size| size.is_power_of_two())
      .unwrap_or(4096)
  })
}
