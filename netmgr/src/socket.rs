//! Thin cross-platform socket handle.
//!
//! [`Socket`] owns exactly one native socket. It is moved into a
//! [`NetDescriptor`](crate::NetDescriptor) once the manager should watch it,
//! and handed back by [`NetDescriptor::detach`](crate::NetDescriptor::detach).
//!
//! All operations return [`io::Result`] carrying the native error code. The
//! option setters are best-effort: failures are logged and returned, and the
//! connection code ignores them.

use std::io;
use std::mem::MaybeUninit;
use std::net::{Shutdown, SocketAddr};
#[cfg(unix)]
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
#[cfg(windows)]
use std::os::windows::io::{AsRawSocket, IntoRawSocket, RawSocket};

use socket2::{Domain, SockAddr, Type};

/// `IPTOS_LOWDELAY`.
const TOS_LOW_DELAY: u32 = 0x10;

/// Address family of a socket or a resolved address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProtocolFamily {
  /// Either family.
  #[default]
  Unspec,
  Inet,
  Inet6,
}

impl ProtocolFamily {
  /// The socket2 domain, `None` for [`ProtocolFamily::Unspec`].
  pub fn domain(self) -> Option<Domain> {
    match self {
      Self::Unspec => None,
      Self::Inet => Some(Domain::IPV4),
      Self::Inet6 => Some(Domain::IPV6),
    }
  }

  pub fn from_domain(domain: Domain) -> Self {
    if domain == Domain::IPV4 {
      Self::Inet
    } else if domain == Domain::IPV6 {
      Self::Inet6
    } else {
      Self::Unspec
    }
  }

  pub fn of(addr: &SocketAddr) -> Self {
    match addr {
      SocketAddr::V4(_) => Self::Inet,
      SocketAddr::V6(_) => Self::Inet6,
    }
  }

  /// Native `AF_*` value, as used in resolver hints.
  pub(crate) fn raw(self) -> i32 {
    match self.domain() {
      Some(domain) => domain.into(),
      #[cfg(unix)]
      None => libc::AF_UNSPEC,
      #[cfg(windows)]
      None => windows_sys::Win32::Networking::WinSock::AF_UNSPEC as i32,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SocketType {
  Stream,
  Datagram,
}

impl SocketType {
  pub fn ty(self) -> Type {
    match self {
      Self::Stream => Type::STREAM,
      Self::Datagram => Type::DGRAM,
    }
  }

  pub(crate) fn raw(self) -> i32 {
    self.ty().into()
  }

  /// `None` for socket types this crate doesn't deal in (raw, seqpacket).
  pub(crate) fn from_raw(raw: i32) -> Option<Self> {
    let ty = Type::from(raw);
    if ty == Type::STREAM {
      Some(Self::Stream)
    } else if ty == Type::DGRAM {
      Some(Self::Datagram)
    } else {
      None
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Protocol {
  Tcp,
  Udp,
}

impl Protocol {
  pub fn protocol(self) -> socket2::Protocol {
    match self {
      Self::Tcp => socket2::Protocol::TCP,
      Self::Udp => socket2::Protocol::UDP,
    }
  }

  pub(crate) fn raw(self) -> i32 {
    self.protocol().into()
  }

  pub(crate) fn from_raw(raw: i32) -> Option<Self> {
    let protocol = socket2::Protocol::from(raw);
    if protocol == socket2::Protocol::TCP {
      Some(Self::Tcp)
    } else if protocol == socket2::Protocol::UDP {
      Some(Self::Udp)
    } else {
      None
    }
  }

  /// The socket type this protocol runs over.
  pub fn socket_type(self) -> SocketType {
    match self {
      Self::Tcp => SocketType::Stream,
      Self::Udp => SocketType::Datagram,
    }
  }
}

/// An owned native socket.
#[derive(Debug)]
pub struct Socket {
  inner: socket2::Socket,
}

impl Socket {
  /// Opens a socket from native domain/type/protocol values.
  pub fn open_native(
    domain: Domain,
    ty: Type,
    protocol: Option<socket2::Protocol>,
  ) -> io::Result<Self> {
    socket2::Socket::new(domain, ty, protocol).map(Self::from_inner)
  }

  /// Opens a socket from the portable enums.
  ///
  /// [`ProtocolFamily::Unspec`] has no socket of its own and is rejected.
  pub fn open(
    family: ProtocolFamily,
    ty: SocketType,
    protocol: Protocol,
  ) -> io::Result<Self> {
    let domain = family.domain().ok_or_else(|| {
      io::Error::new(
        io::ErrorKind::InvalidInput,
        "cannot open a socket for an unspecified family",
      )
    })?;
    Self::open_native(domain, ty.ty(), Some(protocol.protocol()))
  }

  pub(crate) fn from_inner(inner: socket2::Socket) -> Self {
    Self { inner }
  }

  /// Releases the native handle.
  ///
  /// An interrupted close is retried on windows. On unix the descriptor is
  /// already gone once `close(2)` returns, whatever it returns, so `EINTR`
  /// counts as success there.
  pub fn close(self) -> io::Result<()> {
    #[cfg(unix)]
    {
      let fd = self.inner.into_raw_fd();
      match syscall!(close(fd)) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(()),
        Err(err) => Err(err),
      }
    }
    #[cfg(windows)]
    {
      let sock = self.inner.into_raw_socket() as usize;
      loop {
        match wsa_call!(closesocket(sock)) {
          Ok(_) => return Ok(()),
          Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
          Err(err) => return Err(err),
        }
      }
    }
  }

  pub fn connect(&self, addr: &SockAddr) -> io::Result<()> {
    loop {
      match self.inner.connect(addr) {
        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
        other => return other,
      }
    }
  }

  pub fn bind(&self, addr: &SockAddr) -> io::Result<()> {
    self.inner.bind(addr)
  }

  pub fn listen(&self, backlog: i32) -> io::Result<()> {
    self.inner.listen(backlog)
  }

  /// Accepts one pending connection as a new [`Socket`].
  pub fn accept(&self) -> io::Result<(Socket, SockAddr)> {
    loop {
      match self.inner.accept() {
        Ok((sock, addr)) => return Ok((Socket::from_inner(sock), addr)),
        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
        Err(err) => return Err(err),
      }
    }
  }

  pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
    self.inner.send(buf)
  }

  pub fn send_to(&self, buf: &[u8], addr: &SockAddr) -> io::Result<usize> {
    self.inner.send_to(buf, addr)
  }

  pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
    self.inner.recv(as_uninit(buf))
  }

  pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SockAddr)> {
    self.inner.recv_from(as_uninit(buf))
  }

  pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
    self.inner.shutdown(how)
  }

  pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
    self.inner.set_nonblocking(nonblocking)
  }

  pub fn set_reuse_addr(&self) -> io::Result<()> {
    self.inner.set_reuse_address(true).inspect_err(|err| {
      log::error!("setsockopt(SO_REUSEADDR) failed: {err}");
    })
  }

  /// Disables Nagle's algorithm.
  pub fn set_nodelay(&self) -> io::Result<()> {
    self.inner.set_tcp_nodelay(true).inspect_err(|err| {
      log::debug!("setsockopt(TCP_NODELAY) failed: {err}");
    })
  }

  /// Sets the IPv4 type-of-service byte.
  pub fn set_tos(&self, tos: u32) -> io::Result<()> {
    self.inner.set_tos_v4(tos).inspect_err(|err| {
      log::debug!("setsockopt(IP_TOS) failed: {err}");
    })
  }

  /// No-delay plus low-delay type-of-service, for latency sensitive
  /// connections.
  pub fn set_interactive(&self) -> io::Result<()> {
    self.set_nodelay()?;
    self.set_tos(TOS_LOW_DELAY)
  }

  pub fn set_inline_oob(&self) -> io::Result<()> {
    self.inner.set_out_of_band_inline(true).inspect_err(|err| {
      log::error!("setsockopt(SO_OOBINLINE) failed: {err}");
    })
  }

  pub fn set_keep_alive(&self) -> io::Result<()> {
    self.inner.set_keepalive(true).inspect_err(|err| {
      log::error!("setsockopt(SO_KEEPALIVE) failed: {err}");
    })
  }

  /// Takes the pending socket error (`SO_ERROR`).
  ///
  /// `Ok(None)` means no error was pending. `Err` means the query itself
  /// failed.
  pub fn take_error(&self) -> io::Result<Option<io::Error>> {
    self.inner.take_error()
  }

  pub fn local_addr(&self) -> io::Result<SocketAddr> {
    into_std(self.inner.local_addr()?)
  }

  pub fn peer_addr(&self) -> io::Result<SocketAddr> {
    into_std(self.inner.peer_addr()?)
  }

  #[cfg(unix)]
  pub(crate) fn raw(&self) -> RawFd {
    self.inner.as_raw_fd()
  }

  #[cfg(windows)]
  pub(crate) fn raw(&self) -> RawSocket {
    self.inner.as_raw_socket()
  }
}

#[cfg(unix)]
impl AsRawFd for Socket {
  fn as_raw_fd(&self) -> RawFd {
    self.raw()
  }
}

#[cfg(windows)]
impl AsRawSocket for Socket {
  fn as_raw_socket(&self) -> RawSocket {
    self.raw()
  }
}

impl From<socket2::Socket> for Socket {
  fn from(inner: socket2::Socket) -> Self {
    Self::from_inner(inner)
  }
}

impl From<Socket> for socket2::Socket {
  fn from(sock: Socket) -> Self {
    sock.inner
  }
}

fn into_std(addr: SockAddr) -> io::Result<SocketAddr> {
  addr.as_socket().ok_or_else(|| {
    io::Error::new(io::ErrorKind::InvalidInput, "not an inet address")
  })
}

fn as_uninit(buf: &mut [u8]) -> &mut [MaybeUninit<u8>] {
  // SAFETY: `MaybeUninit<u8>` has the same layout as `u8`, and recv only
  // ever writes initialised bytes into the buffer.
  unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn loopback() -> SockAddr {
    SockAddr::from("127.0.0.1:0".parse::<SocketAddr>().unwrap())
  }

  #[test]
  fn open_rejects_unspec() {
    let err = Socket::open(
      ProtocolFamily::Unspec,
      SocketType::Stream,
      Protocol::Tcp,
    )
    .unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
  }

  #[test]
  fn family_round_trips_through_domain() {
    for family in [ProtocolFamily::Inet, ProtocolFamily::Inet6] {
      let domain = family.domain().unwrap();
      assert_eq!(ProtocolFamily::from_domain(domain), family);
    }
    assert_eq!(ProtocolFamily::Unspec.domain(), None);
  }

  #[test]
  fn raw_values_map_back() {
    for ty in [SocketType::Stream, SocketType::Datagram] {
      assert_eq!(SocketType::from_raw(ty.raw()), Some(ty));
    }
    for protocol in [Protocol::Tcp, Protocol::Udp] {
      assert_eq!(Protocol::from_raw(protocol.raw()), Some(protocol));
    }
    assert_eq!(Protocol::from_raw(0), None);
  }

  #[test]
  fn protocol_implies_socket_type() {
    assert_eq!(Protocol::Tcp.socket_type(), SocketType::Stream);
    assert_eq!(Protocol::Udp.socket_type(), SocketType::Datagram);
  }

  #[test]
  fn blocking_stream_exchange() {
    let server =
      Socket::open(ProtocolFamily::Inet, SocketType::Stream, Protocol::Tcp)
        .unwrap();
    server.set_reuse_addr().unwrap();
    server.bind(&loopback()).unwrap();
    server.listen(1).unwrap();
    let addr = server.local_addr().unwrap();

    let client =
      Socket::open(ProtocolFamily::Inet, SocketType::Stream, Protocol::Tcp)
        .unwrap();
    client.connect(&SockAddr::from(addr)).unwrap();
    let (accepted, peer) = server.accept().unwrap();
    assert_eq!(peer.as_socket(), Some(client.local_addr().unwrap()));

    assert_eq!(client.send(b"ping").unwrap(), 4);
    let mut buf = [0u8; 8];
    let n = accepted.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");

    accepted.close().unwrap();
    client.close().unwrap();
    server.close().unwrap();
  }

  #[test]
  fn datagram_exchange() {
    let a =
      Socket::open(ProtocolFamily::Inet, SocketType::Datagram, Protocol::Udp)
        .unwrap();
    let b =
      Socket::open(ProtocolFamily::Inet, SocketType::Datagram, Protocol::Udp)
        .unwrap();
    a.bind(&loopback()).unwrap();
    b.bind(&loopback()).unwrap();

    let b_addr = SockAddr::from(b.local_addr().unwrap());
    a.send_to(b"hello", &b_addr).unwrap();

    let mut buf = [0u8; 16];
    let (n, from) = b.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello");
    assert_eq!(from.as_socket(), Some(a.local_addr().unwrap()));

    a.close().unwrap();
    b.close().unwrap();
  }

  #[test]
  fn nonblocking_recv_would_block() {
    let sock =
      Socket::open(ProtocolFamily::Inet, SocketType::Datagram, Protocol::Udp)
        .unwrap();
    sock.bind(&loopback()).unwrap();
    sock.set_nonblocking(true).unwrap();

    let mut buf = [0u8; 4];
    let err = sock.recv(&mut buf).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    sock.close().unwrap();
  }

  #[test]
  fn options_apply_to_tcp_socket() {
    let sock =
      Socket::open(ProtocolFamily::Inet, SocketType::Stream, Protocol::Tcp)
        .unwrap();
    sock.set_reuse_addr().unwrap();
    sock.set_inline_oob().unwrap();
    sock.set_keep_alive().unwrap();
    sock.set_interactive().unwrap();
    assert!(sock.take_error().unwrap().is_none());
    sock.close().unwrap();
  }
}
