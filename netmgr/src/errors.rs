//! Error types shared across the crate and the portable classification of
//! native socket errors.
//!
//! Native codes stay native (`errno` on unix, `WSAGetLastError` on
//! windows); the predicates here are the only place that knows which code
//! means what on which platform.

use std::io;

use thiserror::Error;

use crate::connect::ConnectPhase;
use crate::listen::ListenPhase;
use crate::socket::Socket;

#[derive(Debug, Error)]
pub enum TryInitError {
  #[error("a net manager is already initialised on this thread")]
  AlreadyInit,
  #[error(transparent)]
  Io(#[from] io::Error),
}

/// Returned by [`NetDescriptor::new`](crate::NetDescriptor::new) when the
/// manager refuses the socket.
///
/// The socket is *not* closed; it is handed back so the caller can decide.
#[derive(Debug, Error)]
#[error("registering socket with the net manager failed: {error}")]
pub struct NewDescriptorError {
  #[source]
  pub error: io::Error,
  pub socket: Socket,
}

impl NewDescriptorError {
  pub fn into_parts(self) -> (io::Error, Socket) {
    (self.error, self.socket)
  }
}

/// Name resolution failed.
///
/// `code` is the resolver's own code (`EAI_*` on unix, a winsock code on
/// windows). `source` carries `errno` when the resolver blamed the system.
#[derive(Debug, Error)]
#[error("name resolution failed: {message} (code {code})")]
pub struct ResolveError {
  pub code: i32,
  message: String,
  #[source]
  pub source: Option<io::Error>,
}

impl ResolveError {
  #[cfg(unix)]
  pub(crate) fn from_gai(code: i32, errno: io::Error) -> Self {
    // SAFETY: gai_strerror returns a static, NUL terminated string.
    let message = unsafe { std::ffi::CStr::from_ptr(libc::gai_strerror(code)) }
      .to_string_lossy()
      .into_owned();
    let source = (code == libc::EAI_SYSTEM).then_some(errno);
    Self { code, message, source }
  }

  #[cfg(windows)]
  pub(crate) fn from_gai(code: i32, _errno: io::Error) -> Self {
    let message = io::Error::from_raw_os_error(code).to_string();
    Self { code, message, source: None }
  }

  pub fn message(&self) -> &str {
    &self.message
  }
}

/// Why a [`connect_host_by_name`](crate::connect_host_by_name) gave up.
#[derive(Debug, Error)]
pub enum ConnectError {
  #[error(transparent)]
  Resolve(#[from] ResolveError),
  /// Every candidate address failed.
  #[error("connecting failed: {0}")]
  Connect(#[source] io::Error),
}

impl ConnectError {
  /// The phase the connection was in when it failed.
  pub fn phase(&self) -> ConnectPhase {
    match self {
      Self::Resolve(_) => ConnectPhase::Resolving,
      Self::Connect(_) => ConnectPhase::Connecting,
    }
  }
}

/// Why a [`listen_port`](crate::listen_port) gave up.
#[derive(Debug, Error)]
pub enum ListenError {
  #[error(transparent)]
  Resolve(#[from] ResolveError),
  /// No resolved address could be bound and listened on.
  #[error("listening failed: {0}")]
  Listen(#[source] io::Error),
}

impl ListenError {
  pub fn phase(&self) -> ListenPhase {
    match self {
      Self::Resolve(_) => ListenPhase::Resolving,
      Self::Listen(_) => ListenPhase::Listening,
    }
  }
}

/// A non-blocking `connect` that has been started but not finished.
pub(crate) fn is_in_progress(err: &io::Error) -> bool {
  #[cfg(unix)]
  {
    matches!(err.raw_os_error(), Some(libc::EINPROGRESS))
  }
  #[cfg(windows)]
  {
    use windows_sys::Win32::Networking::WinSock::{
      WSAEINPROGRESS, WSAEWOULDBLOCK,
    };
    matches!(err.raw_os_error(), Some(WSAEWOULDBLOCK | WSAEINPROGRESS))
  }
}

/// Accept conditions that simply mean "nothing to do right now".
pub(crate) fn is_transient_accept(err: &io::Error) -> bool {
  matches!(
    err.kind(),
    io::ErrorKind::WouldBlock | io::ErrorKind::ConnectionAborted
  )
}

/// Out of descriptors or buffer memory. Worth a warning, not a crash.
pub(crate) fn is_resource_exhaustion(err: &io::Error) -> bool {
  #[cfg(unix)]
  {
    match err.raw_os_error() {
      Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) => {
        true
      }
      #[cfg(linux)]
      Some(libc::ENOSR) => true,
      _ => false,
    }
  }
  #[cfg(windows)]
  {
    use windows_sys::Win32::Networking::WinSock::{WSAEMFILE, WSAENOBUFS};
    matches!(err.raw_os_error(), Some(WSAEMFILE | WSAENOBUFS))
  }
}

/// The error reported when every candidate address has failed.
pub(crate) fn timed_out() -> io::Error {
  #[cfg(unix)]
  {
    io::Error::from_raw_os_error(libc::ETIMEDOUT)
  }
  #[cfg(windows)]
  {
    io::Error::from_raw_os_error(
      windows_sys::Win32::Networking::WinSock::WSAETIMEDOUT,
    )
  }
}

/// Reported by the manager when it cannot track another socket.
pub(crate) fn too_many_sockets() -> io::Error {
  #[cfg(unix)]
  {
    io::Error::from_raw_os_error(libc::EMFILE)
  }
  #[cfg(windows)]
  {
    io::Error::from_raw_os_error(
      windows_sys::Win32::Networking::WinSock::WSAEMFILE,
    )
  }
}

/// Generic I/O failure, used when listening failed on every address.
pub(crate) fn io_failure() -> io::Error {
  #[cfg(unix)]
  {
    io::Error::from_raw_os_error(libc::EIO)
  }
  #[cfg(windows)]
  {
    io::Error::other("no address could be listened on")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn error_phases() {
    let err = ConnectError::Connect(timed_out());
    assert_eq!(err.phase(), ConnectPhase::Connecting);
    let err = ListenError::Listen(io_failure());
    assert_eq!(err.phase(), ListenPhase::Listening);
  }

  #[cfg(unix)]
  #[test]
  fn resolve_error_carries_message_and_errno() {
    let err =
      ResolveError::from_gai(libc::EAI_NONAME, io::Error::from_raw_os_error(0));
    assert_eq!(err.code, libc::EAI_NONAME);
    assert!(!err.message().is_empty());
    assert!(err.source.is_none());
    assert_eq!(ConnectError::from(err).phase(), ConnectPhase::Resolving);

    let err = ResolveError::from_gai(
      libc::EAI_SYSTEM,
      io::Error::from_raw_os_error(libc::ENOMEM),
    );
    assert_eq!(
      err.source.as_ref().and_then(io::Error::raw_os_error),
      Some(libc::ENOMEM)
    );
  }

  #[test]
  fn timed_out_has_timed_out_kind() {
    assert_eq!(timed_out().kind(), io::ErrorKind::TimedOut);
  }

  #[test]
  fn would_block_and_aborted_are_transient() {
    assert!(is_transient_accept(&io::Error::from(io::ErrorKind::WouldBlock)));
    assert!(is_transient_accept(&io::Error::from(
      io::ErrorKind::ConnectionAborted
    )));
    assert!(!is_transient_accept(&io::Error::from(
      io::ErrorKind::PermissionDenied
    )));
  }

  #[cfg(unix)]
  #[test]
  fn classifies_unix_codes() {
    assert!(is_in_progress(&io::Error::from_raw_os_error(libc::EINPROGRESS)));
    assert!(!is_in_progress(&io::Error::from_raw_os_error(libc::ECONNREFUSED)));

    for code in [libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM] {
      assert!(is_resource_exhaustion(&io::Error::from_raw_os_error(code)));
    }
    assert!(!is_resource_exhaustion(&io::Error::from_raw_os_error(
      libc::EBADF
    )));
    assert!(is_transient_accept(&io::Error::from_raw_os_error(libc::EAGAIN)));
    assert!(is_transient_accept(&io::Error::from_raw_os_error(
      libc::ECONNABORTED
    )));
  }
}
