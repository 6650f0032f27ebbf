//! Cross-thread wake-up for a blocked readiness wait.
//!
//! - On unix: a non-blocking pipe; the read end sits in the wait set.
//! - On windows: a manual-reset WSA event object waited on alongside the
//!   socket events.

use std::io;
use std::sync::Arc;

/// Special key used to identify notification events
pub const NOTIFY_KEY: u64 = u64::MAX;

#[cfg(unix)]
pub struct Notifier {
  /// Read end of the pipe
  read_fd: std::os::fd::OwnedFd,
  /// Write end of the pipe
  write_fd: std::os::fd::OwnedFd,
}

#[cfg(windows)]
pub struct Notifier {
  event: windows_sys::Win32::Networking::WinSock::WSAEVENT,
}

// SAFETY: a WSA event handle may be signalled and reset from any thread.
#[cfg(windows)]
unsafe impl Send for Notifier {}
#[cfg(windows)]
unsafe impl Sync for Notifier {}

#[cfg(unix)]
impl Notifier {
  pub fn new() -> io::Result<Self> {
    use std::os::fd::{FromRawFd, OwnedFd};

    let mut fds = [0i32; 2];

    #[cfg(linux)]
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK))?;

    #[cfg(not(linux))]
    {
      syscall!(pipe(fds.as_mut_ptr()))?;
      for fd in fds {
        syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
        let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
        syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
      }
    }

    Ok(Self {
      read_fd: unsafe { OwnedFd::from_raw_fd(fds[0]) },
      write_fd: unsafe { OwnedFd::from_raw_fd(fds[1]) },
    })
  }

  /// The descriptor to put into the wait set.
  pub fn read_fd(&self) -> std::os::fd::RawFd {
    use std::os::fd::AsRawFd;
    self.read_fd.as_raw_fd()
  }

  /// Trigger a notification by writing to the pipe
  pub fn notify(&self) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let byte: u8 = 1;
    let result = syscall!(write(
      self.write_fd.as_raw_fd(),
      &byte as *const u8 as *const libc::c_void,
      1,
    ));

    match result {
      // Pipe full: a wake-up is already pending.
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
      other => other.map(|_| ()),
    }
  }

  /// Consume every pending notification.
  pub fn drain(&self) {
    let mut buf = [0u8; 64];
    loop {
      match syscall!(read(
        self.read_fd(),
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
      )) {
        Ok(n) if n > 0 => continue,
        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
        _ => break,
      }
    }
  }
}

#[cfg(windows)]
impl Notifier {
  pub fn new() -> io::Result<Self> {
    use windows_sys::Win32::Networking::WinSock::{
      WSACreateEvent, WSAGetLastError,
    };

    crate::net_utils::init_winsock();
    let event = unsafe { WSACreateEvent() };
    if event.is_null() {
      return Err(io::Error::from_raw_os_error(unsafe { WSAGetLastError() }));
    }
    Ok(Self { event })
  }

  pub fn event(&self) -> windows_sys::Win32::Networking::WinSock::WSAEVENT {
    self.event
  }

  pub fn notify(&self) -> io::Result<()> {
    use windows_sys::Win32::Networking::WinSock::WSASetEvent;

    if unsafe { WSASetEvent(self.event) } == 0 {
      return Err(io::Error::last_os_error());
    }
    Ok(())
  }

  pub fn drain(&self) {
    use windows_sys::Win32::Networking::WinSock::WSAResetEvent;

    unsafe { WSAResetEvent(self.event) };
  }
}

#[cfg(windows)]
impl Drop for Notifier {
  fn drop(&mut self) {
    unsafe { windows_sys::Win32::Networking::WinSock::WSACloseEvent(self.event) };
  }
}

/// Wakes the manager's blocked wait. Cheap to clone, usable from any thread.
#[derive(Clone)]
pub struct Waker {
  notifier: Arc<Notifier>,
}

impl Waker {
  pub(crate) fn new(notifier: Arc<Notifier>) -> Self {
    Self { notifier }
  }

  pub fn wake(&self) -> io::Result<()> {
    self.notifier.notify()
  }
}

impl std::fmt::Debug for Waker {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Waker").finish_non_exhaustive()
  }
}
