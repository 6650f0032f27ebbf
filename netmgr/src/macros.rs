/// Calls a `libc` function and turns the `-1` sentinel into
/// [`std::io::Error::last_os_error`].
#[cfg(unix)]
macro_rules! syscall {
  ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
      #[allow(unused_unsafe)]
      let res = unsafe { libc::$fn($($arg, )*) };
      if res == -1 {
          Err(std::io::Error::last_os_error())
      } else {
          Ok(res)
      }
  }};
}

/// Winsock flavour of `syscall!`: `SOCKET_ERROR` is the sentinel and the
/// error comes from `WSAGetLastError`.
#[cfg(windows)]
macro_rules! wsa_call {
  ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
      #[allow(unused_unsafe)]
      let res = unsafe { windows_sys::Win32::Networking::WinSock::$fn($($arg, )*) };
      if res == windows_sys::Win32::Networking::WinSock::SOCKET_ERROR {
          Err(std::io::Error::from_raw_os_error(unsafe {
            windows_sys::Win32::Networking::WinSock::WSAGetLastError()
          }))
      } else {
          Ok(res)
      }
  }};
}
