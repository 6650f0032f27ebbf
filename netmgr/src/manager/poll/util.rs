use std::io;
use std::time::Duration;

/// Convert Duration to libc::timeval
#[cfg(unix)]
pub fn duration_to_timeval(duration: Duration) -> libc::timeval {
  libc::timeval {
    tv_sec: duration.as_secs() as libc::time_t,
    tv_usec: duration.subsec_micros() as libc::suseconds_t,
  }
}

/// Whole milliseconds for millisecond-granularity waits, rounded up so a
/// sub-millisecond timeout doesn't turn into a busy loop. Saturates at
/// `max`.
pub fn timeout_to_millis(timeout: Duration, max: u64) -> u64 {
  let mut ms = timeout.as_millis();
  if timeout.subsec_nanos() % 1_000_000 != 0 {
    ms += 1;
  }
  ms.min(max as u128) as u64
}

/// Error for operations on a socket the backend doesn't track.
pub fn not_registered() -> io::Error {
  #[cfg(unix)]
  {
    io::Error::from_raw_os_error(libc::ENOENT)
  }
  #[cfg(windows)]
  {
    io::Error::new(io::ErrorKind::NotFound, "socket is not registered")
  }
}

/// Error for adding a socket twice.
pub fn already_registered() -> io::Error {
  #[cfg(unix)]
  {
    io::Error::from_raw_os_error(libc::EEXIST)
  }
  #[cfg(windows)]
  {
    io::Error::new(io::ErrorKind::AlreadyExists, "socket is already registered")
  }
}
