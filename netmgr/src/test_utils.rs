//! Test utilities for integration tests.
//!
//! Small drivers around a [`NetManager`] so tests don't each grow their own
//! process loop.

use std::net::TcpListener;
use std::time::{Duration, Instant};

use crate::manager::{Backend, NetManager, NetManagerConfig};

/// Every backend this platform can run.
#[doc(hidden)]
pub fn backends() -> Vec<Backend> {
  vec![
    #[cfg(unix)]
    Backend::Select,
    #[cfg(linux)]
    Backend::Epoll,
    #[cfg(windows)]
    Backend::EventSelect,
  ]
}

/// A manager on `backend`, panicking if one is already active on this
/// thread.
#[doc(hidden)]
pub fn manager_with(backend: Backend) -> NetManager {
  let config = NetManagerConfig { backend, ..NetManagerConfig::default() };
  NetManager::try_init(config).unwrap()
}

/// Processes in short slices until `done` holds.
///
/// Panics once `limit` has passed.
#[doc(hidden)]
pub fn run_until(
  manager: &NetManager,
  limit: Duration,
  mut done: impl FnMut() -> bool,
) {
  let deadline = Instant::now() + limit;
  while !done() {
    assert!(Instant::now() < deadline, "condition not reached in {limit:?}");
    let mut timeout = Duration::from_millis(20);
    manager.process(&mut timeout).unwrap();
  }
}

/// Processes for `period` regardless of what happens.
#[doc(hidden)]
pub fn run_for(manager: &NetManager, period: Duration) {
  let deadline = Instant::now() + period;
  loop {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
      break;
    }
    let mut timeout = left.min(Duration::from_millis(20));
    manager.process(&mut timeout).unwrap();
  }
}

/// A loopback port nobody listens on, at least right after the call.
#[doc(hidden)]
pub fn refusing_port() -> u16 {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  listener.local_addr().unwrap().port()
}
