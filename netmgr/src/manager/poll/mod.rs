//! Readiness backends.
//!
//! Every backend reports, per wait, which registered sockets became ready
//! for which of the registered interests. The manager owns dispatch order
//! (exception, write, read, then hangup) so all backends behave the same
//! from a descriptor's point of view.
//!
//! | Backend                 | Platform | Model                         |
//! |-------------------------|----------|-------------------------------|
//! | [`Backend::Select`]     | unix     | poll set (`select(2)`)        |
//! | [`Backend::Epoll`]      | linux    | poll set (`epoll(7)`, level)  |
//! | [`Backend::EventSelect`]| windows  | event objects (`WSAEventSelect`) |

mod notifier;
mod util;

#[cfg(linux)]
pub(crate) mod epoll;
#[cfg(unix)]
pub(crate) mod select;
#[cfg(windows)]
pub(crate) mod wsa;


use std::io;
use std::sync::Arc;
use std::time::Duration;

pub use notifier::Waker;
pub(crate) use notifier::{NOTIFY_KEY, Notifier};

use super::Interest;

#[cfg(unix)]
pub(crate) type RawSock = std::os::fd::RawFd;
#[cfg(windows)]
pub(crate) type RawSock = std::os::windows::io::RawSocket;

/// Which readiness mechanism a [`NetManager`](crate::NetManager) uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Backend {
  #[cfg(unix)]
  Select,
  #[cfg(linux)]
  Epoll,
  #[cfg(windows)]
  EventSelect,
}

impl Default for Backend {
  fn default() -> Self {
    #[cfg(unix)]
    {
      Self::Select
    }
    #[cfg(windows)]
    {
      Self::EventSelect
    }
  }
}

/// One socket's readiness, as reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
  pub key: u64,
  pub ready: Interest,
}

/// Trait for OS-specific readiness polling implementations
///
/// Keys are chosen by the caller and must be unique per registered socket.
/// [`NOTIFY_KEY`] is reserved.
pub trait ReadinessPoll {
  /// Start tracking `sock`. `interest` may be [`Interest::NONE`].
  /// This is not idempotent.
  fn add(&mut self, sock: RawSock, key: u64, interest: Interest)
  -> io::Result<()>;

  /// Replace the interest of a tracked socket.
  /// This is idempotent, but fails if not added before.
  fn modify(
    &mut self,
    sock: RawSock,
    key: u64,
    interest: Interest,
  ) -> io::Result<()>;

  /// Stop tracking `sock`.
  /// This fails if `sock` hasn't previously been added.
  fn delete(&mut self, sock: RawSock) -> io::Result<()>;

  /// Wait until at least one tracked socket is ready, the timeout expires
  /// or the waker fires, appending readiness to `events`.
  ///
  /// `None` waits forever. Only interests that were registered are
  /// reported (hangup excepted). An interrupted wait returns
  /// [`io::ErrorKind::Interrupted`]; retrying is the caller's business.
  fn wait(
    &mut self,
    events: &mut Vec<Event>,
    timeout: Option<Duration>,
  ) -> io::Result<()>;

  /// Handle that wakes a blocked [`wait`](ReadinessPoll::wait) from any
  /// thread.
  fn waker(&self) -> Waker;
}

/// Builds the backend selected by `backend`.
#[cfg_attr(not(linux), allow(unused_variables))]
pub(crate) fn new_poller(
  backend: Backend,
  event_capacity: usize,
) -> io::Result<Box<dyn ReadinessPoll>> {
  let notifier = Arc::new(Notifier::new()?);
  Ok(match backend {
    #[cfg(unix)]
    Backend::Select => Box::new(select::SelectPoller::new(notifier)?),
    #[cfg(linux)]
    Backend::Epoll => {
      Box::new(epoll::EpollPoller::new(notifier, event_capacity)?)
    }
    #[cfg(windows)]
    Backend::EventSelect => Box::new(wsa::EventSelectPoller::new(notifier)?),
  })
}
