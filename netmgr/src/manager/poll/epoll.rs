//! Poll-set backend on top of level-triggered `epoll(7)`.
//!
//! The kernel-side user data is the descriptor itself; keys are looked up
//! in `registered` when events come back.
//!
//! A socket with no interest is kept out of the kernel set entirely:
//! `EPOLLERR`/`EPOLLHUP` are reported even for an empty mask and would
//! otherwise wake every wait. For the same reason a socket whose only
//! readiness is an error or hangup nobody asked about is parked (dropped
//! from the kernel set) until its interest is next modified.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use super::util::{already_registered, not_registered, timeout_to_millis};
use super::{Event, Interest, NOTIFY_KEY, Notifier, ReadinessPoll, Waker};

#[derive(Debug, Clone, Copy)]
struct Registration {
  key: u64,
  interest: Interest,
  parked: bool,
}

impl Registration {
  fn new(key: u64, interest: Interest) -> Self {
    Self { key, interest, parked: false }
  }

  /// What the kernel set currently holds for this socket.
  fn in_kernel(&self) -> Interest {
    if self.parked { Interest::NONE } else { self.interest }
  }
}

/// Wrapper around an epoll file descriptor
pub struct EpollPoller {
  epoll_fd: OwnedFd,
  registered: HashMap<RawFd, Registration>,
  buffer: Vec<libc::epoll_event>,
  /// Notifier for waking up blocked epoll_wait
  notifier: Arc<Notifier>,
}

fn native_mask(interest: Interest) -> u32 {
  let mut events = 0u32;
  if interest.is_readable() {
    events |= libc::EPOLLIN as u32;
  }
  if interest.is_writable() {
    events |= libc::EPOLLOUT as u32;
  }
  if interest.is_exceptional() {
    events |= libc::EPOLLPRI as u32;
  }
  events
}

/// Translates kernel readiness into what `select(2)` would have said:
/// errors make a socket readable and writable, hangup makes it readable.
fn ready_from_native(events: u32) -> Interest {
  let mut ready = Interest::NONE;
  if events & (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
    ready |= Interest::READ;
  }
  if events & (libc::EPOLLOUT | libc::EPOLLERR) as u32 != 0 {
    ready |= Interest::WRITE;
  }
  if events & libc::EPOLLPRI as u32 != 0 {
    ready |= Interest::EXCEPTION;
  }
  ready
}

impl EpollPoller {
  /// Create a new epoll instance
  pub fn new(notifier: Arc<Notifier>, capacity: usize) -> io::Result<Self> {
    // Create epoll instance with CLOEXEC
    let epoll_fd = unsafe {
      let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
      OwnedFd::from_raw_fd(fd)
    };

    let poller = Self {
      epoll_fd,
      registered: HashMap::new(),
      buffer: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
      notifier,
    };

    // Register notifier's read fd for read events with special key
    poller.ctl(
      libc::EPOLL_CTL_ADD,
      poller.notifier.read_fd(),
      libc::EPOLLIN as u32,
      NOTIFY_KEY,
    )?;

    Ok(poller)
  }

  fn ctl(&self, op: i32, fd: RawFd, events: u32, data: u64) -> io::Result<()> {
    let mut event = libc::epoll_event { events, u64: data };
    let event_ptr = if op == libc::EPOLL_CTL_DEL {
      // For EPOLL_CTL_DEL, event pointer can be NULL in Linux 2.6.9+
      ptr::null_mut()
    } else {
      &mut event as *mut libc::epoll_event
    };
    syscall!(epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, event_ptr))?;
    Ok(())
  }

  /// Moves the kernel registration from `old` to `new` interest.
  fn sync(&self, fd: RawFd, old: Interest, new: Interest) -> io::Result<()> {
    let data = fd as u64;
    match (old.is_none(), new.is_none()) {
      (true, true) => Ok(()),
      (true, false) => {
        self.ctl(libc::EPOLL_CTL_ADD, fd, native_mask(new), data)
      }
      (false, true) => self.ctl(libc::EPOLL_CTL_DEL, fd, 0, data),
      (false, false) => {
        self.ctl(libc::EPOLL_CTL_MOD, fd, native_mask(new), data)
      }
    }
  }
}

impl ReadinessPoll for EpollPoller {
  fn add(&mut self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    if self.registered.contains_key(&fd) {
      return Err(already_registered());
    }
    self.sync(fd, Interest::NONE, interest)?;
    self.registered.insert(fd, Registration::new(key, interest));
    Ok(())
  }

  fn modify(
    &mut self,
    fd: RawFd,
    key: u64,
    interest: Interest,
  ) -> io::Result<()> {
    let old = *self.registered.get(&fd).ok_or_else(not_registered)?;
    self.sync(fd, old.in_kernel(), interest)?;
    self.registered.insert(fd, Registration::new(key, interest));
    Ok(())
  }

  fn delete(&mut self, fd: RawFd) -> io::Result<()> {
    let old = self.registered.remove(&fd).ok_or_else(not_registered)?;
    self.sync(fd, old.in_kernel(), Interest::NONE)
  }

  fn wait(
    &mut self,
    events: &mut Vec<Event>,
    timeout: Option<Duration>,
  ) -> io::Result<()> {
    // -1 for infinite wait
    let timeout_ms = match timeout {
      Some(d) => timeout_to_millis(d, i32::MAX as u64) as i32,
      None => -1,
    };

    let n = syscall!(epoll_wait(
      self.epoll_fd.as_raw_fd(),
      self.buffer.as_mut_ptr(),
      self.buffer.len() as i32,
      timeout_ms,
    ))? as usize;

    assert!(
      n <= self.buffer.len(),
      "epoll_wait returned more events ({}) than buffer size ({})",
      n,
      self.buffer.len()
    );

    let mut park = Vec::new();
    for native in &self.buffer[..n] {
      // Copy out of the (possibly packed) struct before use.
      let data = native.u64;
      let bits = native.events;

      if data == NOTIFY_KEY {
        self.notifier.drain();
        continue;
      }

      let Some(registration) = self.registered.get(&(data as RawFd)) else {
        continue;
      };
      let ready = ready_from_native(bits).and(registration.interest);
      if !ready.is_none() {
        events.push(Event { key: registration.key, ready });
      } else if bits & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
        park.push(data as RawFd);
      }
    }

    for fd in park {
      self.ctl(libc::EPOLL_CTL_DEL, fd, 0, fd as u64)?;
      if let Some(registration) = self.registered.get_mut(&fd) {
        registration.parked = true;
      }
    }

    Ok(())
  }

  fn waker(&self) -> Waker {
    Waker::new(self.notifier.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn poller() -> EpollPoller {
    EpollPoller::new(Arc::new(Notifier::new().unwrap()), 64).unwrap()
  }

  crate::generate_tests!(poller());

  #[test]
  fn unread_data_reported_again() {
    crate::manager::poll::tests::test_unread_data_reported_again(poller())
      .expect("level-triggered readiness was lost");
  }

  #[test]
  fn unwanted_hangup_does_not_spin() {
    use std::net::{Shutdown, TcpListener, TcpStream};
    use std::time::Instant;

    let mut poller = poller();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    server.shutdown(Shutdown::Both).unwrap();
    let fd = server.as_raw_fd();

    poller.add(fd, 7, Interest::EXCEPTION).unwrap();
    let mut events = Vec::new();
    poller.wait(&mut events, Some(Duration::from_millis(100))).unwrap();
    assert!(events.is_empty());

    // Parked: the next wait sleeps for its whole timeout.
    let started = Instant::now();
    poller.wait(&mut events, Some(Duration::from_millis(200))).unwrap();
    assert!(events.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(150));

    // Asking for reads brings it back.
    poller.modify(fd, 7, Interest::READ).unwrap();
    poller.wait(&mut events, Some(Duration::from_millis(500))).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].key, 7);
    assert!(events[0].ready.is_readable());

    poller.delete(fd).unwrap();
  }

  #[test]
  fn error_maps_to_read_and_write() {
    let ready = ready_from_native(libc::EPOLLERR as u32);
    assert!(ready.is_readable());
    assert!(ready.is_writable());
    assert!(!ready.is_exceptional());
  }

  #[test]
  fn hangup_maps_to_read() {
    assert_eq!(ready_from_native(libc::EPOLLHUP as u32), Interest::READ);
    assert_eq!(ready_from_native(libc::EPOLLPRI as u32), Interest::EXCEPTION);
  }
}
