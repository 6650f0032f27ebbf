//! Poll-set backend on top of `select(2)`.
//!
//! Three master sets (read, write, exception) indexed by descriptor number
//! are copied into the wait on every cycle. Results are reported in
//! ascending descriptor order.

use std::collections::BTreeMap;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use super::util::{
  already_registered, duration_to_timeval, not_registered,
};
use super::{Event, Interest, Notifier, ReadinessPoll, Waker};
use crate::errors::too_many_sockets;

#[derive(Debug, Clone, Copy)]
struct Registration {
  key: u64,
  interest: Interest,
}

pub struct SelectPoller {
  read_set: libc::fd_set,
  write_set: libc::fd_set,
  except_set: libc::fd_set,
  /// Ordered by descriptor, which is also the reporting order.
  registered: BTreeMap<RawFd, Registration>,
  notifier: Arc<Notifier>,
}

fn empty_set() -> libc::fd_set {
  let mut set = MaybeUninit::<libc::fd_set>::uninit();
  // SAFETY: FD_ZERO initialises the whole set.
  unsafe {
    libc::FD_ZERO(set.as_mut_ptr());
    set.assume_init()
  }
}

fn put(set: &mut libc::fd_set, fd: RawFd, on: bool) {
  // SAFETY: callers only pass descriptors below FD_SETSIZE.
  unsafe {
    if on {
      libc::FD_SET(fd, set);
    } else {
      libc::FD_CLR(fd, set);
    }
  }
}

fn is_set(set: &libc::fd_set, fd: RawFd) -> bool {
  // SAFETY: as for `put`.
  unsafe { libc::FD_ISSET(fd, set) }
}

impl SelectPoller {
  pub fn new(notifier: Arc<Notifier>) -> io::Result<Self> {
    if notifier.read_fd() as usize >= libc::FD_SETSIZE as usize {
      return Err(too_many_sockets());
    }
    Ok(Self {
      read_set: empty_set(),
      write_set: empty_set(),
      except_set: empty_set(),
      registered: BTreeMap::new(),
      notifier,
    })
  }

  fn apply(&mut self, fd: RawFd, interest: Interest) {
    put(&mut self.read_set, fd, interest.is_readable());
    put(&mut self.write_set, fd, interest.is_writable());
    put(&mut self.except_set, fd, interest.is_exceptional());
  }
}

impl ReadinessPoll for SelectPoller {
  fn add(&mut self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    if fd < 0 || fd as usize >= libc::FD_SETSIZE as usize {
      return Err(too_many_sockets());
    }
    if self.registered.contains_key(&fd) {
      return Err(already_registered());
    }
    self.registered.insert(fd, Registration { key, interest });
    self.apply(fd, interest);
    Ok(())
  }

  fn modify(
    &mut self,
    fd: RawFd,
    key: u64,
    interest: Interest,
  ) -> io::Result<()> {
    let entry = self.registered.get_mut(&fd).ok_or_else(not_registered)?;
    *entry = Registration { key, interest };
    self.apply(fd, interest);
    Ok(())
  }

  fn delete(&mut self, fd: RawFd) -> io::Result<()> {
    self.registered.remove(&fd).ok_or_else(not_registered)?;
    self.apply(fd, Interest::NONE);
    Ok(())
  }

  fn wait(
    &mut self,
    events: &mut Vec<Event>,
    timeout: Option<Duration>,
  ) -> io::Result<()> {
    let notify_fd = self.notifier.read_fd();

    let mut read_set = self.read_set;
    let mut write_set = self.write_set;
    let mut except_set = self.except_set;
    put(&mut read_set, notify_fd, true);

    let max_fd = self
      .registered
      .keys()
      .next_back()
      .copied()
      .map_or(notify_fd, |fd| fd.max(notify_fd));

    let mut tv = timeout.map(duration_to_timeval);
    let tv_ptr = match tv.as_mut() {
      Some(tv) => tv as *mut libc::timeval,
      None => ptr::null_mut(),
    };

    let n = syscall!(select(
      max_fd + 1,
      &mut read_set,
      &mut write_set,
      &mut except_set,
      tv_ptr,
    ))?;

    let mut remaining = n as usize;
    if remaining == 0 {
      return Ok(());
    }

    if is_set(&read_set, notify_fd) {
      self.notifier.drain();
      remaining -= 1;
    }

    for (&fd, registration) in &self.registered {
      if remaining == 0 {
        break;
      }

      let mut ready = Interest::NONE;
      let mut bits = 0;
      if is_set(&except_set, fd) {
        ready |= Interest::EXCEPTION;
        bits += 1;
      }
      if is_set(&write_set, fd) {
        ready |= Interest::WRITE;
        bits += 1;
      }
      if is_set(&read_set, fd) {
        ready |= Interest::READ;
        bits += 1;
      }

      if bits > 0 {
        events.push(Event { key: registration.key, ready });
        remaining = remaining.saturating_sub(bits);
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

  fn poller() -> SelectPoller {
    SelectPoller::new(Arc::new(Notifier::new().unwrap())).unwrap()
  }

  crate::generate_tests!(poller());

  #[test]
  fn unread_data_reported_again() {
    crate::manager::poll::tests::test_unread_data_reported_again(poller())
      .expect("level-triggered readiness was lost");
  }

  #[test]
  fn rejects_descriptor_beyond_set_size() {
    let mut poller = poller();
    let err = poller
      .add(libc::FD_SETSIZE as RawFd, 1, Interest::READ)
      .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EMFILE));
  }
}
