//! Event-object backend on top of `WSAEventSelect`.
//!
//! Each socket gets its own WSA event object. Slots whose interest is
//! non-empty are kept packed at the front of `slots` (`active` of them), so
//! one wait covers exactly the sockets somebody is listening to.
//!
//! `WSAWaitForMultipleEvents` only reports the first signalled handle, so
//! a wait is repeated with a zero timeout over the remaining handles until
//! none is left signalled.

use std::io;
use std::time::Duration;

use windows_sys::Win32::Networking::WinSock::{
  FD_ACCEPT, FD_CLOSE, FD_CONNECT, FD_OOB, FD_READ, FD_WRITE, SOCKET,
  WSA_INFINITE, WSA_MAXIMUM_WAIT_EVENTS, WSA_WAIT_EVENT_0, WSA_WAIT_FAILED,
  WSA_WAIT_IO_COMPLETION, WSA_WAIT_TIMEOUT, WSACloseEvent, WSACreateEvent,
  WSAEVENT, WSAEnumNetworkEvents, WSAEventSelect, WSAGetLastError,
  WSANETWORKEVENTS, WSAWaitForMultipleEvents,
};

use std::sync::Arc;

use super::util::{already_registered, not_registered, timeout_to_millis};
use super::{Event, Interest, Notifier, RawSock, ReadinessPoll, Waker};
use crate::errors::too_many_sockets;

struct Slot {
  key: u64,
  sock: SOCKET,
  event: WSAEVENT,
  interest: Interest,
}

pub struct EventSelectPoller {
  slots: Vec<Slot>,
  /// `slots[..active]` have a non-empty interest.
  active: usize,
  notifier: Arc<Notifier>,
}

fn last_wsa_error() -> io::Error {
  io::Error::from_raw_os_error(unsafe { WSAGetLastError() })
}

fn native_mask(interest: Interest) -> i32 {
  if interest.is_none() {
    return 0;
  }
  let mut mask = FD_CLOSE as i32;
  if interest.is_readable() {
    mask |= (FD_READ | FD_ACCEPT) as i32;
  }
  if interest.is_writable() {
    mask |= (FD_WRITE | FD_CONNECT) as i32;
  }
  if interest.is_exceptional() {
    mask |= FD_OOB as i32;
  }
  mask
}

fn ready_from_native(events: i32) -> Interest {
  let mut ready = Interest::NONE;
  if events & (FD_READ | FD_ACCEPT) as i32 != 0 {
    ready |= Interest::READ;
  }
  if events & (FD_WRITE | FD_CONNECT) as i32 != 0 {
    ready |= Interest::WRITE;
  }
  if events & FD_OOB as i32 != 0 {
    ready |= Interest::EXCEPTION;
  }
  if events & FD_CLOSE as i32 != 0 {
    ready |= Interest::HANGUP;
  }
  ready
}

impl EventSelectPoller {
  pub fn new(notifier: Arc<Notifier>) -> io::Result<Self> {
    Ok(Self { slots: Vec::new(), active: 0, notifier })
  }

  fn position(&self, sock: SOCKET) -> io::Result<usize> {
    self.slots.iter().position(|slot| slot.sock == sock).ok_or_else(not_registered)
  }

  /// Moves the slot at `index` into or out of the active prefix.
  fn repartition(&mut self, index: usize) -> usize {
    let wants_active = !self.slots[index].interest.is_none();
    if wants_active && index >= self.active {
      self.slots.swap(index, self.active);
      self.active += 1;
      self.active - 1
    } else if !wants_active && index < self.active {
      self.active -= 1;
      self.slots.swap(index, self.active);
      self.active
    } else {
      index
    }
  }

  fn select(&self, slot: &Slot) -> io::Result<()> {
    wsa_call!(WSAEventSelect(slot.sock, slot.event, native_mask(slot.interest)))?;
    Ok(())
  }

  fn enumerate(&self, index: usize) -> io::Result<Interest> {
    let slot = &self.slots[index];
    let mut network: WSANETWORKEVENTS = unsafe { std::mem::zeroed() };
    wsa_call!(WSAEnumNetworkEvents(slot.sock, slot.event, &mut network))?;
    Ok(ready_from_native(network.lNetworkEvents).and(
      slot.interest | Interest::HANGUP,
    ))
  }
}

impl ReadinessPoll for EventSelectPoller {
  fn add(
    &mut self,
    sock: RawSock,
    key: u64,
    interest: Interest,
  ) -> io::Result<()> {
    let sock = sock as SOCKET;
    if self.slots.iter().any(|slot| slot.sock == sock) {
      return Err(already_registered());
    }
    // One handle is reserved for the notifier.
    if self.slots.len() + 1 >= WSA_MAXIMUM_WAIT_EVENTS as usize {
      return Err(too_many_sockets());
    }

    let event = unsafe { WSACreateEvent() };
    if event.is_null() {
      return Err(last_wsa_error());
    }
    let slot = Slot { key, sock, event, interest };
    if let Err(err) = self.select(&slot) {
      unsafe { WSACloseEvent(event) };
      return Err(err);
    }

    self.slots.push(slot);
    let index = self.slots.len() - 1;
    self.repartition(index);
    Ok(())
  }

  fn modify(
    &mut self,
    sock: RawSock,
    key: u64,
    interest: Interest,
  ) -> io::Result<()> {
    let index = self.position(sock as SOCKET)?;
    self.slots[index].key = key;
    self.slots[index].interest = interest;
    let index = self.repartition(index);
    self.select(&self.slots[index])
  }

  fn delete(&mut self, sock: RawSock) -> io::Result<()> {
    let index = self.position(sock as SOCKET)?;
    self.slots[index].interest = Interest::NONE;
    let index = self.repartition(index);
    let slot = self.slots.swap_remove(index);

    // Detach the event from the socket before it goes away; the socket
    // may live on elsewhere.
    let res = wsa_call!(WSAEventSelect(slot.sock, std::ptr::null_mut(), 0));
    unsafe { WSACloseEvent(slot.event) };
    res.map(|_| ())
  }

  fn wait(
    &mut self,
    events: &mut Vec<Event>,
    timeout: Option<Duration>,
  ) -> io::Result<()> {
    let mut timeout_ms = match timeout {
      Some(d) => timeout_to_millis(d, (WSA_INFINITE as u64) - 1) as u32,
      None => WSA_INFINITE as u32,
    };

    // Handle 0 is the notifier, handle i + 1 is active slot i.
    let mut handles = Vec::with_capacity(self.active + 1);
    handles.push(self.notifier.event());
    handles.extend(self.slots[..self.active].iter().map(|slot| slot.event));

    let mut start = 0usize;
    while start < handles.len() {
      let res = unsafe {
        WSAWaitForMultipleEvents(
          (handles.len() - start) as u32,
          handles[start..].as_ptr(),
          0,
          timeout_ms,
          0,
        )
      } as u32;

      if res == WSA_WAIT_IO_COMPLETION as u32 {
        continue;
      }
      if res == WSA_WAIT_TIMEOUT as u32 {
        break;
      }
      if res == WSA_WAIT_FAILED as u32 {
        return Err(last_wsa_error());
      }

      let index = start + (res - WSA_WAIT_EVENT_0 as u32) as usize;
      if index == 0 {
        self.notifier.drain();
      } else {
        let ready = self.enumerate(index - 1)?;
        if !ready.is_none() {
          events.push(Event { key: self.slots[index - 1].key, ready });
        }
      }

      // Check the rest of the sockets, but don't wait anymore.
      start = index + 1;
      timeout_ms = 0;
    }

    Ok(())
  }

  fn waker(&self) -> Waker {
    Waker::new(self.notifier.clone())
  }
}

impl Drop for EventSelectPoller {
  fn drop(&mut self) {
    for slot in self.slots.drain(..) {
      unsafe { WSACloseEvent(slot.event) };
    }
  }
}
