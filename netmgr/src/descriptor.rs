//! A [`Socket`] registered with the [`NetManager`], plus its callbacks.
//!
//! [`NetDescriptor`] is a reference-counted handle: clones share one
//! descriptor and the last clone to go away frees it. A descriptor must be
//! [`close`](NetDescriptor::close)d or [`detach`](NetDescriptor::detach)ed
//! before that happens; dropping one that still owns its socket panics.

use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::errors::NewDescriptorError;
use crate::manager::poll::RawSock;
use crate::manager::{Interest, NetManager};
use crate::socket::Socket;

type Callback = Rc<dyn Fn(&NetDescriptor)>;

pub(crate) struct Inner {
  manager: NetManager,
  key: u64,
  raw: RawSock,
  socket: RefCell<Option<Socket>>,
  closed: Cell<bool>,
  interest: Cell<Interest>,
  read: RefCell<Option<Callback>>,
  write: RefCell<Option<Callback>>,
  exception: RefCell<Option<Callback>>,
  close: RefCell<Option<Callback>>,
}

#[derive(Clone)]
pub struct NetDescriptor {
  inner: Rc<Inner>,
}

impl NetDescriptor {
  /// Registers `socket` with `manager`, with no callbacks set.
  ///
  /// On failure the socket is handed back unclosed inside the error.
  pub fn new(
    manager: &NetManager,
    socket: Socket,
  ) -> Result<Self, NewDescriptorError> {
    let raw = socket.raw();
    let key = manager.next_key();
    let inner = Rc::new(Inner {
      manager: manager.clone(),
      key,
      raw,
      socket: RefCell::new(Some(socket)),
      closed: Cell::new(false),
      interest: Cell::new(Interest::NONE),
      read: RefCell::new(None),
      write: RefCell::new(None),
      exception: RefCell::new(None),
      close: RefCell::new(None),
    });

    if let Err(error) = manager.add_desc(raw, key, Rc::downgrade(&inner)) {
      let socket = inner.socket.borrow_mut().take();
      inner.closed.set(true);
      return match socket {
        Some(socket) => Err(NewDescriptorError { error, socket }),
        None => unreachable!("socket was just stored"),
      };
    }

    Ok(Self { inner })
  }

  pub(crate) fn from_inner(inner: Rc<Inner>) -> Self {
    Self { inner }
  }

  pub fn manager(&self) -> &NetManager {
    &self.inner.manager
  }

  pub fn is_closed(&self) -> bool {
    self.inner.closed.get()
  }

  /// Number of live handles to this descriptor.
  pub fn ref_count(&self) -> usize {
    Rc::strong_count(&self.inner)
  }

  pub fn ptr_eq(&self, other: &NetDescriptor) -> bool {
    Rc::ptr_eq(&self.inner, &other.inner)
  }

  /// The owned socket, `None` once closed or detached.
  ///
  /// Don't hold on to the borrow across [`close`](Self::close).
  pub fn socket(&self) -> Option<Ref<'_, Socket>> {
    Ref::filter_map(self.inner.socket.borrow(), Option::as_ref).ok()
  }

  /// Interest currently registered with the manager.
  pub fn interest(&self) -> Interest {
    self.inner.interest.get()
  }

  /// Unregisters the descriptor and closes its socket.
  ///
  /// A close callback, if set, runs on the next processing pass with a
  /// handle that keeps the descriptor alive until then. Clearing it before
  /// that pass cancels it.
  ///
  /// # Panics
  /// If the descriptor is already closed.
  pub fn close(&self) {
    let socket = self.release();
    if let Err(err) = socket.close() {
      log::debug!("closing socket failed: {err}");
    }

    if self.inner.close.borrow().is_some() {
      let nd = self.clone();
      self.inner.manager.defer(move || {
        // May have been cleared since close().
        let callback = nd.inner.close.borrow_mut().take();
        if let Some(callback) = callback {
          callback(&nd);
        }
      });
    }
  }

  /// Unregisters the descriptor without closing the socket, handing the
  /// socket to the caller. The close callback is not run.
  ///
  /// # Panics
  /// If the descriptor is already closed.
  pub fn detach(&self) -> Socket {
    let socket = self.release();
    self.inner.close.borrow_mut().take();
    socket
  }

  fn release(&self) -> Socket {
    assert!(!self.is_closed(), "NetDescriptor closed twice");
    self.inner.manager.remove_desc(self.inner.raw, self.inner.key);
    self.inner.closed.set(true);
    self.inner.interest.set(Interest::NONE);

    // Callbacks commonly capture state that owns this descriptor.
    let callbacks = [
      self.inner.read.borrow_mut().take(),
      self.inner.write.borrow_mut().take(),
      self.inner.exception.borrow_mut().take(),
    ];
    drop(callbacks);

    match self.inner.socket.borrow_mut().take() {
      Some(socket) => socket,
      None => unreachable!("open descriptor without a socket"),
    }
  }

  pub fn set_read_callback(&self, callback: impl Fn(&NetDescriptor) + 'static) {
    self.set_slot(&self.inner.read, Some(Rc::new(callback)), Interest::READ);
  }

  pub fn clear_read_callback(&self) {
    self.set_slot(&self.inner.read, None, Interest::READ);
  }

  pub fn set_write_callback(
    &self,
    callback: impl Fn(&NetDescriptor) + 'static,
  ) {
    self.set_slot(&self.inner.write, Some(Rc::new(callback)), Interest::WRITE);
  }

  pub fn clear_write_callback(&self) {
    self.set_slot(&self.inner.write, None, Interest::WRITE);
  }

  pub fn set_exception_callback(
    &self,
    callback: impl Fn(&NetDescriptor) + 'static,
  ) {
    self.set_slot(
      &self.inner.exception,
      Some(Rc::new(callback)),
      Interest::EXCEPTION,
    );
  }

  pub fn clear_exception_callback(&self) {
    self.set_slot(&self.inner.exception, None, Interest::EXCEPTION);
  }

  /// Only consulted by [`close`](Self::close); never touches the manager.
  pub fn set_close_callback(
    &self,
    callback: impl Fn(&NetDescriptor) + 'static,
  ) {
    *self.inner.close.borrow_mut() = Some(Rc::new(callback));
  }

  pub fn clear_close_callback(&self) {
    self.inner.close.borrow_mut().take();
  }

  fn set_slot(
    &self,
    slot: &RefCell<Option<Callback>>,
    callback: Option<Callback>,
    bit: Interest,
  ) {
    let on = callback.is_some();
    let old = slot.replace(callback);
    drop(old);

    if self.is_closed() {
      return;
    }

    let current = self.inner.interest.get();
    let wanted = if on { current | bit } else { current.without(bit) };
    if wanted == current {
      return;
    }

    match self.inner.manager.set_interest(self.inner.raw, self.inner.key, wanted)
    {
      Ok(()) => self.inner.interest.set(wanted),
      Err(err) => log::error!("updating readiness interest failed: {err}"),
    }
  }

  /// Runs the callbacks for one readiness report: exception, write, read,
  /// then hangup. Stops as soon as the descriptor gets closed.
  pub(crate) fn dispatch(&self, ready: Interest) {
    let order = [
      (Interest::EXCEPTION, &self.inner.exception),
      (Interest::WRITE, &self.inner.write),
      (Interest::READ, &self.inner.read),
    ];

    for (bit, slot) in order {
      if !ready.contains(bit) {
        continue;
      }
      let callback = slot.borrow().clone();
      if let Some(callback) = callback {
        callback(self);
      }
      if self.is_closed() {
        return;
      }
    }

    if ready.is_hangup() {
      self.close();
    }
  }
}

impl Drop for Inner {
  fn drop(&mut self) {
    if std::thread::panicking() {
      return;
    }
    assert!(
      self.socket.get_mut().is_none(),
      "NetDescriptor freed while still owning its socket; close() or detach() it first"
    );
  }
}

impl fmt::Debug for NetDescriptor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("NetDescriptor")
      .field("key", &self.inner.key)
      .field("closed", &self.is_closed())
      .field("interest", &self.interest())
      .field("refs", &self.ref_count())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::manager::Backend;
  use crate::socket::{Protocol, ProtocolFamily, SocketType};
  use crate::test_utils::{manager_with, run_for};
  use std::io::Write;
  use std::net::{TcpListener, TcpStream};
  use std::time::Duration;

  fn manager() -> NetManager {
    manager_with(Backend::default())
  }

  /// A registered descriptor wrapping one end of a loopback connection.
  fn connected(mgr: &NetManager) -> (NetDescriptor, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (ours, _) = listener.accept().unwrap();
    let socket = Socket::from(socket2::Socket::from(ours));
    socket.set_nonblocking(true).unwrap();
    (NetDescriptor::new(mgr, socket).unwrap(), peer)
  }

  #[test]
  fn new_registers_and_close_unregisters() {
    let mgr = manager();
    let (nd, _peer) = connected(&mgr);
    assert_eq!(mgr.descriptor_count(), 1);
    assert_eq!(nd.ref_count(), 1);
    assert!(nd.socket().is_some());

    nd.close();
    assert!(nd.is_closed());
    assert!(nd.socket().is_none());
    assert_eq!(mgr.descriptor_count(), 0);
    mgr.uninit();
  }

  #[test]
  #[should_panic(expected = "closed twice")]
  fn double_close_panics() {
    let mgr = manager();
    let (nd, _peer) = connected(&mgr);
    nd.close();
    nd.close();
  }

  #[test]
  fn read_callback_fires_when_data_arrives() {
    let mgr = manager();
    let (nd, mut peer) = connected(&mgr);
    let hits = Rc::new(Cell::new(0));

    let hits2 = hits.clone();
    nd.set_read_callback(move |nd| {
      hits2.set(hits2.get() + 1);
      let mut buf = [0u8; 16];
      let n = nd.socket().unwrap().recv(&mut buf).unwrap();
      assert_eq!(&buf[..n], b"ping");
    });

    peer.write_all(b"ping").unwrap();
    run_for(&mgr, Duration::from_millis(500));
    assert_eq!(hits.get(), 1);

    nd.close();
    mgr.uninit();
  }

  #[test]
  fn setting_same_callback_twice_registers_once() {
    let mgr = manager();
    let (nd, mut peer) = connected(&mgr);
    let hits = Rc::new(Cell::new(0));

    let hits2 = hits.clone();
    let callback = Rc::new(move |nd: &NetDescriptor| {
      hits2.set(hits2.get() + 1);
      let mut buf = [0u8; 16];
      let _ = nd.socket().unwrap().recv(&mut buf);
    });
    let (a, b) = (callback.clone(), callback.clone());
    nd.set_read_callback(move |nd| a(nd));
    nd.set_read_callback(move |nd| b(nd));
    assert_eq!(nd.interest(), Interest::READ);

    peer.write_all(b"x").unwrap();
    run_for(&mgr, Duration::from_millis(500));
    assert_eq!(hits.get(), 1, "one readiness event, one dispatch");

    nd.close();
    mgr.uninit();
  }

  #[test]
  fn clearing_callback_deactivates_interest() {
    let mgr = manager();
    let (nd, mut peer) = connected(&mgr);
    let hits = Rc::new(Cell::new(0));

    let hits2 = hits.clone();
    nd.set_read_callback(move |_| hits2.set(hits2.get() + 1));
    nd.clear_read_callback();
    assert!(nd.interest().is_none());

    peer.write_all(b"x").unwrap();
    run_for(&mgr, Duration::from_millis(20));
    assert_eq!(hits.get(), 0);

    nd.close();
    mgr.uninit();
  }

  #[test]
  fn write_runs_before_read_and_close_stops_dispatch() {
    let mgr = manager();
    let (nd, mut peer) = connected(&mgr);
    let log = Rc::new(RefCell::new(Vec::new()));

    let log_w = log.clone();
    nd.set_write_callback(move |nd| {
      log_w.borrow_mut().push("write");
      nd.close();
    });
    let log_r = log.clone();
    nd.set_read_callback(move |_| log_r.borrow_mut().push("read"));

    peer.write_all(b"both").unwrap();
    std::thread::sleep(Duration::from_millis(10));
    run_for(&mgr, Duration::from_millis(500));

    assert_eq!(*log.borrow(), vec!["write"]);
    assert!(nd.is_closed());
    mgr.uninit();
  }

  #[test]
  fn close_callback_is_deferred_to_next_pass() {
    let mgr = manager();
    let (nd, _peer) = connected(&mgr);
    let seen = Rc::new(Cell::new(false));

    let seen2 = seen.clone();
    nd.set_close_callback(move |nd| {
      assert!(nd.is_closed());
      seen2.set(true);
    });
    assert!(nd.interest().is_none(), "close callback is bookkeeping only");

    nd.close();
    assert!(!seen.get(), "must not run inside close()");
    assert_eq!(nd.ref_count(), 2, "the pending callback holds a reference");

    run_for(&mgr, Duration::from_millis(10));
    assert!(seen.get());
    assert_eq!(nd.ref_count(), 1);
    mgr.uninit();
  }

  #[test]
  fn close_callback_cleared_before_next_pass_never_runs() {
    let mgr = manager();
    let (nd, _peer) = connected(&mgr);
    let seen = Rc::new(Cell::new(false));

    let seen2 = seen.clone();
    nd.set_close_callback(move |_| seen2.set(true));
    nd.close();
    nd.clear_close_callback();

    run_for(&mgr, Duration::from_millis(10));
    assert!(!seen.get());
    assert_eq!(nd.ref_count(), 1);
    mgr.uninit();
  }

  #[test]
  fn detach_hands_back_open_socket_without_close_callback() {
    let mgr = manager();
    let (nd, _peer) = connected(&mgr);
    let seen = Rc::new(Cell::new(false));
    let seen2 = seen.clone();
    nd.set_close_callback(move |_| seen2.set(true));

    let socket = nd.detach();
    assert!(nd.is_closed());
    assert_eq!(mgr.descriptor_count(), 0);
    assert!(socket.local_addr().is_ok(), "socket must still be open");

    run_for(&mgr, Duration::from_millis(10));
    assert!(!seen.get());

    // Re-register the same socket elsewhere.
    let again = NetDescriptor::new(&mgr, socket).unwrap();
    again.close();
    mgr.uninit();
  }

  #[test]
  fn callbacks_set_after_close_are_inert() {
    let mgr = manager();
    let (nd, _peer) = connected(&mgr);
    nd.close();
    nd.set_write_callback(|_| panic!("closed descriptors never dispatch"));
    assert!(nd.interest().is_none());
    run_for(&mgr, Duration::from_millis(10));
    mgr.uninit();
  }

  #[test]
  #[should_panic(expected = "still owning its socket")]
  fn dropping_open_descriptor_panics() {
    let mgr = manager();
    let socket =
      Socket::open(ProtocolFamily::Inet, SocketType::Stream, Protocol::Tcp)
        .unwrap();
    let nd = NetDescriptor::new(&mgr, socket).unwrap();
    drop(nd);
  }
}
