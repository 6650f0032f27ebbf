//! Outgoing connections by host name.
//!
//! [`connect_host_by_name`] resolves the host, then tries the candidate
//! addresses one at a time with a non-blocking `connect`, giving each
//! [`ConnectFlags::timeout`] to complete. Every attempt, including one that
//! connects on the spot, completes through the descriptor's write callback.
//! When the list runs out the error callback gets [`ConnectError::Connect`]
//! with a "timed out" error, or, with a
//! [`retry_delay`](ConnectFlags::retry_delay), the whole list is tried
//! again after the delay, indefinitely.
//!
//! ```text
//! Resolving --resolved--> Connecting --connected--> (callback closes)
//!     |                       |
//!     +-------error-----------+--------> Closed
//! ```

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use socket2::SockAddr;

use crate::descriptor::NetDescriptor;
use crate::errors::{ConnectError, ResolveError, is_in_progress, timed_out};
use crate::manager::{AlarmId, NetManager};
use crate::resolve::{
  AddrInfo, AddrInfoHints, AddrInfoList, ResolveFlags, ResolveState,
  get_addr_info_async, split_addr_info_on_family,
};
use crate::socket::{Protocol, ProtocolFamily, Socket};

/// Per-call connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectFlags {
  /// Only addresses of this family are considered.
  pub family_demand: ProtocolFamily,
  /// Addresses of this family are tried first.
  pub family_prefer: ProtocolFamily,
  /// Time allowed per address, not per host.
  pub timeout: Duration,
  /// Start over this long after the last address failed. `None` gives up
  /// after one pass.
  pub retry_delay: Option<Duration>,
  pub resolve: ResolveFlags,
}

impl Default for ConnectFlags {
  fn default() -> Self {
    Self {
      family_demand: ProtocolFamily::Unspec,
      family_prefer: ProtocolFamily::Unspec,
      timeout: Duration::from_secs(2),
      retry_delay: None,
      resolve: ResolveFlags::default(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPhase {
  Resolving,
  Connecting,
  Closed,
}

type OnConnect = Box<dyn FnOnce(&ConnectState, NetDescriptor, SocketAddr)>;
type OnError = Box<dyn FnOnce(&ConnectState, ConnectError)>;

struct Inner {
  manager: NetManager,
  flags: ConnectFlags,
  protocol: Protocol,
  phase: Cell<ConnectPhase>,

  resolve: RefCell<Option<ResolveState>>,
  alarm: Cell<Option<AlarmId>>,
  nd: RefCell<Option<NetDescriptor>>,

  /// Candidates in try order; `cursor` indexes the current one.
  candidates: RefCell<AddrInfoList>,
  cursor: Cell<usize>,

  on_connect: RefCell<Option<OnConnect>>,
  on_error: RefCell<Option<OnError>>,
}

/// Handle to one outgoing connection attempt.
///
/// The owner must [`close`](Self::close) it: from inside the connect
/// callback once the descriptor has been taken over, from the error
/// callback, or at any earlier point to abort. Freeing an unclosed state
/// that still holds a lookup, a timer or a socket panics.
#[derive(Clone)]
pub struct ConnectState {
  inner: Rc<Inner>,
}

/// Connects to `service` on `host`.
///
/// `on_connect` receives the connected descriptor (and owns it from then
/// on) plus the peer address; it must close the state before returning.
/// Otherwise `on_error` is called, once. Neither runs from inside this call.
///
/// Fails synchronously only on strings no resolver could accept. A
/// preferred family outside the demanded one has no effect.
pub fn connect_host_by_name<C, E>(
  manager: &NetManager,
  host: &str,
  service: &str,
  protocol: Protocol,
  flags: &ConnectFlags,
  on_connect: C,
  on_error: E,
) -> io::Result<ConnectState>
where
  C: FnOnce(&ConnectState, NetDescriptor, SocketAddr) + 'static,
  E: FnOnce(&ConnectState, ConnectError) + 'static,
{
  let hints = AddrInfoHints {
    family: flags.family_demand,
    socket_type: Some(protocol.socket_type()),
    protocol: Some(protocol),
    ..AddrInfoHints::default()
  };

  let state = ConnectState {
    inner: Rc::new(Inner {
      manager: manager.clone(),
      flags: flags.clone(),
      protocol,
      phase: Cell::new(ConnectPhase::Resolving),
      resolve: RefCell::new(None),
      alarm: Cell::new(None),
      nd: RefCell::new(None),
      candidates: RefCell::new(Vec::new()),
      cursor: Cell::new(0),
      on_connect: RefCell::new(Some(Box::new(on_connect))),
      on_error: RefCell::new(Some(Box::new(on_error))),
    }),
  };

  let (ok, err) = (state.weak(), state.weak());
  let resolve = get_addr_info_async(
    manager,
    Some(host),
    Some(service),
    &hints,
    &flags.resolve,
    move |rs, list| {
      rs.close();
      if let Some(state) = ConnectState::upgrade(&ok) {
        state.resolved(list);
      }
    },
    move |rs, error| {
      rs.close();
      if let Some(state) = ConnectState::upgrade(&err) {
        state.resolve_failed(error);
      }
    },
  )?;
  *state.inner.resolve.borrow_mut() = Some(resolve);

  Ok(state)
}

impl ConnectState {
  pub fn phase(&self) -> ConnectPhase {
    self.inner.phase.get()
  }

  pub fn is_closed(&self) -> bool {
    self.phase() == ConnectPhase::Closed
  }

  pub fn ref_count(&self) -> usize {
    Rc::strong_count(&self.inner)
  }

  pub fn flags(&self) -> &ConnectFlags {
    &self.inner.flags
  }

  /// Aborts whatever is in flight and marks the state closed.
  ///
  /// Safe to call in any phase, including after the outcome was delivered.
  pub fn close(&self) {
    let resolve = self.inner.resolve.borrow_mut().take();
    if let Some(resolve) = resolve {
      resolve.close();
    }
    if let Some(alarm) = self.inner.alarm.take() {
      self.inner.manager.remove_alarm(alarm);
    }
    let nd = self.inner.nd.borrow_mut().take();
    if let Some(nd) = nd {
      nd.close();
    }
    self.inner.candidates.borrow_mut().clear();
    self.inner.phase.set(ConnectPhase::Closed);

    let callbacks = (
      self.inner.on_connect.borrow_mut().take(),
      self.inner.on_error.borrow_mut().take(),
    );
    drop(callbacks);
  }

  fn weak(&self) -> Weak<Inner> {
    Rc::downgrade(&self.inner)
  }

  fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
    weak.upgrade().map(|inner| Self { inner })
  }

  fn resolved(&self, list: AddrInfoList) {
    self.inner.resolve.borrow_mut().take();
    self.inner.phase.set(ConnectPhase::Connecting);

    let prefer = self.inner.flags.family_prefer;
    let list = if prefer == ProtocolFamily::Unspec {
      list
    } else {
      let (mut preferred, rest) = split_addr_info_on_family(list, prefer);
      preferred.extend(rest);
      preferred
    };

    *self.inner.candidates.borrow_mut() = list;
    self.inner.cursor.set(0);
    self.connect_next();
  }

  fn resolve_failed(&self, error: ResolveError) {
    self.inner.resolve.borrow_mut().take();
    self.report_error(ConnectError::Resolve(error));
  }

  fn current(&self) -> Option<AddrInfo> {
    self.inner.candidates.borrow().get(self.inner.cursor.get()).cloned()
  }

  fn advance(&self) {
    self.inner.cursor.set(self.inner.cursor.get() + 1);
  }

  /// Starts an attempt on the first candidate from the cursor on that
  /// doesn't fail outright.
  fn connect_next(&self) {
    debug_assert!(self.inner.nd.borrow().is_none());

    while let Some(candidate) = self.current() {
      let socket = match self.try_connect(&candidate) {
        Ok(socket) => socket,
        Err(err) => {
          log::debug!("connect to {} failed immediately: {err}", candidate.addr);
          self.advance();
          continue;
        }
      };

      let nd = match NetDescriptor::new(&self.inner.manager, socket) {
        Ok(nd) => nd,
        Err(err) => {
          let (error, socket) = err.into_parts();
          log::error!("registering connecting socket failed: {error}");
          if let Err(err) = socket.close() {
            log::debug!("closing socket failed: {err}");
          }
          self.inner.candidates.borrow_mut().clear();
          self.inner.phase.set(ConnectPhase::Closed);
          self.report_error(ConnectError::Connect(error));
          return;
        }
      };

      let weak = self.weak();
      nd.set_write_callback(move |nd| {
        if let Some(state) = ConnectState::upgrade(&weak) {
          state.attempt_finished(nd);
        }
      });
      *self.inner.nd.borrow_mut() = Some(nd);
      self.start_timer(self.inner.flags.timeout, Self::attempt_timed_out);
      return;
    }

    match self.inner.flags.retry_delay {
      None => self.all_failed(),
      Some(delay) => {
        log::debug!("no address reachable, retrying in {delay:?}");
        self.start_timer(delay, Self::retry);
      }
    }
  }

  /// Opens a non-blocking socket for `candidate` and starts connecting.
  fn try_connect(&self, candidate: &AddrInfo) -> io::Result<Socket> {
    let socket = Socket::open(
      candidate.family,
      candidate.socket_type,
      self.inner.protocol,
    )
    .inspect_err(|err| log::error!("socket() failed: {err}"))?;

    if let Err(err) = socket.set_nonblocking(true) {
      log::error!("could not make socket non-blocking: {err}");
      let _ = socket.close();
      return Err(err);
    }
    // Best effort.
    let _ = socket.set_reuse_addr();
    let _ = socket.set_inline_oob();
    let _ = socket.set_keep_alive();

    match socket.connect(&SockAddr::from(candidate.addr)) {
      Ok(()) => Ok(socket),
      Err(err) if is_in_progress(&err) => Ok(socket),
      Err(err) => {
        let _ = socket.close();
        Err(err)
      }
    }
  }

  fn start_timer(&self, delay: Duration, fire: fn(&ConnectState)) {
    assert!(self.inner.alarm.get().is_none(), "connect timer already set");
    let weak = self.weak();
    let id = self.inner.manager.add_alarm(delay, move || {
      if let Some(state) = ConnectState::upgrade(&weak) {
        state.inner.alarm.set(None);
        fire(&state);
      }
    });
    self.inner.alarm.set(Some(id));
  }

  /// Write readiness on the connecting socket: the attempt is over, one
  /// way or the other.
  fn attempt_finished(&self, nd: &NetDescriptor) {
    if let Some(alarm) = self.inner.alarm.take() {
      self.inner.manager.remove_alarm(alarm);
    }
    if self.is_closed() {
      log::debug!("connection attempt was aborted");
      return;
    }

    let pending = {
      let socket = match nd.socket() {
        Some(socket) => socket,
        None => unreachable!("write readiness on a closed descriptor"),
      };
      socket.take_error()
    };
    let pending = match pending {
      Ok(pending) => pending,
      Err(err) => panic!("querying the socket error failed: {err}"),
    };

    if let Some(err) = pending {
      log::debug!("connect() failed: {err}");
      self.drop_attempt();
      self.advance();
      self.connect_next();
      return;
    }

    let nd = match self.inner.nd.borrow_mut().take() {
      Some(nd) => nd,
      None => unreachable!("connected without a descriptor"),
    };
    nd.clear_write_callback();

    let addr = match self.current() {
      Some(candidate) => candidate.addr,
      None => unreachable!("connected past the last candidate"),
    };
    log::debug!("connection established to {addr}");

    let on_connect = self.inner.on_connect.borrow_mut().take();
    self.inner.on_error.borrow_mut().take();
    if let Some(on_connect) = on_connect {
      on_connect(self, nd, addr);
    }
    assert!(
      self.is_closed(),
      "connect callback returned without closing its ConnectState"
    );
  }

  fn attempt_timed_out(&self) {
    log::debug!("connect attempt timed out");
    self.drop_attempt();
    self.advance();
    self.connect_next();
  }

  fn retry(&self) {
    self.inner.cursor.set(0);
    self.connect_next();
  }

  fn drop_attempt(&self) {
    let nd = self.inner.nd.borrow_mut().take();
    if let Some(nd) = nd {
      nd.close();
    }
  }

  fn all_failed(&self) {
    self.inner.candidates.borrow_mut().clear();
    self.inner.cursor.set(0);
    self.inner.phase.set(ConnectPhase::Closed);
    // No single native code covers "every address failed, each for its own
    // reason"; timed out is the least specific one.
    self.report_error(ConnectError::Connect(timed_out()));
  }

  fn report_error(&self, error: ConnectError) {
    let on_error = self.inner.on_error.borrow_mut().take();
    self.inner.on_connect.borrow_mut().take();
    if let Some(on_error) = on_error {
      on_error(self, error);
    }
  }
}

impl Drop for Inner {
  fn drop(&mut self) {
    if std::thread::panicking() {
      return;
    }
    assert!(
      self.resolve.get_mut().is_none()
        && self.alarm.get().is_none()
        && self.nd.get_mut().is_none(),
      "ConnectState freed while still holding a lookup, timer or socket; close() it first"
    );
  }
}

impl fmt::Debug for ConnectState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConnectState")
      .field("phase", &self.phase())
      .field("candidates", &self.inner.candidates.borrow().len())
      .field("cursor", &self.inner.cursor.get())
      .field("refs", &self.ref_count())
      .finish()
  }
}
