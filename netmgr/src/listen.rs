//! Accepting incoming connections.
//!
//! [`listen_port`] resolves the wildcard addresses for a service and binds
//! and listens on every one it can. Each listening socket gets a read
//! callback that accepts one connection per readiness report and hands it
//! to the accept callback as a fresh, callback-less [`NetDescriptor`].
//!
//! Datagram sockets are bound but not listened on and get no accept
//! callback; reach them through [`ListenState::descriptors`].

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use socket2::SockAddr;

use crate::descriptor::NetDescriptor;
use crate::errors::{
  ListenError, ResolveError, io_failure, is_resource_exhaustion,
  is_transient_accept,
};
use crate::manager::NetManager;
use crate::resolve::{
  AddrInfo, AddrInfoHints, AddrInfoList, ResolveFlags, ResolveState,
  get_addr_info_async, split_addr_info_on_family,
};
use crate::socket::{Protocol, ProtocolFamily, Socket, SocketType};

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ListenFlags {
  /// Only addresses of this family are bound.
  pub family_demand: ProtocolFamily,
  /// Addresses of this family are bound first.
  pub family_prefer: ProtocolFamily,
  /// Second argument to `listen(2)`.
  pub backlog: i32,
  pub resolve: ResolveFlags,
}

impl Default for ListenFlags {
  fn default() -> Self {
    Self {
      family_demand: ProtocolFamily::Unspec,
      family_prefer: ProtocolFamily::Unspec,
      backlog: 5,
      resolve: ResolveFlags::default(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenPhase {
  Resolving,
  Listening,
  Closed,
}

type OnAccept =
  Rc<dyn Fn(&ListenState, &NetDescriptor, NetDescriptor, SocketAddr)>;
type OnError = Box<dyn FnOnce(&ListenState, ListenError)>;

struct Inner {
  manager: NetManager,
  flags: ListenFlags,
  protocol: Protocol,
  phase: Cell<ListenPhase>,
  resolve: RefCell<Option<ResolveState>>,
  nds: RefCell<Vec<NetDescriptor>>,
  on_accept: RefCell<Option<OnAccept>>,
  on_error: RefCell<Option<OnError>>,
}

/// Handle to a set of listening sockets.
///
/// Must be [`close`](Self::close)d by its owner; freeing one that still
/// holds a lookup or a listening socket panics.
#[derive(Clone)]
pub struct ListenState {
  inner: Rc<Inner>,
}

/// Listens on `service` on every local wildcard address.
///
/// `on_accept` runs for each accepted connection with the listening
/// descriptor, the new descriptor (owned by the callback from then on) and
/// the peer address. `on_error` runs at most once, when resolving fails or
/// no address could be listened on.
pub fn listen_port<A, E>(
  manager: &NetManager,
  service: &str,
  protocol: Protocol,
  flags: &ListenFlags,
  on_accept: A,
  on_error: E,
) -> io::Result<ListenState>
where
  A: Fn(&ListenState, &NetDescriptor, NetDescriptor, SocketAddr) + 'static,
  E: FnOnce(&ListenState, ListenError) + 'static,
{
  let hints = AddrInfoHints {
    family: flags.family_demand,
    socket_type: Some(protocol.socket_type()),
    protocol: Some(protocol),
    passive: true,
    ..AddrInfoHints::default()
  };

  let state = ListenState {
    inner: Rc::new(Inner {
      manager: manager.clone(),
      flags: flags.clone(),
      protocol,
      phase: Cell::new(ListenPhase::Resolving),
      resolve: RefCell::new(None),
      nds: RefCell::new(Vec::new()),
      on_accept: RefCell::new(Some(Rc::new(on_accept))),
      on_error: RefCell::new(Some(Box::new(on_error))),
    }),
  };

  let (ok, err) = (state.weak(), state.weak());
  let resolve = get_addr_info_async(
    manager,
    None,
    Some(service),
    &hints,
    &flags.resolve,
    move |rs, list| {
      rs.close();
      if let Some(state) = ListenState::upgrade(&ok) {
        state.resolved(list);
      }
    },
    move |rs, error| {
      rs.close();
      if let Some(state) = ListenState::upgrade(&err) {
        state.resolve_failed(error);
      }
    },
  )?;
  *state.inner.resolve.borrow_mut() = Some(resolve);

  Ok(state)
}

impl ListenState {
  pub fn phase(&self) -> ListenPhase {
    self.inner.phase.get()
  }

  pub fn is_closed(&self) -> bool {
    self.phase() == ListenPhase::Closed
  }

  pub fn ref_count(&self) -> usize {
    Rc::strong_count(&self.inner)
  }

  pub fn flags(&self) -> &ListenFlags {
    &self.inner.flags
  }

  /// One descriptor per bound address.
  pub fn descriptors(&self) -> Vec<NetDescriptor> {
    self.inner.nds.borrow().clone()
  }

  /// Addresses actually bound, with the ports the system picked for
  /// service `"0"`.
  pub fn local_addrs(&self) -> Vec<SocketAddr> {
    self
      .inner
      .nds
      .borrow()
      .iter()
      .filter_map(|nd| nd.socket()?.local_addr().ok())
      .collect()
  }

  /// Cancels a pending lookup, closes every listening descriptor and marks
  /// the state closed.
  pub fn close(&self) {
    let resolve = self.inner.resolve.borrow_mut().take();
    if let Some(resolve) = resolve {
      resolve.close();
    }
    let nds = std::mem::take(&mut *self.inner.nds.borrow_mut());
    for nd in nds.into_iter().rev() {
      nd.close();
    }
    self.inner.phase.set(ListenPhase::Closed);

    let callbacks = (
      self.inner.on_accept.borrow_mut().take(),
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
    self.inner.phase.set(ListenPhase::Listening);

    let prefer = self.inner.flags.family_prefer;
    let list = if prefer == ProtocolFamily::Unspec {
      list
    } else {
      let (mut preferred, rest) = split_addr_info_on_family(list, prefer);
      preferred.extend(rest);
      preferred
    };

    let mut bound = Vec::with_capacity(list.len());
    for candidate in &list {
      match self.listen_single(candidate) {
        Ok(nd) => bound.push(nd),
        // Dual-stack systems often cover both families with one socket,
        // making the second bind fail; only worth an error while nothing
        // is bound yet.
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
          if bound.is_empty() {
            log::error!(
              "preparing to accept connections on {} failed: {err}",
              candidate.addr
            );
          }
        }
        Err(_) => {}
      }
    }

    let none_bound = bound.is_empty();
    *self.inner.nds.borrow_mut() = bound;

    if none_bound {
      self.report_error(ListenError::Listen(io_failure()));
    }
  }

  fn resolve_failed(&self, error: ResolveError) {
    self.inner.resolve.borrow_mut().take();
    self.report_error(ListenError::Resolve(error));
  }

  /// Opens, binds and (for streams) listens on one address.
  fn listen_single(&self, candidate: &AddrInfo) -> io::Result<NetDescriptor> {
    let socket = Socket::open(
      candidate.family,
      candidate.socket_type,
      self.inner.protocol,
    )
    .inspect_err(|err| log::error!("socket() failed: {err}"))?;

    let _ = socket.set_reuse_addr();
    let prepared = socket
      .set_nonblocking(true)
      .inspect_err(|err| {
        log::error!("could not make socket non-blocking: {err}");
      })
      .and_then(|()| {
        socket.bind(&SockAddr::from(candidate.addr)).inspect_err(|err| {
          if err.kind() == io::ErrorKind::AddrInUse {
            log::debug!("bind() to {} failed: {err}", candidate.addr);
          } else {
            log::error!("bind() to {} failed: {err}", candidate.addr);
          }
        })
      })
      .and_then(|()| {
        if candidate.socket_type != SocketType::Stream {
          return Ok(());
        }
        socket
          .listen(self.inner.flags.backlog)
          .inspect_err(|err| log::error!("listen() failed: {err}"))
      });
    if let Err(err) = prepared {
      let _ = socket.close();
      return Err(err);
    }

    let nd = NetDescriptor::new(&self.inner.manager, socket).map_err(|err| {
      let (error, socket) = err.into_parts();
      log::error!("registering listening socket failed: {error}");
      let _ = socket.close();
      error
    })?;

    if candidate.socket_type == SocketType::Stream {
      let weak = self.weak();
      nd.set_read_callback(move |nd| {
        if let Some(state) = ListenState::upgrade(&weak) {
          state.accept_one(nd);
        }
      });
    }
    Ok(nd)
  }

  /// Accepts a single pending connection on `listener`.
  ///
  /// # Panics
  /// On accept errors that are neither transient nor resource exhaustion.
  fn accept_one(&self, listener: &NetDescriptor) {
    let accepted = {
      let socket = match listener.socket() {
        Some(socket) => socket,
        None => unreachable!("read readiness on a closed descriptor"),
      };
      socket.accept()
    };

    let (socket, addr) = match accepted {
      Ok(accepted) => accepted,
      Err(err) if is_transient_accept(&err) => return,
      Err(err) if is_resource_exhaustion(&err) => {
        log::warn!("accept() reported '{err}'");
        return;
      }
      Err(err) => {
        log::error!("internal error: accept() reported '{err}'");
        panic!("accept() failed unexpectedly: {err}");
      }
    };

    let _ = socket.set_reuse_addr();
    if let Err(err) = socket.set_nonblocking(true) {
      log::error!("could not make socket non-blocking: {err}");
      let _ = socket.close();
      return;
    }
    let _ = socket.set_inline_oob();
    let _ = socket.set_keep_alive();

    let Some(peer) = addr.as_socket() else {
      log::error!("accepted a connection from a non-inet address");
      let _ = socket.close();
      return;
    };
    log::debug!("accepted connection from {peer}");

    let nd = match NetDescriptor::new(&self.inner.manager, socket) {
      Ok(nd) => nd,
      Err(err) => {
        let (error, socket) = err.into_parts();
        log::error!("registering accepted socket failed: {error}");
        let _ = socket.close();
        return;
      }
    };

    let on_accept = self.inner.on_accept.borrow().clone();
    match on_accept {
      Some(on_accept) => on_accept(self, listener, nd, peer),
      // Nobody to own it.
      None => nd.close(),
    }
  }

  fn report_error(&self, error: ListenError) {
    let on_error = self.inner.on_error.borrow_mut().take();
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
      self.resolve.get_mut().is_none() && self.nds.get_mut().is_empty(),
      "ListenState freed while still holding a lookup or listening sockets; close() it first"
    );
  }
}

impl fmt::Debug for ListenState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ListenState")
      .field("phase", &self.phase())
      .field("listening", &self.inner.nds.borrow().len())
      .field("refs", &self.ref_count())
      .finish()
  }
}
