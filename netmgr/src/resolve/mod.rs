//! Asynchronous name resolution.
//!
//! [`get_addr_info_async`] always delivers its outcome from a later
//! `process()` pass, never from inside the call, through exactly one of its
//! two callbacks. How the lookup itself runs depends on [`ResolveMode`]:
//!
//! - [`ResolveMode::Deferred`] resolves on the spot (blocking) and queues
//!   the delivery as a deferred callback.
//! - [`ResolveMode::Background`] resolves on a worker thread; the result
//!   is picked up by the pass after it arrives.
//!
//! Either way [`ResolveState::close`] before delivery cancels it.

pub(crate) mod background;
mod sys;

use std::cell::Cell;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use crate::errors::ResolveError;
use crate::manager::{CallbackId, NetManager};
use crate::socket::{Protocol, ProtocolFamily, SocketType};
use background::{LookupResult, Ticket};
use sys::Query;

/// One resolved candidate address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
  pub family: ProtocolFamily,
  pub socket_type: SocketType,
  /// `None` when the resolver left it unspecified.
  pub protocol: Option<Protocol>,
  pub addr: SocketAddr,
  pub canonical_name: Option<String>,
}

/// Resolved addresses, in resolver order. The receiver owns them.
pub type AddrInfoList = Vec<AddrInfo>;

/// Narrows a lookup, `getaddrinfo` style.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AddrInfoHints {
  pub family: ProtocolFamily,
  pub socket_type: Option<SocketType>,
  pub protocol: Option<Protocol>,
  /// Wildcard addresses for binding when no host is given.
  pub passive: bool,
  pub canonical_name: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResolveMode {
  /// Blocking lookup, deferred delivery.
  #[default]
  Deferred,
  /// Lookup on a worker thread.
  Background,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResolveFlags {
  pub mode: ResolveMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvePhase {
  Resolving,
  Closed,
}

#[derive(Debug, Clone, Copy)]
enum Pending {
  Deferred(CallbackId),
  Background(Ticket),
}

struct Inner {
  manager: NetManager,
  phase: Cell<ResolvePhase>,
  pending: Cell<Option<Pending>>,
}

/// Handle to one in-flight lookup.
///
/// The callback receiving the outcome must [`close`](Self::close) the
/// state before returning.
#[derive(Clone)]
pub struct ResolveState {
  inner: Rc<Inner>,
}

impl ResolveState {
  pub fn phase(&self) -> ResolvePhase {
    self.inner.phase.get()
  }

  pub fn is_closed(&self) -> bool {
    self.phase() == ResolvePhase::Closed
  }

  pub fn ref_count(&self) -> usize {
    Rc::strong_count(&self.inner)
  }

  /// Whether the outcome is still to be delivered.
  pub fn is_pending(&self) -> bool {
    self.inner.pending.get().is_some()
  }

  /// Cancels delivery if it hasn't happened yet and marks the state
  /// closed. Closing twice is harmless.
  pub fn close(&self) {
    match self.inner.pending.take() {
      Some(Pending::Deferred(id)) => {
        self.inner.manager.cancel_deferred(id);
      }
      Some(Pending::Background(ticket)) => {
        self.inner.manager.lookups().cancel(ticket);
      }
      None => {}
    }
    self.inner.phase.set(ResolvePhase::Closed);
  }

  fn deliver<S, E>(self, result: LookupResult, on_success: S, on_error: E)
  where
    S: FnOnce(&ResolveState, AddrInfoList),
    E: FnOnce(&ResolveState, ResolveError),
  {
    self.inner.pending.set(None);
    match result {
      Ok(list) => on_success(&self, list),
      Err(err) => {
        log::debug!("resolve failed: {err}");
        on_error(&self, err)
      }
    }
    assert!(
      self.is_closed(),
      "resolve callback returned without closing its ResolveState"
    );
  }
}

impl Drop for Inner {
  fn drop(&mut self) {
    if std::thread::panicking() || !self.manager.is_live() {
      return;
    }
    assert!(
      self.pending.get().is_none(),
      "ResolveState freed with its delivery still pending"
    );
  }
}

impl fmt::Debug for ResolveState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ResolveState")
      .field("phase", &self.phase())
      .field("pending", &self.inner.pending.get())
      .field("refs", &self.ref_count())
      .finish()
  }
}

/// Resolves `node`/`service` and reports through `on_success` or
/// `on_error` from a later processing pass.
///
/// Fails synchronously only for inputs no lookup could accept (interior
/// NUL bytes) or when a worker thread can't be started.
pub fn get_addr_info_async<S, E>(
  manager: &NetManager,
  node: Option<&str>,
  service: Option<&str>,
  hints: &AddrInfoHints,
  flags: &ResolveFlags,
  on_success: S,
  on_error: E,
) -> io::Result<ResolveState>
where
  S: FnOnce(&ResolveState, AddrInfoList) + 'static,
  E: FnOnce(&ResolveState, ResolveError) + 'static,
{
  let query = Query::new(node, service, hints)?;
  let state = ResolveState {
    inner: Rc::new(Inner {
      manager: manager.clone(),
      phase: Cell::new(ResolvePhase::Resolving),
      pending: Cell::new(None),
    }),
  };

  let held = state.clone();
  let pending = match flags.mode {
    ResolveMode::Deferred => {
      let result = sys::lookup(&query);
      let id = manager.defer(move || held.deliver(result, on_success, on_error));
      Pending::Deferred(id)
    }
    ResolveMode::Background => {
      let ticket = manager.lookups().start(
        manager.waker(),
        query,
        Box::new(move |result| held.deliver(result, on_success, on_error)),
      )?;
      Pending::Background(ticket)
    }
  };
  state.inner.pending.set(Some(pending));

  Ok(state)
}

/// Splits `list` into the entries of `family` and the rest, keeping the
/// relative order within each part. Entries are moved, not copied.
pub fn split_addr_info_on_family(
  list: AddrInfoList,
  family: ProtocolFamily,
) -> (AddrInfoList, AddrInfoList) {
  list.into_iter().partition(|ai| ai.family == family)
}
