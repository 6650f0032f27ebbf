//! Lookups running on worker threads.
//!
//! A worker owns nothing but its [`Query`] and a channel sender. It sends
//! the result back, then wakes the manager; the manager hands results to
//! their owners from [`Lookups::deliver`] inside `process()`. Nothing on
//! the worker side touches manager state.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::thread;

use crossbeam_channel::{Receiver, Sender};

use super::AddrInfoList;
use super::sys::{self, Query};
use crate::errors::ResolveError;
use crate::manager::Waker;

pub(crate) type LookupResult = Result<AddrInfoList, ResolveError>;
type OnDone = Box<dyn FnOnce(LookupResult)>;

/// Identifies one background lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Ticket(u64);

struct Done {
  ticket: Ticket,
  result: LookupResult,
}

pub(crate) struct Lookups {
  tx: Sender<Done>,
  rx: Receiver<Done>,
  pending: RefCell<HashMap<Ticket, OnDone>>,
  next: Cell<u64>,
}

impl Lookups {
  pub(crate) fn new() -> Self {
    let (tx, rx) = crossbeam_channel::unbounded();
    Self { tx, rx, pending: RefCell::new(HashMap::new()), next: Cell::new(0) }
  }

  /// Runs `query` on a fresh thread. `on_done` runs from a later
  /// [`deliver`](Self::deliver) unless the ticket is cancelled first.
  pub(crate) fn start(
    &self,
    waker: Waker,
    query: Query,
    on_done: OnDone,
  ) -> io::Result<Ticket> {
    let ticket = Ticket(self.next.get());
    self.next.set(ticket.0 + 1);

    let tx = self.tx.clone();
    thread::Builder::new().name("netmgr-resolve".into()).spawn(move || {
      let result = sys::lookup(&query);
      // The manager may be gone already; then nobody wants the answer.
      if tx.send(Done { ticket, result }).is_ok() {
        if let Err(err) = waker.wake() {
          log::error!("waking net manager after lookup failed: {err}");
        }
      }
    })?;

    self.pending.borrow_mut().insert(ticket, on_done);
    Ok(ticket)
  }

  /// Drops the owner of `ticket`; its result is discarded on arrival.
  pub(crate) fn cancel(&self, ticket: Ticket) -> bool {
    let removed = self.pending.borrow_mut().remove(&ticket);
    removed.is_some()
  }

  pub(crate) fn len(&self) -> usize {
    self.pending.borrow().len()
  }

  /// Hands every result that has arrived to its owner.
  pub(crate) fn deliver(&self) {
    for done in self.rx.try_iter() {
      let on_done = self.pending.borrow_mut().remove(&done.ticket);
      match on_done {
        Some(on_done) => on_done(done.result),
        None => log::debug!("discarding result of cancelled lookup"),
      }
    }
  }

  pub(crate) fn clear(&self) {
    let pending = std::mem::take(&mut *self.pending.borrow_mut());
    drop(pending);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::manager::poll::Notifier;
  use crate::resolve::AddrInfoHints;
  use std::rc::Rc;
  use std::sync::Arc;
  use std::time::{Duration, Instant};

  fn waker() -> Waker {
    Waker::new(Arc::new(Notifier::new().unwrap()))
  }

  fn numeric_query() -> Query {
    Query::new(Some("127.0.0.1"), Some("80"), &AddrInfoHints::default())
      .unwrap()
  }

  fn deliver_until(lookups: &Lookups, done: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
      assert!(Instant::now() < deadline, "lookup never came back");
      thread::sleep(Duration::from_millis(5));
      lookups.deliver();
    }
  }

  #[test]
  fn result_arrives_through_deliver() {
    let lookups = Lookups::new();
    let got = Rc::new(Cell::new(false));
    let got2 = got.clone();
    lookups
      .start(
        waker(),
        numeric_query(),
        Box::new(move |res| {
          assert!(!res.unwrap().is_empty());
          got2.set(true);
        }),
      )
      .unwrap();
    assert_eq!(lookups.len(), 1);

    deliver_until(&lookups, || got.get());
    assert_eq!(lookups.len(), 0);
  }

  #[test]
  fn cancelled_lookup_is_discarded() {
    let lookups = Lookups::new();
    let ticket = lookups
      .start(
        waker(),
        numeric_query(),
        Box::new(|_| panic!("cancelled lookups never deliver")),
      )
      .unwrap();
    assert!(lookups.cancel(ticket));
    assert!(!lookups.cancel(ticket));

    // Give the worker time to finish, then drain its message.
    thread::sleep(Duration::from_millis(100));
    lookups.deliver();
  }
}
