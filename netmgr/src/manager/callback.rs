//! Deferred callback queue.
//!
//! "Run this later, not inside the current call." A processing pass only
//! runs what was queued before the pass started; anything queued from
//! inside a running callback waits for the next pass.

use std::collections::VecDeque;
use std::fmt;

/// Identifies a queued callback so it can be cancelled before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallbackId(u64);

pub(crate) type Deferred = Box<dyn FnOnce()>;

pub(crate) struct CallbackQueue {
  next_id: u64,
  entries: VecDeque<(CallbackId, Deferred)>,
}

impl CallbackQueue {
  pub fn new() -> Self {
    Self { next_id: 0, entries: VecDeque::new() }
  }

  pub fn push(&mut self, callback: Deferred) -> CallbackId {
    let id = CallbackId(self.next_id);
    self.next_id += 1;
    self.entries.push_back((id, callback));
    id
  }

  /// Removes a callback that has not run yet.
  pub fn remove(&mut self, id: CallbackId) -> bool {
    match self.entries.iter().position(|(queued, _)| *queued == id) {
      Some(index) => {
        self.entries.remove(index);
        true
      }
      None => false,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// The id of the most recently queued entry; the end of the snapshot a
  /// pass starting now is allowed to run.
  pub fn snapshot_end(&self) -> Option<CallbackId> {
    self.entries.back().map(|(id, _)| *id)
  }

  /// Pops the front entry if it belongs to the snapshot ending at `end`.
  ///
  /// Ids only grow, so everything queued after the snapshot was taken has
  /// a larger id.
  pub fn pop_through(&mut self, end: CallbackId) -> Option<Deferred> {
    match self.entries.front() {
      Some((id, _)) if *id <= end => {
        self.entries.pop_front().map(|(_, callback)| callback)
      }
      _ => None,
    }
  }
}

impl fmt::Debug for CallbackQueue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CallbackQueue")
      .field("next_id", &self.next_id)
      .field("queued", &self.entries.len())
      .finish()
  }
}
