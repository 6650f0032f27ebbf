//! One-shot relative alarms.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Handle to a scheduled alarm.
///
/// Orders by deadline first, so a `BTreeMap` keyed by it is also the firing
/// order. Alarms sharing a deadline fire in the order they were added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AlarmId {
  deadline: Instant,
  seq: u64,
}

impl AlarmId {
  pub fn deadline(&self) -> Instant {
    self.deadline
  }
}

pub(crate) type AlarmCallback = Box<dyn FnOnce()>;

pub(crate) struct AlarmQueue {
  next_seq: u64,
  alarms: BTreeMap<AlarmId, AlarmCallback>,
}

impl AlarmQueue {
  pub fn new() -> Self {
    Self { next_seq: 0, alarms: BTreeMap::new() }
  }

  pub fn add(&mut self, deadline: Instant, callback: AlarmCallback) -> AlarmId {
    let id = AlarmId { deadline, seq: self.next_seq };
    self.next_seq += 1;
    self.alarms.insert(id, callback);
    id
  }

  pub fn remove(&mut self, id: AlarmId) -> bool {
    self.alarms.remove(&id).is_some()
  }

  pub fn len(&self) -> usize {
    self.alarms.len()
  }

  pub fn next_deadline(&self) -> Option<Instant> {
    self.alarms.keys().next().map(AlarmId::deadline)
  }

  /// Time from `now` until the next alarm is due; zero if one is overdue.
  pub fn time_before_next(&self, now: Instant) -> Option<Duration> {
    self
      .next_deadline()
      .map(|deadline| deadline.saturating_duration_since(now))
  }

  /// First sequence number not yet handed out. Alarms added from now on
  /// compare greater or equal.
  pub fn watermark(&self) -> u64 {
    self.next_seq
  }

  /// Removes and returns the earliest alarm due at `now` that was added
  /// before `watermark`.
  pub fn pop_due(
    &mut self,
    now: Instant,
    watermark: u64,
  ) -> Option<AlarmCallback> {
    let id = self
      .alarms
      .keys()
      .take_while(|id| id.deadline <= now)
      .find(|id| id.seq < watermark)
      .copied()?;
    self.alarms.remove(&id)
  }
}
