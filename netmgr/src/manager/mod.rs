//! The event-multiplexing core.
//!
//! A [`NetManager`] owns one readiness backend, the table of registered
//! descriptors, the deferred callback queue and the alarm queue. The
//! embedding application calls [`NetManager::process`] once per iteration
//! of its own main loop; every callback in the crate runs from inside that
//! call, on that thread.
//!
//! At most one manager exists per thread, between [`NetManager::try_init`]
//! and [`NetManager::uninit`].

pub(crate) mod alarm;
pub(crate) mod callback;
mod interest;
pub(crate) mod poll;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::mem;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

pub use alarm::AlarmId;
pub use callback::CallbackId;
pub use interest::Interest;
pub use poll::{Backend, Event, ReadinessPoll, Waker};

use alarm::AlarmQueue;
use callback::CallbackQueue;
use poll::RawSock;

use crate::descriptor::{self, NetDescriptor};
use crate::errors::TryInitError;
use crate::resolve::background::Lookups;

/// Upper bound for a single backend wait. `process` returns after one
/// capped wait and writes the unspent budget back to the caller.
const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

thread_local! {
  static ACTIVE: Cell<bool> = const { Cell::new(false) };
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NetManagerConfig {
  pub backend: Backend,
  /// Native event buffer size for backends that need one.
  pub event_capacity: usize,
}

impl Default for NetManagerConfig {
  fn default() -> Self {
    Self { backend: Backend::default(), event_capacity: 256 }
  }
}

/// Handle to the thread's network manager. Clones share the same manager.
#[derive(Clone)]
pub struct NetManager {
  shared: Rc<Shared>,
}

pub(crate) struct Shared {
  config: NetManagerConfig,
  poller: RefCell<Box<dyn ReadinessPoll>>,
  waker: Waker,
  descriptors: RefCell<HashMap<u64, Weak<descriptor::Inner>>>,
  next_key: Cell<u64>,
  callbacks: RefCell<CallbackQueue>,
  alarms: RefCell<AlarmQueue>,
  lookups: Lookups,
  events: RefCell<Vec<Event>>,
  live: Cell<bool>,
}

impl NetManager {
  /// Initialises the manager with the default configuration.
  ///
  /// # Panics
  /// If a manager is already active on this thread or the backend can't be
  /// created.
  pub fn init() -> Self {
    Self::try_init(NetManagerConfig::default())
      .unwrap_or_else(|err| panic!("NetManager::init failed: {err}"))
  }

  pub fn try_init(config: NetManagerConfig) -> Result<Self, TryInitError> {
    if ACTIVE.with(Cell::get) {
      return Err(TryInitError::AlreadyInit);
    }

    let poller = poll::new_poller(config.backend, config.event_capacity)?;
    let waker = poller.waker();

    log::debug!("net manager up, backend {:?}", config.backend);
    ACTIVE.with(|active| active.set(true));

    Ok(Self {
      shared: Rc::new(Shared {
        config,
        poller: RefCell::new(poller),
        waker,
        descriptors: RefCell::new(HashMap::new()),
        next_key: Cell::new(0),
        callbacks: RefCell::new(CallbackQueue::new()),
        alarms: RefCell::new(AlarmQueue::new()),
        lookups: Lookups::new(),
        events: RefCell::new(Vec::new()),
        live: Cell::new(true),
      }),
    })
  }

  /// Tears the manager down.
  ///
  /// Pending deferred callbacks, alarms and lookups are dropped unrun.
  ///
  /// # Panics
  /// If any descriptor is still registered.
  pub fn uninit(self) {
    let open = self.descriptor_count();
    assert!(
      open == 0,
      "NetManager::uninit called with {open} descriptor(s) still registered"
    );
    self.shared.shut_down();
  }

  pub fn config(&self) -> &NetManagerConfig {
    &self.shared.config
  }

  /// Number of registered (open) descriptors.
  pub fn descriptor_count(&self) -> usize {
    self.shared.descriptors.borrow().len()
  }

  /// Wakes a blocked [`process`](Self::process) from any thread.
  pub fn waker(&self) -> Waker {
    self.shared.waker.clone()
  }

  /// Waits up to `*timeout` for readiness and runs everything that is due.
  ///
  /// In order: readiness callbacks (exception, write, read, then hangup
  /// per descriptor), finished background lookups, due alarms, then one
  /// pass of deferred callbacks. The wait is shortened to the next alarm
  /// and skipped entirely while deferred callbacks are queued.
  ///
  /// On return `*timeout` holds what is left of it. An interrupted wait is
  /// retried transparently.
  ///
  /// Callbacks may call back into the manager, including `process` itself.
  /// Reentering `process` can run a descriptor's callback twice for one
  /// readiness event; nothing guards against that.
  pub fn process(&self, timeout: &mut Duration) -> io::Result<()> {
    let start = Instant::now();
    let budget = *timeout;

    let mut wait = budget;
    if self.has_deferred() {
      wait = Duration::ZERO;
    }
    if let Some(next) = self.time_before_next_alarm() {
      wait = wait.min(next);
    }
    let wait = wait.min(MAX_WAIT);

    let mut events = mem::take(&mut *self.shared.events.borrow_mut());
    events.clear();

    if let Err(err) = self.wait_retrying(&mut events, wait) {
      *timeout = budget.saturating_sub(start.elapsed());
      return Err(err);
    }

    for event in &events {
      self.dispatch(event);
    }
    events.clear();
    *self.shared.events.borrow_mut() = events;

    self.shared.lookups.deliver();
    self.fire_alarms();
    self.run_deferred();

    *timeout = budget.saturating_sub(start.elapsed());
    Ok(())
  }

  fn wait_retrying(
    &self,
    events: &mut Vec<Event>,
    wait: Duration,
  ) -> io::Result<()> {
    let started = Instant::now();
    loop {
      let remaining = wait.saturating_sub(started.elapsed());
      let res = self.shared.poller.borrow_mut().wait(events, Some(remaining));
      match res {
        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
        other => return other,
      }
    }
  }

  fn dispatch(&self, event: &Event) {
    let inner = self
      .shared
      .descriptors
      .borrow()
      .get(&event.key)
      .and_then(Weak::upgrade);

    // Closed by an earlier callback in this pass.
    let Some(inner) = inner else { return };
    NetDescriptor::from_inner(inner).dispatch(event.ready);
  }

  /// Queues `callback` to run on the next processing pass.
  pub fn defer(&self, callback: impl FnOnce() + 'static) -> CallbackId {
    self.shared.callbacks.borrow_mut().push(Box::new(callback))
  }

  /// Removes a deferred callback that hasn't run yet. Returns whether
  /// anything was removed.
  pub fn cancel_deferred(&self, id: CallbackId) -> bool {
    self.shared.callbacks.borrow_mut().remove(id)
  }

  pub fn has_deferred(&self) -> bool {
    !self.shared.callbacks.borrow().is_empty()
  }

  fn run_deferred(&self) {
    let Some(end) = self.shared.callbacks.borrow().snapshot_end() else {
      return;
    };
    loop {
      let next = self.shared.callbacks.borrow_mut().pop_through(end);
      match next {
        Some(callback) => callback(),
        None => break,
      }
    }
  }

  /// Schedules a one-shot `callback` after `delay`.
  pub fn add_alarm(
    &self,
    delay: Duration,
    callback: impl FnOnce() + 'static,
  ) -> AlarmId {
    let deadline = Instant::now() + delay;
    self.shared.alarms.borrow_mut().add(deadline, Box::new(callback))
  }

  /// Cancels an alarm. Returns whether it was still pending.
  pub fn remove_alarm(&self, id: AlarmId) -> bool {
    self.shared.alarms.borrow_mut().remove(id)
  }

  pub fn time_before_next_alarm(&self) -> Option<Duration> {
    self.shared.alarms.borrow().time_before_next(Instant::now())
  }

  pub fn alarm_count(&self) -> usize {
    self.shared.alarms.borrow().len()
  }

  fn fire_alarms(&self) {
    let now = Instant::now();
    let watermark = self.shared.alarms.borrow().watermark();
    loop {
      let next = self.shared.alarms.borrow_mut().pop_due(now, watermark);
      match next {
        Some(callback) => callback(),
        None => break,
      }
    }
  }

  /// False once the manager has been torn down.
  pub(crate) fn is_live(&self) -> bool {
    self.shared.live.get()
  }

  pub(crate) fn lookups(&self) -> &Lookups {
    &self.shared.lookups
  }

  pub(crate) fn next_key(&self) -> u64 {
    let key = self.shared.next_key.get();
    self.shared.next_key.set(key + 1);
    key
  }

  /// Registers a descriptor with no interest.
  pub(crate) fn add_desc(
    &self,
    sock: RawSock,
    key: u64,
    desc: Weak<descriptor::Inner>,
  ) -> io::Result<()> {
    assert!(
      self.shared.live.get(),
      "descriptor registered with a net manager that was shut down"
    );
    self.shared.poller.borrow_mut().add(sock, key, Interest::NONE)?;
    self.shared.descriptors.borrow_mut().insert(key, desc);
    Ok(())
  }

  pub(crate) fn remove_desc(&self, sock: RawSock, key: u64) {
    self.shared.descriptors.borrow_mut().remove(&key);
    if let Err(err) = self.shared.poller.borrow_mut().delete(sock) {
      log::error!("removing socket from the wait set failed: {err}");
    }
  }

  pub(crate) fn set_interest(
    &self,
    sock: RawSock,
    key: u64,
    interest: Interest,
  ) -> io::Result<()> {
    self.shared.poller.borrow_mut().modify(sock, key, interest)
  }

  #[cfg(test)]
  pub(crate) fn ptr_eq(&self, other: &NetManager) -> bool {
    Rc::ptr_eq(&self.shared, &other.shared)
  }
}

impl Shared {
  fn shut_down(&self) {
    if !self.live.replace(false) {
      return;
    }
    ACTIVE.with(|active| active.set(false));

    // Move everything out before dropping: the closures may own handles
    // whose drop touches the manager again.
    let callbacks =
      mem::replace(&mut *self.callbacks.borrow_mut(), CallbackQueue::new());
    let alarms =
      mem::replace(&mut *self.alarms.borrow_mut(), AlarmQueue::new());
    drop(callbacks);
    drop(alarms);
    self.lookups.clear();
    log::debug!("net manager down");
  }
}

impl Drop for Shared {
  fn drop(&mut self) {
    self.shut_down();
  }
}

impl fmt::Debug for NetManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("NetManager")
      .field("backend", &self.shared.config.backend)
      .field("descriptors", &self.descriptor_count())
      .field("deferred", &self.shared.callbacks.borrow().len())
      .field("alarms", &self.alarm_count())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::rc::Rc;

  fn manager() -> NetManager {
    NetManager::try_init(NetManagerConfig::default()).unwrap()
  }

  #[test]
  fn second_init_on_same_thread_fails() {
    let first = manager();
    assert!(matches!(
      NetManager::try_init(NetManagerConfig::default()),
      Err(TryInitError::AlreadyInit)
    ));
    first.uninit();

    let again = manager();
    again.uninit();
  }

  #[test]
  fn dropping_last_handle_releases_the_thread() {
    drop(manager());
    manager().uninit();
  }

  #[test]
  fn idle_process_with_zero_timeout() {
    let mgr = manager();
    let mut timeout = Duration::ZERO;
    mgr.process(&mut timeout).unwrap();
    assert_eq!(timeout, Duration::ZERO);
    mgr.uninit();
  }

  #[test]
  fn process_reports_remaining_time() {
    let mgr = manager();
    let mut timeout = Duration::from_millis(30);
    mgr.process(&mut timeout).unwrap();
    assert!(timeout < Duration::from_millis(15), "left: {timeout:?}");
    mgr.uninit();
  }

  #[test]
  fn deferred_runs_on_next_pass_only() {
    let mgr = manager();
    let log = Rc::new(RefCell::new(Vec::new()));

    let (mgr2, log2) = (mgr.clone(), log.clone());
    mgr.defer(move || {
      log2.borrow_mut().push("first");
      let log3 = log2.clone();
      mgr2.defer(move || log3.borrow_mut().push("second"));
    });

    let mut timeout = Duration::from_secs(5);
    let start = Instant::now();
    mgr.process(&mut timeout).unwrap();
    assert!(start.elapsed() < Duration::from_secs(1), "must not block");
    assert_eq!(*log.borrow(), vec!["first"]);

    let mut timeout = Duration::ZERO;
    mgr.process(&mut timeout).unwrap();
    assert_eq!(*log.borrow(), vec!["first", "second"]);
    mgr.uninit();
  }

  #[test]
  fn cancelled_deferred_never_runs() {
    let mgr = manager();
    let ran = Rc::new(Cell::new(false));
    let ran2 = ran.clone();
    let id = mgr.defer(move || ran2.set(true));
    assert!(mgr.cancel_deferred(id));
    assert!(!mgr.has_deferred());

    let mut timeout = Duration::ZERO;
    mgr.process(&mut timeout).unwrap();
    assert!(!ran.get());
    mgr.uninit();
  }

  #[test]
  fn alarm_bounds_the_wait() {
    let mgr = manager();
    let fired = Rc::new(Cell::new(false));
    let fired2 = fired.clone();
    mgr.add_alarm(Duration::from_millis(20), move || fired2.set(true));

    let start = Instant::now();
    let mut timeout = Duration::from_secs(5);
    while !fired.get() && start.elapsed() < Duration::from_secs(2) {
      mgr.process(&mut timeout).unwrap();
    }
    assert!(fired.get());
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(mgr.alarm_count(), 0);
    mgr.uninit();
  }

  #[test]
  fn removed_alarm_does_not_fire() {
    let mgr = manager();
    let fired = Rc::new(Cell::new(false));
    let fired2 = fired.clone();
    let id = mgr.add_alarm(Duration::ZERO, move || fired2.set(true));
    assert!(mgr.remove_alarm(id));
    assert!(!mgr.remove_alarm(id));
    assert_eq!(mgr.time_before_next_alarm(), None);

    let mut timeout = Duration::ZERO;
    mgr.process(&mut timeout).unwrap();
    assert!(!fired.get());
    mgr.uninit();
  }

  #[test]
  fn waker_interrupts_long_wait() {
    let mgr = manager();
    let waker = mgr.waker();
    let handle = std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(30));
      waker.wake().unwrap();
    });

    let start = Instant::now();
    let mut timeout = Duration::from_secs(10);
    mgr.process(&mut timeout).unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
    handle.join().unwrap();
    mgr.uninit();
  }

  #[test]
  fn clones_share_one_manager() {
    let mgr = manager();
    let clone = mgr.clone();
    assert!(mgr.ptr_eq(&clone));
    drop(clone);
    mgr.uninit();
  }
}
