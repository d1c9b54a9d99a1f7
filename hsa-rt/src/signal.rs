
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, };
use std::thread;
use std::time::{Duration, Instant, };

use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex, RwLock, };
use serde::{Deserialize, Serialize, };

use crate::ApiContext;
use crate::agent::Agent;
use crate::error::Error;

pub use std::sync::atomic::Ordering;

pub type Value = i64;

/// The value packets and queues carry in place of a signal.
#[derive(Clone, Copy, Default, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, Deserialize)]
#[repr(transparent)]
pub struct SignalHandle(pub(crate) u64);
impl SignalHandle {
  pub const fn null() -> Self { SignalHandle(0) }
  pub fn is_null(self) -> bool { self.0 == 0 }
}

/// Shared state of one signal. Waiters block on `cond` while holding
/// `lock`; every modification notifies under the same lock.
pub struct SignalCell {
  value: AtomicI64,
  lock: Mutex<()>,
  cond: Condvar,
}
impl SignalCell {
  fn new(initial: Value) -> Self {
    SignalCell {
      value: AtomicI64::new(initial),
      lock: Mutex::new(()),
      cond: Condvar::new(),
    }
  }
  #[inline(always)]
  fn notify(&self) {
    let _guard = self.lock.lock();
    self.cond.notify_all();
  }

  pub(crate) fn load(&self, order: Ordering) -> Value {
    self.value.load(order)
  }
  pub(crate) fn store(&self, val: Value, order: Ordering) {
    self.value.store(val, order);
    self.notify();
  }
  pub(crate) fn subtract(&self, val: Value, order: Ordering) {
    self.value.fetch_sub(val, order);
    self.notify();
  }

  fn wait(&self, condition: ConditionOrdering, compare: Value,
          timeout: Option<Duration>, state: WaitState, order: Ordering)
    -> Value
  {
    let order = match order {
      Ordering::Relaxed => Ordering::Relaxed,
      _ => Ordering::Acquire,
    };
    let deadline = timeout
      .and_then(|timeout| Instant::now().checked_add(timeout) );

    match state {
      WaitState::Active => {
        let backoff = Backoff::new();
        loop {
          let v = self.value.load(order);
          if condition.satisfied(v, compare) {
            return v;
          }
          if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
              return v;
            }
          }
          if backoff.is_completed() {
            thread::yield_now();
          } else {
            backoff.snooze();
          }
        }
      },
      WaitState::Blocked => {
        let mut guard = self.lock.lock();
        loop {
          let v = self.value.load(order);
          if condition.satisfied(v, compare) {
            return v;
          }
          match deadline {
            Some(deadline) => {
              if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return self.value.load(order);
              }
            },
            None => {
              self.cond.wait(&mut guard);
            },
          }
        }
      },
    }
  }
}

#[derive(Default)]
pub(crate) struct SignalTable {
  cells: RwLock<HashMap<u64, Arc<SignalCell>>>,
  next: AtomicU64,
}
impl SignalTable {
  fn insert(&self, initial: Value) -> (SignalHandle, Arc<SignalCell>) {
    let handle = self.next.fetch_add(1, Ordering::Relaxed) + 1;
    let cell = Arc::new(SignalCell::new(initial));
    self.cells.write().insert(handle, cell.clone());
    (SignalHandle(handle), cell)
  }
  fn remove(&self, handle: SignalHandle) {
    self.cells.write().remove(&handle.0);
  }
  pub(crate) fn get(&self, handle: SignalHandle) -> Option<Arc<SignalCell>> {
    self.cells.read().get(&handle.0).cloned()
  }
  pub(crate) fn len(&self) -> usize {
    self.cells.read().len()
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ConditionOrdering {
  Equal,
  NotEqual,
  Less,
  GreaterEqual,
}
impl ConditionOrdering {
  pub fn satisfied(self, value: Value, compare: Value) -> bool {
    match self {
      ConditionOrdering::Equal => value == compare,
      ConditionOrdering::NotEqual => value != compare,
      ConditionOrdering::Less => value < compare,
      ConditionOrdering::GreaterEqual => value >= compare,
    }
  }
}
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum WaitState {
  Blocked,
  Active,
}

pub struct Signal {
  ctx: ApiContext,
  handle: SignalHandle,
  cell: Arc<SignalCell>,
}

impl Signal {
  /// `consumers` must belong to `ctx`; an empty list means any agent
  /// may consume the signal.
  pub fn new(ctx: &ApiContext, initial: Value, consumers: &[Agent])
    -> Result<Self, Error>
  {
    let foreign = consumers.iter()
      .any(|agent| !agent.ctx().same_runtime(ctx) );
    Error::IncompatibleArguments.check(!foreign)?;
    if ctx.0.faults.take_signal_create() {
      return Err(Error::OutOfResources);
    }
    Ok(Self::create(ctx, initial))
  }
  /// Queue doorbells are created here, outside of fault injection.
  pub(crate) fn create(ctx: &ApiContext, initial: Value) -> Self {
    let (handle, cell) = ctx.0.signals.insert(initial);
    log::trace!("created signal {:?} = {}", handle, initial);
    Signal {
      ctx: ctx.clone(),
      handle,
      cell,
    }
  }
  pub fn new_global(ctx: &ApiContext, initial: Value) -> Result<Self, Error> {
    Self::new(ctx, initial, &[])
  }

  #[inline(always)]
  pub fn as_ref(&self) -> SignalRef {
    SignalRef {
      handle: self.handle,
      cell: &self.cell,
    }
  }
}

impl fmt::Debug for Signal {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Signal")
      .field("handle", &self.handle.0)
      .field("value", &self.cell.load(Ordering::Relaxed))
      .finish()
  }
}

#[derive(Copy, Clone)]
pub struct SignalRef<'a> {
  handle: SignalHandle,
  cell: &'a SignalCell,
}
impl<'a> fmt::Debug for SignalRef<'a> {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "SignalRef({})", self.handle.0)
  }
}

pub trait SignalHsaHandle {
  fn as_hndl(&self) -> SignalHandle;
  #[doc(hidden)]
  fn cell(&self) -> &SignalCell;
}
impl SignalHsaHandle for Signal {
  #[inline(always)]
  fn as_hndl(&self) -> SignalHandle { self.handle }
  #[inline(always)]
  fn cell(&self) -> &SignalCell { &self.cell }
}
impl<'a> SignalHsaHandle for SignalRef<'a> {
  #[inline(always)]
  fn as_hndl(&self) -> SignalHandle { self.handle }
  #[inline(always)]
  fn cell(&self) -> &SignalCell { self.cell }
}

macro_rules! impl_l {
  ($($f:ident, $ordering:ident,)*) => (
    pub trait SignalLoad: SignalHsaHandle {
      $(
      #[inline(always)]
      fn $f(&self) -> Value {
        self.cell().load(Ordering::$ordering)
      }
      )*
      #[inline(always)]
      fn load(&self, ordering: Ordering) -> Value {
        match ordering {
          $(Ordering::$ordering => self.$f(),)*
          _ => self.load_scacquire(),
        }
      }
    }
    impl<'a> SignalLoad for SignalRef<'a> { }
    impl SignalLoad for Signal { }
  )
}
impl_l!(
  load_scacquire, Acquire,
  load_relaxed, Relaxed,
);

macro_rules! impl_s {
  ($($f:ident, $ordering:ident,)*) => (
    pub trait SignalStore: SignalHsaHandle {
      $(
      #[inline(always)]
      fn $f(&self, val: Value) {
        self.cell().store(val, Ordering::$ordering)
      }
      )*
      #[inline(always)]
      fn store(&self, val: Value, ordering: Ordering) {
        match ordering {
          $(Ordering::$ordering => self.$f(val),)*
          _ => self.store_screlease(val),
        }
      }
    }
    impl<'a> SignalStore for SignalRef<'a> { }
    impl SignalStore for Signal { }
  )
}
impl_s!(
  store_relaxed, Relaxed,
  store_screlease, Release,
);

macro_rules! impl_exchange {
  ($($f:ident, $ordering:ident,)*) => (
    pub trait SignalExchange: SignalHsaHandle {
      $(
      #[inline(always)]
      fn $f(&self, val: Value) -> Value {
        let cell = self.cell();
        let old = cell.value.swap(val, Ordering::$ordering);
        cell.notify();
        old
      }
      )*
      #[inline(always)]
      fn exchange(&self, val: Value, ordering: Ordering) -> Value {
        match ordering {
          $(Ordering::$ordering => self.$f(val),)*
          _ => self.exchange_scacq_screl(val),
        }
      }
    }
    impl<'a> SignalExchange for SignalRef<'a> { }
    impl SignalExchange for Signal { }
  )
}
impl_exchange!(
  exchange_scacq_screl, AcqRel,
  exchange_scacquire, Acquire,
  exchange_relaxed, Relaxed,
  exchange_screlease, Release,
);

macro_rules! impl_binop {
  ($($f:ident, $op:ident, $ordering:ident,)*) => (
    pub trait SignalBinops: SignalHsaHandle {
      $(
      #[inline(always)]
      fn $f(&self, val: Value) {
        let cell = self.cell();
        cell.value.$op(val, Ordering::$ordering);
        cell.notify();
      }
      )*
    }
    impl<'a> SignalBinops for SignalRef<'a> { }
    impl SignalBinops for Signal { }
  )
}
impl_binop!(
  add_scacq_screl, fetch_add, AcqRel,
  add_scacquire, fetch_add, Acquire,
  add_relaxed, fetch_add, Relaxed,
  add_screlease, fetch_add, Release,

  subtract_scacq_screl, fetch_sub, AcqRel,
  subtract_scacquire, fetch_sub, Acquire,
  subtract_relaxed, fetch_sub, Relaxed,
  subtract_screlease, fetch_sub, Release,

  and_scacq_screl, fetch_and, AcqRel,
  and_relaxed, fetch_and, Relaxed,

  or_scacq_screl, fetch_or, AcqRel,
  or_relaxed, fetch_or, Relaxed,
);

pub trait SignalHostWait: SignalHsaHandle {
  /// Like `wait_relaxed`, but executes an acquire fence after the
  /// provided condition is satisfied.
  ///
  /// As with the hardware runtime, the return may be spurious: callers
  /// must check the returned value against their condition.
  #[inline(always)]
  fn wait_scacquire(&self, condition: ConditionOrdering,
                    compare: Value, timeout_hint: Option<Duration>,
                    wait_state_hint: WaitState) -> Value {
    self.cell().wait(condition, compare, timeout_hint, wait_state_hint,
                     Ordering::Acquire)
  }
  #[inline(always)]
  fn wait_relaxed(&self, condition: ConditionOrdering,
                  compare: Value, timeout_hint: Option<Duration>,
                  wait_state_hint: WaitState) -> Value {
    self.cell().wait(condition, compare, timeout_hint, wait_state_hint,
                     Ordering::Relaxed)
  }

  #[inline(always)]
  fn wait(&self, condition: ConditionOrdering,
          compare: Value, timeout_hint: Option<Duration>,
          wait_state_hint: WaitState, ordering: Ordering) -> Value
  {
    match ordering {
      Ordering::Relaxed => self.wait_relaxed(condition, compare,
                                             timeout_hint, wait_state_hint),
      _ => self.wait_scacquire(condition, compare, timeout_hint, wait_state_hint),
    }
  }
}
impl<'a> SignalHostWait for SignalRef<'a> { }
impl SignalHostWait for Signal { }

impl Drop for Signal {
  fn drop(&mut self) {
    log::trace!("destroying signal {:?}", self.handle);
    self.ctx.0.signals.remove(self.handle);
  }
}
