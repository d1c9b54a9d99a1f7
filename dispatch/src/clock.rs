
use std::sync::atomic::{AtomicU64, Ordering, };
use std::time::{Duration, Instant, };

/// Elapsed time since some fixed point. The dispatcher's completion wait
/// measures its timeout with one of these.
pub trait Clock: Send + Sync {
  fn now(&self) -> Duration;
}

/// Wall clock time.
#[derive(Clone, Copy, Debug)]
pub struct SystemClock {
  epoch: Instant,
}
impl SystemClock {
  pub fn new() -> Self {
    SystemClock {
      epoch: Instant::now(),
    }
  }
}
impl Default for SystemClock {
  fn default() -> Self { SystemClock::new() }
}
impl Clock for SystemClock {
  fn now(&self) -> Duration {
    self.epoch.elapsed()
  }
}

/// Advances by `step` every time it is read, regardless of how much time
/// really passed. A dispatch against a device that never completes times
/// out after `timeout / step` polls.
#[derive(Debug)]
pub struct SteppingClock {
  nanos: AtomicU64,
  step: u64,
}
impl SteppingClock {
  pub fn new(step: Duration) -> Self {
    SteppingClock {
      nanos: AtomicU64::new(0),
      step: step.as_nanos() as u64,
    }
  }
  pub fn reads(&self) -> u64 {
    match self.step {
      0 => 0,
      step => self.nanos.load(Ordering::Relaxed) / step,
    }
  }
}
impl Clock for SteppingClock {
  fn now(&self) -> Duration {
    let prev = self.nanos.fetch_add(self.step, Ordering::Relaxed);
    Duration::from_nanos(prev)
  }
}
